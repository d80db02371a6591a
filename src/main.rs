/// IntentFlow server entry point
///
/// Loads configuration from the environment and starts the HTTP server with
/// workflow management, run control, webhooks and the cron scheduler.
use intentflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Run control at /api/runs/* and /api/approvals/*
/// - Schedules at /api/schedules/*
/// - Webhook triggers and deliveries at /webhook/{webhook_id}
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
