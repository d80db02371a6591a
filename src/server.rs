/// Server setup and initialization
///
/// Wires together all components: database, workflow registry, execution
/// engine, capabilities, scheduler and HTTP routes.
use crate::{
    api::{create_api_routes, AppState},
    capabilities::Capabilities,
    config::Config,
    persistence::{database, ScheduleStore, SqliteCheckpointStore, SqliteSuspensionRegistry},
    runtime::{
        engine::ExecutionEngine,
        scheduler::{CronSchedulerService, ScheduleDispatcher},
    },
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Fully wired application, before it is bound to a socket
pub struct Application {
    pub state: AppState,
    pub scheduler: Arc<CronSchedulerService>,
}

/// Build every component from configuration
///
/// Threads that were mid-resume when the process died are re-parked so the
/// next delivery or timer sweep can pick them up.
pub async fn build_application(config: &Config) -> Result<Application> {
    tracing::info!("🗄️ Connecting to database");
    let pool = database::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", config.database.url, e))?;

    let workflow_storage = WorkflowStorage::new(pool.clone());

    tracing::info!("📊 Initializing workflow registry");
    let workflow_registry = Arc::new(WorkflowRegistry::new(workflow_storage.clone()));
    tracing::info!("📥 Loading existing workflows from storage");
    workflow_registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;
    for (webhook_id, workflow_id) in workflow_registry.get_webhook_routes() {
        tracing::info!("🪝 Webhook /webhook/{} -> workflow {}", webhook_id, workflow_id);
    }

    let suspensions = SqliteSuspensionRegistry::new(pool.clone());
    let recovered = suspensions.recover_claims().await?;
    if recovered > 0 {
        tracing::warn!("♻️ Re-parked {} thread(s) left mid-resume", recovered);
    }

    tracing::info!("🔌 Initializing capabilities");
    let capabilities = Capabilities::from_config(config)?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(
        ExecutionEngine::new(
            Arc::clone(&workflow_registry),
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(suspensions),
            &config.engine,
        )
        .with_capabilities(capabilities),
    );

    let schedules = ScheduleStore::new(pool);

    tracing::info!("⏰ Initializing cron scheduler service");
    let dispatcher = Arc::new(ScheduleDispatcher::new(schedules.clone(), Arc::clone(&engine)));
    let scheduler = Arc::new(
        CronSchedulerService::new(dispatcher, config.scheduler.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );

    Ok(Application {
        state: AppState {
            storage: workflow_storage,
            registry: workflow_registry,
            engine,
            schedules,
        },
        scheduler,
    })
}

/// Create the Axum router over an already-built state
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting IntentFlow server...");

    let application = build_application(&config).await?;
    application.scheduler.start().await?;

    let app = create_app(application.state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    application.scheduler.stop().await?;
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
