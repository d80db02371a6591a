/// Configuration management for the IntentFlow engine
///
/// Handles server binding, database location, engine limits, the scheduler
/// ticks and capability endpoints. Every field has an ENV_VAR override so the
/// binary runs unchanged in containers.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SECRET_PREFIX: &str = "INTENTFLOW_SECRET_";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution limits
    pub engine: EngineConfig,
    /// Cron schedules and timer sweeping
    pub scheduler: SchedulerConfig,
    /// LLM capability used by agent and guardrails nodes
    pub llm: LlmConfig,
    /// MCP tool-call capability
    pub mcp: McpConfig,
    /// Knowledge search capability used by retriever nodes
    pub retrieval: RetrievalConfig,
    /// Named secrets for `{VAR}` substitution (from `INTENTFLOW_SECRET_<NAME>`)
    #[serde(default, skip_serializing)]
    pub secrets: HashMap<String, String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Durable storage for workflows, checkpoints, suspensions and schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (e.g. "sqlite://data/intentflow.db" or "sqlite::memory:")
    pub url: String,
}

/// Limits enforced by the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default per-node cap on `while` iterations within one run
    pub max_loop_iterations: u32,
    /// Cap on executed node steps within one run
    pub max_steps: u32,
    /// Capacity of the run event broadcast channel
    pub event_buffer: usize,
    /// Default request timeout for http nodes
    pub http_timeout_secs: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the background ticks are started at all
    pub enabled: bool,
    /// Cron expression (seconds-first) for the schedule scan
    pub tick: String,
    /// Cron expression (seconds-first) for the timer / timeout sweep
    pub timer_sweep: String,
}

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    /// No key means the LLM capability is not registered
    pub api_key: Option<String>,
    pub default_model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Default timeout for a full MCP session (connect, list, call)
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Search endpoint of the knowledge service; unset disables retriever nodes
    pub endpoint: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secrets_from_env() -> HashMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(SECRET_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value))
        })
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 1_000,
            max_steps: 10_000,
            event_buffer: 1_024,
            http_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let engine_defaults = EngineConfig::default();
        Self {
            server: ServerConfig {
                host: env_or("INTENTFLOW_HOST", "0.0.0.0"),
                port: env_parse("INTENTFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("INTENTFLOW_DATABASE_URL", "sqlite://data/intentflow.db"),
            },
            engine: EngineConfig {
                max_loop_iterations: env_parse(
                    "INTENTFLOW_MAX_LOOP_ITERATIONS",
                    engine_defaults.max_loop_iterations,
                ),
                max_steps: env_parse("INTENTFLOW_MAX_STEPS", engine_defaults.max_steps),
                event_buffer: env_parse("INTENTFLOW_EVENT_BUFFER", engine_defaults.event_buffer),
                http_timeout_secs: env_parse(
                    "INTENTFLOW_HTTP_TIMEOUT_SECS",
                    engine_defaults.http_timeout_secs,
                ),
            },
            scheduler: SchedulerConfig {
                enabled: env_parse("INTENTFLOW_SCHEDULER_ENABLED", true),
                tick: env_or("INTENTFLOW_SCHEDULER_TICK", "0 * * * * *"),
                timer_sweep: env_or("INTENTFLOW_TIMER_SWEEP", "*/5 * * * * *"),
            },
            llm: LlmConfig {
                base_url: env_or("INTENTFLOW_LLM_BASE_URL", "https://api.openai.com/v1"),
                api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
                default_model: env_or("INTENTFLOW_LLM_MODEL", "gpt-4o-mini"),
                timeout_secs: env_parse("INTENTFLOW_LLM_TIMEOUT_SECS", 60),
            },
            mcp: McpConfig {
                timeout_secs: env_parse("INTENTFLOW_MCP_TIMEOUT_SECS", 30),
            },
            retrieval: RetrievalConfig {
                endpoint: std::env::var("INTENTFLOW_RETRIEVAL_URL").ok().filter(|u| !u.is_empty()),
            },
            secrets: secrets_from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_match_documented_limits() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_loop_iterations, 1_000);
        assert_eq!(engine.max_steps, 10_000);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.scheduler.tick, config.scheduler.tick);
        assert!(back.secrets.is_empty());
    }
}
