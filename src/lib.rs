/// IntentFlow: durable workflow orchestration engine
///
/// Runs graphs of typed nodes (agents, branches, loops, tool calls, approvals,
/// guardrails, retrieval, HTTP calls) to completion, checkpointing every step
/// so a run can park on a webhook, approval or timer and resume where it left
/// off, even across restarts.

// Core configuration and setup
pub mod config;

// Typed engine errors
pub mod error;

// Workflow management layer - definitions, graph validation, storage, registry
pub mod workflow;

// Durable state - checkpoints, suspensions, schedules
pub mod persistence;

// Runtime execution engine - run/resume orchestration and scheduler
pub mod runtime;

// External services node executors depend on (LLM, MCP, vector search)
pub mod capabilities;

// Built-in node executors
pub mod nodes;

// HTTP API layer - REST endpoints for workflows, runs, schedules and webhooks
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{ExecutionEngine, ResumeEvent, RunEvent, RunResult, RunStatus};
pub use server::start_server;
pub use workflow::{Edge, Node, NodeType, Workflow};
