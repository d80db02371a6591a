/// Runtime Execution Engine
///
/// Runs compiled workflows one node at a time against a checkpointed
/// `RunState`. It handles:
/// - Template resolution of node config against run state
/// - Dispatch to node executors and routing along edges
/// - Suspension, resume, cancellation and timers
/// - Background cron schedules that start new runs

// Per-run state and node results
pub mod state;

// `{{path}}` template resolution
pub mod resolver;

// Sandboxed Lua expressions for conditions and transforms
pub mod expression;

// Run events out, resume events in
pub mod events;

// Executor trait and type-tag registry
pub mod executor;

// Run / resume / cancel orchestration
pub mod engine;

// Background cron scheduler service and timer sweep
pub mod scheduler;

// Re-export main types
pub use engine::{ExecutionEngine, RunResult};
pub use events::{ApprovalDecision, ResumeEvent, RunEvent};
pub use executor::{ExecResult, ExecutorRegistry, NodeExecutor, NodeOutput};
pub use scheduler::{CronSchedulerService, ScheduleDispatcher};
pub use state::{NodeResult, NodeStatus, RunState, RunStatus};
