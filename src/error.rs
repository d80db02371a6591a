/// Engine error taxonomy
///
/// Node-level problems are folded into a failed `RunResult` and carried there,
/// so every variant is cheap to clone and serializable. Infrastructure failures
/// (checkpoint or suspension writes, unreadable snapshots) are returned as `Err`
/// from the engine entry points and abort the step.
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    #[error("unknown node type '{node_type}' on node '{node_id}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("no route matched on router node '{node_id}'")]
    NoRouteMatched { node_id: String },

    #[error("loop node '{node_id}' exceeded {limit} iterations")]
    LoopLimitExceeded { node_id: String, limit: u32 },

    #[error("run exceeded {limit} steps")]
    StepLimitExceeded { limit: u32 },

    #[error("node '{node_id}' failed: {message}")]
    ExecutorFailed { node_id: String, message: String },

    #[error("checkpoint write failed for thread '{thread_id}': {message}")]
    CheckpointWriteFailed { thread_id: String, message: String },

    #[error("suspension write failed for thread '{thread_id}': {message}")]
    SuspensionWriteFailed { thread_id: String, message: String },

    #[error("no suspension to resume for thread '{thread_id}'")]
    ResumeTargetMissing { thread_id: String },

    #[error("thread '{thread_id}' already has an active run")]
    ThreadBusy { thread_id: String },

    #[error("workflow '{workflow_id}' not found")]
    WorkflowNotFound { workflow_id: String },

    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    #[error("run state for thread '{thread_id}' is unreadable: {message}")]
    StateCorrupted { thread_id: String, message: String },

    #[error("{operation} failed: {message}")]
    StoreUnavailable { operation: String, message: String },
}

impl EngineError {
    /// True for failures of the persistence layer rather than of the run itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::CheckpointWriteFailed { .. }
                | EngineError::SuspensionWriteFailed { .. }
                | EngineError::StateCorrupted { .. }
                | EngineError::StoreUnavailable { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
