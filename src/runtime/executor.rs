/// Node executor contract and registry
///
/// Each node type is handled by one `NodeExecutor`. The engine resolves the
/// node's templated configuration first, then hands the executor the node,
/// a read-only view of the run state and the capability bundle. Executors
/// report one of three outcomes and never touch persistence themselves.
use crate::capabilities::Capabilities;
use crate::persistence::WaitingOn;
use crate::runtime::events::ResumeEvent;
use crate::runtime::state::RunState;
use crate::workflow::types::{Node, NodeType};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};

/// Successful node outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub value: Value,
    /// Outgoing handle to follow; `None` follows every unlabeled edge
    pub handle: Option<String>,
    /// Named values written into the flat variable namespace
    pub state_updates: Map<String, Value>,
    /// Observability payload kept in `nodeResults`
    pub details: Option<Value>,
}

impl NodeOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_state_updates(mut self, updates: Map<String, Value>) -> Self {
        self.state_updates = updates;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub message: String,
    pub details: Option<Value>,
}

/// Request to park the run until an external event arrives
#[derive(Debug, Clone, PartialEq)]
pub struct SuspendRequest {
    pub waiting_on: WaitingOn,
    /// Kept on the suspension record (approval message, webhook id, ...)
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecResult {
    Completed(NodeOutput),
    Failed(NodeFailure),
    Suspend(SuspendRequest),
}

impl ExecResult {
    pub fn completed(value: Value) -> Self {
        ExecResult::Completed(NodeOutput::new(value))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ExecResult::Failed(NodeFailure {
            message: message.into(),
            details: None,
        })
    }

    pub fn failed_with(message: impl Into<String>, details: Value) -> Self {
        ExecResult::Failed(NodeFailure {
            message: message.into(),
            details: Some(details),
        })
    }
}

impl From<anyhow::Result<NodeOutput>> for ExecResult {
    fn from(result: anyhow::Result<NodeOutput>) -> Self {
        match result {
            Ok(output) => ExecResult::Completed(output),
            Err(e) => ExecResult::failed(format!("{:#}", e)),
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the node against the current state
    async fn execute(&self, node: &Node, state: &RunState, capabilities: &Capabilities) -> ExecResult;

    /// Complete a node that previously suspended, given the event that woke it
    async fn resume(&self, _node: &Node, _state: &RunState, event: &ResumeEvent) -> ExecResult {
        ExecResult::completed(event.payload())
    }
}

/// Maps node type tags to executors
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.executors.keys().map(NodeType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry").field("types", &types).finish()
    }
}

impl ExecutorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executor for every node type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_defaults(&mut registry);
        registry
    }

    /// Register or replace the executor for a node type
    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> &mut Self {
        self.executors.insert(node_type, executor);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }
}
