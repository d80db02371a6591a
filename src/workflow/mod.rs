/// Workflow Management Layer
///
/// Workflow definitions, their validation into an executable graph,
/// persistence, and the hot-reload registry:
/// - Type definitions (Workflow, Node, NodeType, Edge)
/// - Graph validation and routing lookups on petgraph
/// - SQLite persistence with sqlx
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Validated graph model with loop detection
pub mod graph;

// SQLite persistence layer for workflow storage
pub mod storage;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

pub use graph::WorkflowGraph;
pub use registry::{CompiledWorkflow, WebhookTrigger, WorkflowRegistry};
pub use storage::WorkflowStorage;
pub use types::{Edge, Node, NodeType, Workflow};
