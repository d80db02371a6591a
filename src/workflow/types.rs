/// Core workflow type definitions
///
/// Workflows are directed graphs of typed nodes connected through named
/// handles. They are serialized as JSON for storage and for the HTTP API.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-support-triage")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// List of nodes in this workflow
    pub nodes: Vec<Node>,
    /// List of edges connecting nodes
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single step in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "start", "check-score")
    pub id: String,
    /// The type tag which selects the executor
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Node-specific configuration. String fields may contain `{{path}}` references.
    #[serde(default, alias = "data", alias = "params")]
    pub config: Value,
}

/// Closed set of node types understood by the engine
///
/// Unknown tags are rejected when a workflow is deserialized, so a graph that
/// loads successfully never reaches the engine with an unrecognised type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeType {
    /// Unique entry point; its output is the run input
    Start,
    /// Terminates the run successfully
    End,
    /// Lua expression or field mapping over run state
    Transform,
    /// Writes named values into the flat variable namespace
    SetState,
    /// Sandboxed Lua script
    Code,
    /// Boolean branch with `if` / `else` handles
    IfElse,
    /// Ordered, labeled routes; first truthy condition wins
    Router,
    /// Loop with `continue` / `break` handles
    While,
    /// Human approval with `approve` / `reject` handles
    UserApproval,
    /// Parks until a webhook delivery arrives
    WebhookWait,
    /// Parks until a timer fires
    Delay,
    /// Policy checks with block / fallback / warn handling
    Guardrails,
    /// Outbound HTTP request
    Http,
    /// Semantic search through the retrieval capability
    Retriever,
    /// MCP server tool call
    Mcp,
    /// LLM completion
    Agent,
}

impl NodeType {
    pub const ALL: [NodeType; 16] = [
        NodeType::Start,
        NodeType::End,
        NodeType::Transform,
        NodeType::SetState,
        NodeType::Code,
        NodeType::IfElse,
        NodeType::Router,
        NodeType::While,
        NodeType::UserApproval,
        NodeType::WebhookWait,
        NodeType::Delay,
        NodeType::Guardrails,
        NodeType::Http,
        NodeType::Retriever,
        NodeType::Mcp,
        NodeType::Agent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Transform => "transform",
            NodeType::SetState => "set-state",
            NodeType::Code => "code",
            NodeType::IfElse => "if-else",
            NodeType::Router => "router",
            NodeType::While => "while",
            NodeType::UserApproval => "user-approval",
            NodeType::WebhookWait => "webhook-wait",
            NodeType::Delay => "delay",
            NodeType::Guardrails => "guardrails",
            NodeType::Http => "http",
            NodeType::Retriever => "retriever",
            NodeType::Mcp => "mcp",
            NodeType::Agent => "agent",
        }
    }

    /// Output handles this node type may use. `None` means any label is
    /// allowed (router routes are user-defined).
    pub fn fixed_handles(&self) -> Option<&'static [&'static str]> {
        match self {
            NodeType::IfElse => Some(&["if", "else"]),
            NodeType::While => Some(&["continue", "break"]),
            NodeType::UserApproval => Some(&["approve", "reject", "timeout"]),
            NodeType::Router => None,
            _ => Some(&[]),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a node type tag outside the closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeTypeTag(pub String);

impl fmt::Display for UnknownNodeTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown node type '{}'", self.0)
    }
}

impl std::error::Error for UnknownNodeTypeTag {}

impl FromStr for NodeType {
    type Err = UnknownNodeTypeTag;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| UnknownNodeTypeTag(tag.to_string()))
    }
}

impl TryFrom<String> for NodeType {
    type Error = UnknownNodeTypeTag;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

/// Connection from one node's named output handle to another node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node ID
    pub source: String,
    /// Output handle on the source node (`if`, `continue`, a route id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target node ID
    pub target: String,
    /// Input handle on the target node (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
        }
    }

    pub fn from_handle(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_handle: Some(handle.into()),
            target: target.into(),
            target_handle: None,
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
        }
    }

    /// String field from the node configuration
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}
