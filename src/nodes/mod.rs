/// Built-in node executors
///
/// One executor per node type tag. `register_defaults` wires them all into an
/// `ExecutorRegistry`; embedders can replace individual entries afterwards.

// Start, end and branching
pub mod control;

// Transform, set-state and Lua code
pub mod data;

// Approval, webhook and timer waits
pub mod wait;

// Outbound HTTP
pub mod http;

// Policy checks
pub mod guardrails;

// Knowledge search
pub mod retriever;

// MCP tool calls
pub mod mcp;

// LLM completion
pub mod agent;

use crate::runtime::executor::ExecutorRegistry;
use crate::workflow::types::NodeType;
use std::sync::Arc;

/// Config keys whose values are source code and must reach the executor
/// without template resolution
pub const RAW_CONFIG_KEYS: &[&str] = &["script", "code", "expression", "mapping"];

pub fn register_defaults(registry: &mut ExecutorRegistry) {
    registry
        .register(NodeType::Start, Arc::new(control::StartExecutor))
        .register(NodeType::End, Arc::new(control::EndExecutor))
        .register(NodeType::IfElse, Arc::new(control::IfElseExecutor))
        .register(NodeType::Router, Arc::new(control::RouterExecutor))
        .register(NodeType::While, Arc::new(control::WhileExecutor))
        .register(NodeType::Transform, Arc::new(data::TransformExecutor))
        .register(NodeType::SetState, Arc::new(data::SetStateExecutor))
        .register(NodeType::Code, Arc::new(data::CodeExecutor))
        .register(NodeType::UserApproval, Arc::new(wait::UserApprovalExecutor))
        .register(NodeType::WebhookWait, Arc::new(wait::WebhookWaitExecutor))
        .register(NodeType::Delay, Arc::new(wait::DelayExecutor))
        .register(NodeType::Http, Arc::new(http::HttpExecutor))
        .register(NodeType::Guardrails, Arc::new(guardrails::GuardrailsExecutor))
        .register(NodeType::Retriever, Arc::new(retriever::RetrieverExecutor))
        .register(NodeType::Mcp, Arc::new(mcp::McpExecutor))
        .register(NodeType::Agent, Arc::new(agent::AgentExecutor));
}
