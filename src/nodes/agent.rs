/// `agent` node: a single LLM completion
use crate::capabilities::llm::CompletionRequest;
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct AgentExecutor;

impl AgentExecutor {
    async fn complete(node: &Node, state: &RunState, caps: &Capabilities) -> Result<NodeOutput> {
        let llm = caps
            .llm
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No LLM configured for agent node"))?;

        let prompt = match node.config.get("prompt").cloned().unwrap_or_else(|| state.last_output()) {
            Value::String(s) => s,
            Value::Null => return Err(anyhow::anyhow!("agent node has no prompt")),
            other => other.to_string(),
        };
        let json_mode = node.config_str("responseFormat") == Some("json");

        let completion = llm
            .complete(CompletionRequest {
                model: node.config_str("model").map(str::to_string),
                system: node.config_str("systemPrompt").map(str::to_string),
                prompt,
                temperature: node.config.get("temperature").and_then(Value::as_f64),
                json: json_mode,
            })
            .await?;

        tracing::info!("🤖 Agent '{}' answered with {} chars ({})", node.id, completion.text.len(), completion.model);

        let value = if json_mode {
            serde_json::from_str(&completion.text)
                .map_err(|e| anyhow::anyhow!("agent expected JSON but got unparsable text: {}", e))?
        } else {
            Value::String(completion.text)
        };

        Ok(NodeOutput::new(value).with_details(json!({
            "model": completion.model,
            "usage": completion.usage,
        })))
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    async fn execute(&self, node: &Node, state: &RunState, caps: &Capabilities) -> ExecResult {
        Self::complete(node, state, caps).await.into()
    }
}
