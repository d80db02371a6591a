/// `retriever` node: semantic search through the retrieval capability
use crate::capabilities::retrieval::SearchQuery;
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_LIMIT: usize = 5;

pub struct RetrieverExecutor;

impl RetrieverExecutor {
    async fn search(node: &Node, state: &RunState, caps: &Capabilities) -> Result<NodeOutput> {
        let namespace_id = node
            .config_str("namespaceId")
            .ok_or_else(|| anyhow::anyhow!("Namespace ID is required for retriever node"))?;
        let retrieval = caps
            .retrieval
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No retrieval service configured"))?;

        // Query config is already resolved; absent means `{{lastOutput}}`
        let text = match node.config.get("query").cloned().unwrap_or_else(|| state.last_output()) {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let limit = node
            .config
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);

        tracing::info!("🔍 Retriever '{}': searching namespace {} for \"{}\"", node.id, namespace_id, text);

        let hits = retrieval
            .search(SearchQuery {
                namespace_id: namespace_id.to_string(),
                text: text.clone(),
                limit,
                re_rank: node.config.get("reRank").and_then(Value::as_bool).unwrap_or(false),
            })
            .await?;

        tracing::info!("✅ Retriever '{}' found {} relevant chunks", node.id, hits.len());

        let context = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[Source {}]: {}", i + 1, hit.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(NodeOutput::new(json!({
            "summary": format!("Found {} matches for \"{}\"", hits.len(), text),
            "results": hits,
            "context": context,
        })))
    }
}

#[async_trait]
impl NodeExecutor for RetrieverExecutor {
    async fn execute(&self, node: &Node, state: &RunState, caps: &Capabilities) -> ExecResult {
        Self::search(node, state, caps).await.into()
    }
}
