/// Data-shaping nodes: transform, set-state, code
///
/// `expression`, `mapping` and `script` reach these executors unresolved (see
/// `RAW_CONFIG_KEYS`); everything else in their config is already templated.
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::expression::{eval_expression, eval_with_budget};
use crate::runtime::resolver::resolve_str;
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 5_000;

/// `transform`: a Lua `expression`, or a `mapping` of output fields
///
/// Mapping values that contain `{{...}}` are resolved as templates, other
/// strings are Lua expressions and non-strings are copied as-is.
pub struct TransformExecutor;

impl TransformExecutor {
    fn evaluate(node: &Node, state: &RunState) -> Result<NodeOutput> {
        let scope = state.scope();

        if let Some(expression) = node.config_str("expression") {
            return Ok(NodeOutput::new(eval_expression(expression, &scope)?));
        }

        let Some(mapping) = node.config.get("mapping").and_then(Value::as_object) else {
            return Err(anyhow::anyhow!("transform needs an 'expression' or a 'mapping'"));
        };

        let mut output = Map::new();
        for (field, source) in mapping {
            let value = match source {
                Value::String(s) if s.contains("{{") => resolve_str(s, &scope),
                Value::String(expr) => eval_expression(expr, &scope)
                    .map_err(|e| anyhow::anyhow!("mapping field '{}': {:#}", field, e))?,
                other => other.clone(),
            };
            output.insert(field.clone(), value);
        }
        Ok(NodeOutput::new(Value::Object(output)))
    }
}

#[async_trait]
impl NodeExecutor for TransformExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        Self::evaluate(node, state).into()
    }
}

/// `set-state`: writes `values` (or a single `key`/`value`) into variables
pub struct SetStateExecutor;

#[async_trait]
impl NodeExecutor for SetStateExecutor {
    async fn execute(&self, node: &Node, _state: &RunState, _caps: &Capabilities) -> ExecResult {
        let values = match (node.config.get("values"), node.config_str("key")) {
            (Some(Value::Object(values)), _) => values.clone(),
            (_, Some(key)) => {
                let mut values = Map::new();
                values.insert(
                    key.to_string(),
                    node.config.get("value").cloned().unwrap_or(Value::Null),
                );
                values
            }
            _ => return ExecResult::failed("set-state needs 'values' or a 'key'"),
        };

        tracing::debug!("📝 Node '{}' set {} variable(s)", node.id, values.len());
        ExecResult::Completed(
            NodeOutput::new(Value::Object(values.clone())).with_state_updates(values),
        )
    }
}

/// `code`: sandboxed Lua script, output is its return value
pub struct CodeExecutor;

#[async_trait]
impl NodeExecutor for CodeExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let Some(script) = node.config_str("script").or_else(|| node.config_str("code")) else {
            return ExecResult::failed("code node has no script");
        };
        if let Some(language) = node.config_str("language") {
            if language != "lua" {
                return ExecResult::failed(format!("unsupported script language '{}'", language));
            }
        }

        let budget = Duration::from_millis(
            node.config
                .get("timeoutMs")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_SCRIPT_TIMEOUT_MS),
        );

        let started = std::time::Instant::now();
        match eval_with_budget(script, &state.scope(), budget) {
            Ok(value) => ExecResult::Completed(NodeOutput::new(value).with_details(json!({
                "durationMs": started.elapsed().as_millis() as u64,
            }))),
            Err(e) => ExecResult::failed(format!("script failed: {:#}", e)),
        }
    }
}
