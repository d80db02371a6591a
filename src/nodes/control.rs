/// Entry, exit and branching nodes
///
/// Branching executors only *decide*: they return the chosen handle and pass
/// `lastOutput` through unchanged, leaving edge selection, loop counting and
/// `NoRouteMatched` to the engine.
use crate::capabilities::Capabilities;
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput};
use crate::runtime::expression::eval_condition;
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use async_trait::async_trait;
use serde_json::{json, Value};

/// `start`: emits the run input
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    async fn execute(&self, _node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        ExecResult::completed(state.input.clone())
    }
}

/// `end`: emits `output` if configured, otherwise `lastOutput`
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let value = node
            .config
            .get("output")
            .cloned()
            .unwrap_or_else(|| state.last_output());

        let mut output = NodeOutput::new(value);
        if let Some(tag) = node.config.get("tag") {
            output = output.with_details(json!({"tag": tag}));
        }
        ExecResult::Completed(output)
    }
}

fn branch(node: &Node, state: &RunState, handle: &str, details: Value) -> ExecResult {
    tracing::debug!("🔀 Node '{}' chose handle '{}'", node.id, handle);
    ExecResult::Completed(
        NodeOutput::new(state.last_output())
            .with_handle(handle)
            .with_details(details),
    )
}

/// `if-else`: `condition` true follows `if`, false follows `else`
pub struct IfElseExecutor;

#[async_trait]
impl NodeExecutor for IfElseExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let condition = node.config.get("condition").cloned().unwrap_or(Value::Null);
        match eval_condition(&condition, &state.scope()) {
            Ok(true) => branch(node, state, "if", json!({"result": true})),
            Ok(false) => branch(node, state, "else", json!({"result": false})),
            Err(e) => ExecResult::failed(format!("condition evaluation failed: {:#}", e)),
        }
    }
}

/// `router`: routes `[{id, label?, condition}]` evaluated in declared order
///
/// No handle means no route matched.
pub struct RouterExecutor;

#[async_trait]
impl NodeExecutor for RouterExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let Some(routes) = node.config.get("routes").and_then(Value::as_array) else {
            return ExecResult::failed("router has no routes configured");
        };

        let scope = state.scope();
        for (index, route) in routes.iter().enumerate() {
            let Some(route_id) = route.get("id").and_then(Value::as_str) else {
                return ExecResult::failed(format!("route #{} has no id", index));
            };
            let condition = route.get("condition").cloned().unwrap_or(Value::Null);
            match eval_condition(&condition, &scope) {
                Ok(true) => {
                    return branch(
                        node,
                        state,
                        route_id,
                        json!({"route": route_id, "label": route.get("label"), "index": index}),
                    )
                }
                Ok(false) => continue,
                Err(e) => {
                    return ExecResult::failed(format!(
                        "condition of route '{}' failed: {:#}",
                        route_id, e
                    ))
                }
            }
        }

        ExecResult::Completed(
            NodeOutput::new(state.last_output()).with_details(json!({"route": null})),
        )
    }
}

/// `while`: `condition` true follows `continue`, false follows `break`
pub struct WhileExecutor;

#[async_trait]
impl NodeExecutor for WhileExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let condition = node.config.get("condition").cloned().unwrap_or(Value::Null);
        let iteration = state.iterations(&node.id);
        match eval_condition(&condition, &state.scope()) {
            Ok(true) => branch(node, state, "continue", json!({"iteration": iteration + 1})),
            Ok(false) => branch(node, state, "break", json!({"iterations": iteration})),
            Err(e) => ExecResult::failed(format!("loop condition evaluation failed: {:#}", e)),
        }
    }
}
