mod common;

use async_trait::async_trait;
use common::*;
use intentflow::capabilities::Capabilities;
use intentflow::config::EngineConfig;
use intentflow::runtime::{ExecResult, ExecutorRegistry, NodeExecutor, NodeStatus, RunState};
use intentflow::{EngineError, Node, NodeType, RunStatus};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn transform_doubles_input() {
    let wf = workflow(
        "double",
        vec![
            node("start", NodeType::Start, json!({})),
            node("double", NodeType::Transform, json!({"mapping": {"x": "input.x * 2"}})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "double"), edge("double", "end")],
    );
    let h = harness(vec![wf]).await;

    let result = h.engine.start_run("double", json!({"x": 5}), None).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, json!({"x": 10}));
    assert_eq!(result.terminal_node_id.as_deref(), Some("end"));
    assert_eq!(result.variables["double"], json!({"x": 10}));
}

#[tokio::test]
async fn if_else_takes_one_branch() {
    let wf = workflow(
        "size",
        vec![
            node("start", NodeType::Start, json!({})),
            node("check", NodeType::IfElse, json!({"condition": "input.amount > 100"})),
            node("big", NodeType::SetState, json!({"values": {"tier": "big"}})),
            node("small", NodeType::SetState, json!({"values": {"tier": "small"}})),
            node("end", NodeType::End, json!({"output": "{{tier}}"})),
        ],
        vec![
            edge("start", "check"),
            handle("check", "if", "big"),
            handle("check", "else", "small"),
            edge("big", "end"),
            edge("small", "end"),
        ],
    );
    let h = harness(vec![wf]).await;

    let big = h.engine.start_run("size", json!({"amount": 500}), None).await.unwrap();
    assert_eq!(big.output, json!("big"));
    assert!(big.node_results.contains_key("big"));
    assert!(!big.node_results.contains_key("small"));

    let small = h.engine.start_run("size", json!({"amount": 3}), None).await.unwrap();
    assert_eq!(small.output, json!("small"));
    assert!(!small.node_results.contains_key("big"));
}

#[tokio::test]
async fn router_first_matching_route_wins() {
    let wf = workflow(
        "triage",
        vec![
            node("start", NodeType::Start, json!({})),
            node(
                "route",
                NodeType::Router,
                json!({"routes": [
                    {"id": "vip", "condition": "input.amount > 1000"},
                    {"id": "large", "condition": "input.amount > 100"},
                    {"id": "any", "condition": true}
                ]}),
            ),
            node("vip-desk", NodeType::SetState, json!({"values": {"desk": "vip"}})),
            node("large-desk", NodeType::SetState, json!({"values": {"desk": "large"}})),
            node("any-desk", NodeType::SetState, json!({"values": {"desk": "any"}})),
        ],
        vec![
            edge("start", "route"),
            handle("route", "vip", "vip-desk"),
            handle("route", "large", "large-desk"),
            handle("route", "any", "any-desk"),
        ],
    );
    let h = harness(vec![wf]).await;

    let result = h.engine.start_run("triage", json!({"amount": 5000}), None).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.variables["desk"], "vip");
    assert_eq!(result.node_results["route"].details.as_ref().unwrap()["route"], "vip");
    assert!(!result.node_results.contains_key("large-desk"));
    assert!(!result.node_results.contains_key("any-desk"));

    let result = h.engine.start_run("triage", json!({"amount": 500}), None).await.unwrap();
    assert_eq!(result.variables["desk"], "large");
}

#[tokio::test]
async fn router_without_match_fails_run() {
    let wf = workflow(
        "strict",
        vec![
            node("start", NodeType::Start, json!({})),
            node("route", NodeType::Router, json!({"routes": [{"id": "yes", "condition": "input.ok == true"}]})),
            node("yes", NodeType::End, json!({})),
        ],
        vec![edge("start", "route"), handle("route", "yes", "yes")],
    );
    let h = harness(vec![wf]).await;

    let result = h.engine.start_run("strict", json!({"ok": false}), None).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error,
        Some(EngineError::NoRouteMatched {
            node_id: "route".into()
        })
    );
    assert_eq!(result.node_results["route"].status, NodeStatus::Completed);
}

fn counting_loop(id: &str, condition: serde_json::Value, max_iterations: Option<u32>) -> intentflow::Workflow {
    let mut loop_config = json!({"condition": condition});
    if let Some(max) = max_iterations {
        loop_config["maxIterations"] = json!(max);
    }
    workflow(
        id,
        vec![
            node("start", NodeType::Start, json!({})),
            node("loop", NodeType::While, loop_config),
            node("count", NodeType::Code, json!({"script": "return (count or 0) + 1"})),
            node("end", NodeType::End, json!({"output": "{{count}}"})),
        ],
        vec![
            edge("start", "loop"),
            handle("loop", "continue", "count"),
            edge("count", "loop"),
            handle("loop", "break", "end"),
        ],
    )
}

#[tokio::test]
async fn while_loop_counts_until_condition_breaks() {
    let h = harness(vec![counting_loop("count-to-3", json!("count == nil or count < 3"), None)]).await;

    let result = h.engine.start_run("count-to-3", json!({}), Some("loop-ok".into())).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, json!(3));
    assert_eq!(result.node_results["loop"].details.as_ref().unwrap()["iterations"], 3);
    h.assert_chain_intact("loop-ok").await;
}

#[tokio::test]
async fn while_loop_limit_fails_run() {
    let h = harness(vec![counting_loop("forever", json!(true), Some(3))]).await;

    let result = h.engine.start_run("forever", json!({}), None).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error,
        Some(EngineError::LoopLimitExceeded {
            node_id: "loop".into(),
            limit: 3
        })
    );
    assert_eq!(result.variables["count"], 3);
}

#[tokio::test]
async fn engine_loop_default_limit_applies() {
    let config = EngineConfig {
        max_loop_iterations: 2,
        ..EngineConfig::default()
    };
    let h = harness_with(vec![counting_loop("forever", json!(true), None)], Capabilities::default(), config).await;

    let result = h.engine.start_run("forever", json!({}), None).await.unwrap();
    assert!(matches!(result.error, Some(EngineError::LoopLimitExceeded { limit: 2, .. })));
}

#[tokio::test]
async fn step_limit_stops_runaway_runs() {
    let config = EngineConfig {
        max_steps: 5,
        ..EngineConfig::default()
    };
    let h = harness_with(vec![counting_loop("forever", json!(true), Some(100))], Capabilities::default(), config).await;

    let result = h.engine.start_run("forever", json!({}), None).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error, Some(EngineError::StepLimitExceeded { limit: 5 }));
}

#[tokio::test]
async fn one_checkpoint_per_node_and_runs_chain_on_a_thread() {
    let wf = workflow(
        "linear",
        vec![
            node("start", NodeType::Start, json!({})),
            node("remember", NodeType::SetState, json!({"key": "seen", "value": "{{input.name}}"})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "remember"), edge("remember", "end")],
    );
    let h = harness(vec![wf]).await;

    let first = h.engine.start_run("linear", json!({"name": "ada"}), Some("t-linear".into())).await.unwrap();
    assert_eq!(first.variables["seen"], "ada");
    assert_eq!(h.checkpoint_count("t-linear").await, 3);

    h.engine.start_run("linear", json!({"name": "bob"}), Some("t-linear".into())).await.unwrap();
    assert_eq!(h.checkpoint_count("t-linear").await, 6);
    h.assert_chain_intact("t-linear").await;

    let latest = h.engine.state("t-linear").await.unwrap().unwrap();
    assert_eq!(latest.variables["seen"], "bob");
    assert_eq!(latest.status, RunStatus::Completed);

    let head = &h.engine.history("t-linear", 1).await.unwrap()[0];
    assert_eq!(head.metadata["nodeId"], "end");
    assert_eq!(head.metadata["nodeType"], "end");
}

#[tokio::test]
async fn failed_node_fails_run_with_its_message() {
    let wf = workflow(
        "boom",
        vec![
            node("start", NodeType::Start, json!({})),
            node("explode", NodeType::Code, json!({"script": "error('boom')"})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "explode"), edge("explode", "end")],
    );
    let h = harness(vec![wf]).await;

    let result = h.engine.start_run("boom", json!({}), None).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        &result.error,
        Some(EngineError::ExecutorFailed { node_id, message }) if node_id == "explode" && message.contains("boom")
    ));
    assert_eq!(result.node_results["explode"].status, NodeStatus::Failed);
    assert!(!result.node_results.contains_key("end"));
}

#[tokio::test]
async fn checkpoint_write_failure_is_returned() {
    let wf = workflow(
        "fragile",
        vec![
            node("start", NodeType::Start, json!({})),
            node("next", NodeType::SetState, json!({"values": {"a": 1}})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "next"), edge("next", "end")],
    );
    let h = harness_with_failing_store(vec![wf], 1).await;

    let err = h
        .engine
        .start_run("fragile", json!({}), Some("t-fragile".into()))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CheckpointWriteFailed { ref thread_id, .. } if thread_id == "t-fragile"));
    assert!(err.is_infrastructure());
    assert_eq!(h.checkpoint_count("t-fragile").await, 1);

    let persisted = h.engine.state("t-fragile").await.unwrap().unwrap();
    assert!(persisted.node_results.contains_key("start"));
    assert!(!persisted.node_results.contains_key("next"));
}

#[tokio::test]
async fn unknown_workflow_is_an_error() {
    let h = harness(vec![]).await;
    let err = h.engine.start_run("ghost", json!({}), None).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::WorkflowNotFound {
            workflow_id: "ghost".into()
        }
    );
}

#[tokio::test]
async fn templates_resolve_against_previous_outputs() {
    let wf = workflow(
        "greet",
        vec![
            node("start", NodeType::Start, json!({})),
            node("name", NodeType::Transform, json!({"expression": "string.upper(input.name)"})),
            node("end", NodeType::End, json!({"output": {"greeting": "hello {{name}}", "missing": "{{nope.deep}}"}})),
        ],
        vec![edge("start", "name"), edge("name", "end")],
    );
    let h = harness(vec![wf]).await;

    let result = h.engine.start_run("greet", json!({"name": "ada"}), None).await.unwrap();
    assert_eq!(result.output, json!({"greeting": "hello ADA", "missing": null}));
}

/// Answers every http node with a canned response
struct CannedHttp;

#[async_trait]
impl NodeExecutor for CannedHttp {
    async fn execute(&self, node: &Node, _state: &RunState, _capabilities: &Capabilities) -> ExecResult {
        ExecResult::completed(json!({"status": 200, "url": node.config["url"]}))
    }
}

fn fetch_workflow() -> intentflow::Workflow {
    workflow(
        "fetch",
        vec![
            node("start", NodeType::Start, json!({})),
            node("call", NodeType::Http, json!({"url": "https://api.test/items/{{input.id}}"})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "call"), edge("call", "end")],
    )
}

#[tokio::test]
async fn custom_executor_replaces_builtin() {
    let mut executors = ExecutorRegistry::with_defaults();
    executors.register(NodeType::Http, Arc::new(CannedHttp));
    let h = harness_with_executors(vec![fetch_workflow()], executors).await;

    let result = h.engine.start_run("fetch", json!({"id": 9}), None).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.output, json!({"status": 200, "url": "https://api.test/items/9"}));
}

#[tokio::test]
async fn missing_executor_fails_with_unknown_node_type() {
    let defaults = ExecutorRegistry::with_defaults();
    let mut executors = ExecutorRegistry::new();
    for node_type in [NodeType::Start, NodeType::End] {
        if let Some(executor) = defaults.get(node_type) {
            executors.register(node_type, executor);
        }
    }
    let h = harness_with_executors(vec![fetch_workflow()], executors).await;

    let result = h.engine.start_run("fetch", json!({"id": 1}), None).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        &result.error,
        Some(EngineError::UnknownNodeType { node_id, node_type }) if node_id == "call" && node_type == "http"
    ));
    assert_eq!(result.node_results["call"].status, NodeStatus::Failed);
}
