mod common;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::*;
use intentflow::capabilities::Capabilities;
use intentflow::config::EngineConfig;
use intentflow::persistence::{database, SqliteCheckpointStore, SqliteSuspensionRegistry, WaitKind, WaitingOn};
use intentflow::runtime::executor::SuspendRequest;
use intentflow::runtime::{ApprovalDecision, ExecResult, ExecutorRegistry, NodeExecutor, NodeStatus, RunState};
use intentflow::workflow::{WorkflowRegistry, WorkflowStorage};
use intentflow::{EngineError, ExecutionEngine, Node, NodeType, ResumeEvent, RunStatus, Workflow};
use serde_json::json;
use std::sync::Arc;

fn refund_approval(timeout_edge: bool) -> Workflow {
    let mut nodes = vec![
        node("start", NodeType::Start, json!({})),
        node(
            "review",
            NodeType::UserApproval,
            json!({"approvalId": "refund-{{input.orderId}}", "message": "Refund {{input.amount}}?", "timeoutSeconds": 60}),
        ),
        node("approved", NodeType::SetState, json!({"values": {"outcome": "approved"}})),
        node("rejected", NodeType::SetState, json!({"values": {"outcome": "rejected"}})),
        node("end", NodeType::End, json!({"output": "{{outcome}}"})),
    ];
    let mut edges = vec![
        edge("start", "review"),
        handle("review", "approve", "approved"),
        handle("review", "reject", "rejected"),
        edge("approved", "end"),
        edge("rejected", "end"),
    ];
    if timeout_edge {
        nodes.push(node("escalate", NodeType::SetState, json!({"values": {"outcome": "escalated"}})));
        edges.push(handle("review", "timeout", "escalate"));
        edges.push(edge("escalate", "end"));
    }
    workflow("refund", nodes, edges)
}

#[tokio::test]
async fn approval_parks_then_approve_completes() {
    let h = harness(vec![refund_approval(false)]).await;

    let parked = h
        .engine
        .start_run("refund", json!({"orderId": 42, "amount": 90}), Some("t-approve".into()))
        .await
        .unwrap();
    assert_eq!(parked.status, RunStatus::Suspended);
    let waiting = parked.waiting_on.unwrap();
    assert_eq!(waiting.kind, WaitKind::Approval);
    assert_eq!(waiting.id, "refund-42");
    assert_eq!(parked.node_results["review"].status, NodeStatus::Suspended);

    let suspension = h.engine.suspension("t-approve").await.unwrap().unwrap();
    assert_eq!(suspension.node_id, "review");
    assert_eq!(suspension.context["message"], "Refund 90?");

    let done = h
        .engine
        .resume_approval("refund-42", ApprovalDecision::Approve, Some("looks fine".into()))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, json!("approved"));
    assert_eq!(done.variables["review"]["comment"], "looks fine");
    assert_eq!(done.variables["review"]["approved"], true);
    assert!(!done.node_results.contains_key("rejected"));
    assert!(h.engine.suspension("t-approve").await.unwrap().is_none());
    h.assert_chain_intact("t-approve").await;
}

#[tokio::test]
async fn reject_follows_reject_edge() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 7}), Some("t-reject".into()))
        .await
        .unwrap();

    let done = h
        .engine
        .resume_run(
            "t-reject",
            ResumeEvent::Approval {
                decision: ApprovalDecision::Reject,
                comment: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(done.output, json!("rejected"));
    assert_eq!(done.variables["review"]["approved"], false);
}

#[tokio::test]
async fn duplicate_resume_is_a_no_op() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 1}), Some("t-dup".into()))
        .await
        .unwrap();
    let approve = ResumeEvent::Approval {
        decision: ApprovalDecision::Approve,
        comment: None,
    };
    h.engine.resume_run("t-dup", approve.clone()).await.unwrap();

    let checkpoints = h.checkpoint_count("t-dup").await;
    let before = h.engine.state("t-dup").await.unwrap().unwrap();

    let err = h.engine.resume_run("t-dup", approve).await.unwrap_err();
    assert!(matches!(err, EngineError::ResumeTargetMissing { .. }));

    let after = h.engine.state("t-dup").await.unwrap().unwrap();
    assert_eq!(h.checkpoint_count("t-dup").await, checkpoints);
    assert_eq!(before.variables, after.variables);
    assert_eq!(before.node_results, after.node_results);
}

#[tokio::test]
async fn mismatched_event_leaves_thread_parked() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 3}), Some("t-kind".into()))
        .await
        .unwrap();
    let checkpoints = h.checkpoint_count("t-kind").await;

    let err = h
        .engine
        .resume_run("t-kind", ResumeEvent::Webhook { payload: json!({}) })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResumeTargetMissing { .. }));
    assert_eq!(h.checkpoint_count("t-kind").await, checkpoints);

    let done = h
        .engine
        .resume_approval("refund-3", ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
}

#[tokio::test]
async fn parked_thread_refuses_a_second_run() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 5}), Some("t-busy".into()))
        .await
        .unwrap();

    let err = h
        .engine
        .start_run("refund", json!({"orderId": 6}), Some("t-busy".into()))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ThreadBusy { thread_id: "t-busy".into() });
}

#[tokio::test]
async fn approval_timeout_rejects_without_timeout_edge() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 8}), Some("t-expire".into()))
        .await
        .unwrap();

    assert!(h.engine.resume_due_timers(Utc::now()).await.unwrap().is_empty());

    let resumed = h
        .engine
        .resume_due_timers(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].output, json!("rejected"));
    assert_eq!(resumed[0].variables["review"]["timedOut"], true);
}

#[tokio::test]
async fn approval_timeout_prefers_timeout_edge() {
    let h = harness(vec![refund_approval(true)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 9}), Some("t-escalate".into()))
        .await
        .unwrap();

    let resumed = h
        .engine
        .resume_due_timers(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(resumed[0].output, json!("escalated"));
    assert!(!resumed[0].node_results.contains_key("rejected"));
}

fn payment_wait() -> Workflow {
    workflow(
        "payment",
        vec![
            node("start", NodeType::Start, json!({})),
            node(
                "wait",
                NodeType::WebhookWait,
                json!({"webhookId": "payment-{{input.order}}", "timeoutSeconds": 30}),
            ),
            node("paid", NodeType::Transform, json!({"mapping": {"paid": "{{wait.paid}}", "order": "input.order"}})),
            node("expired", NodeType::SetState, json!({"values": {"expired": true}})),
        ],
        vec![
            edge("start", "wait"),
            edge("wait", "paid"),
            handle("wait", "timeout", "expired"),
        ],
    )
}

#[tokio::test]
async fn webhook_delivery_resumes_parked_thread() {
    let h = harness(vec![payment_wait()]).await;
    let parked = h
        .engine
        .start_run("payment", json!({"order": 7}), Some("t-pay".into()))
        .await
        .unwrap();
    assert_eq!(parked.waiting_on.unwrap().id, "payment-7");

    let done = h
        .engine
        .deliver_webhook("payment-7", json!({"paid": true}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, json!({"paid": true, "order": 7}));
    assert!(!done.node_results.contains_key("expired"));

    assert!(h
        .engine
        .deliver_webhook("payment-7", json!({"paid": true}))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn webhook_timeout_takes_timeout_edge() {
    let h = harness(vec![payment_wait()]).await;
    h.engine
        .start_run("payment", json!({"order": 8}), Some("t-late".into()))
        .await
        .unwrap();

    let resumed = h
        .engine
        .resume_due_timers(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, RunStatus::Completed);
    assert_eq!(resumed[0].variables["expired"], true);
    assert!(!resumed[0].node_results.contains_key("paid"));
}

#[tokio::test]
async fn delay_parks_on_timer_until_due() {
    let wf = workflow(
        "nap",
        vec![
            node("start", NodeType::Start, json!({})),
            node("nap", NodeType::Delay, json!({"seconds": 30})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "nap"), edge("nap", "end")],
    );
    let h = harness(vec![wf]).await;

    let parked = h.engine.start_run("nap", json!({"v": 1}), Some("t-nap".into())).await.unwrap();
    assert_eq!(parked.waiting_on.unwrap().kind, WaitKind::Timer);
    assert!(h.engine.resume_due_timers(Utc::now()).await.unwrap().is_empty());

    let resumed = h
        .engine
        .resume_due_timers(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, RunStatus::Completed);
    assert_eq!(resumed[0].output, json!({"v": 1}));
}

#[tokio::test]
async fn cancelling_a_parked_run() {
    let h = harness(vec![refund_approval(false)]).await;
    let mut events = h.engine.subscribe();
    h.engine
        .start_run("refund", json!({"orderId": 11}), Some("t-cancel".into()))
        .await
        .unwrap();

    assert!(h.engine.cancel("t-cancel").await.unwrap());

    let state = h.engine.state("t-cancel").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(h.engine.suspension("t-cancel").await.unwrap().is_none());
    h.assert_chain_intact("t-cancel").await;

    let mut endings = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.thread_id() == "t-cancel" {
            endings.extend(event.ends_invocation());
        }
    }
    assert_eq!(endings, [RunStatus::Suspended, RunStatus::Cancelled]);

    let err = h
        .engine
        .resume_approval("refund-11", ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResumeTargetMissing { .. }));
    assert!(!h.engine.cancel("t-cancel").await.unwrap());
}

#[tokio::test]
async fn parked_run_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("intentflow.db").display());

    let boot = |pool: sqlx::SqlitePool| {
        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone())));
        registry.insert(refund_approval(false)).unwrap();
        ExecutionEngine::new(
            registry,
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(SqliteSuspensionRegistry::new(pool)),
            &EngineConfig::default(),
        )
    };

    {
        let pool = database::connect(&url).await.unwrap();
        let engine = boot(pool.clone());
        let parked = engine
            .start_run("refund", json!({"orderId": 77}), Some("t-restart".into()))
            .await
            .unwrap();
        assert_eq!(parked.status, RunStatus::Suspended);
        pool.close().await;
    }

    let pool = database::connect(&url).await.unwrap();
    let engine = boot(pool);
    let done = engine
        .resume_approval("refund-77", ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, json!("approved"));
    // start, review parked, review resumed, approved, end
    assert_eq!(engine.history("t-restart", 100).await.unwrap().len(), 5);
}

fn approve() -> ResumeEvent {
    ResumeEvent::Approval {
        decision: ApprovalDecision::Approve,
        comment: None,
    }
}

#[tokio::test]
async fn concurrent_resumes_step_once() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 3}), Some("t-race".into()))
        .await
        .unwrap();
    let before = h.checkpoint_count("t-race").await;

    let other = ExecutionEngine::new(
        h.registry.clone(),
        Arc::new(SqliteCheckpointStore::new(h.pool.clone())),
        Arc::new(SqliteSuspensionRegistry::new(h.pool.clone())),
        &EngineConfig::default(),
    );
    let (first, second) = tokio::join!(
        h.engine.resume_run("t-race", approve()),
        other.resume_run("t-race", approve())
    );

    let outcomes = [first, second];
    let completed = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(result) if result.status == RunStatus::Completed))
        .count();
    let missing = outcomes
        .iter()
        .filter(|r| matches!(r, Err(EngineError::ResumeTargetMissing { .. })))
        .count();
    assert_eq!((completed, missing), (1, 1));

    // review resumed, approved, end
    assert_eq!(h.checkpoint_count("t-race").await, before + 3);
    h.assert_chain_intact("t-race").await;
}

#[tokio::test]
async fn failed_resume_keeps_thread_parked() {
    let h = harness(vec![refund_approval(false)]).await;
    h.engine
        .start_run("refund", json!({"orderId": 5}), Some("t-unpublished".into()))
        .await
        .unwrap();
    let before = h.checkpoint_count("t-unpublished").await;

    assert!(h.registry.remove_workflow("refund"));
    let err = h.engine.resume_run("t-unpublished", approve()).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound { ref workflow_id } if workflow_id == "refund"));
    assert!(h.engine.suspension("t-unpublished").await.unwrap().is_some());
    assert_eq!(h.checkpoint_count("t-unpublished").await, before);

    h.registry.insert(refund_approval(false)).unwrap();
    let done = h.engine.resume_run("t-unpublished", approve()).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, json!("approved"));
}

/// Takes a while before asking to park on an approval
struct SlowApproval;

#[async_trait]
impl NodeExecutor for SlowApproval {
    async fn execute(&self, node: &Node, _state: &RunState, _capabilities: &Capabilities) -> ExecResult {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        ExecResult::Suspend(SuspendRequest {
            waiting_on: WaitingOn::approval(format!("slow-{}", node.id)),
            context: json!({}),
        })
    }
}

#[tokio::test]
async fn cancel_during_a_suspending_node_ends_the_run() {
    let wf = workflow(
        "slow-review",
        vec![
            node("start", NodeType::Start, json!({})),
            node("review", NodeType::UserApproval, json!({})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "review"), handle("review", "approve", "end")],
    );
    let mut executors = ExecutorRegistry::with_defaults();
    executors.register(NodeType::UserApproval, Arc::new(SlowApproval));
    let h = harness_with_executors(vec![wf], executors).await;

    let engine = h.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .start_run("slow-review", json!({}), Some("t-active".into()))
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(h.engine.cancel("t-active").await.unwrap());

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.waiting_on.is_none());
    assert!(h.engine.suspension("t-active").await.unwrap().is_none());
    assert_eq!(h.engine.state("t-active").await.unwrap().unwrap().status, RunStatus::Cancelled);

    let err = h.engine.resume_run("t-active", approve()).await.unwrap_err();
    assert!(matches!(err, EngineError::ResumeTargetMissing { .. }));
    h.assert_chain_intact("t-active").await;
}

#[tokio::test]
async fn oversized_timeout_fails_the_run() {
    let wf = workflow(
        "far-future",
        vec![
            node("start", NodeType::Start, json!({})),
            node("pay", NodeType::WebhookWait, json!({"webhookId": "pay-far", "timeoutSeconds": 9e15})),
            node("end", NodeType::End, json!({})),
        ],
        vec![edge("start", "pay"), edge("pay", "end")],
    );
    let h = harness(vec![wf]).await;

    let result = h
        .engine
        .start_run("far-future", json!({}), Some("t-far".into()))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        &result.error,
        Some(EngineError::ExecutorFailed { node_id, message }) if node_id == "pay" && message.contains("out of range")
    ));
    assert!(h.engine.suspension("t-far").await.unwrap().is_none());
    h.assert_chain_intact("t-far").await;
}
