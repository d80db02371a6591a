/// Nodes that park the run: user-approval, webhook-wait, delay
use crate::capabilities::Capabilities;
use crate::persistence::WaitingOn;
use crate::runtime::events::{ApprovalDecision, ResumeEvent};
use crate::runtime::executor::{ExecResult, NodeExecutor, NodeOutput, SuspendRequest};
use crate::runtime::state::RunState;
use crate::workflow::types::Node;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};

/// `now + secs`, or `None` when the result is not representable
fn after_seconds(secs: f64) -> Option<DateTime<Utc>> {
    let millis = secs * 1000.0;
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64).and_then(|delta| Utc::now().checked_add_signed(delta))
}

fn timeout_from(node: &Node) -> Result<Option<DateTime<Utc>>, String> {
    let Some(secs) = node
        .config
        .get("timeoutSeconds")
        .and_then(Value::as_f64)
        .filter(|secs| *secs > 0.0)
    else {
        return Ok(None);
    };
    after_seconds(secs)
        .map(Some)
        .ok_or_else(|| format!("timeoutSeconds {} is out of range", secs))
}

/// Stable id from config, or one derived from the thread and node
fn wait_id(node: &Node, key: &str, state: &RunState) -> String {
    node.config_str(key)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", state.thread_id, node.id))
}

/// `user-approval`: parks until approved or rejected
///
/// Resumes on `approve` or `reject`; a timeout takes the reject path unless
/// the node wires a `timeout` handle.
pub struct UserApprovalExecutor;

#[async_trait]
impl NodeExecutor for UserApprovalExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let approval_id = wait_id(node, "approvalId", state);
        let timeout_at = match timeout_from(node) {
            Ok(timeout_at) => timeout_at,
            Err(message) => return ExecResult::failed(message),
        };
        tracing::info!("✋ Node '{}' waiting for approval '{}'", node.id, approval_id);

        ExecResult::Suspend(SuspendRequest {
            waiting_on: WaitingOn::approval(approval_id).with_timeout(timeout_at),
            context: json!({
                "message": node.config.get("message").cloned().unwrap_or(Value::Null),
                "approvers": node.config.get("approvers").cloned().unwrap_or(Value::Null),
                "pending": state.last_output(),
            }),
        })
    }

    async fn resume(&self, _node: &Node, _state: &RunState, event: &ResumeEvent) -> ExecResult {
        let handle = match event {
            ResumeEvent::Approval { decision, .. } => decision.as_str(),
            ResumeEvent::TimedOut => ApprovalDecision::Reject.as_str(),
            other => return ExecResult::failed(format!("approval cannot resume on a {} event", other.kind())),
        };

        let mut payload = event.payload();
        if matches!(event, ResumeEvent::TimedOut) {
            payload = json!({"decision": "reject", "comment": null, "approved": false, "timedOut": true});
        }
        ExecResult::Completed(NodeOutput::new(payload).with_handle(handle))
    }
}

/// `webhook-wait`: parks until a delivery on its webhook id
pub struct WebhookWaitExecutor;

#[async_trait]
impl NodeExecutor for WebhookWaitExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let webhook_id = wait_id(node, "webhookId", state);
        let timeout_at = match timeout_from(node) {
            Ok(timeout_at) => timeout_at,
            Err(message) => return ExecResult::failed(message),
        };
        tracing::info!("🪝 Node '{}' waiting for webhook '{}'", node.id, webhook_id);

        ExecResult::Suspend(SuspendRequest {
            waiting_on: WaitingOn::webhook(webhook_id.clone()).with_timeout(timeout_at),
            context: json!({"path": format!("/webhook/{}", webhook_id)}),
        })
    }
}

/// `delay`: parks on a timer set by `seconds` or an ISO8601 `until`
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(&self, node: &Node, state: &RunState, _caps: &Capabilities) -> ExecResult {
        let fire_at = if let Some(secs) = node.config.get("seconds").and_then(Value::as_f64) {
            match after_seconds(secs) {
                Some(at) => at,
                None => return ExecResult::failed(format!("delay of {} seconds is out of range", secs)),
            }
        } else if let Some(until) = node.config_str("until") {
            match DateTime::parse_from_rfc3339(until) {
                Ok(at) => at.with_timezone(&Utc),
                Err(e) => return ExecResult::failed(format!("invalid 'until' timestamp '{}': {}", until, e)),
            }
        } else {
            return ExecResult::failed("delay needs 'seconds' or 'until'");
        };

        if fire_at <= Utc::now() {
            return ExecResult::Completed(
                NodeOutput::new(state.last_output()).with_details(json!({"firedAt": fire_at.to_rfc3339()})),
            );
        }

        tracing::info!("⏳ Node '{}' sleeping until {}", node.id, fire_at.to_rfc3339());
        ExecResult::Suspend(SuspendRequest {
            waiting_on: WaitingOn::timer(format!("{}-{}", state.thread_id, node.id), fire_at),
            context: json!({"fireAt": fire_at.to_rfc3339()}),
        })
    }

    async fn resume(&self, _node: &Node, state: &RunState, event: &ResumeEvent) -> ExecResult {
        ExecResult::Completed(NodeOutput::new(state.last_output()).with_details(event.payload()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::WaitKind;
    use crate::workflow::types::NodeType;

    #[tokio::test]
    async fn approval_suspends_with_timeout() {
        let node = Node::new(
            "review",
            NodeType::UserApproval,
            json!({"approvalId": "refund-42", "message": "ok?", "timeoutSeconds": 60}),
        );
        let state = RunState::new("wf", "t", json!({}));
        let ExecResult::Suspend(req) = UserApprovalExecutor.execute(&node, &state, &Capabilities::default()).await
        else {
            panic!("approval should suspend");
        };
        assert_eq!(req.waiting_on.kind, WaitKind::Approval);
        assert_eq!(req.waiting_on.id, "refund-42");
        assert!(req.waiting_on.timeout_at.is_some());
        assert_eq!(req.context["message"], "ok?");
    }

    #[tokio::test]
    async fn approval_resume_picks_handle() {
        let node = Node::new("review", NodeType::UserApproval, json!({}));
        let state = RunState::new("wf", "t", json!({}));

        let reject = ResumeEvent::Approval {
            decision: ApprovalDecision::Reject,
            comment: Some("no".into()),
        };
        let ExecResult::Completed(out) = UserApprovalExecutor.resume(&node, &state, &reject).await else {
            panic!("resume should complete");
        };
        assert_eq!(out.handle.as_deref(), Some("reject"));
        assert_eq!(out.value["comment"], "no");

        let ExecResult::Completed(out) = UserApprovalExecutor.resume(&node, &state, &ResumeEvent::TimedOut).await
        else {
            panic!("timeout should complete");
        };
        assert_eq!(out.handle.as_deref(), Some("reject"));
        assert_eq!(out.value["timedOut"], true);
    }

    #[tokio::test]
    async fn elapsed_delay_completes_immediately() {
        let node = Node::new("wait", NodeType::Delay, json!({"until": "2001-01-01T00:00:00Z"}));
        let state = RunState::new("wf", "t", json!({}));
        assert!(matches!(
            DelayExecutor.execute(&node, &state, &Capabilities::default()).await,
            ExecResult::Completed(_)
        ));

        let later = Node::new("wait", NodeType::Delay, json!({"seconds": 30}));
        let ExecResult::Suspend(req) = DelayExecutor.execute(&later, &state, &Capabilities::default()).await else {
            panic!("future delay should suspend");
        };
        assert_eq!(req.waiting_on.kind, WaitKind::Timer);
    }

    #[tokio::test]
    async fn out_of_range_durations_fail_the_node() {
        let state = RunState::new("wf", "t", json!({}));
        let caps = Capabilities::default();

        let wait = Node::new("pay", NodeType::WebhookWait, json!({"timeoutSeconds": 9e15}));
        assert!(matches!(
            WebhookWaitExecutor.execute(&wait, &state, &caps).await,
            ExecResult::Failed(f) if f.message.contains("out of range")
        ));

        let review = Node::new("review", NodeType::UserApproval, json!({"timeoutSeconds": 9_000_000_000_000_000_i64}));
        assert!(matches!(
            UserApprovalExecutor.execute(&review, &state, &caps).await,
            ExecResult::Failed(_)
        ));

        let delay = Node::new("wait", NodeType::Delay, json!({"seconds": 1e300}));
        assert!(matches!(DelayExecutor.execute(&delay, &state, &caps).await, ExecResult::Failed(_)));
    }
}
