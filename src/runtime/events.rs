/// Run events in and out of the engine
///
/// `RunEvent` is the ordered stream observers subscribe to; the engine keeps no
/// observer state of its own. `ResumeEvent` is what external deliveries
/// (webhooks, approvals, timers) hand to `resume_run`.
use crate::error::EngineError;
use crate::persistence::{WaitKind, WaitingOn};
use crate::runtime::state::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Observable progress of a run, in emission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted { thread_id: String, workflow_id: String },
    NodeStarted { thread_id: String, node_id: String, node_type: String },
    NodeCompleted { thread_id: String, node_id: String, output: Value },
    NodeFailed { thread_id: String, node_id: String, error: String },
    RunSuspended { thread_id: String, node_id: String, waiting_on: WaitingOn },
    RunResumed { thread_id: String, node_id: String },
    RunCompleted { thread_id: String, output: Value },
    RunFailed { thread_id: String, error: EngineError },
    RunCancelled { thread_id: String },
}

impl RunEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { thread_id, .. }
            | RunEvent::NodeStarted { thread_id, .. }
            | RunEvent::NodeCompleted { thread_id, .. }
            | RunEvent::NodeFailed { thread_id, .. }
            | RunEvent::RunSuspended { thread_id, .. }
            | RunEvent::RunResumed { thread_id, .. }
            | RunEvent::RunCompleted { thread_id, .. }
            | RunEvent::RunFailed { thread_id, .. }
            | RunEvent::RunCancelled { thread_id } => thread_id,
        }
    }

    /// Terminal or parking events end an engine invocation
    pub fn ends_invocation(&self) -> Option<RunStatus> {
        match self {
            RunEvent::RunSuspended { .. } => Some(RunStatus::Suspended),
            RunEvent::RunCompleted { .. } => Some(RunStatus::Completed),
            RunEvent::RunFailed { .. } => Some(RunStatus::Failed),
            RunEvent::RunCancelled { .. } => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    #[serde(alias = "approved", alias = "yes")]
    Approve,
    #[serde(alias = "rejected", alias = "no")]
    Reject,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
        }
    }
}

/// External event that continues a parked thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeEvent {
    Webhook {
        #[serde(default)]
        payload: Value,
    },
    Approval {
        decision: ApprovalDecision,
        #[serde(default)]
        comment: Option<String>,
    },
    Timer,
    /// Synthesized when a suspension's `timeoutAt` passes
    TimedOut,
}

impl ResumeEvent {
    /// Whether this event may resume a thread parked on `waiting_on`
    pub fn matches(&self, waiting_on: &WaitingOn) -> bool {
        match self {
            ResumeEvent::Webhook { .. } => waiting_on.kind == WaitKind::Webhook,
            ResumeEvent::Approval { .. } => waiting_on.kind == WaitKind::Approval,
            ResumeEvent::Timer => waiting_on.kind == WaitKind::Timer,
            ResumeEvent::TimedOut => true,
        }
    }

    /// Value merged into `variables` under the resumed node's id
    pub fn payload(&self) -> Value {
        match self {
            ResumeEvent::Webhook { payload } => payload.clone(),
            ResumeEvent::Approval { decision, comment } => json!({
                "decision": decision.as_str(),
                "comment": comment,
                "approved": *decision == ApprovalDecision::Approve,
            }),
            ResumeEvent::Timer => json!({"firedAt": chrono::Utc::now().to_rfc3339()}),
            ResumeEvent::TimedOut => json!({"timedOut": true}),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResumeEvent::Webhook { .. } => "webhook",
            ResumeEvent::Approval { .. } => "approval",
            ResumeEvent::Timer => "timer",
            ResumeEvent::TimedOut => "timed_out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_event_accepts_past_tense() {
        let event: ResumeEvent =
            serde_json::from_value(json!({"kind": "approval", "decision": "approved"})).unwrap();
        assert_eq!(
            event,
            ResumeEvent::Approval {
                decision: ApprovalDecision::Approve,
                comment: None
            }
        );
        assert_eq!(event.payload()["approved"], true);
    }

    #[test]
    fn approval_decision_accepts_yes_and_no() {
        let yes: ApprovalDecision = serde_json::from_value(json!("yes")).unwrap();
        let no: ApprovalDecision = serde_json::from_value(json!("no")).unwrap();
        assert_eq!((yes, no), (ApprovalDecision::Approve, ApprovalDecision::Reject));
        assert!(serde_json::from_value::<ApprovalDecision>(json!("maybe")).is_err());
    }

    #[test]
    fn kinds_must_match_waiting_type() {
        let approval = WaitingOn::approval("a");
        assert!(ResumeEvent::TimedOut.matches(&approval));
        assert!(!ResumeEvent::Timer.matches(&approval));
        assert!(!ResumeEvent::Webhook { payload: Value::Null }.matches(&approval));
    }

    #[test]
    fn run_events_are_tagged() {
        let event = RunEvent::RunCancelled { thread_id: "t".into() };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "run_cancelled");
        assert_eq!(event.ends_invocation(), Some(RunStatus::Cancelled));
    }
}
