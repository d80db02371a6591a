/// Per-run state
///
/// `RunState` is owned by exactly one engine invocation at a time and is what
/// each checkpoint serializes. Besides the user-visible `variables` and
/// `nodeResults` it carries the engine's own cursor (pending worklist, visited
/// set, loop counters) so that a resumed run continues exactly where the
/// suspended one stopped.
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Key under which the most recent node output is kept
pub const LAST_OUTPUT: &str = "lastOutput";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Suspended,
}

/// Outcome of the latest execution of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Extra observability payload (guardrail violations, chosen route, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub workflow_id: String,
    pub thread_id: String,
    /// Triggering payload
    pub input: Value,
    /// Node outputs by node id, `lastOutput`, and names written by set-state
    pub variables: Map<String, Value>,
    pub node_results: BTreeMap<String, NodeResult>,
    pub current_node_id: Option<String>,
    /// Nodes scheduled to run, in order
    pub pending: VecDeque<String>,
    /// Nodes that already ran in this run
    pub visited: BTreeSet<String>,
    /// `while` iterations taken per loop node
    pub loop_iterations: BTreeMap<String, u32>,
    pub steps: u32,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

impl RunState {
    pub fn new(workflow_id: impl Into<String>, thread_id: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            thread_id: thread_id.into(),
            input,
            variables: Map::new(),
            node_results: BTreeMap::new(),
            current_node_id: None,
            pending: VecDeque::new(),
            visited: BTreeSet::new(),
            loop_iterations: BTreeMap::new(),
            steps: 0,
            status: RunStatus::Running,
            error: None,
        }
    }

    pub fn last_output(&self) -> Value {
        self.variables.get(LAST_OUTPUT).cloned().unwrap_or(Value::Null)
    }

    /// Record a completed node: its result, `variables[node_id]`,
    /// `variables.lastOutput` and any named state it wrote
    pub fn record_completed(
        &mut self,
        node_id: &str,
        output: Value,
        state_updates: Map<String, Value>,
        details: Option<Value>,
    ) {
        for (name, value) in state_updates {
            self.variables.insert(name, value);
        }
        self.variables.insert(node_id.to_string(), output.clone());
        self.variables.insert(LAST_OUTPUT.to_string(), output.clone());
        self.node_results.insert(
            node_id.to_string(),
            NodeResult {
                status: NodeStatus::Completed,
                output,
                error: None,
                details,
            },
        );
    }

    pub fn record_failed(&mut self, node_id: &str, message: &str, details: Option<Value>) {
        self.node_results.insert(
            node_id.to_string(),
            NodeResult {
                status: NodeStatus::Failed,
                output: Value::Null,
                error: Some(message.to_string()),
                details,
            },
        );
    }

    pub fn record_suspended(&mut self, node_id: &str, details: Value) {
        self.node_results.insert(
            node_id.to_string(),
            NodeResult {
                status: NodeStatus::Suspended,
                output: Value::Null,
                error: None,
                details: Some(details),
            },
        );
    }

    /// The object templates and expressions are evaluated against
    ///
    /// Every variable is visible at top level (`{{classify.label}}`,
    /// `{{lastOutput}}`, `{{customerTier}}`), next to `input` and a
    /// `variables` alias of the whole namespace.
    pub fn scope(&self) -> Value {
        let mut scope = self.variables.clone();
        scope.insert("input".to_string(), self.input.clone());
        scope
            .entry(LAST_OUTPUT.to_string())
            .or_insert(Value::Null);
        scope.insert("variables".to_string(), Value::Object(self.variables.clone()));
        scope.insert("threadId".to_string(), Value::String(self.thread_id.clone()));
        Value::Object(scope)
    }

    /// Number of times a loop node has chosen `continue`
    pub fn iterations(&self, node_id: &str) -> u32 {
        self.loop_iterations.get(node_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_node_updates_variables() {
        let mut state = RunState::new("wf", "t", json!({"x": 5}));
        let mut updates = Map::new();
        updates.insert("tier".into(), json!("gold"));
        state.record_completed("double", json!({"x": 10}), updates, None);

        assert_eq!(state.last_output(), json!({"x": 10}));
        assert_eq!(state.variables["double"], json!({"x": 10}));
        assert_eq!(state.node_results["double"].status, NodeStatus::Completed);

        let scope = state.scope();
        assert_eq!(scope["input"]["x"], 5);
        assert_eq!(scope["tier"], "gold");
        assert_eq!(scope["variables"]["tier"], "gold");
    }

    #[test]
    fn state_survives_serialization() {
        let mut state = RunState::new("wf", "t", json!(null));
        state.pending.push_back("next".into());
        state.loop_iterations.insert("loop".into(), 3);
        state.error = Some(EngineError::NoRouteMatched { node_id: "r".into() });

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["loopIterations"]["loop"], 3);
        let back: RunState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
