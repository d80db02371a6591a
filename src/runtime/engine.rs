/// Checkpointed graph execution engine
///
/// Walks a compiled workflow one node at a time. Every node step is applied to
/// the run state, routed, and persisted as a checkpoint before the next node
/// starts, so the checkpoint chain is always a faithful record of what ran.
/// A node that cannot complete synchronously parks the thread in the
/// suspension registry; `resume_run` later picks it up from that exact
/// checkpoint.
///
/// At most one invocation steps a given thread at a time: an in-process lease
/// guards the fast path, and the checkpoint store's head compare-and-set
/// rejects writers that lost a race across processes.
use crate::capabilities::Capabilities;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::nodes::RAW_CONFIG_KEYS;
use crate::persistence::{Checkpoint, CheckpointStore, Suspension, SuspensionRegistry, WaitKind, WaitingOn};
use crate::runtime::events::{ApprovalDecision, ResumeEvent, RunEvent};
use crate::runtime::executor::{ExecResult, ExecutorRegistry, NodeOutput};
use crate::runtime::resolver::resolve_config;
use crate::runtime::state::{NodeResult, RunState, RunStatus};
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::registry::{CompiledWorkflow, WorkflowRegistry};
use crate::workflow::types::{Node, NodeType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Handle followed by a timed-out wait, when the node wires one
const TIMEOUT_HANDLE: &str = "timeout";

/// What a caller gets back from one engine invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub thread_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    /// `lastOutput` of a completed run, null otherwise
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    /// Last node that ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_node_id: Option<String>,
    /// Set when the run is parked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitingOn>,
    pub node_results: BTreeMap<String, NodeResult>,
    pub variables: Map<String, Value>,
}

impl RunResult {
    fn from_state(state: &RunState, waiting_on: Option<WaitingOn>) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            output: match state.status {
                RunStatus::Completed => state.last_output(),
                _ => Value::Null,
            },
            error: state.error.clone(),
            terminal_node_id: state.current_node_id.clone(),
            waiting_on,
            node_results: state.node_results.clone(),
            variables: state.variables.clone(),
        }
    }
}

/// A claimed suspension loaded back into memory
struct ParkedRun {
    state: RunState,
    compiled: CompiledWorkflow,
    node: Node,
    head: String,
}

type ActiveRuns = Mutex<HashMap<String, CancellationToken>>;

/// Exclusive right to step one thread in this process
struct ThreadLease<'a> {
    active: &'a ActiveRuns,
    thread_id: String,
    token: CancellationToken,
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.thread_id);
    }
}

pub struct ExecutionEngine {
    workflows: Arc<WorkflowRegistry>,
    executors: Arc<ExecutorRegistry>,
    capabilities: Capabilities,
    checkpoints: Arc<dyn CheckpointStore>,
    suspensions: Arc<dyn SuspensionRegistry>,
    max_loop_iterations: u32,
    max_steps: u32,
    events: broadcast::Sender<RunEvent>,
    active: ActiveRuns,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("executors", &self.executors)
            .field("capabilities", &self.capabilities)
            .field("max_loop_iterations", &self.max_loop_iterations)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl ExecutionEngine {
    /// Engine with the built-in executors and no external capabilities
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        suspensions: Arc<dyn SuspensionRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            workflows,
            executors: Arc::new(ExecutorRegistry::with_defaults()),
            capabilities: Capabilities::default(),
            checkpoints,
            suspensions,
            max_loop_iterations: config.max_loop_iterations,
            max_steps: config.max_steps,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.workflows
    }

    /// Ordered stream of run events; lagging receivers lose the oldest events
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Start a new run of a registered workflow
    pub async fn start_run(
        &self,
        workflow_id: &str,
        input: Value,
        thread_id: Option<String>,
    ) -> EngineResult<RunResult> {
        let compiled = self
            .workflows
            .get_workflow(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        self.run(&compiled, input, thread_id).await
    }

    /// Run a compiled workflow from its start node
    ///
    /// A thread that already has history gets the new run chained onto its
    /// checkpoint head; a parked thread is refused with `ThreadBusy`.
    pub async fn run(
        &self,
        compiled: &CompiledWorkflow,
        input: Value,
        thread_id: Option<String>,
    ) -> EngineResult<RunResult> {
        let thread_id = thread_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lease = self.acquire(&thread_id)?;

        let parked = self
            .suspensions
            .get(&thread_id)
            .await
            .map_err(|e| store_error("suspension lookup", e))?;
        if parked.is_some() {
            tracing::warn!("⚠️ Thread {} is parked; refusing to start a second run on it", thread_id);
            return Err(EngineError::ThreadBusy { thread_id });
        }

        let head = self
            .checkpoints
            .get_latest(&thread_id)
            .await
            .map_err(|e| store_error("checkpoint lookup", e))?
            .map(|c| c.checkpoint_id);

        let mut state = RunState::new(compiled.workflow.id.as_str(), thread_id.as_str(), input);
        state.pending.push_back(compiled.graph.start_id().to_string());

        tracing::info!("🚀 Starting workflow execution: {} (thread {})", compiled.workflow.id, thread_id);
        self.emit(RunEvent::RunStarted {
            thread_id: thread_id.clone(),
            workflow_id: compiled.workflow.id.clone(),
        });

        self.drive(compiled, state, head, &lease.token).await
    }

    /// Continue a parked thread with the event it was waiting for
    ///
    /// Re-delivered or mismatched events find no claimable suspension and
    /// return `ResumeTargetMissing` without touching state.
    pub async fn resume_run(&self, thread_id: &str, event: ResumeEvent) -> EngineResult<RunResult> {
        let lease = self.acquire(thread_id)?;

        let suspension = self
            .suspensions
            .claim(thread_id)
            .await
            .map_err(|e| suspension_error(thread_id, e))?
            .ok_or_else(|| {
                tracing::warn!("⚠️ No parked run to resume on thread {} ({} event discarded)", thread_id, event.kind());
                EngineError::ResumeTargetMissing {
                    thread_id: thread_id.to_string(),
                }
            })?;

        if !event.matches(&suspension.waiting_on) {
            tracing::warn!(
                "⚠️ Thread {} waits on {} '{}', not a {} event",
                thread_id,
                suspension.waiting_on.kind.as_str(),
                suspension.waiting_on.id,
                event.kind()
            );
            self.release(thread_id).await;
            return Err(EngineError::ResumeTargetMissing {
                thread_id: thread_id.to_string(),
            });
        }

        // Nothing has been written yet, so any failure hands the claim back
        let parked = match self.load_parked(&suspension).await {
            Ok(parked) => parked,
            Err(e) => {
                self.release(thread_id).await;
                return Err(e);
            }
        };

        let outcome = self.continue_parked(parked, event, &lease.token).await;
        if matches!(&outcome, Err(e) if e.is_infrastructure()) {
            self.release(thread_id).await;
        }
        outcome
    }

    /// State, workflow and node a claimed suspension resumes into
    async fn load_parked(&self, suspension: &Suspension) -> EngineResult<ParkedRun> {
        let thread_id = suspension.thread_id.as_str();
        let latest = self
            .checkpoints
            .get_latest(thread_id)
            .await
            .map_err(|e| store_error("checkpoint lookup", e))?;

        let Some(latest) = latest.filter(|c| c.checkpoint_id == suspension.resume_checkpoint_id) else {
            tracing::warn!("⚠️ Suspension of thread {} is stale; clearing it", thread_id);
            self.suspensions
                .clear(thread_id)
                .await
                .map_err(|e| suspension_error(thread_id, e))?;
            return Err(EngineError::ResumeTargetMissing {
                thread_id: thread_id.to_string(),
            });
        };

        let state: RunState =
            serde_json::from_value(latest.checkpoint).map_err(|e| EngineError::StateCorrupted {
                thread_id: thread_id.to_string(),
                message: e.to_string(),
            })?;
        let compiled = self
            .workflows
            .get_workflow(&state.workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: state.workflow_id.clone(),
            })?;
        let node = compiled
            .graph
            .node(&suspension.node_id)
            .cloned()
            .ok_or_else(|| EngineError::StateCorrupted {
                thread_id: thread_id.to_string(),
                message: format!("suspended node '{}' is no longer in the workflow", suspension.node_id),
            })?;

        Ok(ParkedRun {
            state,
            compiled,
            node,
            head: latest.checkpoint_id,
        })
    }

    async fn continue_parked(
        &self,
        parked: ParkedRun,
        event: ResumeEvent,
        token: &CancellationToken,
    ) -> EngineResult<RunResult> {
        let ParkedRun {
            mut state,
            compiled,
            node,
            head,
        } = parked;
        let thread_id = state.thread_id.clone();

        tracing::info!("▶️ Resuming thread {} at node '{}' on {} event", thread_id, node.id, event.kind());
        self.emit(RunEvent::RunResumed {
            thread_id: thread_id.to_string(),
            node_id: node.id.clone(),
        });

        state.status = RunStatus::Running;
        state.current_node_id = Some(node.id.clone());
        let mut head = Some(head);

        let result = match self.executors.get(node.node_type) {
            Some(executor) => {
                let resolved = self.resolve(&node, &state);
                let mut result = executor.resume(&resolved, &state, &event).await;
                if let (ResumeEvent::TimedOut, ExecResult::Completed(output)) = (&event, &mut result) {
                    if compiled.graph.has_handle(&node.id, TIMEOUT_HANDLE) {
                        output.handle = Some(TIMEOUT_HANDLE.to_string());
                    }
                }
                result
            }
            None => ExecResult::failed(unknown_type(&node).to_string()),
        };

        let waiting_on = self
            .apply(&compiled, &mut state, &mut head, &node, result, "resume", token)
            .await?;
        if waiting_on.is_none() {
            self.suspensions
                .clear(&thread_id)
                .await
                .map_err(|e| suspension_error(&thread_id, e))?;
        }

        match waiting_on {
            Some(_) if token.is_cancelled() => {
                self.unpark_cancelled(&mut state, &mut head).await?;
                Ok(self.finish(&state, None))
            }
            Some(waiting_on) => Ok(self.finish(&state, Some(waiting_on))),
            None => self.drive(&compiled, state, head, token).await,
        }
    }

    /// Drop a suspension written while a cancel was arriving and end the run
    async fn unpark_cancelled(&self, state: &mut RunState, head: &mut Option<String>) -> EngineResult<()> {
        self.suspensions
            .clear(&state.thread_id)
            .await
            .map_err(|e| suspension_error(&state.thread_id, e))?;
        state.status = RunStatus::Cancelled;
        state.pending.clear();
        self.persist(state, head, json!({"source": "cancel"})).await?;
        tracing::info!("🛑 Cancelled thread {} as it parked", state.thread_id);
        Ok(())
    }

    /// Stop a run
    ///
    /// An active run stops before its next node; a parked run is marked
    /// cancelled and its suspension cleared. Returns false when there was
    /// nothing to cancel.
    pub async fn cancel(&self, thread_id: &str) -> EngineResult<bool> {
        let running = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned();
        if let Some(token) = running {
            tracing::info!("🛑 Cancellation requested for active thread {}", thread_id);
            token.cancel();
            return Ok(true);
        }

        let _lease = self.acquire(thread_id)?;
        let Some(suspension) = self
            .suspensions
            .claim(thread_id)
            .await
            .map_err(|e| suspension_error(thread_id, e))?
        else {
            return Ok(false);
        };

        let latest = self
            .checkpoints
            .get(thread_id, &suspension.resume_checkpoint_id)
            .await
            .map_err(|e| store_error("checkpoint lookup", e))?;
        if let Some(latest) = latest {
            let mut state: RunState =
                serde_json::from_value(latest.checkpoint).map_err(|e| EngineError::StateCorrupted {
                    thread_id: thread_id.to_string(),
                    message: e.to_string(),
                })?;
            state.status = RunStatus::Cancelled;
            state.pending.clear();
            let mut head = Some(latest.checkpoint_id);
            if let Err(e) = self.persist(&state, &mut head, json!({"source": "cancel"})).await {
                self.release(thread_id).await;
                return Err(e);
            }
        }

        self.suspensions
            .clear(thread_id)
            .await
            .map_err(|e| suspension_error(thread_id, e))?;
        tracing::info!("🛑 Cancelled parked thread {}", thread_id);
        self.emit(RunEvent::RunCancelled {
            thread_id: thread_id.to_string(),
        });
        Ok(true)
    }

    /// Resume every thread whose timer fired or whose wait timed out
    pub async fn resume_due_timers(&self, now: DateTime<Utc>) -> EngineResult<Vec<RunResult>> {
        let due = self
            .suspensions
            .find_due_timers(now)
            .await
            .map_err(|e| store_error("timer sweep", e))?;

        let mut resumed = Vec::with_capacity(due.len());
        for suspension in due {
            let event = match suspension.waiting_on.kind {
                WaitKind::Timer => ResumeEvent::Timer,
                WaitKind::Webhook | WaitKind::Approval => ResumeEvent::TimedOut,
            };
            match self.resume_run(&suspension.thread_id, event).await {
                Ok(result) => resumed.push(result),
                Err(e) => tracing::warn!("⚠️ Timer resume of thread {} skipped: {}", suspension.thread_id, e),
            }
        }
        Ok(resumed)
    }

    /// Resume the thread parked on an approval id
    pub async fn resume_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> EngineResult<RunResult> {
        let suspension = self
            .suspensions
            .find_by_approval(approval_id)
            .await
            .map_err(|e| store_error("approval lookup", e))?
            .ok_or_else(|| EngineError::ResumeTargetMissing {
                thread_id: approval_id.to_string(),
            })?;
        self.resume_run(&suspension.thread_id, ResumeEvent::Approval { decision, comment })
            .await
    }

    /// Deliver a webhook to the thread parked on it, if any
    pub async fn deliver_webhook(&self, webhook_id: &str, payload: Value) -> EngineResult<Option<RunResult>> {
        let parked = self
            .suspensions
            .find_by_webhook(webhook_id)
            .await
            .map_err(|e| store_error("webhook lookup", e))?;
        match parked {
            Some(suspension) => self
                .resume_run(&suspension.thread_id, ResumeEvent::Webhook { payload })
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Latest persisted state of a thread
    pub async fn state(&self, thread_id: &str) -> EngineResult<Option<RunState>> {
        let latest = self
            .checkpoints
            .get_latest(thread_id)
            .await
            .map_err(|e| store_error("checkpoint lookup", e))?;
        latest
            .map(|c| {
                serde_json::from_value(c.checkpoint).map_err(|e| EngineError::StateCorrupted {
                    thread_id: thread_id.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Checkpoints of a thread, most recent first
    pub async fn history(&self, thread_id: &str, limit: usize) -> EngineResult<Vec<Checkpoint>> {
        self.checkpoints
            .list(thread_id, limit)
            .await
            .map_err(|e| store_error("checkpoint listing", e))
    }

    pub async fn suspension(&self, thread_id: &str) -> EngineResult<Option<Suspension>> {
        self.suspensions
            .get(thread_id)
            .await
            .map_err(|e| store_error("suspension lookup", e))
    }

    fn acquire(&self, thread_id: &str) -> EngineResult<ThreadLease<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(thread_id) {
            return Err(EngineError::ThreadBusy {
                thread_id: thread_id.to_string(),
            });
        }
        let token = CancellationToken::new();
        active.insert(thread_id.to_string(), token.clone());
        Ok(ThreadLease {
            active: &self.active,
            thread_id: thread_id.to_string(),
            token,
        })
    }

    async fn release(&self, thread_id: &str) {
        if let Err(e) = self.suspensions.release(thread_id).await {
            tracing::error!("❌ Failed to release suspension claim of thread {}: {}", thread_id, e);
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(status) = event.ends_invocation() {
            tracing::debug!("📣 Thread {} handed back as {:?}", event.thread_id(), status);
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn resolve(&self, node: &Node, state: &RunState) -> Node {
        Node {
            config: resolve_config(&node.config, &state.scope(), RAW_CONFIG_KEYS),
            ..node.clone()
        }
    }

    /// Step the run until it completes, fails, parks or is cancelled
    async fn drive(
        &self,
        compiled: &CompiledWorkflow,
        mut state: RunState,
        mut head: Option<String>,
        token: &CancellationToken,
    ) -> EngineResult<RunResult> {
        let run_started = Instant::now();
        let mut waiting_on = None;

        while state.status == RunStatus::Running {
            if token.is_cancelled() {
                state.status = RunStatus::Cancelled;
                state.pending.clear();
                self.persist(&state, &mut head, json!({"source": "cancel"})).await?;
                break;
            }

            let Some(node_id) = state.pending.pop_front() else {
                state.status = RunStatus::Completed;
                break;
            };
            waiting_on = self.step(compiled, &mut state, &mut head, &node_id, token).await?;
            if waiting_on.is_some() && token.is_cancelled() {
                self.unpark_cancelled(&mut state, &mut head).await?;
                waiting_on = None;
            }
        }

        tracing::info!(
            "🏁 Thread {} finished as {:?} after {} steps in {:?}",
            state.thread_id,
            state.status,
            state.steps,
            run_started.elapsed()
        );
        Ok(self.finish(&state, waiting_on))
    }

    async fn step(
        &self,
        compiled: &CompiledWorkflow,
        state: &mut RunState,
        head: &mut Option<String>,
        node_id: &str,
        token: &CancellationToken,
    ) -> EngineResult<Option<WaitingOn>> {
        let node = compiled
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::StateCorrupted {
                thread_id: state.thread_id.clone(),
                message: format!("pending node '{}' is not in workflow '{}'", node_id, compiled.workflow.id),
            })?;

        state.current_node_id = Some(node.id.clone());
        if state.steps >= self.max_steps {
            fail(state, EngineError::StepLimitExceeded { limit: self.max_steps });
            self.persist(state, head, metadata(&node, "run")).await?;
            return Ok(None);
        }
        state.steps += 1;
        state.visited.insert(node.id.clone());

        self.emit(RunEvent::NodeStarted {
            thread_id: state.thread_id.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type.to_string(),
        });
        tracing::debug!("🔧 Executing node '{}' ({})", node.id, node.node_type);

        let started = Instant::now();
        let result = match self.executors.get(node.node_type) {
            Some(executor) => {
                let resolved = self.resolve(&node, state);
                executor.execute(&resolved, state, &self.capabilities).await
            }
            None => {
                let error = unknown_type(&node);
                state.record_failed(&node.id, &error.to_string(), None);
                fail(state, error);
                self.persist(state, head, metadata(&node, "run")).await?;
                return Ok(None);
            }
        };
        tracing::debug!("⏱️ Node '{}' returned in {:?}", node.id, started.elapsed());

        self.apply(compiled, state, head, &node, result, "run", token).await
    }

    /// Fold one executor outcome into the state, route, and checkpoint it
    ///
    /// A suspend requested after the run was cancelled ends the run instead
    /// of parking it.
    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        compiled: &CompiledWorkflow,
        state: &mut RunState,
        head: &mut Option<String>,
        node: &Node,
        result: ExecResult,
        source: &str,
        token: &CancellationToken,
    ) -> EngineResult<Option<WaitingOn>> {
        match result {
            ExecResult::Completed(NodeOutput {
                value,
                handle,
                state_updates,
                details,
            }) => {
                state.record_completed(&node.id, value.clone(), state_updates, details);
                if let Err(error) = self.route(&compiled.graph, state, node, handle.as_deref()) {
                    tracing::error!("❌ Routing from '{}' failed: {}", node.id, error);
                    fail(state, error);
                }
                self.persist(state, head, metadata(node, source)).await?;

                tracing::info!("✅ Node execution completed: {}", node.id);
                self.emit(RunEvent::NodeCompleted {
                    thread_id: state.thread_id.clone(),
                    node_id: node.id.clone(),
                    output: value,
                });
                Ok(None)
            }
            ExecResult::Failed(failure) => {
                tracing::error!("❌ Node execution failed: {} - Error: {}", node.id, failure.message);
                state.record_failed(&node.id, &failure.message, failure.details);
                fail(
                    state,
                    EngineError::ExecutorFailed {
                        node_id: node.id.clone(),
                        message: failure.message.clone(),
                    },
                );
                self.persist(state, head, metadata(node, source)).await?;

                self.emit(RunEvent::NodeFailed {
                    thread_id: state.thread_id.clone(),
                    node_id: node.id.clone(),
                    error: failure.message,
                });
                Ok(None)
            }
            ExecResult::Suspend(_) if token.is_cancelled() => {
                tracing::info!("🛑 Thread {} cancelled while '{}' ran; not parking", state.thread_id, node.id);
                state.status = RunStatus::Cancelled;
                state.pending.clear();
                self.persist(state, head, metadata(node, "cancel")).await?;
                Ok(None)
            }
            ExecResult::Suspend(request) => {
                state.record_suspended(&node.id, request.context.clone());
                state.status = RunStatus::Suspended;
                let checkpoint_id = self.persist(state, head, metadata(node, source)).await?;

                let suspension = Suspension {
                    thread_id: state.thread_id.clone(),
                    waiting_on: request.waiting_on.clone(),
                    resume_checkpoint_id: checkpoint_id,
                    node_id: node.id.clone(),
                    context: request.context,
                    created_at: Utc::now(),
                };
                self.suspensions
                    .park(&suspension)
                    .await
                    .map_err(|e| suspension_error(&state.thread_id, e))?;

                tracing::info!(
                    "⏸️ Thread {} parked at '{}' waiting on {} '{}'",
                    state.thread_id,
                    node.id,
                    request.waiting_on.kind.as_str(),
                    request.waiting_on.id
                );
                Ok(Some(request.waiting_on))
            }
        }
    }

    /// Apply the routing rule for a completed node
    fn route(
        &self,
        graph: &WorkflowGraph,
        state: &mut RunState,
        node: &Node,
        handle: Option<&str>,
    ) -> EngineResult<()> {
        match (node.node_type, handle) {
            (NodeType::End, _) => {
                state.pending.clear();
                state.status = RunStatus::Completed;
                return Ok(());
            }
            (NodeType::Router, None) => {
                return Err(EngineError::NoRouteMatched {
                    node_id: node.id.clone(),
                })
            }
            (NodeType::While, Some("continue")) => {
                let limit = node
                    .config
                    .get("maxIterations")
                    .and_then(Value::as_u64)
                    .map(|n| n.min(u32::MAX as u64) as u32)
                    .unwrap_or(self.max_loop_iterations);
                let taken = state.loop_iterations.entry(node.id.clone()).or_insert(0);
                *taken += 1;
                if *taken > limit {
                    return Err(EngineError::LoopLimitExceeded {
                        node_id: node.id.clone(),
                        limit,
                    });
                }
            }
            _ => {}
        }

        let targets: Vec<&str> = match handle {
            Some(handle) => graph
                .outgoing_for_handle(&node.id, handle)
                .map(|e| e.target.as_str())
                .collect(),
            None => graph
                .outgoing(&node.id)
                .iter()
                .filter(|e| e.source_handle.as_deref() != Some(TIMEOUT_HANDLE))
                .map(|e| e.target.as_str())
                .collect(),
        };

        for target in targets {
            let queued = state.pending.iter().any(|p| p == target);
            let ran = state.visited.contains(target) && !graph.is_loop_member(target);
            if !queued && !ran {
                state.pending.push_back(target.to_string());
            }
        }

        if state.pending.is_empty() {
            state.status = RunStatus::Completed;
        }
        Ok(())
    }

    /// Append the state as the thread's next checkpoint
    async fn persist(&self, state: &RunState, head: &mut Option<String>, metadata: Value) -> EngineResult<String> {
        let write_failed = |message: String| EngineError::CheckpointWriteFailed {
            thread_id: state.thread_id.clone(),
            message,
        };

        let snapshot = serde_json::to_value(state).map_err(|e| write_failed(e.to_string()))?;
        let checkpoint = Checkpoint::new(state.thread_id.as_str(), head.clone(), snapshot, metadata);
        self.checkpoints.save(&checkpoint).await.map_err(|e| {
            tracing::error!("❌ Checkpoint write failed for thread {}: {:#}", state.thread_id, e);
            write_failed(format!("{:#}", e))
        })?;

        *head = Some(checkpoint.checkpoint_id.clone());
        Ok(checkpoint.checkpoint_id)
    }

    fn finish(&self, state: &RunState, waiting_on: Option<WaitingOn>) -> RunResult {
        let thread_id = state.thread_id.clone();
        match state.status {
            RunStatus::Completed => self.emit(RunEvent::RunCompleted {
                thread_id,
                output: state.last_output(),
            }),
            RunStatus::Failed => {
                if let Some(error) = &state.error {
                    self.emit(RunEvent::RunFailed {
                        thread_id,
                        error: error.clone(),
                    });
                }
            }
            RunStatus::Cancelled => self.emit(RunEvent::RunCancelled { thread_id }),
            RunStatus::Suspended => {
                if let (Some(node_id), Some(waiting_on)) = (&state.current_node_id, &waiting_on) {
                    self.emit(RunEvent::RunSuspended {
                        thread_id,
                        node_id: node_id.clone(),
                        waiting_on: waiting_on.clone(),
                    });
                }
            }
            RunStatus::Running => {}
        }
        RunResult::from_state(state, waiting_on)
    }
}

fn fail(state: &mut RunState, error: EngineError) {
    state.error = Some(error);
    state.status = RunStatus::Failed;
    state.pending.clear();
}

fn unknown_type(node: &Node) -> EngineError {
    EngineError::UnknownNodeType {
        node_id: node.id.clone(),
        node_type: node.node_type.to_string(),
    }
}

fn metadata(node: &Node, source: &str) -> Value {
    json!({"nodeId": node.id, "nodeType": node.node_type.as_str(), "source": source})
}

fn store_error(operation: &str, e: anyhow::Error) -> EngineError {
    EngineError::StoreUnavailable {
        operation: operation.to_string(),
        message: format!("{:#}", e),
    }
}

fn suspension_error(thread_id: &str, e: anyhow::Error) -> EngineError {
    EngineError::SuspensionWriteFailed {
        thread_id: thread_id.to_string(),
        message: format!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{database, SqliteCheckpointStore, SqliteSuspensionRegistry};
    use crate::workflow::storage::WorkflowStorage;
    use crate::workflow::types::{Edge, Workflow};

    async fn engine(workflow: Workflow) -> ExecutionEngine {
        let pool = database::connect_in_memory().await.unwrap();
        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone())));
        registry.insert(workflow).unwrap();
        ExecutionEngine::new(
            registry,
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(SqliteSuspensionRegistry::new(pool)),
            &EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn fan_out_runs_join_once() {
        let wf = Workflow {
            id: "fan".into(),
            name: "fan".into(),
            nodes: vec![
                Node::new("start", NodeType::Start, json!({})),
                Node::new("set-a", NodeType::SetState, json!({"values": {"a": 1}})),
                Node::new("set-b", NodeType::SetState, json!({"values": {"b": 2}})),
                Node::new("join", NodeType::Transform, json!({"expression": "{sum = a + b}"})),
            ],
            edges: vec![
                Edge::new("start", "set-a"),
                Edge::new("start", "set-b"),
                Edge::new("set-a", "join"),
                Edge::new("set-b", "join"),
            ],
        };
        let engine = engine(wf).await;
        let result = engine.start_run("fan", json!({}), Some("t-fan".into())).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, json!({"sum": 3}));
        assert_eq!(engine.history("t-fan", 100).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn events_are_ordered() {
        let wf = Workflow {
            id: "ev".into(),
            name: "ev".into(),
            nodes: vec![
                Node::new("start", NodeType::Start, json!({})),
                Node::new("end", NodeType::End, json!({})),
            ],
            edges: vec![Edge::new("start", "end")],
        };
        let engine = engine(wf).await;
        let mut events = engine.subscribe();
        engine.start_run("ev", json!({"x": 1}), Some("t-ev".into())).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            ["run_started", "node_started", "node_completed", "node_started", "node_completed", "run_completed"]
        );
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let wf = Workflow {
            id: "x".into(),
            name: "x".into(),
            nodes: vec![Node::new("start", NodeType::Start, json!({}))],
            edges: vec![],
        };
        let engine = engine(wf).await;
        let err = engine.start_run("missing", json!({}), None).await.unwrap_err();
        assert_eq!(err, EngineError::WorkflowNotFound { workflow_id: "missing".into() });
    }
}
