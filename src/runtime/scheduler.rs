/// Background cron scheduler service
///
/// Two tokio-cron-scheduler jobs drive the engine from the outside: a tick
/// that starts runs for every due schedule, and a sweep that resumes threads
/// whose timer fired or whose wait timed out.
///
/// A schedule occurrence is committed by the compare-and-set on its
/// `next_run_at`; it is only advanced after the run was dispatched. Each
/// occurrence maps to a deterministic thread id, so a ticker that finds the
/// thread already started just commits the advance instead of firing again.
use crate::config::SchedulerConfig;
use crate::persistence::schedule::next_fire;
use crate::persistence::{Schedule, ScheduleStore};
use crate::runtime::engine::ExecutionEngine;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

const TICK_JOB: &str = "schedule-tick";
const SWEEP_JOB: &str = "timer-sweep";

/// Dispatches due schedules and timers; shared with the cron jobs
#[derive(Debug)]
pub struct ScheduleDispatcher {
    schedules: ScheduleStore,
    engine: Arc<ExecutionEngine>,
    /// Schedules being dispatched by this process right now
    in_flight: Mutex<HashSet<String>>,
}

impl ScheduleDispatcher {
    pub fn new(schedules: ScheduleStore, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            schedules,
            engine,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Start a run for every schedule due at `now`; returns how many fired
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.schedules.due(now).await?;
        let mut fired = 0;

        for schedule in due {
            let Some(expected) = schedule.next_run_at else {
                continue;
            };
            let claimed = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(schedule.id.clone());
            if !claimed {
                tracing::debug!("⏭️ Schedule {} is already being dispatched", schedule.id);
                continue;
            }

            let outcome = self.fire(&schedule, expected, now).await;
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&schedule.id);

            match outcome {
                Ok(true) => fired += 1,
                Ok(false) => tracing::debug!("⏭️ Schedule {} was advanced by another ticker", schedule.id),
                Err(e) => tracing::error!("❌ Schedule {} dispatch failed: {:#}", schedule.id, e),
            }
        }
        Ok(fired)
    }

    async fn fire(&self, schedule: &Schedule, expected: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let thread_id = format!("schedule_{}_{}", schedule.id, expected.timestamp_millis());

        if self.engine.state(&thread_id).await?.is_none() {
            tracing::info!("🔔 Schedule {} fired for workflow {}", schedule.id, schedule.workflow_id);
            let input = json!({
                "source": "schedule",
                "scheduleId": schedule.id,
                "cron": schedule.cron_expression,
                "timestamp": now.to_rfc3339(),
            });

            let result = self
                .engine
                .start_run(&schedule.workflow_id, input, Some(thread_id))
                .await?;
            if result.status.is_terminal() {
                tracing::info!(
                    "✅ Cron-triggered workflow {} ended as {:?} (thread {})",
                    schedule.workflow_id,
                    result.status,
                    result.thread_id
                );
            } else {
                tracing::info!(
                    "⏸️ Cron-triggered workflow {} parked on thread {}",
                    schedule.workflow_id,
                    result.thread_id
                );
            }
        } else {
            tracing::debug!("⏭️ Occurrence {} already dispatched; committing advance", thread_id);
        }

        let new_next = next_fire(&schedule.cron_expression, now)?;
        self.schedules.advance(&schedule.id, expected, now, new_next).await
    }

    /// Resume threads whose timer or timeout is due
    pub async fn sweep_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let resumed = self.engine.resume_due_timers(now).await?;
        if !resumed.is_empty() {
            tracing::info!("⏰ Resumed {} timed thread(s)", resumed.len());
        }
        Ok(resumed.len())
    }
}

/// Owns the cron jobs that call into a [`ScheduleDispatcher`]
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>, // Track job UUIDs for proper removal
    dispatcher: Arc<ScheduleDispatcher>,
    config: SchedulerConfig,
}

impl CronSchedulerService {
    pub async fn new(dispatcher: Arc<ScheduleDispatcher>, config: SchedulerConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            dispatcher,
            config,
        })
    }

    pub fn dispatcher(&self) -> &Arc<ScheduleDispatcher> {
        &self.dispatcher
    }

    /// Register the tick and sweep jobs and start the scheduler
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("⏸️ Scheduler disabled by configuration");
            return Ok(());
        }
        tracing::info!("⏰ Starting cron scheduler service");

        let dispatcher = Arc::clone(&self.dispatcher);
        let tick = Job::new_async(self.config.tick.as_str(), move |_uuid, _l| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                if let Err(e) = dispatcher.run_due_schedules(Utc::now()).await {
                    tracing::error!("❌ Schedule tick failed: {:#}", e);
                }
            })
        })?;
        self.add_job(TICK_JOB, tick).await?;

        let dispatcher = Arc::clone(&self.dispatcher);
        let sweep = Job::new_async(self.config.timer_sweep.as_str(), move |_uuid, _l| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                if let Err(e) = dispatcher.sweep_timers(Utc::now()).await {
                    tracing::error!("❌ Timer sweep failed: {:#}", e);
                }
            })
        })?;
        self.add_job(SWEEP_JOB, sweep).await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!(
            "✅ Cron scheduler started (tick: {}, sweep: {})",
            self.config.tick,
            self.config.timer_sweep
        );
        Ok(())
    }

    /// Stop the scheduler
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");

        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.clear();
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Add a job, replacing any job previously registered under `name`
    async fn add_job(&self, name: &str, job: Job) -> Result<()> {
        let mut job_uuid_map = self.job_uuid_map.write().await;
        let scheduler = self.scheduler.read().await;

        if let Some(old) = job_uuid_map.remove(name) {
            if let Err(e) = scheduler.remove(&old).await {
                tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", name, e);
            }
        }

        let uuid = scheduler.add(job).await?;
        job_uuid_map.insert(name.to_string(), uuid);
        tracing::debug!("📝 Registered job {} ({})", name, uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::persistence::{database, SqliteCheckpointStore, SqliteSuspensionRegistry};
    use crate::workflow::registry::WorkflowRegistry;
    use crate::workflow::storage::WorkflowStorage;
    use crate::workflow::types::{Edge, Node, NodeType, Workflow};

    async fn dispatcher() -> (Arc<ScheduleDispatcher>, ScheduleStore, Arc<ExecutionEngine>) {
        let pool = database::connect_in_memory().await.unwrap();
        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone())));
        registry
            .insert(Workflow {
                id: "nightly".into(),
                name: "nightly".into(),
                nodes: vec![
                    Node::new("start", NodeType::Start, json!({})),
                    Node::new("end", NodeType::End, json!({})),
                ],
                edges: vec![Edge::new("start", "end")],
            })
            .unwrap();
        let engine = Arc::new(ExecutionEngine::new(
            registry,
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(SqliteSuspensionRegistry::new(pool.clone())),
            &EngineConfig::default(),
        ));
        let store = ScheduleStore::new(pool);
        (
            Arc::new(ScheduleDispatcher::new(store.clone(), engine.clone())),
            store,
            engine,
        )
    }

    #[tokio::test]
    async fn overlapping_ticks_fire_once() {
        let (dispatcher, store, engine) = dispatcher().await;
        let schedule = store.create("nightly", "0 3 * * *").await.unwrap();
        let due_at = schedule.next_run_at.unwrap();
        let now = due_at + chrono::Duration::seconds(1);

        let (a, b) = tokio::join!(dispatcher.run_due_schedules(now), dispatcher.run_due_schedules(now));
        assert_eq!(a.unwrap() + b.unwrap(), 1);
        assert_eq!(dispatcher.run_due_schedules(now).await.unwrap(), 0);

        let thread_id = format!("schedule_{}_{}", schedule.id, due_at.timestamp_millis());
        let state = engine.state(&thread_id).await.unwrap().unwrap();
        assert_eq!(state.input["source"], "schedule");
        assert_eq!(state.input["scheduleId"], schedule.id.as_str());

        let advanced = store.get(&schedule.id).await.unwrap().unwrap();
        assert!(advanced.next_run_at.unwrap() > now);
        assert_eq!(advanced.last_run_at, Some(now));
    }

    #[tokio::test]
    async fn missing_workflow_does_not_advance() {
        let (dispatcher, store, _engine) = dispatcher().await;
        let schedule = store.create("gone", "*/5 * * * *").await.unwrap();
        let due_at = schedule.next_run_at.unwrap();

        assert_eq!(dispatcher.run_due_schedules(due_at).await.unwrap(), 0);
        let unchanged = store.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(unchanged.next_run_at, Some(due_at));
    }
}
