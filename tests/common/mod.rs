#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use intentflow::capabilities::Capabilities;
use intentflow::config::EngineConfig;
use intentflow::persistence::{
    database, Checkpoint, CheckpointStore, SqliteCheckpointStore, SqliteSuspensionRegistry,
};
use intentflow::workflow::{Edge, Node, NodeType, Workflow, WorkflowRegistry, WorkflowStorage};
use intentflow::runtime::ExecutorRegistry;
use intentflow::ExecutionEngine;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

pub struct Harness {
    pub pool: SqlitePool,
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<ExecutionEngine>,
}

pub fn workflow(id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    Workflow {
        id: id.into(),
        name: id.into(),
        nodes,
        edges,
    }
}

pub fn node(id: &str, node_type: NodeType, config: Value) -> Node {
    Node::new(id, node_type, config)
}

pub fn edge(source: &str, target: &str) -> Edge {
    Edge::new(source, target)
}

pub fn handle(source: &str, handle: &str, target: &str) -> Edge {
    Edge::from_handle(source, handle, target)
}

pub async fn harness(workflows: Vec<Workflow>) -> Harness {
    harness_with(workflows, Capabilities::default(), EngineConfig::default()).await
}

pub async fn harness_with(workflows: Vec<Workflow>, capabilities: Capabilities, config: EngineConfig) -> Harness {
    let pool = database::connect_in_memory().await.unwrap();
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::new(pool.clone()));
    build(pool, workflows, checkpoints, capabilities, config)
}

/// Harness running a caller-supplied executor registry
pub async fn harness_with_executors(workflows: Vec<Workflow>, executors: ExecutorRegistry) -> Harness {
    let mut h = harness(workflows).await;
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::new(h.pool.clone()));
    h.engine = Arc::new(
        ExecutionEngine::new(
            h.registry.clone(),
            checkpoints,
            Arc::new(SqliteSuspensionRegistry::new(h.pool.clone())),
            &EngineConfig::default(),
        )
        .with_executors(executors),
    );
    h
}

/// Harness whose checkpoint writes start failing after `ok_writes` saves
pub async fn harness_with_failing_store(workflows: Vec<Workflow>, ok_writes: usize) -> Harness {
    let pool = database::connect_in_memory().await.unwrap();
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(FailingCheckpointStore {
        inner: SqliteCheckpointStore::new(pool.clone()),
        remaining: AtomicUsize::new(ok_writes),
    });
    build(pool, workflows, checkpoints, Capabilities::default(), EngineConfig::default())
}

fn build(
    pool: SqlitePool,
    workflows: Vec<Workflow>,
    checkpoints: Arc<dyn CheckpointStore>,
    capabilities: Capabilities,
    config: EngineConfig,
) -> Harness {
    let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone())));
    for wf in workflows {
        registry.insert(wf).unwrap();
    }
    let engine = Arc::new(
        ExecutionEngine::new(
            registry.clone(),
            checkpoints,
            Arc::new(SqliteSuspensionRegistry::new(pool.clone())),
            &config,
        )
        .with_capabilities(capabilities),
    );
    Harness { pool, registry, engine }
}

impl Harness {
    pub async fn checkpoint_count(&self, thread_id: &str) -> usize {
        self.engine.history(thread_id, 10_000).await.unwrap().len()
    }

    /// Every checkpoint's parent is the one written before it
    pub async fn assert_chain_intact(&self, thread_id: &str) {
        let history = self.engine.history(thread_id, 10_000).await.unwrap();
        assert!(!history.is_empty(), "thread {} has no checkpoints", thread_id);
        for pair in history.windows(2) {
            assert_eq!(
                pair[0].parent_checkpoint_id.as_deref(),
                Some(pair[1].checkpoint_id.as_str()),
                "broken chain in thread {}",
                thread_id
            );
        }
        assert_eq!(history.last().unwrap().parent_checkpoint_id, None);
    }
}

pub struct FailingCheckpointStore {
    inner: SqliteCheckpointStore,
    remaining: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for FailingCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(anyhow::anyhow!("disk I/O error"));
        }
        self.inner.save(checkpoint).await
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.get_latest(thread_id).await
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.get(thread_id, checkpoint_id).await
    }

    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>> {
        self.inner.list(thread_id, limit).await
    }
}
