/// Append-only checkpoint store
///
/// Every node step of a run writes one immutable snapshot. Snapshots of a
/// thread form a single parent-linked chain; the `threads` table keeps the
/// head of that chain so `get_latest` is an indexed point lookup, and the head
/// update doubles as the compare-and-set that keeps two writers from forking
/// the same thread.
use crate::persistence::{format_timestamp, parse_timestamp};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::fmt;

/// Persisted snapshot of run state after one node step
///
/// The JSON shape is part of the storage contract and must stay stable:
/// `{threadId, checkpointId, parentCheckpointId, checkpoint, metadata, createdAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// Opaque serialized run state
    pub checkpoint: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        thread_id: impl Into<String>,
        parent_checkpoint_id: Option<String>,
        checkpoint: Value,
        metadata: Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            parent_checkpoint_id,
            checkpoint,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// A write whose parent is no longer the head of the thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConflict {
    pub thread_id: String,
    pub expected_parent: Option<String>,
}

impl fmt::Display for CheckpointConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected_parent {
            Some(parent) => write!(
                f,
                "thread '{}' head moved past '{}' (concurrent writer)",
                self.thread_id, parent
            ),
            None => write!(f, "thread '{}' already has checkpoints", self.thread_id),
        }
    }
}

impl std::error::Error for CheckpointConflict {}

/// Durable `(threadId, checkpointId) -> snapshot` persistence
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. Fails with [`CheckpointConflict`] if its parent is
    /// not the current head of the thread. Returns only once the write is durable.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Most recent checkpoint of a thread
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>>;

    /// Checkpoints of a thread, most recent first
    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>>;
}

/// SQLite-backed checkpoint store
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
        let checkpoint: String = row.try_get("checkpoint")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(Checkpoint {
            thread_id: row.try_get("thread_id")?,
            checkpoint_id: row.try_get("checkpoint_id")?,
            parent_checkpoint_id: row.try_get("parent_checkpoint_id")?,
            checkpoint: serde_json::from_str(&checkpoint)?,
            metadata: serde_json::from_str(&metadata)?,
            created_at: parse_timestamp(&created_at)?,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let created_at = format_timestamp(checkpoint.created_at);
        let mut tx = self.pool.begin().await?;

        // Moving the head is the commit point: a stale parent loses here.
        let head_moved = match &checkpoint.parent_checkpoint_id {
            None => sqlx::query(
                r#"
                INSERT INTO threads (thread_id, head_checkpoint_id, checkpoint_count, created_at, updated_at)
                VALUES (?, ?, 1, ?, ?)
                ON CONFLICT(thread_id) DO NOTHING
                "#,
            )
            .bind(&checkpoint.thread_id)
            .bind(&checkpoint.checkpoint_id)
            .bind(&created_at)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(parent) => sqlx::query(
                r#"
                UPDATE threads
                SET head_checkpoint_id = ?, checkpoint_count = checkpoint_count + 1, updated_at = ?
                WHERE thread_id = ? AND head_checkpoint_id = ?
                "#,
            )
            .bind(&checkpoint.checkpoint_id)
            .bind(&created_at)
            .bind(&checkpoint.thread_id)
            .bind(parent)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if head_moved == 0 {
            tx.rollback().await?;
            return Err(anyhow::Error::new(CheckpointConflict {
                thread_id: checkpoint.thread_id.clone(),
                expected_parent: checkpoint.parent_checkpoint_id.clone(),
            }));
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints
                (thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.parent_checkpoint_id)
        .bind(serde_json::to_string(&checkpoint.checkpoint)?)
        .bind(serde_json::to_string(&checkpoint.metadata)?)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "💾 Checkpoint {} saved for thread {} (parent: {:?})",
            checkpoint.checkpoint_id,
            checkpoint.thread_id,
            checkpoint.parent_checkpoint_id
        );
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT c.thread_id, c.checkpoint_id, c.parent_checkpoint_id, c.checkpoint, c.metadata, c.created_at
            FROM threads t
            JOIN checkpoints c
              ON c.thread_id = t.thread_id AND c.checkpoint_id = t.head_checkpoint_id
            WHERE t.thread_id = ?
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at
            FROM checkpoints
            WHERE thread_id = ? AND checkpoint_id = ?
            "#,
        )
        .bind(thread_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at
            FROM checkpoints
            WHERE thread_id = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }
}
