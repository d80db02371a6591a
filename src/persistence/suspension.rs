/// Suspension registry
///
/// A thread that hit a `user-approval`, `webhook-wait` or `delay` node is
/// parked here together with the checkpoint it resumes from. Each thread has at
/// most one row. Resuming first *claims* the row (`parked -> resuming`) so that
/// two deliveries of the same event cannot both continue the run; the loser
/// sees no row and the delivery becomes a no-op.
use crate::persistence::{format_timestamp, parse_timestamp};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::fmt;
use std::str::FromStr;

/// What a parked thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Webhook,
    Approval,
    Timer,
}

impl WaitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitKind::Webhook => "webhook",
            WaitKind::Approval => "approval",
            WaitKind::Timer => "timer",
        }
    }
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(WaitKind::Webhook),
            "approval" => Ok(WaitKind::Approval),
            "timer" => Ok(WaitKind::Timer),
            other => Err(anyhow::anyhow!("unknown wait kind '{}'", other)),
        }
    }
}

/// The external event a suspended node is blocked on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingOn {
    #[serde(rename = "type")]
    pub kind: WaitKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl WaitingOn {
    pub fn webhook(id: impl Into<String>) -> Self {
        Self {
            kind: WaitKind::Webhook,
            id: id.into(),
            timeout_at: None,
        }
    }

    pub fn approval(id: impl Into<String>) -> Self {
        Self {
            kind: WaitKind::Approval,
            id: id.into(),
            timeout_at: None,
        }
    }

    pub fn timer(id: impl Into<String>, fire_at: DateTime<Utc>) -> Self {
        Self {
            kind: WaitKind::Timer,
            id: id.into(),
            timeout_at: Some(fire_at),
        }
    }

    pub fn with_timeout(mut self, timeout_at: Option<DateTime<Utc>>) -> Self {
        self.timeout_at = timeout_at;
        self
    }
}

/// A parked thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suspension {
    pub thread_id: String,
    pub waiting_on: WaitingOn,
    pub resume_checkpoint_id: String,
    /// Node that suspended; routing continues from here on resume
    pub node_id: String,
    /// Executor-supplied details (approval message, webhook path, ...)
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SuspensionRegistry: Send + Sync {
    /// Park a thread. Replaces any previous record for the same thread.
    async fn park(&self, suspension: &Suspension) -> Result<()>;

    /// Parked record of a thread, if any
    async fn get(&self, thread_id: &str) -> Result<Option<Suspension>>;

    async fn find_by_webhook(&self, webhook_id: &str) -> Result<Option<Suspension>>;

    async fn find_by_approval(&self, approval_id: &str) -> Result<Option<Suspension>>;

    /// Parked threads whose timer or timeout is at or before `now`
    async fn find_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Suspension>>;

    /// Atomically take ownership of a parked record. `None` if it is absent
    /// or already claimed by another resumer.
    async fn claim(&self, thread_id: &str) -> Result<Option<Suspension>>;

    /// Hand a claimed record back (the resume could not proceed)
    async fn release(&self, thread_id: &str) -> Result<()>;

    /// Remove the record. Returns whether one existed.
    async fn clear(&self, thread_id: &str) -> Result<bool>;
}

const STATUS_PARKED: &str = "parked";
const STATUS_RESUMING: &str = "resuming";

const COLUMNS: &str =
    "thread_id, waiting_type, waiting_id, timeout_at, resume_checkpoint_id, node_id, context, created_at";

/// SQLite-backed suspension registry
#[derive(Debug, Clone)]
pub struct SqliteSuspensionRegistry {
    pool: SqlitePool,
}

impl SqliteSuspensionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return records left in `resuming` by a crashed process to `parked`
    ///
    /// Only safe while no other process is resuming against the same database.
    pub async fn recover_claims(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE suspensions SET status = ? WHERE status = ?")
            .bind(STATUS_PARKED)
            .bind(STATUS_RESUMING)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(
                "♻️ Recovered {} suspension claims left by an interrupted resume",
                result.rows_affected()
            );
        }
        Ok(result.rows_affected())
    }

    async fn find_by(&self, kind: WaitKind, waiting_id: &str) -> Result<Option<Suspension>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM suspensions WHERE waiting_type = ? AND waiting_id = ? AND status = ? ORDER BY created_at LIMIT 1"
        ))
        .bind(kind.as_str())
        .bind(waiting_id)
        .bind(STATUS_PARKED)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(from_row).transpose()
    }
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Suspension> {
    let kind: String = row.try_get("waiting_type")?;
    let timeout_at: Option<String> = row.try_get("timeout_at")?;
    let context: String = row.try_get("context")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Suspension {
        thread_id: row.try_get("thread_id")?,
        waiting_on: WaitingOn {
            kind: kind.parse()?,
            id: row.try_get("waiting_id")?,
            timeout_at: timeout_at.as_deref().map(parse_timestamp).transpose()?,
        },
        resume_checkpoint_id: row.try_get("resume_checkpoint_id")?,
        node_id: row.try_get("node_id")?,
        context: serde_json::from_str(&context)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl SuspensionRegistry for SqliteSuspensionRegistry {
    async fn park(&self, suspension: &Suspension) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO suspensions
                (thread_id, waiting_type, waiting_id, timeout_at, resume_checkpoint_id, node_id, context, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                waiting_type = excluded.waiting_type,
                waiting_id = excluded.waiting_id,
                timeout_at = excluded.timeout_at,
                resume_checkpoint_id = excluded.resume_checkpoint_id,
                node_id = excluded.node_id,
                context = excluded.context,
                status = excluded.status,
                created_at = excluded.created_at
            "#,
        )
        .bind(&suspension.thread_id)
        .bind(suspension.waiting_on.kind.as_str())
        .bind(&suspension.waiting_on.id)
        .bind(suspension.waiting_on.timeout_at.map(format_timestamp))
        .bind(&suspension.resume_checkpoint_id)
        .bind(&suspension.node_id)
        .bind(serde_json::to_string(&suspension.context)?)
        .bind(STATUS_PARKED)
        .bind(format_timestamp(suspension.created_at))
        .execute(&self.pool)
        .await?;

        tracing::info!(
            "⏸️ Parked thread {} on {} '{}'",
            suspension.thread_id,
            suspension.waiting_on.kind,
            suspension.waiting_on.id
        );
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Suspension>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM suspensions WHERE thread_id = ? AND status = ?"
        ))
        .bind(thread_id)
        .bind(STATUS_PARKED)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(from_row).transpose()
    }

    async fn find_by_webhook(&self, webhook_id: &str) -> Result<Option<Suspension>> {
        self.find_by(WaitKind::Webhook, webhook_id).await
    }

    async fn find_by_approval(&self, approval_id: &str) -> Result<Option<Suspension>> {
        self.find_by(WaitKind::Approval, approval_id).await
    }

    async fn find_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Suspension>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM suspensions WHERE status = ? AND timeout_at IS NOT NULL AND timeout_at <= ? ORDER BY timeout_at"
        ))
        .bind(STATUS_PARKED)
        .bind(format_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(from_row).collect()
    }

    async fn claim(&self, thread_id: &str) -> Result<Option<Suspension>> {
        let row = sqlx::query(&format!(
            "UPDATE suspensions SET status = ? WHERE thread_id = ? AND status = ? RETURNING {COLUMNS}"
        ))
        .bind(STATUS_RESUMING)
        .bind(thread_id)
        .bind(STATUS_PARKED)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(from_row).transpose()
    }

    async fn release(&self, thread_id: &str) -> Result<()> {
        sqlx::query("UPDATE suspensions SET status = ? WHERE thread_id = ? AND status = ?")
            .bind(STATUS_PARKED)
            .bind(thread_id)
            .bind(STATUS_RESUMING)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self, thread_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM suspensions WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::database::connect_in_memory;
    use serde_json::json;

    fn parked(thread: &str, waiting_on: WaitingOn) -> Suspension {
        Suspension {
            thread_id: thread.into(),
            waiting_on,
            resume_checkpoint_id: "cp-1".into(),
            node_id: "wait".into(),
            context: json!({"message": "please review"}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lookup_by_webhook_and_approval() {
        let registry = SqliteSuspensionRegistry::new(connect_in_memory().await.unwrap());
        registry.park(&parked("t1", WaitingOn::webhook("hook-1"))).await.unwrap();
        registry.park(&parked("t2", WaitingOn::approval("appr-1"))).await.unwrap();

        let hook = registry.find_by_webhook("hook-1").await.unwrap().unwrap();
        assert_eq!(hook.thread_id, "t1");
        assert_eq!(hook.context["message"], "please review");
        assert!(registry.find_by_webhook("appr-1").await.unwrap().is_none());
        assert_eq!(
            registry.find_by_approval("appr-1").await.unwrap().unwrap().thread_id,
            "t2"
        );
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let registry = SqliteSuspensionRegistry::new(connect_in_memory().await.unwrap());
        registry.park(&parked("t1", WaitingOn::approval("a"))).await.unwrap();

        assert!(registry.claim("t1").await.unwrap().is_some());
        assert!(registry.claim("t1").await.unwrap().is_none());
        // Claimed records are invisible to lookups
        assert!(registry.find_by_approval("a").await.unwrap().is_none());

        registry.release("t1").await.unwrap();
        assert!(registry.claim("t1").await.unwrap().is_some());
        assert!(registry.clear("t1").await.unwrap());
        assert!(!registry.clear("t1").await.unwrap());
    }

    #[tokio::test]
    async fn due_timers_include_expired_timeouts_only() {
        let registry = SqliteSuspensionRegistry::new(connect_in_memory().await.unwrap());
        let now = Utc::now();
        registry
            .park(&parked("due", WaitingOn::timer("d", now - chrono::Duration::seconds(1))))
            .await
            .unwrap();
        registry
            .park(&parked("later", WaitingOn::timer("l", now + chrono::Duration::hours(1))))
            .await
            .unwrap();
        registry
            .park(&parked(
                "expired",
                WaitingOn::approval("x").with_timeout(Some(now - chrono::Duration::seconds(5))),
            ))
            .await
            .unwrap();
        registry.park(&parked("open", WaitingOn::webhook("w"))).await.unwrap();

        let due: Vec<String> = registry
            .find_due_timers(now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.thread_id)
            .collect();
        assert_eq!(due, vec!["expired".to_string(), "due".to_string()]);
    }

    #[tokio::test]
    async fn recover_claims_reparks() {
        let registry = SqliteSuspensionRegistry::new(connect_in_memory().await.unwrap());
        registry.park(&parked("t1", WaitingOn::webhook("h"))).await.unwrap();
        registry.claim("t1").await.unwrap();
        assert_eq!(registry.recover_claims().await.unwrap(), 1);
        assert!(registry.get("t1").await.unwrap().is_some());
    }
}
