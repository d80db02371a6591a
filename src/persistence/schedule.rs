/// Cron schedule storage
///
/// A schedule starts a fresh run of a workflow whenever its `next_run_at` has
/// passed. Advancing `next_run_at` is a compare-and-set on the previous value,
/// which is what keeps two overlapping ticks from firing the same occurrence.
use crate::persistence::{format_timestamp, parse_timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub workflow_id: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Accept classic five-field expressions by pinning seconds to zero
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Next occurrence of `expression` strictly after `after`
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = cron::Schedule::from_str(&normalize_cron(expression))
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))?;
    Ok(schedule.after(&after).next())
}

#[derive(Debug, Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

const COLUMNS: &str = "id, workflow_id, cron_expression, enabled, last_run_at, next_run_at, created_at";

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Schedule> {
    let last_run_at: Option<String> = row.try_get("last_run_at")?;
    let next_run_at: Option<String> = row.try_get("next_run_at")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        cron_expression: row.try_get("cron_expression")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_run_at: last_run_at.as_deref().map(parse_timestamp).transpose()?,
        next_run_at: next_run_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate the expression and store an enabled schedule
    pub async fn create(&self, workflow_id: &str, cron_expression: &str) -> Result<Schedule> {
        let now = Utc::now();
        let schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            cron_expression: cron_expression.trim().to_string(),
            enabled: true,
            last_run_at: None,
            next_run_at: next_fire(cron_expression, now)?,
            created_at: now,
        };

        sqlx::query(&format!("INSERT INTO schedules ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"))
            .bind(&schedule.id)
            .bind(&schedule.workflow_id)
            .bind(&schedule.cron_expression)
            .bind(1_i64)
            .bind(None::<String>)
            .bind(schedule.next_run_at.map(format_timestamp))
            .bind(format_timestamp(schedule.created_at))
            .execute(&self.pool)
            .await?;

        tracing::info!(
            "⏰ Created schedule {} for workflow {} ({}), next run at {:?}",
            schedule.id,
            schedule.workflow_id,
            schedule.cron_expression,
            schedule.next_run_at
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM schedules WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM schedules ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(from_row).collect()
    }

    /// Enabled schedules whose next fire time is at or before `now`
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM schedules WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ? ORDER BY next_run_at"
        ))
        .bind(format_timestamp(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(from_row).collect()
    }

    /// Enable or disable a schedule. Enabling recomputes the next fire time
    /// from now so missed occurrences are not replayed.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<Schedule>> {
        let Some(mut schedule) = self.get(id).await? else {
            return Ok(None);
        };
        schedule.enabled = enabled;
        if enabled {
            schedule.next_run_at = next_fire(&schedule.cron_expression, Utc::now())?;
        }

        sqlx::query("UPDATE schedules SET enabled = ?, next_run_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(schedule.next_run_at.map(format_timestamp))
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            "{} schedule {}",
            if enabled { "▶️ Enabled" } else { "⏹️ Disabled" },
            id
        );
        Ok(Some(schedule))
    }

    /// Commit one fired occurrence
    ///
    /// Moves `next_run_at` from `expected_next` to `new_next` and stamps
    /// `last_run_at`. Returns `false` if another ticker already advanced it.
    pub async fn advance(
        &self,
        id: &str,
        expected_next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET next_run_at = ?, last_run_at = ? WHERE id = ? AND next_run_at = ?",
        )
        .bind(new_next.map(format_timestamp))
        .bind(format_timestamp(fired_at))
        .bind(id)
        .bind(format_timestamp(expected_next))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
