/// Durable state of the engine
///
/// Everything a run needs to survive a restart lives here: the append-only
/// checkpoint chain, the registry of parked threads and the cron schedules
/// that start new runs. All stores share one SQLite pool.

// Connection setup and schema bootstrap
pub mod database;

// Append-only checkpoint chain per thread
pub mod checkpoint;

// Threads parked on webhooks, approvals and timers
pub mod suspension;

// Cron schedules driving new runs
pub mod schedule;

pub use checkpoint::{Checkpoint, CheckpointConflict, CheckpointStore, SqliteCheckpointStore};
pub use schedule::{Schedule, ScheduleStore};
pub use suspension::{SqliteSuspensionRegistry, Suspension, SuspensionRegistry, WaitKind, WaitingOn};

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC timestamp, so stored values compare correctly as text
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
