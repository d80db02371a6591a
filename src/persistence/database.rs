/// SQLite connection setup and schema bootstrap
///
/// One pool backs workflows, checkpoints, suspensions and schedules. The
/// journal runs in WAL mode with `synchronous=FULL` so a checkpoint that has
/// been acknowledged survives a crash or power loss.
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;

/// Open (creating if missing) the database at `url` and initialise the schema
pub async fn connect(url: &str) -> Result<SqlitePool> {
    if url.contains(":memory:") {
        tracing::warn!("⚠️ Using an in-memory database; runs will not survive a restart");
        return connect_in_memory().await;
    }

    if let Some(path) = url
        .strip_prefix("sqlite://")
        .filter(|p| !p.starts_with(':'))
    {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                })?;
            }
        }
    }

    tracing::info!("🗄️ Opening database: {}", url);

    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and ephemeral runs
///
/// Pinned to a single connection that never idles out, otherwise each pooled
/// connection would see its own empty database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create every table and index. Safe to call multiple times.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            definition TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            thread_id TEXT PRIMARY KEY,
            head_checkpoint_id TEXT NOT NULL,
            checkpoint_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            parent_checkpoint_id TEXT,
            checkpoint TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (thread_id, checkpoint_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_seq ON checkpoints(thread_id, seq DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS suspensions (
            thread_id TEXT PRIMARY KEY,
            waiting_type TEXT NOT NULL,
            waiting_id TEXT NOT NULL,
            timeout_at TEXT,
            resume_checkpoint_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            context TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_suspensions_waiting ON suspensions(waiting_type, waiting_id)",
        "CREATE INDEX IF NOT EXISTS idx_suspensions_timeout ON suspensions(timeout_at)",
        r#"
        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            next_run_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::debug!("✅ Database schema ready");
    Ok(())
}
