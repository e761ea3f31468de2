//! Database migrations.

use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::StoreError;

const SCHEMA_VERSION: i64 = 1;

const V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL UNIQUE,
        api_key TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_snapshots_host_created ON snapshots(host_id, created_at DESC, id DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS processes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id INTEGER NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
        pid INTEGER NOT NULL,
        ppid INTEGER,
        name TEXT NOT NULL,
        cpu_percent REAL,
        memory_mb REAL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_processes_snapshot ON processes(snapshot_id)",
    "CREATE INDEX IF NOT EXISTS idx_processes_pid_ppid ON processes(pid, ppid)",
];

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    if current >= SCHEMA_VERSION {
        info!(version = current, "Database schema is up to date");
        return Ok(());
    }

    info!(from = current, to = SCHEMA_VERSION, "Migrating database");

    if current < 1 {
        apply(pool, 1, V1).await?;
    }

    Ok(())
}

async fn apply(pool: &SqlitePool, version: i64, statements: &[&str]) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(version, "Applied schema migration");
    Ok(())
}
