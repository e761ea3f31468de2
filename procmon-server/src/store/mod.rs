//! Snapshot store with SQLite persistence.
//!
//! Hosts own snapshots, snapshots own process rows; both relations cascade on
//! delete. A snapshot and all of its process rows are written in a single
//! transaction, so a failed ingestion leaves nothing behind.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::models::{Host, ProcessIn, ProcessRow, Snapshot};

pub mod migrations;

/// History length when the caller does not ask for one.
pub const DEFAULT_HISTORY_LIMIT: u32 = 10;

/// Rows per multi-row INSERT; keeps each statement under SQLite's bind limit.
const PROCESS_INSERT_CHUNK: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown host {0}")]
    HostNotFound(String),
    #[error("no snapshots found for {0}")]
    NoSnapshots(String),
    #[error("host {0} disappeared while being resolved")]
    HostVanished(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Snapshot head joined with one of its process rows (all `None` for an empty snapshot).
type HistoryRow = (i64, i64, Option<i64>, Option<i64>, Option<String>, Option<f64>, Option<f64>);

/// Transactional store for hosts, snapshots and process rows.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Opens (and creates if needed) the database file at `path`.
    #[instrument(skip(path))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening snapshot store at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// In-memory database for tests. A single connection keeps the
    /// database alive for the lifetime of the pool.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[instrument(skip(self))]
    pub async fn find_host(&self, hostname: &str) -> Result<Option<Host>, StoreError> {
        let row: Option<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, hostname, api_key FROM hosts WHERE hostname = ?")
                .bind(hostname)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, hostname, api_key)| Host { id, hostname, api_key }))
    }

    /// Returns the host record for `hostname`, creating it when unseen.
    ///
    /// Concurrent first sightings race on the `hostname` UNIQUE constraint;
    /// the loser re-reads the row the winner inserted.
    #[instrument(skip(self))]
    pub async fn resolve_host(&self, hostname: &str) -> Result<Host, StoreError> {
        if let Some(host) = self.find_host(hostname).await? {
            return Ok(host);
        }

        let inserted = sqlx::query("INSERT INTO hosts (hostname, api_key) VALUES (?, NULL)")
            .bind(hostname)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(result) => {
                info!(hostname, "Registered new host");
                Ok(Host {
                    id: result.last_insert_rowid(),
                    hostname: hostname.to_string(),
                    api_key: None,
                })
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!(hostname, "Host created concurrently, re-resolving");
                self.find_host(hostname)
                    .await?
                    .ok_or_else(|| StoreError::HostVanished(hostname.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists one snapshot with all its process rows, atomically.
    ///
    /// Returns the snapshot as committed; no read-back is needed.
    #[instrument(skip(self, host, processes), fields(hostname = %host.hostname, count = processes.len()))]
    pub async fn ingest(&self, host: &Host, processes: &[ProcessIn]) -> Result<Snapshot, StoreError> {
        let rows: Vec<ProcessRow> = processes.iter().map(ProcessIn::to_row).collect();
        let created_at = OffsetDateTime::now_utc();

        let mut tx = self.pool.begin().await?;

        let snapshot_id = sqlx::query("INSERT INTO snapshots (host_id, created_at) VALUES (?, ?)")
            .bind(host.id)
            .bind(to_nanos(created_at))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for chunk in rows.chunks(PROCESS_INSERT_CHUNK) {
            let mut insert = QueryBuilder::<Sqlite>::new(
                "INSERT INTO processes (snapshot_id, pid, ppid, name, cpu_percent, memory_mb) ",
            );
            insert.push_values(chunk, |mut b, row| {
                b.push_bind(snapshot_id)
                    .push_bind(row.pid)
                    .push_bind(row.ppid)
                    .push_bind(row.name.clone())
                    .push_bind(row.cpu_percent)
                    .push_bind(row.memory_mb);
            });
            insert.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!(snapshot_id, "Snapshot committed");
        Ok(Snapshot {
            id: snapshot_id,
            hostname: host.hostname.clone(),
            created_at,
            processes: rows,
        })
    }

    /// Most recent snapshot for `hostname`.
    #[instrument(skip(self))]
    pub async fn latest(&self, hostname: &str) -> Result<Snapshot, StoreError> {
        self.history(hostname, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NoSnapshots(hostname.to_string()))
    }

    /// Up to `limit` snapshots for `hostname`, newest first.
    #[instrument(skip(self))]
    pub async fn history(&self, hostname: &str, limit: u32) -> Result<Vec<Snapshot>, StoreError> {
        let host = self
            .find_host(hostname)
            .await?
            .ok_or_else(|| StoreError::HostNotFound(hostname.to_string()))?;

        // Bind count must not grow with `limit`: SQLite caps bind variables.
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT s.id, s.created_at, p.pid, p.ppid, p.name, p.cpu_percent, p.memory_mb \
             FROM (SELECT id, created_at FROM snapshots WHERE host_id = ? \
                   ORDER BY created_at DESC, id DESC LIMIT ?) AS s \
             LEFT JOIN processes p ON p.snapshot_id = s.id \
             ORDER BY s.created_at DESC, s.id DESC, p.id",
        )
        .bind(host.id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots: Vec<Snapshot> = Vec::new();
        let mut index: HashMap<i64, usize> = HashMap::new();
        for (id, created_at, pid, ppid, name, cpu_percent, memory_mb) in rows {
            let slot = match index.get(&id) {
                Some(&slot) => slot,
                None => {
                    snapshots.push(Snapshot {
                        id,
                        hostname: host.hostname.clone(),
                        created_at: from_nanos(created_at)?,
                        processes: Vec::new(),
                    });
                    index.insert(id, snapshots.len() - 1);
                    snapshots.len() - 1
                }
            };
            // pid is NOT NULL, so a null pid is the LEFT JOIN filler of an empty snapshot
            if let (Some(pid), Some(name)) = (pid, name) {
                snapshots[slot]
                    .processes
                    .push(ProcessRow { pid, ppid, name, cpu_percent, memory_mb });
            }
        }

        Ok(snapshots)
    }

    /// Every hostname the store knows, whether or not it ever ingested.
    #[instrument(skip(self))]
    pub async fn list_hosts(&self) -> Result<Vec<String>, StoreError> {
        let hosts: Vec<String> = sqlx::query_scalar("SELECT hostname FROM hosts ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;
        Ok(hosts)
    }

    /// Replaces the host's API key in a single statement.
    #[instrument(skip(self, api_key))]
    pub async fn set_api_key(&self, hostname: &str, api_key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE hosts SET api_key = ? WHERE hostname = ?")
            .bind(api_key)
            .bind(hostname)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::HostNotFound(hostname.to_string()));
        }
        Ok(())
    }

    /// Deletes a host; its snapshots and process rows go with it.
    #[instrument(skip(self))]
    pub async fn delete_host(&self, hostname: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM hosts WHERE hostname = ?")
            .bind(hostname)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::HostNotFound(hostname.to_string()));
        }
        warn!(hostname, "Host deleted with all snapshots");
        Ok(())
    }
}

fn to_nanos(ts: OffsetDateTime) -> i64 {
    // i64 nanoseconds cover timestamps up to the year 2262.
    ts.unix_timestamp_nanos() as i64
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| StoreError::Corrupt(format!("created_at {nanos}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_in(pid: i64, name: &str) -> ProcessIn {
        ProcessIn {
            pid,
            ppid: Some(1),
            name: name.to_string(),
            cpu_percent: Some(0.5),
            memory_mb: Some(12.0),
        }
    }

    async fn count(store: &SnapshotStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_host_creates_once() {
        let store = SnapshotStore::open_in_memory().await.unwrap();

        let first = store.resolve_host("h1").await.unwrap();
        let again = store.resolve_host("h1").await.unwrap();

        assert_eq!(first, again);
        assert_eq!(first.api_key, None);
        assert_eq!(store.list_hosts().await.unwrap(), vec!["h1".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_first_sighting_yields_one_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("procmon.db")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.resolve_host("racer").await }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(count(&store, "hosts").await, 1);
    }

    #[tokio::test]
    async fn test_ingest_returns_materialized_snapshot() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("h1").await.unwrap();

        let snap = store
            .ingest(&host, &[proc_in(100, "init"), proc_in(101, &"x".repeat(600))])
            .await
            .unwrap();

        assert_eq!(snap.hostname, "h1");
        assert_eq!(snap.processes.len(), 2);
        assert_eq!(snap.processes[1].name.chars().count(), 512);

        let stored = store.latest("h1").await.unwrap();
        assert_eq!(stored.id, snap.id);
        assert_eq!(stored.processes, snap.processes);
        assert_eq!(stored.created_at, snap.created_at);
    }

    #[tokio::test]
    async fn test_ingest_empty_process_list() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("idle").await.unwrap();

        let snap = store.ingest(&host, &[]).await.unwrap();

        assert!(snap.processes.is_empty());
        assert_eq!(count(&store, "snapshots").await, 1);
        assert_eq!(count(&store, "processes").await, 0);
    }

    #[tokio::test]
    async fn test_ingest_is_all_or_nothing() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("h1").await.unwrap();

        sqlx::query(
            "CREATE TRIGGER fail_mid_write BEFORE INSERT ON processes WHEN NEW.pid = 666 \
             BEGIN SELECT RAISE(ABORT, 'injected fault'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let batch: Vec<ProcessIn> = (1..=1500).map(|pid| proc_in(pid, "p")).chain([proc_in(666, "boom")]).collect();
        let result = store.ingest(&host, &batch).await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(count(&store, "snapshots").await, 0);
        assert_eq!(count(&store, "processes").await, 0);

        let ok = store.ingest(&host, &[proc_in(1, "fine")]).await.unwrap();
        assert_eq!(ok.processes.len(), 1);
        assert_eq!(count(&store, "processes").await, 1);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_bounded() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("h1").await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let snap = store.ingest(&host, &[proc_in(i, "p")]).await.unwrap();
            ids.push(snap.id);
        }

        let history = store.history("h1", 3).await.unwrap();
        let got: Vec<i64> = history.iter().map(|s| s.id).collect();
        let expected: Vec<i64> = ids.iter().rev().take(3).copied().collect();
        assert_eq!(got, expected);
        assert!(history.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(history[0].processes[0].pid, 4);

        assert_eq!(store.history("h1", 0).await.unwrap().len(), 0);
        assert_eq!(store.history("h1", 50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_history_limit_beyond_bind_variable_cap() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("busy").await.unwrap();

        sqlx::query(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 33000) \
             INSERT INTO snapshots (host_id, created_at) SELECT ?, i FROM n",
        )
        .bind(host.id)
        .execute(&store.pool)
        .await
        .unwrap();
        let newest = store.ingest(&host, &[proc_in(7, "fresh"), proc_in(8, "fresh")]).await.unwrap();

        let history = store.history("busy", 40_000).await.unwrap();

        assert_eq!(history.len(), 33_001);
        assert_eq!(history[0].id, newest.id);
        assert_eq!(history[0].processes, newest.processes);
        assert!(history[1..].iter().all(|s| s.processes.is_empty()));
        assert!(history.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(history.last().unwrap().created_at.unix_timestamp_nanos(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_process_order_per_snapshot() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let host = store.resolve_host("h1").await.unwrap();
        let first = store.ingest(&host, &[proc_in(3, "c"), proc_in(1, "a")]).await.unwrap();
        let empty = store.ingest(&host, &[]).await.unwrap();
        let last = store.ingest(&host, &[proc_in(9, "z"), proc_in(2, "b"), proc_in(5, "e")]).await.unwrap();

        let history = store.history("h1", 10).await.unwrap();

        let ids: Vec<i64> = history.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![last.id, empty.id, first.id]);
        assert_eq!(history[0].processes, last.processes);
        assert!(history[1].processes.is_empty());
        assert_eq!(history[2].processes, first.processes);
    }

    #[tokio::test]
    async fn test_history_is_per_host() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let a = store.resolve_host("a").await.unwrap();
        let b = store.resolve_host("b").await.unwrap();
        store.ingest(&a, &[proc_in(1, "a")]).await.unwrap();
        store.ingest(&b, &[proc_in(2, "b")]).await.unwrap();

        let history = store.history("a", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].processes[0].name, "a");
    }

    #[tokio::test]
    async fn test_latest_errors() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        assert!(matches!(store.latest("ghost").await, Err(StoreError::HostNotFound(_))));

        store.resolve_host("quiet").await.unwrap();
        assert!(matches!(store.latest("quiet").await, Err(StoreError::NoSnapshots(_))));
        assert!(store.history("quiet", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_api_key() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        store.resolve_host("h1").await.unwrap();

        store.set_api_key("h1", "k1").await.unwrap();
        store.set_api_key("h1", "k2").await.unwrap();

        let host = store.find_host("h1").await.unwrap().unwrap();
        assert_eq!(host.api_key.as_deref(), Some("k2"));
        assert!(matches!(store.set_api_key("nope", "k").await, Err(StoreError::HostNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_host_cascades() {
        let store = SnapshotStore::open_in_memory().await.unwrap();
        let keep = store.resolve_host("keep").await.unwrap();
        let gone = store.resolve_host("drop").await.unwrap();
        store.ingest(&keep, &[proc_in(1, "k")]).await.unwrap();
        store.ingest(&gone, &[proc_in(1, "d"), proc_in(2, "d")]).await.unwrap();
        store.ingest(&gone, &[proc_in(3, "d")]).await.unwrap();

        store.delete_host("drop").await.unwrap();

        assert_eq!(count(&store, "snapshots").await, 1);
        assert_eq!(count(&store, "processes").await, 1);
        assert_eq!(store.list_hosts().await.unwrap(), vec!["keep".to_string()]);
        assert!(matches!(store.delete_host("drop").await, Err(StoreError::HostNotFound(_))));
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("procmon.db");

        let store = SnapshotStore::open(&path).await.unwrap();
        let host = store.resolve_host("h1").await.unwrap();
        store.ingest(&host, &[proc_in(1, "init")]).await.unwrap();
        store.close().await;

        let reopened = SnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.latest("h1").await.unwrap().processes[0].name, "init");
    }
}
