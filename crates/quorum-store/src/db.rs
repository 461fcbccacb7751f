// Store Module
// Pooled SQLite connections with scoped, savepoint-nested transactions.

use std::cell::Cell;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{StoreError, StoreResult};
use crate::schema;

/// Transient busy/locked errors are retried this many times per transaction.
const MAX_TXN_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 25;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_size: usize,
    pub init_schema: bool,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool_size: 4,
            init_schema: true,
        }
    }
}

struct StoreInner {
    path: PathBuf,
    conns: StdMutex<Vec<Connection>>,
    sem: Arc<Semaphore>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Best-effort checkpoint on unexpected teardown; close() does the
        // same deliberately.
        if let Ok(mut conns) = self.conns.lock() {
            if let Some(conn) = conns.pop() {
                let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
            }
        }
    }
}

/// Process-wide handle to the embedded database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open the pool and initialize the schema (idempotently, inside one
    /// transaction) at first acquisition.
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool_size = config.pool_size.max(1);
        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            conns.push(open_connection(&config.path)?);
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                path: config.path.clone(),
                conns: StdMutex::new(conns),
                sem: Arc::new(Semaphore::new(pool_size)),
            }),
        };

        if config.init_schema {
            store
                .transaction(|scope| schema::init_schema(scope.conn()))
                .await?;
        }

        tracing::debug!(
            target: "quorum.store",
            path = %config.path.display(),
            pool_size,
            "store opened"
        );
        Ok(store)
    }

    /// In-memory-file store for tests and ephemeral runs.
    pub async fn open_at(path: &Path) -> StoreResult<Self> {
        Self::open(&StoreConfig::at(path)).await
    }

    /// Acquire a pooled connection. Suspends while the pool is exhausted.
    pub async fn connect(&self) -> StoreResult<PooledConn> {
        let permit = self
            .inner
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let conn = {
            let mut conns = self.inner.conns.lock().map_err(|_| StoreError::Closed)?;
            conns.pop()
        };
        let conn = match conn {
            Some(conn) => conn,
            // The pool was drained by close(); reopen lazily.
            None => open_connection(&self.inner.path)?,
        };
        Ok(PooledConn {
            conn: Some(conn),
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Run `f` with a pooled connection, outside any transaction.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.connect().await?;
        f(&conn)
    }

    /// Run `f` inside a scoped transaction.
    ///
    /// The outermost call begins a transaction, commits on `Ok` and rolls
    /// back on `Err`; the connection returns to the pool on every exit path.
    /// Nested transactional work goes through [`TxnScope::nested`], which
    /// uses uniquely named savepoints. Transient busy/locked failures retry
    /// the whole block a bounded number of times.
    pub async fn transaction<T>(
        &self,
        mut f: impl FnMut(&TxnScope<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.connect().await?;
        let mut attempt = 0u32;
        loop {
            match run_txn(&conn, &mut f) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < MAX_TXN_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        target: "quorum.store",
                        attempt,
                        "transient transaction failure, retrying: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Checkpoint the WAL and drain the pool.
    pub async fn close(&self) -> StoreResult<()> {
        let _permit = self
            .inner
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let mut conns = self.inner.conns.lock().map_err(|_| StoreError::Closed)?;
        if let Some(conn) = conns.first() {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        conns.clear();
        tracing::debug!(target: "quorum.store", "store closed");
        Ok(())
    }
}

fn run_txn<T>(
    conn: &Connection,
    f: &mut impl FnMut(&TxnScope<'_>) -> StoreResult<T>,
) -> StoreResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let scope = TxnScope {
        conn,
        depth: Cell::new(0),
    };
    match f(&scope) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

/// Ambient transaction context handed to transactional blocks. Nested calls
/// discover the active connection and depth through this handle instead of
/// any global.
pub struct TxnScope<'c> {
    conn: &'c Connection,
    depth: Cell<u32>,
}

impl TxnScope<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Run `f` inside a uniquely named savepoint. A failing block rolls back
    /// to its savepoint only; the enclosing transaction continues.
    pub fn nested<T>(
        &self,
        f: impl FnOnce(&TxnScope<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let depth = self.depth.get() + 1;
        let name = format!("sp_{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        let scope = TxnScope {
            conn: self.conn,
            depth: Cell::new(depth),
        };
        match f(&scope) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
                ));
                Err(err)
            }
        }
    }
}

/// Connection guard; returns the connection to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    inner: Arc<StoreInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut conns) = self.inner.conns.lock() {
                conns.push(conn);
            }
        }
    }
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(10))?;
    // WAL gives concurrent readers alongside the single writer.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous = NORMAL", [])?;
    Ok(conn)
}

/// Timestamps are stored as RFC 3339 text.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::InvalidRow(format!("bad timestamp {raw:?}: {err}")))
}

/// f32 vectors are stored as little-endian blobs.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn blob_to_vector(blob: &[u8]) -> StoreResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidRow(format!(
            "embedding blob length {} not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn transaction_commits_on_ok() {
        let (store, _dir) = open_store().await;
        store
            .transaction(|scope| {
                scope.conn().execute(
                    "INSERT INTO project_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params!["k", "{}", ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM project_config", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_err() {
        let (store, _dir) = open_store().await;
        let result: StoreResult<()> = store
            .transaction(|scope| {
                scope.conn().execute(
                    "INSERT INTO project_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params!["k", "{}", ts(Utc::now())],
                )?;
                Err(StoreError::InvalidRow("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM project_config", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn nested_failure_rolls_back_to_savepoint_only() {
        let (store, _dir) = open_store().await;
        store
            .transaction(|scope| {
                scope.conn().execute(
                    "INSERT INTO project_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params!["outer", "{}", ts(Utc::now())],
                )?;
                let nested: StoreResult<()> = scope.nested(|inner| {
                    inner.conn().execute(
                        "INSERT INTO project_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                        rusqlite::params!["inner", "{}", ts(Utc::now())],
                    )?;
                    Err(StoreError::InvalidRow("inner failure".into()))
                });
                assert!(nested.is_err());
                Ok(())
            })
            .await
            .unwrap();

        let keys: Vec<String> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT key FROM project_config ORDER BY key")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .unwrap();
        assert_eq!(keys, vec!["outer".to_string()]);
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open_at(&path).await.unwrap();
        store.close().await.unwrap();
        // Reopening against the same file must not fail.
        let store = Store::open_at(&path).await.unwrap();
        store.close().await.unwrap();
    }

    #[test]
    fn vector_blob_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob_to_vector(&blob).unwrap(), vector);
        assert!(blob_to_vector(&blob[..5]).is_err());
    }
}
