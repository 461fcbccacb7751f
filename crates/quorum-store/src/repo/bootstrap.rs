use chrono::Utc;
use rusqlite::params;

use quorum_types::{BootstrapEntry, BootstrapStatus};

use crate::db::{ts, Store};
use crate::error::{StoreError, StoreResult};

/// Aggregate view of a bootstrap run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Store-backed progress rows; progress survives restarts.
#[derive(Clone)]
pub struct BootstrapRepo {
    store: Store,
}

impl BootstrapRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Replace any prior pending/processing state with a fresh PENDING set.
    /// Completed and failed rows for other paths are left alone.
    pub async fn init_progress(&self, paths: &[String]) -> StoreResult<()> {
        let paths = paths.to_vec();
        self.store
            .transaction(move |scope| {
                let conn = scope.conn();
                conn.execute(
                    "DELETE FROM bootstrap_progress WHERE status IN ('pending', 'processing')",
                    [],
                )?;
                let now = ts(Utc::now());
                for path in &paths {
                    conn.execute(
                        "INSERT INTO bootstrap_progress (path, status, last_error, updated_at)
                         VALUES (?1, 'pending', NULL, ?2)
                         ON CONFLICT(path) DO UPDATE SET
                            status = 'pending',
                            last_error = NULL,
                            updated_at = excluded.updated_at",
                        params![path, now],
                    )?;
                }
                Ok(())
            })
            .await
    }

    pub async fn mark(
        &self,
        path: &str,
        status: BootstrapStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let path = path.to_string();
        let error = error.map(String::from);
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO bootstrap_progress (path, status, last_error, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(path) DO UPDATE SET
                        status = excluded.status,
                        last_error = excluded.last_error,
                        updated_at = excluded.updated_at",
                    params![path, status.as_str(), error, ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn entries(&self) -> StoreResult<Vec<BootstrapEntry>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, status, last_error FROM bootstrap_progress ORDER BY path",
                )?;
                let rows = stmt.query_map([], |row| {
                    let path: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let last_error: Option<String> = row.get(2)?;
                    Ok((path, status, last_error))
                })?;
                let mut entries = Vec::new();
                for row in rows {
                    let (path, status, last_error) = row?;
                    let status = BootstrapStatus::parse(&status).ok_or_else(|| {
                        StoreError::InvalidRow(format!("unknown bootstrap status {status:?}"))
                    })?;
                    entries.push(BootstrapEntry {
                        path,
                        status,
                        last_error,
                    });
                }
                Ok(entries)
            })
            .await
    }

    pub async fn counts(&self) -> StoreResult<BootstrapCounts> {
        let entries = self.entries().await?;
        let mut counts = BootstrapCounts {
            total: entries.len() as u64,
            ..BootstrapCounts::default()
        };
        for entry in entries {
            match entry.status {
                BootstrapStatus::Pending => counts.pending += 1,
                BootstrapStatus::Processing => counts.processing += 1,
                BootstrapStatus::Completed => counts.completed += 1,
                BootstrapStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// All paths that have not completed, in path order.
    pub async fn remaining(&self) -> StoreResult<Vec<String>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT path FROM bootstrap_progress WHERE status != 'completed'
                     ORDER BY path",
                )?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                Ok(rows.collect::<Result<Vec<String>, _>>()?)
            })
            .await
    }

    pub async fn reset(&self) -> StoreResult<()> {
        self.store
            .with_conn(|conn| {
                conn.execute("DELETE FROM bootstrap_progress", [])?;
                Ok(())
            })
            .await
    }

    pub async fn log_error(&self, path: &str, message: &str) -> StoreResult<()> {
        let path = path.to_string();
        let message = message.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO bootstrap_errors (path, message, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![path, message, ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn errors(&self) -> StoreResult<Vec<(String, String)>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, message FROM bootstrap_errors ORDER BY error_id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn progress_survives_repo_recreation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = Store::open_at(&path).await.unwrap();
            let repo = BootstrapRepo::new(store);
            repo.init_progress(&[
                "f1".to_string(),
                "f2".to_string(),
                "f3".to_string(),
            ])
            .await
            .unwrap();
            repo.mark("f1", BootstrapStatus::Completed, None).await.unwrap();
            repo.mark("f2", BootstrapStatus::Failed, Some("err")).await.unwrap();
        }

        let store = Store::open_at(&path).await.unwrap();
        let repo = BootstrapRepo::new(store);
        let counts = repo.counts().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);

        let remaining = repo.remaining().await.unwrap();
        assert_eq!(remaining, vec!["f2".to_string(), "f3".to_string()]);
    }

    #[tokio::test]
    async fn init_progress_replaces_pending_state() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let repo = BootstrapRepo::new(store);

        repo.init_progress(&["old".to_string()]).await.unwrap();
        repo.init_progress(&["new".to_string()]).await.unwrap();

        let entries = repo.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "new");
        assert_eq!(entries[0].status, BootstrapStatus::Pending);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let repo = BootstrapRepo::new(store);

        repo.init_progress(&["f1".to_string()]).await.unwrap();
        repo.reset().await.unwrap();
        assert_eq!(repo.counts().await.unwrap().total, 0);
    }
}
