// Project config key/value rows and per-task context snapshots.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::db::{ts, Store};
use crate::error::StoreResult;

#[derive(Clone)]
pub struct ProjectConfigRepo {
    store: Store,
}

impl ProjectConfigRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let key = key.to_string();
        let raw = serde_json::to_string(value)?;
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO project_config (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at",
                    params![key, raw, ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let key = key.to_string();
        self.store
            .with_conn(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM project_config WHERE key = ?1",
                        params![key],
                        |r| r.get(0),
                    )
                    .optional()?;
                raw.as_deref()
                    .map(|r| serde_json::from_str(r).map_err(Into::into))
                    .transpose()
            })
            .await
    }
}

/// One mutable context snapshot per task, optionally tied to a decision.
/// Upserting richer content never orphans the existing row.
#[derive(Clone)]
pub struct SnapshotRepo {
    store: Store,
}

impl SnapshotRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upsert_for_task(
        &self,
        task_id: &str,
        content: &Value,
        decision_id: Option<&str>,
    ) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let decision_id = decision_id.map(String::from);
        let raw = serde_json::to_string(content)?;
        self.store
            .with_conn(move |conn| {
                let now = ts(Utc::now());
                let changed = conn.execute(
                    "UPDATE context_snapshots
                     SET content = ?2, decision_id = COALESCE(?3, decision_id), updated_at = ?4
                     WHERE task_id = ?1",
                    params![task_id, raw, decision_id, now],
                )?;
                if changed == 0 {
                    conn.execute(
                        "INSERT INTO context_snapshots (task_id, decision_id, content,
                            created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![task_id, decision_id, raw, now],
                    )?;
                }
                Ok(())
            })
            .await
    }

    pub async fn get_for_task(&self, task_id: &str) -> StoreResult<Option<Value>> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT content FROM context_snapshots WHERE task_id = ?1",
                        params![task_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                raw.as_deref()
                    .map(|r| serde_json::from_str(r).map_err(Into::into))
                    .transpose()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn config_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let repo = ProjectConfigRepo::new(store);

        assert!(repo.get("consensus").await.unwrap().is_none());
        repo.set("consensus", &json!({"voting_threshold": 0.8}))
            .await
            .unwrap();
        assert_eq!(
            repo.get("consensus").await.unwrap(),
            Some(json!({"voting_threshold": 0.8}))
        );
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_single_row() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let repo = SnapshotRepo::new(store);

        repo.upsert_for_task("t1", &json!({"notes": "v1"}), None)
            .await
            .unwrap();
        repo.upsert_for_task("t1", &json!({"notes": "v2"}), Some("d1"))
            .await
            .unwrap();

        assert_eq!(
            repo.get_for_task("t1").await.unwrap(),
            Some(json!({"notes": "v2"}))
        );
    }
}
