// Audit Repositories
// Conversation transcripts, usage metrics, timeseries points, and job rows.

use chrono::{DateTime, Utc};
use rusqlite::params;

use quorum_types::TokenUsage;

use crate::db::{parse_ts, ts, Store};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub message_id: i64,
    pub task_id: String,
    pub agent_id: Option<String>,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MessageRepo {
    store: Store,
}

impl MessageRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        task_id: &str,
        agent_id: Option<&str>,
        role: &str,
        content: &str,
    ) -> StoreResult<i64> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.map(String::from);
        let role = role.to_string();
        let content = content.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO conversation_messages (task_id, agent_id, role, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task_id, agent_id, role, content, ts(Utc::now())],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<ConversationMessage>> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT message_id, task_id, agent_id, role, content, created_at
                     FROM conversation_messages WHERE task_id = ?1 ORDER BY message_id",
                )?;
                let rows = stmt.query_map(params![task_id], |row| {
                    let created_at: String = row.get(5)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        created_at,
                    ))
                })?;
                let mut messages = Vec::new();
                for row in rows {
                    let (message_id, task_id, agent_id, role, content, created_at) = row?;
                    messages.push(ConversationMessage {
                        message_id,
                        task_id,
                        agent_id,
                        role,
                        content,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(messages)
            })
            .await
    }
}

#[derive(Clone)]
pub struct MetricsRepo {
    store: Store,
}

impl MetricsRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record one agent's token spend for a task.
    pub async fn record_usage(
        &self,
        task_id: &str,
        agent_id: &str,
        usage: TokenUsage,
    ) -> StoreResult<()> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO usage_metrics (task_id, agent_id, tokens_in, tokens_out, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task_id, agent_id, usage.input, usage.output, ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn usage_total_for_task(&self, task_id: &str) -> StoreResult<TokenUsage> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let (input, output): (u64, u64) = conn.query_row(
                    "SELECT COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0)
                     FROM usage_metrics WHERE task_id = ?1",
                    params![task_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                Ok(TokenUsage { input, output })
            })
            .await
    }

    /// Append a named point to the timeseries.
    pub async fn record_point(
        &self,
        name: &str,
        value: f64,
        task_id: Option<&str>,
    ) -> StoreResult<()> {
        let name = name.to_string();
        let task_id = task_id.map(String::from);
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO metrics_timeseries (name, value, task_id, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![name, value, task_id, ts(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: i64,
    pub kind: String,
    pub status: JobStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobsRepo {
    store: Store,
}

impl JobsRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, kind: &str) -> StoreResult<i64> {
        let kind = kind.to_string();
        self.store
            .with_conn(move |conn| {
                let now = ts(Utc::now());
                conn.execute(
                    "INSERT INTO jobs (kind, status, detail, created_at, updated_at)
                     VALUES (?1, 'queued', NULL, ?2, ?2)",
                    params![kind, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn set_status(
        &self,
        job_id: i64,
        status: JobStatus,
        detail: Option<&str>,
    ) -> StoreResult<bool> {
        let detail = detail.map(String::from);
        self.store
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET status = ?2, detail = ?3, updated_at = ?4 WHERE job_id = ?1",
                    params![job_id, status.as_str(), detail, ts(Utc::now())],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<JobRecord>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, kind, status, detail, created_at, updated_at
                     FROM jobs WHERE status = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![status.as_str()], |row| {
                    let status: String = row.get(2)?;
                    let created_at: String = row.get(4)?;
                    let updated_at: String = row.get(5)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        status,
                        row.get::<_, Option<String>>(3)?,
                        created_at,
                        updated_at,
                    ))
                })?;
                let mut jobs = Vec::new();
                for row in rows {
                    let (job_id, kind, status, detail, created_at, updated_at) = row?;
                    jobs.push(JobRecord {
                        job_id,
                        kind,
                        status: JobStatus::parse(&status).ok_or_else(|| {
                            StoreError::InvalidRow(format!("unknown job status {status:?}"))
                        })?,
                        detail,
                        created_at: parse_ts(&created_at)?,
                        updated_at: parse_ts(&updated_at)?,
                    });
                }
                Ok(jobs)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn usage_sums_per_task() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let metrics = MetricsRepo::new(store);

        metrics
            .record_usage("t1", "a1", TokenUsage::new(100, 20))
            .await
            .unwrap();
        metrics
            .record_usage("t1", "a2", TokenUsage::new(50, 10))
            .await
            .unwrap();
        metrics
            .record_usage("t2", "a1", TokenUsage::new(999, 1))
            .await
            .unwrap();

        let total = metrics.usage_total_for_task("t1").await.unwrap();
        assert_eq!(total, TokenUsage::new(150, 30));
    }

    #[tokio::test]
    async fn job_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        let jobs = JobsRepo::new(store);

        let job_id = jobs.create("bootstrap").await.unwrap();
        assert_eq!(jobs.list_by_status(JobStatus::Queued).await.unwrap().len(), 1);

        assert!(jobs
            .set_status(job_id, JobStatus::Running, None)
            .await
            .unwrap());
        assert!(jobs
            .set_status(job_id, JobStatus::Completed, Some("42 files"))
            .await
            .unwrap());

        let done = jobs.list_by_status(JobStatus::Completed).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].detail.as_deref(), Some("42 files"));
    }
}
