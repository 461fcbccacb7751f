use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use quorum_types::{RoutingStrategy, Task, TaskStatus};

use crate::db::{parse_ts, ts, Store};
use crate::error::StoreResult;
use crate::repo::{from_token, to_token};

/// Typed CRUD over the `tasks` table.
#[derive(Clone)]
pub struct TaskRepo {
    store: Store,
}

impl TaskRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, task: &Task) -> StoreResult<()> {
        let task_type = to_token(&task.task_type)?;
        let status = to_token(&task.status)?;
        let routing = to_token(&task.routing)?;
        let assignees = serde_json::to_string(&task.assignee_ids)?;
        let dependencies = serde_json::to_string(&task.dependencies)?;
        let metadata = task
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let task = task.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, title, description, task_type, status, routing,
                        assignee_ids, dependencies, complexity, risk, created_at, updated_at,
                        due_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        description = excluded.description,
                        task_type = excluded.task_type,
                        status = excluded.status,
                        routing = excluded.routing,
                        assignee_ids = excluded.assignee_ids,
                        dependencies = excluded.dependencies,
                        complexity = excluded.complexity,
                        risk = excluded.risk,
                        updated_at = excluded.updated_at,
                        due_at = excluded.due_at,
                        metadata = excluded.metadata",
                    params![
                        task.id,
                        task.title,
                        task.description,
                        task_type,
                        status,
                        routing,
                        assignees,
                        dependencies,
                        task.complexity,
                        task.risk,
                        ts(task.created_at),
                        task.updated_at.map(ts),
                        task.due_at.map(ts),
                        metadata,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, title, description, task_type, status, routing, assignee_ids,
                            dependencies, complexity, risk, created_at, updated_at, due_at,
                            metadata
                     FROM tasks WHERE id = ?1",
                    params![id],
                    map_task,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// Update status and touch `updated_at`. Returns whether the row existed.
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> StoreResult<bool> {
        let id = id.to_string();
        let status = to_token(&status)?;
        self.store
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status, ts(Utc::now())],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn set_routing(&self, id: &str, routing: RoutingStrategy) -> StoreResult<bool> {
        let id = id.to_string();
        let routing = to_token(&routing)?;
        self.store
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET routing = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, routing, ts(Utc::now())],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn list(&self) -> StoreResult<Vec<Task>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, task_type, status, routing, assignee_ids,
                            dependencies, complexity, risk, created_at, updated_at, due_at,
                            metadata
                     FROM tasks ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], map_task)?;
                let mut tasks = Vec::new();
                for row in rows {
                    tasks.push(row??);
                }
                Ok(tasks)
            })
            .await
    }
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<StoreResult<Task>> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let task_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let routing: String = row.get(5)?;
    let assignees: String = row.get(6)?;
    let dependencies: String = row.get(7)?;
    let complexity: u8 = row.get(8)?;
    let risk: u8 = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: Option<String> = row.get(11)?;
    let due_at: Option<String> = row.get(12)?;
    let metadata: Option<String> = row.get(13)?;

    Ok(build_task(
        id,
        title,
        description,
        task_type,
        status,
        routing,
        assignees,
        dependencies,
        complexity,
        risk,
        created_at,
        updated_at,
        due_at,
        metadata,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_task(
    id: String,
    title: String,
    description: Option<String>,
    task_type: String,
    status: String,
    routing: String,
    assignees: String,
    dependencies: String,
    complexity: u8,
    risk: u8,
    created_at: String,
    updated_at: Option<String>,
    due_at: Option<String>,
    metadata: Option<String>,
) -> StoreResult<Task> {
    Ok(Task {
        id,
        title,
        description,
        task_type: from_token(&task_type)?,
        status: from_token(&status)?,
        routing: from_token(&routing)?,
        assignee_ids: serde_json::from_str::<BTreeSet<String>>(&assignees)?,
        dependencies: serde_json::from_str::<BTreeSet<String>>(&dependencies)?,
        complexity,
        risk,
        created_at: parse_ts(&created_at)?,
        updated_at: updated_at.as_deref().map(parse_ts).transpose()?,
        due_at: due_at.as_deref().map(parse_ts).transpose()?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    })
}
