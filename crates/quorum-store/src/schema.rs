// Schema Module
// All DDL is create-if-absent so initialization is idempotent.

use rusqlite::Connection;

use crate::error::StoreResult;

pub fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL,
            routing TEXT NOT NULL,
            assignee_ids TEXT NOT NULL DEFAULT '[]',
            dependencies TEXT NOT NULL DEFAULT '[]',
            complexity INTEGER NOT NULL,
            risk INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            due_at TEXT,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS proposals (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            input_type TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL NOT NULL,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_proposals_task ON proposals(task_id);

        CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            considered TEXT NOT NULL,
            selected TEXT NOT NULL DEFAULT '[]',
            winner_proposal_id TEXT,
            agreement_rate REAL,
            rationale TEXT,
            consensus_achieved INTEGER NOT NULL DEFAULT 0,
            decided_at TEXT NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id);

        CREATE TABLE IF NOT EXISTS conversation_messages (
            message_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            agent_id TEXT,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_task ON conversation_messages(task_id);

        CREATE TABLE IF NOT EXISTS metrics_timeseries (
            metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            value REAL NOT NULL,
            task_id TEXT,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS context_snapshots (
            snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            decision_id TEXT REFERENCES decisions(id),
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_task ON context_snapshots(task_id);

        CREATE TABLE IF NOT EXISTS file_state (
            file_id INTEGER PRIMARY KEY AUTOINCREMENT,
            rel_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            mtime_ns INTEGER NOT NULL,
            language TEXT,
            kind TEXT,
            fingerprint TEXT,
            indexed_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_file_state_rel_path ON file_state(rel_path);
        CREATE INDEX IF NOT EXISTS idx_file_state_mtime ON file_state(mtime_ns);

        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            kind TEXT NOT NULL,
            start_line INTEGER,
            end_line INTEGER,
            token_estimate INTEGER,
            content TEXT NOT NULL,
            summary TEXT,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_file_ordinal ON chunks(file_id, ordinal);
        CREATE INDEX IF NOT EXISTS idx_chunks_kind ON chunks(kind);

        CREATE TABLE IF NOT EXISTS embeddings (
            embedding_id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            dimensions INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_embeddings_chunk_model ON embeddings(chunk_id, model);
        CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model);

        CREATE TABLE IF NOT EXISTS links (
            link_id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_chunk_id INTEGER NOT NULL,
            target_file_id INTEGER NOT NULL,
            target_chunk_id INTEGER,
            link_type TEXT NOT NULL,
            label TEXT,
            score REAL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_chunk_id);

        CREATE TABLE IF NOT EXISTS usage_metrics (
            usage_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_task ON usage_metrics(task_id);

        CREATE TABLE IF NOT EXISTS bootstrap_progress (
            path TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bootstrap_errors (
            error_id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            job_id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

        CREATE TABLE IF NOT EXISTS project_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
