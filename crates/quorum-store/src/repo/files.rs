// File Index Repositories
// FileState rows plus their dependent chunks, embeddings and links. The
// dependents are owned by the file: replacing or deleting a file rewrites
// them inside one transaction, and cascades run in application code.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use quorum_types::{Chunk, ChunkKind, Embedding, FileState, Link};

use crate::db::{blob_to_vector, parse_ts, ts, vector_to_blob, Store};
use crate::error::{StoreError, StoreResult};

/// Chunk payload for one file update; ordinals must be contiguous from 0.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub ordinal: u32,
    pub kind: ChunkKind,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub token_estimate: Option<u32>,
    pub content: String,
    pub summary: Option<String>,
}

/// Embedding payload keyed by chunk ordinal (chunk ids are assigned by the
/// store during the update).
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub ordinal: u32,
    pub model: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct NewLink {
    pub source_ordinal: u32,
    pub target_path: String,
    pub target_ordinal: Option<u32>,
    pub link_type: String,
    pub label: Option<String>,
    pub score: Option<f64>,
}

/// Everything the indexer computed for one file, applied atomically.
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub rel_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub mtime_ns: i64,
    pub language: Option<String>,
    pub kind: Option<String>,
    pub fingerprint: Option<String>,
    pub chunks: Vec<NewChunk>,
    pub embeddings: Vec<NewEmbedding>,
    pub links: Vec<NewLink>,
}

#[derive(Clone)]
pub struct FileRepo {
    store: Store,
}

impl FileRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn find_by_path(&self, rel_path: &str) -> StoreResult<Option<FileState>> {
        let rel_path = rel_path.to_string();
        self.store
            .with_conn(move |conn| find_by_path(conn, &rel_path))
            .await
    }

    pub async fn list_active(&self) -> StoreResult<Vec<FileState>> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT file_id, rel_path, content_hash, size_bytes, mtime_ns, language,
                            kind, fingerprint, indexed_at, is_deleted
                     FROM file_state WHERE is_deleted = 0 ORDER BY rel_path",
                )?;
                let rows = stmt.query_map([], map_file_state)?;
                let mut files = Vec::new();
                for row in rows {
                    files.push(row??);
                }
                Ok(files)
            })
            .await
    }

    /// Apply one file's new index state atomically: upsert the FileState
    /// row, replace its chunks, and rewrite embeddings and links. A failure
    /// anywhere leaves the file's previous state intact.
    pub async fn apply_update(&self, update: &FileUpdate) -> StoreResult<i64> {
        let update = update.clone();
        self.store
            .transaction(move |scope| {
                let conn = scope.conn();
                let now = ts(Utc::now());

                conn.execute(
                    "INSERT INTO file_state (rel_path, content_hash, size_bytes, mtime_ns,
                        language, kind, fingerprint, indexed_at, is_deleted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
                     ON CONFLICT(rel_path) DO UPDATE SET
                        content_hash = excluded.content_hash,
                        size_bytes = excluded.size_bytes,
                        mtime_ns = excluded.mtime_ns,
                        language = excluded.language,
                        kind = excluded.kind,
                        fingerprint = excluded.fingerprint,
                        indexed_at = excluded.indexed_at,
                        is_deleted = 0",
                    params![
                        update.rel_path,
                        update.content_hash,
                        update.size_bytes,
                        update.mtime_ns,
                        update.language,
                        update.kind,
                        update.fingerprint,
                        now,
                    ],
                )?;
                let file_id: i64 = conn.query_row(
                    "SELECT file_id FROM file_state WHERE rel_path = ?1",
                    params![update.rel_path],
                    |r| r.get(0),
                )?;

                delete_dependents(conn, file_id)?;

                let mut chunk_ids = std::collections::HashMap::new();
                for chunk in &update.chunks {
                    conn.execute(
                        "INSERT INTO chunks (file_id, ordinal, kind, start_line, end_line,
                            token_estimate, content, summary, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            file_id,
                            chunk.ordinal,
                            chunk.kind.as_str(),
                            chunk.start_line,
                            chunk.end_line,
                            chunk.token_estimate,
                            chunk.content,
                            chunk.summary,
                            now,
                        ],
                    )?;
                    chunk_ids.insert(chunk.ordinal, conn.last_insert_rowid());
                }

                for embedding in &update.embeddings {
                    let Some(chunk_id) = chunk_ids.get(&embedding.ordinal) else {
                        return Err(StoreError::InvalidRow(format!(
                            "embedding targets unknown chunk ordinal {} in {}",
                            embedding.ordinal, update.rel_path
                        )));
                    };
                    conn.execute(
                        "INSERT INTO embeddings (chunk_id, model, dimensions, vector, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(chunk_id, model) DO UPDATE SET
                            dimensions = excluded.dimensions,
                            vector = excluded.vector",
                        params![
                            chunk_id,
                            embedding.model,
                            embedding.vector.len() as u32,
                            vector_to_blob(&embedding.vector),
                            now,
                        ],
                    )?;
                }

                for link in &update.links {
                    let Some(source_id) = chunk_ids.get(&link.source_ordinal) else {
                        return Err(StoreError::InvalidRow(format!(
                            "link source ordinal {} unknown in {}",
                            link.source_ordinal, update.rel_path
                        )));
                    };
                    let target: Option<(i64, Option<i64>)> =
                        resolve_link_target(conn, &link.target_path, link.target_ordinal)?;
                    let Some((target_file_id, target_chunk_id)) = target else {
                        tracing::debug!(
                            target: "quorum.store",
                            path = %link.target_path,
                            "skipping link to unindexed target"
                        );
                        continue;
                    };
                    conn.execute(
                        "INSERT INTO links (source_chunk_id, target_file_id, target_chunk_id,
                            link_type, label, score, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            source_id,
                            target_file_id,
                            target_chunk_id,
                            link.link_type,
                            link.label,
                            link.score,
                            now,
                        ],
                    )?;
                }

                Ok(file_id)
            })
            .await
    }

    /// Soft-delete a file and remove its dependent rows. Returns whether a
    /// row was affected.
    pub async fn apply_delete(&self, rel_path: &str) -> StoreResult<bool> {
        let rel_path = rel_path.to_string();
        self.store
            .transaction(move |scope| {
                let conn = scope.conn();
                let Some(state) = find_by_path(conn, &rel_path)? else {
                    return Ok(false);
                };
                delete_dependents(conn, state.file_id)?;
                conn.execute(
                    "UPDATE file_state SET is_deleted = 1, indexed_at = ?2 WHERE file_id = ?1",
                    params![state.file_id, ts(Utc::now())],
                )?;
                Ok(true)
            })
            .await
    }

    pub async fn chunks_for_file(&self, file_id: i64) -> StoreResult<Vec<Chunk>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chunk_id, file_id, ordinal, kind, start_line, end_line,
                            token_estimate, content, summary, created_at
                     FROM chunks WHERE file_id = ?1 ORDER BY ordinal",
                )?;
                let rows = stmt.query_map(params![file_id], map_chunk)?;
                let mut chunks = Vec::new();
                for row in rows {
                    chunks.push(row??);
                }
                Ok(chunks)
            })
            .await
    }

    pub async fn chunks_by_kind(&self, kind: ChunkKind) -> StoreResult<Vec<Chunk>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chunk_id, file_id, ordinal, kind, start_line, end_line,
                            token_estimate, content, summary, created_at
                     FROM chunks WHERE kind = ?1 ORDER BY file_id, ordinal",
                )?;
                let rows = stmt.query_map(params![kind.as_str()], map_chunk)?;
                let mut chunks = Vec::new();
                for row in rows {
                    chunks.push(row??);
                }
                Ok(chunks)
            })
            .await
    }

    pub async fn embeddings_for_chunk(&self, chunk_id: i64) -> StoreResult<Vec<Embedding>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT embedding_id, chunk_id, model, dimensions, vector, created_at
                     FROM embeddings WHERE chunk_id = ?1 ORDER BY model",
                )?;
                let rows = stmt.query_map(params![chunk_id], map_embedding)?;
                let mut embeddings = Vec::new();
                for row in rows {
                    embeddings.push(row??);
                }
                Ok(embeddings)
            })
            .await
    }

    pub async fn links_for_chunk(&self, chunk_id: i64) -> StoreResult<Vec<Link>> {
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT link_id, source_chunk_id, target_file_id, target_chunk_id,
                            link_type, label, score, created_at
                     FROM links WHERE source_chunk_id = ?1 ORDER BY link_id",
                )?;
                let rows = stmt.query_map(params![chunk_id], map_link)?;
                let mut links = Vec::new();
                for row in rows {
                    links.push(row??);
                }
                Ok(links)
            })
            .await
    }
}

fn find_by_path(conn: &Connection, rel_path: &str) -> StoreResult<Option<FileState>> {
    conn.query_row(
        "SELECT file_id, rel_path, content_hash, size_bytes, mtime_ns, language, kind,
                fingerprint, indexed_at, is_deleted
         FROM file_state WHERE rel_path = ?1",
        params![rel_path],
        map_file_state,
    )
    .optional()?
    .transpose()
}

/// Application-level cascade: a file's chunks own embeddings and links.
fn delete_dependents(conn: &Connection, file_id: i64) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE file_id = ?1)",
        params![file_id],
    )?;
    conn.execute(
        "DELETE FROM links WHERE source_chunk_id IN (SELECT chunk_id FROM chunks WHERE file_id = ?1)",
        params![file_id],
    )?;
    conn.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
    Ok(())
}

fn resolve_link_target(
    conn: &Connection,
    target_path: &str,
    target_ordinal: Option<u32>,
) -> StoreResult<Option<(i64, Option<i64>)>> {
    let Some(state) = find_by_path(conn, target_path)? else {
        return Ok(None);
    };
    let chunk_id = match target_ordinal {
        Some(ordinal) => conn
            .query_row(
                "SELECT chunk_id FROM chunks WHERE file_id = ?1 AND ordinal = ?2",
                params![state.file_id, ordinal],
                |r| r.get::<_, i64>(0),
            )
            .optional()?,
        None => None,
    };
    Ok(Some((state.file_id, chunk_id)))
}

fn map_file_state(row: &Row<'_>) -> rusqlite::Result<StoreResult<FileState>> {
    let indexed_at: String = row.get(8)?;
    let state: StoreResult<FileState> = (|| {
        Ok(FileState {
            file_id: row.get(0)?,
            rel_path: row.get(1)?,
            content_hash: row.get(2)?,
            size_bytes: row.get(3)?,
            mtime_ns: row.get(4)?,
            language: row.get(5)?,
            kind: row.get(6)?,
            fingerprint: row.get(7)?,
            indexed_at: parse_ts(&indexed_at)?,
            is_deleted: row.get(9)?,
        })
    })();
    Ok(state)
}

fn map_chunk(row: &Row<'_>) -> rusqlite::Result<StoreResult<Chunk>> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(9)?;
    let chunk: StoreResult<Chunk> = (|| {
        Ok(Chunk {
            chunk_id: row.get(0)?,
            file_id: row.get(1)?,
            ordinal: row.get(2)?,
            kind: ChunkKind::parse(&kind)
                .ok_or_else(|| StoreError::InvalidRow(format!("unknown chunk kind {kind:?}")))?,
            start_line: row.get(4)?,
            end_line: row.get(5)?,
            token_estimate: row.get(6)?,
            content: row.get(7)?,
            summary: row.get(8)?,
            created_at: parse_ts(&created_at)?,
        })
    })();
    Ok(chunk)
}

fn map_embedding(row: &Row<'_>) -> rusqlite::Result<StoreResult<Embedding>> {
    let blob: Vec<u8> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let embedding: StoreResult<Embedding> = (|| {
        Ok(Embedding {
            embedding_id: row.get(0)?,
            chunk_id: row.get(1)?,
            model: row.get(2)?,
            dimensions: row.get(3)?,
            vector: blob_to_vector(&blob)?,
            created_at: parse_ts(&created_at)?,
        })
    })();
    Ok(embedding)
}

fn map_link(row: &Row<'_>) -> rusqlite::Result<StoreResult<Link>> {
    let created_at: String = row.get(7)?;
    let link: StoreResult<Link> = (|| {
        Ok(Link {
            link_id: row.get(0)?,
            source_chunk_id: row.get(1)?,
            target_file_id: row.get(2)?,
            target_chunk_id: row.get(3)?,
            link_type: row.get(4)?,
            label: row.get(5)?,
            score: row.get(6)?,
            created_at: parse_ts(&created_at)?,
        })
    })();
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn repo() -> (FileRepo, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).await.unwrap();
        (FileRepo::new(store), dir)
    }

    fn update(rel_path: &str, hash: &str, chunk_contents: &[&str]) -> FileUpdate {
        FileUpdate {
            rel_path: rel_path.to_string(),
            content_hash: hash.to_string(),
            size_bytes: 120,
            mtime_ns: 1_700_000_000_000_000_000,
            language: Some("rust".to_string()),
            kind: Some("source".to_string()),
            fingerprint: None,
            chunks: chunk_contents
                .iter()
                .enumerate()
                .map(|(i, content)| NewChunk {
                    ordinal: i as u32,
                    kind: ChunkKind::Code,
                    start_line: None,
                    end_line: None,
                    token_estimate: Some(content.len() as u32 / 4),
                    content: content.to_string(),
                    summary: None,
                })
                .collect(),
            embeddings: (0..chunk_contents.len())
                .map(|i| NewEmbedding {
                    ordinal: i as u32,
                    model: "test-model".to_string(),
                    vector: vec![i as f32, 1.0, 0.0],
                })
                .collect(),
            links: Vec::new(),
        }
    }

    #[tokio::test]
    async fn update_replaces_chunks_with_contiguous_ordinals() {
        let (repo, _dir) = repo().await;
        let file_id = repo
            .apply_update(&update("src/lib.rs", "h1", &["fn a() {}", "fn b() {}"]))
            .await
            .unwrap();

        let chunks = repo.chunks_for_file(file_id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![0, 1]
        );

        // Re-index with fewer chunks; old rows must be gone.
        let same_id = repo
            .apply_update(&update("src/lib.rs", "h2", &["fn a() { 1 }"]))
            .await
            .unwrap();
        assert_eq!(same_id, file_id);
        let chunks = repo.chunks_for_file(file_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);

        let embeddings = repo.embeddings_for_chunk(chunks[0].chunk_id).await.unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].vector, vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn delete_soft_deletes_and_cascades() {
        let (repo, _dir) = repo().await;
        let file_id = repo
            .apply_update(&update("src/main.rs", "h1", &["fn main() {}"]))
            .await
            .unwrap();

        assert!(repo.apply_delete("src/main.rs").await.unwrap());
        assert!(!repo.apply_delete("src/missing.rs").await.unwrap());

        let state = repo.find_by_path("src/main.rs").await.unwrap().unwrap();
        assert!(state.is_deleted);
        assert!(repo.chunks_for_file(file_id).await.unwrap().is_empty());
        assert!(repo.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_row_per_rel_path() {
        let (repo, _dir) = repo().await;
        repo.apply_update(&update("a.md", "h1", &["alpha"])).await.unwrap();
        repo.apply_update(&update("a.md", "h2", &["beta"])).await.unwrap();

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content_hash, "h2");
    }
}
