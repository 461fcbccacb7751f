// Incremental Indexer
// Drives change detection, chunking and embedding, and applies each file's
// new state in one transaction. Failures are isolated per file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quorum_store::{FileRepo, FileUpdate, NewEmbedding};
use quorum_types::ChunkKind;

use crate::change::{ChangeDetector, ScannedFile};
use crate::chunking::{chunk_content, kind_for_path, ChunkingConfig};
use crate::embedder::Embedder;
use crate::error::{ContextError, ContextResult};
use crate::fs::language_for;

const EMBED_RETRIES: u32 = 2;
const EMBED_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Extensions (with leading dot) eligible for indexing; empty allows all.
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    pub chunking: ChunkingConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: Vec::new(),
            max_file_size_bytes: 10 * 1024 * 1024,
            chunking: ChunkingConfig::default(),
        }
    }
}

/// What one `update` call did.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub indexed: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: u64,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct IncrementalIndexer {
    detector: ChangeDetector,
    files: FileRepo,
    embedder: Arc<dyn Embedder>,
    config: IndexerConfig,
}

impl IncrementalIndexer {
    pub fn new(
        detector: ChangeDetector,
        files: FileRepo,
        embedder: Arc<dyn Embedder>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            detector,
            files,
            embedder,
            config,
        }
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub async fn update(&self, paths: &[PathBuf]) -> ContextResult<IndexReport> {
        self.update_with_cancel(paths, &CancellationToken::new())
            .await
    }

    /// Detect changes among `paths` and index them. A failure on one file
    /// is captured in the report; the rest of the batch continues.
    pub async fn update_with_cancel(
        &self,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> ContextResult<IndexReport> {
        let changes = self.detector.detect(paths).await?;
        let mut report = IndexReport {
            unchanged: changes.unchanged_files.len() as u64,
            ..IndexReport::default()
        };

        for scanned in changes.new_files.iter().chain(&changes.modified_files) {
            if cancel.is_cancelled() {
                return Err(ContextError::Cancelled);
            }
            if !self.eligible(scanned) {
                report.skipped.push(scanned.rel_path.clone());
                continue;
            }
            match self.index_one(scanned).await {
                Ok(()) => report.indexed.push(scanned.rel_path.clone()),
                Err(err) => {
                    tracing::warn!(
                        target: "quorum.context",
                        path = %scanned.rel_path,
                        "indexing failed: {err}"
                    );
                    report
                        .failed
                        .push((scanned.rel_path.clone(), err.to_string()));
                }
            }
        }

        for rel_path in &changes.deleted_files {
            if cancel.is_cancelled() {
                return Err(ContextError::Cancelled);
            }
            match self.files.apply_delete(rel_path).await {
                Ok(_) => report.deleted.push(rel_path.clone()),
                Err(err) => report.failed.push((rel_path.clone(), err.to_string())),
            }
        }

        if !report.indexed.is_empty() || !report.deleted.is_empty() {
            tracing::info!(
                target: "quorum.context",
                indexed = report.indexed.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "index update applied"
            );
        }
        Ok(report)
    }

    fn eligible(&self, scanned: &ScannedFile) -> bool {
        if scanned.meta.size_bytes > self.config.max_file_size_bytes {
            return false;
        }
        if self.config.allowed_extensions.is_empty() {
            return true;
        }
        let ext = scanned
            .meta
            .abs_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"));
        match ext {
            Some(ext) => self.config.allowed_extensions.contains(&ext),
            None => false,
        }
    }

    async fn index_one(&self, scanned: &ScannedFile) -> ContextResult<()> {
        let bytes = tokio::fs::read(&scanned.meta.abs_path).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let kind = kind_for_path(&scanned.meta.abs_path);
        let pieces = chunk_content(&content, kind, &self.config.chunking)?;

        let mut embeddings = Vec::with_capacity(pieces.len());
        for piece in &pieces {
            let vector = self.embed_with_retry(&piece.content).await?;
            embeddings.push(NewEmbedding {
                ordinal: piece.ordinal,
                model: self.embedder.model().to_string(),
                vector,
            });
        }

        let update = FileUpdate {
            rel_path: scanned.rel_path.clone(),
            content_hash: scanned.meta.content_hash.clone(),
            size_bytes: scanned.meta.size_bytes,
            mtime_ns: scanned.meta.mtime_ns,
            language: language_for(&scanned.meta.abs_path).map(String::from),
            kind: Some(kind.as_str().to_string()),
            // Short prefix of the content hash, enough for quick identity
            // probes without the full digest.
            fingerprint: Some(scanned.meta.content_hash.chars().take(16).collect()),
            chunks: pieces
                .into_iter()
                .map(|piece| quorum_store::NewChunk {
                    ordinal: piece.ordinal,
                    kind: piece.kind,
                    start_line: Some(piece.start_line),
                    end_line: Some(piece.end_line),
                    token_estimate: Some(piece.token_estimate),
                    content: piece.content,
                    summary: None,
                })
                .collect(),
            embeddings,
            links: Vec::new(),
        };
        self.files.apply_update(&update).await?;
        Ok(())
    }

    async fn embed_with_retry(&self, text: &str) -> ContextResult<Vec<f32>> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed(text).await {
                Ok(vector) => return Ok(vector),
                Err(ContextError::Embedding { retryable: true, message })
                    if attempt < EMBED_RETRIES =>
                {
                    attempt += 1;
                    tracing::debug!(
                        target: "quorum.context",
                        attempt,
                        "retrying transient embedding failure: {message}"
                    );
                    tokio::time::sleep(EMBED_RETRY_BACKOFF * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Chunk kinds currently present for a file, used by retrieval consumers.
pub async fn chunk_kinds_for_file(
    files: &FileRepo,
    file_id: i64,
) -> ContextResult<Vec<ChunkKind>> {
    let mut kinds: Vec<ChunkKind> = files
        .chunks_for_file(file_id)
        .await?
        .into_iter()
        .map(|c| c.kind)
        .collect();
    kinds.dedup();
    Ok(kinds)
}
