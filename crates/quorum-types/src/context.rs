// Rows of the context index: per-file metadata used for change detection,
// the chunks derived from each file, and their embeddings and links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, QuorumResult};

/// Authoritative per-file metadata record. One row per relative path; files
/// missing from disk are soft-deleted rather than removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub file_id: i64,
    pub rel_path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub mtime_ns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl FileState {
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }
}

/// Semantic type of a chunk, derived from the file it was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Code,
    Markdown,
    Config,
    Text,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Code => "code",
            ChunkKind::Markdown => "markdown",
            ChunkKind::Config => "config",
            ChunkKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(ChunkKind::Code),
            "markdown" => Some(ChunkKind::Markdown),
            "config" => Some(ChunkKind::Config),
            "text" => Some(ChunkKind::Text),
            _ => None,
        }
    }
}

/// A bounded, ordinally-stable slice of a file used for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub file_id: i64,
    /// Position within the file; contiguous from 0 after indexing completes.
    pub ordinal: u32,
    pub kind: ChunkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u32>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn validate(&self) -> QuorumResult<()> {
        if self.content.trim().is_empty() {
            return Err(QuorumError::Validation(format!(
                "chunk {} of file {} has blank content",
                self.ordinal, self.file_id
            )));
        }
        match (self.start_line, self.end_line) {
            (None, None) => {}
            (Some(start), Some(end)) => {
                if start < 1 || start > end {
                    return Err(QuorumError::Validation(format!(
                        "chunk {} has invalid line span {}..{}",
                        self.ordinal, start, end
                    )));
                }
            }
            _ => {
                return Err(QuorumError::Validation(format!(
                    "chunk {} has a partial line span",
                    self.ordinal
                )));
            }
        }
        Ok(())
    }
}

/// Fixed-dimension vector for one chunk under one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub embedding_id: i64,
    pub chunk_id: i64,
    pub model: String,
    pub dimensions: u32,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    pub fn validate(&self) -> QuorumResult<()> {
        if self.dimensions == 0 {
            return Err(QuorumError::Validation(format!(
                "embedding for chunk {} has zero dimensions",
                self.chunk_id
            )));
        }
        if self.vector.len() != self.dimensions as usize {
            return Err(QuorumError::Validation(format!(
                "embedding for chunk {} has {} values, expected {}",
                self.chunk_id,
                self.vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    pub fn cosine_similarity(&self, other: &[f32]) -> f32 {
        if self.vector.len() != other.len() {
            return 0.0;
        }
        let dot: f32 = self.vector.iter().zip(other).map(|(a, b)| a * b).sum();
        let mag_a: f32 = self.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        let mag_b: f32 = other.iter().map(|v| v * v).sum::<f32>().sqrt();
        if mag_a == 0.0 || mag_b == 0.0 {
            0.0
        } else {
            dot / (mag_a * mag_b)
        }
    }
}

/// Directed relation from a chunk to a file or another chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_id: i64,
    pub source_chunk_id: i64,
    pub target_file_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_chunk_id: Option<i64>,
    pub link_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BootstrapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapStatus::Pending => "pending",
            BootstrapStatus::Processing => "processing",
            BootstrapStatus::Completed => "completed",
            BootstrapStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BootstrapStatus::Pending),
            "processing" => Some(BootstrapStatus::Processing),
            "completed" => Some(BootstrapStatus::Completed),
            "failed" => Some(BootstrapStatus::Failed),
            _ => None,
        }
    }
}

/// Per-path progress entry for a resumable bootstrap run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapEntry {
    pub path: String,
    pub status: BootstrapStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
