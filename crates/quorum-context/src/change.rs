// Change Detection
// Classifies scanned paths against persisted FileState into a four-way
// disjoint partition.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use quorum_store::FileRepo;

use crate::error::ContextResult;
use crate::fs::{read_meta, relativize, FileMeta};

/// Four disjoint lists plus the scan timestamp. Paths are root-relative.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new_files: Vec<ScannedFile>,
    pub modified_files: Vec<ScannedFile>,
    pub unchanged_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub scanned_at: Option<DateTime<Utc>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty()
            && self.modified_files.is_empty()
            && self.deleted_files.is_empty()
    }
}

/// A new or modified file together with its fresh metadata.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub meta: FileMeta,
}

pub struct ChangeDetector {
    root: PathBuf,
    files: FileRepo,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>, files: FileRepo) -> Self {
        Self {
            root: root.into(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Classify the given absolute paths. Paths outside the root are warned
    /// about and skipped. After the scan, active FileState rows whose file
    /// is gone from disk and was not scanned are reported as deleted.
    pub async fn detect(&self, paths: &[PathBuf]) -> ContextResult<ChangeSet> {
        let mut set = ChangeSet::default();
        let mut seen: HashSet<String> = HashSet::new();

        for path in paths {
            let rel_path = match relativize(&self.root, path) {
                Ok(rel) => rel,
                Err(_) => {
                    tracing::warn!(
                        target: "quorum.context",
                        path = %path.display(),
                        "skipping path outside project root"
                    );
                    continue;
                }
            };
            if !seen.insert(rel_path.clone()) {
                continue;
            }

            let meta = match read_meta(path).await {
                Ok(meta) => meta,
                Err(err) => {
                    // The file disappeared between scan and stat; the
                    // deleted sweep below picks it up if it was indexed.
                    tracing::debug!(
                        target: "quorum.context",
                        path = %path.display(),
                        "could not stat scanned file: {err}"
                    );
                    seen.remove(&rel_path);
                    continue;
                }
            };

            match self.files.find_by_path(&rel_path).await? {
                Some(state) if state.is_active() => {
                    let unchanged = state.content_hash == meta.content_hash
                        && state.size_bytes == meta.size_bytes
                        && state.mtime_ns == meta.mtime_ns;
                    if unchanged {
                        set.unchanged_files.push(rel_path);
                    } else {
                        set.modified_files.push(ScannedFile { rel_path, meta });
                    }
                }
                // Absent or soft-deleted rows both classify as new.
                _ => set.new_files.push(ScannedFile { rel_path, meta }),
            }
        }

        for state in self.files.list_active().await? {
            if seen.contains(&state.rel_path) {
                continue;
            }
            if !self.root.join(&state.rel_path).exists() {
                set.deleted_files.push(state.rel_path);
            }
        }

        set.scanned_at = Some(Utc::now());
        Ok(set)
    }
}
