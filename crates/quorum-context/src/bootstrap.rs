// Bootstrap Module
// One-shot (resumable) bulk indexing of the configured roots. Progress is
// store-backed so an interrupted run picks up where it stopped.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use quorum_store::{BootstrapCounts, BootstrapRepo, JobStatus, JobsRepo};
use quorum_types::{BootstrapEntry, BootstrapStatus};

use crate::error::{ContextError, ContextResult};
use crate::fs::walk_files;
use crate::indexer::IncrementalIndexer;
use crate::priority::{prioritize, Candidate, PriorityConfig};

/// Store-backed per-path progress for a bootstrap run.
#[derive(Clone)]
pub struct BootstrapProgressTracker {
    repo: BootstrapRepo,
}

impl BootstrapProgressTracker {
    pub fn new(repo: BootstrapRepo) -> Self {
        Self { repo }
    }

    /// Replace prior pending state with a fresh PENDING set.
    pub async fn init_progress(&self, paths: &[String]) -> ContextResult<()> {
        Ok(self.repo.init_progress(paths).await?)
    }

    pub async fn mark_processing(&self, path: &str) -> ContextResult<()> {
        Ok(self.repo.mark(path, BootstrapStatus::Processing, None).await?)
    }

    pub async fn mark_completed(&self, path: &str) -> ContextResult<()> {
        Ok(self.repo.mark(path, BootstrapStatus::Completed, None).await?)
    }

    pub async fn mark_failed(&self, path: &str, message: &str) -> ContextResult<()> {
        Ok(self
            .repo
            .mark(path, BootstrapStatus::Failed, Some(message))
            .await?)
    }

    pub async fn get_progress(&self) -> ContextResult<BootstrapCounts> {
        Ok(self.repo.counts().await?)
    }

    /// All paths that have not completed.
    pub async fn get_remaining(&self) -> ContextResult<Vec<String>> {
        Ok(self.repo.remaining().await?)
    }

    pub async fn entries(&self) -> ContextResult<Vec<BootstrapEntry>> {
        Ok(self.repo.entries().await?)
    }

    pub async fn reset(&self) -> ContextResult<()> {
        Ok(self.repo.reset().await?)
    }
}

/// Captures per-file indexing failures for later inspection.
#[derive(Clone)]
pub struct BootstrapErrorLogger {
    repo: BootstrapRepo,
}

impl BootstrapErrorLogger {
    pub fn new(repo: BootstrapRepo) -> Self {
        Self { repo }
    }

    pub async fn log(&self, path: &str, message: &str) -> ContextResult<()> {
        tracing::warn!(target: "quorum.bootstrap", path, "bootstrap failure: {message}");
        Ok(self.repo.log_error(path, message).await?)
    }

    pub async fn errors(&self) -> ContextResult<Vec<(String, String)>> {
        Ok(self.repo.errors().await?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct BootstrapOrchestrator {
    roots: Vec<PathBuf>,
    indexer: Arc<IncrementalIndexer>,
    tracker: BootstrapProgressTracker,
    errors: BootstrapErrorLogger,
    jobs: JobsRepo,
    priority: PriorityConfig,
}

impl BootstrapOrchestrator {
    pub fn new(
        roots: Vec<PathBuf>,
        indexer: Arc<IncrementalIndexer>,
        tracker: BootstrapProgressTracker,
        errors: BootstrapErrorLogger,
        jobs: JobsRepo,
        priority: PriorityConfig,
    ) -> Self {
        Self {
            roots,
            indexer,
            tracker,
            errors,
            jobs,
            priority,
        }
    }

    /// Scan, prioritize, merge persisted remainders, and index file by file.
    pub async fn run(&self, cancel: &CancellationToken) -> ContextResult<BootstrapReport> {
        let job_id = self.jobs.create("bootstrap").await?;
        self.jobs.set_status(job_id, JobStatus::Running, None).await?;

        let result = self.run_inner(cancel).await;
        match &result {
            Ok(report) => {
                self.jobs
                    .set_status(
                        job_id,
                        JobStatus::Completed,
                        Some(&format!(
                            "{} files, {} failed",
                            report.total, report.failed
                        )),
                    )
                    .await?;
            }
            Err(err) => {
                self.jobs
                    .set_status(job_id, JobStatus::Failed, Some(&err.to_string()))
                    .await?;
            }
        }
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> ContextResult<BootstrapReport> {
        // Scan all roots for candidate files.
        let mut candidates = Vec::new();
        for root in &self.roots {
            for path in walk_files(root).await {
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                candidates.push(Candidate { path, size_bytes });
            }
        }
        let ordered = prioritize(candidates, &self.priority);
        let mut paths: Vec<String> = ordered
            .iter()
            .map(|c| c.path.to_string_lossy().to_string())
            .collect();

        // Merge previously pending/failed paths; freshly scanned paths win.
        let remaining = self.tracker.get_remaining().await?;
        for path in remaining {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        self.tracker.init_progress(&paths).await?;

        let mut report = BootstrapReport {
            total: paths.len() as u64,
            ..BootstrapReport::default()
        };

        for path in &paths {
            if cancel.is_cancelled() {
                return Err(ContextError::Cancelled);
            }
            self.tracker.mark_processing(path).await?;
            let abs = PathBuf::from(path);
            match self
                .indexer
                .update_with_cancel(std::slice::from_ref(&abs), cancel)
                .await
            {
                Ok(result) if result.failed.is_empty() => {
                    self.tracker.mark_completed(path).await?;
                    report.completed += 1;
                }
                Ok(result) => {
                    let message = result
                        .failed
                        .first()
                        .map(|(_, msg)| msg.clone())
                        .unwrap_or_else(|| "unknown indexing failure".to_string());
                    self.tracker.mark_failed(path, &message).await?;
                    self.errors.log(path, &message).await?;
                    report.failed += 1;
                }
                Err(ContextError::Cancelled) => return Err(ContextError::Cancelled),
                Err(err) => {
                    let message = err.to_string();
                    self.tracker.mark_failed(path, &message).await?;
                    self.errors.log(path, &message).await?;
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            target: "quorum.bootstrap",
            total = report.total,
            completed = report.completed,
            failed = report.failed,
            "bootstrap run finished"
        );
        Ok(report)
    }
}
