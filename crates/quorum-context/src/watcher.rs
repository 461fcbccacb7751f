// Watcher Daemon
// OS events flow through a per-path debouncer, a root/extension filter, and
// a time-window batcher before reaching the incremental indexer. Shutdown
// closes the pipeline stage by stage so pending work flushes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextResult;
use crate::indexer::IncrementalIndexer;

/// Coalescing order is bookkeeping only: within one debounce window the
/// later event's kind wins, so CREATED followed by DELETED emits DELETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

/// Downstream consumer of batched paths.
#[async_trait]
pub trait IndexSink: Send + Sync {
    async fn update(&self, paths: Vec<PathBuf>);
}

/// Default sink: hands batches to the incremental indexer and logs failures.
pub struct IndexerSink {
    indexer: Arc<IncrementalIndexer>,
    cancel: CancellationToken,
}

impl IndexerSink {
    pub fn new(indexer: Arc<IncrementalIndexer>, cancel: CancellationToken) -> Self {
        Self { indexer, cancel }
    }
}

#[async_trait]
impl IndexSink for IndexerSink {
    async fn update(&self, paths: Vec<PathBuf>) {
        if let Err(err) = self.indexer.update_with_cancel(&paths, &self.cancel).await {
            tracing::warn!(target: "quorum.watcher", "batch index update failed: {err}");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherDaemonConfig {
    pub root: PathBuf,
    pub debounce: Duration,
    pub batch_window: Duration,
    /// Extensions (with leading dot); empty admits every extension.
    pub allowed_extensions: Vec<String>,
    /// Substring patterns; a path containing one is dropped.
    pub ignore_patterns: Vec<String>,
}

/// Per-path coalescing stage. Emits the most recent kind for a path once no
/// event for it has arrived for the debounce interval. Closing the input
/// flushes whatever is pending.
fn spawn_debouncer(
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    out: mpsc::UnboundedSender<WatchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, (WatchKind, Instant)> = HashMap::new();
        loop {
            let next_deadline = pending.values().map(|(_, at)| *at).min();
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        // Last write wins for the kind; the timer restarts.
                        pending.insert(event.path, (event.kind, Instant::now() + debounce));
                    }
                    None => {
                        for (path, (kind, _)) in pending.drain() {
                            let _ = out.send(WatchEvent { path, kind });
                        }
                        break;
                    }
                },
                _ = sleep_until_or_forever(next_deadline) => {
                    let now = Instant::now();
                    let expired: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, (_, at))| *at <= now)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in expired {
                        if let Some((kind, _)) = pending.remove(&path) {
                            let _ = out.send(WatchEvent { path, kind });
                        }
                    }
                }
            }
        }
    })
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Accumulates distinct paths and flushes them every window tick, plus a
/// final flush when the input closes.
fn spawn_batcher(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    sink: Arc<dyn IndexSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut batch: Vec<PathBuf> = Vec::new();
        let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(path) => {
                        if !batch.contains(&path) {
                            batch.push(path);
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            sink.update(std::mem::take(&mut batch)).await;
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        sink.update(std::mem::take(&mut batch)).await;
                    }
                }
            }
        }
    })
}

fn passes_filter(event: &WatchEvent, config: &WatcherDaemonConfig) -> bool {
    if event.path.strip_prefix(&config.root).is_err() {
        return false;
    }
    let path_str = event.path.to_string_lossy();
    if config
        .ignore_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && path_str.contains(pattern.as_str()))
    {
        return false;
    }
    if config.allowed_extensions.is_empty() {
        return true;
    }
    // Deletions pass regardless of extension so the index can drop rows.
    if event.kind == WatchKind::Deleted {
        return true;
    }
    match event.path.extension().and_then(|e| e.to_str()) {
        Some(ext) => config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed == &format!(".{ext}")),
        None => false,
    }
}

/// Debounced, batched file-system watcher feeding an [`IndexSink`].
pub struct WatcherDaemon {
    config: WatcherDaemonConfig,
    sink: Arc<dyn IndexSink>,
    raw_tx: Option<mpsc::UnboundedSender<WatchEvent>>,
    tasks: Vec<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

const STOP_GRACE: Duration = Duration::from_secs(2);

impl WatcherDaemon {
    pub fn new(config: WatcherDaemonConfig, sink: Arc<dyn IndexSink>) -> Self {
        Self {
            config,
            sink,
            raw_tx: None,
            tasks: Vec::new(),
            watcher: None,
        }
    }

    /// Build the pipeline and start watching the configured root.
    pub fn start(&mut self) -> ContextResult<()> {
        let raw_tx = self.start_pipeline();

        let tx_for_watcher = raw_tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let kind = match event.kind {
                        notify::EventKind::Create(_) => WatchKind::Created,
                        notify::EventKind::Modify(_) => WatchKind::Modified,
                        notify::EventKind::Remove(_) => WatchKind::Deleted,
                        _ => return,
                    };
                    for path in event.paths {
                        let _ = tx_for_watcher.send(WatchEvent { path, kind });
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "quorum.watcher", "watch error: {err}");
                }
            },
        )?;
        watcher.watch(&self.config.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);
        tracing::info!(
            target: "quorum.watcher",
            root = %self.config.root.display(),
            "watcher started"
        );
        Ok(())
    }

    /// Start only the debounce/filter/batch pipeline; events are fed through
    /// [`WatcherDaemon::inject`]. Used when the OS watcher is driven
    /// elsewhere and in tests.
    pub fn start_pipeline(&mut self) -> mpsc::UnboundedSender<WatchEvent> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<WatchEvent>();
        let (debounced_tx, mut debounced_rx) = mpsc::unbounded_channel::<WatchEvent>();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<PathBuf>();

        self.tasks
            .push(spawn_debouncer(self.config.debounce, raw_rx, debounced_tx));

        let config = self.config.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = debounced_rx.recv().await {
                if passes_filter(&event, &config) {
                    let _ = batch_tx.send(event.path);
                }
            }
        }));

        self.tasks.push(spawn_batcher(
            self.config.batch_window,
            batch_rx,
            self.sink.clone(),
        ));

        self.raw_tx = Some(raw_tx.clone());
        raw_tx
    }

    /// Feed one event into the pipeline.
    pub fn inject(&self, event: WatchEvent) {
        if let Some(tx) = &self.raw_tx {
            let _ = tx.send(event);
        }
    }

    /// Stop watching and flush pending work. The stages close in order —
    /// debouncer, filter, batcher — so anything already observed reaches the
    /// sink before this returns, within a bounded grace period.
    pub async fn stop(&mut self) {
        self.watcher.take();
        self.raw_tx.take();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                tracing::warn!(
                    target: "quorum.watcher",
                    "pipeline stage did not drain within the grace period"
                );
            }
        }
        tracing::info!(target: "quorum.watcher", "watcher stopped");
    }
}
