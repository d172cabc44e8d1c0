//! Library watcher.
//!
//! Polls the library tree, diffs successive snapshots into add/change/unlink
//! events and feeds them to the [`Ingestor`]. Startup runs a full scan, joins
//! every in-flight add, reports "ready" and then sweeps orphans.

mod pipeline;
pub mod remote;

pub use pipeline::{Candidate, FileEvent, Ingestor, Outcome};

use crate::error::{AppError, Result};
use crate::library;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Length in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: Option<SystemTime>,
}

/// Book files under the root at one point in time.
pub type Snapshot = BTreeMap<PathBuf, FileStamp>;

/// Stat every book file under `root`.
pub fn snapshot(root: &Path) -> Snapshot {
    library::discover(root)
        .into_iter()
        .filter_map(|file| {
            let metadata = std::fs::metadata(&file.path).ok()?;
            Some((
                file.path,
                FileStamp {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            ))
        })
        .collect()
}

/// Events turning `old` into `new`: unlinks first, then changes, then adds.
///
/// Unlinks go first so a moved file is re-added instead of being skipped as
/// a duplicate of the row that is about to disappear.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<FileEvent> {
    let unlinks = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .map(|path| FileEvent::Unlink(path.clone()));
    let changes = new
        .iter()
        .filter(|(path, stamp)| old.get(*path).is_some_and(|prev| prev != *stamp))
        .map(|(path, _)| FileEvent::Change(path.clone()));
    let adds = new
        .keys()
        .filter(|path| !old.contains_key(*path))
        .map(|path| FileEvent::Add(path.clone()));

    unlinks.chain(changes).chain(adds).collect()
}

/// Counts from the initial scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Book files found.
    pub files: usize,
    /// New rows.
    pub added: usize,
    /// Rows updated because their path held new content.
    pub updated: usize,
    /// Files already ingested with the same content.
    pub unchanged: usize,
    /// Files skipped as duplicate content.
    pub duplicates: usize,
    /// Files that failed.
    pub failed: usize,
}

/// Add every file of `snapshot`, `workers` at a time, and wait for all of them.
pub fn initial_scan(ingestor: &Ingestor, snapshot: &Snapshot, workers: usize) -> Result<ScanSummary> {
    let files: Vec<&PathBuf> = snapshot.keys().collect();
    let total = files.len();
    tracing::info!(files = total, workers, "Scanning library");

    let added = AtomicUsize::new(0);
    let updated = AtomicUsize::new(0);
    let unchanged = AtomicUsize::new(0);
    let duplicates = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let processed = AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build scan pool: {}", e)))?;

    pool.install(|| {
        files.par_iter().for_each(|path| {
            match ingestor.dispatch(&FileEvent::Add(PathBuf::clone(path))) {
                Some(Outcome::Added { .. }) => added.fetch_add(1, Ordering::Relaxed),
                Some(Outcome::Updated { .. }) => updated.fetch_add(1, Ordering::Relaxed),
                Some(Outcome::Unchanged) => unchanged.fetch_add(1, Ordering::Relaxed),
                Some(Outcome::Duplicate { .. }) => duplicates.fetch_add(1, Ordering::Relaxed),
                Some(_) => 0,
                None => failed.fetch_add(1, Ordering::Relaxed),
            };

            // Progress logging every 100 files
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if done.is_multiple_of(100) || done == total {
                tracing::info!("Processing... {}/{} ({}%)", done, total, (done * 100) / total);
            }
        });
    });

    Ok(ScanSummary {
        files: total,
        added: added.into_inner(),
        updated: updated.into_inner(),
        unchanged: unchanged.into_inner(),
        duplicates: duplicates.into_inner(),
        failed: failed.into_inner(),
    })
}

/// Long-lived watcher over a local library root.
pub struct Watcher {
    ingestor: Ingestor,
    root: PathBuf,
    interval: Duration,
    workers: usize,
}

impl Watcher {
    /// Create a watcher.
    pub fn new(ingestor: Ingestor, root: PathBuf, interval: Duration, workers: usize) -> Self {
        Self {
            ingestor,
            root,
            interval,
            workers,
        }
    }

    /// Scan, sweep orphans, then poll until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if !self.root.is_dir() {
            return Err(AppError::Config(format!(
                "Library path is not a directory: {}",
                self.root.display()
            )));
        }

        let ingestor = self.ingestor.clone();
        let root = self.root.clone();
        let workers = self.workers;
        let mut current = tokio::task::spawn_blocking(move || -> Result<Snapshot> {
            let start = std::time::Instant::now();
            let snapshot = snapshot(&root);
            let summary = initial_scan(&ingestor, &snapshot, workers)?;
            tracing::info!(
                files = summary.files,
                added = summary.added,
                updated = summary.updated,
                unchanged = summary.unchanged,
                duplicates = summary.duplicates,
                failed = summary.failed,
                elapsed = ?start.elapsed(),
                "Initial scan complete, watcher ready"
            );
            ingestor.orphan_sweep()?;
            Ok(snapshot)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Scan task failed: {}", e)))??;

        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Watcher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let ingestor = self.ingestor.clone();
                    let root = self.root.clone();
                    let previous = std::mem::take(&mut current);
                    current = tokio::task::spawn_blocking(move || poll_once(&ingestor, &root, &previous))
                        .await
                        .map_err(|e| AppError::Internal(format!("Poll task failed: {}", e)))?;
                }
            }
        }
    }
}

/// Take a new snapshot and apply its differences in order.
pub fn poll_once(ingestor: &Ingestor, root: &Path, previous: &Snapshot) -> Snapshot {
    let next = snapshot(root);
    for event in diff(previous, &next) {
        tracing::debug!(event = ?event, "File event");
        ingestor.dispatch(&event);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(size: u64, secs: u64) -> FileStamp {
        FileStamp {
            size,
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }

    #[test]
    fn diff_orders_unlinks_before_adds() {
        let old: Snapshot = [
            (PathBuf::from("/l/a.pdf"), stamp(1, 1)),
            (PathBuf::from("/l/b.pdf"), stamp(2, 2)),
        ]
        .into_iter()
        .collect();
        let new: Snapshot = [
            (PathBuf::from("/l/b.pdf"), stamp(3, 3)),
            (PathBuf::from("/l/c.pdf"), stamp(1, 1)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            diff(&old, &new),
            vec![
                FileEvent::Unlink(PathBuf::from("/l/a.pdf")),
                FileEvent::Change(PathBuf::from("/l/b.pdf")),
                FileEvent::Add(PathBuf::from("/l/c.pdf")),
            ]
        );
    }

    #[test]
    fn identical_snapshots_have_no_events() {
        let snap: Snapshot = [(PathBuf::from("/l/a.epub"), stamp(5, 9))].into_iter().collect();
        assert!(diff(&snap, &snap).is_empty());
    }
}
