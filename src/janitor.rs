//! Retention janitor for the recordings tree.
//!
//! Sweeps `<root>/<camera_id>/...` every few hours, deleting `.mp4` files
//! whose modification time fell out of the retention window, then pruning
//! empty directories depth-first. Errors are logged and never halt a sweep.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time between sweeps. The first sweep runs immediately on start.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub files_deleted: usize,
    pub dirs_removed: usize,
}

pub struct StorageJanitor {
    root: PathBuf,
    retention_days: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StorageJanitor {
    pub fn new(root: PathBuf, retention_days: u64) -> Self {
        Self {
            root,
            retention_days,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Spawn the periodic sweep task; the first sweep runs right away.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let root = self.root.clone();
        let days = self.retention_days;
        let cancel = self.cancel.clone();

        self.handle = Some(tokio::spawn(async move {
            info!(root = %root.display(), retention_days = days, "Storage janitor started");
            loop {
                let sweep_root = root.clone();
                match tokio::task::spawn_blocking(move || sweep(&sweep_root, days)).await {
                    Ok(stats) => {
                        if stats.files_deleted > 0 || stats.dirs_removed > 0 {
                            info!(
                                files = stats.files_deleted,
                                dirs = stats.dirs_removed,
                                "Janitor sweep finished"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Janitor sweep task failed"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(SWEEP_INTERVAL) => {}
                }
            }
            info!("Storage janitor stopped");
        }));
    }

    /// Cancel the sweep task and wait for it to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// One retention pass over the recordings tree.
pub fn sweep(root: &Path, retention_days: u64) -> SweepStats {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days.saturating_mul(86_400));
    sweep_before(root, cutoff)
}

/// Delete `.mp4` files modified before `cutoff`, then prune empty dirs.
pub fn sweep_before(root: &Path, cutoff: SystemTime) -> SweepStats {
    let mut stats = SweepStats::default();
    if !root.is_dir() {
        return stats;
    }

    let cameras = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Recordings root inaccessible");
            return stats;
        }
    };

    for entry in cameras.flatten() {
        let camera_dir = entry.path();
        if camera_dir.is_dir() {
            delete_expired_files(&camera_dir, cutoff, &mut stats);
        }
    }

    prune_empty_dirs(root, &mut stats);
    stats
}

fn delete_expired_files(dir: &Path, cutoff: SystemTime, stats: &mut SweepStats) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read directory, skipping");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            delete_expired_files(&path, cutoff, stats);
            continue;
        }
        if path.extension().map(|e| e != "mp4").unwrap_or(true) {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        let Ok(modified) = modified else { continue };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(file = %path.display(), "Expired recording removed");
                    stats.files_deleted += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Delete failed"),
            }
        }
    }
}

/// Remove empty directories under `root`, deepest first. `root` itself is
/// kept.
fn prune_empty_dirs(root: &Path, stats: &mut SweepStats) {
    let mut dirs = Vec::new();
    collect_dirs(root, &mut dirs);
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    for dir in dirs {
        let is_empty = std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty && std::fs::remove_dir(&dir).is_ok() {
            stats.dirs_removed += 1;
        }
    }
}

fn collect_dirs(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.push(path.clone());
            collect_dirs(&path, out);
        }
    }
}
