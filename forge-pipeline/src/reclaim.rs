// Disk Reclaimer
// Best-effort removal of large intermediates between stages

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::stages::StageId;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What a reclamation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub removed: Vec<PathBuf>,
    pub absent: Vec<PathBuf>,
    /// Paths that could not be removed, with the error text
    pub errors: Vec<(PathBuf, String)>,
}

impl ReclaimReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: ReclaimReport) {
        self.removed.extend(other.removed);
        self.absent.extend(other.absent);
        self.errors.extend(other.errors);
    }
}

/// Removes scratch paths. Never fails: missing paths and removal errors are
/// logged and reported, not raised.
#[derive(Debug, Clone, Default)]
pub struct DiskReclaimer {
    event_tx: Option<ProgressSender>,
}

impl DiskReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Remove directories recursively
    pub fn reclaim(&self, stage: StageId, dirs: &[PathBuf]) -> ReclaimReport {
        self.remove_each(stage, dirs, |path| fs::remove_dir_all(path))
    }

    /// Remove single files (or symlinks)
    pub fn reclaim_files(&self, stage: StageId, files: &[PathBuf]) -> ReclaimReport {
        self.remove_each(stage, files, |path| fs::remove_file(path))
    }

    /// Remove directories, then files
    pub fn reclaim_all(&self, stage: StageId, dirs: &[PathBuf], files: &[PathBuf]) -> ReclaimReport {
        let mut report = self.reclaim(stage, dirs);
        report.merge(self.reclaim_files(stage, files));
        report
    }

    fn remove_each<F>(&self, stage: StageId, paths: &[PathBuf], remove: F) -> ReclaimReport
    where
        F: Fn(&Path) -> io::Result<()>,
    {
        let mut report = ReclaimReport::default();

        for path in paths {
            // symlink_metadata so dangling links still count as present
            if fs::symlink_metadata(path).is_err() {
                tracing::debug!(stage = %stage, path = %path.display(), "Nothing to reclaim");
                report.absent.push(path.clone());
                continue;
            }

            match remove(path) {
                Ok(()) => {
                    tracing::info!(stage = %stage, path = %path.display(), "Reclaimed");
                    self.event_tx.send_event(ExecutionEvent::DirectoryReclaimed {
                        stage,
                        path: path.clone(),
                    });
                    report.removed.push(path.clone());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.absent.push(path.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        stage = %stage,
                        path = %path.display(),
                        error = %e,
                        "Failed to reclaim, continuing"
                    );
                    report.errors.push((path.clone(), e.to_string()));
                }
            }
        }

        report
    }
}
