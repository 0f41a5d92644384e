//! Tracking of temp files created or owned during one validation run.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared set of temp paths owned by a validation run.
///
/// Clones share the same set, so a caller holding a clone can enumerate
/// and delete everything tracked so far while validation is still running
/// on another thread (e.g. after an external deadline fired).
///
/// [`TempTracker::cancel`] is sticky: once cancelled, every path tracked
/// afterwards is deleted on the spot and the owning run stops at its next
/// check.
#[derive(Debug, Clone, Default)]
pub struct TempTracker {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
    cancelled: Arc<AtomicBool>,
}

impl TempTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn track(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.lock();
        if self.is_cancelled() {
            drop(paths);
            tracing::debug!(path = %path.display(), "Run cancelled, removing temp path at once");
            remove_path(&path);
            return;
        }
        paths.insert(path);
    }

    /// Marks the run as cancelled and deletes everything tracked so far.
    /// Returns the number of paths removed.
    pub fn cancel(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        self.remove_all()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stops tracking `path` without touching the filesystem.
    pub fn untrack(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deletes every tracked file or directory and clears the set.
    /// Returns the number of paths actually removed.
    pub fn remove_all(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let removed = paths.iter().filter(|path| remove_path(path)).count();
        if removed > 0 {
            tracing::debug!(removed, "Removed tracked temp paths");
        }
        removed
    }

    /// Hands every tracked path over to the caller without deleting it.
    pub fn release_all(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }
}

/// Deletes a file or directory tree. Returns whether something was removed.
fn remove_path(path: &Path) -> bool {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp path");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_all_deletes_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        let nested = dir.path().join("nested");
        fs::write(&file, b"a").unwrap();
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("b.bin"), b"b").unwrap();

        let tracker = TempTracker::new();
        tracker.track(&file);
        tracker.track(&nested);
        tracker.track(dir.path().join("missing"));
        assert_eq!(tracker.len(), 3);

        assert_eq!(tracker.remove_all(), 2);
        assert!(!file.exists());
        assert!(!nested.exists());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_release_all_keeps_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("keep.bin");
        fs::write(&file, b"k").unwrap();

        let tracker = TempTracker::new();
        tracker.track(&file);
        let shared = tracker.clone();
        assert_eq!(shared.paths(), vec![file.clone()]);

        assert_eq!(tracker.release_all(), vec![file.clone()]);
        assert!(shared.is_empty());
        assert!(file.exists());
    }

    #[test]
    fn test_paths_tracked_after_cancel_are_removed_at_once() {
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("before.bin");
        let after = dir.path().join("after");
        fs::write(&before, b"b").unwrap();

        let tracker = TempTracker::new();
        tracker.track(&before);
        let worker = tracker.clone();
        assert_eq!(tracker.cancel(), 1);
        assert!(worker.is_cancelled());
        assert!(!before.exists());

        fs::create_dir(&after).unwrap();
        fs::write(after.join("entry.bin"), b"e").unwrap();
        worker.track(&after);
        assert!(!after.exists());
        assert!(worker.is_empty());
    }

    #[test]
    fn test_untrack() {
        let tracker = TempTracker::new();
        tracker.track("/tmp/x");
        assert!(tracker.untrack(Path::new("/tmp/x")));
        assert!(!tracker.untrack(Path::new("/tmp/x")));
    }
}
