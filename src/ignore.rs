//! Echo suppression for remotely applied updates.
//!
//! Applying a remote update writes to the monitored directory, which
//! the local watcher then reports back as an event. Each apply first
//! registers the path and the mtime it is about to stamp; the router
//! consumes the matching event instead of rebroadcasting it. A grace
//! timer expires entries the watcher never delivered (platforms may
//! coalesce events), so a dropped event cannot suppress future edits.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::path::RelPath;

/// How far apart two mtimes may be and still count as the same write.
///
/// Filesystems round mtimes differently; one millisecond covers every
/// platform this targets.
pub const MTIME_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy)]
struct IgnoreEntry {
    mtime: f64,
    inserted: Instant,
}

/// Short-lived set of paths whose next local event is a remote echo.
#[derive(Debug)]
pub struct IgnoreSet {
    entries: Mutex<FxHashMap<RelPath, IgnoreEntry>>,
    grace: Duration,
}

impl IgnoreSet {
    /// Create a set whose entries expire after `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            grace,
        }
    }

    /// Register an imminent remote write of `path` at `mtime`.
    ///
    /// A second insert for the same path replaces the previous entry;
    /// only the most recent remote write is expected to echo.
    pub fn insert(&self, path: RelPath, mtime: f64) {
        let mut entries = self.lock();
        entries.insert(
            path,
            IgnoreEntry {
                mtime,
                inserted: Instant::now(),
            },
        );
    }

    /// Try to consume an echo for `path`.
    ///
    /// `observed_mtime` is the event file's current mtime, or `None`
    /// when the file can no longer be stat'd (deletes). Returns `true`
    /// and removes the entry when it matches; expired entries are
    /// dropped and never match.
    pub fn consume(&self, path: &RelPath, observed_mtime: Option<f64>) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get(path).copied() else {
            return false;
        };
        if entry.inserted.elapsed() > self.grace {
            entries.remove(path);
            return false;
        }
        let matches = match observed_mtime {
            Some(observed) => (observed - entry.mtime).abs() <= MTIME_TOLERANCE,
            None => true,
        };
        if matches {
            entries.remove(path);
        }
        matches
    }

    /// Drop every entry older than the grace bound.
    pub fn sweep(&self) {
        let mut entries = self.lock();
        let grace = self.grace;
        entries.retain(|_, entry| entry.inserted.elapsed() <= grace);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<RelPath, IgnoreEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
