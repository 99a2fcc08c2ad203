//! Filesystem event source.
//!
//! Wraps a recursive `notify` watcher and maps raw platform events to
//! the four event shapes the router consumes. Hidden entries and
//! atomic-write staging files are filtered here, before any routing;
//! a rename whose source is a staging file degrades to a modify of the
//! destination, which is exactly what a remote apply's temp-and-rename
//! looks like from outside.

use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::error;

use crate::error::{Result, SyncError};
use crate::path::RelPath;

/// One local filesystem event, with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEvent {
    /// A file appeared.
    Create(PathBuf),
    /// A file's content or metadata changed.
    Modify(PathBuf),
    /// A file disappeared.
    Delete(PathBuf),
    /// A file moved from the first path to the second.
    Rename(PathBuf, PathBuf),
}

/// Recursive watcher over the monitored root.
///
/// The inner `notify` watcher must stay alive for events to flow; drop
/// the `DirWatcher` to stop the stream and disconnect receivers.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<DirEvent>,
}

impl DirWatcher {
    /// Start watching `root` recursively.
    ///
    /// # Errors
    ///
    /// Returns `Watch` if the platform watcher cannot be created or the
    /// root cannot be watched.
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = unbounded();
        let root_owned = root.to_path_buf();

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for mapped in map_event(&root_owned, &event) {
                        if tx.send(mapped).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("watcher error: {e}"),
            })
            .map_err(|e| SyncError::Watch(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Watch(e.to_string()))?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// A receiver of mapped events. Clones share one stream.
    #[must_use]
    pub fn events(&self) -> Receiver<DirEvent> {
        self.events.clone()
    }
}

/// Whether `path` is a synchronizable file path under `root`.
fn relevant(root: &Path, path: &Path) -> bool {
    RelPath::from_fs(root, path).map_or(false, |rel| !rel.is_ignored())
}

fn upsert_or_delete(path: &Path) -> Option<DirEvent> {
    // The file may already be gone by the time the event arrives;
    // classify by what is on disk now.
    if path.is_file() {
        Some(DirEvent::Modify(path.to_path_buf()))
    } else if path.exists() {
        None
    } else {
        Some(DirEvent::Delete(path.to_path_buf()))
    }
}

fn map_event(root: &Path, event: &Event) -> Vec<DirEvent> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| relevant(root, p) && p.is_file())
            .map(|p| DirEvent::Create(p.clone()))
            .collect(),

        EventKind::Modify(ModifyKind::Name(mode)) => map_rename(root, event, *mode),

        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| relevant(root, p))
            .filter_map(|p| upsert_or_delete(p))
            .collect(),

        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(|p| relevant(root, p))
            .map(|p| DirEvent::Delete(p.clone()))
            .collect(),

        EventKind::Access(_) => Vec::new(),

        _ => event
            .paths
            .iter()
            .filter(|p| relevant(root, p))
            .filter_map(|p| upsert_or_delete(p))
            .collect(),
    }
}

fn map_rename(root: &Path, event: &Event, mode: RenameMode) -> Vec<DirEvent> {
    match mode {
        RenameMode::Both if event.paths.len() == 2 => {
            let src = &event.paths[0];
            let dst = &event.paths[1];
            match (relevant(root, src), relevant(root, dst)) {
                (true, true) if dst.is_file() => {
                    vec![DirEvent::Rename(src.clone(), dst.clone())]
                }
                // Staging file renamed into place: content replacement.
                (false, true) if dst.is_file() => vec![DirEvent::Modify(dst.clone())],
                // Renamed out of scope: the file is gone as far as
                // peers are concerned.
                (true, false) => vec![DirEvent::Delete(src.clone())],
                _ => Vec::new(),
            }
        }
        RenameMode::From => event
            .paths
            .iter()
            .filter(|p| relevant(root, p))
            .map(|p| DirEvent::Delete(p.clone()))
            .collect(),
        RenameMode::To => event
            .paths
            .iter()
            .filter(|p| relevant(root, p) && p.is_file())
            .map(|p| DirEvent::Modify(p.clone()))
            .collect(),
        _ => event
            .paths
            .iter()
            .filter(|p| relevant(root, p))
            .filter_map(|p| upsert_or_delete(p))
            .collect(),
    }
}
