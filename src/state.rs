//! Directory state snapshots.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::path::{is_ignored_name, RelPath};

/// Metadata for one regular file under the monitored root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    /// Modification time in seconds since the Unix epoch.
    pub mtime: f64,
    /// File size in bytes.
    pub size: u64,
}

/// Snapshot of every regular file under the monitored root.
///
/// Existence is map membership; hidden entries and atomic-write
/// staging files are excluded, as are symlinks and other non-regular
/// entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirState {
    /// Per-path file metadata.
    pub files: FxHashMap<RelPath, FileStat>,
}

impl DirState {
    /// Build a snapshot with a single synchronous walk of `root`.
    ///
    /// Entries that vanish mid-walk are skipped rather than failing the
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a directory cannot be listed.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut files = FxHashMap::default();
        walk(root, root, &mut files)?;
        Ok(Self { files })
    }

    /// Metadata for `path`, if present.
    #[must_use]
    pub fn get(&self, path: &RelPath) -> Option<&FileStat> {
        self.files.get(path)
    }

    /// Whether `path` exists in the snapshot.
    #[must_use]
    pub fn contains(&self, path: &RelPath) -> bool {
        self.files.contains_key(path)
    }

    /// Number of files in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Modification time of `meta` in seconds since the Unix epoch.
///
/// Pre-epoch and unreadable mtimes clamp to zero, so they always lose
/// last-writer-wins comparisons.
#[must_use]
pub fn mtime_of(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64())
}

fn walk(root: &Path, dir: &Path, files: &mut FxHashMap<RelPath, FileStat>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // A subdirectory can vanish between listing and recursion.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != root => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_ignored_name(name) {
            continue;
        }
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            walk(root, &path, files)?;
        } else if meta.is_file() {
            if let Ok(rel) = RelPath::from_fs(root, &path) {
                files.insert(
                    rel,
                    FileStat {
                        mtime: mtime_of(&meta),
                        size: meta.len(),
                    },
                );
            }
        }
    }
    Ok(())
}
