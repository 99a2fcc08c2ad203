//! Persistent per-file signature cache.
//!
//! Every synchronized file has one opaque record in the signature
//! directory, named by a reversible encoding of its relative path. The
//! record carries the mtime the signature was computed at, so an
//! unchanged file's signature is reused without rereading the file.
//! The store is cleared at startup; a restarting node regenerates
//! signatures from its first directory walk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::ignore::MTIME_TOLERANCE;
use crate::path::RelPath;

const RECORD_EXT: &str = "sig";

/// One persisted signature record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSignature {
    /// Modification time of the file when the signature was computed.
    pub mtime: f64,
    /// Serialized signature bytes.
    pub sig: Vec<u8>,
}

/// Signature cache backed by one file per path.
///
/// All operations serialize on one internal lock; signature files are
/// small and the coarse lock keeps rename/remove pairs atomic with
/// respect to concurrent sessions.
#[derive(Debug)]
pub struct SignatureStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SignatureStore {
    /// Open the store, clearing any records left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be reset or created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// The store's backing directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a signature for `path`.
    ///
    /// # Errors
    ///
    /// Returns `Signature` on encoding failure and `Io` on write
    /// failure.
    pub fn save(&self, path: &RelPath, mtime: f64, sig: &[u8]) -> Result<()> {
        let record = StoredSignature {
            mtime,
            sig: sig.to_vec(),
        };
        let encoded = bincode::serialize(&record)
            .map_err(|e| SyncError::Signature(format!("encode record for {path}: {e}")))?;
        let _guard = self.guard();
        fs::write(self.record_path(path), encoded)?;
        Ok(())
    }

    /// Load the signature record for `path`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `Signature` if an existing record fails to decode and
    /// `Io` on read failure other than absence.
    pub fn load(&self, path: &RelPath) -> Result<Option<StoredSignature>> {
        let _guard = self.guard();
        let bytes = match fs::read(self.record_path(path)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = bincode::deserialize(&bytes)
            .map_err(|e| SyncError::Signature(format!("decode record for {path}: {e}")))?;
        Ok(Some(record))
    }

    /// Load the stored signature only if it was computed at `mtime`
    /// (within tolerance); a stale record reads as absent.
    ///
    /// # Errors
    ///
    /// Propagates [`SignatureStore::load`] failures.
    pub fn load_current(&self, path: &RelPath, mtime: f64) -> Result<Option<StoredSignature>> {
        Ok(self
            .load(path)?
            .filter(|record| (record.mtime - mtime).abs() <= MTIME_TOLERANCE))
    }

    /// Remove the record for `path`. Removing an absent record is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `Io` on removal failure other than absence.
    pub fn remove(&self, path: &RelPath) -> Result<()> {
        let _guard = self.guard();
        match fs::remove_file(self.record_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the record for `src` to `dst`. A missing source record is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `Io` on rename failure other than source absence.
    pub fn rename(&self, src: &RelPath, dst: &RelPath) -> Result<()> {
        let _guard = self.guard();
        match fs::rename(self.record_path(src), self.record_path(dst)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every path that currently has a record.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory cannot be listed.
    pub fn paths(&self) -> Result<Vec<RelPath>> {
        let _guard = self.guard();
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{RECORD_EXT}")) else {
                continue;
            };
            if let Ok(path) = RelPath::decode_store_name(stem) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    fn record_path(&self, path: &RelPath) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", path.encode_store_name()))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SignatureStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SignatureStore::open(dir.path().join("sigs")).unwrap();
        (dir, store)
    }

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn save_and_load() {
        let (_dir, store) = store();
        let path = rel("a/b.txt");
        store.save(&path, 100.5, &[1, 2, 3]).unwrap();

        let record = store.load(&path).unwrap().unwrap();
        assert_eq!(record.mtime, 100.5);
        assert_eq!(record.sig, vec![1, 2, 3]);
    }

    #[test]
    fn load_absent_is_none() {
        let (_dir, store) = store();
        assert!(store.load(&rel("nope")).unwrap().is_none());
    }

    #[test]
    fn load_current_filters_stale() {
        let (_dir, store) = store();
        let path = rel("x");
        store.save(&path, 100.0, &[9]).unwrap();

        assert!(store.load_current(&path, 100.0).unwrap().is_some());
        assert!(store.load_current(&path, 100.0005).unwrap().is_some());
        assert!(store.load_current(&path, 101.0).unwrap().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        let path = rel("gone");
        store.save(&path, 1.0, &[0]).unwrap();
        store.remove(&path).unwrap();
        store.remove(&path).unwrap();
        assert!(store.load(&path).unwrap().is_none());
    }

    #[test]
    fn rename_moves_record() {
        let (_dir, store) = store();
        let src = rel("foo");
        let dst = rel("bar");
        store.save(&src, 400.0, &[4]).unwrap();
        store.rename(&src, &dst).unwrap();

        assert!(store.load(&src).unwrap().is_none());
        assert_eq!(store.load(&dst).unwrap().unwrap().sig, vec![4]);
    }

    #[test]
    fn rename_missing_source_is_noop() {
        let (_dir, store) = store();
        store.rename(&rel("absent"), &rel("anywhere")).unwrap();
    }

    #[test]
    fn paths_lists_decoded() {
        let (_dir, store) = store();
        store.save(&rel("a/b c.txt"), 1.0, &[1]).unwrap();
        store.save(&rel("top.log"), 2.0, &[2]).unwrap();

        let paths = store.paths().unwrap();
        assert_eq!(paths, vec![rel("a/b c.txt"), rel("top.log")]);
    }

    #[test]
    fn open_clears_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let sig_dir = dir.path().join("sigs");
        {
            let store = SignatureStore::open(&sig_dir).unwrap();
            store.save(&rel("leftover"), 1.0, &[1]).unwrap();
        }
        let store = SignatureStore::open(&sig_dir).unwrap();
        assert!(store.paths().unwrap().is_empty());
    }
}
