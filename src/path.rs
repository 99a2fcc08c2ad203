//! Relative path handling.
//!
//! A [`RelPath`] is the canonical identifier for a file across peers:
//! relative to the monitored root, forward-slash separated, and never
//! escaping the root. All wire paths pass through validation here before
//! touching the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Suffix for atomic-write temporary files inside the monitored root.
///
/// Paths carrying this suffix are invisible to the watcher and to
/// directory walks, so remote applies never echo their staging files.
pub const TMP_SUFFIX: &str = ".lansync.tmp";

/// Whether a single path component is excluded from synchronization.
///
/// Hidden entries (leading dot) and atomic-write staging files are
/// never walked, watched, or accepted from the wire.
#[must_use]
pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(TMP_SUFFIX)
}

/// A validated path relative to the monitored root.
///
/// Always uses forward-slash separators regardless of platform, never
/// contains `.`/`..` components, and is never absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath(String);

impl RelPath {
    /// Validate and normalize a relative path string.
    ///
    /// Backslash separators are normalized to forward slashes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if the path is empty, absolute, contains
    /// a NUL byte, or contains `.`/`..` components.
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(SyncError::InvalidPath("empty path".into()));
        }
        if raw.contains('\0') {
            return Err(SyncError::InvalidPath(format!("NUL byte in {raw:?}")));
        }
        let normalized = raw.replace('\\', "/");
        if normalized.starts_with('/') || has_windows_prefix(&normalized) {
            return Err(SyncError::InvalidPath(format!("absolute path: {raw}")));
        }
        for component in normalized.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(SyncError::InvalidPath(format!(
                    "component {component:?} in {raw}"
                )));
            }
        }
        Ok(Self(normalized))
    }

    /// Derive the relative path of `abs` under `root`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` if `abs` does not lie under `root` or is
    /// not valid UTF-8.
    pub fn from_fs(root: &Path, abs: &Path) -> Result<Self> {
        let stripped = abs.strip_prefix(root).map_err(|_| {
            SyncError::InvalidPath(format!("{} escapes monitored root", abs.display()))
        })?;
        let mut parts = Vec::new();
        for component in stripped.components() {
            let os = component.as_os_str();
            let part = os.to_str().ok_or_else(|| {
                SyncError::InvalidPath(format!("non-UTF-8 path: {}", abs.display()))
            })?;
            parts.push(part);
        }
        Self::new(parts.join("/"))
    }

    /// The normalized relative path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve this path under a filesystem root.
    #[must_use]
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.0.split('/') {
            out.push(component);
        }
        out
    }

    /// Whether any component of this path is excluded from sync.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.0.split('/').any(is_ignored_name)
    }

    /// Encode this path into a single flat filename for the signature
    /// store. Reversible via [`RelPath::decode_store_name`].
    ///
    /// Alphanumerics and `-._` pass through; every other byte becomes
    /// `%XX`.
    #[must_use]
    pub fn encode_store_name(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' => {
                    out.push(byte as char);
                }
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
        out
    }

    /// Decode a signature-store filename back into a relative path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` on malformed escapes, non-UTF-8 decoded
    /// bytes, or a decoded string that fails path validation.
    pub fn decode_store_name(encoded: &str) -> Result<Self> {
        let bytes = encoded.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = bytes.get(i + 1..i + 3).ok_or_else(|| {
                    SyncError::InvalidPath(format!("truncated escape in {encoded}"))
                })?;
                let hex = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        SyncError::InvalidPath(format!("bad escape in {encoded}"))
                    })?;
                out.push(hex);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        let decoded = String::from_utf8(out)
            .map_err(|_| SyncError::InvalidPath(format!("non-UTF-8 decode of {encoded}")))?;
        Self::new(decoded)
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn has_windows_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}
