//! Delta-transfer engine.
//!
//! Thin wrapper over the `fast_rsync` signature/delta/patch primitives,
//! plus the content hash used to break last-writer-wins ties. The
//! engine deals purely in byte buffers; persistence and the wire format
//! live elsewhere.

use fast_rsync::{apply, diff, Signature, SignatureOptions};

use crate::error::{Result, SyncError};

/// Length of the per-block strong hash embedded in signatures.
const CRYPTO_HASH_SIZE: u32 = 8;

/// Signature, delta, and patch operations at a fixed block size.
#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    block_size: u32,
}

impl DeltaEngine {
    /// Create an engine. The block size is validated by
    /// [`Config::validate`](crate::Config::validate) before it reaches
    /// this point.
    #[must_use]
    pub const fn new(block_size: u32) -> Self {
        Self { block_size }
    }

    /// The configured block size.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Compute the serialized signature of a file's content.
    #[must_use]
    pub fn signature(&self, data: &[u8]) -> Vec<u8> {
        Signature::calculate(
            data,
            SignatureOptions {
                block_size: self.block_size,
                crypto_hash_size: CRYPTO_HASH_SIZE,
            },
        )
        .into_serialized()
    }

    /// Compute a delta that transforms content matching `sig` into
    /// `data`.
    ///
    /// # Errors
    ///
    /// Returns `Signature` if `sig` is not a parseable signature and
    /// `Delta` if diffing fails.
    pub fn delta(&self, sig: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let signature = Signature::deserialize(sig.to_vec())
            .map_err(|e| SyncError::Signature(e.to_string()))?;
        let mut out = Vec::new();
        diff(&signature.index(), data, &mut out).map_err(|e| SyncError::Delta(e.to_string()))?;
        Ok(out)
    }

    /// Apply `delta` to `base`, reconstructing the sender's content.
    ///
    /// # Errors
    ///
    /// Returns `Delta` if the delta is corrupt or does not match the
    /// base.
    pub fn patch(&self, base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        apply(base, delta, &mut out).map_err(|e| SyncError::Delta(e.to_string()))?;
        Ok(out)
    }
}

/// Strong hash of file content, used as the deterministic tiebreak when
/// two edits carry the same mtime.
#[must_use]
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}
