//! Applying remote updates to the local tree.
//!
//! Every apply first registers the path in the ignore set, then writes
//! atomically (same-directory staging file, rename into place), stamps
//! the remote mtime, and refreshes the signature store. Stale updates
//! (local mtime newer) are dropped; exactly equal mtimes fall back to a
//! deterministic content-hash comparison so concurrent edits converge
//! identically on every peer.

use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use tracing::debug;

use crate::engine::content_hash;
use crate::error::{Result, SyncError};
use crate::ignore::MTIME_TOLERANCE;
use crate::message::Message;
use crate::node::SyncContext;
use crate::path::{RelPath, TMP_SUFFIX};
use crate::state::mtime_of;

/// Apply one remote update message.
///
/// Returning `Ok` covers both applied and deliberately dropped (stale)
/// updates.
///
/// # Errors
///
/// Returns `InvalidPath`/`MissingBase`/`Delta`/`Io` for per-message
/// failures the session logs and drops, and `Protocol` for malformed
/// payloads that close the session.
pub fn apply_message(ctx: &SyncContext, msg: &Message) -> Result<()> {
    match msg {
        Message::Create { path, mtime, bytes } => {
            apply_create(ctx, path, check_mtime(*mtime)?, bytes)
        }
        Message::Modify { path, mtime, delta } => {
            apply_modify(ctx, path, check_mtime(*mtime)?, delta)
        }
        Message::Delete { path, mtime } => apply_delete(ctx, path, check_mtime(*mtime)?),
        Message::Rename { src, dst, mtime } => apply_rename(ctx, src, dst, check_mtime(*mtime)?),
        other => Err(SyncError::Protocol(format!(
            "{} is not an update message",
            other.kind()
        ))),
    }
}

fn apply_create(ctx: &SyncContext, path: &str, mtime: f64, bytes: &[u8]) -> Result<()> {
    let rel = validated(path)?;
    let _guard = ctx.lock_dir();
    let abs = rel.to_fs_path(ctx.root());

    if let Ok(meta) = fs::metadata(&abs) {
        let local_mtime = mtime_of(&meta);
        if local_mtime - mtime > MTIME_TOLERANCE {
            debug!(path = %rel, local_mtime, mtime, "dropping stale create");
            return Ok(());
        }
        if (local_mtime - mtime).abs() <= MTIME_TOLERANCE {
            let local = fs::read(&abs)?;
            if content_hash(bytes) <= content_hash(&local) {
                debug!(path = %rel, "dropping create on tiebreak");
                return Ok(());
            }
        }
    }

    write_file_as(ctx, &rel, &abs, bytes, mtime)
}

fn apply_modify(ctx: &SyncContext, path: &str, mtime: f64, delta: &[u8]) -> Result<()> {
    let rel = validated(path)?;
    let _guard = ctx.lock_dir();
    let abs = rel.to_fs_path(ctx.root());

    let base = match fs::read(&abs) {
        Ok(base) => base,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::MissingBase(rel.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let local_mtime = mtime_of(&fs::metadata(&abs)?);
    if local_mtime - mtime > MTIME_TOLERANCE {
        debug!(path = %rel, local_mtime, mtime, "dropping stale modify");
        return Ok(());
    }

    let patched = ctx.engine.patch(&base, delta)?;
    if (local_mtime - mtime).abs() <= MTIME_TOLERANCE
        && content_hash(&patched) <= content_hash(&base)
    {
        debug!(path = %rel, "dropping modify on tiebreak");
        return Ok(());
    }

    write_file_as(ctx, &rel, &abs, &patched, mtime)
}

fn apply_delete(ctx: &SyncContext, path: &str, mtime: f64) -> Result<()> {
    let rel = validated(path)?;
    let _guard = ctx.lock_dir();
    let abs = rel.to_fs_path(ctx.root());

    let Ok(meta) = fs::metadata(&abs) else {
        // Already gone; drop any leftover signature.
        ctx.store.remove(&rel)?;
        return Ok(());
    };
    let local_mtime = mtime_of(&meta);
    if local_mtime - mtime > MTIME_TOLERANCE {
        debug!(path = %rel, local_mtime, mtime, "dropping stale delete");
        return Ok(());
    }

    ctx.ignore.insert(rel.clone(), mtime);
    fs::remove_file(&abs)?;
    ctx.store.remove(&rel)?;
    debug!(path = %rel, "deleted");
    Ok(())
}

fn apply_rename(ctx: &SyncContext, src: &str, dst: &str, mtime: f64) -> Result<()> {
    let src = validated(src)?;
    let dst = validated(dst)?;
    let _guard = ctx.lock_dir();
    let src_abs = src.to_fs_path(ctx.root());
    let dst_abs = dst.to_fs_path(ctx.root());

    if fs::metadata(&src_abs).is_err() {
        debug!(src = %src, "rename source missing, dropping");
        return Ok(());
    }
    if let Ok(meta) = fs::metadata(&dst_abs) {
        if mtime_of(&meta) > mtime - MTIME_TOLERANCE {
            debug!(dst = %dst, "dropping rename over newer destination");
            return Ok(());
        }
    }

    if let Some(parent) = dst_abs.parent() {
        fs::create_dir_all(parent)?;
    }
    ctx.ignore.insert(src.clone(), mtime);
    ctx.ignore.insert(dst.clone(), mtime);
    fs::rename(&src_abs, &dst_abs)?;
    set_file_mtime(&dst_abs, mtime)?;
    ctx.store.rename(&src, &dst)?;
    if let Some(record) = ctx.store.load(&dst)? {
        ctx.store.save(&dst, mtime, &record.sig)?;
    }
    debug!(src = %src, dst = %dst, "renamed");
    Ok(())
}

/// Atomically replace `abs` with `bytes` stamped at `mtime`, updating
/// the ignore set and signature store.
fn write_file_as(
    ctx: &SyncContext,
    rel: &RelPath,
    abs: &Path,
    bytes: &[u8],
    mtime: f64,
) -> Result<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)?;
    }
    ctx.ignore.insert(rel.clone(), mtime);

    let staged = staging_path(abs);
    fs::write(&staged, bytes)?;
    set_file_mtime(&staged, mtime)?;
    fs::rename(&staged, abs)?;

    ctx.store.save(rel, mtime, &ctx.engine.signature(bytes))?;
    debug!(path = %rel, bytes = bytes.len(), mtime, "applied");
    Ok(())
}

fn staging_path(abs: &Path) -> std::path::PathBuf {
    let mut name = abs.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    abs.with_file_name(name)
}

fn set_file_mtime(abs: &Path, mtime: f64) -> Result<()> {
    let file = fs::File::options().write(true).open(abs)?;
    file.set_modified(UNIX_EPOCH + Duration::from_secs_f64(mtime))?;
    Ok(())
}

fn validated(path: &str) -> Result<RelPath> {
    let rel = RelPath::new(path)?;
    if rel.is_ignored() {
        return Err(SyncError::InvalidPath(format!("excluded path: {rel}")));
    }
    Ok(rel)
}

fn check_mtime(mtime: f64) -> Result<f64> {
    if mtime.is_finite() && mtime >= 0.0 {
        Ok(mtime)
    } else {
        Err(SyncError::Protocol(format!("unrepresentable mtime {mtime}")))
    }
}
