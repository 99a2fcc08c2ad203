//! Local event routing.
//!
//! Consumes watcher events, discards echoes of remote applies via the
//! ignore set, classifies the rest, and fans the resulting updates out
//! to every synchronized peer. For a modify, the outbound delta is
//! computed against the signature the peers last saw, and only after
//! the message is enqueued everywhere is the stored signature advanced
//! to the new content.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::Message;
use crate::node::SyncContext;
use crate::path::RelPath;
use crate::registry::PeerRegistry;
use crate::state::mtime_of;
use crate::watcher::DirEvent;

/// Drain watcher events until the channel disconnects.
pub(crate) fn run(events: &Receiver<DirEvent>, ctx: &Arc<SyncContext>, registry: &Arc<PeerRegistry>) {
    while let Ok(event) = events.recv() {
        if let Err(e) = handle_event(ctx, registry, &event) {
            warn!("event handling failed: {e}");
        }
    }
    debug!("event router stopped");
}

/// Route one filesystem event.
///
/// # Errors
///
/// Returns `Io`/`Signature` errors from reading content or the
/// signature store; individual events never abort the router loop.
pub(crate) fn handle_event(
    ctx: &SyncContext,
    registry: &PeerRegistry,
    event: &DirEvent,
) -> Result<()> {
    match event {
        DirEvent::Create(path) => upsert(ctx, registry, path, true),
        DirEvent::Modify(path) => upsert(ctx, registry, path, false),
        DirEvent::Delete(path) => delete(ctx, registry, path),
        DirEvent::Rename(src, dst) => rename(ctx, registry, src, dst),
    }
}

fn resolve(ctx: &SyncContext, abs: &Path) -> Option<RelPath> {
    match RelPath::from_fs(ctx.root(), abs) {
        Ok(rel) if !rel.is_ignored() => Some(rel),
        Ok(_) => None,
        Err(e) => {
            debug!(path = %abs.display(), "unroutable event path: {e}");
            None
        }
    }
}

fn upsert(ctx: &SyncContext, registry: &PeerRegistry, abs: &Path, created: bool) -> Result<()> {
    let Some(rel) = resolve(ctx, abs) else {
        return Ok(());
    };
    let Ok(meta) = fs::metadata(abs) else {
        // Vanished since the event fired; the delete event handles it.
        return Ok(());
    };
    let mtime = mtime_of(&meta);

    if ctx.ignore.consume(&rel, Some(mtime)) {
        debug!(path = %rel, "suppressed remote echo");
        return Ok(());
    }

    let bytes = match fs::read(abs) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let new_sig = ctx.engine.signature(&bytes);

    let prior = if created { None } else { ctx.store.load(&rel)? };
    let msg = match prior {
        Some(record) => match ctx.engine.delta(&record.sig, &bytes) {
            Ok(delta) => Message::Modify {
                path: rel.as_str().to_string(),
                mtime,
                delta,
            },
            Err(e) => {
                debug!(path = %rel, "stored signature unusable ({e}), sending full file");
                Message::Create {
                    path: rel.as_str().to_string(),
                    mtime,
                    bytes: bytes.clone(),
                }
            }
        },
        None => Message::Create {
            path: rel.as_str().to_string(),
            mtime,
            bytes: bytes.clone(),
        },
    };

    info!(path = %rel, kind = msg.kind(), size = bytes.len(), "local change");
    registry.broadcast(&msg, true);
    // Advance the baseline only after the delta is on every queue.
    ctx.store.save(&rel, mtime, &new_sig)?;
    Ok(())
}

fn delete(ctx: &SyncContext, registry: &PeerRegistry, abs: &Path) -> Result<()> {
    let Some(rel) = resolve(ctx, abs) else {
        return Ok(());
    };
    if ctx.ignore.consume(&rel, None) {
        debug!(path = %rel, "suppressed remote delete echo");
        return Ok(());
    }

    let mtime = ctx.clock.now();
    info!(path = %rel, "local delete");
    registry.broadcast(
        &Message::Delete {
            path: rel.as_str().to_string(),
            mtime,
        },
        true,
    );
    ctx.store.remove(&rel)?;
    Ok(())
}

fn rename(ctx: &SyncContext, registry: &PeerRegistry, src_abs: &Path, dst_abs: &Path) -> Result<()> {
    let src = resolve(ctx, src_abs);
    let dst = resolve(ctx, dst_abs);
    match (src, dst) {
        (Some(src), Some(dst)) => {
            let observed = fs::metadata(dst_abs).ok().map(|m| mtime_of(&m));
            let src_echo = ctx.ignore.consume(&src, None);
            let dst_echo = ctx.ignore.consume(&dst, observed);
            if src_echo || dst_echo {
                debug!(src = %src, dst = %dst, "suppressed remote rename echo");
                return Ok(());
            }

            let mtime = ctx.clock.now();
            info!(src = %src, dst = %dst, "local rename");
            registry.broadcast(
                &Message::Rename {
                    src: src.as_str().to_string(),
                    dst: dst.as_str().to_string(),
                    mtime,
                },
                true,
            );
            ctx.store.rename(&src, &dst)?;
            Ok(())
        }
        // Half the pair is out of scope: degrade to what peers can see.
        (Some(_), None) => delete(ctx, registry, src_abs),
        (None, Some(_)) => upsert(ctx, registry, dst_abs, false),
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::Config;
    use crate::node::SyncContext;
    use std::sync::atomic::AtomicBool;

    struct FixedClock(f64);

    impl Clock for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        _sigs: tempfile::TempDir,
        ctx: Arc<SyncContext>,
        registry: Arc<PeerRegistry>,
    }

    fn fixture(clock_now: f64) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let sigs = tempfile::tempdir().unwrap();
        let mut config = Config::new(root.path());
        config.signature_dir = sigs.path().join("store");
        let ctx = Arc::new(
            SyncContext::with_clock(config, Arc::new(FixedClock(clock_now))).unwrap(),
        );
        let registry = PeerRegistry::new(
            crate::registry::PeerId {
                ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: 0,
            },
            Arc::clone(&ctx),
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            _root: root,
            _sigs: sigs,
            ctx,
            registry,
        }
    }

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn create_event_stores_signature() {
        let f = fixture(1000.0);
        let abs = f.ctx.root().join("fresh.txt");
        fs::write(&abs, b"fresh content").unwrap();

        handle_event(&f.ctx, &f.registry, &DirEvent::Create(abs)).unwrap();

        let record = f.ctx.store.load(&rel("fresh.txt")).unwrap().unwrap();
        assert!(!record.sig.is_empty());
    }

    #[test]
    fn modify_event_advances_signature() {
        let f = fixture(1000.0);
        let abs = f.ctx.root().join("doc.txt");
        fs::write(&abs, b"version one").unwrap();
        handle_event(&f.ctx, &f.registry, &DirEvent::Create(abs.clone())).unwrap();
        let before = f.ctx.store.load(&rel("doc.txt")).unwrap().unwrap();

        fs::write(&abs, b"version two, longer than before").unwrap();
        handle_event(&f.ctx, &f.registry, &DirEvent::Modify(abs)).unwrap();
        let after = f.ctx.store.load(&rel("doc.txt")).unwrap().unwrap();
        assert_ne!(before.sig, after.sig);
    }

    #[test]
    fn echo_is_consumed_not_routed() {
        let f = fixture(1000.0);
        let abs = f.ctx.root().join("echoed.txt");
        fs::write(&abs, b"remote content").unwrap();
        let mtime = mtime_of(&fs::metadata(&abs).unwrap());
        f.ctx.ignore.insert(rel("echoed.txt"), mtime);

        handle_event(&f.ctx, &f.registry, &DirEvent::Modify(abs)).unwrap();

        // Entry consumed, and the baseline was not advanced (no store
        // record was written by the router).
        assert!(f.ctx.ignore.is_empty());
        assert!(f.ctx.store.load(&rel("echoed.txt")).unwrap().is_none());
    }

    #[test]
    fn delete_event_clears_signature() {
        let f = fixture(2000.0);
        let abs = f.ctx.root().join("bye.txt");
        fs::write(&abs, b"x").unwrap();
        handle_event(&f.ctx, &f.registry, &DirEvent::Create(abs.clone())).unwrap();
        fs::remove_file(&abs).unwrap();

        handle_event(&f.ctx, &f.registry, &DirEvent::Delete(abs)).unwrap();
        assert!(f.ctx.store.load(&rel("bye.txt")).unwrap().is_none());
    }

    #[test]
    fn delete_echo_is_consumed() {
        let f = fixture(2000.0);
        let abs = f.ctx.root().join("remote-del.txt");
        f.ctx.ignore.insert(rel("remote-del.txt"), 123.0);

        handle_event(&f.ctx, &f.registry, &DirEvent::Delete(abs)).unwrap();
        assert!(f.ctx.ignore.is_empty());
    }

    #[test]
    fn rename_event_moves_signature() {
        let f = fixture(3000.0);
        let foo = f.ctx.root().join("foo");
        fs::write(&foo, b"payload").unwrap();
        handle_event(&f.ctx, &f.registry, &DirEvent::Create(foo.clone())).unwrap();

        let bar = f.ctx.root().join("bar");
        fs::rename(&foo, &bar).unwrap();
        handle_event(&f.ctx, &f.registry, &DirEvent::Rename(foo, bar)).unwrap();

        assert!(f.ctx.store.load(&rel("foo")).unwrap().is_none());
        assert!(f.ctx.store.load(&rel("bar")).unwrap().is_some());
    }

    #[test]
    fn vanished_file_event_is_harmless() {
        let f = fixture(1000.0);
        let abs = f.ctx.root().join("phantom.txt");
        handle_event(&f.ctx, &f.registry, &DirEvent::Modify(abs)).unwrap();
        assert!(f.ctx.store.load(&rel("phantom.txt")).unwrap().is_none());
    }

    #[test]
    fn out_of_root_event_is_dropped() {
        let f = fixture(1000.0);
        handle_event(
            &f.ctx,
            &f.registry,
            &DirEvent::Modify("/somewhere/else.txt".into()),
        )
        .unwrap();
    }
}
