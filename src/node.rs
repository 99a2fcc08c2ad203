//! Node supervision.
//!
//! The [`Node`] is the root owner: it holds the shared context, the
//! peer registry, and every supervisor thread (accept loop, discovery
//! beacon and listener, event router, ignore janitor). Shutdown is
//! cooperative: a stop flag plus closed sockets unblock every loop.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::discovery;
use crate::engine::DeltaEngine;
use crate::error::Result;
use crate::ignore::IgnoreSet;
use crate::registry::{PeerId, PeerRegistry};
use crate::router;
use crate::session;
use crate::store::SignatureStore;
use crate::watcher::DirWatcher;

/// Shared state every component works against.
pub struct SyncContext {
    /// Validated runtime configuration.
    pub config: Config,
    /// Delta-transfer primitives.
    pub engine: DeltaEngine,
    /// Persistent signature cache.
    pub store: SignatureStore,
    /// Echo-suppression set.
    pub ignore: IgnoreSet,
    /// Wall-clock source for delete/rename stamps.
    pub clock: Arc<dyn Clock>,
    /// Serializes directory walks against remote applies, so snapshots
    /// never interleave with writes.
    dir_lock: Mutex<()>,
}

impl SyncContext {
    /// Build a context with the system clock.
    ///
    /// # Errors
    ///
    /// Returns `Config` if validation fails and `Io` if the signature
    /// store cannot be reset.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a context with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns `Config` if validation fails and `Io` if the signature
    /// store cannot be reset.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let store = SignatureStore::open(&config.signature_dir)?;
        let engine = DeltaEngine::new(config.block_size);
        let ignore = IgnoreSet::new(config.ignore_grace);
        Ok(Self {
            config,
            engine,
            store,
            ignore,
            clock,
            dir_lock: Mutex::new(()),
        })
    }

    /// The monitored root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.monitored_dir
    }

    /// Take the directory lock for a walk or an apply.
    pub(crate) fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A running sync node.
///
/// Dropping the node stops it; [`Node::stop`] is idempotent.
pub struct Node {
    ctx: Arc<SyncContext>,
    registry: Arc<PeerRegistry>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<DirWatcher>>,
    local_id: PeerId,
}

impl Node {
    /// Validate configuration, bind every socket, warm the signature
    /// store from an initial walk, and start all component threads.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal: invalid configuration, unbindable
    /// ports, an unwatchable root, or an unreadable tree.
    pub fn start(mut config: Config) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))?;
        let listen_port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        config.listen_port = listen_port;

        let advertise_ip = config.advertise_ip.unwrap_or_else(discovery::local_ip);
        let local_id = PeerId {
            ip: advertise_ip,
            port: listen_port,
        };

        let beacon_target = SocketAddr::new(config.broadcast_addr, config.broadcast_port);
        let udp_listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.broadcast_port))?;
        udp_listener.set_read_timeout(Some(Duration::from_millis(500)))?;
        let beacon_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        beacon_socket.set_broadcast(true)?;
        let responder_socket = beacon_socket.try_clone()?;

        let beacon_interval = config.beacon_interval;
        let ctx = Arc::new(SyncContext::new(config)?);
        let stop = Arc::new(AtomicBool::new(false));
        let registry = PeerRegistry::new(local_id, Arc::clone(&ctx), Arc::clone(&stop));

        // Every file needs a signature before the first session asks
        // for the snapshot.
        let warmed = session::snapshot_entries(&ctx)?;
        info!(files = warmed.len(), id = %local_id, "node starting");

        let watcher = DirWatcher::new(ctx.root())?;
        let events = watcher.events();

        let mut threads = Vec::new();

        {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            threads.push(named_thread("accept", move || {
                accept_loop(&listener, &registry, &stop);
            })?);
        }
        {
            let stop = Arc::clone(&stop);
            threads.push(named_thread("beacon", move || {
                discovery::beacon_loop(&beacon_socket, beacon_target, listen_port, beacon_interval, &stop);
            })?);
        }
        {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            threads.push(named_thread("discovery", move || {
                discovery::listen_loop(&udp_listener, &responder_socket, beacon_target, &registry, &stop);
            })?);
        }
        {
            let ctx = Arc::clone(&ctx);
            let registry = Arc::clone(&registry);
            threads.push(named_thread("router", move || {
                router::run(&events, &ctx, &registry);
            })?);
        }
        {
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&stop);
            threads.push(named_thread("janitor", move || {
                while !stop.load(Ordering::Relaxed) {
                    ctx.ignore.sweep();
                    thread::sleep(Duration::from_millis(250));
                }
            })?);
        }

        Ok(Self {
            ctx,
            registry,
            stop,
            threads: Mutex::new(threads),
            watcher: Mutex::new(Some(watcher)),
            local_id,
        })
    }

    /// This node's advertised identity.
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The peer registry, for wiring discovery or tests.
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Stop all threads and close all sessions. Idempotent.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.local_id, "node stopping");

        // Dropping the watcher disconnects the router's channel.
        *self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.registry.close_all();

        let threads: Vec<_> = {
            let mut guard = self
                .threads
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in threads {
            if handle.join().is_err() {
                warn!("supervisor thread panicked");
            }
        }
        debug!(id = %self.local_id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn named_thread(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new()
        .name(name.to_string())
        .spawn(body)?)
}

fn accept_loop(listener: &TcpListener, registry: &Arc<PeerRegistry>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(from = %addr, "accepted connection");
                let _ = stream.set_nonblocking(false);
                registry.on_accepted(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!("accept failed: {e}");
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("accept loop stopped");
}
