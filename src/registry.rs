//! Peer registry.
//!
//! Owns the set of live sessions keyed by peer identity, coordinates
//! accepts and dials, deduplicates concurrent dials, and resolves the
//! simultaneous-connect race: when both peers dial each other, the
//! lexicographically lower identity keeps its own outbound session and
//! the other side keeps its accepted one, so exactly one connection
//! survives on both ends.

use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::frame;
use crate::message::Message;
use crate::node::SyncContext;
use crate::session::{SessionHandle, SyncState};

/// A peer's advertised identity: the address its sessions are dialed
/// at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    /// Advertised IP address.
    pub ip: IpAddr,
    /// Advertised TCP listen port.
    pub port: u16,
}

impl PeerId {
    /// The dialable socket address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Which side initiated a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node dialed the peer.
    Outbound,
    /// This node accepted the peer's dial.
    Inbound,
}

/// Whether this node's own outbound session wins a duplicate race
/// against `peer`.
pub(crate) fn outbound_survives(self_id: PeerId, peer: PeerId) -> bool {
    self_id < peer
}

/// Set of live peer sessions plus dial coordination.
pub struct PeerRegistry {
    self_id: PeerId,
    ctx: Arc<SyncContext>,
    sessions: Mutex<FxHashMap<PeerId, SessionHandle>>,
    dialing: Mutex<FxHashSet<PeerId>>,
    next_token: AtomicU64,
    stop: Arc<AtomicBool>,
}

impl PeerRegistry {
    /// Create a registry for a node advertising `self_id`.
    #[must_use]
    pub fn new(self_id: PeerId, ctx: Arc<SyncContext>, stop: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            ctx,
            sessions: Mutex::new(FxHashMap::default()),
            dialing: Mutex::new(FxHashSet::default()),
            next_token: AtomicU64::new(0),
            stop,
        })
    }

    /// This node's advertised identity.
    #[must_use]
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// React to a discovered peer: dial it unless a session exists or a
    /// dial is already in flight.
    pub fn on_discovered(self: &Arc<Self>, peer: PeerId) {
        if peer == self.self_id || self.stop.load(Ordering::Relaxed) {
            return;
        }
        if self.lock_sessions().contains_key(&peer) {
            return;
        }
        if !self.lock_dialing().insert(peer) {
            return;
        }

        let registry = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("dial-{peer}"))
            .spawn(move || {
                let result =
                    TcpStream::connect_timeout(&peer.addr(), registry.ctx.config.connect_timeout);
                registry.lock_dialing().remove(&peer);
                match result {
                    Ok(stream) => {
                        if let Err(e) = registry.establish(stream, Some(peer)) {
                            warn!(peer = %peer, "outbound session failed: {e}");
                        }
                    }
                    Err(e) => debug!(peer = %peer, "dial failed: {e}"),
                }
            });
        if let Err(e) = spawned {
            self.lock_dialing().remove(&peer);
            warn!(peer = %peer, "failed to spawn dial thread: {e}");
        }
    }

    /// React to an accepted TCP connection; the peer's identity is
    /// learned from its hello frame on a short-lived handshake thread.
    pub fn on_accepted(self: &Arc<Self>, stream: TcpStream) {
        let registry = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("accept-handshake".to_string())
            .spawn(move || {
                if let Err(e) = registry.establish(stream, None) {
                    debug!("inbound session failed: {e}");
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn handshake thread: {e}");
        }
    }

    /// Enqueue `msg` on every live session, or only the synchronized
    /// ones. Sessions whose queue overflows are closed with
    /// backpressure.
    pub fn broadcast(&self, msg: &Message, only_synchronized: bool) {
        let mut overflowed = Vec::new();
        {
            let sessions = self.lock_sessions();
            for (id, handle) in sessions.iter() {
                if only_synchronized && handle.state() != SyncState::Synchronized {
                    continue;
                }
                if !handle.enqueue(msg.clone()) {
                    overflowed.push((*id, handle.token()));
                }
            }
        }
        for (id, token) in overflowed {
            warn!(peer = %id, "closing session: {}", SyncError::Backpressure);
            self.remove_session(id, token);
        }
    }

    /// Remove and close the session for `peer`, if any. Idempotent.
    pub fn remove(&self, peer: PeerId) {
        let handle = self.lock_sessions().remove(&peer);
        if let Some(handle) = handle {
            handle.close();
            info!(peer = %peer, "session removed");
        }
    }

    /// Remove `peer`'s session only if it is still the instance
    /// identified by `token`; a replacement session stays untouched.
    pub(crate) fn remove_session(&self, peer: PeerId, token: u64) {
        let handle = {
            let mut sessions = self.lock_sessions();
            if sessions.get(&peer).is_some_and(|h| h.token() == token) {
                sessions.remove(&peer)
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            handle.close();
            info!(peer = %peer, "session removed");
        }
    }

    /// Close every session, for shutdown.
    pub fn close_all(&self) {
        let handles: Vec<_> = {
            let mut sessions = self.lock_sessions();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close();
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Peers whose sessions are in steady state, sorted.
    #[must_use]
    pub fn synchronized_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .lock_sessions()
            .iter()
            .filter(|(_, handle)| handle.state() == SyncState::Synchronized)
            .map(|(id, _)| *id)
            .collect();
        peers.sort();
        peers
    }

    /// Current phase of the session with `peer`, if one exists.
    #[must_use]
    pub fn sync_state(&self, peer: PeerId) -> Option<SyncState> {
        self.lock_sessions().get(&peer).map(SessionHandle::state)
    }

    /// Exchange hellos on a fresh socket and install the session.
    ///
    /// `dialed` carries the target identity for outbound connections;
    /// inbound identity is derived from the socket's source IP and the
    /// advertised port in the peer's hello.
    fn establish(self: &Arc<Self>, stream: TcpStream, dialed: Option<PeerId>) -> Result<()> {
        let max_frame = self.ctx.config.max_frame_bytes;
        let mut write_half = stream.try_clone()?;
        frame::write_message(
            &mut write_half,
            &Message::Hello {
                port: self.self_id.port,
            },
            max_frame,
        )?;

        let mut read_half = stream.try_clone()?;
        let hello = frame::read_message(&mut read_half, max_frame)?;
        let Message::Hello { port } = hello else {
            return Err(SyncError::Protocol(format!(
                "expected HELLO, got {}",
                hello.kind()
            )));
        };

        let (peer, direction) = match dialed {
            Some(peer) => {
                if port != peer.port {
                    return Err(SyncError::Protocol(format!(
                        "peer {peer} advertises port {port}"
                    )));
                }
                (peer, Direction::Outbound)
            }
            None => (
                PeerId {
                    ip: stream.peer_addr()?.ip(),
                    port,
                },
                Direction::Inbound,
            ),
        };
        if peer == self.self_id {
            return Err(SyncError::Protocol("session with self".into()));
        }

        self.install(stream, peer, direction);
        Ok(())
    }

    /// Insert a session, resolving a duplicate by the identity
    /// tie-break. The losing connection is closed with
    /// `DuplicateSession`.
    fn install(self: &Arc<Self>, stream: TcpStream, peer: PeerId, direction: Direction) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut replaced = None;
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&peer) {
                let new_survives =
                    (direction == Direction::Outbound) == outbound_survives(self.self_id, peer);
                if !new_survives {
                    drop(sessions);
                    info!(peer = %peer, ?direction, "{}", SyncError::DuplicateSession);
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                replaced = sessions.remove(&peer);
            }
            match SessionHandle::spawn(
                stream,
                peer,
                direction,
                token,
                Arc::clone(&self.ctx),
                Arc::clone(self),
            ) {
                Ok(handle) => {
                    sessions.insert(peer, handle);
                    info!(peer = %peer, ?direction, "session established");
                }
                Err(e) => warn!(peer = %peer, "failed to start session: {e}"),
            }
        }
        if let Some(old) = replaced {
            info!(peer = %peer, "{}", SyncError::DuplicateSession);
            old.close();
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, FxHashMap<PeerId, SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_dialing(&self) -> MutexGuard<'_, FxHashSet<PeerId>> {
        self.dialing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
