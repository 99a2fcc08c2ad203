//! Peer sessions.
//!
//! A session owns one TCP socket and two threads: a send loop draining
//! a bounded FIFO queue, and a receive loop reading frames and
//! dispatching them. Immediately after the hello exchange each side
//! sends its directory snapshot; receiving the peer's snapshot runs the
//! reconciler, and once the resulting pushes are enqueued the session
//! is synchronized and carries live updates until the socket closes.

use std::fs;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::apply;
use crate::error::{Result, SyncError};
use crate::frame;
use crate::message::{FileEntry, Message};
use crate::node::SyncContext;
use crate::path::RelPath;
use crate::reconcile::{self, Push, RemoteFile};
use crate::registry::{Direction, PeerId, PeerRegistry};
use crate::state::{mtime_of, DirState};

/// Synchronization phase of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Socket established, hello exchange in progress.
    Connecting,
    /// Snapshots being exchanged and pushes planned.
    Reconciling,
    /// Steady state; live updates flow in both directions.
    Synchronized,
    /// Terminal; the registry removes the session exactly once.
    Closing,
}

/// Registry-side handle to a running session.
///
/// The handle only enqueues sends and shuts the socket down; the
/// session's threads own all other state.
#[derive(Debug)]
pub struct SessionHandle {
    id: PeerId,
    direction: Direction,
    token: u64,
    sender: Sender<Message>,
    stream: TcpStream,
    state: Arc<Mutex<SyncState>>,
}

impl SessionHandle {
    /// Spawn the send and receive threads for an established socket.
    ///
    /// The hello exchange has already happened; the session starts in
    /// `Reconciling` and sends its snapshot first thing.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the socket cannot be cloned for the two loops.
    pub(crate) fn spawn(
        stream: TcpStream,
        id: PeerId,
        direction: Direction,
        token: u64,
        ctx: Arc<SyncContext>,
        registry: Arc<PeerRegistry>,
    ) -> Result<Self> {
        let (sender, receiver) = bounded(ctx.config.send_queue_depth);
        let state = Arc::new(Mutex::new(SyncState::Reconciling));
        let max_frame = ctx.config.max_frame_bytes;

        let send_stream = stream.try_clone()?;
        let recv_stream = stream.try_clone()?;

        {
            let registry = Arc::clone(&registry);
            spawn_named(format!("send-{id}"), move || {
                send_loop(send_stream, &receiver, max_frame);
                registry.remove_session(id, token);
            });
        }
        {
            let worker = SessionWorker {
                id,
                token,
                ctx,
                registry: Arc::clone(&registry),
                sender: sender.clone(),
                state: Arc::clone(&state),
                stream: recv_stream,
                last_remote: FxHashMap::default(),
                invalid_paths: 0,
            };
            spawn_named(format!("recv-{id}"), move || worker.run());
        }

        Ok(Self {
            id,
            direction,
            token,
            sender,
            stream,
            state,
        })
    }

    /// The peer this session talks to.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Whether this node dialed or accepted the session.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Non-blocking enqueue; `false` means the bounded queue overflowed
    /// and the session must close with backpressure.
    pub(crate) fn enqueue(&self, msg: Message) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
        }
    }

    /// Mark the session closing and shut the socket down, unblocking
    /// both loops. Idempotent.
    pub(crate) fn close(&self) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = SyncState::Closing;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn spawn_named(name: String, body: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new().name(name.clone()).spawn(body) {
        warn!(thread = %name, "failed to spawn session thread: {e}");
    }
}

fn send_loop(mut stream: TcpStream, receiver: &Receiver<Message>, max_frame: u64) {
    while let Ok(msg) = receiver.recv() {
        if let Err(e) = frame::write_message(&mut stream, &msg, max_frame) {
            debug!("send loop ended: {e}");
            break;
        }
    }
}

/// How many invalid update paths a peer may send before the session is
/// closed as a protocol violation.
const INVALID_PATH_STRIKES: u32 = 8;

struct SessionWorker {
    id: PeerId,
    token: u64,
    ctx: Arc<SyncContext>,
    registry: Arc<PeerRegistry>,
    sender: Sender<Message>,
    state: Arc<Mutex<SyncState>>,
    stream: TcpStream,
    /// Our view of the remote tree: its snapshot, advanced by every
    /// push we send, so reconciling twice against an unchanged peer
    /// plans nothing.
    last_remote: FxHashMap<RelPath, RemoteFile>,
    invalid_paths: u32,
}

impl SessionWorker {
    fn run(mut self) {
        match self.session_loop() {
            Ok(()) => debug!(peer = %self.id, "session closed"),
            Err(e) => warn!(peer = %self.id, "session failed: {e}"),
        }
        self.set_state(SyncState::Closing);
        self.registry.remove_session(self.id, self.token);
    }

    fn session_loop(&mut self) -> Result<()> {
        let files = snapshot_entries(&self.ctx)?;
        debug!(peer = %self.id, files = files.len(), "sending directory state");
        self.enqueue(Message::DirState { files })?;

        loop {
            let msg = match frame::read_message(&mut self.stream, self.ctx.config.max_frame_bytes)
            {
                Ok(msg) => msg,
                // A closed or reset socket is the normal end of a
                // session, not a failure.
                Err(SyncError::Io(e)) => {
                    debug!(peer = %self.id, "socket closed: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.dispatch(msg)?;
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::DirState { files } => self.on_dir_state(files),
            Message::Hello { .. } => Err(SyncError::Protocol(
                "unexpected HELLO on established session".into(),
            )),
            Message::Beacon { .. } => Err(SyncError::Protocol(
                "unexpected BEACON on established session".into(),
            )),
            update => match apply::apply_message(&self.ctx, &update) {
                Ok(()) => Ok(()),
                Err(e) if e.is_session_fatal() => Err(e),
                Err(e) => {
                    if matches!(e, SyncError::InvalidPath(_)) {
                        self.invalid_paths += 1;
                        if self.invalid_paths >= INVALID_PATH_STRIKES {
                            return Err(SyncError::Protocol(format!(
                                "repeated invalid paths, last: {e}"
                            )));
                        }
                    }
                    warn!(peer = %self.id, kind = update.kind(), "dropping update: {e}");
                    Ok(())
                }
            },
        }
    }

    fn on_dir_state(&mut self, files: Vec<FileEntry>) -> Result<()> {
        let mut remote: FxHashMap<RelPath, RemoteFile> = FxHashMap::default();
        for entry in files {
            let Ok(path) = RelPath::new(&entry.path) else {
                warn!(peer = %self.id, path = %entry.path, "dropping invalid snapshot path");
                continue;
            };
            if path.is_ignored() {
                continue;
            }
            remote.insert(
                path,
                RemoteFile {
                    mtime: entry.mtime,
                    size: entry.size,
                    sig: entry.sig,
                },
            );
        }
        // Keep whatever we already pushed this session: a re-sent
        // snapshot must not trigger the same pushes again.
        for (path, ours) in &self.last_remote {
            match remote.get(path) {
                Some(theirs) if theirs.mtime >= ours.mtime => {}
                _ => {
                    remote.insert(path.clone(), ours.clone());
                }
            }
        }

        let local = {
            let _guard = self.ctx.lock_dir();
            DirState::scan(self.ctx.root())?
        };
        let pushes = reconcile::plan(&local, &remote);
        info!(peer = %self.id, pushes = pushes.len(), "reconciling");

        for push in &pushes {
            self.execute_push(push)?;
        }
        for push in &pushes {
            if let Some(stat) = local.get(push.path()) {
                remote.insert(
                    push.path().clone(),
                    RemoteFile {
                        mtime: stat.mtime,
                        size: stat.size,
                        sig: Vec::new(),
                    },
                );
            }
        }
        self.last_remote = remote;

        self.set_state(SyncState::Synchronized);
        info!(peer = %self.id, "synchronized");
        Ok(())
    }

    fn execute_push(&self, push: &Push) -> Result<()> {
        let abs = push.path().to_fs_path(self.ctx.root());
        // The file can vanish between the snapshot and the push; a
        // later event covers it.
        let Ok(bytes) = fs::read(&abs) else {
            debug!(path = %push.path(), "push target vanished");
            return Ok(());
        };
        let Ok(meta) = fs::metadata(&abs) else {
            return Ok(());
        };
        let mtime = mtime_of(&meta);

        let msg = match push {
            Push::Full { path } => Message::Create {
                path: path.as_str().to_string(),
                mtime,
                bytes,
            },
            Push::Delta { path, remote_sig } => match self.ctx.engine.delta(remote_sig, &bytes) {
                Ok(delta) => Message::Modify {
                    path: path.as_str().to_string(),
                    mtime,
                    delta,
                },
                Err(e) => {
                    debug!(path = %path, "remote signature unusable ({e}), sending full file");
                    Message::Create {
                        path: path.as_str().to_string(),
                        mtime,
                        bytes,
                    }
                }
            },
        };
        self.enqueue(msg)
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        self.sender.send(msg).map_err(|_| SyncError::Backpressure)
    }

    fn set_state(&self, next: SyncState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
    }
}

/// Snapshot the monitored tree with a signature for every file,
/// reusing stored signatures whose mtime still matches and persisting
/// freshly computed ones.
///
/// # Errors
///
/// Returns `Io` if the walk fails or `Signature` if the store does.
pub(crate) fn snapshot_entries(ctx: &SyncContext) -> Result<Vec<FileEntry>> {
    let _guard = ctx.lock_dir();
    let state = DirState::scan(ctx.root())?;

    let mut paths: Vec<_> = state.files.iter().collect();
    paths.sort_by(|a, b| a.0.cmp(b.0));

    let mut entries = Vec::with_capacity(paths.len());
    for (path, stat) in paths {
        let sig = match ctx.store.load_current(path, stat.mtime)? {
            Some(record) => record.sig,
            None => {
                let Ok(bytes) = fs::read(path.to_fs_path(ctx.root())) else {
                    continue;
                };
                let sig = ctx.engine.signature(&bytes);
                ctx.store.save(path, stat.mtime, &sig)?;
                sig
            }
        };
        entries.push(FileEntry {
            path: path.as_str().to_string(),
            mtime: stat.mtime,
            size: stat.size,
            sig,
        });
    }
    Ok(entries)
}
