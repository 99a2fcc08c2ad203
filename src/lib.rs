//! # lansync
//!
//! Peer-to-peer directory synchronization for hosts on a shared local
//! network. Each node monitors one directory and converges it with
//! every peer it discovers, using last-writer-wins keyed on per-file
//! modification times and rsync-style deltas so only changed regions
//! traverse the wire.
//!
//! ## How it works
//!
//! - **Discovery**: UDP beacons announce each node's TCP port; hearing
//!   a new peer triggers an outbound dial.
//! - **Sessions**: each peer pair shares one persistent TCP channel of
//!   length-prefixed, zlib-compressed JSON frames.
//! - **Reconciliation**: on session start both sides exchange directory
//!   snapshots with per-file signatures and push whatever the other
//!   side lacks or holds an older copy of.
//! - **Live propagation**: filesystem events fan out as create, delta
//!   modify, delete, and rename messages; remote applies are shielded
//!   from echoing back by a short-lived ignore set.
//!
//! ## Example
//!
//! ```no_run
//! use lansync::{Config, Node};
//!
//! let config = Config::new("/srv/shared");
//! let node = Node::start(config)?;
//! println!("synchronizing as {}", node.local_id());
//! # Ok::<(), lansync::SyncError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod apply;
mod clock;
mod config;
mod discovery;
mod engine;
mod error;
mod frame;
mod ignore;
mod message;
mod node;
mod path;
mod reconcile;
mod registry;
mod router;
mod session;
mod state;
mod store;
mod watcher;

pub use clock::{Clock, SystemClock};
pub use config::{
    Config, DEFAULT_BROADCAST_PORT, DEFAULT_LISTEN_PORT, DEFAULT_MAX_FRAME_BYTES,
    DEFAULT_SIGNATURE_DIR,
};
pub use engine::{content_hash, DeltaEngine};
pub use error::{Result, SyncError};
pub use frame::{read_message, write_message};
pub use ignore::{IgnoreSet, MTIME_TOLERANCE};
pub use message::{FileEntry, Message};
pub use node::{Node, SyncContext};
pub use path::{is_ignored_name, RelPath, TMP_SUFFIX};
pub use reconcile::{plan, Push, RemoteFile};
pub use registry::{Direction, PeerId, PeerRegistry};
pub use session::{SessionHandle, SyncState};
pub use state::{mtime_of, DirState, FileStat};
pub use store::{SignatureStore, StoredSignature};
pub use watcher::{DirEvent, DirWatcher};
