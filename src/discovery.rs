//! UDP peer discovery.
//!
//! A beacon thread announces this node's TCP port to the broadcast
//! address on a fixed interval; a listener thread turns every foreign
//! beacon into a dial request. Beacons are stateless and loss is
//! harmless: the next interval repeats them. On first sight of a new
//! peer one extra beacon goes out immediately, so the newcomer learns
//! of us without waiting a full interval.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::registry::{PeerId, PeerRegistry};

/// Detect the local IP address used for outward traffic.
///
/// Routes a connectionless UDP socket at a public address and reads
/// the chosen source address; nothing is actually sent. Falls back to
/// loopback when the host has no route.
#[must_use]
pub fn local_ip() -> IpAddr {
    let probed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    });
    probed.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Serialize and send one beacon datagram.
pub(crate) fn send_beacon(socket: &UdpSocket, target: SocketAddr, listen_port: u16) {
    let beacon = Message::Beacon { port: listen_port };
    match serde_json::to_vec(&beacon) {
        Ok(buf) => {
            if let Err(e) = socket.send_to(&buf, target) {
                debug!("beacon send failed: {e}");
            }
        }
        Err(e) => warn!("beacon encode failed: {e}"),
    }
}

/// Announce presence on a fixed interval until stopped.
pub(crate) fn beacon_loop(
    socket: &UdpSocket,
    target: SocketAddr,
    listen_port: u16,
    interval: Duration,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        send_beacon(socket, target, listen_port);
        sleep_interruptible(interval, stop);
    }
    debug!("beacon loop stopped");
}

/// Receive beacons and dial newly seen peers until stopped.
///
/// `responder` sends the immediate extra beacon for first-time peers;
/// the socket must have a read timeout so the stop flag is observed.
pub(crate) fn listen_loop(
    socket: &UdpSocket,
    responder: &UdpSocket,
    target: SocketAddr,
    registry: &Arc<PeerRegistry>,
    stop: &AtomicBool,
) {
    let mut known: FxHashSet<PeerId> = FxHashSet::default();
    let mut buf = [0u8; 1024];

    while !stop.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!("beacon listener error: {e}");
                }
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }
        };

        let Ok(Message::Beacon { port }) = serde_json::from_slice::<Message>(&buf[..len]) else {
            debug!(from = %src, "ignoring malformed beacon");
            continue;
        };
        let peer = PeerId {
            ip: src.ip(),
            port,
        };
        if peer == registry.self_id() {
            continue;
        }
        if known.insert(peer) {
            info!(peer = %peer, "discovered peer");
            // Answer out of schedule so the newcomer learns of us now.
            send_beacon(responder, target, registry.self_id().port);
        }
        registry.on_discovered(peer);
    }
    debug!("beacon listener stopped");
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
