//! Beacons: the broadcast/multicast datagram transport under discovery.
//!
//! The engine talks to a [`Beacon`] handle: queue bytes for sending, await
//! the next inbound [`Datagram`], read the last transport error. The socket
//! side is a [`BeaconUnit`] run under the [`Supervisor`](crate::Supervisor);
//! when its socket fails it is rebuilt and the handle keeps working. The unit
//! finishes when its engine stops.
//!
//! Two modes exist, chosen once from the bind address:
//! - [`BeaconMode::Broadcast`]: IPv4 broadcast on a port (`":21027"`)
//! - [`BeaconMode::Multicast`]: IPv6 multicast group (`"[ff12::8384]:21027"`)

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::local::DiscoveryError;
use crate::supervisor::Service;

pub mod broadcast;
pub mod multicast;

/// Outbound datagrams queued while the socket is being (re)built.
pub(crate) const OUTBOX_DEPTH: usize = 16;

/// Inbound datagrams not yet taken by the receive loop.
const INBOX_DEPTH: usize = 64;

/// Largest datagram read from the socket.
pub(crate) const MAX_DATAGRAM: usize = 65_536;

/// One received datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub src: SocketAddr,
}

// ── Mode ──────────────────────────────────────────────────────────────────────

/// Which transport a discovery engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconMode {
    Broadcast { port: u16 },
    Multicast { group: SocketAddrV6 },
}

impl BeaconMode {
    pub fn name(&self) -> &'static str {
        match self {
            BeaconMode::Broadcast { .. } => "IPv4 local",
            BeaconMode::Multicast { .. } => "IPv6 local",
        }
    }
}

impl FromStr for BeaconMode {
    type Err = DiscoveryError;

    /// Parse a bind address: empty host = broadcast on the port,
    /// otherwise an IPv6 multicast group.
    fn from_str(bind: &str) -> Result<Self, Self::Err> {
        let invalid = || DiscoveryError::InvalidBindAddress(bind.to_string());

        let (host, port) = match bind.strip_prefix('[') {
            Some(rest) => {
                let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
                (host, after.strip_prefix(':').ok_or_else(invalid)?)
            }
            None => {
                let (host, port) = bind.rsplit_once(':').ok_or_else(invalid)?;
                if host.contains(':') {
                    return Err(invalid());
                }
                (host, port)
            }
        };

        if host.is_empty() {
            let port = port
                .parse()
                .map_err(|_| DiscoveryError::InvalidPort(port.to_string()))?;
            return Ok(BeaconMode::Broadcast { port });
        }

        let group: SocketAddr = bind
            .parse()
            .map_err(|_| DiscoveryError::NotMulticast(bind.to_string()))?;
        match group {
            SocketAddr::V6(v6) if v6.ip().is_multicast() => Ok(BeaconMode::Multicast { group: v6 }),
            _ => Err(DiscoveryError::NotMulticast(bind.to_string())),
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

type ErrorSlot = Arc<Mutex<Option<Arc<io::Error>>>>;

/// Engine-side handle to a beacon.
pub struct Beacon {
    name: String,
    outbox: mpsc::Sender<Bytes>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    last_error: ErrorSlot,
}

/// Socket-side end of a beacon: what a transport implementation drives.
pub struct BeaconIo {
    pub outbox: mpsc::Receiver<Bytes>,
    pub inbox: mpsc::Sender<Datagram>,
    last_error: ErrorSlot,
}

impl Beacon {
    /// A connected handle/io pair. The io end is driven by a [`BeaconUnit`]
    /// in production and by an in-memory hub in tests.
    pub fn channel(name: impl Into<String>) -> (Beacon, BeaconIo) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(INBOX_DEPTH);
        let last_error: ErrorSlot = Arc::default();
        let beacon = Beacon {
            name: name.into(),
            outbox: out_tx,
            inbox: tokio::sync::Mutex::new(in_rx),
            last_error: last_error.clone(),
        };
        let io = BeaconIo {
            outbox: out_rx,
            inbox: in_tx,
            last_error,
        };
        (beacon, io)
    }

    /// Queue `data` for transmission. Dropped silently once the socket side
    /// has shut down.
    pub async fn send(&self, data: Bytes) {
        if self.outbox.send(data).await.is_err() {
            tracing::trace!(beacon = %self.name, "send after beacon shut down");
        }
    }

    /// Next inbound datagram, or `None` once the socket side has shut down.
    pub async fn recv(&self) -> Option<Datagram> {
        self.inbox.lock().await.recv().await
    }

    /// The most recent transport error, cleared when the transport recovers.
    pub fn error(&self) -> Option<Arc<io::Error>> {
        read_error(&self.last_error)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl BeaconIo {
    pub fn set_error(&self, error: Option<io::Error>) {
        let mut slot = match self.last_error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = error.map(Arc::new);
    }

    pub fn error(&self) -> Option<Arc<io::Error>> {
        read_error(&self.last_error)
    }

    pub(crate) async fn forward(&self, data: &[u8], src: SocketAddr) -> Forwarded {
        let datagram = Datagram {
            data: Bytes::copy_from_slice(data),
            src,
        };
        match self.inbox.send(datagram).await {
            Ok(()) => Forwarded::Delivered,
            Err(_) => Forwarded::Closed,
        }
    }
}

/// Outcome of forwarding one datagram to the engine.
pub(crate) enum Forwarded {
    Delivered,
    /// The engine dropped its handle; the transport can finish.
    Closed,
}

fn read_error(slot: &ErrorSlot) -> Option<Arc<io::Error>> {
    match slot.lock() {
        Ok(e) => e.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

// ── Supervised unit ───────────────────────────────────────────────────────────

/// The restartable socket side of a beacon.
pub struct BeaconUnit {
    mode: BeaconMode,
    io: BeaconIo,
    stop: tokio::sync::broadcast::Receiver<()>,
}

impl BeaconUnit {
    /// `stop` fires (or closes) when the owning engine stops.
    pub fn new(
        mode: BeaconMode,
        io: BeaconIo,
        stop: tokio::sync::broadcast::Receiver<()>,
    ) -> Self {
        Self { mode, io, stop }
    }
}

impl Service for BeaconUnit {
    fn name(&self) -> &str {
        self.mode.name()
    }

    async fn serve(&mut self) -> io::Result<()> {
        let Self { mode, io, stop } = self;
        let run = async {
            match *mode {
                BeaconMode::Broadcast { port } => broadcast::run(port, io).await,
                BeaconMode::Multicast { group } => multicast::run(group, io).await,
            }
        };
        let result = tokio::select! {
            biased;
            // Ok(()) ends the unit for good instead of restarting it.
            _ = stop.recv() => return Ok(()),
            r = run => r,
        };
        if let Err(e) = &result {
            io.set_error(Some(io::Error::new(e.kind(), e.to_string())));
        }
        result
    }
}
