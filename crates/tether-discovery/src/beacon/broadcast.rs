//! IPv4 broadcast transport.
//!
//! One socket bound to `0.0.0.0:port` with `SO_BROADCAST` both receives
//! announcements and sends ours to the broadcast address of every up
//! interface. The limited broadcast address is used when no interface
//! reports one.

use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{BeaconIo, Forwarded, MAX_DATAGRAM};

/// Drive `io` over a broadcast socket on `port` until the engine goes away
/// or the socket fails.
pub(crate) async fn run(port: u16, io: &mut BeaconIo) -> io::Result<()> {
    let socket = bind(port)?;
    io.set_error(None);
    tracing::info!(port, "broadcast beacon listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            out = io.outbox.recv() => {
                let Some(data) = out else { return Ok(()) };
                send_all(&socket, port, &data, io).await;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = received?;
                if let Forwarded::Closed = io.forward(&buf[..len], src).await {
                    return Ok(());
                }
            }
        }
    }
}

fn bind(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn send_all(socket: &UdpSocket, port: u16, data: &[u8], io: &BeaconIo) {
    let mut sent = false;
    let mut last_error = None;
    for dst in broadcast_targets() {
        let dst = SocketAddr::V4(SocketAddrV4::new(dst, port));
        match socket.send_to(data, dst).await {
            Ok(n) => {
                tracing::trace!(%dst, bytes = n, "broadcast sent");
                sent = true;
            }
            Err(e) => {
                tracing::debug!(%dst, error = %e, "broadcast send failed");
                last_error = Some(e);
            }
        }
    }
    if sent {
        io.set_error(None);
    } else if let Some(e) = last_error {
        io.set_error(Some(e));
    }
}

/// Broadcast addresses of all up, broadcast-capable interfaces.
fn broadcast_targets() -> Vec<Ipv4Addr> {
    let mut targets = BTreeSet::new();
    match getifaddrs() {
        Ok(ifaddrs) => {
            for ifaddr in ifaddrs {
                if !ifaddr
                    .flags
                    .contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_BROADCAST)
                {
                    continue;
                }
                if let Some(sin) = ifaddr.broadcast.as_ref().and_then(|b| b.as_sockaddr_in()) {
                    targets.insert(Ipv4Addr::from(sin.ip()));
                }
            }
        }
        Err(e) => tracing::debug!(error = %e, "getifaddrs failed"),
    }
    if targets.is_empty() {
        targets.insert(Ipv4Addr::BROADCAST);
    }
    targets.into_iter().collect()
}
