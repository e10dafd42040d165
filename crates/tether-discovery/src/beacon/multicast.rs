//! IPv6 multicast transport.
//!
//! The socket is bound to `[::]:port` and joins the group on every up,
//! multicast-capable interface. Each announcement is sent once per joined
//! interface with hop limit 1 so it never leaves the link.

use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;

use super::{BeaconIo, Forwarded, MAX_DATAGRAM};

/// Drive `io` over a socket joined to `group` until the engine goes away or
/// the socket fails.
pub(crate) async fn run(group: SocketAddrV6, io: &mut BeaconIo) -> io::Result<()> {
    let socket = bind(group.port())?;
    let joined = join_all(&socket, group.ip());
    if joined.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no interface could join {}", group.ip()),
        ));
    }
    io.set_error(None);
    tracing::info!(%group, interfaces = joined.len(), "multicast beacon listening");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            out = io.outbox.recv() => {
                let Some(data) = out else { return Ok(()) };
                send_all(&socket, group, &joined, &data, io).await;
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
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    // link-local only
    socket.set_multicast_hops_v6(1)?;
    socket.set_multicast_loop_v6(true)?;
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Join `group` on every candidate interface. Returns the indices joined.
fn join_all(socket: &UdpSocket, group: &Ipv6Addr) -> Vec<u32> {
    let mut joined = Vec::new();
    for (name, index) in multicast_interfaces() {
        match socket.join_multicast_v6(group, index) {
            Ok(()) => {
                tracing::debug!(interface = %name, index, %group, "joined multicast group");
                joined.push(index);
            }
            Err(e) => {
                tracing::debug!(interface = %name, index, error = %e, "multicast join failed");
            }
        }
    }
    joined
}

async fn send_all(
    socket: &UdpSocket,
    group: SocketAddrV6,
    interfaces: &[u32],
    data: &[u8],
    io: &BeaconIo,
) {
    let mut sent = false;
    let mut last_error = None;
    for &index in interfaces {
        if let Err(e) = SockRef::from(socket).set_multicast_if_v6(index) {
            tracing::debug!(index, error = %e, "IPV6_MULTICAST_IF failed");
            last_error = Some(e);
            continue;
        }
        let dst = SocketAddr::V6(SocketAddrV6::new(*group.ip(), group.port(), 0, index));
        match socket.send_to(data, dst).await {
            Ok(n) => {
                tracing::trace!(%dst, bytes = n, "multicast sent");
                sent = true;
            }
            Err(e) => {
                tracing::debug!(%dst, error = %e, "multicast send failed");
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

/// Up, multicast-capable interfaces carrying an IPv6 address, by name and index.
fn multicast_interfaces() -> Vec<(String, u32)> {
    let mut names = BTreeSet::new();
    match getifaddrs() {
        Ok(ifaddrs) => {
            for ifaddr in ifaddrs {
                let usable = ifaddr
                    .flags
                    .contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_MULTICAST);
                let has_v6 = ifaddr
                    .address
                    .as_ref()
                    .and_then(|a| a.as_sockaddr_in6())
                    .is_some();
                if usable && has_v6 {
                    names.insert(ifaddr.interface_name);
                }
            }
        }
        Err(e) => tracing::debug!(error = %e, "getifaddrs failed"),
    }

    names
        .into_iter()
        .filter_map(|name| match if_nametoindex(name.as_str()) {
            Ok(index) if index != 0 => Some((name, index)),
            _ => None,
        })
        .collect()
}
