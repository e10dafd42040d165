//! Address normalization for announced URIs.
//!
//! Devices announce addresses such as `tcp://0.0.0.0:22000`, meaning "my
//! listener on port 22000, at whatever address you see me from". The
//! receiver fills in the host from the datagram's source address and keeps
//! the announced port.
//!
//! Authorities are split by hand rather than through a WHATWG URL parser:
//! announced addresses use an empty host (`tcp://:22000`) and IPv6 zone ids
//! (`tcp://[fe80::1%eth0]:22000`), both of which WHATWG parsing rejects.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};

/// Rewrite announced addresses against the datagram source.
///
/// Addresses whose host is empty or unspecified get the source host with
/// the announced port. Addresses with a specific host are returned
/// verbatim. Host names are resolved first: a name that does not resolve
/// is dropped, one that resolves to a wildcard address is treated as
/// unspecified. Addresses that cannot be parsed are dropped; the rest of
/// the batch is still processed.
pub fn normalize(announced: &[String], source: &SocketAddr) -> Vec<String> {
    announced
        .iter()
        .filter_map(|raw| {
            let uri = AddrUri::parse(raw).ok()?;
            let unspecified = match &uri.host {
                Host::Unspecified => true,
                Host::Ip(_) => false,
                Host::Name(name) => resolve_host(name, uri.port)?.ip().is_unspecified(),
            };
            if unspecified {
                let rewritten = with_port(source, uri.port);
                Some(uri.with_authority(&rewritten.to_string()))
            } else {
                Some(raw.clone())
            }
        })
        .collect()
}

/// Whether [`normalize`] would have to resolve a host name in `announced`.
pub fn needs_lookup(announced: &[String]) -> bool {
    announced
        .iter()
        .any(|raw| matches!(AddrUri::parse(raw), Ok(AddrUri { host: Host::Name(_), .. })))
}

/// Render a transport address as `host:port`, `[host]:port` or `:port`.
///
/// IPv4-mapped IPv6 addresses render in IPv4 form; zone ids are dropped.
pub fn canonicalize(addr: &SocketAddr) -> String {
    let port = addr.port();
    match addr {
        _ if addr.ip().is_unspecified() => format!(":{port}"),
        SocketAddr::V4(v4) => format!("{}:{port}", v4.ip()),
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) if v4.is_unspecified() => format!(":{port}"),
            Some(v4) => format!("{v4}:{port}"),
            None => format!("[{}]:{port}", v6.ip()),
        },
    }
}

/// Rewrite local listen URIs into canonical authority form.
///
/// Host names are resolved (first result wins). Entries that fail to parse
/// or resolve are dropped.
pub fn resolve_addrs(addrs: &[String]) -> Vec<String> {
    addrs
        .iter()
        .filter_map(|raw| {
            let uri = AddrUri::parse(raw).ok()?;
            let socket = match &uri.host {
                Host::Unspecified => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), uri.port),
                Host::Ip(ip) => SocketAddr::new(*ip, uri.port),
                Host::Name(name) => resolve_host(name, uri.port)?,
            };
            let authority = canonicalize(&socket);
            if authority.is_empty() {
                return None;
            }
            Some(uri.with_authority(&authority))
        })
        .collect()
}

/// First address `name` resolves to.
fn resolve_host(name: &str, port: u16) -> Option<SocketAddr> {
    (name, port).to_socket_addrs().ok()?.next()
}

/// `source` with its port replaced, keeping any IPv6 scope id. IPv4-mapped
/// sources become plain IPv4.
fn with_port(source: &SocketAddr, port: u16) -> SocketAddr {
    match source {
        SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V4(*v4.ip()), port),
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
            None => SocketAddr::V6(SocketAddrV6::new(*v6.ip(), port, 0, v6.scope_id())),
        },
    }
}

// ── URI parsing ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Host {
    /// Empty host or a wildcard address.
    Unspecified,
    Ip(IpAddr),
    Name(String),
}

/// An address URI split into the parts normalization needs.
#[derive(Debug, Clone)]
struct AddrUri<'a> {
    scheme: &'a str,
    userinfo: Option<&'a str>,
    host: Host,
    port: u16,
    /// Path, query and fragment, verbatim.
    tail: &'a str,
}

impl<'a> AddrUri<'a> {
    fn parse(raw: &'a str) -> Result<Self, AddrError> {
        let (scheme, rest) = raw.split_once("://").ok_or(AddrError::MissingScheme)?;
        if !valid_scheme(scheme) {
            return Err(AddrError::MissingScheme);
        }

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user), hostport),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddrError::InvalidPort(port.to_string()))?;

        Ok(Self {
            scheme,
            userinfo,
            host: parse_host(host)?,
            port,
            tail,
        })
    }

    fn with_authority(&self, authority: &str) -> String {
        match self.userinfo {
            Some(user) => format!("{}://{user}@{authority}{}", self.scheme, self.tail),
            None => format!("{}://{authority}{}", self.scheme, self.tail),
        }
    }
}

fn valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Split `host:port` or `[host]:port`. The host may be empty.
fn split_host_port(hostport: &str) -> Result<(&str, &str), AddrError> {
    if let Some(bracketed) = hostport.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| AddrError::InvalidAuthority(hostport.to_string()))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| AddrError::MissingPort(hostport.to_string()))?;
        return Ok((host, port));
    }

    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| AddrError::MissingPort(hostport.to_string()))?;
    if host.contains(':') {
        // IPv6 literals must be bracketed.
        return Err(AddrError::InvalidAuthority(hostport.to_string()));
    }
    Ok((host, port))
}

fn parse_host(host: &str) -> Result<Host, AddrError> {
    if host.is_empty() {
        return Ok(Host::Unspecified);
    }
    let without_zone = host.split_once('%').map_or(host, |(ip, _zone)| ip);
    if let Ok(ip) = without_zone.parse::<IpAddr>() {
        return Ok(if ip.is_unspecified() {
            Host::Unspecified
        } else {
            Host::Ip(ip)
        });
    }
    if host.contains(['%', ' ', '[', ']']) {
        return Err(AddrError::InvalidAuthority(host.to_string()));
    }
    Ok(Host::Name(host.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a single announced address was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("address has no scheme")]
    MissingScheme,
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid authority {0:?}")]
    InvalidAuthority(String),
}
