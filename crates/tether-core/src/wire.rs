//! Tether wire format: the local discovery announcement.
//!
//! One announcement is one datagram. The layout is XDR: big-endian integers,
//! variable-length fields prefixed by a u32 length and zero-padded to a
//! four-byte boundary.
//!
//! ```text
//! Announcement = magic:u32  this:Device  extra:Device<16>
//! Device       = id:opaque<32>  addresses:string<2083><16>  relays:Relay<16>
//! Relay        = url:string<2083>  latency:i32
//! ```
//!
//! Decoding is all or nothing. A datagram either yields a complete
//! [`Announcement`] or a [`WireError`]; there is no partial result.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DEVICE_ID_LEN};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol version tag carried in the first four bytes of every announcement.
pub const ANNOUNCEMENT_MAGIC: u32 = 0x9D79_BC40;

/// Maximum number of addresses in one device record.
pub const MAX_ADDRESSES: usize = 16;

/// Maximum number of relays in one device record.
pub const MAX_RELAYS: usize = 16;

/// Maximum number of extra device records in one announcement.
pub const MAX_EXTRA_DEVICES: usize = 16;

/// Maximum length of an address or relay URL in bytes.
pub const MAX_URL_LEN: usize = 2083;

/// Period between unforced announcements.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// A cached record is stale once it is this many broadcast intervals old.
pub const CACHE_LIFETIME_INTERVALS: u32 = 3;

/// UDP port used for IPv4 broadcast discovery.
pub const DEFAULT_IPV4_PORT: u16 = 21027;

/// IPv6 multicast group (with port) used for IPv6 discovery.
pub const DEFAULT_IPV6_GROUP: &str = "[ff12::8384]:21027";

// ── Types ─────────────────────────────────────────────────────────────────────

/// A relay endpoint advertised next to the direct addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay URI, e.g. `relay://192.0.2.1:22067`.
    pub url: String,
    /// Measured round-trip latency in whole milliseconds.
    pub latency: i32,
}

impl Relay {
    /// Build a relay descriptor from a measured latency. Sub-millisecond
    /// precision is truncated; latencies beyond `i32::MAX` ms saturate.
    pub fn with_latency(url: impl Into<String>, latency: Duration) -> Self {
        Self {
            url: url.into(),
            latency: i32::try_from(latency.as_millis()).unwrap_or(i32::MAX),
        }
    }
}

/// The reachability payload describing one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    /// Address URIs in announcement order. Not deduplicated.
    pub addresses: Vec<String>,
    pub relays: Vec<Relay>,
}

impl Device {
    /// The addresses [`Announcement::encode`] puts on the wire: at most
    /// [`MAX_ADDRESSES`], skipping any longer than [`MAX_URL_LEN`].
    pub fn encodable_addresses(&self) -> impl Iterator<Item = &String> {
        self.addresses
            .iter()
            .filter(|a| a.len() <= MAX_URL_LEN)
            .take(MAX_ADDRESSES)
    }

    /// The relays [`Announcement::encode`] puts on the wire.
    pub fn encodable_relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays
            .iter()
            .filter(|r| r.url.len() <= MAX_URL_LEN)
            .take(MAX_RELAYS)
    }
}

/// A local discovery announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub magic: u32,
    /// The sending device.
    pub this: Device,
    /// Additional devices vouched for by the sender. Local discovery never
    /// populates this; it is decoded for compatibility and then ignored.
    pub extra: Vec<Device>,
}

impl Announcement {
    /// Announcement for `this` with the current magic and no extra devices.
    pub fn new(this: Device) -> Self {
        Self {
            magic: ANNOUNCEMENT_MAGIC,
            this,
            extra: Vec::new(),
        }
    }

    /// Encode for transmission. Never fails: lists are capped at their
    /// protocol limits and entries longer than [`MAX_URL_LEN`] are left out,
    /// so the output always decodes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32(self.magic);
        put_device(&mut buf, &self.this);
        let extra = &self.extra[..self.extra.len().min(MAX_EXTRA_DEVICES)];
        buf.put_u32(extra.len() as u32);
        for device in extra {
            put_device(&mut buf, device);
        }
        buf.freeze()
    }

    /// Decode an announcement from a received datagram.
    ///
    /// Trailing bytes after a complete announcement are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;

        let magic = get_u32(&mut buf)?;
        if magic != ANNOUNCEMENT_MAGIC {
            return Err(WireError::IncorrectMagic(magic));
        }

        let this = get_device(&mut buf)?;

        let extra_count = get_count(&mut buf, "extra", MAX_EXTRA_DEVICES)?;
        let mut extra = Vec::with_capacity(extra_count);
        for _ in 0..extra_count {
            extra.push(get_device(&mut buf)?);
        }

        Ok(Self { magic, this, extra })
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn put_device(buf: &mut BytesMut, device: &Device) {
    put_opaque(buf, device.id.as_bytes());

    let addresses: Vec<&String> = device.encodable_addresses().collect();
    buf.put_u32(addresses.len() as u32);
    for addr in addresses {
        put_opaque(buf, addr.as_bytes());
    }

    let relays: Vec<&Relay> = device.encodable_relays().collect();
    buf.put_u32(relays.len() as u32);
    for relay in relays {
        put_opaque(buf, relay.url.as_bytes());
        buf.put_i32(relay.latency);
    }
}

fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.put_bytes(0, padding(data.len()));
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn get_device(buf: &mut &[u8]) -> Result<Device, WireError> {
    let id_bytes = get_opaque(buf, "id", DEVICE_ID_LEN)?;
    let id = DeviceId::from_slice(id_bytes)
        .map_err(|_| WireError::InvalidDeviceId(id_bytes.len()))?;

    let count = get_count(buf, "addresses", MAX_ADDRESSES)?;
    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        addresses.push(get_string(buf, "address")?);
    }

    let count = get_count(buf, "relays", MAX_RELAYS)?;
    let mut relays = Vec::with_capacity(count);
    for _ in 0..count {
        let url = get_string(buf, "relay url")?;
        let latency = get_u32(buf)? as i32;
        relays.push(Relay { url, latency });
    }

    Ok(Device {
        id,
        addresses,
        relays,
    })
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    let data = *buf;
    if data.len() < 4 {
        return Err(WireError::Truncated);
    }
    let (head, tail) = data.split_at(4);
    *buf = tail;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

fn get_count(buf: &mut &[u8], field: &'static str, max: usize) -> Result<usize, WireError> {
    let count = get_u32(buf)? as usize;
    if count > max {
        return Err(WireError::TooLong {
            field,
            len: count,
            max,
        });
    }
    Ok(count)
}

fn get_opaque<'a>(
    buf: &mut &'a [u8],
    field: &'static str,
    max: usize,
) -> Result<&'a [u8], WireError> {
    let len = get_count(buf, field, max)?;
    let padded = len + padding(len);
    let data = *buf;
    if data.len() < padded {
        return Err(WireError::Truncated);
    }
    *buf = &data[padded..];
    Ok(&data[..len])
}

fn get_string(buf: &mut &[u8], field: &'static str) -> Result<String, WireError> {
    let raw = get_opaque(buf, field, MAX_URL_LEN)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidUtf8(field))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting an announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("incorrect magic number: 0x{0:08x}")]
    IncorrectMagic(u32),

    #[error("announcement truncated")]
    Truncated,

    #[error("{field} length {len} exceeds maximum {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("device id must be {DEVICE_ID_LEN} bytes, got {0}")]
    InvalidDeviceId(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
