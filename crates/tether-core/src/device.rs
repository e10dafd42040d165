//! Device identity.
//!
//! A device is named by a 32-byte identifier. Equality is byte-wise; the
//! textual form is lowercase hex, which is what logs, events and the
//! identity file carry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a device identifier in bytes.
pub const DEVICE_ID_LEN: usize = 32;

/// Fixed-length identifier uniquely naming a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Derive an identifier from arbitrary key material (BLAKE3 digest).
    pub fn from_key_material(material: &[u8]) -> Self {
        Self(*blake3::hash(material).as_bytes())
    }

    /// Build an identifier from a byte slice. The slice must be exactly
    /// [`DEVICE_ID_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DeviceIdError> {
        let arr: [u8; DEVICE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| DeviceIdError::Length(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(DeviceIdError::Hex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device id must be {DEVICE_ID_LEN} bytes, got {0}")]
    Length(usize),
    #[error("device id is not valid hex: {0}")]
    Hex(hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = DeviceId([0xab; 32]);
        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn short_form_is_eight_chars() {
        let id = DeviceId([0x01; 32]);
        assert_eq!(id.short(), "01010101");
    }

    #[test]
    fn wrong_length_rejected() {
        let err = DeviceId::from_slice(&[0u8; 31]).unwrap_err();
        assert!(err.to_string().contains("31"));
        assert!("abcd".parse::<DeviceId>().is_err());
        assert!("zz".parse::<DeviceId>().is_err());
    }

    #[test]
    fn key_material_is_deterministic() {
        let a = DeviceId::from_key_material(b"node-a");
        let b = DeviceId::from_key_material(b"node-a");
        let c = DeviceId::from_key_material(b"node-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = DeviceId([0x11; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(32)));
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
