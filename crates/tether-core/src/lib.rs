//! tether-core: device identity, announcement wire format, address
//! normalization and configuration. All other Tether crates depend on this one.

pub mod addr;
pub mod config;
pub mod device;
pub mod wire;

pub use device::DeviceId;
pub use wire::{Announcement, Device, Relay};
