//! tether-discovery: local network discovery.
//!
//! A [`LocalDiscovery`] engine announces this device over one beacon
//! (IPv4 broadcast or IPv6 multicast), listens for peers' announcements and
//! keeps a short-lived [`ReachabilityCache`] that other subsystems query
//! with [`LocalDiscovery::lookup`].

pub mod beacon;
pub mod cache;
pub mod events;
pub mod local;
pub mod provider;
pub mod supervisor;

pub use beacon::{Beacon, BeaconMode, Datagram};
pub use cache::{CacheEntry, ReachabilityCache};
pub use events::{Event, EventPublisher, LogPublisher};
pub use local::{DiscoveryError, DiscoveryOptions, LocalDiscovery, Providers};
pub use provider::{AddressLister, RelayStatusProvider, StaticAddresses, StaticRelays};
pub use supervisor::{RestartPolicy, RestartTracker, Service, Supervisor};
