//! What this device announces about itself.

use std::time::Duration;

use tether_core::addr::resolve_addrs;

/// Source of this device's advertisable address URIs.
pub trait AddressLister: Send + Sync + 'static {
    fn all_addresses(&self) -> Vec<String>;
}

/// Source of configured relays and their measured latency.
pub trait RelayStatusProvider: Send + Sync + 'static {
    /// Configured relay endpoint URIs.
    fn relays(&self) -> Vec<String>;
    /// Latest latency measurement for `relay`, if there is one.
    fn relay_status(&self, relay: &str) -> Option<Duration>;
}

/// A fixed address list, canonicalized once at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticAddresses {
    addrs: Vec<String>,
}

impl StaticAddresses {
    /// Canonicalize `listen` (`tcp://0.0.0.0:22000` becomes `tcp://:22000`).
    /// Entries that cannot be resolved are dropped.
    pub fn new(listen: &[String]) -> Self {
        Self {
            addrs: resolve_addrs(listen),
        }
    }

    /// Use `addrs` verbatim.
    pub fn verbatim(addrs: Vec<String>) -> Self {
        Self { addrs }
    }
}

impl AddressLister for StaticAddresses {
    fn all_addresses(&self) -> Vec<String> {
        self.addrs.clone()
    }
}

/// A fixed relay list with optional latencies.
#[derive(Debug, Clone, Default)]
pub struct StaticRelays {
    relays: Vec<(String, Option<Duration>)>,
}

impl StaticRelays {
    pub fn new(relays: Vec<(String, Option<Duration>)>) -> Self {
        Self { relays }
    }
}

impl RelayStatusProvider for StaticRelays {
    fn relays(&self) -> Vec<String> {
        self.relays.iter().map(|(url, _)| url.clone()).collect()
    }

    fn relay_status(&self, relay: &str) -> Option<Duration> {
        self.relays
            .iter()
            .find(|(url, _)| url == relay)
            .and_then(|(_, latency)| *latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_addresses_are_canonicalized() {
        let lister = StaticAddresses::new(&[
            "tcp://0.0.0.0:22000".to_string(),
            "tcp://192.0.2.3:22000".to_string(),
            "bogus".to_string(),
        ]);
        assert_eq!(
            lister.all_addresses(),
            vec!["tcp://:22000", "tcp://192.0.2.3:22000"]
        );
    }

    #[test]
    fn static_relays_report_latency_when_known() {
        let relays = StaticRelays::new(vec![
            ("relay://a:1".to_string(), Some(Duration::from_millis(15))),
            ("relay://b:1".to_string(), None),
        ]);
        assert_eq!(relays.relays(), vec!["relay://a:1", "relay://b:1"]);
        assert_eq!(relays.relay_status("relay://a:1"), Some(Duration::from_millis(15)));
        assert_eq!(relays.relay_status("relay://b:1"), None);
        assert_eq!(relays.relay_status("relay://c:1"), None);
    }
}
