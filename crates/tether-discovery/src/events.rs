//! Discovery events published to the rest of the application.
//!
//! The engine is handed an [`EventPublisher`] at construction; there is no
//! process-wide bus. Publishing is fire-and-forget.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tether_core::{DeviceId, Relay};

/// Something other subsystems may want to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A device was seen for the first time, or again after its cache entry
    /// went stale.
    DeviceDiscovered {
        /// Serialized as hex.
        device: DeviceId,
        /// Addresses as announced, before normalization.
        addrs: Vec<String>,
        relays: Vec<Relay>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DeviceDiscovered { .. } => "DeviceDiscovered",
        }
    }
}

/// Sink for discovery events.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: Event);
}

impl EventPublisher for mpsc::UnboundedSender<Event> {
    fn publish(&self, event: Event) {
        // A closed receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Publisher that only logs. Used when nothing consumes events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(kind = event.kind(), %payload, "event"),
            Err(e) => tracing::warn!(error = %e, kind = event.kind(), "failed to serialize event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered() -> Event {
        Event::DeviceDiscovered {
            device: DeviceId([0xab; 32]),
            addrs: vec!["tcp://0.0.0.0:22000".to_string()],
            relays: vec![Relay {
                url: "relay://198.51.100.1:22067".to_string(),
                latency: 7,
            }],
        }
    }

    #[test]
    fn payload_shape() {
        let value = serde_json::to_value(discovered()).unwrap();
        assert_eq!(value["type"], "DeviceDiscovered");
        assert_eq!(value["data"]["device"], "ab".repeat(32));
        assert_eq!(value["data"]["addrs"][0], "tcp://0.0.0.0:22000");
        assert_eq!(value["data"]["relays"][0]["latency"], 7);
    }

    #[test]
    fn payload_parses_back() {
        let json = serde_json::to_string(&discovered()).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, discovered());

        let bad = json.replace(&"ab".repeat(32), "not-hex");
        assert!(serde_json::from_str::<Event>(&bad).is_err());
    }

    #[test]
    fn channel_publisher_delivers_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.publish(discovered());
        assert_eq!(rx.try_recv().unwrap(), discovered());

        drop(rx);
        tx.publish(discovered());
    }
}
