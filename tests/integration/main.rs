//! Tether integration test harness.
//!
//! Engines run against an in-memory segment instead of real sockets: every
//! datagram a node sends is delivered to every node on the segment,
//! including the sender, with the sender's address as the source. Time is
//! paused, so lifetimes and intervals elapse instantly.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

use tether_core::DeviceId;
use tether_discovery::{
    Beacon, Datagram, DiscoveryOptions, Event, LocalDiscovery, Providers, RestartPolicy,
    StaticAddresses, StaticRelays, Supervisor,
};

mod config;
mod discovery;
mod supervision;

// ── Harness ───────────────────────────────────────────────────────────────────

/// One device on the simulated segment.
pub struct Node {
    pub id: DeviceId,
    pub addr: SocketAddr,
    pub engine: LocalDiscovery,
    pub events: mpsc::UnboundedReceiver<Event>,
}

impl Node {
    /// Drain and return the events published so far.
    pub fn take_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// What a node announces about itself.
pub struct NodeSpec {
    pub id: DeviceId,
    pub addr: &'static str,
    pub listen: Vec<String>,
    pub relays: StaticRelays,
}

impl NodeSpec {
    pub fn new(seed: u8, addr: &'static str) -> Self {
        Self {
            id: DeviceId([seed; 32]),
            addr,
            listen: vec!["tcp://0.0.0.0:22000".to_string()],
            relays: StaticRelays::default(),
        }
    }
}

/// Start one engine per spec, all attached to one broadcast segment.
pub fn segment(specs: Vec<NodeSpec>) -> Vec<Node> {
    let mut inboxes = Vec::new();
    let mut pending = Vec::new();

    for spec in specs {
        let addr: SocketAddr = spec.addr.parse().expect("node address");
        let (beacon, io) = Beacon::channel(format!("segment {addr}"));
        inboxes.push(io.inbox.clone());
        pending.push((spec, addr, beacon, io));
    }
    let inboxes = Arc::new(inboxes);

    pending
        .into_iter()
        .map(|(spec, addr, beacon, mut io)| {
            let inboxes = inboxes.clone();
            tokio::spawn(async move {
                while let Some(data) = io.outbox.recv().await {
                    for inbox in inboxes.iter() {
                        let datagram = Datagram {
                            data: data.clone(),
                            src: addr,
                        };
                        // a full or closed inbox drops the datagram
                        let _ = inbox.try_send(datagram);
                    }
                }
            });

            let (tx, events) = mpsc::unbounded_channel();
            let providers = Providers {
                addresses: Arc::new(StaticAddresses::new(&spec.listen)),
                relays: Arc::new(spec.relays),
                events: Arc::new(tx),
            };
            let supervisor = Arc::new(Supervisor::new(addr.to_string(), RestartPolicy::default()));
            let engine = LocalDiscovery::with_beacon(
                spec.id,
                beacon,
                providers,
                supervisor,
                DiscoveryOptions::default(),
            );
            Node {
                id: spec.id,
                addr,
                engine,
                events,
            }
        })
        .collect()
}

/// Poll `check` on virtual time until it holds or `limit` elapses.
pub async fn eventually(what: &str, limit: Duration, check: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}
