//! The local discovery engine.
//!
//! One [`LocalDiscovery`] owns one beacon and three tasks:
//!
//! - **send loop**: encodes our announcement once, sends it on every
//!   interval tick and whenever the receive loop asks for an early send
//! - **receive loop**: decodes peers' announcements and records them in the
//!   [`ReachabilityCache`]; a device seen for the first time (or again after
//!   its entry went stale) publishes an event and forces an early send so
//!   the new peer learns about us without waiting a full interval
//! - **sweeper**: drops entries nobody has refreshed for a long time
//!
//! The socket side of the beacon runs as a [`BeaconUnit`] under a
//! [`Supervisor`] that may be shared with other engines. Each engine has its
//! own stop signal; stopping the supervisor stops every engine on it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use tether_core::addr::{needs_lookup, normalize};
use tether_core::wire::{
    Announcement, Device, Relay, BROADCAST_INTERVAL, CACHE_LIFETIME_INTERVALS,
};
use tether_core::DeviceId;

use crate::beacon::{Beacon, BeaconMode, BeaconUnit};
use crate::cache::{CacheEntry, ReachabilityCache};
use crate::events::{Event, EventPublisher};
use crate::provider::{AddressLister, RelayStatusProvider};
use crate::supervisor::Supervisor;

/// Cache entries are dropped after this many cache lifetimes without a refresh.
pub const DEFAULT_EVICTION_FACTOR: u32 = 4;

/// Configuration errors. Only returned while building an engine.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid bind address {0:?}: expected host:port")]
    InvalidBindAddress(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("{0:?} is not an IPv6 multicast group")]
    NotMulticast(String),
}

/// Timing knobs of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub broadcast_interval: Duration,
    /// Entries older than `eviction_factor` cache lifetimes are removed.
    /// Zero keeps entries forever.
    pub eviction_factor: u32,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            broadcast_interval: BROADCAST_INTERVAL,
            eviction_factor: DEFAULT_EVICTION_FACTOR,
        }
    }
}

impl DiscoveryOptions {
    /// How long an announcement keeps answering lookups.
    pub fn cache_lifetime(&self) -> Duration {
        self.broadcast_interval * CACHE_LIFETIME_INTERVALS
    }
}

/// What an engine announces about this device, and where it reports.
#[derive(Clone)]
pub struct Providers {
    pub addresses: Arc<dyn AddressLister>,
    pub relays: Arc<dyn RelayStatusProvider>,
    pub events: Arc<dyn EventPublisher>,
}

/// A running local discovery engine.
pub struct LocalDiscovery {
    inner: Arc<Inner>,
    supervisor: Arc<Supervisor>,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    id: DeviceId,
    beacon: Beacon,
    cache: ReachabilityCache,
    events: Arc<dyn EventPublisher>,
}

/// Ack sender handed to the send loop for an early broadcast.
type Forced = oneshot::Sender<()>;

/// Fires when either the engine or its supervisor stops.
struct Shutdown {
    engine: broadcast::Receiver<()>,
    supervisor: broadcast::Receiver<()>,
}

impl Shutdown {
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.engine.recv() => {}
            _ = self.supervisor.recv() => {}
        }
    }
}

impl LocalDiscovery {
    /// Build and start an engine for `bind`: `":port"` selects IPv4
    /// broadcast, `"[group]:port"` IPv6 multicast.
    ///
    /// The beacon socket is supervised by `supervisor` and finishes when
    /// the engine stops.
    pub fn new(
        id: DeviceId,
        bind: &str,
        providers: Providers,
        supervisor: Arc<Supervisor>,
        options: DiscoveryOptions,
    ) -> Result<Self, DiscoveryError> {
        let mode: BeaconMode = bind.parse()?;
        let (beacon, io) = Beacon::channel(mode.name());
        tracing::info!(name = mode.name(), %bind, device = %id.short(), "local discovery starting");
        let engine = Self::with_beacon(id, beacon, providers, supervisor, options);
        engine
            .supervisor
            .add(BeaconUnit::new(mode, io, engine.shutdown.subscribe()));
        Ok(engine)
    }

    /// Start an engine over an already connected beacon. The caller drives
    /// the socket side.
    pub fn with_beacon(
        id: DeviceId,
        beacon: Beacon,
        providers: Providers,
        supervisor: Arc<Supervisor>,
        options: DiscoveryOptions,
    ) -> Self {
        let inner = Arc::new(Inner {
            id,
            beacon,
            cache: ReachabilityCache::new(options.cache_lifetime()),
            events: providers.events,
        });

        let (shutdown, _) = broadcast::channel(1);
        let engine = Self {
            inner: inner.clone(),
            supervisor,
            shutdown,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };

        // Capacity 1 plus the ack makes every early send a rendezvous.
        let (forced_tx, forced_rx) = mpsc::channel::<Forced>(1);

        engine.spawn(send_loop(
            inner.clone(),
            providers.addresses,
            providers.relays,
            options.broadcast_interval,
            forced_rx,
            engine.subscribe(),
        ));
        engine.spawn(recv_loop(inner.clone(), forced_tx, engine.subscribe()));
        if options.eviction_factor > 0 {
            engine.spawn(sweep_loop(
                inner.cache.clone(),
                options.cache_lifetime() * options.eviction_factor,
                engine.subscribe(),
            ));
        }

        engine
    }

    fn subscribe(&self) -> Shutdown {
        Shutdown {
            engine: self.shutdown.subscribe(),
            supervisor: self.supervisor.subscribe(),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.supervisor.is_stopped() {
            return;
        }
        let handle = tokio::spawn(task);
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Direct addresses and relays last announced by `device`. Both empty
    /// when the device is unknown or its entry has gone stale.
    pub fn lookup(&self, device: &DeviceId) -> (Vec<String>, Vec<Relay>) {
        match self.inner.cache.fresh(device) {
            Some(entry) => (entry.direct, entry.relays),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.beacon.name()
    }

    /// The beacon's most recent transport error, if it has not recovered.
    pub fn error(&self) -> Option<Arc<io::Error>> {
        self.inner.beacon.error()
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn cache(&self) -> &ReachabilityCache {
        &self.inner.cache
    }

    /// Stop this engine's loops and its beacon unit. Other units on the
    /// same supervisor keep running. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(engine = %self.inner.beacon, "stopping");
            let _ = self.shutdown.send(());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for this engine's loops to finish. The beacon unit is joined
    /// through the supervisor.
    pub async fn join(&self) {
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(engine = %self.inner.beacon, error = %e, "discovery task panicked");
            }
        }
    }
}

impl Drop for LocalDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Display for LocalDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Inner {
    /// Record a sighting of `device` from `src`. Returns true when the
    /// device was unknown or its entry had gone stale.
    async fn register(&self, src: SocketAddr, device: Device) -> bool {
        let new = match self.cache.get(&device.id) {
            Some(entry) => self.cache.is_stale(&entry),
            None => true,
        };

        let direct = normalize_addrs(&device.addresses, src).await;
        self.cache
            .set(device.id, CacheEntry::seen_now(direct.clone(), device.relays.clone()));

        if new {
            tracing::info!(
                beacon = %self.beacon,
                device = %device.id.short(),
                %src,
                addrs = ?direct,
                relays = device.relays.len(),
                "discovered device"
            );
            self.events.publish(Event::DeviceDiscovered {
                device: device.id,
                addrs: device.addresses,
                relays: device.relays,
            });
        } else {
            tracing::trace!(device = %device.id.short(), %src, "refreshed device");
        }
        new
    }
}

/// Normalize against `src`, resolving host names on the blocking pool.
async fn normalize_addrs(addrs: &[String], src: SocketAddr) -> Vec<String> {
    if !needs_lookup(addrs) {
        return normalize(addrs, &src);
    }
    let addrs = addrs.to_vec();
    match tokio::task::spawn_blocking(move || normalize(&addrs, &src)).await {
        Ok(direct) => direct,
        Err(e) => {
            tracing::warn!(%src, error = %e, "address resolution failed");
            Vec::new()
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

fn announcement(
    id: DeviceId,
    addresses: &dyn AddressLister,
    relays: &dyn RelayStatusProvider,
) -> Announcement {
    let relays = relays
        .relays()
        .into_iter()
        .filter_map(|url| {
            let latency = relays.relay_status(&url)?;
            Some(Relay::with_latency(url, latency))
        })
        .collect();
    Announcement::new(Device {
        id,
        addresses: addresses.all_addresses(),
        relays,
    })
}

async fn send_loop(
    inner: Arc<Inner>,
    addresses: Arc<dyn AddressLister>,
    relays: Arc<dyn RelayStatusProvider>,
    interval: Duration,
    mut forced: mpsc::Receiver<Forced>,
    mut shutdown: Shutdown,
) {
    let announcement = announcement(inner.id, addresses.as_ref(), relays.as_ref());
    let this = &announcement.this;
    let kept_addresses = this.encodable_addresses().count();
    let kept_relays = this.encodable_relays().count();
    if kept_addresses < this.addresses.len() || kept_relays < this.relays.len() {
        tracing::warn!(
            beacon = %inner.beacon,
            addresses = this.addresses.len(),
            kept_addresses,
            relays = this.relays.len(),
            kept_relays,
            "announcement exceeds protocol limits, entries left out"
        );
    }
    let packet = announcement.encode();
    tracing::debug!(beacon = %inner.beacon, bytes = packet.len(), "announcement ready");

    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = inner.beacon.send(packet.clone()) => {}
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {}
            ack = forced.recv() => match ack {
                Some(ack) => {
                    tracing::trace!(beacon = %inner.beacon, "early announcement");
                    let _ = ack.send(());
                }
                None => return,
            },
        }
    }
}

async fn recv_loop(
    inner: Arc<Inner>,
    forced: mpsc::Sender<Forced>,
    mut shutdown: Shutdown,
) {
    loop {
        let datagram = tokio::select! {
            _ = shutdown.recv() => return,
            d = inner.beacon.recv() => match d {
                Some(d) => d,
                None => return,
            },
        };

        let announcement = match Announcement::decode(&datagram.data) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(
                    beacon = %inner.beacon,
                    src = %datagram.src,
                    error = %e,
                    packet = %hex::encode(&datagram.data),
                    "failed to decode announcement"
                );
                continue;
            }
        };

        if announcement.this.id == inner.id {
            continue;
        }

        let new = tokio::select! {
            _ = shutdown.recv() => return,
            new = inner.register(datagram.src, announcement.this) => new,
        };
        if !new {
            continue;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = async {
                if forced.send(ack_tx).await.is_ok() {
                    let _ = ack_rx.await;
                }
            } => {}
        }
    }
}

async fn sweep_loop(
    cache: ReachabilityCache,
    max_age: Duration,
    mut shutdown: Shutdown,
) {
    let period = cache.lifetime();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {}
        }
        let removed = cache.prune(max_age);
        if removed > 0 {
            tracing::debug!(removed, remaining = cache.len(), "evicted cache entries");
        }
    }
}
