//! tetherd: local discovery daemon.
//!
//! Announces this device on the local network segment over IPv4 broadcast
//! and IPv6 multicast and keeps track of the peers it hears from.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use tether_core::config::TetherConfig;
use tether_discovery::{
    DiscoveryOptions, EventPublisher, LocalDiscovery, LogPublisher, Providers, RestartPolicy,
    StaticAddresses, StaticRelays, Supervisor,
};

mod identity;

/// How often the peer table is written to the log.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let id = identity::load_or_generate(&config.identity.device_id_path)
        .context("failed to load device identity")?;
    tracing::info!(device = %id, "tetherd starting");

    let addresses = StaticAddresses::new(&config.network.listen_addresses);
    let relays = StaticRelays::new(
        config
            .relays
            .endpoints
            .iter()
            .map(|r| {
                let latency = r.latency_ms.map(|ms| Duration::from_millis(u64::from(ms)));
                (r.url.clone(), latency)
            })
            .collect(),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let providers = Providers {
        addresses: Arc::new(addresses),
        relays: Arc::new(relays),
        events: Arc::new(events_tx),
    };
    let options = DiscoveryOptions {
        broadcast_interval: config.discovery.broadcast_interval(),
        eviction_factor: config.discovery.eviction_factor,
    };
    let supervisor = Arc::new(Supervisor::new("tetherd", RestartPolicy::default()));

    // Engines
    let mut engines = Vec::new();
    if config.discovery.ipv4_enabled {
        let bind = config.discovery.ipv4_bind();
        let engine = LocalDiscovery::new(id, &bind, providers.clone(), supervisor.clone(), options)
            .with_context(|| format!("failed to start IPv4 local discovery on {bind}"))?;
        engines.push(engine);
    }
    if config.discovery.ipv6_enabled {
        let bind = &config.discovery.ipv6_group;
        let engine = LocalDiscovery::new(id, bind, providers.clone(), supervisor.clone(), options)
            .with_context(|| format!("failed to start IPv6 local discovery on {bind}"))?;
        engines.push(engine);
    }
    if engines.is_empty() {
        bail!("both IPv4 and IPv6 local discovery are disabled");
    }

    // Event log
    let mut shutdown = supervisor.subscribe();
    let mut events_rx = events_rx;
    supervisor.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = events_rx.recv() => match event {
                    Some(event) => LogPublisher.publish(event),
                    None => return,
                },
            }
        }
    });

    // Status until Ctrl-C
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = status.tick() => log_status(&engines),
        }
    }

    tracing::info!("tetherd shutting down");
    for engine in &engines {
        engine.stop();
        engine.join().await;
    }
    supervisor.stop();
    supervisor.join().await;
    Ok(())
}

fn log_status(engines: &[LocalDiscovery]) {
    for engine in engines {
        let peers = engine.cache().snapshot();
        match engine.error() {
            Some(e) => tracing::warn!(engine = %engine, peers = peers.len(), error = %e, "status"),
            None => tracing::info!(engine = %engine, peers = peers.len(), "status"),
        }
        for (device, entry) in peers {
            tracing::debug!(
                engine = %engine,
                device = %device.short(),
                addrs = ?entry.direct,
                relays = entry.relays.len(),
                "peer"
            );
        }
    }
}
