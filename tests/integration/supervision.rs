use crate::*;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use tether_discovery::Service;

/// Fails a fixed number of times, then runs until shut down.
struct Unreliable {
    starts: Arc<AtomicUsize>,
    failures: usize,
}

impl Service for Unreliable {
    fn name(&self) -> &str {
        "unreliable"
    }

    async fn serve(&mut self) -> io::Result<()> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"));
        }
        std::future::pending().await
    }
}

/// A unit that recovers keeps running after an engine on the same
/// supervisor stops, until the supervisor itself stops.
#[tokio::test(start_paused = true)]
async fn test_unit_recovers_and_outlives_engine() -> Result<()> {
    let starts = Arc::new(AtomicUsize::new(0));
    let supervisor = Arc::new(Supervisor::new("it", RestartPolicy::default()));
    supervisor.add(Unreliable {
        starts: starts.clone(),
        failures: 3,
    });

    let (beacon, _io) = Beacon::channel("it");
    let (tx, _events) = mpsc::unbounded_channel();
    let engine = LocalDiscovery::with_beacon(
        DeviceId([7; 32]),
        beacon,
        Providers {
            addresses: Arc::new(StaticAddresses::default()),
            relays: Arc::new(StaticRelays::default()),
            events: Arc::new(tx),
        },
        supervisor.clone(),
        DiscoveryOptions::default(),
    );

    eventually("fourth start", Duration::from_secs(10), || {
        starts.load(Ordering::SeqCst) == 4
    })
    .await?;

    engine.stop();
    engine.stop();
    engine.join().await;
    assert!(!supervisor.is_stopped());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 4);

    supervisor.stop();
    supervisor.join().await;
    assert!(supervisor.is_stopped());
    Ok(())
}

/// Shutdown interrupts a unit that is cooling down after too many failures.
#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_cool_down() -> Result<()> {
    let starts = Arc::new(AtomicUsize::new(0));
    let policy = RestartPolicy {
        max_restarts: 2,
        window: Duration::from_secs(3600),
        backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
    };
    let supervisor = Supervisor::new("it", policy);
    supervisor.add(Unreliable {
        starts: starts.clone(),
        failures: usize::MAX,
    });

    eventually("restart limit", Duration::from_secs(1), || {
        starts.load(Ordering::SeqCst) == 3
    })
    .await?;

    let begin = Instant::now();
    supervisor.stop();
    supervisor.join().await;
    assert!(begin.elapsed() < Duration::from_secs(1));
    assert_eq!(starts.load(Ordering::SeqCst), 3);
    Ok(())
}
