use crate::*;

use tether_core::Relay;

const LIMIT: Duration = Duration::from_secs(10);

/// A announces a wildcard address; B fills in the host from the packet source.
#[tokio::test(start_paused = true)]
async fn test_wildcard_address_resolved_from_source() -> Result<()> {
    let nodes = segment(vec![
        NodeSpec::new(0xa1, "192.0.2.5:54321"),
        NodeSpec::new(0xb2, "192.0.2.6:54321"),
    ]);
    let (a, b) = (&nodes[0], &nodes[1]);

    eventually("B to learn A", LIMIT, || !b.engine.lookup(&a.id).0.is_empty()).await?;

    assert_eq!(
        b.engine.lookup(&a.id),
        (vec!["tcp://192.0.2.5:22000".to_string()], Vec::new())
    );
    // nobody caches itself, even though the segment loops packets back
    assert_eq!(b.engine.lookup(&b.id), (Vec::new(), Vec::new()));
    assert_eq!(a.engine.lookup(&a.id), (Vec::new(), Vec::new()));
    Ok(())
}

/// Discovery is mutual and fast: the forced announcement means neither side
/// waits for a full broadcast interval.
#[tokio::test(start_paused = true)]
async fn test_three_nodes_discover_each_other() -> Result<()> {
    let mut nodes = segment(vec![
        NodeSpec::new(1, "192.0.2.1:21027"),
        NodeSpec::new(2, "192.0.2.2:21027"),
        NodeSpec::new(3, "192.0.2.3:21027"),
    ]);

    let begin = Instant::now();
    eventually("full mesh", LIMIT, || {
        nodes.iter().all(|n| {
            nodes
                .iter()
                .filter(|m| m.id != n.id)
                .all(|m| !n.engine.lookup(&m.id).0.is_empty())
        })
    })
    .await?;
    assert!(begin.elapsed() < Duration::from_secs(30));

    for node in nodes.iter_mut() {
        let node_id = node.id;
        let events = node.take_events();
        assert_eq!(events.len(), 2, "one event per peer");
        for event in events {
            let Event::DeviceDiscovered { device, addrs, .. } = event;
            assert_ne!(device, node_id);
            assert_eq!(addrs, vec!["tcp://:22000"]);
        }
    }
    Ok(())
}

/// Repeated announcements refresh the cache without new events.
#[tokio::test(start_paused = true)]
async fn test_steady_state_is_quiet() -> Result<()> {
    let mut nodes = segment(vec![
        NodeSpec::new(1, "192.0.2.1:21027"),
        NodeSpec::new(2, "192.0.2.2:21027"),
    ]);
    let (a_id, b_id) = (nodes[0].id, nodes[1].id);
    eventually("B to learn A", LIMIT, || !nodes[1].engine.lookup(&a_id).0.is_empty()).await?;
    eventually("A to learn B", LIMIT, || !nodes[0].engine.lookup(&b_id).0.is_empty()).await?;
    assert_eq!(nodes[0].take_events().len(), 1);
    assert_eq!(nodes[1].take_events().len(), 1);

    // several lifetimes of periodic announcements
    tokio::time::sleep(Duration::from_secs(400)).await;

    assert!(!nodes[0].engine.lookup(&b_id).0.is_empty());
    assert!(!nodes[1].engine.lookup(&a_id).0.is_empty());
    assert!(nodes[0].take_events().is_empty());
    assert!(nodes[1].take_events().is_empty());
    Ok(())
}

/// A node that goes silent drops out of lookups after the cache lifetime.
#[tokio::test(start_paused = true)]
async fn test_silent_node_expires() -> Result<()> {
    let nodes = segment(vec![
        NodeSpec::new(1, "192.0.2.1:21027"),
        NodeSpec::new(2, "192.0.2.2:21027"),
    ]);
    let (a, b) = (&nodes[0], &nodes[1]);
    eventually("A to learn B", LIMIT, || !a.engine.lookup(&b.id).0.is_empty()).await?;

    b.engine.stop();
    b.engine.join().await;

    let gone = Instant::now();
    eventually("B to expire", Duration::from_secs(120), || {
        a.engine.lookup(&b.id).0.is_empty()
    })
    .await?;
    assert!(gone.elapsed() <= Duration::from_secs(91));
    Ok(())
}

/// Relays travel with the announcement when their latency is known.
#[tokio::test(start_paused = true)]
async fn test_relays_announced_with_latency() -> Result<()> {
    let mut a = NodeSpec::new(1, "192.0.2.1:21027");
    a.relays = StaticRelays::new(vec![
        (
            "relay://198.51.100.9:22067".to_string(),
            Some(Duration::from_millis(42)),
        ),
        ("relay://198.51.100.10:22067".to_string(), None),
    ]);
    a.listen = vec!["tcp://203.0.113.4:22000".to_string()];
    let nodes = segment(vec![a, NodeSpec::new(2, "192.0.2.2:21027")]);
    let (a, b) = (&nodes[0], &nodes[1]);

    eventually("B to learn A", LIMIT, || !b.engine.lookup(&a.id).0.is_empty()).await?;

    let (direct, relays) = b.engine.lookup(&a.id);
    // specific hosts are kept as announced
    assert_eq!(direct, vec!["tcp://203.0.113.4:22000"]);
    assert_eq!(
        relays,
        vec![Relay {
            url: "relay://198.51.100.9:22067".to_string(),
            latency: 42,
        }]
    );
    Ok(())
}
