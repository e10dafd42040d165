use crate::*;

use std::path::PathBuf;

use tether_core::config::{ConfigError, TetherConfig};

fn scratch_file(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tether-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_partial_file_keeps_other_defaults() -> Result<()> {
    let path = scratch_file(
        "partial.toml",
        r#"
[discovery]
ipv4_port = 31027
ipv6_enabled = false

[[relays.endpoints]]
url = "relay://198.51.100.9:22067"
latency_ms = 12

[[relays.endpoints]]
url = "relay://198.51.100.10:22067"
"#,
    );

    let config = TetherConfig::load_file(&path)?;
    assert_eq!(config.discovery.ipv4_bind(), ":31027");
    assert!(config.discovery.ipv4_enabled);
    assert!(!config.discovery.ipv6_enabled);
    assert_eq!(config.discovery.ipv6_group, "[ff12::8384]:21027");
    assert_eq!(config.discovery.eviction_factor, 4);
    assert_eq!(config.network.listen_addresses, vec!["tcp://0.0.0.0:22000"]);
    assert_eq!(config.relays.endpoints.len(), 2);
    assert_eq!(config.relays.endpoints[0].latency_ms, Some(12));
    assert_eq!(config.relays.endpoints[1].latency_ms, None);
    Ok(())
}

#[test]
fn test_missing_file_means_defaults() -> Result<()> {
    let path = std::env::temp_dir().join("tether-it-does-not-exist.toml");
    let config = TetherConfig::load_file(&path)?;
    assert_eq!(config.discovery.broadcast_interval(), Duration::from_secs(30));
    Ok(())
}

#[test]
fn test_malformed_file_is_reported() {
    let path = scratch_file("broken.toml", "[discovery\nipv4_port = ");
    match TetherConfig::load_file(&path) {
        Err(ConfigError::ParseFailed(p, _)) => assert_eq!(p, path),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

/// Configured bind addresss are accepted by the engine.
#[test]
fn test_default_binds_are_valid() {
    let config = TetherConfig::default();
    let ipv4: tether_discovery::BeaconMode = config.discovery.ipv4_bind().parse().unwrap();
    let ipv6: tether_discovery::BeaconMode = config.discovery.ipv6_group.parse().unwrap();
    assert_eq!(ipv4.name(), "IPv4 local");
    assert_eq!(ipv6.name(), "IPv6 local");
}
