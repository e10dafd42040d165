//! Persistent device identity.
//!
//! The identity file holds one line: the device id in hex. On first run 32
//! random bytes are drawn and hashed into an id, which is then written out
//! so the device keeps its name across restarts.

use std::path::Path;

use anyhow::{Context, Result};
use rand::RngCore;

use tether_core::DeviceId;

/// Load the device id from `path`, generating and persisting one if the
/// file does not exist yet.
pub fn load_or_generate(path: &Path) -> Result<DeviceId> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let id = text
            .parse()
            .with_context(|| format!("invalid device id in {}", path.display()))?;
        return Ok(id);
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let id = DeviceId::from_key_material(&seed);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{id}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(device = %id.short(), path = %path.display(), "generated device id");
    Ok(id)
}
