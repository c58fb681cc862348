//! Node key file.

use crate::error::Result;
use grove_types::{Ed25519Identity, Identity};
use std::path::Path;
use tracing::info;

/// Loads the node identity from `path`, generating and saving a new key
/// when the file does not exist.
pub fn load_or_generate(path: &Path) -> Result<Ed25519Identity> {
    if path.exists() {
        let identity = Ed25519Identity::from_secret_hex(&std::fs::read_to_string(path)?)?;
        info!(path = %path.display(), node_id = %identity.node_id(), "Loaded node key");
        return Ok(identity);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let identity = Ed25519Identity::generate();
    std::fs::write(path, identity.secret_hex())?;
    info!(path = %path.display(), node_id = %identity.node_id(), "Generated node key");
    Ok(identity)
}
