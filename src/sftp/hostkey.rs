//! Throwaway SSH host key
//!
//! The key is an Ed25519 PKCS#8 PEM file. It is generated on first use and
//! reused afterwards, so clients see the same host identity across runs.

use crate::error::{Error, Result};
use russh::keys::{PrivateKey, decode_secret_key};
use std::path::Path;
use tracing::{error, info};

/// Load the host key at `path`, generating and saving one if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or
/// decoded, or a new key cannot be written.
pub fn load_or_generate(path: &Path) -> Result<PrivateKey> {
    let pem = if path.exists() {
        std::fs::read_to_string(path).map_err(|e| {
            error!("Could not read host key {}: {}", path.display(), e);
            Error::config_with(format!("Could not read host key {}", path.display()), e)
        })?
    } else {
        let pem = generate_pem()?;
        std::fs::write(path, &pem).map_err(|e| {
            error!("Could not write host key {}: {}", path.display(), e);
            Error::config_with(format!("Could not write host key {}", path.display()), e)
        })?;
        info!("Generated SSH host key {}", path.display());
        pem
    };

    decode_secret_key(&pem, None).map_err(|e| {
        error!("Invalid host key {}: {}", path.display(), e);
        Error::config_with(format!("Invalid host key {}", path.display()), e)
    })
}

fn generate_pem() -> Result<String> {
    let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| Error::config_with("Could not generate host key", e))?;
    Ok(pair.serialize_pem())
}
