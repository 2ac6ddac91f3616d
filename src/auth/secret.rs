//! Shared-secret discovery.
//!
//! The gateway and its clients share one secret used to sign handshake
//! challenges. Discovery order, first hit wins:
//!
//! 1. `GATEWAY_AUTH_SECRET` environment variable
//! 2. Explicit config value
//! 3. On-disk key file
//! 4. Generate 32 random bytes and write them to the key file (mode 0600)

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::fs;
use std::path::Path;

use rand::RngCore;
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable consulted first during discovery.
pub const SECRET_ENV_VAR: &str = "GATEWAY_AUTH_SECRET";

/// Byte length of generated secrets.
const GENERATED_SECRET_LEN: usize = 32;

// ============================================================================
// SharedSecret
// ============================================================================

/// The shared secret as raw bytes.
///
/// `Debug` never prints the material.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// Wraps explicit secret material.
    ///
    /// Hex-looking strings are decoded; anything else is used as raw
    /// UTF-8 bytes so operator-chosen passphrases keep working.
    #[must_use]
    pub fn from_string(value: &str) -> Self {
        let trimmed = value.trim();
        let bytes = match hex::decode(trimmed) {
            Ok(decoded) if !decoded.is_empty() => decoded,
            _ => trimmed.as_bytes().to_vec(),
        };
        Self { bytes }
    }

    /// Returns the raw key material.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the secret hex-encoded (for the local-only admin endpoint).
    #[inline]
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Runs the discovery chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Secret`] when the key file cannot be read or
    /// written.
    pub fn discover(config: &GatewayConfig) -> Result<Self> {
        if let Ok(value) = std::env::var(SECRET_ENV_VAR) {
            if !value.trim().is_empty() {
                debug!("Shared secret loaded from environment");
                return Ok(Self::from_string(&value));
            }
        }

        if let Some(ref value) = config.secret {
            debug!("Shared secret loaded from config");
            return Ok(Self::from_string(value));
        }

        if config.key_file.exists() {
            let content = fs::read_to_string(&config.key_file).map_err(|e| {
                Error::secret(format!(
                    "failed to read key file {}: {e}",
                    config.key_file.display()
                ))
            })?;
            debug!(path = %config.key_file.display(), "Shared secret loaded from key file");
            return Ok(Self::from_string(&content));
        }

        Self::generate_into(&config.key_file)
    }

    /// Generates a fresh secret and persists it to `path` with owner-only
    /// permissions.
    fn generate_into(path: &Path) -> Result<Self> {
        let mut bytes = vec![0u8; GENERATED_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);

        let encoded = hex::encode(&bytes);
        fs::write(path, &encoded).map_err(|e| {
            Error::secret(format!("failed to write key file {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                Error::secret(format!(
                    "failed to set key file permissions {}: {e}",
                    path.display()
                ))
            })?;
        }

        info!(path = %path.display(), "Generated new shared secret");
        Ok(Self { bytes })
    }
}

// ============================================================================
// Tests
// ============================================================================
