//! Secret-key handling for node identity.

use crate::node::{NodeId, NODE_ID_LEN};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::path::Path;

/// Errors loading or saving a secret key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Key file is shorter than the 32-byte scalar.
    #[error("key file too short, expected at least 32 bytes")]
    TooShort,
    /// Key file permissions allow access by group or others.
    #[error("key file permissions too open: {mode:o}, expected 0600")]
    Permissions {
        /// Observed file mode bits.
        mode: u32,
    },
    /// The scalar was not a valid secp256k1 secret key.
    #[error("invalid secp256k1 secret key")]
    Invalid,
}

/// A node's secp256k1 secret key.
#[derive(Clone)]
pub struct SecretKey {
    signing: SigningKey,
}

impl SecretKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Load a key from the first 32 bytes of `path`.
    ///
    /// On Unix the file must not be readable by group or others.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] on I/O failure, short files, open
    /// permissions, or an invalid scalar.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(KeyError::Permissions { mode });
            }
        }

        let data = std::fs::read(path)?;
        if data.len() < 32 {
            return Err(KeyError::TooShort);
        }
        let signing = SigningKey::from_slice(&data[..32]).map_err(|_| KeyError::Invalid)?;
        Ok(Self { signing })
    }

    /// Write the 32-byte scalar to `path` with 0600 permissions.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Io`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        std::fs::write(path, self.signing.to_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Build a key from a raw 32-byte scalar. Intended for tests that
    /// need deterministic identities.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Invalid`] if the scalar is zero or out of range.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let signing = SigningKey::from_slice(bytes).map_err(|_| KeyError::Invalid)?;
        Ok(Self { signing })
    }

    /// The node identifier derived from this key: the uncompressed
    /// public point with the format prefix stripped.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        public_key_to_id(self.signing.verifying_key())
    }

    /// Access the underlying signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "SecretKey({:?})", self.node_id())
    }
}

/// Derive a [`NodeId`] from a verifying key.
#[must_use]
pub fn public_key_to_id(key: &VerifyingKey) -> NodeId {
    let point = key.to_encoded_point(false);
    let bytes = point.as_bytes();
    debug_assert_eq!(bytes.len(), NODE_ID_LEN + 1);
    let mut id = [0u8; NODE_ID_LEN];
    id.copy_from_slice(&bytes[1..]);
    NodeId::new(id)
}
