//! Error types for the Tessera state layer.
//!
//! Wraps storage and crypto failures and adds the conditions the trust store,
//! prekey inventory and session store detect themselves.

use tessera_crypto::CryptoError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from trust, prekey and session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Operation referenced a local user that does not exist
    #[error("user {0} not found")]
    UserNotFound(String),

    /// A local user with this device id already exists
    #[error("user {0} already exists")]
    UserAlreadyExists(String),

    /// A peer presented an identity key that differs from the stored one
    #[error("identity key of {peer} conflicts with the key stored for {local}")]
    IdentityKeyConflict {
        /// Local device the record belongs to
        local: String,
        /// Peer device whose key changed
        peer: String,
    },

    /// Trusted status was requested without an identity key
    #[error("cannot trust {peer} without an identity key")]
    TrustWithoutKey {
        /// Peer device
        peer: String,
    },

    /// A supplied identity key has the wrong size for the user's curve
    #[error("identity key length: expected {expected}, got {actual}")]
    IdentityKeyLength {
        /// Length required by the curve
        expected: usize,
        /// Length supplied
        actual: usize,
    },

    /// Randomness kept producing seeds the curve rejects
    #[error("key generation failed after {attempts} attempts")]
    KeyGeneration {
        /// Seeds tried
        attempts: u32,
    },

    /// A key exchange referenced a signed prekey we no longer hold
    #[error("signed prekey {0} not found")]
    UnknownSignedPrekey(u32),

    /// Local user has no active signed prekey
    #[error("user {0} has no active signed prekey")]
    NoActiveSignedPrekey(String),

    /// A key exchange referenced a one-time prekey we no longer hold
    #[error("one-time prekey {0} not found")]
    UnknownOneTimePrekey(u32),
}

impl CoreError {
    /// Returns true if retrying the same call cannot succeed.
    ///
    /// Storage I/O may recover; everything else is a property of the inputs
    /// or of persisted state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Storage(StorageError::Io(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_io_is_not_fatal() {
        assert!(!CoreError::Storage(StorageError::Io("disk full".to_string())).is_fatal());
    }

    #[test]
    fn conflicts_are_fatal() {
        assert!(
            CoreError::IdentityKeyConflict { local: "a".to_string(), peer: "b".to_string() }
                .is_fatal()
        );
        assert!(CoreError::Crypto(CryptoError::InvalidSignature).is_fatal());
        assert!(CoreError::Storage(StorageError::Serialization("bad".to_string())).is_fatal());
    }
}
