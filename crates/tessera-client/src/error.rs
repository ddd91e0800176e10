//! Error types for the encryption manager.
//!
//! Collapses the lower layers into the kinds an application acts on: unknown
//! or duplicate users, identity conflicts, key-server failures, and messages
//! that do not decode or do not authenticate.

use tessera_core::{CoreError, StorageError};
use tessera_crypto::CryptoError;
use tessera_proto::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors reported by [`Manager`](crate::Manager) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Operation referenced a local user that does not exist
    #[error("user {0} not found")]
    UserNotFound(String),

    /// `create_user` was called for a device id that already exists
    #[error("user {0} already exists")]
    UserAlreadyExists(String),

    /// A peer identity key contradicts the stored one
    #[error("identity key of {peer} conflicts with the key stored for {local}")]
    IdentityKeyConflict {
        /// Local device the record belongs to
        local: String,
        /// Peer device
        peer: String,
    },

    /// The key server answered with an error or could not be reached
    #[error("key server error: {reason}")]
    KeyServer {
        /// Protocol error code, `None` for transport failures
        code: Option<ErrorCode>,
        /// Diagnostic message
        reason: String,
    },

    /// Envelope failed structural validation
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] ProtocolError),

    /// A shared-mode envelope arrived without its shared ciphertext
    #[error("envelope references a shared ciphertext that was not supplied")]
    MissingSharedCiphertext,

    /// No session could authenticate the message
    #[error("authentication failure: {reason}")]
    AuthenticationFailure {
        /// Why the message was rejected
        reason: String,
    },

    /// Every recipient of an encryption failed
    #[error("no recipient could be encrypted to: {failed:?}")]
    NoRecipientsEncrypted {
        /// Recipients that failed, in call order
        failed: Vec<String>,
    },

    /// Persistence failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A cryptographic operation failed outside message authentication
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Local state rejected the operation
    #[error("{0}")]
    State(CoreError),
}

impl ManagerError {
    /// Returns true if retrying the same call cannot succeed.
    ///
    /// Key-server failures are retried by the next update cycle and storage
    /// I/O may recover. Everything else is a property of the inputs.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::KeyServer { .. } => false,
            Self::Storage(StorageError::Io(_)) => false,
            Self::State(err) => err.is_fatal(),
            _ => true,
        }
    }

    pub(crate) fn key_server(reason: impl Into<String>) -> Self {
        Self::KeyServer { code: None, reason: reason.into() }
    }

    pub(crate) fn authentication(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailure { reason: reason.into() }
    }
}

impl From<CoreError> for ManagerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UserNotFound(device_id) => Self::UserNotFound(device_id),
            CoreError::UserAlreadyExists(device_id) => Self::UserAlreadyExists(device_id),
            CoreError::IdentityKeyConflict { local, peer } => {
                Self::IdentityKeyConflict { local, peer }
            },
            CoreError::Storage(err) => Self::Storage(err),
            CoreError::Crypto(err) => Self::Crypto(err),
            other => Self::State(other),
        }
    }
}
