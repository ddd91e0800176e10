//! Storage error types.
//!
//! - `AlreadyExists`: a local user with this device id is already stored
//! - `NotFound`: an update referenced a record that does not exist
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Local user already stored
    #[error("local user already exists: {device_id}")]
    AlreadyExists {
        /// Device id of the existing user
        device_id: String,
    },

    /// Record to update does not exist
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Record type
        kind: &'static str,
        /// Key that was looked up
        key: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
