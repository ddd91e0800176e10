//! Error types for the Tessera wire formats.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Errors raised while decoding envelopes and key-server messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Framing errors
    /// Input is shorter than the layout announced by its own header
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Input length does not match the exact size its layout requires
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Size required by the layout
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Bytes left over after a complete message
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    // Header errors
    /// Unsupported protocol version
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Unknown curve identifier
    #[error("unsupported curve id: {0}")]
    UnsupportedCurve(u8),

    /// Message curve differs from the curve of the local identity
    #[error("curve mismatch: expected id {expected}, got {actual}")]
    CurveMismatch {
        /// Curve id of the local identity
        expected: u8,
        /// Curve id found in the message
        actual: u8,
    },

    /// Flag bits outside the defined set
    #[error("invalid flags: {0:#04x}")]
    InvalidFlags(u8),

    /// One-time prekey presence byte is neither 0 nor 1
    #[error("invalid one-time prekey flag: {0}")]
    InvalidOneTimePrekeyFlag(u8),

    // Key-server errors
    /// Unknown key-server message type
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Message type not valid in this direction
    #[error("unexpected message type: {0:#04x}")]
    UnexpectedMessageType(u8),

    /// Unknown key-server error code
    #[error("unknown error code: {0:#04x}")]
    UnknownErrorCode(u8),

    /// Bundle entry flag outside {0, 1, 2}
    #[error("invalid bundle flag: {0}")]
    InvalidBundleFlag(u8),

    /// Device id is not valid UTF-8 or is empty
    #[error("invalid device id")]
    InvalidDeviceId,

    /// Too many entries to fit a 16-bit count
    #[error("too many entries: {count} exceeds maximum {max}")]
    TooManyEntries {
        /// Number of entries supplied
        count: usize,
        /// Maximum encodable count
        max: usize,
    },
}

/// Convenient Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
