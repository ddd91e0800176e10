//! Error types for cryptographic operations

use thiserror::Error;

use crate::curve::CurveId;

/// Errors from key handling, agreement, and ratchet operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key bytes could not be interpreted on the given curve
    #[error("invalid {curve:?} key: {reason}")]
    InvalidKey {
        /// Curve the key was expected on
        curve: CurveId,
        /// What was wrong with it
        reason: String,
    },

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Signature did not verify against the identity key
    #[error("signature verification failed")]
    InvalidSignature,

    /// Key agreement produced a degenerate (all-zero) shared secret
    #[error("non-contributory key agreement")]
    NonContributory,

    /// AEAD authentication tag mismatch
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// The peer skipped more messages than we are willing to derive keys for
    #[error("too many skipped messages: at {current}, requested {requested}, limit {limit}")]
    TooManySkipped {
        /// Current receiving counter
        current: u16,
        /// Counter announced by the message
        requested: u16,
        /// Maximum skip allowed
        limit: u16,
    },

    /// Message counter is behind the chain and no skipped key is stored for it
    #[error("message {requested} already consumed (receiving chain at {current})")]
    MessageKeyConsumed {
        /// Current receiving counter
        current: u16,
        /// Counter announced by the message
        requested: u16,
    },

    /// Session has no sending chain yet (responder that never received)
    #[error("no sending chain available")]
    NoSendingChain,

    /// Sending chain reached its maximum length
    #[error("sending chain exhausted after {sent} messages")]
    SendingChainExhausted {
        /// Messages sent on the chain
        sent: u16,
    },
}

impl CryptoError {
    /// Returns true if this error indicates a tampered or forged message
    /// rather than a local state limitation.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidSignature
            | Self::NonContributory
            | Self::DecryptionFailed { .. }
            | Self::InvalidKey { .. }
            | Self::InvalidKeyLength { .. } => true,

            Self::TooManySkipped { .. }
            | Self::MessageKeyConsumed { .. }
            | Self::NoSendingChain
            | Self::SendingChainExhausted { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failed_is_fatal() {
        let err = CryptoError::DecryptionFailed { reason: "tag mismatch".to_string() };
        assert!(err.is_fatal());
    }

    #[test]
    fn exhausted_chain_is_not_fatal() {
        let err = CryptoError::SendingChainExhausted { sent: 500 };
        assert!(!err.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::TooManySkipped { current: 10, requested: 600, limit: 512 };
        assert_eq!(
            err.to_string(),
            "too many skipped messages: at 10, requested 600, limit 512"
        );
    }
}
