//! Key-server error types.

use tessera_proto::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Reasons a key-server request is refused.
///
/// Every variant maps to the wire [`ErrorCode`] sent back to the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyServerError {
    /// Request body is not a valid key-server request.
    #[error("malformed request: {0}")]
    Malformed(#[from] ProtocolError),

    /// Request did not name its sender.
    #[error("request has no sender device id")]
    MissingSenderId,

    /// Registration for a device that is already registered.
    #[error("device {0} is already registered")]
    UserAlreadyIn(String),

    /// Request from a device that is not registered.
    #[error("device {0} is not registered")]
    UserNotFound(String),

    /// Request curve differs from the curve the device registered with.
    #[error("device {device} registered on curve {expected}, request used {actual}")]
    BadCurve {
        /// Sender device
        device: String,
        /// Curve id of the registration
        expected: u8,
        /// Curve id of the request
        actual: u8,
    },

    /// Posting would exceed the per-device one-time prekey limit.
    #[error("device {device} would hold {requested} one-time prekeys, limit is {limit}")]
    ResourceLimitReached {
        /// Sender device
        device: String,
        /// Count after the post
        requested: usize,
        /// Per-device maximum
        limit: usize,
    },

    /// Response could not be encoded.
    #[error("cannot encode response: {0}")]
    Encode(ProtocolError),
}

impl KeyServerError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(err) => match err {
                ProtocolError::UnsupportedVersion(_) => ErrorCode::BadProtocolVersion,
                ProtocolError::UnsupportedCurve(_) | ProtocolError::CurveMismatch { .. } => {
                    ErrorCode::BadCurve
                },
                ProtocolError::TooShort { .. }
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::TrailingBytes(_) => ErrorCode::BadSize,
                _ => ErrorCode::BadRequest,
            },
            Self::MissingSenderId => ErrorCode::MissingSenderId,
            Self::UserAlreadyIn(_) => ErrorCode::UserAlreadyIn,
            Self::UserNotFound(_) => ErrorCode::UserNotFound,
            Self::BadCurve { .. } => ErrorCode::BadCurve,
            Self::ResourceLimitReached { .. } => ErrorCode::ResourceLimitReached,
            Self::Encode(_) => ErrorCode::ServerFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_requests_map_by_cause() {
        let code = |err: ProtocolError| KeyServerError::from(err).code();

        assert_eq!(code(ProtocolError::UnsupportedVersion(2)), ErrorCode::BadProtocolVersion);
        assert_eq!(code(ProtocolError::UnsupportedCurve(9)), ErrorCode::BadCurve);
        assert_eq!(code(ProtocolError::TrailingBytes(1)), ErrorCode::BadSize);
        assert_eq!(code(ProtocolError::UnexpectedMessageType(0x06)), ErrorCode::BadRequest);
    }

    #[test]
    fn registration_errors_map_to_their_codes() {
        assert_eq!(KeyServerError::UserAlreadyIn("a".into()).code(), ErrorCode::UserAlreadyIn);
        assert_eq!(KeyServerError::UserNotFound("a".into()).code(), ErrorCode::UserNotFound);
        assert_eq!(KeyServerError::MissingSenderId.code(), ErrorCode::MissingSenderId);
    }
}
