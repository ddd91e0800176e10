//! Tessera key server.
//!
//! In-process implementation of the key-server side of the protocol in
//! [`tessera_proto::key_server`]: devices register their identity key,
//! signed prekey and one-time prekeys, and other devices fetch bundles to
//! open sessions with them.
//!
//! # Architecture
//!
//! [`KeyServer::handle`] takes one request as it would arrive over HTTP (the
//! sender's device id from a header, the binary body) and returns the status
//! code and response body. It performs no I/O of its own, so tests and the
//! simulation harness can route client posts to it directly and decide when
//! each answer is delivered.
//!
//! Every protocol-level failure is answered with status 200 and an error
//! message carrying an [`ErrorCode`]; non-200 statuses are left to transports.
//!
//! # Components
//!
//! - [`KeyServer`]: request dispatch
//! - [`DeviceRegistry`]: published key material, one-time prekeys served once
//! - [`KeyServerError`]: refusal reasons and their wire codes

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod registry;

pub use error::KeyServerError;
pub use registry::{DEFAULT_MAX_ONE_TIME_PREKEYS, DeviceEntry, DeviceRegistry};
use tessera_crypto::CurveId;
use tessera_proto::{
    ErrorCode, KeyServerRequest, KeyServerResponse, PeerBundle, key_server::encode_error,
};

/// Status code of an answered request, error messages included.
pub const STATUS_OK: u16 = 200;

/// Key server over a [`DeviceRegistry`].
///
/// Clone shares the same registry.
#[derive(Clone, Default)]
pub struct KeyServer {
    registry: DeviceRegistry,
}

impl KeyServer {
    /// Create a key server with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key server over an existing registry.
    pub fn with_registry(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Registry backing this server.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Answer one request from `from`.
    ///
    /// Returns the status code and the response body.
    pub fn handle(&self, from: &str, body: &[u8]) -> (u16, Vec<u8>) {
        // Curve byte of the header, echoed in errors even when unparseable
        let curve_byte = body.get(2).copied().unwrap_or_default();

        let response = KeyServerRequest::decode(body)
            .map_err(KeyServerError::from)
            .and_then(|(curve, request)| {
                let response = self.dispatch(from, curve, request)?;
                response.encode(curve).map_err(KeyServerError::Encode)
            });

        match response {
            Ok(bytes) => (STATUS_OK, bytes),
            Err(err) => {
                tracing::debug!(from, %err, "key server request refused");
                let message = err.to_string();
                (STATUS_OK, encode_error(curve_byte, err.code(), Some(&message)))
            },
        }
    }

    fn dispatch(
        &self,
        from: &str,
        curve: CurveId,
        request: KeyServerRequest,
    ) -> Result<KeyServerResponse, KeyServerError> {
        if from.is_empty() {
            return Err(KeyServerError::MissingSenderId);
        }
        let message_type = request.message_type();

        match request {
            KeyServerRequest::RegisterUser { identity_key, signed_prekey, one_time_prekeys } => {
                let count = one_time_prekeys.len();
                self.registry.register(from, curve, identity_key, signed_prekey, one_time_prekeys)?;
                tracing::debug!(device = from, one_time_prekeys = count, "device registered");
                Ok(KeyServerResponse::Ack(message_type))
            },
            KeyServerRequest::DeleteUser => {
                self.registry.remove(from, curve)?;
                tracing::debug!(device = from, "device deleted");
                Ok(KeyServerResponse::Ack(message_type))
            },
            KeyServerRequest::PostSignedPrekey(signed_prekey) => {
                self.registry.set_signed_prekey(from, curve, signed_prekey)?;
                Ok(KeyServerResponse::Ack(message_type))
            },
            KeyServerRequest::PostOneTimePrekeys(keys) => {
                self.registry.add_one_time_prekeys(from, curve, keys)?;
                Ok(KeyServerResponse::Ack(message_type))
            },
            KeyServerRequest::GetPeerBundles(device_ids) => {
                self.registry.one_time_prekey_ids(from, curve)?;
                let bundles = device_ids
                    .into_iter()
                    .map(|device_id| {
                        let bundle = self.registry.take_bundle(&device_id, curve);
                        PeerBundle { device_id, bundle }
                    })
                    .collect();
                Ok(KeyServerResponse::PeerBundles(bundles))
            },
            KeyServerRequest::GetSelfOneTimePrekeys => {
                let ids = self.registry.one_time_prekey_ids(from, curve)?;
                Ok(KeyServerResponse::SelfOneTimePrekeys(ids))
            },
        }
    }
}

/// Error code of a response body, if it is an error message.
///
/// Convenience for tests that inspect raw answers.
pub fn error_code(body: &[u8], curve: CurveId) -> Option<ErrorCode> {
    match KeyServerResponse::decode(body, curve) {
        Ok(KeyServerResponse::Error { code, .. }) => Some(code),
        _ => None,
    }
}
