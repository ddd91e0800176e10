//! Wire formats for Tessera.
//!
//! Two binary formats live here:
//!
//! - [`Envelope`]: the per-recipient message produced by an encryption,
//!   carrying optional X3DH key-exchange material, the ratchet header and the
//!   payload.
//! - [`KeyServerRequest`] / [`KeyServerResponse`]: the messages exchanged
//!   with the key server to publish and fetch key bundles.
//!
//! Both are hand-laid big-endian layouts with key sizes fixed by the curve,
//! so every length can be checked before any variable region is read.
//!
//! # Security
//!
//! Decoders never trust a length they have not checked against the layout
//! the fixed header announces. Unknown versions, curves, flags, message types
//! and error codes are rejected, not ignored. Decoding is structural only:
//! nothing here authenticates a message.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod codec;
pub mod envelope;
pub mod errors;
pub mod key_server;

pub use envelope::{
    ENVELOPE_VERSION, Envelope, EnvelopeFlags, KeyExchange, PayloadMode, SEED_SIZE,
    SHARED_PAYLOAD_SIZE,
};
pub use errors::{ProtocolError, Result};
pub use key_server::{
    ErrorCode, KeyBundle, KeyServerRequest, KeyServerResponse, MessageType, OneTimePrekey,
    PeerBundle, SignedPrekey,
};
