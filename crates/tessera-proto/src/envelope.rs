//! Message envelope: the per-recipient output of an encryption.
//!
//! ```text
//! version (1) | flags (1) | curve (1)
//! [key exchange, if KEY_EXCHANGE]
//!     one-time prekey flag (1) | identity key | ephemeral key
//!     signed prekey id (4) | [one-time prekey id (4)]
//! ns (2) | pn (2) | ratchet public key
//! payload
//!     DIRECT_PAYLOAD: ciphertext || tag
//!     otherwise:      encrypted seed (32) || tag
//! ```
//!
//! All integers are big-endian. Key lengths are fixed by the curve.
//!
//! # Security
//!
//! [`Envelope::decode`] computes the exact layout from the fixed header
//! before reading any variable region. A version, curve or flag it does not
//! know, or any length that disagrees with the layout, rejects the input.

use bitflags::bitflags;
use bytes::BufMut;
use tessera_crypto::{CurveId, RatchetHeader, TAG_SIZE};

use crate::{
    codec::{Reader, curve_from_wire},
    errors::{ProtocolError, Result},
};

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Size of the random seed protecting a shared ciphertext.
pub const SEED_SIZE: usize = 32;

/// Size of an encrypted seed (seed plus tag).
pub const SHARED_PAYLOAD_SIZE: usize = SEED_SIZE + TAG_SIZE;

/// Size of the fixed header (version, flags, curve).
const FIXED_HEADER_SIZE: usize = 3;

/// Size of the ratchet counters (ns, pn).
const COUNTERS_SIZE: usize = 4;

bitflags! {
    /// Envelope feature flags (8 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvelopeFlags: u8 {
        /// Envelope carries the X3DH key-exchange block
        const KEY_EXCHANGE = 0b0000_0001;

        /// Payload is the message ciphertext itself, not an encrypted seed
        const DIRECT_PAYLOAD = 0b0000_0010;
    }
}

/// How the message body travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadMode {
    /// Each envelope embeds the message ciphertext.
    Direct,
    /// Each envelope embeds an encrypted seed; the message is encrypted once
    /// into a shared ciphertext sent alongside.
    Shared,
}

/// Key-exchange material carried by the first message of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    /// Sender identity key.
    pub identity_key: Vec<u8>,
    /// Sender ephemeral key.
    pub ephemeral_key: Vec<u8>,
    /// Id of the recipient signed prekey used.
    pub signed_prekey_id: u32,
    /// Id of the recipient one-time prekey used, if any.
    pub one_time_prekey_id: Option<u32>,
}

/// Decoded envelope.
///
/// # Invariants
///
/// - Key lengths match `curve`. Enforced by [`Envelope::decode`]; encoders
///   are trusted to build envelopes from keys of the right curve.
/// - In [`PayloadMode::Shared`], `payload` is exactly
///   [`SHARED_PAYLOAD_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Curve of both endpoints.
    pub curve: CurveId,
    /// Present only on the first message of an initiator session.
    pub key_exchange: Option<KeyExchange>,
    /// Ratchet header.
    pub header: RatchetHeader,
    /// Payload mode.
    pub mode: PayloadMode,
    /// Ciphertext or encrypted seed, tag included.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Flags describing this envelope.
    pub fn flags(&self) -> EnvelopeFlags {
        let mut flags = EnvelopeFlags::empty();
        flags.set(EnvelopeFlags::KEY_EXCHANGE, self.key_exchange.is_some());
        flags.set(EnvelopeFlags::DIRECT_PAYLOAD, self.mode == PayloadMode::Direct);
        flags
    }

    /// Whether the envelope carries key-exchange material.
    pub fn has_key_exchange(&self) -> bool {
        self.key_exchange.is_some()
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        layout_len(self.curve, self.flags(), self.one_time_prekey_present()) + self.payload.len()
    }

    /// Encode into a buffer.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(ENVELOPE_VERSION);
        dst.put_u8(self.flags().bits());
        dst.put_u8(self.curve.wire_id());

        if let Some(kx) = &self.key_exchange {
            dst.put_u8(u8::from(kx.one_time_prekey_id.is_some()));
            dst.put_slice(&kx.identity_key);
            dst.put_slice(&kx.ephemeral_key);
            dst.put_u32(kx.signed_prekey_id);
            if let Some(id) = kx.one_time_prekey_id {
                dst.put_u32(id);
            }
        }

        dst.put_u16(self.header.ns);
        dst.put_u16(self.header.pn);
        dst.put_slice(&self.header.dh_public);
        dst.put_slice(&self.payload);
    }

    /// Encode into a fresh vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// - `TooShort` if the input cannot hold the fixed header, or the layout
    ///   the header announces
    /// - `UnsupportedVersion`, `InvalidFlags`, `UnsupportedCurve`,
    ///   `InvalidOneTimePrekeyFlag` for unknown header values
    /// - `LengthMismatch` if a shared-mode payload is not exactly
    ///   [`SHARED_PAYLOAD_SIZE`] bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: FIXED_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut reader = Reader::new(bytes);
        let version = reader.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let raw_flags = reader.u8()?;
        let flags =
            EnvelopeFlags::from_bits(raw_flags).ok_or(ProtocolError::InvalidFlags(raw_flags))?;
        let curve = curve_from_wire(reader.u8()?)?;

        let one_time_prekey_present = if flags.contains(EnvelopeFlags::KEY_EXCHANGE) {
            match bytes.get(FIXED_HEADER_SIZE).copied() {
                Some(0) => false,
                Some(1) => true,
                Some(other) => return Err(ProtocolError::InvalidOneTimePrekeyFlag(other)),
                None => {
                    return Err(ProtocolError::TooShort {
                        expected: FIXED_HEADER_SIZE + 1,
                        actual: bytes.len(),
                    });
                },
            }
        } else {
            false
        };

        let mode = if flags.contains(EnvelopeFlags::DIRECT_PAYLOAD) {
            PayloadMode::Direct
        } else {
            PayloadMode::Shared
        };

        let layout = layout_len(curve, flags, one_time_prekey_present);
        match mode {
            PayloadMode::Direct if bytes.len() < layout + TAG_SIZE => {
                return Err(ProtocolError::TooShort {
                    expected: layout + TAG_SIZE,
                    actual: bytes.len(),
                });
            },
            PayloadMode::Shared if bytes.len() != layout + SHARED_PAYLOAD_SIZE => {
                return Err(ProtocolError::LengthMismatch {
                    expected: layout + SHARED_PAYLOAD_SIZE,
                    actual: bytes.len(),
                });
            },
            _ => {},
        }

        let key_exchange = if flags.contains(EnvelopeFlags::KEY_EXCHANGE) {
            let _presence = reader.u8()?;
            let identity_key = reader.vec(curve.identity_key_len())?;
            let ephemeral_key = reader.vec(curve.dh_public_len())?;
            let signed_prekey_id = reader.u32()?;
            let one_time_prekey_id =
                if one_time_prekey_present { Some(reader.u32()?) } else { None };
            Some(KeyExchange { identity_key, ephemeral_key, signed_prekey_id, one_time_prekey_id })
        } else {
            None
        };

        let ns = reader.u16()?;
        let pn = reader.u16()?;
        let dh_public = reader.vec(curve.dh_public_len())?;
        let payload = reader.rest().to_vec();

        debug_assert_eq!(layout + payload.len(), bytes.len());

        Ok(Self { curve, key_exchange, header: RatchetHeader { ns, pn, dh_public }, mode, payload })
    }

    fn one_time_prekey_present(&self) -> bool {
        self.key_exchange.as_ref().is_some_and(|kx| kx.one_time_prekey_id.is_some())
    }
}

/// Size of everything before the payload.
fn layout_len(curve: CurveId, flags: EnvelopeFlags, one_time_prekey_present: bool) -> usize {
    let mut len = FIXED_HEADER_SIZE + COUNTERS_SIZE + curve.dh_public_len();
    if flags.contains(EnvelopeFlags::KEY_EXCHANGE) {
        len += 1 + curve.identity_key_len() + curve.dh_public_len() + 4;
        if one_time_prekey_present {
            len += 4;
        }
    }
    len
}
