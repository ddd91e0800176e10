//! Key-server protocol.
//!
//! Every message starts with a 3-byte header:
//!
//! ```text
//! version (1) | message type (1) | curve (1)
//! ```
//!
//! followed by a type-specific body. Counts and device-id lengths are
//! big-endian u16, key ids big-endian u32, key lengths fixed by the curve.
//!
//! Requests flow client to server, responses server to client. Successful
//! `registerUser`, `deleteUser`, `postSPk` and `postOPks` are acknowledged
//! with a header-only message of the same type.

use bytes::BufMut;
use tessera_crypto::CurveId;

use crate::{
    codec::{Reader, count_u16, curve_from_wire},
    errors::{ProtocolError, Result},
};

/// Key-server protocol version.
pub const KEY_SERVER_VERSION: u8 = 0x01;

const HEADER_SIZE: usize = 3;

/// Key-server message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Remove the sender's device
    DeleteUser = 0x02,
    /// Publish a new signed prekey
    PostSignedPrekey = 0x03,
    /// Publish one-time prekeys
    PostOneTimePrekeys = 0x04,
    /// Ask for the bundles of some devices
    GetPeerBundle = 0x05,
    /// Bundles of the requested devices
    PeerBundle = 0x06,
    /// Ask which of our one-time prekeys the server still holds
    GetSelfOneTimePrekeys = 0x07,
    /// Ids of our one-time prekeys the server still holds
    SelfOneTimePrekeys = 0x08,
    /// Register the sender's device
    RegisterUser = 0x09,
    /// Request failed
    Error = 0xff,
}

impl MessageType {
    /// Convert from the wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::DeleteUser),
            0x03 => Some(Self::PostSignedPrekey),
            0x04 => Some(Self::PostOneTimePrekeys),
            0x05 => Some(Self::GetPeerBundle),
            0x06 => Some(Self::PeerBundle),
            0x07 => Some(Self::GetSelfOneTimePrekeys),
            0x08 => Some(Self::SelfOneTimePrekeys),
            0x09 => Some(Self::RegisterUser),
            0xff => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire value.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Error codes carried by an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Request was not a key-server message
    BadContentType = 0x00,
    /// Curve not served
    BadCurve = 0x01,
    /// Request did not name its sender
    MissingSenderId = 0x02,
    /// Unsupported protocol version
    BadProtocolVersion = 0x03,
    /// Body does not match the announced layout
    BadSize = 0x04,
    /// Device already registered
    UserAlreadyIn = 0x05,
    /// Device not registered
    UserNotFound = 0x06,
    /// Server storage failure
    DbError = 0x07,
    /// Request not understood
    BadRequest = 0x08,
    /// Unspecified server failure
    ServerFailure = 0x09,
    /// Per-device resource limit reached
    ResourceLimitReached = 0x0a,
}

impl ErrorCode {
    /// Convert from the wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::BadContentType),
            0x01 => Some(Self::BadCurve),
            0x02 => Some(Self::MissingSenderId),
            0x03 => Some(Self::BadProtocolVersion),
            0x04 => Some(Self::BadSize),
            0x05 => Some(Self::UserAlreadyIn),
            0x06 => Some(Self::UserNotFound),
            0x07 => Some(Self::DbError),
            0x08 => Some(Self::BadRequest),
            0x09 => Some(Self::ServerFailure),
            0x0a => Some(Self::ResourceLimitReached),
            _ => None,
        }
    }

    /// Wire value.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A signed prekey as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPrekey {
    /// Public key.
    pub public_key: Vec<u8>,
    /// Identity signature over `public_key`.
    pub signature: Vec<u8>,
    /// Key id.
    pub id: u32,
}

/// A one-time prekey as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimePrekey {
    /// Public key.
    pub public_key: Vec<u8>,
    /// Key id.
    pub id: u32,
}

/// Key bundle of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    /// Device identity key.
    pub identity_key: Vec<u8>,
    /// Current signed prekey.
    pub signed_prekey: SignedPrekey,
    /// One of the device's one-time prekeys, consumed by this fetch.
    pub one_time_prekey: Option<OneTimePrekey>,
}

/// Answer for one requested device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBundle {
    /// Requested device id.
    pub device_id: String,
    /// `None` when the server holds nothing for that device.
    pub bundle: Option<KeyBundle>,
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyServerRequest {
    /// Register the sender with its initial keys.
    RegisterUser {
        /// Identity key.
        identity_key: Vec<u8>,
        /// First signed prekey.
        signed_prekey: SignedPrekey,
        /// Initial one-time prekeys.
        one_time_prekeys: Vec<OneTimePrekey>,
    },
    /// Remove the sender.
    DeleteUser,
    /// Replace the sender's signed prekey.
    PostSignedPrekey(SignedPrekey),
    /// Add one-time prekeys.
    PostOneTimePrekeys(Vec<OneTimePrekey>),
    /// Fetch the bundles of these devices.
    GetPeerBundles(Vec<String>),
    /// List the one-time prekey ids still held for the sender.
    GetSelfOneTimePrekeys,
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyServerResponse {
    /// Header-only acknowledgement of a request of this type.
    Ack(MessageType),
    /// Bundles, one per requested device.
    PeerBundles(Vec<PeerBundle>),
    /// One-time prekey ids the server still holds.
    SelfOneTimePrekeys(Vec<u32>),
    /// Request failed.
    Error {
        /// Failure kind.
        code: ErrorCode,
        /// Optional diagnostic.
        message: Option<String>,
    },
}

impl KeyServerRequest {
    /// Message type on the wire.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RegisterUser { .. } => MessageType::RegisterUser,
            Self::DeleteUser => MessageType::DeleteUser,
            Self::PostSignedPrekey(_) => MessageType::PostSignedPrekey,
            Self::PostOneTimePrekeys(_) => MessageType::PostOneTimePrekeys,
            Self::GetPeerBundles(_) => MessageType::GetPeerBundle,
            Self::GetSelfOneTimePrekeys => MessageType::GetSelfOneTimePrekeys,
        }
    }

    /// Encode for a sender on `curve`.
    ///
    /// # Errors
    ///
    /// - `TooManyEntries` if a list does not fit a 16-bit count
    pub fn encode(&self, curve: CurveId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_header(&mut out, self.message_type(), curve.wire_id());

        match self {
            Self::RegisterUser { identity_key, signed_prekey, one_time_prekeys } => {
                out.put_slice(identity_key);
                out.put_slice(&signed_prekey.public_key);
                out.put_slice(&signed_prekey.signature);
                out.put_u32(signed_prekey.id);
                put_one_time_prekeys(&mut out, one_time_prekeys)?;
            },
            Self::DeleteUser | Self::GetSelfOneTimePrekeys => {},
            Self::PostSignedPrekey(signed_prekey) => {
                out.put_slice(&signed_prekey.public_key);
                out.put_slice(&signed_prekey.signature);
                out.put_u32(signed_prekey.id);
            },
            Self::PostOneTimePrekeys(keys) => put_one_time_prekeys(&mut out, keys)?,
            Self::GetPeerBundles(device_ids) => {
                out.put_u16(count_u16(device_ids.len())?);
                for device_id in device_ids {
                    put_device_id(&mut out, device_id)?;
                }
            },
        }
        Ok(out)
    }

    /// Decode a request. Returns the sender's curve alongside.
    ///
    /// # Errors
    ///
    /// - `UnsupportedVersion`, `UnsupportedCurve`, `UnknownMessageType` for
    ///   header values we do not know
    /// - `UnexpectedMessageType` for response types
    /// - `TooShort`, `TrailingBytes` for bodies that disagree with the layout
    pub fn decode(bytes: &[u8]) -> Result<(CurveId, Self)> {
        let mut reader = Reader::new(bytes);
        let (message_type, raw_curve) = read_header(&mut reader)?;
        let curve = curve_from_wire(raw_curve)?;

        let request = match message_type {
            MessageType::RegisterUser => {
                let identity_key = reader.vec(curve.identity_key_len())?;
                let signed_prekey = read_signed_prekey(&mut reader, curve)?;
                let one_time_prekeys = read_one_time_prekeys(&mut reader, curve)?;
                Self::RegisterUser { identity_key, signed_prekey, one_time_prekeys }
            },
            MessageType::DeleteUser => Self::DeleteUser,
            MessageType::PostSignedPrekey => {
                Self::PostSignedPrekey(read_signed_prekey(&mut reader, curve)?)
            },
            MessageType::PostOneTimePrekeys => {
                Self::PostOneTimePrekeys(read_one_time_prekeys(&mut reader, curve)?)
            },
            MessageType::GetPeerBundle => {
                let count = reader.u16()?;
                let mut device_ids = Vec::with_capacity(usize::from(count).min(reader.remaining()));
                for _ in 0..count {
                    device_ids.push(reader.device_id()?);
                }
                Self::GetPeerBundles(device_ids)
            },
            MessageType::GetSelfOneTimePrekeys => Self::GetSelfOneTimePrekeys,
            MessageType::PeerBundle | MessageType::SelfOneTimePrekeys | MessageType::Error => {
                return Err(ProtocolError::UnexpectedMessageType(message_type.to_u8()));
            },
        };

        reader.finish()?;
        Ok((curve, request))
    }
}

impl KeyServerResponse {
    /// Message type on the wire.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ack(message_type) => *message_type,
            Self::PeerBundles(_) => MessageType::PeerBundle,
            Self::SelfOneTimePrekeys(_) => MessageType::SelfOneTimePrekeys,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Encode an answer to a client on `curve`.
    ///
    /// # Errors
    ///
    /// - `TooManyEntries` if a list does not fit a 16-bit count
    pub fn encode(&self, curve: CurveId) -> Result<Vec<u8>> {
        if let Self::Error { code, message } = self {
            return Ok(encode_error(curve.wire_id(), *code, message.as_deref()));
        }

        let mut out = Vec::new();
        match self {
            Self::Ack(message_type) => put_header(&mut out, *message_type, curve.wire_id()),
            Self::PeerBundles(bundles) => {
                put_header(&mut out, MessageType::PeerBundle, curve.wire_id());
                out.put_u16(count_u16(bundles.len())?);
                for entry in bundles {
                    put_device_id(&mut out, &entry.device_id)?;
                    match &entry.bundle {
                        None => out.put_u8(BUNDLE_ABSENT),
                        Some(bundle) => {
                            out.put_u8(if bundle.one_time_prekey.is_some() {
                                BUNDLE_WITH_ONE_TIME_PREKEY
                            } else {
                                BUNDLE_WITHOUT_ONE_TIME_PREKEY
                            });
                            out.put_slice(&bundle.identity_key);
                            out.put_slice(&bundle.signed_prekey.public_key);
                            out.put_u32(bundle.signed_prekey.id);
                            out.put_slice(&bundle.signed_prekey.signature);
                            if let Some(one_time_prekey) = &bundle.one_time_prekey {
                                out.put_slice(&one_time_prekey.public_key);
                                out.put_u32(one_time_prekey.id);
                            }
                        },
                    }
                }
            },
            Self::SelfOneTimePrekeys(ids) => {
                put_header(&mut out, MessageType::SelfOneTimePrekeys, curve.wire_id());
                out.put_u16(count_u16(ids.len())?);
                for id in ids {
                    out.put_u32(*id);
                }
            },
            Self::Error { .. } => {},
        }
        Ok(out)
    }

    /// Decode a response addressed to a client on `curve`.
    ///
    /// Error responses are accepted whatever their curve byte, since the
    /// error may be about the curve itself.
    ///
    /// # Errors
    ///
    /// - `CurveMismatch` if a non-error response names another curve
    /// - `UnexpectedMessageType` for request-only types
    /// - `UnknownErrorCode`, `InvalidBundleFlag` for values we do not know
    /// - `TooShort`, `TrailingBytes` for bodies that disagree with the layout
    pub fn decode(bytes: &[u8], curve: CurveId) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let (message_type, raw_curve) = read_header(&mut reader)?;

        if message_type == MessageType::Error {
            let raw_code = reader.u8()?;
            let code =
                ErrorCode::from_u8(raw_code).ok_or(ProtocolError::UnknownErrorCode(raw_code))?;
            let rest = reader.rest();
            let message =
                (!rest.is_empty()).then(|| String::from_utf8_lossy(rest).into_owned());
            return Ok(Self::Error { code, message });
        }

        if raw_curve != curve.wire_id() {
            return Err(ProtocolError::CurveMismatch {
                expected: curve.wire_id(),
                actual: raw_curve,
            });
        }

        let response = match message_type {
            MessageType::RegisterUser
            | MessageType::DeleteUser
            | MessageType::PostSignedPrekey
            | MessageType::PostOneTimePrekeys => Self::Ack(message_type),
            MessageType::PeerBundle => {
                let count = reader.u16()?;
                let mut bundles = Vec::with_capacity(usize::from(count).min(reader.remaining()));
                for _ in 0..count {
                    bundles.push(read_peer_bundle(&mut reader, curve)?);
                }
                Self::PeerBundles(bundles)
            },
            MessageType::SelfOneTimePrekeys => {
                let count = reader.u16()?;
                let mut ids = Vec::with_capacity(usize::from(count).min(reader.remaining() / 4));
                for _ in 0..count {
                    ids.push(reader.u32()?);
                }
                Self::SelfOneTimePrekeys(ids)
            },
            MessageType::GetPeerBundle
            | MessageType::GetSelfOneTimePrekeys
            | MessageType::Error => {
                return Err(ProtocolError::UnexpectedMessageType(message_type.to_u8()));
            },
        };

        reader.finish()?;
        Ok(response)
    }
}

/// Encode an error response with a raw curve byte.
///
/// Used when the request's own curve could not be parsed.
pub fn encode_error(curve_byte: u8, code: ErrorCode, message: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 1 + message.map_or(0, str::len));
    put_header(&mut out, MessageType::Error, curve_byte);
    out.put_u8(code.to_u8());
    if let Some(message) = message {
        out.put_slice(message.as_bytes());
    }
    out
}

const BUNDLE_WITHOUT_ONE_TIME_PREKEY: u8 = 0;
const BUNDLE_WITH_ONE_TIME_PREKEY: u8 = 1;
const BUNDLE_ABSENT: u8 = 2;

fn put_header(out: &mut Vec<u8>, message_type: MessageType, curve_byte: u8) {
    out.put_u8(KEY_SERVER_VERSION);
    out.put_u8(message_type.to_u8());
    out.put_u8(curve_byte);
}

fn put_device_id(out: &mut Vec<u8>, device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(ProtocolError::InvalidDeviceId);
    }
    let len = u16::try_from(device_id.len()).map_err(|_| ProtocolError::InvalidDeviceId)?;
    out.put_u16(len);
    out.put_slice(device_id.as_bytes());
    Ok(())
}

fn put_one_time_prekeys(out: &mut Vec<u8>, keys: &[OneTimePrekey]) -> Result<()> {
    out.put_u16(count_u16(keys.len())?);
    for key in keys {
        out.put_slice(&key.public_key);
        out.put_u32(key.id);
    }
    Ok(())
}

fn read_header(reader: &mut Reader<'_>) -> Result<(MessageType, u8)> {
    if reader.remaining() < HEADER_SIZE {
        return Err(ProtocolError::TooShort { expected: HEADER_SIZE, actual: reader.remaining() });
    }
    let version = reader.u8()?;
    if version != KEY_SERVER_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let raw_type = reader.u8()?;
    let message_type =
        MessageType::from_u8(raw_type).ok_or(ProtocolError::UnknownMessageType(raw_type))?;
    Ok((message_type, reader.u8()?))
}

fn read_signed_prekey(reader: &mut Reader<'_>, curve: CurveId) -> Result<SignedPrekey> {
    let public_key = reader.vec(curve.dh_public_len())?;
    let signature = reader.vec(curve.signature_len())?;
    let id = reader.u32()?;
    Ok(SignedPrekey { public_key, signature, id })
}

fn read_one_time_prekeys(reader: &mut Reader<'_>, curve: CurveId) -> Result<Vec<OneTimePrekey>> {
    let count = reader.u16()?;
    let mut keys = Vec::with_capacity(usize::from(count).min(reader.remaining()));
    for _ in 0..count {
        let public_key = reader.vec(curve.dh_public_len())?;
        let id = reader.u32()?;
        keys.push(OneTimePrekey { public_key, id });
    }
    Ok(keys)
}

fn read_peer_bundle(reader: &mut Reader<'_>, curve: CurveId) -> Result<PeerBundle> {
    let device_id = reader.device_id()?;
    let flag = reader.u8()?;

    let bundle = match flag {
        BUNDLE_ABSENT => None,
        BUNDLE_WITHOUT_ONE_TIME_PREKEY | BUNDLE_WITH_ONE_TIME_PREKEY => {
            let identity_key = reader.vec(curve.identity_key_len())?;
            let public_key = reader.vec(curve.dh_public_len())?;
            let id = reader.u32()?;
            let signature = reader.vec(curve.signature_len())?;
            let one_time_prekey = if flag == BUNDLE_WITH_ONE_TIME_PREKEY {
                let public_key = reader.vec(curve.dh_public_len())?;
                let id = reader.u32()?;
                Some(OneTimePrekey { public_key, id })
            } else {
                None
            };
            Some(KeyBundle {
                identity_key,
                signed_prekey: SignedPrekey { public_key, signature, id },
                one_time_prekey,
            })
        },
        other => return Err(ProtocolError::InvalidBundleFlag(other)),
    };

    Ok(PeerBundle { device_id, bundle })
}
