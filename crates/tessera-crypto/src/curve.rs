//! Curve abstraction for the two supported key families.
//!
//! A local identity picks one curve at creation and keeps it for life. Every
//! key it owns, and every key it accepts from peers, lives on that curve.
//!
//! | curve | identity key | agreement key | signature |
//! |---|---|---|---|
//! | [`CurveId::Curve25519`] | Ed25519, 32 bytes | X25519, 32 bytes | 64 bytes |
//! | [`CurveId::P256`] | P-256 SEC1 compressed, 33 bytes | same point, 33 bytes | 64 bytes |
//!
//! Key generation is pure: callers provide the 32 bytes of secret seed so
//! tests stay deterministic.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Length of every secret scalar or seed handled here.
pub const SECRET_LEN: usize = 32;

/// Length of the output of a key agreement, on both curves.
pub const SHARED_SECRET_LEN: usize = 32;

/// Supported curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurveId {
    /// Ed25519 identities with X25519 agreement.
    Curve25519,
    /// NIST P-256 for both signatures and agreement.
    P256,
}

impl CurveId {
    /// Both curves, in wire-id order.
    pub const ALL: [CurveId; 2] = [CurveId::Curve25519, CurveId::P256];

    /// Identifier carried on the wire.
    pub const fn wire_id(self) -> u8 {
        match self {
            Self::Curve25519 => 1,
            Self::P256 => 2,
        }
    }

    /// Parse a wire identifier. `None` for unknown values.
    pub const fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Curve25519),
            2 => Some(Self::P256),
            _ => None,
        }
    }

    /// Length of a public identity key.
    pub const fn identity_key_len(self) -> usize {
        match self {
            Self::Curve25519 => 32,
            Self::P256 => 33,
        }
    }

    /// Length of a public agreement key (ephemeral, prekey, ratchet key).
    pub const fn dh_public_len(self) -> usize {
        match self {
            Self::Curve25519 => 32,
            Self::P256 => 33,
        }
    }

    /// Length of an identity signature.
    pub const fn signature_len(self) -> usize {
        64
    }
}

/// Output of a key agreement. Zeroized on drop.
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Long-term identity key pair. Signs prekeys and takes part in X3DH.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    curve: CurveId,
    secret: [u8; SECRET_LEN],
    public: Vec<u8>,
}

impl IdentityKeyPair {
    /// Derive an identity key pair from a 32-byte seed.
    ///
    /// On P-256 a seed outside the scalar range is rejected; callers retry
    /// with fresh randomness.
    pub fn from_seed(curve: CurveId, seed: [u8; SECRET_LEN]) -> Result<Self, CryptoError> {
        let public = match curve {
            CurveId::Curve25519 => {
                ed25519_dalek::SigningKey::from_bytes(&seed).verifying_key().to_bytes().to_vec()
            },
            CurveId::P256 => p256_public(&seed)?,
        };

        Ok(Self { curve, secret: seed, public })
    }

    /// Curve this key lives on.
    pub fn curve(&self) -> CurveId {
        self.curve
    }

    /// Public identity key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.curve {
            CurveId::Curve25519 => {
                let key = ed25519_dalek::SigningKey::from_bytes(&self.secret);
                let signature = ed25519_dalek::Signer::sign(&key, message);
                Ok(signature.to_bytes().to_vec())
            },
            CurveId::P256 => {
                let secret = p256_secret(&self.secret)?;
                let key = p256::ecdsa::SigningKey::from(&secret);
                let signature: p256::ecdsa::Signature =
                    p256::ecdsa::signature::Signer::sign(&key, message);
                Ok(signature.to_bytes().to_vec())
            },
        }
    }

    /// Key agreement between our identity key and a peer agreement key.
    pub fn agree(&self, peer_dh_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        match self.curve {
            CurveId::Curve25519 => {
                let scalar = Zeroizing::new(
                    ed25519_dalek::SigningKey::from_bytes(&self.secret).to_scalar_bytes(),
                );
                raw_agree(self.curve, &scalar, peer_dh_public)
            },
            CurveId::P256 => raw_agree(self.curve, &self.secret, peer_dh_public),
        }
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("curve", &self.curve)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Agreement key pair: signed prekeys, one-time prekeys, ephemeral and
/// ratchet keys.
#[derive(Clone, Serialize, Deserialize)]
pub struct DhKeyPair {
    curve: CurveId,
    secret: [u8; SECRET_LEN],
    public: Vec<u8>,
}

impl DhKeyPair {
    /// Derive an agreement key pair from a 32-byte seed.
    pub fn from_seed(curve: CurveId, seed: [u8; SECRET_LEN]) -> Result<Self, CryptoError> {
        let public = match curve {
            CurveId::Curve25519 => {
                let secret = x25519_dalek::StaticSecret::from(seed);
                x25519_dalek::PublicKey::from(&secret).to_bytes().to_vec()
            },
            CurveId::P256 => p256_public(&seed)?,
        };

        Ok(Self { curve, secret: seed, public })
    }

    /// Curve this key lives on.
    pub fn curve(&self) -> CurveId {
        self.curve
    }

    /// Public key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Key agreement with a peer agreement key.
    pub fn agree(&self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        raw_agree(self.curve, &self.secret, peer_public)
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("curve", &self.curve)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Verify an identity signature.
pub fn verify_signature(
    curve: CurveId,
    identity_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    check_len(signature, curve.signature_len())?;

    match curve {
        CurveId::Curve25519 => {
            let key = ed25519_verifying_key(identity_key)?;
            let mut bytes = [0u8; 64];
            bytes.copy_from_slice(signature);
            let signature = ed25519_dalek::Signature::from_bytes(&bytes);
            key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
        },
        CurveId::P256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(identity_key)
                .map_err(|e| CryptoError::InvalidKey { curve, reason: e.to_string() })?;
            let signature = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| CryptoError::InvalidSignature)?;
            p256::ecdsa::signature::Verifier::verify(&key, message, &signature)
                .map_err(|_| CryptoError::InvalidSignature)
        },
    }
}

/// Convert a public identity key into its agreement form.
///
/// Ed25519 identities map to their Montgomery point; P-256 identities are
/// already agreement keys.
pub fn identity_agreement_key(curve: CurveId, identity_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match curve {
        CurveId::Curve25519 => {
            Ok(ed25519_verifying_key(identity_key)?.to_montgomery().to_bytes().to_vec())
        },
        CurveId::P256 => {
            check_len(identity_key, curve.identity_key_len())?;
            Ok(identity_key.to_vec())
        },
    }
}

fn raw_agree(
    curve: CurveId,
    secret: &[u8; SECRET_LEN],
    peer_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    check_len(peer_public, curve.dh_public_len())?;

    match curve {
        CurveId::Curve25519 => {
            let mut peer = [0u8; 32];
            peer.copy_from_slice(peer_public);
            let secret = x25519_dalek::StaticSecret::from(*secret);
            let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
            if !shared.was_contributory() {
                return Err(CryptoError::NonContributory);
            }
            Ok(SharedSecret(shared.to_bytes()))
        },
        CurveId::P256 => {
            let secret = p256_secret(secret)?;
            let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                .map_err(|e| CryptoError::InvalidKey { curve, reason: e.to_string() })?;
            let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
            let mut out = [0u8; SHARED_SECRET_LEN];
            out.copy_from_slice(shared.raw_secret_bytes());
            Ok(SharedSecret(out))
        },
    }
}

fn ed25519_verifying_key(identity_key: &[u8]) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    check_len(identity_key, CurveId::Curve25519.identity_key_len())?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(identity_key);
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey {
        curve: CurveId::Curve25519,
        reason: e.to_string(),
    })
}

fn p256_secret(seed: &[u8; SECRET_LEN]) -> Result<p256::SecretKey, CryptoError> {
    p256::SecretKey::from_slice(seed).map_err(|_| CryptoError::InvalidKey {
        curve: CurveId::P256,
        reason: "scalar out of range".to_string(),
    })
}

fn p256_public(seed: &[u8; SECRET_LEN]) -> Result<Vec<u8>, CryptoError> {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let secret = p256_secret(seed)?;
    Ok(secret.public_key().to_encoded_point(true).as_bytes().to_vec())
}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), CryptoError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(CryptoError::InvalidKeyLength { expected, actual: bytes.len() })
    }
}
