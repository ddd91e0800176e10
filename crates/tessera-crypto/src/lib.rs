//! Tessera Cryptographic Primitives
//!
//! Building blocks for pairwise end-to-end encrypted sessions. Pure functions
//! with deterministic outputs: callers provide every secret seed, so the same
//! inputs always produce the same keys and ciphertexts.
//!
//! # Key Lifecycle
//!
//! A session starts with an X3DH agreement against a peer's published key
//! bundle and continues with a Double Ratchet. Every message gets its own
//! key, and every round trip mixes fresh agreement output into the root.
//!
//! ```text
//! Identity keys + prekeys + ephemeral
//!        │
//!        ▼
//! X3DH → root key, shared associated data
//!        │
//!        ▼
//! DH ratchet → root key', chain key
//!        │
//!        ▼
//! Symmetric chain → message key (key + nonce)
//!        │
//!        ▼
//! XChaCha20-Poly1305 → ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are overwritten after deriving the next one
//! - Message keys are used for exactly one encryption
//! - Skipped keys are bounded and pruned
//!
//! Post-Compromise Security:
//! - Each new peer ratchet key triggers a DH step mixed into the root key
//!
//! Authenticity:
//! - Signed prekeys are verified against the identity key before agreement
//! - The session associated data binds both identity keys and device ids
//! - Failed authentication tag leaves the session untouched
//!
//! # Curves
//!
//! Two curve families are supported, see [`CurveId`]. A session never mixes
//! them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod curve;
pub mod error;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use aead::{AeadKey, TAG_SIZE};
pub use curve::{CurveId, DhKeyPair, IdentityKeyPair, SECRET_LEN, verify_signature};
pub use error::CryptoError;
pub use ratchet::{RatchetHeader, RatchetLimits, RatchetState};
pub use x3dh::{PeerPrekeys, X3dhSecrets};
