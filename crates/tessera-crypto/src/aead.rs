//! Authenticated encryption using `XChaCha20-Poly1305`
//!
//! Keys and nonces are always derived, never random: every [`AeadKey`] comes
//! out of the ratchet chain or a seed expansion and is used exactly once.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Single-use key and nonce. Zeroized on drop.
#[derive(Clone)]
pub struct AeadKey {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl AeadKey {
    /// Build from derived key material.
    pub fn new(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, nonce }
    }

    /// Symmetric key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Nonce bound to this key.
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
}

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

/// Encrypt and authenticate `plaintext` together with `associated_data`.
///
/// Output is `ciphertext || tag`, `TAG_SIZE` bytes longer than the input.
pub fn seal(key: &AeadKey, associated_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.key().into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(key.nonce()), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Verify and decrypt `ciphertext || tag`.
///
/// # Errors
///
/// - `DecryptionFailed`: tag mismatch, wrong key, wrong associated data, or
///   input shorter than a tag
pub fn open(
    key: &AeadKey,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("ciphertext of {} bytes cannot hold a tag", ciphertext.len()),
        });
    }

    let cipher = XChaCha20Poly1305::new(key.key().into());
    let payload = Payload { msg: ciphertext, aad: associated_data };

    cipher.decrypt(XNonce::from_slice(key.nonce()), payload).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}

/// Authentication tag of a sealed message (its last `TAG_SIZE` bytes).
///
/// Returns `None` if the input is too short to carry one.
pub fn tag_of(ciphertext: &[u8]) -> Option<&[u8]> {
    ciphertext.len().checked_sub(TAG_SIZE).map(|start| &ciphertext[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> AeadKey {
        AeadKey::new([fill; KEY_SIZE], [fill.wrapping_add(1); NONCE_SIZE])
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key(1);
        let sealed = seal(&key, b"ad", b"Hello, World!");

        assert_eq!(sealed.len(), 13 + TAG_SIZE);
        assert_eq!(open(&key, b"ad", &sealed).unwrap(), b"Hello, World!");
    }

    #[test]
    fn seal_open_empty_message() {
        let key = test_key(2);
        let sealed = seal(&key, b"", b"");

        assert_eq!(sealed.len(), TAG_SIZE);
        assert!(open(&key, b"", &sealed).unwrap().is_empty());
    }

    #[test]
    fn wrong_associated_data_fails() {
        let key = test_key(3);
        let sealed = seal(&key, b"alice||bob", b"secret");

        let result = open(&key, b"alice||eve", &sealed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&test_key(4), b"", b"secret");
        assert!(open(&test_key(5), b"", &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key(6);
        let mut sealed = seal(&key, b"", b"secret");
        sealed[0] ^= 0x01;

        assert!(open(&key, b"", &sealed).is_err());
    }

    #[test]
    fn truncated_input_fails_without_panic() {
        let key = test_key(7);
        let result = open(&key, b"", &[0u8; TAG_SIZE - 1]);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn tag_is_trailing_bytes() {
        let key = test_key(8);
        let sealed = seal(&key, b"", b"abc");

        assert_eq!(tag_of(&sealed), Some(&sealed[3..]));
        assert_eq!(tag_of(&[0u8; 4]), None);
    }
}
