//! Key schedule: HKDF-SHA512 for root and agreement secrets, HMAC-SHA512 for
//! the symmetric chain.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::aead::{AeadKey, KEY_SIZE, NONCE_SIZE};

type HmacSha512 = Hmac<Sha512>;

/// Length of root keys, chain keys and X3DH outputs.
pub const CHAIN_KEY_LEN: usize = 32;

/// Length of the associated data shared by both ends of a session.
pub const SHARED_AD_LEN: usize = 32;

/// Info for the root chain step.
const ROOT_CHAIN_INFO: &[u8] = b"DR Root Chain Key Derivation";

/// Info for expanding a shared-ciphertext seed into key and nonce.
const SEED_KEY_INFO: &[u8] = b"DR Message Key Derivation";

/// Info for the X3DH shared secret.
const X3DH_SK_INFO: &[u8] = b"Tessera X3DH";

/// Info for the session associated data.
const X3DH_AD_INFO: &[u8] = b"X3DH Associated Data";

/// Chain step input for the message key.
const MESSAGE_KEY_INPUT: [u8; 1] = [0x01];

/// Chain step input for the next chain key.
const CHAIN_KEY_INPUT: [u8; 1] = [0x02];

/// Root chain step: mix a fresh agreement output into the root key.
///
/// Returns `(next_root_key, chain_key)`.
pub fn kdf_root(
    root_key: &[u8; CHAIN_KEY_LEN],
    dh_output: &[u8],
) -> ([u8; CHAIN_KEY_LEN], [u8; CHAIN_KEY_LEN]) {
    let hkdf = Hkdf::<Sha512>::new(Some(root_key.as_slice()), dh_output);

    let mut okm = [0u8; 2 * CHAIN_KEY_LEN];
    let Ok(()) = hkdf.expand(ROOT_CHAIN_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA512 output length");
    };

    let mut next_root = [0u8; CHAIN_KEY_LEN];
    let mut chain = [0u8; CHAIN_KEY_LEN];
    next_root.copy_from_slice(&okm[..CHAIN_KEY_LEN]);
    chain.copy_from_slice(&okm[CHAIN_KEY_LEN..]);
    okm.zeroize();

    (next_root, chain)
}

/// Symmetric chain step.
///
/// Returns `(message_key, next_chain_key)`.
pub fn kdf_chain(chain_key: &[u8; CHAIN_KEY_LEN]) -> (AeadKey, [u8; CHAIN_KEY_LEN]) {
    let mut message = hmac_sha512(chain_key, &MESSAGE_KEY_INPUT);
    let mut next = hmac_sha512(chain_key, &CHAIN_KEY_INPUT);

    let mut key = [0u8; KEY_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    key.copy_from_slice(&message[..KEY_SIZE]);
    nonce.copy_from_slice(&message[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);

    let mut next_chain = [0u8; CHAIN_KEY_LEN];
    next_chain.copy_from_slice(&next[..CHAIN_KEY_LEN]);

    message.zeroize();
    next.zeroize();

    (AeadKey::new(key, nonce), next_chain)
}

/// Expand a random seed into the key protecting a shared ciphertext.
pub fn seed_key(seed: &[u8]) -> AeadKey {
    let hkdf = Hkdf::<Sha512>::new(None, seed);

    let mut okm = [0u8; KEY_SIZE + NONCE_SIZE];
    let Ok(()) = hkdf.expand(SEED_KEY_INFO, &mut okm) else {
        unreachable!("56 bytes is a valid HKDF-SHA512 output length");
    };

    let mut key = [0u8; KEY_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    nonce.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    AeadKey::new(key, nonce)
}

/// Derive the X3DH shared secret from the concatenated agreement outputs.
///
/// `input` is `F || DH1 || DH2 || DH3 [|| DH4]`.
pub fn x3dh_secret(input: &[u8]) -> [u8; CHAIN_KEY_LEN] {
    let salt = [0u8; 64];
    let hkdf = Hkdf::<Sha512>::new(Some(&salt[..]), input);

    let mut secret = [0u8; CHAIN_KEY_LEN];
    let Ok(()) = hkdf.expand(X3DH_SK_INFO, &mut secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA512 output length");
    };
    secret
}

/// Derive the associated data bound into every message of a session.
///
/// Both ends compute it with the initiator's values first.
pub fn shared_associated_data(
    initiator_identity: &[u8],
    responder_identity: &[u8],
    initiator_device: &str,
    responder_device: &str,
) -> [u8; SHARED_AD_LEN] {
    let mut input = Vec::with_capacity(
        initiator_identity.len()
            + responder_identity.len()
            + initiator_device.len()
            + responder_device.len(),
    );
    input.extend_from_slice(initiator_identity);
    input.extend_from_slice(responder_identity);
    input.extend_from_slice(initiator_device.as_bytes());
    input.extend_from_slice(responder_device.as_bytes());

    let hkdf = Hkdf::<Sha512>::new(None, &input);
    let mut ad = [0u8; SHARED_AD_LEN];
    let Ok(()) = hkdf.expand(X3DH_AD_INFO, &mut ad) else {
        unreachable!("32 bytes is a valid HKDF-SHA512 output length");
    };
    ad
}

fn hmac_sha512(key: &[u8], input: &[u8]) -> [u8; 64] {
    let Ok(mut mac) = HmacSha512::new_from_slice(key) else {
        unreachable!("HMAC-SHA512 accepts any key size");
    };
    mac.update(input);

    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
