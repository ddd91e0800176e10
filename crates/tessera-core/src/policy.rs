//! Encryption policy: which payload shape an encrypt call uses.
//!
//! The choice is made once per call from the plaintext length and the
//! recipient count, so every recipient of a call gets the same mode.

use serde::{Deserialize, Serialize};
use tessera_crypto::TAG_SIZE;
use tessera_proto::{PayloadMode, SEED_SIZE};

/// How an encrypt call lays out its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptionPolicy {
    /// Each envelope carries the ciphertext.
    DirectMessage,
    /// One shared ciphertext, each envelope carries its key.
    SharedCiphertext,
    /// Whichever mode makes the sender upload fewer bytes.
    #[default]
    OptimizeUploadSize,
    /// Whichever mode moves fewer bytes in total, counting what every
    /// recipient downloads.
    OptimizeGlobalBandwidth,
}

/// Pick the payload mode for `plaintext_len` bytes sent to `recipients`
/// devices.
///
/// Cost model, with `m` the plaintext length and `n` the recipient count:
///
/// - upload: Direct sends `n*m`, Shared sends `m + tag + seed*n`
/// - bandwidth: Direct moves `2*n*m`, Shared moves the upload plus `n`
///   downloads of `seed + m + tag`
///
/// Ties go to Direct.
pub fn select_mode(
    policy: EncryptionPolicy,
    plaintext_len: usize,
    recipients: usize,
) -> PayloadMode {
    let m = plaintext_len as u128;
    let n = recipients as u128;
    let tag = TAG_SIZE as u128;
    let seed = SEED_SIZE as u128;

    let direct = match policy {
        EncryptionPolicy::DirectMessage => true,
        EncryptionPolicy::SharedCiphertext => false,
        EncryptionPolicy::OptimizeUploadSize => n * m <= m + tag + seed * n,
        EncryptionPolicy::OptimizeGlobalBandwidth => {
            2 * n * m <= m + tag + (2 * seed + m + tag) * n
        },
    };

    if direct { PayloadMode::Direct } else { PayloadMode::Shared }
}
