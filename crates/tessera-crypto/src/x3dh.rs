//! X3DH asynchronous key agreement.
//!
//! The initiator combines a peer's published bundle (identity key, signed
//! prekey, optional one-time prekey) with a fresh ephemeral key. The
//! responder recomputes the same secret from the identity and ephemeral keys
//! carried in the first message.
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)          (only when a one-time prekey was used)
//! SK  = HKDF(F || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! `F` is 0xFF repeated for the identity key length, separating the input
//! from any other use of the same curve points.

use zeroize::Zeroize;

use crate::{
    curve::{CurveId, DhKeyPair, IdentityKeyPair, SHARED_SECRET_LEN, identity_agreement_key,
        verify_signature},
    error::CryptoError,
    kdf::{CHAIN_KEY_LEN, SHARED_AD_LEN, shared_associated_data, x3dh_secret},
};

/// Secrets a fresh session is seeded with. Zeroized on drop.
pub struct X3dhSecrets {
    root_key: [u8; CHAIN_KEY_LEN],
    shared_ad: [u8; SHARED_AD_LEN],
}

impl X3dhSecrets {
    /// Initial root key of the Double Ratchet.
    pub fn root_key(&self) -> &[u8; CHAIN_KEY_LEN] {
        &self.root_key
    }

    /// Associated data bound into every message of the session.
    pub fn shared_ad(&self) -> &[u8; SHARED_AD_LEN] {
        &self.shared_ad
    }
}

impl Drop for X3dhSecrets {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.shared_ad.zeroize();
    }
}

/// Public half of a peer's published key bundle.
#[derive(Debug, Clone, Copy)]
pub struct PeerPrekeys<'a> {
    /// Peer identity key.
    pub identity_key: &'a [u8],
    /// Peer signed prekey.
    pub signed_prekey: &'a [u8],
    /// Signature of the signed prekey by the identity key.
    pub signed_prekey_signature: &'a [u8],
    /// Peer one-time prekey, if the server still had one.
    pub one_time_prekey: Option<&'a [u8]>,
}

/// Initiator side: derive session secrets from a peer bundle.
///
/// Verifies the signed prekey signature before computing anything.
pub fn initiate(
    identity: &IdentityKeyPair,
    self_device_id: &str,
    ephemeral: &DhKeyPair,
    peer_device_id: &str,
    peer: PeerPrekeys<'_>,
) -> Result<X3dhSecrets, CryptoError> {
    let curve = identity.curve();
    verify_signature(curve, peer.identity_key, peer.signed_prekey, peer.signed_prekey_signature)?;

    let peer_identity_dh = identity_agreement_key(curve, peer.identity_key)?;

    let mut input = agreement_prefix(curve, peer.one_time_prekey.is_some());
    input.extend_from_slice(identity.agree(peer.signed_prekey)?.as_bytes());
    input.extend_from_slice(ephemeral.agree(&peer_identity_dh)?.as_bytes());
    input.extend_from_slice(ephemeral.agree(peer.signed_prekey)?.as_bytes());
    if let Some(one_time_prekey) = peer.one_time_prekey {
        input.extend_from_slice(ephemeral.agree(one_time_prekey)?.as_bytes());
    }

    let root_key = x3dh_secret(&input);
    input.zeroize();

    let shared_ad = shared_associated_data(
        identity.public_key(),
        peer.identity_key,
        self_device_id,
        peer_device_id,
    );

    Ok(X3dhSecrets { root_key, shared_ad })
}

/// Responder side: recompute the initiator's secrets from the first message.
pub fn respond(
    identity: &IdentityKeyPair,
    self_device_id: &str,
    signed_prekey: &DhKeyPair,
    one_time_prekey: Option<&DhKeyPair>,
    peer_device_id: &str,
    peer_identity_key: &[u8],
    peer_ephemeral_key: &[u8],
) -> Result<X3dhSecrets, CryptoError> {
    let curve = identity.curve();
    let peer_identity_dh = identity_agreement_key(curve, peer_identity_key)?;

    let mut input = agreement_prefix(curve, one_time_prekey.is_some());
    input.extend_from_slice(signed_prekey.agree(&peer_identity_dh)?.as_bytes());
    input.extend_from_slice(identity.agree(peer_ephemeral_key)?.as_bytes());
    input.extend_from_slice(signed_prekey.agree(peer_ephemeral_key)?.as_bytes());
    if let Some(one_time_prekey) = one_time_prekey {
        input.extend_from_slice(one_time_prekey.agree(peer_ephemeral_key)?.as_bytes());
    }

    let root_key = x3dh_secret(&input);
    input.zeroize();

    let shared_ad = shared_associated_data(
        peer_identity_key,
        identity.public_key(),
        peer_device_id,
        self_device_id,
    );

    Ok(X3dhSecrets { root_key, shared_ad })
}

fn agreement_prefix(curve: CurveId, with_one_time_prekey: bool) -> Vec<u8> {
    let agreements = if with_one_time_prekey { 4 } else { 3 };
    let mut input = Vec::with_capacity(curve.identity_key_len() + agreements * SHARED_SECRET_LEN);
    input.resize(curve.identity_key_len(), 0xFF);
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        identity: IdentityKeyPair,
        signed_prekey: DhKeyPair,
        signature: Vec<u8>,
        one_time_prekey: DhKeyPair,
    }

    fn party(curve: CurveId, base: u8) -> Party {
        let mut seed = [base; 32];
        seed[0] = 0x01;
        let identity = IdentityKeyPair::from_seed(curve, seed).unwrap();
        seed[1] = 0x02;
        let signed_prekey = DhKeyPair::from_seed(curve, seed).unwrap();
        seed[1] = 0x03;
        let one_time_prekey = DhKeyPair::from_seed(curve, seed).unwrap();
        let signature = identity.sign(signed_prekey.public_key()).unwrap();
        Party { identity, signed_prekey, signature, one_time_prekey }
    }

    fn ephemeral(curve: CurveId) -> DhKeyPair {
        let mut seed = [0x42; 32];
        seed[0] = 0x01;
        DhKeyPair::from_seed(curve, seed).unwrap()
    }

    #[test]
    fn both_sides_agree_with_one_time_prekey() {
        for curve in CurveId::ALL {
            let alice = party(curve, 0x10);
            let bob = party(curve, 0x20);
            let ek = ephemeral(curve);

            let initiator = initiate(&alice.identity, "alice", &ek, "bob", PeerPrekeys {
                identity_key: bob.identity.public_key(),
                signed_prekey: bob.signed_prekey.public_key(),
                signed_prekey_signature: &bob.signature,
                one_time_prekey: Some(bob.one_time_prekey.public_key()),
            })
            .unwrap();

            let responder = respond(
                &bob.identity,
                "bob",
                &bob.signed_prekey,
                Some(&bob.one_time_prekey),
                "alice",
                alice.identity.public_key(),
                ek.public_key(),
            )
            .unwrap();

            assert_eq!(initiator.root_key(), responder.root_key());
            assert_eq!(initiator.shared_ad(), responder.shared_ad());
        }
    }

    #[test]
    fn both_sides_agree_without_one_time_prekey() {
        for curve in CurveId::ALL {
            let alice = party(curve, 0x30);
            let bob = party(curve, 0x40);
            let ek = ephemeral(curve);

            let initiator = initiate(&alice.identity, "alice", &ek, "bob", PeerPrekeys {
                identity_key: bob.identity.public_key(),
                signed_prekey: bob.signed_prekey.public_key(),
                signed_prekey_signature: &bob.signature,
                one_time_prekey: None,
            })
            .unwrap();

            let responder = respond(
                &bob.identity,
                "bob",
                &bob.signed_prekey,
                None,
                "alice",
                alice.identity.public_key(),
                ek.public_key(),
            )
            .unwrap();

            assert_eq!(initiator.root_key(), responder.root_key());
        }
    }

    #[test]
    fn missing_one_time_prekey_on_responder_diverges() {
        let curve = CurveId::Curve25519;
        let alice = party(curve, 0x50);
        let bob = party(curve, 0x60);
        let ek = ephemeral(curve);

        let initiator = initiate(&alice.identity, "alice", &ek, "bob", PeerPrekeys {
            identity_key: bob.identity.public_key(),
            signed_prekey: bob.signed_prekey.public_key(),
            signed_prekey_signature: &bob.signature,
            one_time_prekey: Some(bob.one_time_prekey.public_key()),
        })
        .unwrap();

        let responder = respond(
            &bob.identity,
            "bob",
            &bob.signed_prekey,
            None,
            "alice",
            alice.identity.public_key(),
            ek.public_key(),
        )
        .unwrap();

        assert_ne!(initiator.root_key(), responder.root_key());
    }

    #[test]
    fn forged_signed_prekey_is_rejected() {
        for curve in CurveId::ALL {
            let alice = party(curve, 0x70);
            let bob = party(curve, 0x71);
            let mallory = party(curve, 0x72);
            let ek = ephemeral(curve);

            let result = initiate(&alice.identity, "alice", &ek, "bob", PeerPrekeys {
                identity_key: bob.identity.public_key(),
                signed_prekey: mallory.signed_prekey.public_key(),
                signed_prekey_signature: &bob.signature,
                one_time_prekey: None,
            });

            assert!(matches!(result, Err(CryptoError::InvalidSignature)));
        }
    }
}
