//! Property-based tests for the Double Ratchet
//!
//! 1. **Reordering**: every message of a chain decrypts in any delivery order
//!    while gaps stay within the skip bound
//! 2. **Skip bound**: a gap beyond the bound is rejected and leaves the
//!    session able to read the earlier messages
//! 3. **Single use**: no message decrypts twice

use proptest::prelude::*;
use tessera_crypto::{
    CryptoError, CurveId, DhKeyPair, IdentityKeyPair, PeerPrekeys, RatchetHeader, RatchetLimits,
    RatchetState, SECRET_LEN, x3dh,
};

fn seed(fill: u8) -> [u8; SECRET_LEN] {
    let mut seed = [fill; SECRET_LEN];
    seed[0] = 0x01;
    seed
}

/// Alice initiates towards Bob. Returns (alice, bob).
fn session_pair(curve: CurveId) -> (RatchetState, RatchetState) {
    let alice_ik = IdentityKeyPair::from_seed(curve, seed(0x11)).unwrap();
    let bob_ik = IdentityKeyPair::from_seed(curve, seed(0x22)).unwrap();
    let bob_spk = DhKeyPair::from_seed(curve, seed(0x23)).unwrap();
    let signature = bob_ik.sign(bob_spk.public_key()).unwrap();
    let ephemeral = DhKeyPair::from_seed(curve, seed(0x33)).unwrap();

    let alice_secrets = x3dh::initiate(&alice_ik, "alice", &ephemeral, "bob", PeerPrekeys {
        identity_key: bob_ik.public_key(),
        signed_prekey: bob_spk.public_key(),
        signed_prekey_signature: &signature,
        one_time_prekey: None,
    })
    .unwrap();
    let bob_secrets = x3dh::respond(
        &bob_ik,
        "bob",
        &bob_spk,
        None,
        "alice",
        alice_ik.public_key(),
        ephemeral.public_key(),
    )
    .unwrap();

    let alice_dh = DhKeyPair::from_seed(curve, seed(0x44)).unwrap();
    let alice = RatchetState::initiator(&alice_secrets, bob_spk.public_key(), alice_dh).unwrap();
    let bob = RatchetState::responder(&bob_secrets, bob_spk);
    (alice, bob)
}

fn curve() -> impl Strategy<Value = CurveId> {
    prop_oneof![Just(CurveId::Curve25519), Just(CurveId::P256)]
}

/// A message count and a delivery order over it.
fn shuffled_delivery() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..16).prop_flat_map(|count| {
        (Just(count), Just((0..count).collect::<Vec<_>>()).prop_shuffle())
    })
}

fn send(alice: &mut RatchetState, count: usize) -> Vec<(RatchetHeader, Vec<u8>)> {
    (0..count)
        .map(|index| {
            let plaintext = format!("message {index}");
            alice.encrypt(plaintext.as_bytes(), b"chat", RatchetLimits::default()).unwrap()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_any_delivery_order_decrypts(
        curve in curve(),
        (count, order) in shuffled_delivery(),
    ) {
        let (mut alice, mut bob) = session_pair(curve);
        let messages = send(&mut alice, count);
        let limits = RatchetLimits { max_skip: count as u16, ..RatchetLimits::default() };

        for index in order {
            let (header, ciphertext) = &messages[index];
            let plaintext = bob.decrypt(header, ciphertext, b"chat", seed(0x55), limits).unwrap();
            prop_assert_eq!(plaintext, format!("message {index}").into_bytes());
        }

        // PROPERTY: every skipped key was used up
        prop_assert_eq!(bob.skipped_key_count(), 0);

        // PROPERTY: no message decrypts twice
        for (header, ciphertext) in &messages {
            prop_assert!(bob.decrypt(header, ciphertext, b"chat", seed(0x55), limits).is_err());
        }
    }

    #[test]
    fn prop_gap_beyond_skip_bound_is_rejected(
        curve in curve(),
        max_skip in 0u16..8,
        lost in 0usize..12,
    ) {
        let (mut alice, mut bob) = session_pair(curve);
        let messages = send(&mut alice, lost + 1);
        let limits = RatchetLimits { max_skip, ..RatchetLimits::default() };

        let (header, ciphertext) = &messages[lost];
        let result = bob.decrypt(header, ciphertext, b"chat", seed(0x55), limits);

        // ORACLE: the gap before the last message is exactly `lost`
        if lost <= usize::from(max_skip) {
            prop_assert_eq!(result.unwrap(), format!("message {lost}").into_bytes());
        } else {
            let rejected = matches!(result, Err(CryptoError::TooManySkipped { .. }));
            prop_assert!(rejected, "gap of {} accepted with bound {}", lost, max_skip);

            // PROPERTY: the rejected message left the session untouched
            let (header, ciphertext) = &messages[0];
            let first = bob.decrypt(header, ciphertext, b"chat", seed(0x55), limits).unwrap();
            prop_assert_eq!(first, b"message 0".to_vec());
        }
    }
}
