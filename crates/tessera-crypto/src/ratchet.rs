//! Double Ratchet session state.
//!
//! Each encryption advances the sending chain; each message carrying a new
//! peer ratchet key triggers a DH ratchet step that derives fresh receiving
//! and sending chains from the root key.
//!
//! # Security Properties
//!
//! - Forward Secrecy: chain keys are overwritten when advancing, message keys
//!   are used once
//! - Post-Compromise Security: every DH ratchet step mixes fresh agreement
//!   output into the root key
//! - Transactional decrypt: state changes are committed only when the message
//!   authenticates, so a forged message cannot desynchronize the session

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    aead::{self, AeadKey, KEY_SIZE, NONCE_SIZE},
    curve::{CurveId, DhKeyPair, SECRET_LEN},
    error::CryptoError,
    kdf::{CHAIN_KEY_LEN, SHARED_AD_LEN, kdf_chain, kdf_root},
    x3dh::X3dhSecrets,
};

/// Default bound on message keys derived ahead for a single gap.
pub const MAX_MESSAGE_SKIP: u16 = 512;

/// Default number of messages a sending chain may carry.
pub const MAX_SENDING_CHAIN: u16 = 500;

/// Bounds applied to a ratchet. Callers map their configuration onto this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Maximum message keys derived ahead on a receiving chain.
    pub max_skip: u16,
    /// Maximum messages sent on one sending chain.
    pub max_sending_chain: u16,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self { max_skip: MAX_MESSAGE_SKIP, max_sending_chain: MAX_SENDING_CHAIN }
    }
}

/// Per-message ratchet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Index of the message in the current sending chain.
    pub ns: u16,
    /// Length of the sender's previous sending chain.
    pub pn: u16,
    /// Sender's current ratchet public key.
    pub dh_public: Vec<u8>,
}

impl RatchetHeader {
    /// Bytes authenticated as part of the associated data.
    ///
    /// `dh_public || ns || pn`, counters big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.dh_public.len() + 4);
        bytes.extend_from_slice(&self.dh_public);
        bytes.extend_from_slice(&self.ns.to_be_bytes());
        bytes.extend_from_slice(&self.pn.to_be_bytes());
        bytes
    }
}

/// Message key held for a message that has not arrived yet.
#[derive(Clone, Serialize, Deserialize)]
struct StoredKey {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

/// Skipped keys of one receiving chain, identified by the peer ratchet key.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedChain {
    peer_dh: Vec<u8>,
    keys: BTreeMap<u16, StoredKey>,
    received_since: u16,
}

/// Double Ratchet state of one session.
///
/// Serializable so the session store can persist it between calls.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    curve: CurveId,
    root_key: [u8; CHAIN_KEY_LEN],
    sending_chain: Option<[u8; CHAIN_KEY_LEN]>,
    receiving_chain: Option<[u8; CHAIN_KEY_LEN]>,
    self_dh: DhKeyPair,
    peer_dh: Option<Vec<u8>>,
    ns: u16,
    nr: u16,
    pn: u16,
    skipped: Vec<SkippedChain>,
    shared_ad: [u8; SHARED_AD_LEN],
}

impl RatchetState {
    /// Session of the party that fetched the peer bundle.
    ///
    /// Performs the first DH ratchet step against the peer signed prekey so
    /// the initiator can send immediately.
    pub fn initiator(
        secrets: &X3dhSecrets,
        peer_signed_prekey: &[u8],
        self_dh: DhKeyPair,
    ) -> Result<Self, CryptoError> {
        let dh = self_dh.agree(peer_signed_prekey)?;
        let (root_key, sending) = kdf_root(secrets.root_key(), dh.as_bytes());

        Ok(Self {
            curve: self_dh.curve(),
            root_key,
            sending_chain: Some(sending),
            receiving_chain: None,
            self_dh,
            peer_dh: Some(peer_signed_prekey.to_vec()),
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: Vec::new(),
            shared_ad: *secrets.shared_ad(),
        })
    }

    /// Session of the party that received the first message.
    ///
    /// Has no sending chain until the first message is decrypted.
    pub fn responder(secrets: &X3dhSecrets, signed_prekey: DhKeyPair) -> Self {
        Self {
            curve: signed_prekey.curve(),
            root_key: *secrets.root_key(),
            sending_chain: None,
            receiving_chain: None,
            self_dh: signed_prekey,
            peer_dh: None,
            ns: 0,
            nr: 0,
            pn: 0,
            skipped: Vec::new(),
            shared_ad: *secrets.shared_ad(),
        }
    }

    /// Curve the session runs on.
    pub fn curve(&self) -> CurveId {
        self.curve
    }

    /// Messages sent on the current sending chain.
    pub fn sent_on_chain(&self) -> u16 {
        self.ns
    }

    /// Whether the session can still produce a message.
    pub fn can_send(&self, limits: RatchetLimits) -> bool {
        self.sending_chain.is_some() && self.ns < limits.max_sending_chain
    }

    /// Number of message keys held for messages not yet received.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.iter().map(|chain| chain.keys.len()).sum()
    }

    /// Encrypt one message on the sending chain.
    ///
    /// The associated data actually authenticated is
    /// `associated_data || shared_ad || header`.
    ///
    /// # Errors
    ///
    /// - `NoSendingChain`: responder that has not received anything yet
    /// - `SendingChainExhausted`: the chain reached `max_sending_chain`
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
        limits: RatchetLimits,
    ) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let Some(chain_key) = self.sending_chain.as_mut() else {
            return Err(CryptoError::NoSendingChain);
        };
        if self.ns >= limits.max_sending_chain {
            return Err(CryptoError::SendingChainExhausted { sent: self.ns });
        }

        let (message_key, next_chain) = kdf_chain(chain_key);
        chain_key.zeroize();
        *chain_key = next_chain;

        let header = RatchetHeader {
            ns: self.ns,
            pn: self.pn,
            dh_public: self.self_dh.public_key().to_vec(),
        };
        self.ns = self.ns.wrapping_add(1);

        let ad = self.full_associated_data(associated_data, &header);
        Ok((header, aead::seal(&message_key, &ad, plaintext)))
    }

    /// Decrypt one message.
    ///
    /// `next_dh_seed` provides the secret for our next ratchet key in case
    /// the message starts a new peer chain; it is ignored otherwise.
    ///
    /// On any error the state is left exactly as it was.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        associated_data: &[u8],
        next_dh_seed: [u8; SECRET_LEN],
        limits: RatchetLimits,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut working = self.clone();
        let plaintext =
            working.decrypt_uncommitted(header, ciphertext, associated_data, next_dh_seed, limits)?;
        *self = working;
        Ok(plaintext)
    }

    /// Drop skipped keys of chains that saw more than `limit` messages since
    /// they were stored.
    ///
    /// Returns the number of keys removed.
    pub fn prune_skipped_keys(&mut self, limit: u16) -> usize {
        let before = self.skipped_key_count();
        self.skipped.retain(|chain| chain.received_since <= limit && !chain.keys.is_empty());
        before - self.skipped_key_count()
    }

    fn decrypt_uncommitted(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        associated_data: &[u8],
        next_dh_seed: [u8; SECRET_LEN],
        limits: RatchetLimits,
    ) -> Result<Vec<u8>, CryptoError> {
        let ad = self.full_associated_data(associated_data, header);

        if let Some(message_key) = self.take_skipped_key(&header.dh_public, header.ns) {
            let plaintext = aead::open(&message_key, &ad, ciphertext)?;
            self.mark_received();
            return Ok(plaintext);
        }

        let same_chain = self.peer_dh.as_deref() == Some(header.dh_public.as_slice());
        if same_chain {
            if header.ns < self.nr {
                return Err(CryptoError::MessageKeyConsumed {
                    current: self.nr,
                    requested: header.ns,
                });
            }
        } else {
            self.skip_message_keys(header.pn, limits)?;
            self.dh_ratchet(&header.dh_public, next_dh_seed)?;
        }

        self.skip_message_keys(header.ns, limits)?;

        // Only a header replaying our own initial key gets here without a chain
        let Some(chain_key) = self.receiving_chain.as_mut() else {
            return Err(CryptoError::DecryptionFailed {
                reason: "no receiving chain for this ratchet key".to_string(),
            });
        };
        let (message_key, next_chain) = kdf_chain(chain_key);
        chain_key.zeroize();
        *chain_key = next_chain;
        self.nr = self.nr.wrapping_add(1);

        let plaintext = aead::open(&message_key, &ad, ciphertext)?;
        self.mark_received();
        Ok(plaintext)
    }

    fn dh_ratchet(
        &mut self,
        peer_dh: &[u8],
        next_dh_seed: [u8; SECRET_LEN],
    ) -> Result<(), CryptoError> {
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.peer_dh = Some(peer_dh.to_vec());

        let receiving_dh = self.self_dh.agree(peer_dh)?;
        let (root_key, receiving) = kdf_root(&self.root_key, receiving_dh.as_bytes());

        self.self_dh = DhKeyPair::from_seed(self.curve, next_dh_seed)?;
        let sending_dh = self.self_dh.agree(peer_dh)?;
        let (root_key, sending) = kdf_root(&root_key, sending_dh.as_bytes());

        self.root_key.zeroize();
        self.root_key = root_key;
        self.receiving_chain = Some(receiving);
        self.sending_chain = Some(sending);
        Ok(())
    }

    /// Derive and store keys on the receiving chain up to (excluding) `until`.
    fn skip_message_keys(&mut self, until: u16, limits: RatchetLimits) -> Result<(), CryptoError> {
        let (Some(chain_key), Some(peer_dh)) = (self.receiving_chain.as_mut(), &self.peer_dh)
        else {
            return Ok(());
        };
        if until <= self.nr {
            return Ok(());
        }
        if until - self.nr > limits.max_skip {
            return Err(CryptoError::TooManySkipped {
                current: self.nr,
                requested: until,
                limit: limits.max_skip,
            });
        }

        let position = match self.skipped.iter().position(|chain| &chain.peer_dh == peer_dh) {
            Some(position) => position,
            None => {
                self.skipped.push(SkippedChain {
                    peer_dh: peer_dh.clone(),
                    keys: BTreeMap::new(),
                    received_since: 0,
                });
                self.skipped.len() - 1
            },
        };

        while self.nr < until {
            let (message_key, next_chain) = kdf_chain(chain_key);
            chain_key.zeroize();
            *chain_key = next_chain;

            let stored = StoredKey { key: *message_key.key(), nonce: *message_key.nonce() };
            self.skipped[position].keys.insert(self.nr, stored);
            self.nr += 1;
        }
        Ok(())
    }

    fn take_skipped_key(&mut self, peer_dh: &[u8], index: u16) -> Option<AeadKey> {
        let chain = self.skipped.iter_mut().find(|chain| chain.peer_dh == peer_dh)?;
        let stored = chain.keys.remove(&index)?;
        Some(AeadKey::new(stored.key, stored.nonce))
    }

    fn mark_received(&mut self) {
        for chain in &mut self.skipped {
            chain.received_since = chain.received_since.saturating_add(1);
        }
        self.skipped.retain(|chain| !chain.keys.is_empty());
    }

    fn full_associated_data(&self, associated_data: &[u8], header: &RatchetHeader) -> Vec<u8> {
        let header_bytes = header.to_bytes();
        let mut ad =
            Vec::with_capacity(associated_data.len() + SHARED_AD_LEN + header_bytes.len());
        ad.extend_from_slice(associated_data);
        ad.extend_from_slice(&self.shared_ad);
        ad.extend_from_slice(&header_bytes);
        ad
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("curve", &self.curve)
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .field("skipped_keys", &self.skipped_key_count())
            .finish_non_exhaustive()
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(chain) = self.sending_chain.as_mut() {
            chain.zeroize();
        }
        if let Some(chain) = self.receiving_chain.as_mut() {
            chain.zeroize();
        }
        self.shared_ad.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        curve::IdentityKeyPair,
        x3dh::{self, PeerPrekeys},
    };

    fn seed(fill: u8) -> [u8; SECRET_LEN] {
        let mut seed = [fill; SECRET_LEN];
        seed[0] = 0x01;
        seed
    }

    /// Alice initiates towards Bob. Returns (alice, bob) sessions.
    fn session_pair(curve: CurveId) -> (RatchetState, RatchetState) {
        let alice_ik = IdentityKeyPair::from_seed(curve, seed(0x11)).unwrap();
        let bob_ik = IdentityKeyPair::from_seed(curve, seed(0x22)).unwrap();
        let bob_spk = DhKeyPair::from_seed(curve, seed(0x23)).unwrap();
        let signature = bob_ik.sign(bob_spk.public_key()).unwrap();
        let ek = DhKeyPair::from_seed(curve, seed(0x33)).unwrap();

        let alice_secrets = x3dh::initiate(&alice_ik, "alice", &ek, "bob", PeerPrekeys {
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
            ek.public_key(),
        )
        .unwrap();

        let alice_dh = DhKeyPair::from_seed(curve, seed(0x44)).unwrap();
        let alice =
            RatchetState::initiator(&alice_secrets, bob_spk.public_key(), alice_dh).unwrap();
        let bob = RatchetState::responder(&bob_secrets, bob_spk);
        (alice, bob)
    }

    fn limits() -> RatchetLimits {
        RatchetLimits::default()
    }

    #[test]
    fn first_message_roundtrip() {
        for curve in CurveId::ALL {
            let (mut alice, mut bob) = session_pair(curve);

            let (header, ct) = alice.encrypt(b"hello", b"ad", limits()).unwrap();
            assert_eq!(header.ns, 0);
            assert_eq!(header.pn, 0);

            let pt = bob.decrypt(&header, &ct, b"ad", seed(0x55), limits()).unwrap();
            assert_eq!(pt, b"hello");
        }
    }

    #[test]
    fn conversation_ping_pong() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);

        for round in 0u8..5 {
            let (header, ct) = alice.encrypt(&[round], b"", limits()).unwrap();
            let pt = bob.decrypt(&header, &ct, b"", seed(0x60 + round), limits()).unwrap();
            assert_eq!(pt, [round]);

            let (header, ct) = bob.encrypt(&[round, round], b"", limits()).unwrap();
            let pt = alice.decrypt(&header, &ct, b"", seed(0x70 + round), limits()).unwrap();
            assert_eq!(pt, [round, round]);
        }
    }

    #[test]
    fn responder_cannot_send_before_receiving() {
        let (_, mut bob) = session_pair(CurveId::Curve25519);
        let result = bob.encrypt(b"too early", b"", limits());
        assert!(matches!(result, Err(CryptoError::NoSendingChain)));
    }

    #[test]
    fn out_of_order_messages_decrypt() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);

        let first = alice.encrypt(b"one", b"", limits()).unwrap();
        let second = alice.encrypt(b"two", b"", limits()).unwrap();
        let third = alice.encrypt(b"three", b"", limits()).unwrap();

        assert_eq!(bob.decrypt(&third.0, &third.1, b"", seed(1), limits()).unwrap(), b"three");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&first.0, &first.1, b"", seed(2), limits()).unwrap(), b"one");
        assert_eq!(bob.decrypt(&second.0, &second.1, b"", seed(3), limits()).unwrap(), b"two");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn messages_from_previous_chain_decrypt_after_ratchet() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);

        let (h, ct) = alice.encrypt(b"start", b"", limits()).unwrap();
        bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap();

        let delayed = alice.encrypt(b"delayed", b"", limits()).unwrap();

        let (h, ct) = bob.encrypt(b"reply", b"", limits()).unwrap();
        alice.decrypt(&h, &ct, b"", seed(2), limits()).unwrap();

        let (h, ct) = alice.encrypt(b"new chain", b"", limits()).unwrap();
        assert_eq!(h.pn, 2);
        assert_eq!(bob.decrypt(&h, &ct, b"", seed(3), limits()).unwrap(), b"new chain");
        assert_eq!(
            bob.decrypt(&delayed.0, &delayed.1, b"", seed(4), limits()).unwrap(),
            b"delayed"
        );
    }

    #[test]
    fn replay_is_rejected() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);
        let (h, ct) = alice.encrypt(b"once", b"", limits()).unwrap();

        bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap();
        let result = bob.decrypt(&h, &ct, b"", seed(1), limits());
        assert!(matches!(result, Err(CryptoError::MessageKeyConsumed { .. })));
    }

    #[test]
    fn failed_decrypt_leaves_state_untouched() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);
        let (h, mut ct) = alice.encrypt(b"payload", b"", limits()).unwrap();
        ct[0] ^= 0xFF;

        let result = bob.decrypt(&h, &ct, b"", seed(1), limits());
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));

        ct[0] ^= 0xFF;
        assert_eq!(bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap(), b"payload");
    }

    #[test]
    fn wrong_associated_data_fails() {
        let (mut alice, mut bob) = session_pair(CurveId::P256);
        let (h, ct) = alice.encrypt(b"payload", b"alice->bob", limits()).unwrap();

        let result = bob.decrypt(&h, &ct, b"alice->eve", seed(1), limits());
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn skip_beyond_limit_is_rejected() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);
        let tight = RatchetLimits { max_skip: 3, ..limits() };

        for _ in 0..4 {
            alice.encrypt(b"lost", b"", limits()).unwrap();
        }
        let (h, ct) = alice.encrypt(b"arrives", b"", limits()).unwrap();

        let result = bob.decrypt(&h, &ct, b"", seed(1), tight);
        assert!(matches!(result, Err(CryptoError::TooManySkipped { limit: 3, .. })));
    }

    #[test]
    fn sending_chain_exhausts() {
        let (mut alice, _) = session_pair(CurveId::Curve25519);
        let tight = RatchetLimits { max_sending_chain: 2, ..limits() };

        alice.encrypt(b"1", b"", tight).unwrap();
        assert!(alice.can_send(tight));
        alice.encrypt(b"2", b"", tight).unwrap();
        assert!(!alice.can_send(tight));

        let result = alice.encrypt(b"3", b"", tight);
        assert!(matches!(result, Err(CryptoError::SendingChainExhausted { sent: 2 })));
    }

    #[test]
    fn prune_drops_old_skipped_chains() {
        let (mut alice, mut bob) = session_pair(CurveId::Curve25519);

        let _lost = alice.encrypt(b"lost", b"", limits()).unwrap();
        let (h, ct) = alice.encrypt(b"received", b"", limits()).unwrap();
        bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap();
        assert_eq!(bob.skipped_key_count(), 1);

        for _ in 0..3 {
            let (h, ct) = alice.encrypt(b"more", b"", limits()).unwrap();
            bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap();
        }

        assert_eq!(bob.prune_skipped_keys(8), 0);
        assert_eq!(bob.prune_skipped_keys(2), 1);
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn state_survives_serialization() {
        let (mut alice, mut bob) = session_pair(CurveId::P256);
        let (h, ct) = alice.encrypt(b"persisted", b"", limits()).unwrap();

        let mut bytes = Vec::new();
        ciborium::into_writer(&bob, &mut bytes).unwrap();
        let mut restored: RatchetState = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(restored.decrypt(&h, &ct, b"", seed(1), limits()).unwrap(), b"persisted");
        assert_eq!(bob.decrypt(&h, &ct, b"", seed(1), limits()).unwrap(), b"persisted");
    }
}
