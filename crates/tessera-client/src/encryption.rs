//! Multi-recipient encryption.
//!
//! An encryption first makes sure every recipient has an active session.
//! Recipients without one are fetched from the key server; the request then
//! waits in its user's queue until no recipient it names is still being
//! fetched. Requests leave the queue strictly from the front, so a request
//! whose bundles arrived early still completes after the ones submitted
//! before it.
//!
//! # Payload modes
//!
//! ```text
//! Direct:  envelope_i = ratchet_i(plaintext, ad = associated_id || src || dst_i)
//! Shared:  shared     = aead(seed_key(seed), ad = src || associated_id, plaintext)
//!          envelope_i = ratchet_i(seed, ad = tag(shared) || src || dst_i)
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use tessera_core::{
    EncryptionPolicy, Environment, LocalUserRecord, PeerDeviceStatus, PendingKeyExchange,
    SessionRecord, Storage, prekeys, select_mode,
};
use tessera_crypto::{PeerPrekeys, RatchetState, aead, kdf, x3dh};
use tessera_proto::{Envelope, KeyBundle, KeyExchange, KeyServerResponse, PayloadMode};

use crate::{
    error::ManagerError,
    event::{Completion, EncryptOutput, ManagerAction, RecipientOutput, RecipientStatus, RequestId},
    manager::{Manager, completed},
};

/// An encryption waiting in its user's queue.
pub(crate) struct PendingEncrypt {
    /// Completion id.
    pub(crate) request: RequestId,
    associated_id: Vec<u8>,
    /// Distinct recipients in call order.
    recipients: Vec<String>,
    plaintext: Vec<u8>,
    policy: EncryptionPolicy,
    /// Recipients whose bundle could not be turned into a session.
    failed: HashSet<String>,
    /// Trust status of recipients first met through a fetched bundle, as it
    /// was before the bundle was processed.
    first_contact: HashMap<String, PeerDeviceStatus>,
    /// Failure of a key-server round trip this request waited on.
    server_error: Option<ManagerError>,
}

impl PendingEncrypt {
    fn names(&self, peer: &str) -> bool {
        self.recipients.iter().any(|recipient| recipient == peer)
    }
}

/// Associated data of a directly encrypted message.
pub(crate) fn direct_ad(associated_id: &[u8], source: &str, recipient: &str) -> Vec<u8> {
    [associated_id, source.as_bytes(), recipient.as_bytes()].concat()
}

/// Associated data of the shared ciphertext.
pub(crate) fn shared_ad(source: &str, associated_id: &[u8]) -> Vec<u8> {
    [source.as_bytes(), associated_id].concat()
}

/// Associated data of an encrypted seed, bound to the shared ciphertext
/// through its tag.
pub(crate) fn seed_ad(shared_tag: &[u8], source: &str, recipient: &str) -> Vec<u8> {
    [shared_tag, source.as_bytes(), recipient.as_bytes()].concat()
}

impl<E: Environment, S: Storage> Manager<E, S> {
    pub(crate) fn handle_encrypt(
        &mut self,
        request: RequestId,
        local: &str,
        associated_id: Vec<u8>,
        recipients: Vec<String>,
        plaintext: Vec<u8>,
        policy: EncryptionPolicy,
    ) -> Result<Vec<ManagerAction>, ManagerError> {
        let user = self.user(local)?;
        let now = self.env.wall_clock_secs();

        let mut distinct: Vec<String> = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if !distinct.contains(&recipient) {
                distinct.push(recipient);
            }
        }

        let mut missing = Vec::new();
        for peer in &distinct {
            if !self.key_exchange.is_fetching(local, peer)
                && !self.has_usable_session(local, peer, now)?
            {
                missing.push(peer.clone());
            }
        }

        let mut actions = Vec::new();
        if let Some(post) =
            self.key_exchange.fetch_bundles(local, user.curve(), &user.key_server_url, &missing)?
        {
            tracing::debug!(local, peers = ?missing, "fetching key bundles");
            actions.push(post);
        }

        self.queues.entry(local.to_string()).or_default().push_back(PendingEncrypt {
            request,
            associated_id,
            recipients: distinct,
            plaintext,
            policy,
            failed: HashSet::new(),
            first_contact: HashMap::new(),
            server_error: None,
        });

        actions.extend(self.drain_queue(local));
        Ok(actions)
    }

    /// Whether the pair has an active session that can still send. An
    /// exhausted one is staled on the way.
    fn has_usable_session(&self, local: &str, peer: &str, now: u64) -> Result<bool, ManagerError> {
        match self.sessions.active(local, peer)? {
            Some(session) if session.ratchet.can_send(self.config.ratchet_limits()) => Ok(true),
            Some(_) => {
                self.sessions.stale(local, peer, now)?;
                Ok(false)
            },
            None => Ok(false),
        }
    }

    /// Process the answer to a bundle fetch, then complete whatever became
    /// ready at the front of the queue.
    pub(crate) fn bundles_fetched(
        &mut self,
        local: &str,
        peers: &[String],
        response: Result<KeyServerResponse, ManagerError>,
    ) -> Vec<ManagerAction> {
        let bundles = match response {
            Ok(KeyServerResponse::PeerBundles(bundles)) => bundles,
            Ok(other) => {
                let err = ManagerError::key_server(format!(
                    "expected peer bundles, got {:?}",
                    other.message_type()
                ));
                self.fail_waiting(local, peers, &err);
                return self.drain_queue(local);
            },
            Err(err) => {
                self.fail_waiting(local, peers, &err);
                return self.drain_queue(local);
            },
        };

        let user = match self.user(local) {
            Ok(user) => user,
            Err(err) => {
                tracing::debug!(local, %err, "bundles arrived for a deleted user");
                return Vec::new();
            },
        };

        for peer in peers {
            let bundle = bundles.iter().find(|entry| &entry.device_id == peer);
            let outcome = match bundle.and_then(|entry| entry.bundle.as_ref()) {
                Some(bundle) => self.open_session(&user, peer, bundle),
                None => Err(ManagerError::key_server("no key material available")),
            };

            let waiting =
                self.queues.get_mut(local).into_iter().flatten().filter(|p| p.names(peer));
            match outcome {
                Ok(previous) => {
                    for pending in waiting {
                        pending.first_contact.insert(peer.clone(), previous);
                    }
                },
                Err(err) => {
                    tracing::warn!(local, peer = %peer, %err, "peer bundle unusable");
                    for pending in waiting {
                        pending.failed.insert(peer.clone());
                    }
                },
            }
        }

        self.drain_queue(local)
    }

    fn fail_waiting(&mut self, local: &str, peers: &[String], err: &ManagerError) {
        for pending in self.queues.get_mut(local).into_iter().flatten() {
            if peers.iter().any(|peer| pending.names(peer)) {
                pending.server_error.get_or_insert_with(|| err.clone());
            }
        }
    }

    /// Initiator side of a key exchange: turn a fetched bundle into the
    /// active session of the pair.
    ///
    /// Returns the peer's trust status before the contact was recorded.
    fn open_session(
        &self,
        user: &LocalUserRecord,
        peer: &str,
        bundle: &KeyBundle,
    ) -> Result<PeerDeviceStatus, ManagerError> {
        let local = user.device_id.as_str();
        let curve = user.curve();
        self.trust.check_identity(local, peer, &bundle.identity_key)?;

        let ephemeral = prekeys::generate_dh_keypair(&self.env, curve)?;
        let secrets = x3dh::initiate(
            &user.identity,
            local,
            &ephemeral,
            peer,
            PeerPrekeys {
                identity_key: &bundle.identity_key,
                signed_prekey: &bundle.signed_prekey.public_key,
                signed_prekey_signature: &bundle.signed_prekey.signature,
                one_time_prekey: bundle
                    .one_time_prekey
                    .as_ref()
                    .map(|opk| opk.public_key.as_slice()),
            },
        )?;
        let ratchet = RatchetState::initiator(
            &secrets,
            &bundle.signed_prekey.public_key,
            prekeys::generate_dh_keypair(&self.env, curve)?,
        )?;

        let previous = self.trust.record_contact(local, peer, &bundle.identity_key)?;
        let now = self.env.wall_clock_secs();
        let session = SessionRecord {
            id: self.env.random_u64(),
            local_device_id: local.to_string(),
            peer_device_id: peer.to_string(),
            ratchet,
            active: true,
            created_at: now,
            staled_at: None,
            pending_key_exchange: Some(PendingKeyExchange {
                ephemeral_key: ephemeral.public_key().to_vec(),
                signed_prekey_id: bundle.signed_prekey.id,
                one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|opk| opk.id),
            }),
        };
        self.sessions.activate(&session, now)?;

        tracing::debug!(
            local,
            peer,
            one_time_prekey = bundle.one_time_prekey.is_some(),
            "initiator session created"
        );
        Ok(previous)
    }

    /// Complete queued requests from the front while they are not waiting
    /// on any fetch.
    pub(crate) fn drain_queue(&mut self, local: &str) -> Vec<ManagerAction> {
        let mut actions = Vec::new();

        loop {
            let Some(front) = self.queues.get(local).and_then(VecDeque::front) else {
                self.queues.remove(local);
                break;
            };
            let live: Vec<String> = if front.server_error.is_some() {
                Vec::new()
            } else {
                let failed = &front.failed;
                front.recipients.iter().filter(|peer| !failed.contains(*peer)).cloned().collect()
            };
            if live.iter().any(|peer| self.key_exchange.is_fetching(local, peer)) {
                break;
            }

            match self.refetch_lost_sessions(local, &live) {
                Ok(Some(post)) => {
                    actions.push(post);
                    break;
                },
                Ok(None) => {},
                Err(err) => {
                    if let Some(front) = self.queues.get_mut(local).and_then(VecDeque::front_mut) {
                        front.server_error.get_or_insert(err);
                    }
                },
            }

            let Some(pending) = self.queues.get_mut(local).and_then(VecDeque::pop_front) else {
                break;
            };
            let request = pending.request;
            let result = self.encrypt_now(local, pending);
            if let Err(err) = &result {
                tracing::warn!(local, request, %err, "encryption failed");
            }
            actions.push(completed(request, Completion::Encrypt(result)));
        }

        actions
    }

    /// Fetch bundles again for recipients whose session was staled or
    /// deleted while the request waited in the queue.
    fn refetch_lost_sessions(
        &mut self,
        local: &str,
        recipients: &[String],
    ) -> Result<Option<ManagerAction>, ManagerError> {
        let now = self.env.wall_clock_secs();
        let mut lost = Vec::new();
        for peer in recipients {
            if !self.has_usable_session(local, peer, now)? {
                lost.push(peer.clone());
            }
        }
        if lost.is_empty() {
            return Ok(None);
        }

        let user = self.user(local)?;
        tracing::debug!(local, peers = ?lost, "sessions lost while queued, fetching again");
        self.key_exchange.fetch_bundles(local, user.curve(), &user.key_server_url, &lost)
    }

    fn encrypt_now(
        &self,
        local: &str,
        pending: PendingEncrypt,
    ) -> Result<EncryptOutput, ManagerError> {
        if let Some(err) = pending.server_error {
            return Err(err);
        }

        let user = self.user(local)?;
        let limits = self.config.ratchet_limits();

        let mut ready = Vec::with_capacity(pending.recipients.len());
        for peer in &pending.recipients {
            if pending.failed.contains(peer) {
                continue;
            }
            match self.sessions.active(local, peer)? {
                Some(session) if session.ratchet.can_send(limits) => ready.push(session),
                _ => tracing::warn!(local, peer = %peer, "no usable session"),
            }
        }

        let mode = select_mode(pending.policy, pending.plaintext.len(), ready.len());
        let (payload, shared_ciphertext) = match mode {
            PayloadMode::Direct => (pending.plaintext, None),
            PayloadMode::Shared => {
                let seed = self.env.random_seed();
                let shared = aead::seal(
                    &kdf::seed_key(&seed),
                    &shared_ad(local, &pending.associated_id),
                    &pending.plaintext,
                );
                (seed.to_vec(), Some(shared))
            },
        };

        let mut sealed: HashMap<String, (RecipientStatus, Vec<u8>)> = HashMap::new();
        for mut session in ready {
            let peer = session.peer_device_id.clone();
            let ad = match shared_ciphertext.as_deref().and_then(aead::tag_of) {
                Some(tag) => seed_ad(tag, local, &peer),
                None => direct_ad(&pending.associated_id, local, &peer),
            };

            match self.seal_for(&user, &mut session, &payload, &ad, mode) {
                Ok(envelope) => {
                    let status = match pending.first_contact.get(&peer) {
                        Some(previous) => *previous,
                        None => self.trust.status(local, &peer)?,
                    };
                    sealed.insert(peer, (status.into(), envelope));
                },
                Err(err) => {
                    tracing::warn!(local, peer = %peer, %err, "cannot encrypt to recipient");
                },
            }
        }

        if !pending.recipients.is_empty() && sealed.is_empty() {
            return Err(ManagerError::NoRecipientsEncrypted { failed: pending.recipients });
        }

        let recipients = pending
            .recipients
            .into_iter()
            .map(|device_id| match sealed.remove(&device_id) {
                Some((status, envelope)) => RecipientOutput { device_id, status, envelope },
                None => RecipientOutput {
                    device_id,
                    status: RecipientStatus::Fail,
                    envelope: Vec::new(),
                },
            })
            .collect();

        tracing::debug!(local, ?mode, "message encrypted");
        Ok(EncryptOutput { recipients, shared_ciphertext })
    }

    /// Ratchet-encrypt `payload` for one recipient and persist the session.
    fn seal_for(
        &self,
        user: &LocalUserRecord,
        session: &mut SessionRecord,
        payload: &[u8],
        associated_data: &[u8],
        mode: PayloadMode,
    ) -> Result<Vec<u8>, ManagerError> {
        let limits = self.config.ratchet_limits();
        let (header, ciphertext) = session.ratchet.encrypt(payload, associated_data, limits)?;

        let key_exchange = session.pending_key_exchange.take().map(|pending| KeyExchange {
            identity_key: user.identity.public_key().to_vec(),
            ephemeral_key: pending.ephemeral_key,
            signed_prekey_id: pending.signed_prekey_id,
            one_time_prekey_id: pending.one_time_prekey_id,
        });
        let envelope =
            Envelope { curve: user.curve(), key_exchange, header, mode, payload: ciphertext };

        self.sessions.save(session)?;
        if !session.ratchet.can_send(limits) {
            let now = self.env.wall_clock_secs();
            self.sessions.stale(&session.local_device_id, &session.peer_device_id, now)?;
        }

        Ok(envelope.to_bytes())
    }
}
