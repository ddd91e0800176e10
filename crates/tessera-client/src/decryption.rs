//! Decryption.
//!
//! Sessions of the sender are tried in order: the active one, then stale
//! ones most recently staled first. A message carrying key-exchange material
//! that no existing session opens starts a new responder session. Nothing is
//! persisted unless the message authenticates, shared ciphertext included.

use tessera_core::{CoreError, Environment, LocalUserRecord, SessionRecord, Storage, prekeys};
use tessera_crypto::{RatchetState, aead, kdf, x3dh};
use tessera_proto::{Envelope, KeyExchange, PayloadMode, ProtocolError, SEED_SIZE};

use crate::{
    encryption::{direct_ad, seed_ad, shared_ad},
    error::ManagerError,
    event::DecryptOutput,
    manager::Manager,
};

impl<E: Environment, S: Storage> Manager<E, S> {
    /// Decrypt a message `sender` encrypted for `local`.
    ///
    /// `shared_ciphertext` is required when the sender used the shared
    /// mode. The returned status is the sender's trust status as it was
    /// before this message; a first message from an unknown device reports
    /// `Unknown` and leaves the device Untrusted.
    ///
    /// # Errors
    ///
    /// - `UserNotFound`: `local` does not exist
    /// - `MalformedEnvelope`: the envelope does not decode or is for another
    ///   curve
    /// - `IdentityKeyConflict`: the key exchange proves a different identity
    ///   key than the one stored for `sender`
    /// - `AuthenticationFailure`: no session opens the message and none can
    ///   be built from it
    pub fn decrypt(
        &self,
        local: &str,
        associated_id: &[u8],
        sender: &str,
        envelope: &[u8],
        shared_ciphertext: Option<&[u8]>,
    ) -> Result<DecryptOutput, ManagerError> {
        let result = self.try_decrypt(local, associated_id, sender, envelope, shared_ciphertext);
        if let Err(err) = &result {
            tracing::warn!(local, sender, %err, "decryption failed");
        }
        result
    }

    fn try_decrypt(
        &self,
        local: &str,
        associated_id: &[u8],
        sender: &str,
        envelope: &[u8],
        shared_ciphertext: Option<&[u8]>,
    ) -> Result<DecryptOutput, ManagerError> {
        let user = self.user(local)?;
        let envelope = Envelope::decode(envelope)?;
        if envelope.curve != user.curve() {
            return Err(ProtocolError::CurveMismatch {
                expected: user.curve().wire_id(),
                actual: envelope.curve.wire_id(),
            }
            .into());
        }

        let ratchet_ad = match envelope.mode {
            PayloadMode::Direct => direct_ad(associated_id, sender, local),
            PayloadMode::Shared => {
                let shared = shared_ciphertext.ok_or(ManagerError::MissingSharedCiphertext)?;
                let tag = aead::tag_of(shared).ok_or_else(|| {
                    ManagerError::authentication("shared ciphertext shorter than a tag")
                })?;
                seed_ad(tag, sender, local)
            },
        };
        let opened = Opened { envelope: &envelope, associated_id, sender, shared_ciphertext };

        if let Some(key_exchange) = &envelope.key_exchange {
            self.trust.check_identity(local, sender, &key_exchange.identity_key)?;
        }

        let now = self.env.wall_clock_secs();
        let limits = self.config.ratchet_limits();
        let mut last_error = None;

        for mut session in self.sessions.decrypt_candidates(local, sender)? {
            let payload = match session.ratchet.decrypt(
                &envelope.header,
                &envelope.payload,
                &ratchet_ad,
                self.env.random_seed(),
                limits,
            ) {
                Ok(payload) => payload,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                },
            };
            let plaintext = opened.plaintext(payload)?;

            let status = match &envelope.key_exchange {
                Some(key_exchange) => {
                    self.trust.record_contact(local, sender, &key_exchange.identity_key)?
                },
                None => self.trust.status(local, sender)?,
            };
            if session.active {
                self.sessions.save(&session)?;
            } else {
                self.sessions.activate(&session, now)?;
                tracing::debug!(local, sender, id = session.id, "stale session reactivated");
            }
            return Ok(DecryptOutput { plaintext, status });
        }

        let Some(key_exchange) = &envelope.key_exchange else {
            return Err(ManagerError::authentication(last_error.map_or_else(
                || "no session with sender".to_string(),
                |err| err.to_string(),
            )));
        };
        self.respond(user, &opened, &ratchet_ad, key_exchange, now)
    }

    /// Responder side of a key exchange: build a session from the first
    /// message of `sender` and decrypt it.
    fn respond(
        &self,
        mut user: LocalUserRecord,
        opened: &Opened<'_>,
        ratchet_ad: &[u8],
        key_exchange: &KeyExchange,
        now: u64,
    ) -> Result<DecryptOutput, ManagerError> {
        let local = user.device_id.clone();
        let sender = opened.sender;
        let to_auth = |err: CoreError| ManagerError::authentication(err.to_string());

        let signed_prekey = prekeys::find_signed_prekey(&user, key_exchange.signed_prekey_id)
            .map_err(to_auth)?
            .keypair
            .clone();
        let one_time_prekey = key_exchange
            .one_time_prekey_id
            .map(|id| prekeys::take_one_time_prekey(&mut user, id))
            .transpose()
            .map_err(to_auth)?;

        let secrets = x3dh::respond(
            &user.identity,
            &local,
            &signed_prekey,
            one_time_prekey.as_ref().map(|opk| &opk.keypair),
            sender,
            &key_exchange.identity_key,
            &key_exchange.ephemeral_key,
        )?;
        let mut ratchet = RatchetState::responder(&secrets, signed_prekey);

        let payload = ratchet
            .decrypt(
                &opened.envelope.header,
                &opened.envelope.payload,
                ratchet_ad,
                self.env.random_seed(),
                self.config.ratchet_limits(),
            )
            .map_err(|err| ManagerError::authentication(err.to_string()))?;
        let plaintext = opened.plaintext(payload)?;

        let status = self.trust.record_contact(&local, sender, &key_exchange.identity_key)?;
        if one_time_prekey.is_some() {
            self.storage.update_local_user(&user)?;
        }
        let session = SessionRecord {
            id: self.env.random_u64(),
            local_device_id: local.clone(),
            peer_device_id: sender.to_string(),
            ratchet,
            active: true,
            created_at: now,
            staled_at: None,
            pending_key_exchange: None,
        };
        self.sessions.activate(&session, now)?;

        tracing::debug!(
            local = %local,
            sender,
            one_time_prekey = one_time_prekey.is_some(),
            "responder session created"
        );
        Ok(DecryptOutput { plaintext, status })
    }
}

/// What the ratchet payload needs to become the plaintext.
struct Opened<'a> {
    envelope: &'a Envelope,
    associated_id: &'a [u8],
    sender: &'a str,
    shared_ciphertext: Option<&'a [u8]>,
}

impl Opened<'_> {
    /// The plaintext itself in direct mode; in shared mode the seed that
    /// opens the shared ciphertext.
    fn plaintext(&self, payload: Vec<u8>) -> Result<Vec<u8>, ManagerError> {
        match self.envelope.mode {
            PayloadMode::Direct => Ok(payload),
            PayloadMode::Shared => {
                let shared = self.shared_ciphertext.ok_or(ManagerError::MissingSharedCiphertext)?;
                if payload.len() != SEED_SIZE {
                    return Err(ManagerError::authentication("seed has the wrong size"));
                }
                aead::open(
                    &kdf::seed_key(&payload),
                    &shared_ad(self.sender, self.associated_id),
                    shared,
                )
                .map_err(|err| ManagerError::authentication(err.to_string()))
            },
        }
    }
}
