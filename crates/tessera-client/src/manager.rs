//! Encryption manager state machine.
//!
//! The `Manager` owns every local user of one store. Operations that need
//! the key server (user creation and deletion, encryption to peers without a
//! session, maintenance) are driven through [`Manager::handle`]; everything
//! else, decryption included, is a plain synchronous call.

use std::collections::{HashMap, VecDeque};

use tessera_core::{
    CoreError, Environment, LocalUserRecord, ManagerConfig, PeerDeviceStatus, SessionStore,
    Storage, TrustStore,
    prekeys::{self, register_request},
};
use tessera_crypto::CurveId;
use tessera_proto::{KeyServerRequest, KeyServerResponse, MessageType};

use crate::{
    encryption::PendingEncrypt,
    error::ManagerError,
    event::{Completion, ManagerAction, ManagerEvent, RequestId, Ticket},
    key_exchange::{KeyExchangeClient, Purpose},
    maintenance::PendingUpdate,
};

/// Encryption manager for the local users of one store.
///
/// # Ordering
///
/// Encryptions of one local user complete in submission order, even when a
/// later one could finish first. Encryptions of different local users are
/// independent.
pub struct Manager<E: Environment, S: Storage> {
    /// Environment for randomness and wall-clock time.
    pub(crate) env: E,

    /// Persistence shared with the trust and session stores.
    pub(crate) storage: S,

    /// Tunables.
    pub(crate) config: ManagerConfig,

    /// Peer device records.
    pub(crate) trust: TrustStore<S>,

    /// Ratchet sessions.
    pub(crate) sessions: SessionStore<S>,

    /// Outstanding key-server posts.
    pub(crate) key_exchange: KeyExchangeClient,

    /// Encryptions waiting for key bundles, per local user, in submission
    /// order.
    pub(crate) queues: HashMap<String, VecDeque<PendingEncrypt>>,

    /// Maintenance runs waiting for key-server answers.
    pub(crate) updates: HashMap<RequestId, PendingUpdate>,
}

impl<E: Environment, S: Storage> Manager<E, S> {
    /// Create a manager over `storage`.
    pub fn new(env: E, storage: S, config: ManagerConfig) -> Self {
        Self {
            env,
            trust: TrustStore::new(storage.clone()),
            sessions: SessionStore::new(storage.clone()),
            storage,
            config,
            key_exchange: KeyExchangeClient::default(),
            queues: HashMap::new(),
            updates: HashMap::new(),
        }
    }

    /// Environment the manager draws time and randomness from.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Process an event, returning actions for the caller to execute.
    ///
    /// # Errors
    ///
    /// Validation failures of a new operation (unknown or duplicate user)
    /// are returned here instead of as a completion. Failures while
    /// processing a key-server answer are reported through the completion
    /// of the operation that was waiting for it.
    pub fn handle(&mut self, event: ManagerEvent) -> Result<Vec<ManagerAction>, ManagerError> {
        match event {
            ManagerEvent::CreateUser {
                request,
                device_id,
                key_server_url,
                curve,
                one_time_prekeys,
            } => self.handle_create_user(
                request,
                &device_id,
                &key_server_url,
                curve,
                one_time_prekeys,
            ),
            ManagerEvent::DeleteUser { request, device_id } => {
                self.handle_delete_user(request, &device_id)
            },
            ManagerEvent::Encrypt {
                request,
                local_device_id,
                associated_id,
                recipients,
                plaintext,
                policy,
            } => {
                let policy = policy.unwrap_or(self.config.default_policy);
                self.handle_encrypt(
                    request,
                    &local_device_id,
                    associated_id,
                    recipients,
                    plaintext,
                    policy,
                )
            },
            ManagerEvent::Update { request } => self.handle_update(request),
            ManagerEvent::ServerResponse { ticket, status, body } => {
                Ok(self.handle_server_outcome(ticket, Ok((status, body))))
            },
            ManagerEvent::TransportFailed { ticket, reason } => {
                Ok(self.handle_server_outcome(ticket, Err(reason)))
            },
        }
    }

    /// Whether a local user with this device id exists.
    pub fn is_user(&self, device_id: &str) -> Result<bool, ManagerError> {
        Ok(self.storage.load_local_user(device_id)?.is_some())
    }

    /// Public identity key of a local user.
    pub fn self_identity_key(&self, device_id: &str) -> Result<Vec<u8>, ManagerError> {
        Ok(self.user(device_id)?.identity.public_key().to_vec())
    }

    /// Key server a local user talks to.
    pub fn key_server_url(&self, device_id: &str) -> Result<String, ManagerError> {
        Ok(self.user(device_id)?.key_server_url)
    }

    /// Point a local user at another key server.
    pub fn set_key_server_url(&self, device_id: &str, url: &str) -> Result<(), ManagerError> {
        let mut user = self.user(device_id)?;
        user.key_server_url = url.to_string();
        self.storage.update_local_user(&user)?;
        tracing::info!(user = device_id, url, "key server changed");
        Ok(())
    }

    /// Trust status of `peer` as seen by `local`.
    pub fn peer_device_status(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<PeerDeviceStatus, ManagerError> {
        self.user(local)?;
        Ok(self.trust.status(local, peer)?)
    }

    /// Assert a trust status for `peer`.
    ///
    /// Trusted requires the peer identity key. A change that withdraws trust
    /// also stales the active session, so the next encryption starts over
    /// from a fresh key bundle. Returns the status after the call.
    pub fn set_peer_device_status(
        &self,
        local: &str,
        peer: &str,
        status: PeerDeviceStatus,
        identity_key: Option<&[u8]>,
    ) -> Result<PeerDeviceStatus, ManagerError> {
        let user = self.user(local)?;
        if status == PeerDeviceStatus::Trusted
            && let Some(key) = identity_key
        {
            let expected = user.curve().identity_key_len();
            if key.len() != expected {
                return Err(CoreError::IdentityKeyLength { expected, actual: key.len() }.into());
            }
        }

        let change = self.trust.set_status(local, peer, status, identity_key)?;
        if change.revokes_trust() {
            self.sessions.stale(local, peer, self.env.wall_clock_secs())?;
        }
        Ok(change.current)
    }

    /// Forget a peer device under every local user, sessions included.
    ///
    /// Returns the number of peer records removed.
    pub fn delete_peer_device(&self, peer: &str) -> Result<usize, ManagerError> {
        let removed = self.storage.delete_peer_device(peer)?;
        tracing::info!(peer, removed, "peer device deleted");
        Ok(removed)
    }

    /// Stale the active session between `local` and `peer`, so the next
    /// encryption performs a fresh key exchange.
    pub fn stale_sessions(&self, local: &str, peer: &str) -> Result<usize, ManagerError> {
        self.user(local)?;
        Ok(self.sessions.stale(local, peer, self.env.wall_clock_secs())?)
    }

    /// Encryptions of `local` waiting for key bundles.
    pub fn queued_encryptions(&self, local: &str) -> usize {
        self.queues.get(local).map_or(0, VecDeque::len)
    }

    /// Key-server posts awaiting an answer.
    pub fn outstanding_posts(&self) -> usize {
        self.key_exchange.outstanding_count()
    }

    pub(crate) fn user(&self, device_id: &str) -> Result<LocalUserRecord, ManagerError> {
        self.storage
            .load_local_user(device_id)?
            .ok_or_else(|| ManagerError::UserNotFound(device_id.to_string()))
    }

    fn handle_create_user(
        &mut self,
        request: RequestId,
        device_id: &str,
        key_server_url: &str,
        curve: CurveId,
        one_time_prekeys: Option<u16>,
    ) -> Result<Vec<ManagerAction>, ManagerError> {
        if self.is_user(device_id)? {
            return Err(ManagerError::UserAlreadyExists(device_id.to_string()));
        }

        let count = one_time_prekeys.unwrap_or(self.config.initial_one_time_prekeys);
        let user = prekeys::new_local_user(&self.env, device_id, key_server_url, curve, count)?;
        let published = user.one_time_prekeys.iter().map(|opk| opk.to_wire()).collect();
        let registration = register_request(&user, published)?;
        self.storage.create_local_user(&user)?;

        tracing::info!(user = device_id, ?curve, one_time_prekeys = count, "user created");

        let purpose = Purpose::Register { request, device_id: device_id.to_string() };
        let post =
            self.key_exchange.post(purpose, curve, key_server_url, device_id, &registration)?;
        Ok(vec![post])
    }

    fn handle_delete_user(
        &mut self,
        request: RequestId,
        device_id: &str,
    ) -> Result<Vec<ManagerAction>, ManagerError> {
        let user = self.user(device_id)?;
        self.storage.delete_local_user(device_id)?;
        self.key_exchange.forget_local(device_id);

        let mut actions: Vec<ManagerAction> = self
            .queues
            .remove(device_id)
            .into_iter()
            .flatten()
            .map(|pending| {
                completed(
                    pending.request,
                    Completion::Encrypt(Err(ManagerError::UserNotFound(device_id.to_string()))),
                )
            })
            .collect();

        tracing::info!(user = device_id, failed_encryptions = actions.len(), "user deleted");

        let purpose = Purpose::Delete { request, device_id: device_id.to_string() };
        actions.push(self.key_exchange.post(
            purpose,
            user.curve(),
            &user.key_server_url,
            device_id,
            &KeyServerRequest::DeleteUser,
        )?);
        Ok(actions)
    }

    fn handle_server_outcome(
        &mut self,
        ticket: Ticket,
        outcome: Result<(u16, Vec<u8>), String>,
    ) -> Vec<ManagerAction> {
        let Some((purpose, response)) = self.key_exchange.resolve(ticket, outcome) else {
            return Vec::new();
        };

        match purpose {
            Purpose::Register { request, device_id } => {
                let result = expect_ack(response, MessageType::RegisterUser);
                if let Err(err) = &result {
                    tracing::warn!(user = %device_id, %err, "registration rejected");
                    if let Err(cleanup) = self.storage.delete_local_user(&device_id) {
                        tracing::warn!(user = %device_id, %cleanup, "cannot remove rejected user");
                    }
                }
                vec![completed(request, Completion::CreateUser(result))]
            },
            Purpose::Delete { request, device_id: _ } => {
                let result = expect_ack(response, MessageType::DeleteUser);
                vec![completed(request, Completion::DeleteUser(result))]
            },
            Purpose::FetchBundles { local, peers } => {
                self.bundles_fetched(&local, &peers, response)
            },
            Purpose::PostSignedPrekey { update, device_id: _ } => self.update_step(
                update,
                expect_ack(response, MessageType::PostSignedPrekey).map(|()| None),
            ),
            Purpose::PostOneTimePrekeys { update, device_id: _ } => self.update_step(
                update,
                expect_ack(response, MessageType::PostOneTimePrekeys).map(|()| None),
            ),
            Purpose::Reregister { update, device_id: _ } => self.update_step(
                update,
                expect_ack(response, MessageType::RegisterUser).map(|()| None),
            ),
            Purpose::ListOneTimePrekeys { update, device_id } => {
                let step = self.one_time_prekeys_listed(update, &device_id, response);
                self.update_step(update, step)
            },
        }
    }
}

pub(crate) fn completed(request: RequestId, completion: Completion) -> ManagerAction {
    ManagerAction::Completed { request, completion }
}

/// Accept only an acknowledgement of `expected`.
pub(crate) fn expect_ack(
    response: Result<KeyServerResponse, ManagerError>,
    expected: MessageType,
) -> Result<(), ManagerError> {
    match response? {
        KeyServerResponse::Ack(message_type) if message_type == expected => Ok(()),
        other => Err(ManagerError::key_server(format!(
            "expected {expected:?} acknowledgement, got {:?}",
            other.message_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use tessera_core::{MemoryStorage, env::test_utils::MockEnv};

    use super::*;

    fn manager() -> Manager<MockEnv, MemoryStorage> {
        Manager::new(MockEnv::new(), MemoryStorage::new(), ManagerConfig::default())
    }

    fn create(manager: &mut Manager<MockEnv, MemoryStorage>, device_id: &str) -> Ticket {
        let actions = manager
            .handle(ManagerEvent::CreateUser {
                request: 1,
                device_id: device_id.to_string(),
                key_server_url: "https://keys.test".to_string(),
                curve: CurveId::Curve25519,
                one_time_prekeys: Some(4),
            })
            .unwrap();
        match actions.as_slice() {
            [ManagerAction::Post { ticket, from, .. }] => {
                assert_eq!(from, device_id);
                *ticket
            },
            other => panic!("expected one post, got {other:?}"),
        }
    }

    fn ack(message_type: MessageType) -> Vec<u8> {
        KeyServerResponse::Ack(message_type).encode(CurveId::Curve25519).unwrap()
    }

    #[test]
    fn create_user_posts_registration() {
        let mut manager = manager();
        let ticket = create(&mut manager, "alice");
        assert!(manager.is_user("alice").unwrap());

        let actions = manager
            .handle(ManagerEvent::ServerResponse {
                ticket,
                status: 200,
                body: ack(MessageType::RegisterUser),
            })
            .unwrap();
        assert_eq!(actions, vec![completed(1, Completion::CreateUser(Ok(())))]);
        assert_eq!(manager.outstanding_posts(), 0);
    }

    #[test]
    fn duplicate_user_rejected_synchronously() {
        let mut manager = manager();
        create(&mut manager, "alice");

        let result = manager.handle(ManagerEvent::CreateUser {
            request: 2,
            device_id: "alice".to_string(),
            key_server_url: "https://keys.test".to_string(),
            curve: CurveId::P256,
            one_time_prekeys: None,
        });
        assert_eq!(result, Err(ManagerError::UserAlreadyExists("alice".to_string())));
    }

    #[test]
    fn rejected_registration_removes_user() {
        let mut manager = manager();
        let ticket = create(&mut manager, "alice");

        let actions = manager
            .handle(ManagerEvent::TransportFailed { ticket, reason: "refused".to_string() })
            .unwrap();
        assert!(matches!(
            actions.as_slice(),
            [ManagerAction::Completed { completion: Completion::CreateUser(Err(_)), .. }]
        ));
        assert!(!manager.is_user("alice").unwrap());
    }

    #[test]
    fn delete_unknown_user_fails() {
        let mut manager = manager();
        let result =
            manager.handle(ManagerEvent::DeleteUser { request: 1, device_id: "ghost".into() });
        assert_eq!(result, Err(ManagerError::UserNotFound("ghost".to_string())));
    }

    #[test]
    fn key_server_url_is_mutable() {
        let mut manager = manager();
        create(&mut manager, "alice");

        manager.set_key_server_url("alice", "https://other.test").unwrap();
        assert_eq!(manager.key_server_url("alice").unwrap(), "https://other.test");
        assert_eq!(manager.self_identity_key("alice").unwrap().len(), 32);
    }

    #[test]
    fn trusted_requires_curve_sized_key() {
        let mut manager = manager();
        create(&mut manager, "alice");

        let short_key = [1u8; 5];
        let result = manager.set_peer_device_status(
            "alice",
            "bob",
            PeerDeviceStatus::Trusted,
            Some(&short_key[..]),
        );
        assert!(matches!(result, Err(ManagerError::State(CoreError::IdentityKeyLength { .. }))));

        let status = manager
            .set_peer_device_status("alice", "bob", PeerDeviceStatus::Trusted, Some(&[1u8; 32][..]))
            .unwrap();
        assert_eq!(status, PeerDeviceStatus::Trusted);
        assert_eq!(manager.peer_device_status("alice", "bob").unwrap(), PeerDeviceStatus::Trusted);
    }

    #[test]
    fn status_queries_require_user() {
        let manager = manager();
        assert_eq!(
            manager.peer_device_status("ghost", "bob"),
            Err(ManagerError::UserNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn unknown_ticket_is_ignored() {
        let mut manager = manager();
        let actions = manager
            .handle(ManagerEvent::ServerResponse { ticket: 99, status: 200, body: Vec::new() })
            .unwrap();
        assert!(actions.is_empty());
    }
}
