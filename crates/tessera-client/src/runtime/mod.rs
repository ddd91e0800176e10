//! Async driver for the manager.
//!
//! [`AsyncManager`] runs a [`Manager`] behind a mutex and executes its
//! actions: every [`ManagerAction::Post`] becomes a spawned task calling the
//! [`KeyServerTransport`], whose outcome is fed back as an event; every
//! [`ManagerAction::Completed`] resolves the oneshot channel the caller of
//! the operation is awaiting.
//!
//! The lock is never held across an await point. Synchronous operations
//! (decryption, trust queries) take the lock for the duration of the call.
//!
//! A post that gets no answer within the post timeout, measured with the
//! manager's [`Environment`], is reported as a transport failure.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

mod system_env;

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

pub use system_env::SystemEnv;
use tessera_core::{EncryptionPolicy, Environment, PeerDeviceStatus, Storage};
use tessera_crypto::CurveId;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    error::ManagerError,
    event::{
        Completion, DecryptOutput, EncryptOutput, ManagerAction, ManagerEvent, RequestId,
    },
    manager::Manager,
};

/// How long a post may go unanswered by default.
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure to exchange a message with the key server.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Performs key-server posts.
///
/// Implementations own retries; the manager treats an error as the end of
/// that exchange.
pub trait KeyServerTransport: Send + Sync + 'static {
    /// POST `body` to `url` as `from`, returning the status code and the
    /// response body.
    fn post(
        &self,
        url: &str,
        from: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(u16, Vec<u8>), TransportError>> + Send;
}

/// Async facade over a [`Manager`].
///
/// Clones share the same manager.
pub struct AsyncManager<E: Environment, S: Storage, T: KeyServerTransport> {
    shared: Arc<Shared<E, S, T>>,
}

impl<E: Environment, S: Storage, T: KeyServerTransport> Clone for AsyncManager<E, S, T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

struct Shared<E: Environment, S: Storage, T: KeyServerTransport> {
    state: Mutex<State<E, S>>,
    transport: T,
    env: E,
    post_timeout: Duration,
}

struct State<E: Environment, S: Storage> {
    manager: Manager<E, S>,
    waiters: HashMap<RequestId, oneshot::Sender<Completion>>,
    next_request: RequestId,
}

impl<E: Environment, S: Storage, T: KeyServerTransport> AsyncManager<E, S, T> {
    /// Drive `manager` with `transport`.
    ///
    /// Asynchronous operations spawn tasks, so they must be awaited inside a
    /// tokio runtime.
    pub fn new(manager: Manager<E, S>, transport: T) -> Self {
        Self::with_post_timeout(manager, transport, DEFAULT_POST_TIMEOUT)
    }

    /// Like [`AsyncManager::new`], failing posts unanswered after `timeout`.
    pub fn with_post_timeout(manager: Manager<E, S>, transport: T, timeout: Duration) -> Self {
        let env = manager.env().clone();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State { manager, waiters: HashMap::new(), next_request: 0 }),
                transport,
                env,
                post_timeout: timeout,
            }),
        }
    }

    /// Create a local user and register it with `key_server_url`.
    pub async fn create_user(
        &self,
        device_id: &str,
        key_server_url: &str,
        curve: CurveId,
    ) -> Result<(), ManagerError> {
        let completion = self
            .submit(|request| ManagerEvent::CreateUser {
                request,
                device_id: device_id.to_string(),
                key_server_url: key_server_url.to_string(),
                curve,
                one_time_prekeys: None,
            })
            .await?;
        match completion {
            Completion::CreateUser(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    /// Delete a local user here and on its key server.
    pub async fn delete_user(&self, device_id: &str) -> Result<(), ManagerError> {
        let completion = self
            .submit(|request| ManagerEvent::DeleteUser {
                request,
                device_id: device_id.to_string(),
            })
            .await?;
        match completion {
            Completion::DeleteUser(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    /// Encrypt `plaintext` from `local` to every recipient.
    pub async fn encrypt(
        &self,
        local: &str,
        associated_id: &[u8],
        recipients: &[String],
        plaintext: &[u8],
        policy: Option<EncryptionPolicy>,
    ) -> Result<EncryptOutput, ManagerError> {
        let completion = self
            .submit(|request| ManagerEvent::Encrypt {
                request,
                local_device_id: local.to_string(),
                associated_id: associated_id.to_vec(),
                recipients: recipients.to_vec(),
                plaintext: plaintext.to_vec(),
                policy,
            })
            .await?;
        match completion {
            Completion::Encrypt(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    /// Run maintenance for every local user.
    pub async fn update(&self) -> Result<(), ManagerError> {
        let completion = self.submit(|request| ManagerEvent::Update { request }).await?;
        match completion {
            Completion::Update(result) => result,
            other => Err(unexpected(&other)),
        }
    }

    /// See [`Manager::decrypt`].
    pub fn decrypt(
        &self,
        local: &str,
        associated_id: &[u8],
        sender: &str,
        envelope: &[u8],
        shared_ciphertext: Option<&[u8]>,
    ) -> Result<DecryptOutput, ManagerError> {
        let state = self.shared.lock();
        state.manager.decrypt(local, associated_id, sender, envelope, shared_ciphertext)
    }

    /// See [`Manager::is_user`].
    pub fn is_user(&self, device_id: &str) -> Result<bool, ManagerError> {
        self.shared.lock().manager.is_user(device_id)
    }

    /// See [`Manager::peer_device_status`].
    pub fn peer_device_status(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<PeerDeviceStatus, ManagerError> {
        self.shared.lock().manager.peer_device_status(local, peer)
    }

    /// See [`Manager::set_peer_device_status`].
    pub fn set_peer_device_status(
        &self,
        local: &str,
        peer: &str,
        status: PeerDeviceStatus,
        identity_key: Option<&[u8]>,
    ) -> Result<PeerDeviceStatus, ManagerError> {
        self.shared.lock().manager.set_peer_device_status(local, peer, status, identity_key)
    }

    /// See [`Manager::delete_peer_device`].
    pub fn delete_peer_device(&self, peer: &str) -> Result<usize, ManagerError> {
        self.shared.lock().manager.delete_peer_device(peer)
    }

    /// See [`Manager::stale_sessions`].
    pub fn stale_sessions(&self, local: &str, peer: &str) -> Result<usize, ManagerError> {
        self.shared.lock().manager.stale_sessions(local, peer)
    }

    /// See [`Manager::key_server_url`].
    pub fn key_server_url(&self, device_id: &str) -> Result<String, ManagerError> {
        self.shared.lock().manager.key_server_url(device_id)
    }

    /// See [`Manager::set_key_server_url`].
    pub fn set_key_server_url(&self, device_id: &str, url: &str) -> Result<(), ManagerError> {
        self.shared.lock().manager.set_key_server_url(device_id, url)
    }

    /// See [`Manager::self_identity_key`].
    pub fn self_identity_key(&self, device_id: &str) -> Result<Vec<u8>, ManagerError> {
        self.shared.lock().manager.self_identity_key(device_id)
    }

    /// Submit an asynchronous operation and wait for its completion.
    async fn submit(
        &self,
        event: impl FnOnce(RequestId) -> ManagerEvent,
    ) -> Result<Completion, ManagerError> {
        let receiver = {
            let mut state = self.shared.lock();
            let request = state.next_request;
            state.next_request += 1;

            let (sender, receiver) = oneshot::channel();
            state.waiters.insert(request, sender);

            match state.manager.handle(event(request)) {
                Ok(actions) => self.shared.execute(&mut state, actions),
                Err(err) => {
                    state.waiters.remove(&request);
                    return Err(err);
                },
            }
            receiver
        };

        receiver.await.map_err(|_| ManagerError::key_server("completion channel closed"))
    }
}

impl<E: Environment, S: Storage, T: KeyServerTransport> Shared<E, S, T> {
    fn lock(&self) -> MutexGuard<'_, State<E, S>> {
        self.state.lock().expect("Mutex poisoned")
    }

    /// One post, bounded by the post timeout.
    async fn post(
        &self,
        url: &str,
        from: &str,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let started = self.env.now();
        let outcome = tokio::select! {
            biased;
            outcome = self.transport.post(url, from, body) => outcome,
            () = self.env.sleep(self.post_timeout) => Err(TransportError(format!(
                "no answer from {url} within {:?}",
                self.post_timeout
            ))),
        };
        let elapsed = self.env.now() - started;
        tracing::debug!(url, from, ?elapsed, ok = outcome.is_ok(), "post finished");
        outcome
    }

    /// Feed the outcome of a post back into the manager.
    fn feed(self: &Arc<Self>, event: ManagerEvent) {
        let mut state = self.lock();
        match state.manager.handle(event) {
            Ok(actions) => self.execute(&mut state, actions),
            Err(err) => tracing::warn!(%err, "key server response rejected"),
        }
    }

    fn execute(self: &Arc<Self>, state: &mut State<E, S>, actions: Vec<ManagerAction>) {
        for action in actions {
            match action {
                ManagerAction::Post { ticket, url, from, body } => {
                    let shared = Arc::clone(self);
                    tokio::spawn(async move {
                        let event = match shared.post(&url, &from, body).await {
                            Ok((status, body)) => {
                                ManagerEvent::ServerResponse { ticket, status, body }
                            },
                            Err(err) => {
                                ManagerEvent::TransportFailed { ticket, reason: err.to_string() }
                            },
                        };
                        shared.feed(event);
                    });
                },
                ManagerAction::Completed { request, completion } => {
                    match state.waiters.remove(&request) {
                        Some(waiter) => {
                            // Receiver gone means the caller stopped waiting.
                            let _ = waiter.send(completion);
                        },
                        None => tracing::debug!(request, "completion without waiter"),
                    }
                },
            }
        }
    }
}

fn unexpected(completion: &Completion) -> ManagerError {
    ManagerError::key_server(format!("mismatched completion {completion:?}"))
}
