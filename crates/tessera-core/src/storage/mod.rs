//! Storage abstraction for local users, peer devices and sessions.
//!
//! The trait is synchronous (no async): every operation is a short local
//! transaction, and the only suspension point of the system is the key-server
//! round trip, which never happens while storage is being accessed.
//!
//! Records are plain serde types. Backends decide how to lay them out.

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};
use tessera_crypto::{CurveId, DhKeyPair, IdentityKeyPair, RatchetState};

pub use self::redb::RedbStorage;
use crate::trust::PeerDeviceStatus;

/// A signed prekey we generated, with its signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyRecord {
    /// Id announced to the key server.
    pub id: u32,
    /// Key pair.
    pub keypair: DhKeyPair,
    /// Signature of the public key by the identity key.
    pub signature: Vec<u8>,
    /// Unix seconds at generation.
    pub created_at: u64,
    /// Unix seconds at which a newer signed prekey replaced this one.
    /// `None` for the active one.
    pub superseded_at: Option<u64>,
}

/// A one-time prekey we generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyRecord {
    /// Id announced to the key server.
    pub id: u32,
    /// Key pair.
    pub keypair: DhKeyPair,
    /// Unix seconds at which the server was first seen without this key,
    /// meaning it was handed out to a peer whose first message may still be
    /// in flight.
    pub dispatched_at: Option<u64>,
}

/// A local identity: one device we encrypt and decrypt as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUserRecord {
    /// Globally unique device id.
    pub device_id: String,
    /// Long-term identity key pair. Its curve is the user's curve.
    pub identity: IdentityKeyPair,
    /// Key server this user publishes to and fetches from.
    pub key_server_url: String,
    /// Active signed prekey followed by superseded ones still in limbo.
    pub signed_prekeys: Vec<SignedPrekeyRecord>,
    /// One-time prekeys not consumed yet.
    pub one_time_prekeys: Vec<OneTimePrekeyRecord>,
}

impl LocalUserRecord {
    /// Curve chosen at creation.
    pub fn curve(&self) -> CurveId {
        self.identity.curve()
    }

    /// The signed prekey currently published.
    pub fn active_signed_prekey(&self) -> Option<&SignedPrekeyRecord> {
        self.signed_prekeys.iter().find(|spk| spk.superseded_at.is_none())
    }
}

/// A peer device as seen by one local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDeviceRecord {
    /// Local user this record belongs to.
    pub local_device_id: String,
    /// Peer device id.
    pub device_id: String,
    /// Identity key, `None` while only a placeholder is known.
    pub identity_key: Option<Vec<u8>>,
    /// Trust status.
    pub status: PeerDeviceStatus,
}

/// Key-exchange material carried by the first message of an initiator session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKeyExchange {
    /// Our ephemeral public key.
    pub ephemeral_key: Vec<u8>,
    /// Id of the peer signed prekey used.
    pub signed_prekey_id: u32,
    /// Id of the peer one-time prekey used, if any.
    pub one_time_prekey_id: Option<u32>,
}

/// Ratchet session between a local user and a peer device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Store-wide unique id.
    pub id: u64,
    /// Local side.
    pub local_device_id: String,
    /// Peer side.
    pub peer_device_id: String,
    /// Double Ratchet state.
    pub ratchet: RatchetState,
    /// At most one active session per pair.
    pub active: bool,
    /// Unix seconds at creation.
    pub created_at: u64,
    /// Unix seconds at which the session stopped being active.
    pub staled_at: Option<u64>,
    /// Set on an initiator session until its first message is sent.
    pub pending_key_exchange: Option<PendingKeyExchange>,
}

/// Storage abstraction for local users, peer devices and sessions.
///
/// Must be Clone (shared by the manager and its maintenance tasks), Send +
/// Sync (thread-safe), and synchronous (no async methods). Implementations
/// share internal state via Arc, so clones access the same underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for
/// test/simulation code, but production implementations should handle poisoned
/// mutexes gracefully.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert a new local user.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the device id is taken.
    fn create_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError>;

    /// Load a local user. `None` if unknown.
    fn load_local_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError>;

    /// Overwrite an existing local user.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user was deleted meanwhile.
    fn update_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError>;

    /// Delete a local user with its peer devices and sessions.
    ///
    /// Returns whether the user existed.
    fn delete_local_user(&self, device_id: &str) -> Result<bool, StorageError>;

    /// Device ids of every local user. Order is not guaranteed.
    fn list_local_users(&self) -> Result<Vec<String>, StorageError>;

    /// Load the record of `peer` under `local`. `None` if never seen.
    fn load_peer_device(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<Option<PeerDeviceRecord>, StorageError>;

    /// Insert or update a peer device record.
    fn store_peer_device(&self, record: &PeerDeviceRecord) -> Result<(), StorageError>;

    /// Delete `peer` under every local user, with its sessions.
    ///
    /// Returns the number of peer records removed.
    fn delete_peer_device(&self, peer: &str) -> Result<usize, StorageError>;

    /// Sessions of a pair: the active one first, then stale ones most
    /// recently staled first.
    fn load_sessions(&self, local: &str, peer: &str) -> Result<Vec<SessionRecord>, StorageError>;

    /// Every session of a local user, in no particular order.
    fn load_local_sessions(&self, local: &str) -> Result<Vec<SessionRecord>, StorageError>;

    /// Insert or overwrite a session by id, leaving other sessions alone.
    fn store_session(&self, session: &SessionRecord) -> Result<(), StorageError>;

    /// Store `session` as the active session of its pair and stale every other
    /// active session of that pair at `now`, in one transaction.
    fn activate_session(&self, session: &SessionRecord, now: u64) -> Result<(), StorageError>;

    /// Stale the active session of a pair at `now`.
    ///
    /// Returns the number of sessions staled.
    fn stale_sessions(&self, local: &str, peer: &str, now: u64) -> Result<usize, StorageError>;

    /// Delete stale sessions of `local` staled at or before `cutoff`.
    ///
    /// Returns the number of sessions deleted.
    fn delete_stale_sessions(&self, local: &str, cutoff: u64) -> Result<usize, StorageError>;
}

/// Order sessions of one pair the way `load_sessions` returns them.
pub(crate) fn order_sessions(sessions: &mut [SessionRecord]) {
    sessions.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then_with(|| b.staled_at.cmp(&a.staled_at))
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use tessera_crypto::{CurveId, DhKeyPair, IdentityKeyPair, RatchetState, x3dh};

    use super::{LocalUserRecord, PeerDeviceRecord, SessionRecord, SignedPrekeyRecord};
    use crate::trust::PeerDeviceStatus;

    pub(crate) fn user(device_id: &str) -> LocalUserRecord {
        let identity = IdentityKeyPair::from_seed(CurveId::Curve25519, [1; 32]).unwrap();
        let keypair = DhKeyPair::from_seed(CurveId::Curve25519, [2; 32]).unwrap();
        let signature = identity.sign(keypair.public_key()).unwrap();

        LocalUserRecord {
            device_id: device_id.to_string(),
            identity,
            key_server_url: "https://keys.test".to_string(),
            signed_prekeys: vec![SignedPrekeyRecord {
                id: 7,
                keypair,
                signature,
                created_at: 0,
                superseded_at: None,
            }],
            one_time_prekeys: Vec::new(),
        }
    }

    pub(crate) fn peer_record(local: &str, peer: &str) -> PeerDeviceRecord {
        PeerDeviceRecord {
            local_device_id: local.to_string(),
            device_id: peer.to_string(),
            identity_key: Some(vec![9; 32]),
            status: PeerDeviceStatus::Untrusted,
        }
    }

    pub(crate) fn session(id: u64, local: &str, peer: &str) -> SessionRecord {
        let identity = IdentityKeyPair::from_seed(CurveId::Curve25519, [1; 32]).unwrap();
        let peer_identity = IdentityKeyPair::from_seed(CurveId::Curve25519, [3; 32]).unwrap();
        let signed_prekey = DhKeyPair::from_seed(CurveId::Curve25519, [2; 32]).unwrap();
        let ephemeral = DhKeyPair::from_seed(CurveId::Curve25519, [4; 32]).unwrap();

        let secrets = x3dh::respond(
            &identity,
            local,
            &signed_prekey,
            None,
            peer,
            peer_identity.public_key(),
            ephemeral.public_key(),
        )
        .unwrap();

        SessionRecord {
            id,
            local_device_id: local.to_string(),
            peer_device_id: peer.to_string(),
            ratchet: RatchetState::responder(&secrets, signed_prekey),
            active: false,
            created_at: id,
            staled_at: None,
            pending_key_exchange: None,
        }
    }
}
