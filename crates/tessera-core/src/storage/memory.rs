#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use super::{
    LocalUserRecord, PeerDeviceRecord, SessionRecord, Storage, StorageError, order_sessions,
};

/// In-memory storage implementation for testing and simulation
///
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access.
/// Thread-safe through Mutex, but uses `lock().expect()` which will panic if
/// the mutex is poisoned - acceptable for test code. Each call holds the lock
/// for its whole duration, so multi-record updates are atomic.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Local users by device id
    users: HashMap<String, LocalUserRecord>,

    /// Peer devices by (local, peer)
    peers: HashMap<(String, String), PeerDeviceRecord>,

    /// Sessions by id
    sessions: BTreeMap<u64, SessionRecord>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                users: HashMap::new(),
                peers: HashMap::new(),
                sessions: BTreeMap::new(),
            })),
        }
    }

    /// Total number of sessions across all users.
    ///
    /// Useful for debugging and testing.
    pub fn session_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").sessions.len()
    }

    /// Total number of peer device records across all users.
    ///
    /// Useful for debugging and testing.
    pub fn peer_device_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").peers.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn create_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if inner.users.contains_key(&user.device_id) {
            return Err(StorageError::AlreadyExists { device_id: user.device_id.clone() });
        }
        inner.users.insert(user.device_id.clone(), user.clone());

        Ok(())
    }

    fn load_local_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.users.get(device_id).cloned())
    }

    fn update_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let Some(stored) = inner.users.get_mut(&user.device_id) else {
            return Err(StorageError::NotFound {
                kind: "local user",
                key: user.device_id.clone(),
            });
        };
        *stored = user.clone();

        Ok(())
    }

    fn delete_local_user(&self, device_id: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let existed = inner.users.remove(device_id).is_some();
        inner.peers.retain(|(local, _), _| local != device_id);
        inner.sessions.retain(|_, session| session.local_device_id != device_id);

        Ok(existed)
    }

    fn list_local_users(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.users.keys().cloned().collect())
    }

    fn load_peer_device(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<Option<PeerDeviceRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.peers.get(&(local.to_string(), peer.to_string())).cloned())
    }

    fn store_peer_device(&self, record: &PeerDeviceRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner
            .peers
            .insert((record.local_device_id.clone(), record.device_id.clone()), record.clone());
        Ok(())
    }

    fn delete_peer_device(&self, peer: &str) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let before = inner.peers.len();
        inner.peers.retain(|(_, device), _| device != peer);
        inner.sessions.retain(|_, session| session.peer_device_id != peer);

        Ok(before - inner.peers.len())
    }

    fn load_sessions(&self, local: &str, peer: &str) -> Result<Vec<SessionRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| s.local_device_id == local && s.peer_device_id == peer)
            .cloned()
            .collect();
        order_sessions(&mut sessions);

        Ok(sessions)
    }

    fn load_local_sessions(&self, local: &str) -> Result<Vec<SessionRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.sessions.values().filter(|s| s.local_device_id == local).cloned().collect())
    }

    fn store_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn activate_session(&self, session: &SessionRecord, now: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        for other in inner.sessions.values_mut() {
            if other.id != session.id
                && other.active
                && other.local_device_id == session.local_device_id
                && other.peer_device_id == session.peer_device_id
            {
                other.active = false;
                other.staled_at = Some(now);
            }
        }

        let mut active = session.clone();
        active.active = true;
        active.staled_at = None;
        inner.sessions.insert(active.id, active);

        Ok(())
    }

    fn stale_sessions(&self, local: &str, peer: &str, now: u64) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let mut staled = 0;
        for session in inner.sessions.values_mut() {
            if session.active && session.local_device_id == local && session.peer_device_id == peer
            {
                session.active = false;
                session.staled_at = Some(now);
                staled += 1;
            }
        }

        Ok(staled)
    }

    fn delete_stale_sessions(&self, local: &str, cutoff: u64) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let before = inner.sessions.len();
        inner.sessions.retain(|_, session| {
            session.local_device_id != local
                || session.active
                || session.staled_at.is_none_or(|at| at > cutoff)
        });

        Ok(before - inner.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{peer_record, session, user};

    #[test]
    fn create_twice_is_rejected() {
        let storage = MemoryStorage::new();
        storage.create_local_user(&user("alice")).unwrap();

        let result = storage.create_local_user(&user("alice"));
        assert_eq!(result, Err(StorageError::AlreadyExists { device_id: "alice".to_string() }));
    }

    #[test]
    fn update_unknown_user_fails() {
        let storage = MemoryStorage::new();
        let result = storage.update_local_user(&user("alice"));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn delete_user_cascades() {
        let storage = MemoryStorage::new();
        storage.create_local_user(&user("alice")).unwrap();
        storage.create_local_user(&user("carol")).unwrap();
        storage.store_peer_device(&peer_record("alice", "bob")).unwrap();
        storage.store_peer_device(&peer_record("carol", "bob")).unwrap();
        storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        storage.activate_session(&session(2, "carol", "bob"), 10).unwrap();

        assert!(storage.delete_local_user("alice").unwrap());

        assert_eq!(storage.peer_device_count(), 1);
        assert_eq!(storage.session_count(), 1);
        assert!(storage.load_peer_device("carol", "bob").unwrap().is_some());
        assert!(!storage.delete_local_user("alice").unwrap());
    }

    #[test]
    fn delete_peer_spans_local_users() {
        let storage = MemoryStorage::new();
        storage.store_peer_device(&peer_record("alice", "bob")).unwrap();
        storage.store_peer_device(&peer_record("carol", "bob")).unwrap();
        storage.store_peer_device(&peer_record("alice", "dave")).unwrap();
        storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        storage.activate_session(&session(2, "alice", "dave"), 10).unwrap();

        assert_eq!(storage.delete_peer_device("bob").unwrap(), 2);

        assert_eq!(storage.peer_device_count(), 1);
        assert!(storage.load_sessions("alice", "bob").unwrap().is_empty());
        assert_eq!(storage.load_sessions("alice", "dave").unwrap().len(), 1);
    }

    #[test]
    fn activate_stales_previous_session() {
        let storage = MemoryStorage::new();
        storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        storage.activate_session(&session(2, "alice", "bob"), 20).unwrap();

        let sessions = storage.load_sessions("alice", "bob").unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, 2);
        assert!(sessions[0].active);
        assert_eq!(sessions[1].id, 1);
        assert!(!sessions[1].active);
        assert_eq!(sessions[1].staled_at, Some(20));
    }

    #[test]
    fn reactivating_stale_session_swaps_roles() {
        let storage = MemoryStorage::new();
        let first = session(1, "alice", "bob");
        storage.activate_session(&first, 10).unwrap();
        storage.activate_session(&session(2, "alice", "bob"), 20).unwrap();

        storage.activate_session(&first, 30).unwrap();

        let sessions = storage.load_sessions("alice", "bob").unwrap();
        assert_eq!(sessions[0].id, 1);
        assert!(sessions[0].active);
        assert_eq!(sessions[1].staled_at, Some(30));
    }

    #[test]
    fn stale_and_expire() {
        let storage = MemoryStorage::new();
        storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        storage.activate_session(&session(2, "alice", "carol"), 10).unwrap();

        assert_eq!(storage.stale_sessions("alice", "bob", 100).unwrap(), 1);
        assert_eq!(storage.stale_sessions("alice", "bob", 100).unwrap(), 0);

        assert_eq!(storage.delete_stale_sessions("alice", 99).unwrap(), 0);
        assert_eq!(storage.delete_stale_sessions("alice", 100).unwrap(), 1);
        assert_eq!(storage.session_count(), 1);
    }
}
