//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait method runs in a single transaction, so `activate_session` and the
//! cascading deletes are atomic with respect to concurrent readers.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::{
    LocalUserRecord, PeerDeviceRecord, SessionRecord, Storage, StorageError, order_sessions,
};

/// Table: local_users
/// Key: device id bytes
/// Value: CBOR-encoded LocalUserRecord
const LOCAL_USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("local_users");

/// Table: peer_devices
/// Key: pair key (see `encode_pair_key`)
/// Value: CBOR-encoded PeerDeviceRecord
const PEER_DEVICES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("peer_devices");

/// Table: sessions
/// Key: pair key followed by session id (8 bytes BE)
/// Value: CBOR-encoded SessionRecord
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Raw key/value pairs of a prefix scan.
type RawEntries = Vec<(Vec<u8>, Vec<u8>)>;

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (LOCAL_USERS, PEER_DEVICES,
    /// SESSIONS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(PEER_DEVICES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn create_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = user.device_id.as_bytes();
            if table.get(key).map_err(|e| StorageError::Io(e.to_string()))?.is_some() {
                return Err(StorageError::AlreadyExists { device_id: user.device_id.clone() });
            }

            let bytes = encode(user)?;
            table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_local_user(&self, device_id: &str) -> Result<Option<LocalUserRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(device_id.as_bytes()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn update_local_user(&self, user: &LocalUserRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = user.device_id.as_bytes();
            if table.get(key).map_err(|e| StorageError::Io(e.to_string()))?.is_none() {
                return Err(StorageError::NotFound {
                    kind: "local user",
                    key: user.device_id.clone(),
                });
            }

            let bytes = encode(user)?;
            table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn delete_local_user(&self, device_id: &str) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let existed;
        {
            let mut users =
                txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;
            existed = users
                .remove(device_id.as_bytes())
                .map_err(|e| StorageError::Io(e.to_string()))?
                .is_some();

            let prefix = encode_local_prefix(device_id);

            let mut peers =
                txn.open_table(PEER_DEVICES).map_err(|e| StorageError::Io(e.to_string()))?;
            for (key, _) in scan_prefix(&peers, &prefix)? {
                peers.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            let mut sessions =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            for (key, _) in scan_prefix(&sessions, &prefix)? {
                sessions.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(existed)
    }

    fn list_local_users(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(LOCAL_USERS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut users = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let device_id = String::from_utf8(key.value().to_vec())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            users.push(device_id);
        }

        Ok(users)
    }

    fn load_peer_device(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<Option<PeerDeviceRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(PEER_DEVICES).map_err(|e| StorageError::Io(e.to_string()))?;

        let key = encode_pair_key(local, peer);
        match table.get(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn store_peer_device(&self, record: &PeerDeviceRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(PEER_DEVICES).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = encode_pair_key(&record.local_device_id, &record.device_id);
            let bytes = encode(record)?;
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn delete_peer_device(&self, peer: &str) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let removed;
        {
            let mut peers =
                txn.open_table(PEER_DEVICES).map_err(|e| StorageError::Io(e.to_string()))?;
            let doomed: Vec<Vec<u8>> = scan_prefix(&peers, &[])?
                .into_iter()
                .filter(|(key, _)| decode_pair_key(key).is_some_and(|(_, p)| p == peer))
                .map(|(key, _)| key)
                .collect();
            removed = doomed.len();
            for key in doomed {
                peers.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            let mut sessions =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let doomed: Vec<Vec<u8>> = scan_prefix(&sessions, &[])?
                .into_iter()
                .filter(|(key, _)| decode_pair_key(key).is_some_and(|(_, p)| p == peer))
                .map(|(key, _)| key)
                .collect();
            for key in doomed {
                sessions.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(removed)
    }

    fn load_sessions(&self, local: &str, peer: &str) -> Result<Vec<SessionRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut sessions = scan_prefix(&table, &encode_pair_key(local, peer))?
            .into_iter()
            .map(|(_, value)| decode::<SessionRecord>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        order_sessions(&mut sessions);

        Ok(sessions)
    }

    fn load_local_sessions(&self, local: &str) -> Result<Vec<SessionRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        scan_prefix(&table, &encode_local_prefix(local))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn store_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let key = encode_session_key(session);
            let bytes = encode(session)?;
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn activate_session(&self, session: &SessionRecord, now: u64) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            let prefix = encode_pair_key(&session.local_device_id, &session.peer_device_id);
            for (key, value) in scan_prefix(&table, &prefix)? {
                let mut other: SessionRecord = decode(&value)?;
                if other.id == session.id || !other.active {
                    continue;
                }
                other.active = false;
                other.staled_at = Some(now);
                let bytes = encode(&other)?;
                table
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }

            let mut active = session.clone();
            active.active = true;
            active.staled_at = None;
            let key = encode_session_key(&active);
            let bytes = encode(&active)?;
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn stale_sessions(&self, local: &str, peer: &str, now: u64) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let mut staled = 0;
        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            for (key, value) in scan_prefix(&table, &encode_pair_key(local, peer))? {
                let mut session: SessionRecord = decode(&value)?;
                if !session.active {
                    continue;
                }
                session.active = false;
                session.staled_at = Some(now);
                let bytes = encode(&session)?;
                table
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                staled += 1;
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(staled)
    }

    fn delete_stale_sessions(&self, local: &str, cutoff: u64) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let mut deleted = 0;
        {
            let mut table =
                txn.open_table(SESSIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            for (key, value) in scan_prefix(&table, &encode_local_prefix(local))? {
                let session: SessionRecord = decode(&value)?;
                let expired = !session.active && session.staled_at.is_some_and(|at| at <= cutoff);
                if expired {
                    table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
                    deleted += 1;
                }
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(deleted)
    }
}

/// Owned copies of every entry whose key starts with `prefix`.
///
/// Copies out so callers can mutate the table while walking the result.
fn scan_prefix<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<RawEntries, StorageError> {
    let results = table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))?;

    let mut entries = Vec::new();
    for result in results {
        let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        entries.push((key.value().to_vec(), value.value().to_vec()));
    }

    Ok(entries)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Encode a local device id as a key prefix.
///
/// Layout: [len: 2 bytes BE][local]
/// The length keeps "ab" from being a prefix of "abc".
fn encode_local_prefix(local: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + local.len());
    key.extend_from_slice(&(local.len() as u16).to_be_bytes());
    key.extend_from_slice(local.as_bytes());
    key
}

/// Encode (local, peer) as a key.
///
/// Layout: [len: 2 bytes BE][local][len: 2 bytes BE][peer]
fn encode_pair_key(local: &str, peer: &str) -> Vec<u8> {
    let mut key = encode_local_prefix(local);
    key.extend_from_slice(&(peer.len() as u16).to_be_bytes());
    key.extend_from_slice(peer.as_bytes());
    key
}

/// Encode a session key: pair key followed by the session id.
fn encode_session_key(session: &SessionRecord) -> Vec<u8> {
    let mut key = encode_pair_key(&session.local_device_id, &session.peer_device_id);
    key.extend_from_slice(&session.id.to_be_bytes());
    key
}

/// Decode the (local, peer) pair at the start of a key.
fn decode_pair_key(key: &[u8]) -> Option<(&str, &str)> {
    let (local, rest) = split_prefixed(key)?;
    let (peer, _) = split_prefixed(rest)?;
    Some((local, peer))
}

fn split_prefixed(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let len_bytes: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let value = bytes.get(2..2 + len)?;
    Some((std::str::from_utf8(value).ok()?, &bytes[2 + len..]))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::storage::test_support::{peer_record, session, user};

    #[test]
    fn test_pair_key_encoding() {
        let key = encode_pair_key("alice", "bob");
        assert_eq!(key.len(), 2 + 5 + 2 + 3);
        assert_eq!(decode_pair_key(&key), Some(("alice", "bob")));
    }

    #[test]
    fn test_local_prefix_does_not_match_longer_ids() {
        let key = encode_pair_key("alice2", "bob");
        assert!(!key.starts_with(&encode_local_prefix("alice")));
        assert!(key.starts_with(&encode_local_prefix("alice2")));
    }

    #[test]
    fn test_session_key_extends_pair_key() {
        let record = session(0x0102, "alice", "bob");
        let key = encode_session_key(&record);
        assert!(key.starts_with(&encode_pair_key("alice", "bob")));
        assert_eq!(&key[key.len() - 8..], &0x0102u64.to_be_bytes());
    }

    #[test]
    fn test_user_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.create_local_user(&user("alice")).unwrap();
        let loaded = storage.load_local_user("alice").unwrap().unwrap();

        assert_eq!(loaded.device_id, "alice");
        assert_eq!(loaded.signed_prekeys.len(), 1);
        assert_eq!(loaded.identity.public_key(), user("alice").identity.public_key());
        assert!(storage.load_local_user("bob").unwrap().is_none());
    }

    #[test]
    fn test_create_conflict() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.create_local_user(&user("alice")).unwrap();
        match storage.create_local_user(&user("alice")) {
            Err(StorageError::AlreadyExists { device_id }) => assert_eq!(device_id, "alice"),
            other => panic!("Expected AlreadyExists error, got: {:?}", other),
        }
    }

    #[test]
    fn test_delete_user_cascades() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.create_local_user(&user("alice")).unwrap();
        storage.store_peer_device(&peer_record("alice", "bob")).unwrap();
        storage.store_peer_device(&peer_record("alice2", "bob")).unwrap();
        storage.activate_session(&session(1, "alice", "bob"), 5).unwrap();
        storage.activate_session(&session(2, "alice2", "bob"), 5).unwrap();

        assert!(storage.delete_local_user("alice").unwrap());

        assert!(storage.load_peer_device("alice", "bob").unwrap().is_none());
        assert!(storage.load_local_sessions("alice").unwrap().is_empty());
        assert!(storage.load_peer_device("alice2", "bob").unwrap().is_some());
        assert_eq!(storage.load_local_sessions("alice2").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_peer_across_users() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.store_peer_device(&peer_record("alice", "bob")).unwrap();
        storage.store_peer_device(&peer_record("carol", "bob")).unwrap();
        storage.store_peer_device(&peer_record("carol", "bobby")).unwrap();
        storage.activate_session(&session(1, "alice", "bob"), 5).unwrap();
        storage.activate_session(&session(2, "carol", "bobby"), 5).unwrap();

        assert_eq!(storage.delete_peer_device("bob").unwrap(), 2);

        assert!(storage.load_peer_device("carol", "bob").unwrap().is_none());
        assert!(storage.load_peer_device("carol", "bobby").unwrap().is_some());
        assert!(storage.load_sessions("alice", "bob").unwrap().is_empty());
        assert_eq!(storage.load_sessions("carol", "bobby").unwrap().len(), 1);
    }

    #[test]
    fn test_activate_and_expire_sessions() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        storage.activate_session(&session(2, "alice", "bob"), 20).unwrap();

        let sessions = storage.load_sessions("alice", "bob").unwrap();
        assert_eq!(sessions.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(sessions[1].staled_at, Some(20));

        assert_eq!(storage.stale_sessions("alice", "bob", 30).unwrap(), 1);
        assert_eq!(storage.delete_stale_sessions("alice", 25).unwrap(), 1);

        let remaining = storage.load_sessions("alice", "bob").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
        assert!(!remaining[0].active);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.create_local_user(&user("alice")).unwrap();
            storage.store_peer_device(&peer_record("alice", "bob")).unwrap();
            storage.activate_session(&session(1, "alice", "bob"), 10).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.list_local_users().unwrap(), vec!["alice".to_string()]);
        assert_eq!(
            storage.load_peer_device("alice", "bob").unwrap(),
            Some(peer_record("alice", "bob"))
        );

        let sessions = storage.load_sessions("alice", "bob").unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].active);
    }
}
