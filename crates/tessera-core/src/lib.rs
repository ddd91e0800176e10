//! State layer of Tessera.
//!
//! Everything a device remembers between calls: its own keys, what it knows
//! about its peers, and the ratchet sessions it shares with them.
//!
//! - [`trust`]: peer device records and the trust state machine
//! - [`session`]: active and stale ratchet sessions per device pair
//! - [`prekeys`]: identity, signed and one-time prekey inventory
//! - [`policy`]: payload mode selection for a multi-recipient message
//! - [`storage`]: the persistence trait with in-memory and redb backends
//! - [`env`]: time and randomness, injectable for deterministic tests
//!
//! Nothing here performs I/O besides storage, and nothing is async: the
//! orchestration that talks to the key server lives in `tessera-client`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod env;
pub mod error;
pub mod policy;
pub mod prekeys;
pub mod session;
pub mod storage;
pub mod trust;

pub use config::ManagerConfig;
pub use env::Environment;
pub use error::CoreError;
pub use policy::{EncryptionPolicy, select_mode};
pub use session::{SessionStore, SessionSweep};
pub use storage::{
    LocalUserRecord, MemoryStorage, PeerDeviceRecord, PendingKeyExchange, RedbStorage,
    SessionRecord, Storage, StorageError,
};
pub use trust::{PeerDeviceStatus, StatusChange, TrustStore};
