//! Trust store: per local user table of peer devices and their status.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐ first contact ┌───────────┐ set Trusted ┌─────────┐
//! │ Unknown │──────────────>│ Untrusted │────────────>│ Trusted │
//! └─────────┘               └───────────┘<────────────└─────────┘
//!      │                          │       set Untrusted    │  ↑
//!      │ set Unsafe               │ set Unsafe  set Unsafe │  │ set Trusted
//!      ↓                          ↓                        ↓  │ (matching key)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Unsafe                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unsafe is sticky: Untrusted never leaves it, and Trusted only does when
//! the supplied key matches the stored one or fills in a placeholder.
//!
//! The transition rules are the pure function [`apply_status`]; [`TrustStore`]
//! loads and persists records around it.

use serde::{Deserialize, Serialize};

use crate::{
    error::CoreError,
    storage::{PeerDeviceRecord, Storage},
};

/// Caller-visible classification of a peer device's identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerDeviceStatus {
    /// Never interacted with.
    Unknown,
    /// Key learned through the protocol, not vouched for.
    Untrusted,
    /// Key vouched for by the application.
    Trusted,
    /// Flagged by the application.
    Unsafe,
}

/// Outcome of a status change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before the call.
    pub previous: PeerDeviceStatus,
    /// Status after the call.
    pub current: PeerDeviceStatus,
}

impl StatusChange {
    /// Whether the change withdraws trust (to Untrusted or Unsafe from a
    /// different status), which invalidates the active session.
    pub fn revokes_trust(&self) -> bool {
        self.previous != self.current
            && self.previous != PeerDeviceStatus::Unknown
            && matches!(self.current, PeerDeviceStatus::Untrusted | PeerDeviceStatus::Unsafe)
    }
}

/// Apply a requested status to an existing record.
///
/// Returns the record to persist, or `None` when the request is a no-op.
///
/// # Errors
///
/// - `TrustWithoutKey`: Trusted requested without a key
/// - `IdentityKeyConflict`: Trusted requested with a key that differs from
///   the stored one
pub fn apply_status(
    local_device_id: &str,
    peer_device_id: &str,
    existing: Option<&PeerDeviceRecord>,
    requested: PeerDeviceStatus,
    identity_key: Option<&[u8]>,
) -> Result<Option<PeerDeviceRecord>, CoreError> {
    match requested {
        PeerDeviceStatus::Trusted => {
            let Some(key) = identity_key else {
                return Err(CoreError::TrustWithoutKey { peer: peer_device_id.to_string() });
            };

            if let Some(stored) = existing.and_then(|record| record.identity_key.as_deref())
                && stored != key
            {
                return Err(CoreError::IdentityKeyConflict {
                    local: local_device_id.to_string(),
                    peer: peer_device_id.to_string(),
                });
            }

            Ok(Some(PeerDeviceRecord {
                local_device_id: local_device_id.to_string(),
                device_id: peer_device_id.to_string(),
                identity_key: Some(key.to_vec()),
                status: PeerDeviceStatus::Trusted,
            }))
        },
        PeerDeviceStatus::Untrusted => match existing {
            None => Ok(None),
            Some(record) if record.status == PeerDeviceStatus::Unsafe => Ok(None),
            Some(record) => {
                Ok(Some(PeerDeviceRecord { status: PeerDeviceStatus::Untrusted, ..record.clone() }))
            },
        },
        PeerDeviceStatus::Unsafe => match existing {
            None => Ok(Some(PeerDeviceRecord {
                local_device_id: local_device_id.to_string(),
                device_id: peer_device_id.to_string(),
                identity_key: None,
                status: PeerDeviceStatus::Unsafe,
            })),
            Some(record) => {
                Ok(Some(PeerDeviceRecord { status: PeerDeviceStatus::Unsafe, ..record.clone() }))
            },
        },
        PeerDeviceStatus::Unknown => Ok(None),
    }
}

/// Trust records of every local user, on top of a [`Storage`].
#[derive(Clone)]
pub struct TrustStore<S: Storage> {
    storage: S,
}

impl<S: Storage> TrustStore<S> {
    /// Wrap a storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Current status of `peer` as seen by `local`.
    pub fn status(&self, local: &str, peer: &str) -> Result<PeerDeviceStatus, CoreError> {
        Ok(self
            .storage
            .load_peer_device(local, peer)?
            .map_or(PeerDeviceStatus::Unknown, |record| record.status))
    }

    /// Stored identity key of `peer`, `None` if unknown or a placeholder.
    pub fn identity_key(&self, local: &str, peer: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.storage.load_peer_device(local, peer)?.and_then(|record| record.identity_key))
    }

    /// Apply an explicit status request from the application.
    pub fn set_status(
        &self,
        local: &str,
        peer: &str,
        requested: PeerDeviceStatus,
        identity_key: Option<&[u8]>,
    ) -> Result<StatusChange, CoreError> {
        let existing = self.storage.load_peer_device(local, peer)?;
        let previous = existing.as_ref().map_or(PeerDeviceStatus::Unknown, |r| r.status);

        let Some(updated) = apply_status(local, peer, existing.as_ref(), requested, identity_key)?
        else {
            tracing::debug!(local, peer, ?requested, ?previous, "trust request ignored");
            return Ok(StatusChange { previous, current: previous });
        };

        self.storage.store_peer_device(&updated)?;
        tracing::debug!(local, peer, ?previous, current = ?updated.status, "trust status set");

        Ok(StatusChange { previous, current: updated.status })
    }

    /// Check that `identity_key` does not contradict the stored key.
    ///
    /// Returns the current status without writing anything.
    pub fn check_identity(
        &self,
        local: &str,
        peer: &str,
        identity_key: &[u8],
    ) -> Result<PeerDeviceStatus, CoreError> {
        match self.storage.load_peer_device(local, peer)? {
            None => Ok(PeerDeviceStatus::Unknown),
            Some(record) => {
                if record.identity_key.as_deref().is_some_and(|stored| stored != identity_key) {
                    return Err(CoreError::IdentityKeyConflict {
                        local: local.to_string(),
                        peer: peer.to_string(),
                    });
                }
                Ok(record.status)
            },
        }
    }

    /// Record a successful interaction with `peer` whose protocol material
    /// proved `identity_key`.
    ///
    /// First contact creates an Untrusted record. A placeholder key is
    /// replaced by the proven one, keeping the status. Returns the status as
    /// it was before the call.
    ///
    /// # Errors
    ///
    /// `IdentityKeyConflict` if a different key is stored.
    pub fn record_contact(
        &self,
        local: &str,
        peer: &str,
        identity_key: &[u8],
    ) -> Result<PeerDeviceStatus, CoreError> {
        match self.storage.load_peer_device(local, peer)? {
            None => {
                self.storage.store_peer_device(&PeerDeviceRecord {
                    local_device_id: local.to_string(),
                    device_id: peer.to_string(),
                    identity_key: Some(identity_key.to_vec()),
                    status: PeerDeviceStatus::Untrusted,
                })?;
                tracing::debug!(local, peer, "new peer device");
                Ok(PeerDeviceStatus::Unknown)
            },
            Some(record) => match record.identity_key.as_deref() {
                Some(stored) if stored == identity_key => Ok(record.status),
                Some(_) => Err(CoreError::IdentityKeyConflict {
                    local: local.to_string(),
                    peer: peer.to_string(),
                }),
                None => {
                    let status = record.status;
                    self.storage.store_peer_device(&PeerDeviceRecord {
                        identity_key: Some(identity_key.to_vec()),
                        ..record
                    })?;
                    tracing::debug!(local, peer, ?status, "learned identity key");
                    Ok(status)
                },
            },
        }
    }
}
