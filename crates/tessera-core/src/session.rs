//! Session store: ratchet sessions per (local user, peer device).
//!
//! At most one session of a pair is active; encryption always uses it.
//! Decryption tries the active session and then stale ones, most recently
//! staled first, and a stale session that opens a message becomes active
//! again. Stale sessions are kept for the session limbo so messages already
//! in flight when a session was replaced still decrypt.

use crate::{
    config::ManagerConfig,
    error::CoreError,
    storage::{SessionRecord, Storage},
};

/// Result of a maintenance sweep over one local user's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSweep {
    /// Stale sessions deleted after their limbo
    pub expired: usize,
    /// Skipped message keys dropped
    pub pruned_keys: usize,
}

/// Session records of every local user, on top of a [`Storage`].
#[derive(Clone)]
pub struct SessionStore<S: Storage> {
    storage: S,
}

impl<S: Storage> SessionStore<S> {
    /// Wrap a storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The active session of a pair.
    pub fn active(&self, local: &str, peer: &str) -> Result<Option<SessionRecord>, CoreError> {
        Ok(self.storage.load_sessions(local, peer)?.into_iter().find(|session| session.active))
    }

    /// Sessions to try for decryption, in order.
    pub fn decrypt_candidates(
        &self,
        local: &str,
        peer: &str,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        Ok(self.storage.load_sessions(local, peer)?)
    }

    /// Persist an advanced session without changing which one is active.
    pub fn save(&self, session: &SessionRecord) -> Result<(), CoreError> {
        Ok(self.storage.store_session(session)?)
    }

    /// Persist `session` as the active session of its pair, staling the
    /// previous one atomically.
    pub fn activate(&self, session: &SessionRecord, now: u64) -> Result<(), CoreError> {
        self.storage.activate_session(session, now)?;
        tracing::debug!(
            local = %session.local_device_id,
            peer = %session.peer_device_id,
            id = session.id,
            "session activated"
        );
        Ok(())
    }

    /// Stale the active session of a pair, so the next encryption performs a
    /// fresh key exchange.
    pub fn stale(&self, local: &str, peer: &str, now: u64) -> Result<usize, CoreError> {
        let staled = self.storage.stale_sessions(local, peer, now)?;
        if staled > 0 {
            tracing::debug!(local, peer, "session staled");
        }
        Ok(staled)
    }

    /// Delete stale sessions past their limbo and drop skipped message keys
    /// that waited too long.
    pub fn sweep(
        &self,
        local: &str,
        now: u64,
        config: &ManagerConfig,
    ) -> Result<SessionSweep, CoreError> {
        let cutoff = now.saturating_sub(config.session_limbo_secs);
        let expired = self.storage.delete_stale_sessions(local, cutoff)?;

        let mut pruned_keys = 0;
        for mut session in self.storage.load_local_sessions(local)? {
            let pruned =
                session.ratchet.prune_skipped_keys(config.max_messages_received_after_skip);
            if pruned > 0 {
                self.storage.store_session(&session)?;
                pruned_keys += pruned;
            }
        }

        Ok(SessionSweep { expired, pruned_keys })
    }
}
