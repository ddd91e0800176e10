//! Manager configuration.
//!
//! Every tunable of prekey inventory, session lifetime and ratchet bounds.
//! Durations are in seconds because they are compared against persisted Unix
//! timestamps.

use serde::{Deserialize, Serialize};
use tessera_crypto::{
    RatchetLimits,
    ratchet::{MAX_MESSAGE_SKIP, MAX_SENDING_CHAIN},
};

use crate::policy::EncryptionPolicy;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// One-time prekeys generated when a user is created
    pub initial_one_time_prekeys: u16,
    /// One-time prekeys generated per replenishment
    pub one_time_prekey_batch: u16,
    /// Replenish when the server holds fewer one-time prekeys than this
    pub one_time_prekey_low_limit: u16,
    /// Age at which the signed prekey is rotated
    pub signed_prekey_lifetime_secs: u64,
    /// How long a superseded signed prekey is kept for in-flight messages
    pub signed_prekey_limbo_secs: u64,
    /// How long a stale session is kept for in-flight messages
    pub session_limbo_secs: u64,
    /// Maximum message keys derived ahead for one gap
    pub max_message_skip: u16,
    /// Messages one sending chain may carry before the session is replaced
    pub max_sending_chain: u16,
    /// Messages received on later chains after which skipped keys are dropped
    pub max_messages_received_after_skip: u16,
    /// Policy used when a call does not pick one
    pub default_policy: EncryptionPolicy,
}

impl ManagerConfig {
    /// How long a one-time prekey the server handed out is kept.
    ///
    /// The peer may have fetched it just before the signed prekey it came
    /// with was rotated, so it lives as long as that signed prekey can.
    pub fn one_time_prekey_limbo_secs(&self) -> u64 {
        self.signed_prekey_lifetime_secs + self.signed_prekey_limbo_secs
    }

    /// Ratchet bounds derived from this configuration.
    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits { max_skip: self.max_message_skip, max_sending_chain: self.max_sending_chain }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            initial_one_time_prekeys: 100,
            one_time_prekey_batch: 25,
            one_time_prekey_low_limit: 100,
            signed_prekey_lifetime_secs: 7 * DAY_SECS,
            signed_prekey_limbo_secs: 30 * DAY_SECS,
            session_limbo_secs: 30 * DAY_SECS,
            max_message_skip: MAX_MESSAGE_SKIP,
            max_sending_chain: MAX_SENDING_CHAIN,
            max_messages_received_after_skip: 64,
            default_policy: EncryptionPolicy::OptimizeUploadSize,
        }
    }
}
