//! Prekey inventory of local users.
//!
//! Generates identity, signed and one-time prekeys from the environment's
//! randomness, rotates the signed prekey, and reconciles one-time prekeys
//! with what the key server reports it still holds.
//!
//! # Lifetimes
//!
//! ```text
//! signed prekey:   active ──(lifetime)──> superseded ──(limbo)──> deleted
//! one-time prekey: on server ──(handed out)──> dispatched ──(limbo)──> deleted
//!                        └──────────(first message consumed it)──────> deleted
//! ```
//!
//! Keys in limbo stay decryptable so messages already in flight when the
//! server stopped advertising them still open.

use tessera_crypto::{CryptoError, CurveId, DhKeyPair, IdentityKeyPair};
use tessera_proto::{KeyServerRequest, OneTimePrekey, SignedPrekey};

use crate::{
    config::ManagerConfig,
    env::Environment,
    error::CoreError,
    storage::{LocalUserRecord, OneTimePrekeyRecord, SignedPrekeyRecord},
};

/// Seeds tried before key generation gives up. P-256 rejects roughly one
/// seed in 2^32, so a second attempt is already unusual.
const MAX_KEYGEN_ATTEMPTS: u32 = 8;

/// Outcome of a reconciliation with the server's one-time prekey list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciliation {
    /// Keys newly seen as handed out by the server
    pub dispatched: usize,
    /// Dispatched keys dropped after their limbo
    pub expired: usize,
    /// Keys to generate and post now
    pub to_generate: u16,
}

impl SignedPrekeyRecord {
    /// Public part as published.
    pub fn to_wire(&self) -> SignedPrekey {
        SignedPrekey {
            public_key: self.keypair.public_key().to_vec(),
            signature: self.signature.clone(),
            id: self.id,
        }
    }
}

impl OneTimePrekeyRecord {
    /// Public part as published.
    pub fn to_wire(&self) -> OneTimePrekey {
        OneTimePrekey { public_key: self.keypair.public_key().to_vec(), id: self.id }
    }
}

/// Create a local user with a fresh identity, signed prekey and
/// `one_time_prekeys` one-time prekeys.
pub fn new_local_user<E: Environment>(
    env: &E,
    device_id: &str,
    key_server_url: &str,
    curve: CurveId,
    one_time_prekeys: u16,
) -> Result<LocalUserRecord, CoreError> {
    let identity = generate(|| IdentityKeyPair::from_seed(curve, env.random_seed()))?;
    let now = env.wall_clock_secs();

    let mut user = LocalUserRecord {
        device_id: device_id.to_string(),
        identity,
        key_server_url: key_server_url.to_string(),
        signed_prekeys: Vec::new(),
        one_time_prekeys: Vec::new(),
    };
    let signed_prekey = new_signed_prekey(env, &user, now)?;
    user.signed_prekeys.push(signed_prekey);
    generate_one_time_prekeys(env, &mut user, one_time_prekeys)?;

    Ok(user)
}

/// The registerUser request publishing `user` with the given one-time
/// prekeys.
pub fn register_request(
    user: &LocalUserRecord,
    one_time_prekeys: Vec<OneTimePrekey>,
) -> Result<KeyServerRequest, CoreError> {
    let signed_prekey = user
        .active_signed_prekey()
        .ok_or_else(|| CoreError::NoActiveSignedPrekey(user.device_id.clone()))?;

    Ok(KeyServerRequest::RegisterUser {
        identity_key: user.identity.public_key().to_vec(),
        signed_prekey: signed_prekey.to_wire(),
        one_time_prekeys,
    })
}

/// Append `count` fresh one-time prekeys to `user`.
///
/// Returns their public parts, ready to post.
pub fn generate_one_time_prekeys<E: Environment>(
    env: &E,
    user: &mut LocalUserRecord,
    count: u16,
) -> Result<Vec<OneTimePrekey>, CoreError> {
    let curve = user.curve();
    let mut published = Vec::with_capacity(usize::from(count));

    for _ in 0..count {
        let id = unique_id(env, |id| user.one_time_prekeys.iter().any(|opk| opk.id == id));
        let keypair = generate(|| DhKeyPair::from_seed(curve, env.random_seed()))?;
        let record = OneTimePrekeyRecord { id, keypair, dispatched_at: None };
        published.push(record.to_wire());
        user.one_time_prekeys.push(record);
    }

    Ok(published)
}

/// Replace the active signed prekey if it outlived its lifetime.
///
/// Returns the new signed prekey to post, or `None` if rotation was not due.
pub fn rotate_signed_prekey<E: Environment>(
    env: &E,
    user: &mut LocalUserRecord,
    now: u64,
    config: &ManagerConfig,
) -> Result<Option<SignedPrekey>, CoreError> {
    let due = user
        .active_signed_prekey()
        .is_none_or(|spk| spk.created_at + config.signed_prekey_lifetime_secs <= now);
    if !due {
        return Ok(None);
    }

    let fresh = new_signed_prekey(env, user, now)?;
    for spk in &mut user.signed_prekeys {
        if spk.superseded_at.is_none() {
            spk.superseded_at = Some(now);
        }
    }
    let published = fresh.to_wire();
    user.signed_prekeys.insert(0, fresh);

    tracing::debug!(user = %user.device_id, id = published.id, "signed prekey rotated");
    Ok(Some(published))
}

/// Drop superseded signed prekeys older than their limbo.
///
/// Returns the number removed.
pub fn sweep_signed_prekeys(user: &mut LocalUserRecord, now: u64, config: &ManagerConfig) -> usize {
    let before = user.signed_prekeys.len();
    user.signed_prekeys.retain(|spk| {
        spk.superseded_at.is_none_or(|at| at + config.signed_prekey_limbo_secs > now)
    });
    before - user.signed_prekeys.len()
}

/// Align local one-time prekeys with the ids the server still holds.
///
/// Local keys missing from the server were handed out: they are marked
/// dispatched and deleted once older than the one-time prekey limbo. When the
/// server holds fewer keys than the low limit, the result asks for
/// `max(batch, low_limit - held)` new ones.
pub fn reconcile_one_time_prekeys(
    user: &mut LocalUserRecord,
    server_ids: &[u32],
    now: u64,
    config: &ManagerConfig,
) -> Reconciliation {
    let mut outcome = Reconciliation::default();

    for opk in &mut user.one_time_prekeys {
        if opk.dispatched_at.is_none() && !server_ids.contains(&opk.id) {
            opk.dispatched_at = Some(now);
            outcome.dispatched += 1;
        }
    }

    let limbo = config.one_time_prekey_limbo_secs();
    let before = user.one_time_prekeys.len();
    user.one_time_prekeys.retain(|opk| opk.dispatched_at.is_none_or(|at| at + limbo > now));
    outcome.expired = before - user.one_time_prekeys.len();

    let held = u16::try_from(server_ids.len()).unwrap_or(u16::MAX);
    if held < config.one_time_prekey_low_limit {
        outcome.to_generate =
            config.one_time_prekey_batch.max(config.one_time_prekey_low_limit - held);
    }

    outcome
}

/// Fresh key pair for an ephemeral or ratchet key.
pub fn generate_dh_keypair<E: Environment>(
    env: &E,
    curve: CurveId,
) -> Result<DhKeyPair, CoreError> {
    generate(|| DhKeyPair::from_seed(curve, env.random_seed()))
}

/// Mark every undispatched one-time prekey as dispatched at `now`.
///
/// Used when the server lost the user: nothing it held can be fetched any
/// more, but peers may already have fetched some.
pub fn dispatch_all_one_time_prekeys(user: &mut LocalUserRecord, now: u64) {
    for opk in &mut user.one_time_prekeys {
        if opk.dispatched_at.is_none() {
            opk.dispatched_at = Some(now);
        }
    }
}

/// Signed prekey with this id, active or in limbo.
pub fn find_signed_prekey(
    user: &LocalUserRecord,
    id: u32,
) -> Result<&SignedPrekeyRecord, CoreError> {
    user.signed_prekeys
        .iter()
        .find(|spk| spk.id == id)
        .ok_or(CoreError::UnknownSignedPrekey(id))
}

/// Remove and return the one-time prekey with this id. One-time prekeys are
/// single use.
pub fn take_one_time_prekey(
    user: &mut LocalUserRecord,
    id: u32,
) -> Result<OneTimePrekeyRecord, CoreError> {
    let position = user
        .one_time_prekeys
        .iter()
        .position(|opk| opk.id == id)
        .ok_or(CoreError::UnknownOneTimePrekey(id))?;
    Ok(user.one_time_prekeys.remove(position))
}

fn new_signed_prekey<E: Environment>(
    env: &E,
    user: &LocalUserRecord,
    now: u64,
) -> Result<SignedPrekeyRecord, CoreError> {
    let id = unique_id(env, |id| user.signed_prekeys.iter().any(|spk| spk.id == id));
    let keypair = generate(|| DhKeyPair::from_seed(user.curve(), env.random_seed()))?;
    let signature = user.identity.sign(keypair.public_key())?;

    Ok(SignedPrekeyRecord { id, keypair, signature, created_at: now, superseded_at: None })
}

/// Retry key derivation on rejected seeds.
fn generate<T>(mut derive: impl FnMut() -> Result<T, CryptoError>) -> Result<T, CoreError> {
    for _ in 0..MAX_KEYGEN_ATTEMPTS {
        match derive() {
            Ok(key) => return Ok(key),
            Err(CryptoError::InvalidKey { .. }) => {},
            Err(other) => return Err(other.into()),
        }
    }
    Err(CoreError::KeyGeneration { attempts: MAX_KEYGEN_ATTEMPTS })
}

/// Random id not already in use.
fn unique_id<E: Environment>(env: &E, taken: impl Fn(u32) -> bool) -> u32 {
    loop {
        let id = env.random_u32();
        if !taken(id) {
            return id;
        }
    }
}
