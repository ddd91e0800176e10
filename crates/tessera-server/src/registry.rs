//! Device registry for published key material.
//!
//! Holds, per registered device, the identity key, the current signed prekey
//! and a queue of one-time prekeys. One-time prekeys are consumed (removed)
//! when a bundle is handed out, so each is served at most once.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tessera_crypto::CurveId;
use tessera_proto::{KeyBundle, OneTimePrekey, SignedPrekey};

use crate::error::KeyServerError;

/// Default maximum number of one-time prekeys held per device.
pub const DEFAULT_MAX_ONE_TIME_PREKEYS: usize = 500;

/// Key material published by one device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Curve the device registered with.
    pub curve: CurveId,
    /// Identity public key.
    pub identity_key: Vec<u8>,
    /// Current signed prekey.
    pub signed_prekey: SignedPrekey,
    /// Unserved one-time prekeys, oldest first.
    one_time_prekeys: VecDeque<OneTimePrekey>,
}

/// In-memory registry of devices.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying storage.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

struct RegistryInner {
    devices: HashMap<String, DeviceEntry>,
    max_one_time_prekeys: usize,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry with the default per-device prekey limit.
    pub fn new() -> Self {
        Self::with_one_time_prekey_limit(DEFAULT_MAX_ONE_TIME_PREKEYS)
    }

    /// Create an empty registry holding at most `limit` one-time prekeys per
    /// device.
    pub fn with_one_time_prekey_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                devices: HashMap::new(),
                max_one_time_prekeys: limit,
            })),
        }
    }

    /// Register a device with its initial key material.
    pub fn register(
        &self,
        device_id: &str,
        curve: CurveId,
        identity_key: Vec<u8>,
        signed_prekey: SignedPrekey,
        one_time_prekeys: Vec<OneTimePrekey>,
    ) -> Result<(), KeyServerError> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");

        if inner.devices.contains_key(device_id) {
            return Err(KeyServerError::UserAlreadyIn(device_id.to_string()));
        }
        if one_time_prekeys.len() > inner.max_one_time_prekeys {
            return Err(KeyServerError::ResourceLimitReached {
                device: device_id.to_string(),
                requested: one_time_prekeys.len(),
                limit: inner.max_one_time_prekeys,
            });
        }

        inner.devices.insert(
            device_id.to_string(),
            DeviceEntry {
                curve,
                identity_key,
                signed_prekey,
                one_time_prekeys: one_time_prekeys.into(),
            },
        );
        Ok(())
    }

    /// Remove a device and everything it published.
    pub fn remove(&self, device_id: &str, curve: CurveId) -> Result<(), KeyServerError> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        check_sender(&inner.devices, device_id, curve)?;
        inner.devices.remove(device_id);
        Ok(())
    }

    /// Replace a device's signed prekey.
    pub fn set_signed_prekey(
        &self,
        device_id: &str,
        curve: CurveId,
        signed_prekey: SignedPrekey,
    ) -> Result<(), KeyServerError> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let entry = sender_mut(&mut inner.devices, device_id, curve)?;
        entry.signed_prekey = signed_prekey;
        Ok(())
    }

    /// Append one-time prekeys to a device's queue.
    pub fn add_one_time_prekeys(
        &self,
        device_id: &str,
        curve: CurveId,
        keys: Vec<OneTimePrekey>,
    ) -> Result<(), KeyServerError> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let limit = inner.max_one_time_prekeys;
        let entry = sender_mut(&mut inner.devices, device_id, curve)?;

        let requested = entry.one_time_prekeys.len() + keys.len();
        if requested > limit {
            return Err(KeyServerError::ResourceLimitReached {
                device: device_id.to_string(),
                requested,
                limit,
            });
        }
        entry.one_time_prekeys.extend(keys);
        Ok(())
    }

    /// Ids of the one-time prekeys still held for a device.
    pub fn one_time_prekey_ids(
        &self,
        device_id: &str,
        curve: CurveId,
    ) -> Result<Vec<u32>, KeyServerError> {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let entry = check_sender(&inner.devices, device_id, curve)?;
        Ok(entry.one_time_prekeys.iter().map(|key| key.id).collect())
    }

    /// Hand out the bundle of `device_id` to a requester on `curve`,
    /// consuming its oldest one-time prekey.
    ///
    /// Returns `None` if the device is unknown or registered on another
    /// curve.
    pub fn take_bundle(&self, device_id: &str, curve: CurveId) -> Option<KeyBundle> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");

        let entry = inner.devices.get_mut(device_id).filter(|entry| entry.curve == curve)?;
        Some(KeyBundle {
            identity_key: entry.identity_key.clone(),
            signed_prekey: entry.signed_prekey.clone(),
            one_time_prekey: entry.one_time_prekeys.pop_front(),
        })
    }

    /// Check if a device is registered.
    pub fn contains(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        inner.devices.contains_key(device_id)
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        inner.devices.len()
    }

    /// Snapshot of a device's entry.
    pub fn device(&self, device_id: &str) -> Option<DeviceEntry> {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        inner.devices.get(device_id).cloned()
    }
}

fn check_sender<'a>(
    devices: &'a HashMap<String, DeviceEntry>,
    device_id: &str,
    curve: CurveId,
) -> Result<&'a DeviceEntry, KeyServerError> {
    let entry =
        devices.get(device_id).ok_or_else(|| KeyServerError::UserNotFound(device_id.to_string()))?;
    if entry.curve != curve {
        return Err(KeyServerError::BadCurve {
            device: device_id.to_string(),
            expected: entry.curve.wire_id(),
            actual: curve.wire_id(),
        });
    }
    Ok(entry)
}

fn sender_mut<'a>(
    devices: &'a mut HashMap<String, DeviceEntry>,
    device_id: &str,
    curve: CurveId,
) -> Result<&'a mut DeviceEntry, KeyServerError> {
    check_sender(devices, device_id, curve)?;
    devices.get_mut(device_id).ok_or_else(|| KeyServerError::UserNotFound(device_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_prekey(id: u32) -> SignedPrekey {
        SignedPrekey { public_key: vec![id as u8; 32], signature: vec![7; 64], id }
    }

    fn one_time_prekeys(ids: std::ops::Range<u32>) -> Vec<OneTimePrekey> {
        ids.map(|id| OneTimePrekey { public_key: vec![id as u8; 32], id }).collect()
    }

    fn register(registry: &DeviceRegistry, device_id: &str, keys: Vec<OneTimePrekey>) {
        registry
            .register(device_id, CurveId::Curve25519, vec![1; 32], signed_prekey(1), keys)
            .expect("registration should succeed");
    }

    #[test]
    fn bundle_consumes_one_time_prekeys_in_order() {
        let registry = DeviceRegistry::new();
        register(&registry, "bob", one_time_prekeys(10..12));

        let first = registry.take_bundle("bob", CurveId::Curve25519).expect("bob is registered");
        let second = registry.take_bundle("bob", CurveId::Curve25519).expect("bob is registered");
        let third = registry.take_bundle("bob", CurveId::Curve25519).expect("bob is registered");

        assert_eq!(first.one_time_prekey.map(|key| key.id), Some(10));
        assert_eq!(second.one_time_prekey.map(|key| key.id), Some(11));
        // Exhausted: the bundle is still served, without a one-time prekey
        assert!(third.one_time_prekey.is_none());
        assert_eq!(third.signed_prekey, signed_prekey(1));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = DeviceRegistry::new();
        register(&registry, "bob", Vec::new());

        let result =
            registry.register("bob", CurveId::Curve25519, vec![2; 32], signed_prekey(2), vec![]);

        assert_eq!(result, Err(KeyServerError::UserAlreadyIn("bob".to_string())));
        assert_eq!(registry.device("bob").map(|entry| entry.identity_key), Some(vec![1; 32]));
    }

    #[test]
    fn other_curve_sees_no_bundle() {
        let registry = DeviceRegistry::new();
        register(&registry, "bob", one_time_prekeys(0..1));

        assert!(registry.take_bundle("bob", CurveId::P256).is_none());
        assert_eq!(registry.one_time_prekey_ids("bob", CurveId::Curve25519), Ok(vec![0]));
    }

    #[test]
    fn sender_curve_must_match_registration() {
        let registry = DeviceRegistry::new();
        register(&registry, "bob", Vec::new());

        let result = registry.remove("bob", CurveId::P256);

        assert!(matches!(result, Err(KeyServerError::BadCurve { expected: 1, actual: 2, .. })));
        assert!(registry.contains("bob"));
    }

    #[test]
    fn one_time_prekey_limit() {
        let registry = DeviceRegistry::with_one_time_prekey_limit(3);
        register(&registry, "bob", one_time_prekeys(0..2));

        let result =
            registry.add_one_time_prekeys("bob", CurveId::Curve25519, one_time_prekeys(2..4));

        assert!(matches!(
            result,
            Err(KeyServerError::ResourceLimitReached { requested: 4, limit: 3, .. })
        ));
        assert_eq!(registry.one_time_prekey_ids("bob", CurveId::Curve25519), Ok(vec![0, 1]));
    }

    #[test]
    fn remove_unknown_device() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.remove("ghost", CurveId::Curve25519),
            Err(KeyServerError::UserNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn clone_shares_state() {
        let registry1 = DeviceRegistry::new();
        let registry2 = registry1.clone();

        register(&registry1, "bob", Vec::new());

        assert!(registry2.contains("bob"));
        assert_eq!(registry2.count(), 1);
    }
}
