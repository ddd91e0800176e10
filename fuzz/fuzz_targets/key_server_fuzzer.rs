//! Fuzz target for the key server
//!
//! Drives one server with a mix of well-formed and raw requests from a small
//! set of senders.
//!
//! # Invariants
//!
//! - Every request is answered with status 200 and a decodable message
//! - A one-time prekey id is served at most once per publication
//! - No device holds more one-time prekeys than the registry limit
//! - Requests never panic the server

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_crypto::CurveId;
use tessera_proto::{KeyServerRequest, KeyServerResponse, OneTimePrekey, SignedPrekey};
use tessera_server::{DEFAULT_MAX_ONE_TIME_PREKEYS, KeyServer, STATUS_OK};

const SENDERS: [&str; 4] = ["alice", "bob", "carol", ""];

#[derive(Debug, Arbitrary)]
enum Op {
    Raw { sender: u8, bytes: Vec<u8> },
    Register { sender: u8, p256: bool, one_time_prekeys: u8 },
    PostOneTimePrekeys { sender: u8, count: u16 },
    Fetch { sender: u8, targets: Vec<u8> },
    ListOwn { sender: u8 },
    Delete { sender: u8 },
}

fn sender(index: u8) -> &'static str {
    SENDERS[index as usize % SENDERS.len()]
}

fn curve(p256: bool) -> CurveId {
    if p256 { CurveId::P256 } else { CurveId::Curve25519 }
}

struct Driver {
    server: KeyServer,
    next_id: u32,
    served: HashSet<(String, u32)>,
}

impl Driver {
    /// Curve the device registered with, curve A for unknown devices.
    fn curve_of(&self, device: &str) -> CurveId {
        self.server.registry().device(device).map_or(CurveId::Curve25519, |entry| entry.curve)
    }

    fn one_time_prekeys(&mut self, curve: CurveId, count: usize) -> Vec<OneTimePrekey> {
        (0..count)
            .map(|_| {
                self.next_id = self.next_id.wrapping_add(1);
                OneTimePrekey { public_key: vec![4; curve.dh_public_len()], id: self.next_id }
            })
            .collect()
    }

    fn send(&mut self, from: &str, curve: CurveId, request: &KeyServerRequest) {
        let Ok(body) = request.encode(curve) else {
            return;
        };
        let (status, answer) = self.server.handle(from, &body);
        assert_eq!(status, STATUS_OK);

        let response = KeyServerResponse::decode(&answer, curve).expect("answer decodes");
        if let KeyServerResponse::PeerBundles(bundles) = response {
            for peer in bundles {
                let Some(key) = peer.bundle.and_then(|bundle| bundle.one_time_prekey) else {
                    continue;
                };
                assert!(
                    self.served.insert((peer.device_id.clone(), key.id)),
                    "one-time prekey {} of {} served twice",
                    key.id,
                    peer.device_id
                );
            }
        }
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let mut driver = Driver { server: KeyServer::new(), next_id: 0, served: HashSet::new() };

    for op in ops {
        match op {
            Op::Raw { sender: index, bytes } => {
                let (status, answer) = driver.server.handle(sender(index), &bytes);
                assert_eq!(status, STATUS_OK);
                assert!(!answer.is_empty());
            },
            Op::Register { sender: index, p256, one_time_prekeys } => {
                let curve = curve(p256);
                let keys = driver.one_time_prekeys(curve, usize::from(one_time_prekeys));
                let request = KeyServerRequest::RegisterUser {
                    identity_key: vec![1; curve.identity_key_len()],
                    signed_prekey: SignedPrekey {
                        public_key: vec![2; curve.dh_public_len()],
                        signature: vec![3; curve.signature_len()],
                        id: 1,
                    },
                    one_time_prekeys: keys,
                };
                driver.send(sender(index), curve, &request);
            },
            Op::PostOneTimePrekeys { sender: index, count } => {
                let from = sender(index);
                let curve = driver.curve_of(from);
                let keys = driver.one_time_prekeys(curve, usize::from(count % 600));
                driver.send(from, curve, &KeyServerRequest::PostOneTimePrekeys(keys));
            },
            Op::Fetch { sender: index, targets } => {
                let from = sender(index);
                let curve = driver.curve_of(from);
                let targets = targets.into_iter().map(|t| sender(t).to_string()).collect();
                driver.send(from, curve, &KeyServerRequest::GetPeerBundles(targets));
            },
            Op::ListOwn { sender: index } => {
                let from = sender(index);
                let curve = driver.curve_of(from);
                driver.send(from, curve, &KeyServerRequest::GetSelfOneTimePrekeys);
            },
            Op::Delete { sender: index } => {
                driver.send(sender(index), CurveId::P256, &KeyServerRequest::DeleteUser);
            },
        }

        for device in SENDERS {
            if let Some(entry) = driver.server.registry().device(device) {
                let held = driver
                    .server
                    .registry()
                    .one_time_prekey_ids(device, entry.curve)
                    .map_or(0, |ids| ids.len());
                assert!(held <= DEFAULT_MAX_ONE_TIME_PREKEYS);
            }
        }
    }
});
