//! Fuzz target for the encryption manager's untrusted inputs
//!
//! The manager consumes two kinds of bytes it cannot vouch for: envelopes
//! from peers and answers from the key server. This fuzzer interleaves both
//! with regular operations.
//!
//! # Invariants
//!
//! - Neither decrypt nor a server answer ever panics
//! - A garbage envelope never creates a peer record
//! - Every ticket is resolved at most once; unknown tickets are ignored
//! - Every request id completes at most once

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_client::{Manager, ManagerAction, ManagerConfig, ManagerEvent, PeerDeviceStatus};
use tessera_core::{MemoryStorage, env::test_utils::MockEnv};
use tessera_crypto::CurveId;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    p256: bool,
    ops: Vec<Op>,
}

#[derive(Debug, Arbitrary)]
enum Op {
    Decrypt { envelope: Vec<u8>, shared: Option<Vec<u8>> },
    Answer { post: u8, status: u16, body: Vec<u8> },
    Fail { post: u8 },
    Encrypt { recipients: Vec<u8>, plaintext: Vec<u8> },
    Update,
}

const PEERS: [&str; 3] = ["bob", "carol", "dave"];

fuzz_target!(|scenario: Scenario| {
    let config = ManagerConfig { initial_one_time_prekeys: 2, ..ManagerConfig::default() };
    let mut manager =
        Manager::new(MockEnv::with_seed(scenario.seed), MemoryStorage::new(), config);
    let curve = if scenario.p256 { CurveId::P256 } else { CurveId::Curve25519 };

    let mut tickets = Vec::new();
    let mut completed = HashSet::new();
    let mut next_request = 0u64;

    let mut record = |actions: Vec<ManagerAction>, tickets: &mut Vec<u64>| {
        for action in actions {
            match action {
                ManagerAction::Post { ticket, .. } => tickets.push(ticket),
                ManagerAction::Completed { request, .. } => {
                    assert!(completed.insert(request), "request {request} completed twice");
                },
            }
        }
    };

    let created = manager.handle(ManagerEvent::CreateUser {
        request: next_request,
        device_id: "alice".to_string(),
        key_server_url: "https://keys.fuzz".to_string(),
        curve,
        one_time_prekeys: None,
    });
    next_request += 1;
    record(created.expect("first user is created"), &mut tickets);

    for op in scenario.ops {
        match op {
            Op::Decrypt { envelope, shared } => {
                for sender in PEERS {
                    let before = manager.peer_device_status("alice", sender);
                    let result =
                        manager.decrypt("alice", b"fuzz", sender, &envelope, shared.as_deref());
                    if result.is_err() {
                        assert_eq!(manager.peer_device_status("alice", sender), before);
                    }
                    if before == Ok(PeerDeviceStatus::Unknown) {
                        // Nothing was ever encrypted to alice, so nothing can decrypt
                        assert!(result.is_err());
                    }
                }
            },
            Op::Answer { post, status, body } => {
                if tickets.is_empty() {
                    continue;
                }
                let ticket = tickets.remove(usize::from(post) % tickets.len());
                let event = ManagerEvent::ServerResponse { ticket, status, body };
                if let Ok(actions) = manager.handle(event.clone()) {
                    record(actions, &mut tickets);
                }
                assert_eq!(manager.handle(event).ok(), Some(Vec::new()));
            },
            Op::Fail { post } => {
                if tickets.is_empty() {
                    continue;
                }
                let ticket = tickets.remove(usize::from(post) % tickets.len());
                let event = ManagerEvent::TransportFailed { ticket, reason: "fuzz".to_string() };
                if let Ok(actions) = manager.handle(event) {
                    record(actions, &mut tickets);
                }
            },
            Op::Encrypt { recipients, plaintext } => {
                let recipients = recipients
                    .iter()
                    .map(|r| PEERS[usize::from(*r) % PEERS.len()].to_string())
                    .collect();
                let event = ManagerEvent::Encrypt {
                    request: next_request,
                    local_device_id: "alice".to_string(),
                    associated_id: b"fuzz".to_vec(),
                    recipients,
                    plaintext,
                    policy: None,
                };
                next_request += 1;
                if let Ok(actions) = manager.handle(event) {
                    record(actions, &mut tickets);
                }
            },
            Op::Update => {
                let event = ManagerEvent::Update { request: next_request };
                next_request += 1;
                if let Ok(actions) = manager.handle(event) {
                    record(actions, &mut tickets);
                }
            },
        }

        assert_eq!(manager.outstanding_posts(), tickets.len());
    }
});
