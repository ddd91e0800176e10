//! Property-based tests for the manager's handling of untrusted input.
//!
//! Envelopes come from peers and responses from the key server; neither may
//! crash the manager or leave it waiting forever.

use proptest::prelude::*;
use tessera_client::{
    Completion, CurveId, Manager, ManagerAction, ManagerConfig, ManagerEvent, PeerDeviceStatus,
};
use tessera_core::{MemoryStorage, env::test_utils::MockEnv};
use tessera_proto::{KeyServerResponse, MessageType};

fn config() -> ManagerConfig {
    ManagerConfig { initial_one_time_prekeys: 4, ..ManagerConfig::default() }
}

/// Create a user and return the ticket of its registration post.
fn create(manager: &mut Manager<MockEnv, MemoryStorage>, curve: CurveId) -> u64 {
    let actions = manager
        .handle(ManagerEvent::CreateUser {
            request: 1,
            device_id: "alice".to_string(),
            key_server_url: "https://keys.test".to_string(),
            curve,
            one_time_prekeys: None,
        })
        .expect("user should be created");
    match actions.as_slice() {
        [ManagerAction::Post { ticket, .. }] => *ticket,
        other => panic!("expected one post, got {other:?}"),
    }
}

fn registered(seed: u64, curve: CurveId) -> Manager<MockEnv, MemoryStorage> {
    let mut manager = Manager::new(MockEnv::with_seed(seed), MemoryStorage::new(), config());
    let ticket = create(&mut manager, curve);
    let body = KeyServerResponse::Ack(MessageType::RegisterUser)
        .encode(curve)
        .expect("ack should encode");
    manager
        .handle(ManagerEvent::ServerResponse { ticket, status: 200, body })
        .expect("ack should be accepted");
    manager
}

fn curve() -> impl Strategy<Value = CurveId> {
    prop_oneof![Just(CurveId::Curve25519), Just(CurveId::P256)]
}

proptest! {
    #[test]
    fn prop_arbitrary_envelopes_are_rejected(
        seed in any::<u64>(),
        curve in curve(),
        envelope in prop::collection::vec(any::<u8>(), 0..512),
        shared in prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
    ) {
        // PROPERTY: Bytes that were never encrypted to us fail to decrypt
        // and leave no trace of the claimed sender.
        let manager = registered(seed, curve);

        let result = manager.decrypt("alice", b"chat", "mallory", &envelope, shared.as_deref());

        prop_assert!(result.is_err());
        prop_assert_eq!(
            manager.peer_device_status("alice", "mallory"),
            Ok(PeerDeviceStatus::Unknown)
        );
    }

    #[test]
    fn prop_every_ticket_completes_once(
        seed in any::<u64>(),
        curve in curve(),
        status in prop_oneof![Just(200u16), 100u16..600],
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        // PROPERTY: Whatever the key server answers, the registration
        // completes exactly once, and a repeated answer is ignored.
        let mut manager = Manager::new(MockEnv::with_seed(seed), MemoryStorage::new(), config());
        let ticket = create(&mut manager, curve);

        let answer = ManagerEvent::ServerResponse { ticket, status, body };
        let actions = manager.handle(answer.clone()).expect("answer should be accepted");

        let completions: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                ManagerAction::Completed { request, completion } => Some((*request, completion)),
                ManagerAction::Post { .. } => None,
            })
            .collect();
        prop_assert_eq!(completions.len(), 1);
        prop_assert_eq!(completions[0].0, 1);
        let succeeded = matches!(completions[0].1, Completion::CreateUser(Ok(())));
        prop_assert_eq!(manager.is_user("alice"), Ok(succeeded));

        prop_assert_eq!(manager.handle(answer), Ok(Vec::new()));
        prop_assert_eq!(manager.outstanding_posts(), 0);
    }
}
