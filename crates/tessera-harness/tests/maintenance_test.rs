//! Update runs: one-time prekey replenishment, signed prekey rotation,
//! session expiry and recovery from a key server that lost its users.

use tessera_client::{Completion, CurveId, EncryptOutput, ManagerError, ManagerEvent};
use tessera_harness::SimNetwork;

const URL: &str = "https://keys.sim";
const CHAT: &[u8] = b"maintenance";

fn network(devices: &[&str]) -> SimNetwork {
    let mut network = SimNetwork::new(11);
    network.add_server(URL);
    for device in devices {
        network.add_node(device);
        network.create_user(device, device, URL, CurveId::Curve25519).unwrap();
    }
    network.deliver_all().unwrap();
    network
}

fn server_one_time_prekeys(network: &SimNetwork, device: &str) -> usize {
    network
        .server(URL)
        .unwrap()
        .registry()
        .one_time_prekey_ids(device, CurveId::Curve25519)
        .unwrap()
        .len()
}

fn server_signed_prekey_id(network: &SimNetwork, device: &str) -> u32 {
    network.server(URL).unwrap().registry().device(device).unwrap().signed_prekey.id
}

fn update(network: &mut SimNetwork, node: &str) -> Completion {
    network.run(node, |request| ManagerEvent::Update { request }).unwrap()
}

fn send(network: &mut SimNetwork, local: &str, peer: &str, plaintext: &[u8]) -> EncryptOutput {
    let request = network.encrypt(local, local, CHAT, &[peer], plaintext, None).unwrap();
    network.deliver_all().unwrap();
    match network.completion(local, request) {
        Some(Completion::Encrypt(Ok(output))) => output.clone(),
        other => panic!("expected a successful encryption, got {other:?}"),
    }
}

fn receive(
    network: &SimNetwork,
    local: &str,
    sender: &str,
    output: &EncryptOutput,
) -> Result<Vec<u8>, ManagerError> {
    let envelope = &output.recipient(local).unwrap().envelope;
    network
        .manager(local)
        .unwrap()
        .decrypt(local, CHAT, sender, envelope, output.shared_ciphertext.as_deref())
        .map(|output| output.plaintext)
}

#[test]
fn update_with_nothing_to_do() {
    let mut network = network(&["alice"]);

    assert_eq!(update(&mut network, "alice"), Completion::Update(Ok(())));
    assert_eq!(server_one_time_prekeys(&network, "alice"), 100);
}

#[test]
fn update_without_users_completes_at_once() {
    let mut network = network(&[]);
    network.add_node("empty");

    let request = network.update("empty").unwrap();

    assert!(network.in_flight().is_empty());
    assert_eq!(network.completion("empty", request), Some(&Completion::Update(Ok(()))));
}

#[test]
fn consumed_one_time_prekeys_are_replenished() {
    let mut network = network(&["alice", "bob"]);
    let hello = send(&mut network, "bob", "alice", b"hello");
    assert_eq!(server_one_time_prekeys(&network, "alice"), 99);

    assert_eq!(update(&mut network, "alice"), Completion::Update(Ok(())));

    assert_eq!(server_one_time_prekeys(&network, "alice"), 124);
    // The consumed key is still held locally until it is used or expires
    assert_eq!(receive(&network, "alice", "bob", &hello).unwrap(), b"hello");
}

#[test]
fn signed_prekey_rotates_and_old_one_lingers() {
    let mut network = network(&["alice", "bob", "carol"]);
    let original = server_signed_prekey_id(&network, "bob");

    let from_alice = send(&mut network, "alice", "bob", b"before rotation");
    let from_carol = send(&mut network, "carol", "bob", b"long forgotten");

    network.env().advance_days(8);
    assert_eq!(update(&mut network, "bob"), Completion::Update(Ok(())));
    let rotated = server_signed_prekey_id(&network, "bob");
    assert_ne!(rotated, original);

    // Within the limbo the superseded key still opens sessions
    assert_eq!(receive(&network, "bob", "alice", &from_alice).unwrap(), b"before rotation");

    network.env().advance_days(31);
    assert_eq!(update(&mut network, "bob"), Completion::Update(Ok(())));
    assert_ne!(server_signed_prekey_id(&network, "bob"), rotated);

    let expired = receive(&network, "bob", "carol", &from_carol);
    assert!(matches!(expired, Err(ManagerError::AuthenticationFailure { .. })));
}

#[test]
fn new_users_fetch_the_rotated_signed_prekey() {
    let mut network = network(&["alice", "bob"]);

    network.env().advance_days(8);
    assert_eq!(update(&mut network, "bob"), Completion::Update(Ok(())));

    let hello = send(&mut network, "alice", "bob", b"hello");
    assert_eq!(receive(&network, "bob", "alice", &hello).unwrap(), b"hello");
}

#[test]
fn stale_sessions_expire_after_limbo() {
    let mut network = network(&["alice", "bob"]);
    let first = send(&mut network, "alice", "bob", b"first");
    let second = send(&mut network, "alice", "bob", b"second");
    let third = send(&mut network, "alice", "bob", b"third");
    receive(&network, "bob", "alice", &first).unwrap();

    network.manager("bob").unwrap().stale_sessions("bob", "alice").unwrap();

    // A stale session still decrypts
    assert_eq!(receive(&network, "bob", "alice", &second).unwrap(), b"second");
    network.manager("bob").unwrap().stale_sessions("bob", "alice").unwrap();

    network.env().advance_days(31);
    assert_eq!(update(&mut network, "bob"), Completion::Update(Ok(())));

    let late = receive(&network, "bob", "alice", &third);
    assert!(matches!(late, Err(ManagerError::AuthenticationFailure { .. })));
}

#[test]
fn lost_registration_is_restored() {
    let mut network = network(&["alice", "bob"]);
    let alice_key = network.manager("alice").unwrap().self_identity_key("alice").unwrap();

    // The key server comes back empty
    network.add_server(URL);
    assert!(!network.server(URL).unwrap().registry().contains("alice"));

    assert_eq!(update(&mut network, "alice"), Completion::Update(Ok(())));
    assert_eq!(update(&mut network, "bob"), Completion::Update(Ok(())));

    let registry = network.server(URL).unwrap().registry().clone();
    assert_eq!(registry.device("alice").unwrap().identity_key, alice_key);
    assert_eq!(server_one_time_prekeys(&network, "alice"), 100);

    let hello = send(&mut network, "bob", "alice", b"hello again");
    assert_eq!(receive(&network, "alice", "bob", &hello).unwrap(), b"hello again");
}

#[test]
fn unreachable_server_fails_the_update() {
    let mut network = network(&["alice"]);
    network.remove_server(URL);

    let completion = update(&mut network, "alice");

    assert!(matches!(
        completion,
        Completion::Update(Err(ManagerError::KeyServer { code: None, .. }))
    ));

    // The next run recovers once the server is back
    network.add_server(URL);
    assert_eq!(update(&mut network, "alice"), Completion::Update(Ok(())));
}

#[test]
fn update_survives_a_deleted_user() {
    let mut network = network(&["alice"]);

    let update_request = network.update("alice").unwrap();
    let deletion = network.delete_user("alice", "alice").unwrap();
    network.deliver_all().unwrap();

    assert_eq!(network.completion("alice", deletion), Some(&Completion::DeleteUser(Ok(()))));
    assert!(network.completion("alice", update_request).is_some());
    assert_eq!(network.manager("alice").unwrap().outstanding_posts(), 0);
}
