//! The async driver against an in-process key server, on a real tokio
//! runtime and the system environment.

use std::collections::HashMap;

use tessera_client::{
    CurveId, Manager, ManagerConfig, ManagerError, PeerDeviceStatus, RecipientStatus,
    runtime::{AsyncManager, KeyServerTransport, SystemEnv, TransportError},
};
use tessera_core::MemoryStorage;
use tessera_server::KeyServer;

const URL: &str = "https://keys.local";
const CHAT: &[u8] = b"runtime";

/// Routes posts to in-process key servers by URL.
#[derive(Clone, Default)]
struct InProcess {
    servers: HashMap<String, KeyServer>,
}

impl InProcess {
    fn with_server(url: &str, server: &KeyServer) -> Self {
        let mut servers = HashMap::new();
        servers.insert(url.to_string(), server.clone());
        Self { servers }
    }
}

impl KeyServerTransport for InProcess {
    async fn post(
        &self,
        url: &str,
        from: &str,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        // Answer on another task, like a network round trip would
        tokio::task::yield_now().await;
        match self.servers.get(url) {
            Some(server) => Ok(server.handle(from, &body)),
            None => Err(TransportError(format!("no route to {url}"))),
        }
    }
}

type Driver = AsyncManager<SystemEnv, MemoryStorage, InProcess>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_config() -> ManagerConfig {
    ManagerConfig {
        initial_one_time_prekeys: 10,
        one_time_prekey_batch: 5,
        one_time_prekey_low_limit: 5,
        ..ManagerConfig::default()
    }
}

fn driver(transport: InProcess) -> Driver {
    let manager = Manager::new(SystemEnv::new(), MemoryStorage::new(), small_config());
    AsyncManager::new(manager, transport)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conversation_over_async_driver() {
    init_tracing();
    let server = KeyServer::new();
    let alice = driver(InProcess::with_server(URL, &server));
    let bob = driver(InProcess::with_server(URL, &server));

    alice.create_user("alice", URL, CurveId::Curve25519).await.unwrap();
    bob.create_user("bob", URL, CurveId::Curve25519).await.unwrap();
    assert_eq!(server.registry().count(), 2);

    let output =
        alice.encrypt("alice", CHAT, &["bob".to_string()], b"hello bob", None).await.unwrap();
    assert_eq!(output.recipients[0].status, RecipientStatus::Unknown);

    let envelope = &output.recipients[0].envelope;
    let received =
        bob.decrypt("bob", CHAT, "alice", envelope, output.shared_ciphertext.as_deref()).unwrap();
    assert_eq!(received.plaintext, b"hello bob");
    assert_eq!(received.status, PeerDeviceStatus::Unknown);

    let reply =
        bob.encrypt("bob", CHAT, &["alice".to_string()], b"hello alice", None).await.unwrap();
    let envelope = &reply.recipients[0].envelope;
    let received =
        alice.decrypt("alice", CHAT, "bob", envelope, reply.shared_ciphertext.as_deref()).unwrap();
    assert_eq!(received.plaintext, b"hello alice");
    assert_eq!(received.status, PeerDeviceStatus::Untrusted);

    alice.update().await.unwrap();
    alice.delete_user("alice").await.unwrap();
    assert!(!server.registry().contains("alice"));
    assert!(!alice.is_user("alice").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_encryptions_all_complete() {
    init_tracing();
    let server = KeyServer::new();
    let alice = driver(InProcess::with_server(URL, &server));
    alice.create_user("alice", URL, CurveId::P256).await.unwrap();

    let mut peers = Vec::new();
    for index in 0..4 {
        let name = format!("peer{index}");
        let peer = driver(InProcess::with_server(URL, &server));
        peer.create_user(&name, URL, CurveId::P256).await.unwrap();
        peers.push((name, peer));
    }

    let tasks: Vec<_> = peers
        .iter()
        .map(|(name, _)| {
            let alice = alice.clone();
            let recipients = vec![name.clone()];
            tokio::spawn(async move {
                alice.encrypt("alice", CHAT, &recipients, b"broadcast", None).await
            })
        })
        .collect();

    for ((name, peer), task) in peers.iter().zip(tasks) {
        let output = task.await.unwrap().unwrap();
        let entry = output.recipient(name).unwrap();
        let received = peer
            .decrypt(name, CHAT, "alice", &entry.envelope, output.shared_ciphertext.as_deref())
            .unwrap();
        assert_eq!(received.plaintext, b"broadcast");
    }
}

#[tokio::test]
async fn unreachable_server_reports_transport_failure() {
    init_tracing();
    let alice = driver(InProcess::default());

    let result = alice.create_user("alice", URL, CurveId::Curve25519).await;

    assert!(matches!(result, Err(ManagerError::KeyServer { code: None, .. })));
    assert!(!alice.is_user("alice").unwrap());
}
