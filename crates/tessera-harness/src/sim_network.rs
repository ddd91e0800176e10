//! Simulated key-server network.
//!
//! A [`SimNetwork`] hosts any number of nodes, each a [`Manager`] over its
//! own [`MemoryStorage`], and any number of [`KeyServer`]s addressed by URL.
//! Posts the managers produce are parked in flight until the test delivers
//! them, fails them, or lets the network deliver everything in some order.
//! This makes every interleaving of key-server answers reproducible.

use std::collections::{BTreeMap, HashMap};

use tessera_client::{
    Completion, CurveId, EncryptionPolicy, Manager, ManagerAction, ManagerConfig, ManagerError,
    ManagerEvent, RequestId, Ticket,
};
use tessera_core::MemoryStorage;
use tessera_proto::KeyServerRequest;
use tessera_server::KeyServer;

use crate::{
    SimEnv,
    invariants::{NodeSnapshot, SystemSnapshot},
};

/// A post waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    /// Node that produced the post.
    pub node: String,
    /// Ticket the answer must carry.
    pub ticket: Ticket,
    /// Destination key server.
    pub url: String,
    /// Sending device id.
    pub from: String,
    /// Encoded request.
    pub body: Vec<u8>,
}

impl InFlight {
    /// Decoded request, `None` if the body does not decode.
    pub fn request(&self) -> Option<KeyServerRequest> {
        KeyServerRequest::decode(&self.body).ok().map(|(_, request)| request)
    }

    /// Devices named by a bundle fetch, empty for other requests.
    pub fn fetched_peers(&self) -> Vec<String> {
        match self.request() {
            Some(KeyServerRequest::GetPeerBundles(peers)) => peers,
            _ => Vec::new(),
        }
    }
}

/// One manager and what happened to the operations submitted to it.
pub struct SimNode {
    manager: Manager<SimEnv, MemoryStorage>,
    /// Encryptions in submission order, with their sending user.
    encryptions: Vec<(String, RequestId)>,
    /// Completions in the order they were produced.
    completions: Vec<(RequestId, Completion)>,
}

impl SimNode {
    /// The manager of this node.
    pub fn manager(&self) -> &Manager<SimEnv, MemoryStorage> {
        &self.manager
    }

    /// Completions in the order they were produced.
    pub fn completions(&self) -> &[(RequestId, Completion)] {
        &self.completions
    }
}

/// Order in which [`SimNetwork::deliver_all_in`] drains the posts in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Oldest post first.
    Fifo,
    /// Newest post first.
    Lifo,
    /// Uniformly random post, drawn from the simulation RNG.
    Random,
}

/// Nodes, key servers and the posts between them.
pub struct SimNetwork {
    env: SimEnv,
    config: ManagerConfig,
    servers: HashMap<String, KeyServer>,
    nodes: BTreeMap<String, SimNode>,
    in_flight: Vec<InFlight>,
    next_request: RequestId,
}

impl SimNetwork {
    /// Empty network seeded with `seed`, managers on the default config.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, ManagerConfig::default())
    }

    /// Empty network whose managers use `config`.
    pub fn with_config(seed: u64, config: ManagerConfig) -> Self {
        Self {
            env: SimEnv::with_seed(seed),
            config,
            servers: HashMap::new(),
            nodes: BTreeMap::new(),
            in_flight: Vec::new(),
            next_request: 1,
        }
    }

    /// Shared simulation environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Serve `url` with a fresh key server, replacing any previous one.
    pub fn add_server(&mut self, url: &str) -> KeyServer {
        let server = KeyServer::new();
        self.servers.insert(url.to_string(), server.clone());
        server
    }

    /// Key server at `url`.
    pub fn server(&self, url: &str) -> Option<&KeyServer> {
        self.servers.get(url)
    }

    /// Stop serving `url`: posts to it fail in transport.
    pub fn remove_server(&mut self, url: &str) -> Option<KeyServer> {
        self.servers.remove(url)
    }

    /// Add a node with an empty store.
    pub fn add_node(&mut self, name: &str) {
        let manager =
            Manager::new(self.env.clone(), MemoryStorage::new(), self.config.clone());
        self.nodes.insert(
            name.to_string(),
            SimNode { manager, encryptions: Vec::new(), completions: Vec::new() },
        );
    }

    /// Node by name.
    pub fn node(&self, name: &str) -> Option<&SimNode> {
        self.nodes.get(name)
    }

    /// Manager of a node, for synchronous calls.
    pub fn manager(&self, name: &str) -> Result<&Manager<SimEnv, MemoryStorage>, String> {
        self.nodes.get(name).map(SimNode::manager).ok_or_else(|| format!("no node {name}"))
    }

    /// Posts waiting for delivery, oldest first.
    pub fn in_flight(&self) -> &[InFlight] {
        &self.in_flight
    }

    /// Feed an event built around a fresh request id to a node.
    ///
    /// Returns the request id, or the manager's synchronous error.
    pub fn submit(
        &mut self,
        node: &str,
        event: impl FnOnce(RequestId) -> ManagerEvent,
    ) -> Result<RequestId, ManagerError> {
        let request = self.next_request;
        self.next_request += 1;

        let event = event(request);
        let encryption = match &event {
            ManagerEvent::Encrypt { local_device_id, .. } => Some(local_device_id.clone()),
            _ => None,
        };

        self.feed(node, event)?;
        if let (Some(local), Some(sim_node)) = (encryption, self.nodes.get_mut(node)) {
            sim_node.encryptions.push((local, request));
        }
        Ok(request)
    }

    /// Submit a user creation.
    pub fn create_user(
        &mut self,
        node: &str,
        device_id: &str,
        url: &str,
        curve: CurveId,
    ) -> Result<RequestId, ManagerError> {
        self.submit(node, |request| ManagerEvent::CreateUser {
            request,
            device_id: device_id.to_string(),
            key_server_url: url.to_string(),
            curve,
            one_time_prekeys: None,
        })
    }

    /// Submit a user deletion.
    pub fn delete_user(&mut self, node: &str, device_id: &str) -> Result<RequestId, ManagerError> {
        self.submit(node, |request| ManagerEvent::DeleteUser {
            request,
            device_id: device_id.to_string(),
        })
    }

    /// Submit an encryption.
    pub fn encrypt(
        &mut self,
        node: &str,
        local: &str,
        associated_id: &[u8],
        recipients: &[&str],
        plaintext: &[u8],
        policy: Option<EncryptionPolicy>,
    ) -> Result<RequestId, ManagerError> {
        self.submit(node, |request| ManagerEvent::Encrypt {
            request,
            local_device_id: local.to_string(),
            associated_id: associated_id.to_vec(),
            recipients: recipients.iter().map(ToString::to_string).collect(),
            plaintext: plaintext.to_vec(),
            policy,
        })
    }

    /// Submit a maintenance run.
    pub fn update(&mut self, node: &str) -> Result<RequestId, ManagerError> {
        self.submit(node, |request| ManagerEvent::Update { request })
    }

    /// Deliver the post at `index` to its key server and feed the answer
    /// back. A URL nobody serves fails in transport.
    pub fn deliver(&mut self, index: usize) -> Result<(), String> {
        if index >= self.in_flight.len() {
            return Err(format!("no post in flight at {index}"));
        }
        let post = self.in_flight.remove(index);

        let event = match self.servers.get(&post.url) {
            Some(server) => {
                let (status, body) = server.handle(&post.from, &post.body);
                ManagerEvent::ServerResponse { ticket: post.ticket, status, body }
            },
            None => ManagerEvent::TransportFailed {
                ticket: post.ticket,
                reason: format!("no route to {}", post.url),
            },
        };
        self.feed(&post.node, event).map_err(|err| format!("answer rejected: {err}"))
    }

    /// Fail the post at `index` in transport.
    pub fn fail(&mut self, index: usize, reason: &str) -> Result<(), String> {
        if index >= self.in_flight.len() {
            return Err(format!("no post in flight at {index}"));
        }
        let post = self.in_flight.remove(index);
        let event =
            ManagerEvent::TransportFailed { ticket: post.ticket, reason: reason.to_string() };
        self.feed(&post.node, event).map_err(|err| format!("failure rejected: {err}"))
    }

    /// Deliver everything in flight, including posts caused by deliveries,
    /// oldest first. Returns the number of posts delivered.
    pub fn deliver_all(&mut self) -> Result<usize, String> {
        self.deliver_all_in(DeliveryOrder::Fifo)
    }

    /// Deliver everything in flight in `order`.
    pub fn deliver_all_in(&mut self, order: DeliveryOrder) -> Result<usize, String> {
        let mut delivered = 0;
        while !self.in_flight.is_empty() {
            let index = match order {
                DeliveryOrder::Fifo => 0,
                DeliveryOrder::Lifo => self.in_flight.len() - 1,
                DeliveryOrder::Random => self.env.pick(self.in_flight.len()),
            };
            self.deliver(index)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Completion of `request` on `node`, if it was produced.
    pub fn completion(&self, node: &str, request: RequestId) -> Option<&Completion> {
        self.nodes
            .get(node)?
            .completions
            .iter()
            .find(|(id, _)| *id == request)
            .map(|(_, completion)| completion)
    }

    /// Submit, deliver everything, and return the completion.
    pub fn run(
        &mut self,
        node: &str,
        event: impl FnOnce(RequestId) -> ManagerEvent,
    ) -> Result<Completion, String> {
        let request = self.submit(node, event).map_err(|err| err.to_string())?;
        self.deliver_all()?;
        self.completion(node, request)
            .cloned()
            .ok_or_else(|| format!("request {request} did not complete"))
    }

    /// Observable state of every node, for invariant checks.
    pub fn snapshot(&self) -> SystemSnapshot {
        let nodes = self
            .nodes
            .iter()
            .map(|(name, node)| NodeSnapshot {
                name: name.clone(),
                encryptions: node.encryptions.clone(),
                completed: node.completions.iter().map(|(request, _)| *request).collect(),
                bundle_fetches: self
                    .in_flight
                    .iter()
                    .filter(|post| &post.node == name)
                    .map(|post| (post.from.clone(), post.fetched_peers()))
                    .filter(|(_, peers)| !peers.is_empty())
                    .collect(),
            })
            .collect();
        SystemSnapshot::from_nodes(nodes)
    }

    fn feed(&mut self, node: &str, event: ManagerEvent) -> Result<(), ManagerError> {
        let Some(sim_node) = self.nodes.get_mut(node) else {
            return Err(ManagerError::UserNotFound(node.to_string()));
        };

        let actions = sim_node.manager.handle(event)?;
        for action in actions {
            match action {
                ManagerAction::Post { ticket, url, from, body } => {
                    let node = node.to_string();
                    self.in_flight.push(InFlight { node, ticket, url, from, body });
                },
                ManagerAction::Completed { request, completion } => {
                    tracing::trace!(node, request, ok = completion.is_ok(), "completed");
                    sim_node.completions.push((request, completion));
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://keys.sim";

    #[test]
    fn create_user_round_trip() {
        let mut network = SimNetwork::new(1);
        network.add_server(URL);
        network.add_node("phone");

        let request = network.create_user("phone", "alice", URL, CurveId::Curve25519).unwrap();
        assert_eq!(network.in_flight().len(), 1);

        assert_eq!(network.deliver_all(), Ok(1));
        assert_eq!(network.completion("phone", request), Some(&Completion::CreateUser(Ok(()))));
        assert!(network.server(URL).unwrap().registry().contains("alice"));
    }

    #[test]
    fn unserved_url_fails_in_transport() {
        let mut network = SimNetwork::new(1);
        network.add_node("phone");

        let request = network.create_user("phone", "alice", URL, CurveId::P256).unwrap();
        network.deliver_all().unwrap();

        assert!(matches!(
            network.completion("phone", request),
            Some(Completion::CreateUser(Err(ManagerError::KeyServer { code: None, .. })))
        ));
        assert!(!network.manager("phone").unwrap().is_user("alice").unwrap());
    }

    #[test]
    fn deliver_out_of_range() {
        let mut network = SimNetwork::new(1);
        assert!(network.deliver(0).is_err());
        assert!(network.fail(3, "gone").is_err());
    }
}
