//! Observable state snapshots for invariant checking.
//!
//! Invariants operate on snapshots rather than live managers, so a check
//! sees one consistent moment of the simulation.

use tessera_client::RequestId;

/// Snapshot of every node of a simulation.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-node state, ordered by node name.
    pub nodes: Vec<NodeSnapshot>,
}

impl SystemSnapshot {
    /// Snapshot of these nodes.
    pub fn from_nodes(nodes: Vec<NodeSnapshot>) -> Self {
        Self { nodes }
    }
}

/// Snapshot of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    /// Node name.
    pub name: String,
    /// Accepted encryptions in submission order, with their sending user.
    pub encryptions: Vec<(String, RequestId)>,
    /// Every completion the node produced, in order.
    pub completed: Vec<RequestId>,
    /// Bundle fetches in flight: sending user and the peers it asked for.
    pub bundle_fetches: Vec<(String, Vec<String>)>,
}
