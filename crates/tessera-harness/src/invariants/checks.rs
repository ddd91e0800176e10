//! Standard invariant checks.

use std::collections::{HashMap, HashSet};

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Every operation completes at most once.
///
/// A second completion would resolve a caller twice, or resolve a caller
/// that already moved on with a stale result.
pub struct CompletedOnce;

impl Invariant for CompletedOnce {
    fn name(&self) -> &'static str {
        "completed_once"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for node in &state.nodes {
            let mut seen = HashSet::new();
            for request in &node.completed {
                if !seen.insert(*request) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("node {}: request {request} completed twice", node.name),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Encryptions of one user complete in the order they were submitted.
///
/// Holds whatever order the key server answers in. Encryptions of different
/// users are independent.
pub struct EncryptionOrder;

impl Invariant for EncryptionOrder {
    fn name(&self) -> &'static str {
        "encryption_order"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for node in &state.nodes {
            let position: HashMap<_, _> =
                node.completed.iter().enumerate().map(|(i, request)| (*request, i)).collect();

            let mut by_user: HashMap<&str, Vec<u64>> = HashMap::new();
            for (local, request) in &node.encryptions {
                by_user.entry(local.as_str()).or_default().push(*request);
            }

            for (local, submitted) in by_user {
                let mut last = None;
                let mut pending_seen = false;
                for request in submitted {
                    match position.get(&request) {
                        Some(&at) => {
                            if pending_seen || last.is_some_and(|prev| at < prev) {
                                return Err(Violation {
                                    invariant: self.name(),
                                    message: format!(
                                        "node {} user {local}: request {request} overtook an \
                                         earlier encryption",
                                        node.name
                                    ),
                                });
                            }
                            last = Some(at);
                        },
                        None => pending_seen = true,
                    }
                }
            }
        }
        Ok(())
    }
}

/// At most one bundle fetch per (user, peer) is in flight.
///
/// A second encryption naming a peer that is still being fetched must wait
/// for the same answer instead of fetching again.
pub struct SingleFetchPerPeer;

impl Invariant for SingleFetchPerPeer {
    fn name(&self) -> &'static str {
        "single_fetch_per_peer"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for node in &state.nodes {
            let mut fetching = HashSet::new();
            for (local, peers) in &node.bundle_fetches {
                for peer in peers {
                    if !fetching.insert((local, peer)) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "node {} user {local}: two fetches in flight for {peer}",
                                node.name
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
