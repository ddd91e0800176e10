//! Key-server tickets.
//!
//! Every post to the key server gets a ticket recording why it was sent, so
//! the response can be routed back to the operation waiting for it. Bundle
//! fetches are additionally indexed per (local user, peer device): while one
//! is outstanding, later encryptions to the same peer wait for it instead of
//! fetching again.

use std::collections::HashMap;

use tessera_crypto::CurveId;
use tessera_proto::{KeyServerRequest, KeyServerResponse};

use crate::{
    error::ManagerError,
    event::{ManagerAction, RequestId, Ticket},
};

/// HTTP-like status of a successful key-server exchange.
pub const STATUS_OK: u16 = 200;

/// Why a post was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Purpose {
    /// Registration of a newly created user.
    Register { request: RequestId, device_id: String },
    /// Registration again after the server lost the user.
    Reregister { update: RequestId, device_id: String },
    /// Deletion of a user already removed locally.
    Delete { request: RequestId, device_id: String },
    /// Key bundles for peers that have no session with `local`.
    FetchBundles { local: String, peers: Vec<String> },
    /// Publication of a rotated signed prekey.
    PostSignedPrekey { update: RequestId, device_id: String },
    /// Publication of fresh one-time prekeys.
    PostOneTimePrekeys { update: RequestId, device_id: String },
    /// Listing of the one-time prekeys the server still holds.
    ListOneTimePrekeys { update: RequestId, device_id: String },
}

struct Outstanding {
    purpose: Purpose,
    curve: CurveId,
}

/// Outstanding key-server posts.
#[derive(Default)]
pub(crate) struct KeyExchangeClient {
    next_ticket: Ticket,
    outstanding: HashMap<Ticket, Outstanding>,
    fetching: HashMap<(String, String), Ticket>,
}

impl KeyExchangeClient {
    /// Encode `request` and open a ticket for it.
    pub(crate) fn post(
        &mut self,
        purpose: Purpose,
        curve: CurveId,
        url: &str,
        from: &str,
        request: &KeyServerRequest,
    ) -> Result<ManagerAction, ManagerError> {
        let body = request
            .encode(curve)
            .map_err(|err| ManagerError::key_server(format!("cannot encode request: {err}")))?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        tracing::debug!(ticket, from, ?purpose, "key server post");
        self.outstanding.insert(ticket, Outstanding { purpose, curve });

        Ok(ManagerAction::Post { ticket, url: url.to_string(), from: from.to_string(), body })
    }

    /// Fetch bundles for the peers of `local` not already being fetched.
    ///
    /// Returns `None` when every peer already has a fetch outstanding.
    pub(crate) fn fetch_bundles(
        &mut self,
        local: &str,
        curve: CurveId,
        url: &str,
        peers: &[String],
    ) -> Result<Option<ManagerAction>, ManagerError> {
        let mut missing: Vec<String> = Vec::new();
        for peer in peers {
            if !self.is_fetching(local, peer) && !missing.contains(peer) {
                missing.push(peer.clone());
            }
        }
        if missing.is_empty() {
            return Ok(None);
        }

        let request = KeyServerRequest::GetPeerBundles(missing.clone());
        let purpose = Purpose::FetchBundles { local: local.to_string(), peers: missing.clone() };
        let action = self.post(purpose, curve, url, local, &request)?;

        if let ManagerAction::Post { ticket, .. } = &action {
            for peer in missing {
                self.fetching.insert((local.to_string(), peer), *ticket);
            }
        }
        Ok(Some(action))
    }

    /// Whether a bundle fetch for `peer` is outstanding on behalf of `local`.
    pub(crate) fn is_fetching(&self, local: &str, peer: &str) -> bool {
        self.fetching.contains_key(&(local.to_string(), peer.to_string()))
    }

    /// Close a ticket and interpret the server's answer.
    ///
    /// Returns `None` for a ticket that is not outstanding (duplicate or
    /// unknown response).
    pub(crate) fn resolve(
        &mut self,
        ticket: Ticket,
        outcome: Result<(u16, Vec<u8>), String>,
    ) -> Option<(Purpose, Result<KeyServerResponse, ManagerError>)> {
        let Some(Outstanding { purpose, curve }) = self.outstanding.remove(&ticket) else {
            tracing::warn!(ticket, "response for unknown ticket");
            return None;
        };

        if let Purpose::FetchBundles { local, peers } = &purpose {
            for peer in peers {
                let key = (local.clone(), peer.clone());
                if self.fetching.get(&key) == Some(&ticket) {
                    self.fetching.remove(&key);
                }
            }
        }

        let response = match outcome {
            Ok((status, body)) => interpret(status, &body, curve),
            Err(reason) => Err(ManagerError::key_server(format!("transport failure: {reason}"))),
        };
        if let Err(err) = &response {
            tracing::warn!(ticket, ?purpose, %err, "key server request failed");
        }
        Some((purpose, response))
    }

    /// Forget the fetch index of a deleted user. Its tickets stay open and
    /// their responses are dropped when they arrive.
    pub(crate) fn forget_local(&mut self, local: &str) {
        self.fetching.retain(|(owner, _), _| owner != local);
    }

    /// Number of posts awaiting an answer.
    pub(crate) fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

fn interpret(status: u16, body: &[u8], curve: CurveId) -> Result<KeyServerResponse, ManagerError> {
    if status != STATUS_OK {
        return Err(ManagerError::key_server(format!("unexpected status {status}")));
    }

    match KeyServerResponse::decode(body, curve) {
        Ok(KeyServerResponse::Error { code, message }) => Err(ManagerError::KeyServer {
            code: Some(code),
            reason: message.unwrap_or_else(|| format!("{code:?}")),
        }),
        Ok(response) => Ok(response),
        Err(err) => Err(ManagerError::key_server(format!("malformed response: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use tessera_proto::{ErrorCode, MessageType};

    use super::*;

    const CURVE: CurveId = CurveId::Curve25519;

    fn peers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    fn ticket_of(action: &ManagerAction) -> Ticket {
        match action {
            ManagerAction::Post { ticket, .. } => *ticket,
            ManagerAction::Completed { .. } => panic!("expected a post"),
        }
    }

    #[test]
    fn fetch_deduplicates_per_peer() {
        let mut client = KeyExchangeClient::default();

        let first = client.fetch_bundles("alice", CURVE, "url", &peers(&["bob", "bob"])).unwrap();
        assert!(first.is_some());
        assert!(client.is_fetching("alice", "bob"));

        let second = client.fetch_bundles("alice", CURVE, "url", &peers(&["bob"])).unwrap();
        assert!(second.is_none());

        let other_local = client.fetch_bundles("carol", CURVE, "url", &peers(&["bob"])).unwrap();
        assert!(other_local.is_some());
        assert_eq!(client.outstanding_count(), 2);
    }

    #[test]
    fn fetch_only_requests_new_peers() {
        let mut client = KeyExchangeClient::default();
        client.fetch_bundles("alice", CURVE, "url", &peers(&["bob"])).unwrap();

        let action = client
            .fetch_bundles("alice", CURVE, "url", &peers(&["bob", "carol"]))
            .unwrap()
            .unwrap();
        let ManagerAction::Post { body, .. } = action else {
            panic!("expected a post");
        };
        let (_, request) = KeyServerRequest::decode(&body).unwrap();
        assert_eq!(request, KeyServerRequest::GetPeerBundles(peers(&["carol"])));
    }

    #[test]
    fn resolve_clears_fetch_index() {
        let mut client = KeyExchangeClient::default();
        let action =
            client.fetch_bundles("alice", CURVE, "url", &peers(&["bob"])).unwrap().unwrap();
        let ticket = ticket_of(&action);

        let body = KeyServerResponse::PeerBundles(Vec::new()).encode(CURVE).unwrap();
        let (purpose, response) = client.resolve(ticket, Ok((STATUS_OK, body))).unwrap();

        assert_eq!(
            purpose,
            Purpose::FetchBundles { local: "alice".into(), peers: peers(&["bob"]) }
        );
        assert_eq!(response.unwrap(), KeyServerResponse::PeerBundles(Vec::new()));
        assert!(!client.is_fetching("alice", "bob"));
        assert!(client.resolve(ticket, Ok((STATUS_OK, Vec::new()))).is_none());
    }

    #[test]
    fn non_ok_status_is_key_server_error() {
        let mut client = KeyExchangeClient::default();
        let purpose = Purpose::Delete { request: 1, device_id: "alice".into() };
        let action =
            client.post(purpose, CURVE, "url", "alice", &KeyServerRequest::DeleteUser).unwrap();

        let (_, response) = client.resolve(ticket_of(&action), Ok((503, Vec::new()))).unwrap();
        assert!(matches!(response, Err(ManagerError::KeyServer { code: None, .. })));
    }

    #[test]
    fn error_response_carries_code() {
        let mut client = KeyExchangeClient::default();
        let purpose = Purpose::Delete { request: 1, device_id: "alice".into() };
        let action =
            client.post(purpose, CURVE, "url", "alice", &KeyServerRequest::DeleteUser).unwrap();

        let body = KeyServerResponse::Error { code: ErrorCode::UserNotFound, message: None }
            .encode(CURVE)
            .unwrap();
        let (_, response) = client.resolve(ticket_of(&action), Ok((STATUS_OK, body))).unwrap();
        assert!(matches!(
            response,
            Err(ManagerError::KeyServer { code: Some(ErrorCode::UserNotFound), .. })
        ));
    }

    #[test]
    fn transport_failure_is_key_server_error() {
        let mut client = KeyExchangeClient::default();
        let purpose = Purpose::Delete { request: 1, device_id: "alice".into() };
        let action =
            client.post(purpose, CURVE, "url", "alice", &KeyServerRequest::DeleteUser).unwrap();

        let (_, response) =
            client.resolve(ticket_of(&action), Err("connection refused".to_string())).unwrap();
        assert!(matches!(response, Err(ManagerError::KeyServer { .. })));
    }

    #[test]
    fn ack_resolves_to_purpose() {
        let mut client = KeyExchangeClient::default();
        let purpose = Purpose::Delete { request: 7, device_id: "alice".into() };
        let action = client
            .post(purpose.clone(), CURVE, "url", "alice", &KeyServerRequest::DeleteUser)
            .unwrap();

        let body = KeyServerResponse::Ack(MessageType::DeleteUser).encode(CURVE).unwrap();
        let (resolved, response) =
            client.resolve(ticket_of(&action), Ok((STATUS_OK, body))).unwrap();
        assert_eq!(resolved, purpose);
        assert_eq!(response.unwrap(), KeyServerResponse::Ack(MessageType::DeleteUser));
    }

    #[test]
    fn forget_local_drops_index_only() {
        let mut client = KeyExchangeClient::default();
        client.fetch_bundles("alice", CURVE, "url", &peers(&["bob"])).unwrap();

        client.forget_local("alice");
        assert!(!client.is_fetching("alice", "bob"));
        assert_eq!(client.outstanding_count(), 1);
    }
}
