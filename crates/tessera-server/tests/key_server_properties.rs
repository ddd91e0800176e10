//! Property-based tests for the key server
//!
//! The server answers untrusted bytes from untrusted senders. Whatever it is
//! sent, it must answer with a decodable message, and it must never serve the
//! same one-time prekey twice.

use std::collections::HashSet;

use proptest::prelude::*;
use tessera_crypto::CurveId;
use tessera_proto::{KeyServerRequest, KeyServerResponse, OneTimePrekey, SignedPrekey};
use tessera_server::{KeyServer, STATUS_OK};

fn register(server: &KeyServer, device_id: &str, curve: CurveId, one_time_prekeys: u32) {
    let request = KeyServerRequest::RegisterUser {
        identity_key: vec![1; curve.identity_key_len()],
        signed_prekey: SignedPrekey {
            public_key: vec![2; curve.dh_public_len()],
            signature: vec![3; curve.signature_len()],
            id: 1,
        },
        one_time_prekeys: (0..one_time_prekeys)
            .map(|id| OneTimePrekey { public_key: vec![4; curve.dh_public_len()], id })
            .collect(),
    };
    let body = request.encode(curve).expect("request should encode");
    server.handle(device_id, &body);
}

proptest! {
    #[test]
    fn prop_arbitrary_bytes_get_a_decodable_answer(
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        // PROPERTY: Any body yields status 200 and a response that decodes
        // on the curve the request claimed, or an error on curve 1 when the
        // request's curve byte is unusable.
        let server = KeyServer::new();
        register(&server, "alice", CurveId::Curve25519, 2);

        let (status, response) = server.handle("alice", &body);

        prop_assert_eq!(status, STATUS_OK);
        let curve = body
            .get(2)
            .copied()
            .and_then(CurveId::from_wire_id)
            .unwrap_or(CurveId::Curve25519);
        if CurveId::from_wire_id(body.get(2).copied().unwrap_or_default()).is_some() {
            prop_assert!(KeyServerResponse::decode(&response, curve).is_ok());
        } else {
            prop_assert_eq!(response.get(1).copied(), Some(0xff));
        }
    }

    #[test]
    fn prop_one_time_prekeys_served_once(
        fetchers in 1usize..6,
        rounds in 1usize..6,
        stock in 0u32..12,
    ) {
        // PROPERTY: Across any number of fetching devices and rounds, each
        // one-time prekey id of a device is handed out at most once, and
        // exactly min(stock, fetches) are handed out.
        let server = KeyServer::new();
        register(&server, "bob", CurveId::P256, stock);
        for fetcher in 0..fetchers {
            register(&server, &format!("fetcher{fetcher}"), CurveId::P256, 0);
        }

        let request = KeyServerRequest::GetPeerBundles(vec!["bob".to_string()])
            .encode(CurveId::P256)
            .expect("request should encode");

        let mut served = HashSet::new();
        let mut fetches = 0usize;
        for _ in 0..rounds {
            for fetcher in 0..fetchers {
                let (_, body) = server.handle(&format!("fetcher{fetcher}"), &request);
                let response = KeyServerResponse::decode(&body, CurveId::P256)
                    .expect("response should decode");
                let KeyServerResponse::PeerBundles(bundles) = response else {
                    return Err(TestCaseError::fail("expected bundles"));
                };
                fetches += 1;
                for bundle in bundles.into_iter().filter_map(|peer| peer.bundle) {
                    if let Some(key) = bundle.one_time_prekey {
                        let fresh = served.insert(key.id);
                        prop_assert!(fresh, "one-time prekey {} served twice", key.id);
                    }
                }
            }
        }

        prop_assert_eq!(served.len(), fetches.min(stock as usize));
    }
}
