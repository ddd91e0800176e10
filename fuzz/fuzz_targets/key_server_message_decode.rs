//! Fuzz target for key-server request and response decoding
//!
//! Requests are decoded by the server from any sender; responses are decoded
//! by the manager from whatever answered at the configured URL. Both must
//! reject garbage without panicking, and anything accepted must re-encode to
//! an equivalent message.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_crypto::CurveId;
use tessera_proto::{KeyServerRequest, KeyServerResponse};

fuzz_target!(|data: &[u8]| {
    if let Ok((curve, request)) = KeyServerRequest::decode(data) {
        let encoded = request.encode(curve).expect("decoded request re-encodes");
        assert_eq!(KeyServerRequest::decode(&encoded), Ok((curve, request)));
    }

    for curve in CurveId::ALL {
        if let Ok(response) = KeyServerResponse::decode(data, curve) {
            let encoded = response.encode(curve).expect("decoded response re-encodes");
            assert_eq!(KeyServerResponse::decode(&encoded, curve), Ok(response));
        }
    }
});
