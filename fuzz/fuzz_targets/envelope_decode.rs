//! Fuzz target for Envelope::decode
//!
//! Envelopes arrive from peers through whatever channel the application
//! uses, so every byte is attacker-controlled. This fuzzer looks for:
//! - Parser panics on truncated key-exchange blocks
//! - Length arithmetic that overflows on curve-dependent sizes
//! - Inputs that decode but do not survive a re-encode
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_proto::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::decode(data) else {
        return;
    };

    // A decoded envelope re-encodes to the exact input
    assert_eq!(envelope.to_bytes(), data);
    assert_eq!(envelope.encoded_len(), data.len());
});
