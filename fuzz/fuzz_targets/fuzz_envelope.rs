// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for envelope decoding.
//!
//! Delivery bodies come straight off the broker, so decoding must never
//! panic, and anything that decodes must re-encode to an equivalent envelope.

#![no_main]

use libfuzzer_sys::fuzz_target;
use logistics_replication::{EventType, MutationEvent};

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = MutationEvent::from_slice(data) {
        let bytes = event.to_bytes().expect("decoded envelope must encode");
        let again = MutationEvent::from_slice(&bytes).expect("encoded envelope must decode");
        assert_eq!(again.event_type, event.event_type);
        assert_eq!(again.http_method, event.http_method);
        assert_eq!(again.payload, event.payload);
        let _ = event.routing_key_consistent();
    }

    if let Ok(raw) = std::str::from_utf8(data) {
        if let Ok(event_type) = raw.parse::<EventType>() {
            assert_eq!(event_type.to_string(), raw);
        }
    }
});
