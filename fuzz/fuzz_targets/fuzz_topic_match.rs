// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for topic pattern matching.

#![no_main]

use libfuzzer_sys::fuzz_target;
use logistics_replication::broker::topic_matches;

fuzz_target!(|data: (&str, &str)| {
    let (pattern, key) = data;

    // Should never panic
    let _ = topic_matches(pattern, key);

    // Literal keys always match themselves, `#` matches everything
    if !key.contains('*') && !key.contains('#') {
        assert!(topic_matches(key, key));
    }
    assert!(topic_matches("#", key));
});
