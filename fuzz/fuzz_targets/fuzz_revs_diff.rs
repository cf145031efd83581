//! Fuzz target for `_revs_diff` response parsing.

#![no_main]

use doc_replicator::revs_diff::parse_revs_diff;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    // Should never panic
    if let Ok(diff) = parse_revs_diff(body) {
        for entry in diff.values() {
            let _ = entry.known_generation();
        }
    }
});
