//! Fuzz target for `_changes` response parsing.
//!
//! Arbitrary bytes from the peer must produce a page or an error, never a
//! panic.

#![no_main]

use doc_replicator::changes::parse_changes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(page) = parse_changes(data) {
        // Bad revision ids are dropped, never passed through.
        for entry in &page.entries {
            assert!(entry.revisions.iter().all(|rev| rev.generation >= 1));
        }
    }
});
