//! Fuzz target for revision id parsing.
//!
//! Parsing must never panic, and anything that parses must print back to
//! the same string.

#![no_main]

use doc_replicator::RevisionId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(rev) = data.parse::<RevisionId>() else {
        return;
    };

    assert!(rev.generation >= 1);
    assert!(!rev.digest.is_empty());

    // Leading zeros and '+' parse but do not survive display.
    let shown = rev.to_string();
    let again: RevisionId = shown.parse().expect("displayed id must parse");
    assert_eq!(again, rev);
});
