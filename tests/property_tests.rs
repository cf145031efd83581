//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use doc_replicator::checkpoint::{canonical_json, CheckpointId};
use doc_replicator::config::FilterSpec;
use doc_replicator::sequence::SequenceTracker;
use doc_replicator::{RevisionId, Role};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Revision ID Properties
// =============================================================================

proptest! {
    /// Display then parse yields the same id.
    #[test]
    fn revision_id_display_parses_back(
        generation in 1u64..u64::MAX,
        digest in "[0-9a-f]{1,40}",
    ) {
        let rev = RevisionId::new(generation, digest.clone());
        let parsed: RevisionId = rev.to_string().parse().unwrap();
        prop_assert_eq!(parsed.generation, generation);
        prop_assert_eq!(parsed.digest, digest);
    }

    /// Only the first dash separates the generation.
    #[test]
    fn revision_id_digest_may_contain_dashes(
        generation in 1u64..10_000u64,
        digest in "[a-z]{1,8}-[a-z]{1,8}",
    ) {
        let parsed: RevisionId = format!("{generation}-{digest}").parse().unwrap();
        prop_assert_eq!(parsed.digest, digest);
    }

    /// Generation zero is never valid.
    #[test]
    fn revision_id_rejects_generation_zero(digest in "[0-9a-f]{0,16}") {
        let rev = format!("0-{}", digest);
        prop_assert!(rev.parse::<RevisionId>().is_err());
    }

    /// Strings without a dash are never valid.
    #[test]
    fn revision_id_rejects_missing_dash(s in "[0-9a-z]{0,20}") {
        prop_assert!(s.parse::<RevisionId>().is_err());
    }

    /// Parsing arbitrary text never panics.
    #[test]
    fn revision_id_parse_never_panics(s in "\\PC*") {
        let _ = s.parse::<RevisionId>();
    }

    /// Higher generation always sorts later, whatever the digests.
    #[test]
    fn revision_id_generation_dominates_order(
        g1 in 1u64..1_000_000u64,
        g2 in 1u64..1_000_000u64,
        d1 in "[0-9a-f]{1,8}",
        d2 in "[0-9a-f]{1,8}",
    ) {
        prop_assume!(g1 != g2);
        let a = RevisionId::new(g1, d1);
        let b = RevisionId::new(g2, d2);
        prop_assert_eq!(a < b, g1 < g2);
    }
}

// =============================================================================
// Checkpoint ID Properties
// =============================================================================

fn derive(doc_ids: &[String], params: &[(String, i64)]) -> CheckpointId {
    let filter = FilterSpec {
        name: "app/by_owner".to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect::<BTreeMap<_, _>>(),
    };
    let ids: BTreeSet<String> = doc_ids.iter().cloned().collect();
    CheckpointId::derive("store-1", "http://sync.test/db", Role::Pull, Some(&filter), &ids)
}

proptest! {
    /// Doc id order and duplicates do not change the id.
    #[test]
    fn checkpoint_id_ignores_doc_id_order(
        ids in prop::collection::vec("[a-z]{1,6}", 0..8),
        seed in any::<u64>(),
    ) {
        let mut shuffled = ids.clone();
        let n = shuffled.len().max(1);
        shuffled.rotate_left((seed as usize) % n);
        shuffled.extend(ids.iter().take(2).cloned());

        prop_assert_eq!(derive(&ids, &[]), derive(&shuffled, &[]));
    }

    /// Filter parameter order does not change the id.
    #[test]
    fn checkpoint_id_ignores_param_order(
        params in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..6),
    ) {
        let forward: Vec<(String, i64)> = params.clone().into_iter().collect();
        let mut backward = forward.clone();
        backward.reverse();

        prop_assert_eq!(derive(&[], &forward), derive(&[], &backward));
    }

    /// Adding a doc id that was not there changes the id.
    #[test]
    fn checkpoint_id_depends_on_doc_ids(
        ids in prop::collection::btree_set("[a-z]{1,6}", 0..6),
        extra in "[A-Z]{1,6}",
    ) {
        let before: Vec<String> = ids.iter().cloned().collect();
        let mut after = before.clone();
        after.push(extra);

        prop_assert_ne!(derive(&before, &[]), derive(&after, &[]));
    }

    /// The id is always 64 lowercase hex characters.
    #[test]
    fn checkpoint_id_is_hex_sha256(ids in prop::collection::vec("\\PC{0,10}", 0..4)) {
        let id = derive(&ids, &[]);
        prop_assert_eq!(id.as_str().len(), 64);
        prop_assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Canonical JSON does not depend on key insertion order.
    #[test]
    fn canonical_json_sorts_keys(
        entries in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..8),
    ) {
        let mut forward = Map::new();
        for (k, v) in &entries {
            forward.insert(k.clone(), Value::from(*v));
        }
        let mut backward = Map::new();
        for (k, v) in entries.iter().rev() {
            backward.insert(k.clone(), Value::from(*v));
        }
        prop_assert_eq!(
            canonical_json(&Value::Object(forward)),
            canonical_json(&Value::Object(backward))
        );
    }
}

// =============================================================================
// Sequence Tracker Properties
// =============================================================================

/// Outcome of one tracked item in a generated run.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Complete,
    Fail,
    Pending,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        6 => Just(Outcome::Complete),
        1 => Just(Outcome::Fail),
        1 => Just(Outcome::Pending),
    ]
}

proptest! {
    /// The checkpoint is the last item of the longest fully-completed
    /// prefix, whatever order items finish in.
    #[test]
    fn tracker_checkpoint_is_completed_prefix(
        outcomes in prop::collection::vec(outcome(), 0..40),
        order_seed in any::<u64>(),
    ) {
        let mut tracker = SequenceTracker::new(None);
        let tokens: Vec<_> = (0..outcomes.len() as u64).map(|seq| tracker.add(seq)).collect();

        // Resolve in a scrambled order.
        let mut order: Vec<usize> = (0..outcomes.len()).collect();
        let mut state = order_seed;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state >> 33) as usize % (i + 1));
        }
        for i in order {
            match outcomes[i] {
                Outcome::Complete => {
                    tracker.complete(tokens[i]);
                }
                Outcome::Fail => tracker.fail(tokens[i]),
                Outcome::Pending => {}
            }
        }

        let prefix = outcomes
            .iter()
            .take_while(|o| matches!(o, Outcome::Complete))
            .count();
        let expected = if prefix == 0 { None } else { Some(prefix as u64 - 1) };
        prop_assert_eq!(tracker.checkpoint(), expected);
        prop_assert_eq!(tracker.pending_count(), outcomes.len() - prefix);
        prop_assert_eq!(
            tracker.is_blocked(),
            matches!(outcomes.get(prefix), Some(Outcome::Fail))
        );
    }

    /// With no items resolved the starting checkpoint is kept.
    #[test]
    fn tracker_keeps_initial_checkpoint(start in any::<u64>(), count in 0usize..20) {
        let mut tracker = SequenceTracker::new(Some(start));
        for n in 0..count {
            tracker.add(n as u64);
        }
        prop_assert_eq!(tracker.checkpoint(), Some(start));
    }

    /// The checkpoint never moves backwards as items complete in feed order.
    #[test]
    fn tracker_checkpoint_is_monotonic(count in 1usize..30) {
        let mut tracker = SequenceTracker::new(None);
        let tokens: Vec<_> = (0..count as u64).map(|seq| tracker.add(seq)).collect();
        let mut last = None;
        for token in tokens {
            let advanced = tracker.complete(token);
            prop_assert!(advanced.is_some());
            prop_assert!(advanced >= last);
            last = advanced;
        }
        prop_assert_eq!(tracker.checkpoint(), Some(count as u64 - 1));
    }
}
