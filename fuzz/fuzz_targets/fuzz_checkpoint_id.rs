//! Fuzz target for checkpoint id derivation.
//!
//! Any filter parameters and doc ids must derive an id without panicking,
//! and the id must not depend on the order they arrive in.

#![no_main]

use doc_replicator::checkpoint::{canonical_json, CheckpointId};
use doc_replicator::config::FilterSpec;
use doc_replicator::Role;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

fuzz_target!(|data: (Vec<(String, String)>, Vec<String>)| {
    let (params, doc_ids) = data;

    let filter = FilterSpec {
        name: "app/filter".to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<BTreeMap<_, _>>(),
    };
    let forward: BTreeSet<String> = doc_ids.iter().cloned().collect();
    let backward: BTreeSet<String> = doc_ids.iter().rev().cloned().collect();

    let a = CheckpointId::derive("store", "http://peer/db", Role::Push, Some(&filter), &forward);
    let b = CheckpointId::derive("store", "http://peer/db", Role::Push, Some(&filter), &backward);
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 64);

    // Canonical output is itself valid JSON.
    let text = canonical_json(&Value::Object(
        params.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
    ));
    assert!(serde_json::from_str::<Value>(&text).is_ok());
});
