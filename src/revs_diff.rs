// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `_revs_diff` negotiation.
//!
//! Before uploading, the pusher asks the peer which of the candidate
//! revisions it lacks:
//!
//! ```text
//! POST _revs_diff  {"doc1": ["2-b", "3-c"], "doc2": ["1-a"]}
//!            ──▶   {"doc1": {"missing": ["3-c"], "possible_ancestors": ["2-b"]}}
//! ```
//!
//! `doc2` is absent from the answer, so the peer already has all of it.

use crate::error::{ReplicationError, Result};
use crate::peer::PeerClient;
use crate::revision::RevisionId;
use crate::transport::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What the peer lacks for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevsDiffEntry {
    pub missing: Vec<RevisionId>,
    /// Revisions the peer has that may be ancestors of `missing`.
    pub possible_ancestors: Vec<RevisionId>,
}

impl RevsDiffEntry {
    /// Highest generation among the possible ancestors, 0 when none.
    pub fn known_generation(&self) -> u64 {
        self.possible_ancestors
            .iter()
            .map(|r| r.generation)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    missing: Vec<String>,
    #[serde(default)]
    possible_ancestors: Vec<String>,
}

fn parse_revs(doc_id: &str, raw: Vec<String>) -> Vec<RevisionId> {
    raw.into_iter()
        .filter_map(|r| match r.parse() {
            Ok(rev) => Some(rev),
            Err(e) => {
                warn!(doc_id, error = %e, "Ignoring bad revision in _revs_diff response");
                None
            }
        })
        .collect()
}

/// Parse a `_revs_diff` response body.
pub fn parse_revs_diff(body: Value) -> Result<BTreeMap<String, RevsDiffEntry>> {
    let Value::Object(map) = body else {
        return Err(ReplicationError::protocol("_revs_diff", "response is not an object"));
    };
    let mut out = BTreeMap::new();
    for (doc_id, value) in map {
        let raw: RawEntry = serde_json::from_value(value)
            .map_err(|e| ReplicationError::protocol("_revs_diff", format!("{doc_id}: {e}")))?;
        let entry = RevsDiffEntry {
            missing: parse_revs(&doc_id, raw.missing),
            possible_ancestors: parse_revs(&doc_id, raw.possible_ancestors),
        };
        if !entry.missing.is_empty() {
            out.insert(doc_id, entry);
        }
    }
    Ok(out)
}

/// Ask the peer which of `candidates` it is missing.
///
/// Documents the peer already has in full are absent from the result. An
/// empty request is answered locally.
pub async fn revs_diff(
    peer: &PeerClient,
    candidates: &BTreeMap<String, Vec<RevisionId>>,
) -> Result<BTreeMap<String, RevsDiffEntry>> {
    if candidates.values().all(Vec::is_empty) {
        return Ok(BTreeMap::new());
    }

    let body: Map<String, Value> = candidates
        .iter()
        .filter(|(_, revs)| !revs.is_empty())
        .map(|(doc_id, revs)| {
            let revs: Vec<Value> = revs.iter().map(|r| Value::String(r.to_string())).collect();
            (doc_id.clone(), Value::Array(revs))
        })
        .collect();

    let response = peer
        .send_json("_revs_diff", Method::Post, "_revs_diff", &Value::Object(body))
        .await?;
    let diff = parse_revs_diff(response)?;
    debug!(
        requested = candidates.len(),
        missing = diff.len(),
        "Revs diff complete"
    );
    Ok(diff)
}
