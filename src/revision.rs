// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision identifiers, history encoding and per-document revision trees.
//!
//! A revision id is `<generation>-<digest>`: the generation is the depth of
//! the revision in its document's history (1 for a fresh document) and the
//! digest identifies the content. On the wire, a revision's ancestry is sent
//! as a compact [`RevisionHistory`] (`_revisions: {start, ids}`), newest first.
//!
//! # Winner Selection
//!
//! ```text
//!            1-a
//!           /   \
//!        2-b     2-c          leaves: 3-d, 2-c (deleted)
//!         |      (del)        live leaves: 3-d
//!        3-d                  winner: 3-d
//! ```
//!
//! The winner is the live leaf with the highest generation, ties broken by
//! the lexicographically greater digest. When every leaf is a tombstone the
//! same rule is applied over all leaves.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// A revision id could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid revision id: {0:?}")]
pub struct InvalidRevisionId(pub String);

/// A `generation-digest` revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    pub generation: u64,
    pub digest: String,
}

impl RevisionId {
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }
}

impl FromStr for RevisionId {
    type Err = InvalidRevisionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| InvalidRevisionId(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| InvalidRevisionId(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(InvalidRevisionId(s.to_string()));
        }
        Ok(Self::new(generation, digest))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for RevisionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compact ancestry encoding: `{"start": 3, "ids": ["c", "b", "a"]}` stands
/// for `3-c`, `2-b`, `1-a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Encode an ancestry list (newest first, consecutive generations).
    pub fn from_ancestry(ancestry: &[RevisionId]) -> Self {
        Self {
            start: ancestry.first().map(|r| r.generation).unwrap_or(0),
            ids: ancestry.iter().map(|r| r.digest.clone()).collect(),
        }
    }

    /// Decode into full revision ids, newest first.
    ///
    /// Entries that would fall below generation 1 are dropped.
    pub fn revision_ids(&self) -> Vec<RevisionId> {
        self.ids
            .iter()
            .enumerate()
            .filter(|(i, _)| (*i as u64) < self.start)
            .map(|(i, digest)| RevisionId::new(self.start - i as u64, digest.clone()))
            .collect()
    }

    /// Cut the history just after the newest entry the peer already has.
    ///
    /// With no known ancestor the full history is kept.
    pub fn trimmed_to(&self, possible_ancestors: &[RevisionId]) -> Self {
        let known: HashSet<&RevisionId> = possible_ancestors.iter().collect();
        let ids = self.revision_ids();
        match ids.iter().position(|r| known.contains(r)) {
            Some(idx) => Self {
                start: self.start,
                ids: self.ids[..=idx].to_vec(),
            },
            None => self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct RevisionNode<T> {
    parent: Option<RevisionId>,
    deleted: bool,
    payload: Option<T>,
}

/// Per-document tree of revisions.
///
/// Interior revisions learned only through a child's history are kept as
/// bodiless placeholders so the tree stays connected.
#[derive(Debug, Clone)]
pub struct RevisionTree<T> {
    nodes: HashMap<RevisionId, RevisionNode<T>>,
}

impl<T> Default for RevisionTree<T> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }
}

impl<T> RevisionTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of revisions, placeholders included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, rev: &RevisionId) -> bool {
        self.nodes.contains_key(rev)
    }

    /// True when the revision is present with its body.
    pub fn has_payload(&self, rev: &RevisionId) -> bool {
        self.nodes.get(rev).is_some_and(|n| n.payload.is_some())
    }

    /// Payload and deleted flag of a revision, when its body is known.
    pub fn get(&self, rev: &RevisionId) -> Option<(&T, bool)> {
        self.nodes
            .get(rev)
            .and_then(|n| n.payload.as_ref().map(|p| (p, n.deleted)))
    }

    pub fn is_deleted(&self, rev: &RevisionId) -> bool {
        self.nodes.get(rev).is_some_and(|n| n.deleted)
    }

    /// Insert a revision with its ancestry (newest first, `history[0]` is the
    /// revision itself).
    ///
    /// Missing ancestors become placeholders. Returns `false` when the
    /// revision was already present with a body.
    pub fn insert_with_history(&mut self, history: &[RevisionId], payload: T, deleted: bool) -> bool {
        let Some(rev) = history.first() else {
            return false;
        };
        if self.has_payload(rev) {
            return false;
        }

        // Oldest first so each parent exists before its child.
        for (idx, ancestor) in history.iter().enumerate().skip(1).rev() {
            let parent = history.get(idx + 1).cloned();
            self.nodes.entry(ancestor.clone()).or_insert(RevisionNode {
                parent,
                deleted: false,
                payload: None,
            });
        }

        let parent = history.get(1).cloned();
        let node = self.nodes.entry(rev.clone()).or_insert(RevisionNode {
            parent,
            deleted,
            payload: None,
        });
        node.deleted = deleted;
        node.payload = Some(payload);
        true
    }

    /// Revisions with no children, sorted ascending.
    pub fn leaves(&self) -> Vec<RevisionId> {
        let parents: HashSet<&RevisionId> =
            self.nodes.values().filter_map(|n| n.parent.as_ref()).collect();
        let mut leaves: Vec<RevisionId> = self
            .nodes
            .keys()
            .filter(|r| !parents.contains(r))
            .cloned()
            .collect();
        leaves.sort();
        leaves
    }

    /// Non-deleted leaves, sorted ascending.
    pub fn live_leaves(&self) -> Vec<RevisionId> {
        self.leaves()
            .into_iter()
            .filter(|r| !self.is_deleted(r))
            .collect()
    }

    /// The winning revision, if the tree is not empty.
    pub fn winner(&self) -> Option<RevisionId> {
        self.live_leaves()
            .into_iter()
            .max()
            .or_else(|| self.leaves().into_iter().max())
    }

    /// Live leaves other than the winner.
    pub fn conflicts(&self) -> Vec<RevisionId> {
        let winner = self.winner();
        self.live_leaves()
            .into_iter()
            .filter(|r| Some(r) != winner.as_ref())
            .collect()
    }

    /// Path from `rev` to the root, newest first.
    pub fn ancestry(&self, rev: &RevisionId) -> Vec<RevisionId> {
        let mut path = Vec::new();
        let mut current = Some(rev.clone());
        while let Some(r) = current {
            let Some(node) = self.nodes.get(&r) else {
                break;
            };
            current = node.parent.clone();
            path.push(r);
        }
        path
    }
}
