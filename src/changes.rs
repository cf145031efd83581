// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote change feed: request building and response parsing.
//!
//! The puller reads `_changes` with `style=all_docs`, so each entry lists
//! every current leaf of the document:
//!
//! ```text
//! {"results": [{"seq": 12, "id": "doc1", "changes": [{"rev": "3-c"}, {"rev": "2-x"}]},
//!              {"seq": 13, "id": "doc2", "changes": [{"rev": "1-a"}], "deleted": true}],
//!  "last_seq": 13}
//! ```
//!
//! Sequences are opaque. CouchDB sends numbers, Sync Gateway sends numbers
//! or strings such as `"12:34"`. They are carried as [`RemoteSequence`] and
//! echoed back verbatim.

use crate::config::FilterSpec;
use crate::error::{ReplicationError, Result};
use crate::revision::RevisionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Opaque position in the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteSequence(String);

impl RemoteSequence {
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON form: a number when the sequence is purely numeric.
    pub fn to_json(&self) -> Value {
        match self.0.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(self.0.clone()),
        }
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RemoteSequence {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteSequence {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self(s)),
            Value::Number(n) => Ok(Self(n.to_string())),
            other => Ok(Self(other.to_string())),
        }
    }
}

/// One document's entry in a change-feed poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub sequence: RemoteSequence,
    pub doc_id: String,
    /// Every current leaf reported for the document.
    pub revisions: Vec<RevisionId>,
    pub deleted: bool,
}

/// One response from `_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesPage {
    pub entries: Vec<ChangeEntry>,
    pub last_seq: Option<RemoteSequence>,
}

#[derive(Deserialize)]
struct RawPage {
    results: Vec<RawChange>,
    #[serde(default)]
    last_seq: Option<RemoteSequence>,
}

#[derive(Deserialize)]
struct RawChange {
    seq: RemoteSequence,
    id: String,
    #[serde(default)]
    changes: Vec<RawRev>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Deserialize)]
struct RawRev {
    rev: String,
}

/// Parse a `_changes` response body.
///
/// Unparseable revision ids inside an entry are dropped with a warning; a
/// body that is not a change feed at all is a protocol error.
pub fn parse_changes(body: &[u8]) -> Result<ChangesPage> {
    let raw: RawPage = serde_json::from_slice(body)
        .map_err(|e| ReplicationError::protocol("_changes", e.to_string()))?;

    let entries = raw
        .results
        .into_iter()
        .map(|change| {
            let revisions = change
                .changes
                .into_iter()
                .filter_map(|r| match r.rev.parse::<RevisionId>() {
                    Ok(rev) => Some(rev),
                    Err(e) => {
                        warn!(doc_id = %change.id, error = %e, "Skipping bad revision in change feed");
                        None
                    }
                })
                .collect();
            ChangeEntry {
                sequence: change.seq,
                doc_id: change.id,
                revisions,
                deleted: change.deleted,
            }
        })
        .collect();

    Ok(ChangesPage {
        entries,
        last_seq: raw.last_seq,
    })
}

/// Feed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Return what is there now.
    Normal,
    /// Hold the request open until something changes or the heartbeat fires.
    LongPoll,
}

impl FeedMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::LongPoll => "longpoll",
        }
    }
}

/// Parameters for one `_changes` request.
#[derive(Debug, Clone)]
pub struct ChangesQuery {
    pub mode: FeedMode,
    pub since: Option<RemoteSequence>,
    pub limit: usize,
    pub heartbeat: Option<Duration>,
    pub filter: Option<FilterSpec>,
    pub doc_ids: Vec<String>,
}

impl ChangesQuery {
    /// Relative URL for a GET request, e.g.
    /// `_changes?feed=normal&style=all_docs&since=12&limit=100`.
    pub fn to_relative_url(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("feed", self.mode.as_str());
        query.append_pair("style", "all_docs");
        if let Some(since) = &self.since {
            query.append_pair("since", since.as_str());
        }
        query.append_pair("limit", &self.limit.to_string());
        if let Some(heartbeat) = self.heartbeat {
            query.append_pair("heartbeat", &heartbeat.as_millis().to_string());
        }
        if let Some(filter) = &self.filter {
            query.append_pair("filter", &filter.name);
            for (key, value) in &filter.params {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                query.append_pair(key, &rendered);
            }
        }
        if !self.doc_ids.is_empty() {
            query.append_pair("doc_ids", &Value::from(self.doc_ids.clone()).to_string());
        }
        format!("_changes?{}", query.finish())
    }

    /// JSON body for a POST request (Sync Gateway 0.93+).
    pub fn to_post_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("feed".into(), Value::from(self.mode.as_str()));
        body.insert("style".into(), Value::from("all_docs"));
        if let Some(since) = &self.since {
            body.insert("since".into(), since.to_json());
        }
        body.insert("limit".into(), Value::from(self.limit));
        if let Some(heartbeat) = self.heartbeat {
            body.insert("heartbeat".into(), Value::from(heartbeat.as_millis() as u64));
        }
        if let Some(filter) = &self.filter {
            body.insert("filter".into(), Value::from(filter.name.clone()));
            for (key, value) in &filter.params {
                body.insert(key.clone(), value.clone());
            }
        }
        if !self.doc_ids.is_empty() {
            body.insert("doc_ids".into(), Value::from(self.doc_ids.clone()));
        }
        Value::Object(body)
    }
}
