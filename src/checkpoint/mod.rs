// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoints: where each role resumes after an interruption.
//!
//! Each role (push, pull) of a session has one checkpoint, stored on the
//! peer as `_local/<checkpoint id>`:
//!
//! ```text
//! {"_id": "_local/3f2a...", "_rev": "0-4", "lastSequence": "1234"}
//! ```
//!
//! The id is a digest of everything that determines which documents the role
//! sees, so two sessions with equivalent configs share progress and any real
//! difference starts over.
//!
//! # Save Protocol
//!
//! ```text
//! advance(seq) ──▶ pending ──flush()──▶ PUT _local/<id> ──▶ mirror.set
//!                                          │ 409
//!                                          ▼
//!                              GET, retry PUT once with fresh _rev
//!                                          │ 409 again
//!                                          ▼
//!                              CheckpointConflict (pending kept)
//! ```

mod mirror;

pub use mirror::{CheckpointMirror, IN_MEMORY_PATH};

use crate::config::FilterSpec;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::PeerClient;
use crate::replication::Role;
use crate::resilience::{retry_transient, HaltSignal, RetryConfig};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointId
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable identity of one role's progress (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Derive the id from the inputs that decide what the role replicates.
    ///
    /// Filter parameter order and doc-id order/duplicates do not matter.
    pub fn derive(
        store_id: &str,
        remote_url: &str,
        role: Role,
        filter: Option<&FilterSpec>,
        doc_ids: &BTreeSet<String>,
    ) -> Self {
        let params: Value = filter
            .map(|f| Value::Object(f.params.clone().into_iter().collect()))
            .unwrap_or(Value::Null);
        let identity = json!({
            "localUUID": store_id,
            "remoteURL": remote_url,
            "push": role == Role::Push,
            "filter": filter.map(|f| f.name.clone()),
            "filterParams": params,
            "docids": doc_ids.iter().collect::<Vec<_>>(),
        });
        let digest = Sha256::digest(canonical_json(&identity).as_bytes());
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire id of the remote document, `_local/<id>`.
    pub fn local_doc_id(&self) -> String {
        format!("_local/{}", self.0)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Remote record
// ═══════════════════════════════════════════════════════════════════════════════

/// A checkpoint as stored on the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub checkpoint_id: CheckpointId,
    pub last_sequence: Option<String>,
    /// `_rev` of the remote document, needed to overwrite it.
    pub remote_rev: Option<String>,
}

impl CheckpointRecord {
    fn from_document(checkpoint_id: CheckpointId, doc: &Value) -> Self {
        let last_sequence = match doc.get("lastSequence") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Self {
            checkpoint_id,
            last_sequence,
            remote_rev: doc.get("_rev").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// `_local/<id>` documents on the peer.
#[derive(Clone)]
pub struct RemoteCheckpointStore {
    peer: Arc<PeerClient>,
}

impl RemoteCheckpointStore {
    pub fn new(peer: Arc<PeerClient>) -> Self {
        Self { peer }
    }

    /// Read a checkpoint. `None` when the peer has never seen it.
    pub async fn get(&self, id: &CheckpointId) -> Result<Option<CheckpointRecord>> {
        let doc = self.peer.get_local(id.as_str()).await?;
        Ok(doc.map(|doc| CheckpointRecord::from_document(id.clone(), &doc)))
    }

    /// Write `last_sequence` over the revision `remote_rev`. Returns the new
    /// revision tag.
    ///
    /// A 409 is resolved by re-reading the document and retrying once with
    /// its current revision. A second 409 is a [`ReplicationError::CheckpointConflict`].
    pub async fn put(
        &self,
        id: &CheckpointId,
        last_sequence: &str,
        remote_rev: Option<&str>,
    ) -> Result<String> {
        match self.put_once(id, last_sequence, remote_rev).await {
            Err(e) if e.status() == Some(409) => {
                debug!(checkpoint_id = %id, "Checkpoint changed remotely, re-reading");
                let fresh = self.get(id).await?.and_then(|r| r.remote_rev);
                match self.put_once(id, last_sequence, fresh.as_deref()).await {
                    Err(e) if e.status() == Some(409) => Err(ReplicationError::CheckpointConflict {
                        checkpoint_id: id.to_string(),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn put_once(
        &self,
        id: &CheckpointId,
        last_sequence: &str,
        remote_rev: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({
            "_id": id.local_doc_id(),
            "lastSequence": last_sequence,
        });
        if let Some(rev) = remote_rev {
            body["_rev"] = Value::from(rev);
        }
        self.peer.put_local(id.as_str(), &body).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpointer
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns one role's checkpoint for the length of a session.
///
/// Only the owning role task touches it, so saves for one id are serialized.
pub struct Checkpointer {
    id: CheckpointId,
    role: Role,
    remote: RemoteCheckpointStore,
    mirror: Option<Arc<CheckpointMirror>>,
    retry: RetryConfig,
    remote_rev: Option<String>,
    /// Last value the peer acknowledged.
    saved: Option<String>,
    /// Latest value, saved or not.
    current: Option<String>,
}

impl Checkpointer {
    pub fn new(
        id: CheckpointId,
        role: Role,
        remote: RemoteCheckpointStore,
        mirror: Option<Arc<CheckpointMirror>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            id,
            role,
            remote,
            mirror,
            retry,
            remote_rev: None,
            saved: None,
            current: None,
        }
    }

    pub fn id(&self) -> &CheckpointId {
        &self.id
    }

    /// Read the starting position.
    ///
    /// With a mirror, a remote value that disagrees with the mirrored one is
    /// discarded and the role starts from the beginning.
    pub async fn load(&mut self, halt: &HaltSignal) -> Result<Option<String>> {
        let record = retry_transient(&self.retry, "_local", halt, || self.remote.get(&self.id)).await?;
        let (remote_seq, remote_rev) = match record {
            Some(r) => (r.last_sequence, r.remote_rev),
            None => (None, None),
        };
        self.remote_rev = remote_rev;

        let mut start = remote_seq.clone();
        if let Some(mirror) = &self.mirror {
            if let Some(mirrored) = mirror.get(self.id.as_str()).await {
                if remote_seq.as_deref() != Some(mirrored.as_str()) {
                    warn!(
                        checkpoint_id = %self.id,
                        remote = ?remote_seq,
                        mirrored = %mirrored,
                        "Remote checkpoint disagrees with local mirror, starting over"
                    );
                    start = None;
                }
            }
        }

        info!(checkpoint_id = %self.id, role = %self.role, seq = ?start, "Loaded checkpoint");
        self.saved = remote_seq;
        self.current = start.clone();
        Ok(start)
    }

    /// Latest sequence, saved or not.
    pub fn last_sequence(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Last sequence the peer acknowledged.
    pub fn saved_sequence(&self) -> Option<&str> {
        self.saved.as_deref()
    }

    /// Record progress in memory. Persisted by the next [`flush`](Self::flush).
    pub fn advance(&mut self, sequence: impl Into<String>) {
        self.current = Some(sequence.into());
    }

    pub fn is_dirty(&self) -> bool {
        self.current.is_some() && self.current != self.saved
    }

    /// Save the in-memory sequence to the peer, then to the mirror.
    ///
    /// Returns `true` if something was written. On error the in-memory value
    /// is kept for the next attempt.
    pub async fn flush(&mut self, halt: &HaltSignal) -> Result<bool> {
        let Some(seq) = self.current.clone().filter(|_| self.is_dirty()) else {
            return Ok(false);
        };

        let result = retry_transient(&self.retry, "_local", halt, || {
            self.remote.put(&self.id, &seq, self.remote_rev.as_deref())
        })
        .await;

        match result {
            Ok(rev) => {
                metrics::record_checkpoint_save(self.role.as_str(), true);
                debug!(checkpoint_id = %self.id, seq = %seq, "Checkpoint saved");
                self.remote_rev = Some(rev);
                self.saved = Some(seq.clone());
                if let Some(mirror) = &self.mirror {
                    mirror.set(self.id.as_str(), &seq).await;
                    if let Err(e) = mirror.flush_dirty().await {
                        warn!(checkpoint_id = %self.id, error = %e, "Mirror flush failed");
                    }
                }
                Ok(true)
            }
            Err(e) => {
                if matches!(e, ReplicationError::CheckpointConflict { .. }) {
                    metrics::record_checkpoint_conflict(self.role.as_str());
                }
                metrics::record_checkpoint_save(self.role.as_str(), false);
                warn!(checkpoint_id = %self.id, seq = %seq, error = %e, "Checkpoint save failed");
                Err(e)
            }
        }
    }
}
