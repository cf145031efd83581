// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local document store integration.
//!
//! The replicator never touches storage internals. Everything it needs from
//! the local database goes through [`LocalStore`]: the local change feed,
//! revision lookups, and the revision-tree merge on insert.
//!
//! [`MemoryStore`] is a complete in-memory implementation used by the tests
//! and suitable for embedding where durability is not required.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_replicator::store::StoreError> {
//! use doc_replicator::store::{LocalStore, MemoryStore};
//! use serde_json::json;
//!
//! let store = MemoryStore::new("local-db");
//! let rev = store.put("doc1", json!({"title": "hello"})).await?;
//! assert_eq!(store.current_leaves("doc1").await?, vec![rev]);
//! # Ok(())
//! # }
//! ```

use crate::error::ReplicationError;
use crate::revision::{RevisionHistory, RevisionId, RevisionTree};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Result type for local store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for local store operations.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

// ═══════════════════════════════════════════════════════════════════════════════
// Data types shared with the protocol layer
// ═══════════════════════════════════════════════════════════════════════════════

fn is_false(b: &bool) -> bool {
    !*b
}

mod base64_data {
    use super::*;

    pub fn serialize<S: serde::Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// An attachment as it appears in a document's `_attachments` map.
///
/// `data` is `None` for stubs (the receiver already has the content) and for
/// `follows` entries whose bytes travel in a separate MIME part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub revpos: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_data")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stub: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub follows: bool,
}

impl Attachment {
    /// A new inline attachment. Digest, length and revpos are filled in by
    /// the store on write.
    pub fn new(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            digest: String::new(),
            length: 0,
            revpos: 0,
            data: Some(data),
            stub: false,
            follows: false,
        }
    }

    /// The same attachment without its bytes.
    pub fn to_stub(&self) -> Self {
        Self {
            data: None,
            stub: true,
            follows: false,
            ..self.clone()
        }
    }

    /// The same attachment announced as a following MIME part.
    pub fn to_follows(&self) -> Self {
        Self {
            data: None,
            stub: false,
            follows: true,
            ..self.clone()
        }
    }
}

/// Content digest in the form used on the wire.
pub fn attachment_digest(data: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(data)))
}

/// A change in the local change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub sequence: u64,
    pub doc_id: String,
}

/// A revision read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    pub doc_id: String,
    pub rev_id: RevisionId,
    /// Ancestry newest first, starting with `rev_id`.
    pub history: Vec<RevisionId>,
    /// User fields only; underscore-prefixed fields are stripped.
    pub body: Map<String, Value>,
    pub deleted: bool,
    pub attachments: BTreeMap<String, Attachment>,
}

impl StoredRevision {
    /// Wire form with `_id`, `_rev`, `_revisions`, `_deleted` and the given
    /// `_attachments` rendering.
    pub fn to_document(
        &self,
        history: &RevisionHistory,
        attachments: &BTreeMap<String, Attachment>,
    ) -> Value {
        let mut doc = self.body.clone();
        doc.insert("_id".into(), Value::String(self.doc_id.clone()));
        doc.insert("_rev".into(), Value::String(self.rev_id.to_string()));
        if self.deleted {
            doc.insert("_deleted".into(), Value::Bool(true));
        }
        doc.insert(
            "_revisions".into(),
            serde_json::to_value(history).unwrap_or(Value::Null),
        );
        if !attachments.is_empty() {
            doc.insert(
                "_attachments".into(),
                serde_json::to_value(attachments).unwrap_or(Value::Null),
            );
        }
        Value::Object(doc)
    }
}

/// A revision to merge into the store, typically pulled from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRevision {
    pub rev_id: RevisionId,
    /// Ancestry newest first, starting with `rev_id`.
    pub history: Vec<RevisionId>,
    pub body: Map<String, Value>,
    pub deleted: bool,
    pub attachments: BTreeMap<String, Attachment>,
}

impl IncomingRevision {
    /// Parse a document as returned by `GET <doc>?revs=true&attachments=true`.
    pub fn from_document(doc_id: &str, doc: Value) -> crate::Result<Self> {
        let Value::Object(mut body) = doc else {
            return Err(ReplicationError::protocol(
                "GET doc",
                format!("document {doc_id} is not a JSON object"),
            ));
        };

        let rev_id: RevisionId = body
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::protocol("GET doc", format!("{doc_id}: missing _rev")))?
            .parse()
            .map_err(|e| ReplicationError::protocol("GET doc", format!("{doc_id}: {e}")))?;

        let history = match body.remove("_revisions") {
            Some(v) => serde_json::from_value::<RevisionHistory>(v)?.revision_ids(),
            None => vec![rev_id.clone()],
        };
        if history.first() != Some(&rev_id) {
            return Err(ReplicationError::protocol(
                "GET doc",
                format!("{doc_id}: _revisions does not start at {rev_id}"),
            ));
        }

        let deleted = body
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let attachments = match body.remove("_attachments") {
            Some(v) => serde_json::from_value(v)?,
            None => BTreeMap::new(),
        };
        body.retain(|k, _| !k.starts_with('_'));

        Ok(Self {
            rev_id,
            history,
            body,
            deleted,
            attachments,
        })
    }
}

/// Result of merging a revision into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The revision was added to the document's tree.
    Applied,
    /// The revision was already present; nothing changed.
    AlreadyPresent,
    /// The store refused the revision (validation, missing attachment data).
    Rejected(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// LocalStore trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait defining what the replicator needs from the local database.
///
/// Sequences are assigned by the store, start at 1, and increase with every
/// write. A document appears in the change feed once, at its latest sequence.
pub trait LocalStore: Send + Sync + 'static {
    /// Stable identity of this database, part of every checkpoint id.
    fn store_id(&self) -> String;

    /// Latest assigned sequence (0 for an empty store).
    fn last_sequence(&self) -> BoxFuture<'_, u64>;

    /// Receiver that observes the latest sequence after each write.
    fn watch_sequence(&self) -> watch::Receiver<u64>;

    /// Changes with sequence strictly greater than `since`, ascending.
    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, Vec<LocalChange>>;

    /// All leaf revisions of a document, tombstones included. Empty when the
    /// document does not exist or was purged.
    fn current_leaves<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Vec<RevisionId>>;

    /// The subset of `revs` the store does not have.
    fn missing_revisions<'a>(
        &'a self,
        doc_id: &'a str,
        revs: &'a [RevisionId],
    ) -> BoxFuture<'a, Vec<RevisionId>>;

    /// Local revisions with a lower generation than `rev`, usable as
    /// `atts_since` hints when fetching it.
    fn possible_ancestors<'a>(
        &'a self,
        doc_id: &'a str,
        rev: &'a RevisionId,
    ) -> BoxFuture<'a, Vec<RevisionId>>;

    /// Read one revision with its history and attachment data.
    fn get_revision<'a>(
        &'a self,
        doc_id: &'a str,
        rev: &'a RevisionId,
    ) -> BoxFuture<'a, Option<StoredRevision>>;

    /// Merge a revision and its history into the document's tree.
    fn insert_revision<'a>(
        &'a self,
        doc_id: &'a str,
        rev: IncomingRevision,
    ) -> BoxFuture<'a, InsertOutcome>;

    /// Remove a document and all its revisions.
    fn purge<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, ()>;

    /// Live leaves that lost winner selection.
    fn conflicts<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Vec<RevisionId>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Validation hook run before a pulled revision is applied.
pub type Validator = Arc<dyn Fn(&str, &IncomingRevision) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct RevisionPayload {
    body: Map<String, Value>,
    attachments: BTreeMap<String, Attachment>,
}

#[derive(Debug, Default)]
struct DocEntry {
    tree: RevisionTree<RevisionPayload>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    docs: HashMap<String, DocEntry>,
    by_sequence: BTreeMap<u64, String>,
    last_sequence: u64,
}

impl StoreState {
    fn record_change(&mut self, doc_id: &str) -> u64 {
        self.last_sequence += 1;
        let seq = self.last_sequence;
        if let Some(entry) = self.docs.get_mut(doc_id) {
            let previous = std::mem::replace(&mut entry.sequence, seq);
            self.by_sequence.remove(&previous);
        }
        self.by_sequence.insert(seq, doc_id.to_string());
        seq
    }

    fn stored(&self, doc_id: &str, rev: &RevisionId) -> Option<StoredRevision> {
        let entry = self.docs.get(doc_id)?;
        let (payload, deleted) = entry.tree.get(rev)?;
        Some(StoredRevision {
            doc_id: doc_id.to_string(),
            rev_id: rev.clone(),
            history: entry.tree.ancestry(rev),
            body: payload.body.clone(),
            deleted,
            attachments: payload.attachments.clone(),
        })
    }
}

/// In-memory [`LocalStore`].
pub struct MemoryStore {
    store_id: String,
    state: RwLock<StoreState>,
    sequence_tx: watch::Sender<u64>,
    validator: parking_lot::RwLock<Option<Validator>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(store_id: impl Into<String>) -> Self {
        let (sequence_tx, _) = watch::channel(0);
        Self {
            store_id: store_id.into(),
            state: RwLock::new(StoreState::default()),
            sequence_tx,
            validator: parking_lot::RwLock::new(None),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Install a validation hook for incoming revisions.
    pub fn set_validator(&self, validator: Validator) {
        *self.validator.write() = Some(validator);
    }

    /// Make every operation fail, simulating a broken database.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError(format!("store {} is unavailable", self.store_id)));
        }
        Ok(())
    }

    /// Create or update a document locally. The new revision's parent is the
    /// current winner.
    ///
    /// `_attachments` entries carry base64 `data`, or `"stub": true` to keep
    /// the parent's attachment of the same name.
    pub async fn put(&self, doc_id: &str, body: Value) -> StoreResult<RevisionId> {
        self.write_local(doc_id, body, false).await
    }

    /// Write a tombstone on top of the current winner.
    pub async fn delete(&self, doc_id: &str) -> StoreResult<RevisionId> {
        self.write_local(doc_id, Value::Object(Map::new()), true).await
    }

    /// The winning revision of a document.
    pub async fn get_document(&self, doc_id: &str) -> StoreResult<Option<StoredRevision>> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(winner) = state.docs.get(doc_id).and_then(|e| e.tree.winner()) else {
            return Ok(None);
        };
        Ok(state.stored(doc_id, &winner))
    }

    /// Number of documents, tombstoned ones included.
    pub async fn document_count(&self) -> usize {
        self.state.read().await.docs.len()
    }

    async fn write_local(&self, doc_id: &str, body: Value, deleted: bool) -> StoreResult<RevisionId> {
        self.check_available()?;
        let Value::Object(mut body) = body else {
            return Err(StoreError(format!("{doc_id}: body must be a JSON object")));
        };
        let attachments: BTreeMap<String, Attachment> = match body.remove("_attachments") {
            Some(v) => serde_json::from_value(v).map_err(|e| StoreError(format!("{doc_id}: {e}")))?,
            None => BTreeMap::new(),
        };
        body.retain(|k, _| !k.starts_with('_'));

        let mut state = self.state.write().await;
        let entry = state.docs.entry(doc_id.to_string()).or_default();
        let parent = entry.tree.winner();
        let generation = parent.as_ref().map_or(1, |p| p.generation + 1);

        let parent_attachments = parent
            .as_ref()
            .and_then(|p| entry.tree.get(p))
            .map(|(payload, _)| payload.attachments.clone())
            .unwrap_or_default();
        let mut resolved = BTreeMap::new();
        for (name, att) in attachments {
            let att = if att.data.is_some() {
                complete_attachment(att, generation)
            } else {
                parent_attachments
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| StoreError(format!("{doc_id}: no attachment {name} to keep")))?
            };
            resolved.insert(name, att);
        }

        let rev = RevisionId::new(generation, revision_digest(parent.as_ref(), &body, deleted, &resolved));
        let mut history = vec![rev.clone()];
        if let Some(p) = &parent {
            history.extend(entry.tree.ancestry(p));
        }
        entry.tree.insert_with_history(
            &history,
            RevisionPayload {
                body,
                attachments: resolved,
            },
            deleted,
        );
        let seq = state.record_change(doc_id);
        drop(state);

        self.sequence_tx.send_replace(seq);
        tracing::trace!(doc_id, rev = %rev, seq, "Local write");
        Ok(rev)
    }

    async fn merge(&self, doc_id: &str, rev: IncomingRevision) -> StoreResult<InsertOutcome> {
        self.check_available()?;
        let validator = self.validator.read().clone();
        if let Some(validate) = validator {
            if let Err(reason) = validate(doc_id, &rev) {
                return Ok(InsertOutcome::Rejected(reason));
            }
        }

        let mut state = self.state.write().await;
        let entry = state.docs.entry(doc_id.to_string()).or_default();
        if entry.tree.has_payload(&rev.rev_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let mut resolved = BTreeMap::new();
        for (name, att) in rev.attachments {
            if att.data.is_some() {
                resolved.insert(name, complete_attachment(att, rev.rev_id.generation));
                continue;
            }
            let inherited = rev.history.iter().skip(1).find_map(|ancestor| {
                entry
                    .tree
                    .get(ancestor)
                    .and_then(|(payload, _)| payload.attachments.get(&name))
                    .filter(|known| att.digest.is_empty() || known.digest == att.digest)
                    .cloned()
            });
            match inherited {
                Some(known) => {
                    resolved.insert(name, known);
                }
                None => {
                    if entry.tree.is_empty() {
                        state.docs.remove(doc_id);
                    }
                    return Ok(InsertOutcome::Rejected(format!(
                        "missing data for attachment {name}"
                    )));
                }
            }
        }

        entry.tree.insert_with_history(
            &rev.history,
            RevisionPayload {
                body: rev.body,
                attachments: resolved,
            },
            rev.deleted,
        );
        let seq = state.record_change(doc_id);
        drop(state);

        self.sequence_tx.send_replace(seq);
        tracing::trace!(doc_id, rev = %rev.rev_id, seq, "Merged revision");
        Ok(InsertOutcome::Applied)
    }
}

fn complete_attachment(mut att: Attachment, generation: u64) -> Attachment {
    if let Some(data) = &att.data {
        att.digest = attachment_digest(data);
        att.length = data.len() as u64;
    }
    if att.revpos == 0 {
        att.revpos = generation;
    }
    att.stub = false;
    att.follows = false;
    att
}

fn revision_digest(
    parent: Option<&RevisionId>,
    body: &Map<String, Value>,
    deleted: bool,
    attachments: &BTreeMap<String, Attachment>,
) -> String {
    let mut hasher = Sha256::new();
    if let Some(p) = parent {
        hasher.update(p.to_string().as_bytes());
    }
    hasher.update([deleted as u8]);
    // serde_json maps are key-sorted, so this is canonical.
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    for (name, att) in attachments {
        hasher.update(name.as_bytes());
        hasher.update(att.digest.as_bytes());
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

impl LocalStore for MemoryStore {
    fn store_id(&self) -> String {
        self.store_id.clone()
    }

    fn last_sequence(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.read().await.last_sequence)
        })
    }

    fn watch_sequence(&self) -> watch::Receiver<u64> {
        self.sequence_tx.subscribe()
    }

    fn changes_since(&self, since: u64, limit: usize) -> BoxFuture<'_, Vec<LocalChange>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.read().await;
            Ok(state
                .by_sequence
                .range(since.saturating_add(1)..)
                .take(limit)
                .map(|(seq, doc_id)| LocalChange {
                    sequence: *seq,
                    doc_id: doc_id.clone(),
                })
                .collect())
        })
    }

    fn current_leaves<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Vec<RevisionId>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.read().await;
            Ok(state
                .docs
                .get(doc_id)
                .map(|e| e.tree.leaves())
                .unwrap_or_default())
        })
    }

    fn missing_revisions<'a>(
        &'a self,
        doc_id: &'a str,
        revs: &'a [RevisionId],
    ) -> BoxFuture<'a, Vec<RevisionId>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.read().await;
            let entry = state.docs.get(doc_id);
            Ok(revs
                .iter()
                .filter(|r| !entry.is_some_and(|e| e.tree.has_payload(r)))
                .cloned()
                .collect())
        })
    }

    fn possible_ancestors<'a>(
        &'a self,
        doc_id: &'a str,
        rev: &'a RevisionId,
    ) -> BoxFuture<'a, Vec<RevisionId>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.read().await;
            Ok(state
                .docs
                .get(doc_id)
                .map(|e| {
                    e.tree
                        .leaves()
                        .into_iter()
                        .filter(|r| r.generation < rev.generation && e.tree.has_payload(r))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn get_revision<'a>(
        &'a self,
        doc_id: &'a str,
        rev: &'a RevisionId,
    ) -> BoxFuture<'a, Option<StoredRevision>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.read().await.stored(doc_id, rev))
        })
    }

    fn insert_revision<'a>(
        &'a self,
        doc_id: &'a str,
        rev: IncomingRevision,
    ) -> BoxFuture<'a, InsertOutcome> {
        Box::pin(self.merge(doc_id, rev))
    }

    fn purge<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.write().await;
            if let Some(entry) = state.docs.remove(doc_id) {
                state.by_sequence.remove(&entry.sequence);
            }
            Ok(())
        })
    }

    fn conflicts<'a>(&'a self, doc_id: &'a str) -> BoxFuture<'a, Vec<RevisionId>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.read().await;
            Ok(state
                .docs
                .get(doc_id)
                .map(|e| e.tree.conflicts())
                .unwrap_or_default())
        })
    }
}
