// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push role: local changes to the peer.
//!
//! ```text
//! changes_since ──LocalChange──▶ Batcher ──▶ consumer
//!   │ watch_sequence when caught up            │ current_leaves (purged → done)
//!   ▼                                          │ _revs_diff
//! SequenceTracker.add                          │ _bulk_docs (stubs only, chunked)
//!                                              │ PUT multipart (new attachment data)
//!                                              ▼
//!                                SequenceTracker.complete/fail ──▶ Checkpointer
//! ```

use super::role::{
    save_checkpoint, settle, went_offline, ItemResult, RoleContext, RoleOutcome, SessionContext, TrackedItem,
};
use super::types::Role;
use crate::batch::{batcher, BatchReceiver, BatchSender};
use crate::checkpoint::Checkpointer;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{retry_transient, HaltSignal};
use crate::revision::{RevisionHistory, RevisionId};
use crate::revs_diff::{revs_diff, RevsDiffEntry};
use crate::sequence::{SequenceToken, SequenceTracker};
use crate::store::{Attachment, LocalChange, LocalStore, StoredRevision};
use crate::transport::MultipartPart;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

type Tracker = Arc<Mutex<SequenceTracker<u64>>>;

struct PushItem {
    token: SequenceToken,
    change: LocalChange,
}

impl TrackedItem for PushItem {
    fn token(&self) -> SequenceToken {
        self.token
    }

    fn doc_id(&self) -> &str {
        &self.change.doc_id
    }
}

/// Run the push role until caught up (one-shot), halted, or failed.
pub(crate) async fn run<S: LocalStore>(
    ctx: Arc<SessionContext<S>>,
    mut checkpointer: Checkpointer,
    mut role: RoleContext,
) -> RoleOutcome {
    let since = checkpointer.last_sequence().and_then(|s| s.parse::<u64>().ok());
    info!(since = ?since, "Starting pusher");

    let tracker: Tracker = Arc::new(Mutex::new(SequenceTracker::new(since)));
    let (tx, mut rx) = batcher(ctx.config.settings.batch.batch_config());

    let scan = tokio::spawn(
        scan_loop(Arc::clone(&ctx), Arc::clone(&tracker), tx, since.unwrap_or(0), role.clone())
            .instrument(tracing::Span::current()),
    );

    let mut result = consume(&ctx, &mut checkpointer, &tracker, &mut rx, &mut role).await;
    rx.close();
    if result.is_err() {
        scan.abort();
    }

    let scan_result = match scan.await {
        Ok(r) => r,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ReplicationError::Internal(format!("scan task: {e}"))),
    };
    if result.is_ok() {
        result = scan_result;
    }

    save_checkpoint(&mut checkpointer, &HaltSignal::never(), &role.events).await;
    info!(checkpoint = ?checkpointer.last_sequence(), ok = result.is_ok(), "Pusher stopped");
    RoleOutcome {
        role: Role::Push,
        checkpointer,
        result,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Local change scan
// ═══════════════════════════════════════════════════════════════════════════════

/// Page through the local change feed into the batcher. Continuous sessions
/// then wait for the store's sequence to move past what was read.
async fn scan_loop<S: LocalStore>(
    ctx: Arc<SessionContext<S>>,
    tracker: Tracker,
    tx: BatchSender<PushItem>,
    mut since: u64,
    mut role: RoleContext,
) -> Result<()> {
    let limit = ctx.config.settings.change_feed.page_limit;
    let mut sequence = ctx.store.watch_sequence();

    loop {
        if !role.wait_online().await {
            return Ok(());
        }

        let changes = ctx.store.changes_since(since, limit).await?;
        if changes.is_empty() {
            if !ctx.config.continuous {
                debug!(since, "Local changes exhausted");
                return Ok(());
            }
            role.events.caught_up();

            // A purge can leave the sequence ahead of the last change read.
            let floor = since.max(*sequence.borrow_and_update());
            let mut halt = role.halt.clone();
            tokio::select! {
                biased;
                _ = halt.halted() => return Ok(()),
                _ = went_offline(role.online.clone()) => continue,
                changed = sequence.wait_for(|latest| *latest > floor) => {
                    if changed.is_err() {
                        debug!("Local store closed its sequence channel");
                        return Ok(());
                    }
                }
            }
            continue;
        }

        role.events.discovered(changes.len());
        for change in changes {
            since = since.max(change.sequence);
            let token = tracker.lock().add(change.sequence);
            let mut halt = role.halt.clone();
            tokio::select! {
                biased;
                _ = halt.halted() => return Ok(()),
                sent = tx.send(PushItem { token, change }) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumer
// ═══════════════════════════════════════════════════════════════════════════════

async fn consume<S: LocalStore>(
    ctx: &SessionContext<S>,
    checkpointer: &mut Checkpointer,
    tracker: &Tracker,
    rx: &mut BatchReceiver<PushItem>,
    role: &mut RoleContext,
) -> Result<()> {
    loop {
        let mut halt = role.halt.clone();
        // The slots stay held until the batch is settled and checkpointed.
        let (batch, _slots) = tokio::select! {
            biased;
            _ = halt.halted() => return Ok(()),
            batch = rx.next_batch() => match batch {
                Some(batch) => batch.into_parts(),
                None => return Ok(()),
            },
        };
        if !role.wait_online().await {
            return Ok(());
        }

        let started = Instant::now();
        let size = batch.len();
        let mut pending = batch;
        loop {
            let results = push_batch(ctx, &pending, &role.halt).await?;
            let settled = settle(&**tracker, checkpointer, &role.events, pending, results);
            let Some(error) = settled.retry_error else {
                break;
            };
            if !ctx.config.continuous {
                return Err(error);
            }
            warn!(items = settled.retry.len(), error = %error, "Upload failed, retrying batch later");
            role.events.failed(error);
            if !role.pause(ctx.config.settings.retry.continuous_retry_delay_duration()).await
                && !role.wait_online().await
            {
                return Ok(());
            }
            pending = settled.retry;
        }
        metrics::record_batch(Role::Push.as_str(), size, started.elapsed());

        save_checkpoint(checkpointer, &role.halt, &role.events).await;
    }
}

/// One revision ready to send.
struct Upload {
    doc_id: String,
    /// Attachments the peer has are stubs; new ones are `follows`.
    document: Value,
    parts: Vec<MultipartPart>,
    /// Same revision with new attachment data inline, for peers that refuse
    /// multipart bodies.
    inline: Option<Value>,
}

impl Upload {
    fn has_attachment_data(&self) -> bool {
        !self.parts.is_empty()
    }
}

/// Build the upload for `stored`, trimming its history and attachments to
/// what the peer lacks.
fn prepare_upload(stored: &StoredRevision, diff: &RevsDiffEntry) -> Upload {
    let history = RevisionHistory::from_ancestry(&stored.history).trimmed_to(&diff.possible_ancestors);
    let known_generation = diff.known_generation();

    let mut announced: BTreeMap<String, Attachment> = BTreeMap::new();
    let mut inline: BTreeMap<String, Attachment> = BTreeMap::new();
    let mut parts = Vec::new();
    for (name, attachment) in &stored.attachments {
        let peer_has_it = known_generation > 0 && attachment.revpos <= known_generation;
        match &attachment.data {
            Some(data) if !peer_has_it => {
                announced.insert(name.clone(), attachment.to_follows());
                inline.insert(
                    name.clone(),
                    Attachment {
                        stub: false,
                        follows: false,
                        ..attachment.clone()
                    },
                );
                parts.push(MultipartPart {
                    filename: Some(name.clone()),
                    content_type: attachment.content_type.clone(),
                    data: data.clone(),
                });
            }
            _ => {
                announced.insert(name.clone(), attachment.to_stub());
                inline.insert(name.clone(), attachment.to_stub());
            }
        }
    }

    let inline = (!parts.is_empty()).then(|| stored.to_document(&history, &inline));
    Upload {
        doc_id: stored.doc_id.clone(),
        document: stored.to_document(&history, &announced),
        parts,
        inline,
    }
}

/// Send every revision the peer is missing for the documents in `items`.
///
/// Returns one result per item. An item fails if any revision of its
/// document failed.
async fn push_batch<S: LocalStore>(
    ctx: &SessionContext<S>,
    items: &[PushItem],
    halt: &HaltSignal,
) -> Result<Vec<ItemResult>> {
    let mut results: Vec<ItemResult> = items.iter().map(|_| ItemResult::Done).collect();

    // 1. Current leaves. Purged or filtered documents are done as they are.
    let mut candidates: BTreeMap<String, Vec<RevisionId>> = BTreeMap::new();
    let mut items_by_doc: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let doc_id = item.change.doc_id.as_str();
        if !ctx.config.doc_ids.is_empty() && !ctx.config.doc_ids.contains(doc_id) {
            continue;
        }
        let mut leaves = ctx.store.current_leaves(doc_id).await?;
        if leaves.is_empty() {
            debug!(doc_id, "Document purged before upload");
            continue;
        }
        if let Some(filter) = &ctx.push_filter {
            let mut kept = Vec::with_capacity(leaves.len());
            for rev in leaves {
                if let Some(stored) = ctx.store.get_revision(doc_id, &rev).await? {
                    if filter(&stored) {
                        kept.push(rev);
                    }
                }
            }
            leaves = kept;
        }
        if leaves.is_empty() {
            continue;
        }
        items_by_doc.entry(doc_id).or_default().push(index);
        let revs = candidates.entry(doc_id.to_string()).or_default();
        revs.extend(leaves);
        revs.sort();
        revs.dedup();
    }
    if candidates.is_empty() {
        return Ok(results);
    }

    // 2. What the peer lacks.
    let diff = match retry_transient(&ctx.retry, "_revs_diff", halt, || revs_diff(&ctx.peer, &candidates)).await {
        Ok(diff) => diff,
        Err(e) => {
            for indices in items_by_doc.values() {
                for &index in indices {
                    results[index] = ItemResult::from_error(e.duplicate())?;
                }
            }
            return Ok(results);
        }
    };

    // 3. Read and shape each missing revision.
    let mut bulk = Vec::new();
    let mut multipart = Vec::new();
    for (doc_id, entry) in &diff {
        for rev in &entry.missing {
            let Some(stored) = ctx.store.get_revision(doc_id, rev).await? else {
                debug!(doc_id = %doc_id, rev = %rev, "Revision gone before upload");
                continue;
            };
            let upload = prepare_upload(&stored, entry);
            if upload.has_attachment_data() {
                multipart.push(upload);
            } else {
                bulk.push(upload);
            }
        }
    }
    debug!(
        documents = diff.len(),
        bulk = bulk.len(),
        multipart = multipart.len(),
        "Uploading revisions"
    );

    // 4. Upload, keeping the first error per document.
    let mut doc_errors: HashMap<String, ReplicationError> = HashMap::new();
    let mut pushed = 0;

    let chunk_size = ctx.config.settings.batch.inbox_capacity.max(1);
    for chunk in bulk.chunks(chunk_size) {
        let docs: Vec<Value> = chunk.iter().map(|u| u.document.clone()).collect();
        match retry_transient(&ctx.retry, "_bulk_docs", halt, || ctx.peer.bulk_docs(docs.clone())).await {
            Ok(rows) => {
                if let Some(stray) = rows.iter().find(|r| !chunk.iter().any(|u| u.doc_id == r.id)) {
                    let e = ReplicationError::protocol(
                        "_bulk_docs",
                        format!("response row for {:?} matches no uploaded document", stray.id),
                    );
                    warn!(error = %e, "Unusable _bulk_docs response, failing the chunk");
                    for upload in chunk {
                        doc_errors.entry(upload.doc_id.clone()).or_insert_with(|| e.duplicate());
                    }
                    continue;
                }
                let mut rejected = 0;
                for row in rows.into_iter().filter(|r| r.is_error()) {
                    rejected += 1;
                    let reason = match (&row.error, &row.reason) {
                        (Some(error), Some(reason)) => format!("{error}: {reason}"),
                        (Some(error), None) => error.clone(),
                        _ => "rejected".to_string(),
                    };
                    let error = ReplicationError::PermanentRejection {
                        operation: "_bulk_docs".to_string(),
                        status: row.status,
                        doc_id: Some(row.id.clone()),
                        reason,
                    };
                    doc_errors.entry(row.id).or_insert(error);
                }
                pushed += chunk.len().saturating_sub(rejected);
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                for upload in chunk {
                    doc_errors.entry(upload.doc_id.clone()).or_insert_with(|| e.duplicate());
                }
            }
        }
    }

    for upload in &multipart {
        match upload_with_attachments(ctx, upload, halt).await {
            Ok(()) => pushed += 1,
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                doc_errors.entry(upload.doc_id.clone()).or_insert(e);
            }
        }
    }
    metrics::record_revisions_pushed(pushed);

    // 5. Per-item outcome.
    for (doc_id, indices) in items_by_doc {
        if let Some(error) = doc_errors.get(doc_id) {
            for index in indices {
                results[index] = ItemResult::from_error(error.duplicate())?;
            }
        }
    }
    Ok(results)
}

/// `PUT` one revision as `multipart/related`, falling back to inline JSON
/// when the peer answers 415.
async fn upload_with_attachments<S: LocalStore>(
    ctx: &SessionContext<S>,
    upload: &Upload,
    halt: &HaltSignal,
) -> Result<()> {
    let result = retry_transient(&ctx.retry, "PUT doc", halt, || {
        ctx.peer
            .put_document_multipart(&upload.doc_id, &upload.document, &upload.parts)
    })
    .await;

    match (result, &upload.inline) {
        (Err(e), Some(inline)) if e.status() == Some(415) => {
            debug!(doc_id = %upload.doc_id, "Peer refused multipart upload, sending inline JSON");
            retry_transient(&ctx.retry, "PUT doc", halt, || ctx.peer.put_document_json(&upload.doc_id, inline)).await
        }
        (result, _) => result,
    }
}
