// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull role: remote change feed into the local store.
//!
//! ```text
//! feed loop ──ChangeEntry──▶ Batcher ──▶ consumer
//!   │ _changes (normal, paged)              │ missing_revisions
//!   │ then longpoll when continuous         │ GET doc / _bulk_get
//!   ▼                                       │ insert_revision (ascending generation)
//! SequenceTracker.add                       ▼
//!                              SequenceTracker.complete/fail ──▶ Checkpointer
//! ```
//!
//! The feed loop and the consumer run concurrently; the tracker is shared
//! so the checkpoint only covers entries whose revisions are all applied.

use super::role::{
    save_checkpoint, settle, went_offline, FeedSubscription, ItemResult, RoleContext, RoleOutcome, SessionContext,
    TrackedItem,
};
use super::types::Role;
use crate::batch::{batcher, BatchReceiver, BatchSender};
use crate::changes::{ChangeEntry, ChangesQuery, FeedMode, RemoteSequence};
use crate::checkpoint::Checkpointer;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::{BulkGetItem, BulkGetRequest};
use crate::resilience::{retry_transient, HaltSignal};
use crate::revision::RevisionId;
use crate::sequence::{SequenceToken, SequenceTracker};
use crate::store::{IncomingRevision, InsertOutcome, LocalStore};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

type Tracker = Arc<Mutex<SequenceTracker<RemoteSequence>>>;

struct PullItem {
    token: SequenceToken,
    entry: ChangeEntry,
}

/// Run the pull role until caught up (one-shot), halted, or failed.
pub(crate) async fn run<S: LocalStore>(
    ctx: Arc<SessionContext<S>>,
    mut checkpointer: Checkpointer,
    mut role: RoleContext,
) -> RoleOutcome {
    let since = checkpointer.last_sequence().map(RemoteSequence::new);
    info!(since = ?since.as_ref().map(RemoteSequence::as_str), "Starting puller");

    let tracker: Tracker = Arc::new(Mutex::new(SequenceTracker::new(since.clone())));
    let (tx, mut rx) = batcher(ctx.config.settings.batch.batch_config());

    let feed = tokio::spawn(
        feed_loop(Arc::clone(&ctx), Arc::clone(&tracker), tx, since, role.clone())
            .instrument(tracing::Span::current()),
    );

    let mut result = consume(&ctx, &mut checkpointer, &tracker, &mut rx, &mut role).await;
    rx.close();
    if result.is_err() {
        // A long poll may be open; nothing will read what it returns.
        feed.abort();
    }

    let feed_result = match feed.await {
        Ok(r) => r,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ReplicationError::Internal(format!("feed task: {e}"))),
    };
    if result.is_ok() {
        result = feed_result;
    }

    save_checkpoint(&mut checkpointer, &HaltSignal::never(), &role.events).await;
    info!(checkpoint = ?checkpointer.last_sequence(), ok = result.is_ok(), "Puller stopped");
    RoleOutcome {
        role: Role::Pull,
        checkpointer,
        result,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed
// ═══════════════════════════════════════════════════════════════════════════════

/// Read the change feed into the batcher.
///
/// Each pass starts with a paged `feed=normal` catch-up. Continuous sessions
/// then switch to `feed=longpoll`; going offline aborts the open request and
/// the next pass catches up again.
async fn feed_loop<S: LocalStore>(
    ctx: Arc<SessionContext<S>>,
    tracker: Tracker,
    tx: BatchSender<PullItem>,
    mut since: Option<RemoteSequence>,
    mut role: RoleContext,
) -> Result<()> {
    let settings = &ctx.config.settings;
    let continuous = ctx.config.continuous;
    let filter = ctx.config.effective_filter();
    let doc_ids: Vec<String> = ctx.config.doc_ids.iter().cloned().collect();
    let limit = settings.change_feed.page_limit;
    let mut catching_up = true;

    loop {
        if !role.wait_online().await {
            return Ok(());
        }

        let mode = if catching_up { FeedMode::Normal } else { FeedMode::LongPoll };
        let query = ChangesQuery {
            mode,
            since: since.clone(),
            limit,
            heartbeat: (mode == FeedMode::LongPoll).then(|| settings.change_feed.heartbeat_duration()),
            filter: filter.clone(),
            doc_ids: doc_ids.clone(),
        };

        let result = {
            let _subscription = FeedSubscription::open(&ctx.feed_subscriptions);
            let mut halt = role.halt.clone();
            tokio::select! {
                biased;
                _ = halt.halted() => return Ok(()),
                _ = went_offline(role.online.clone()) => {
                    debug!("Went offline, closing change feed");
                    catching_up = true;
                    continue;
                }
                r = retry_transient(&ctx.retry, "_changes", &role.halt, || ctx.peer.changes(&query)) => r,
            }
        };

        let page = match result {
            Ok(page) => page,
            Err(ReplicationError::Shutdown) => return Ok(()),
            Err(e) if e.is_session_fatal() || !continuous => return Err(e),
            Err(e) => {
                warn!(error = %e, "Change feed failed, retrying later");
                role.events.failed(e);
                if !role.pause(settings.retry.continuous_retry_delay_duration()).await && role.halt.is_halted() {
                    return Ok(());
                }
                catching_up = true;
                continue;
            }
        };

        let count = page.entries.len();
        debug!(mode = ?mode, count, last_seq = ?page.last_seq.as_ref().map(RemoteSequence::as_str), "Change feed page");
        if let Some(last) = page.entries.last() {
            since = Some(last.sequence.clone());
        }
        if let Some(last_seq) = page.last_seq.clone() {
            since = Some(last_seq);
        }

        role.events.discovered(count);
        for entry in page.entries {
            let token = tracker.lock().add(entry.sequence.clone());
            let mut halt = role.halt.clone();
            tokio::select! {
                biased;
                _ = halt.halted() => return Ok(()),
                sent = tx.send(PullItem { token, entry }) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        match mode {
            FeedMode::Normal if count < limit => {
                if !continuous {
                    debug!("Caught up, closing one-shot feed");
                    return Ok(());
                }
                catching_up = false;
                role.events.caught_up();
            }
            FeedMode::LongPoll if count == 0 => role.events.caught_up(),
            _ => {}
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
    rx: &mut BatchReceiver<PullItem>,
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
            let results = apply_batch(ctx, &pending, &role.halt).await?;
            let settled = settle(&**tracker, checkpointer, &role.events, pending, results);
            let Some(error) = settled.retry_error else {
                break;
            };
            if !ctx.config.continuous {
                return Err(error);
            }
            warn!(items = settled.retry.len(), error = %error, "Fetch failed, retrying batch later");
            role.events.failed(error);
            if !role.pause(ctx.config.settings.retry.continuous_retry_delay_duration()).await
                && !role.wait_online().await
            {
                return Ok(());
            }
            pending = settled.retry;
        }
        metrics::record_batch(Role::Pull.as_str(), size, started.elapsed());

        save_checkpoint(checkpointer, &role.halt, &role.events).await;
    }
}

impl TrackedItem for PullItem {
    fn token(&self) -> SequenceToken {
        self.token
    }

    fn doc_id(&self) -> &str {
        &self.entry.doc_id
    }
}

/// A revision to fetch, tagged with the batch index of its entry.
struct Fetch {
    item: usize,
    doc_id: String,
    rev: RevisionId,
    atts_since: Vec<RevisionId>,
}

/// Fetch and insert every missing revision of every entry in the batch.
///
/// Returns one result per item. Session-fatal errors (local storage, auth)
/// abort the whole batch.
async fn apply_batch<S: LocalStore>(
    ctx: &SessionContext<S>,
    items: &[PullItem],
    halt: &HaltSignal,
) -> Result<Vec<ItemResult>> {
    let mut results: Vec<ItemResult> = items.iter().map(|_| ItemResult::Done).collect();

    // 1. What is missing locally.
    let mut fetches = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let entry = &item.entry;
        let missing = ctx.store.missing_revisions(&entry.doc_id, &entry.revisions).await?;
        for rev in missing {
            let atts_since = ctx.store.possible_ancestors(&entry.doc_id, &rev).await?;
            fetches.push(Fetch {
                item: index,
                doc_id: entry.doc_id.clone(),
                rev,
                atts_since,
            });
        }
    }
    if fetches.is_empty() {
        return Ok(results);
    }
    debug!(entries = items.len(), revisions = fetches.len(), "Fetching missing revisions");

    // 2. Fetch.
    let fetched = fetch_revisions(ctx, &fetches, halt).await?;

    // 3. Apply per item, parents first.
    let mut per_item: HashMap<usize, Vec<(u64, std::result::Result<Value, ReplicationError>)>> = HashMap::new();
    for (fetch, outcome) in fetches.iter().zip(fetched) {
        per_item
            .entry(fetch.item)
            .or_default()
            .push((fetch.rev.generation, outcome));
    }

    let mut applied = 0;
    for (index, item) in items.iter().enumerate() {
        let Some(mut revisions) = per_item.remove(&index) else {
            continue;
        };
        revisions.sort_by_key(|(generation, _)| *generation);
        let doc_id = &item.entry.doc_id;

        for (_, outcome) in revisions {
            let doc = match outcome {
                Ok(doc) => doc,
                Err(e) => {
                    results[index] = ItemResult::from_error(e)?;
                    continue;
                }
            };
            let incoming = match IncomingRevision::from_document(doc_id, doc) {
                Ok(rev) => rev,
                Err(e) => {
                    results[index] = ItemResult::Failed(e);
                    continue;
                }
            };
            let rev_id = incoming.rev_id.clone();
            match ctx.store.insert_revision(doc_id, incoming).await? {
                InsertOutcome::Applied => applied += 1,
                InsertOutcome::AlreadyPresent => {}
                InsertOutcome::Rejected(reason) => {
                    debug!(doc_id = %doc_id, rev = %rev_id, reason = %reason, "Local store rejected revision");
                    results[index] = ItemResult::Failed(ReplicationError::rejected("insert", doc_id.clone(), reason));
                }
            }
        }
    }
    metrics::record_revisions_pulled(applied);
    Ok(results)
}

/// Fetch revisions, in bulk when the peer supports it and there are enough.
/// One result per fetch, in order.
async fn fetch_revisions<S: LocalStore>(
    ctx: &SessionContext<S>,
    fetches: &[Fetch],
    halt: &HaltSignal,
) -> Result<Vec<std::result::Result<Value, ReplicationError>>> {
    let threshold = ctx.config.settings.batch.bulk_get_threshold;
    if ctx.peer.supports_bulk_get() && fetches.len() > threshold {
        let requests: Vec<BulkGetRequest> = fetches
            .iter()
            .map(|f| BulkGetRequest {
                doc_id: f.doc_id.clone(),
                rev: f.rev.clone(),
                atts_since: f.atts_since.clone(),
            })
            .collect();
        match retry_transient(&ctx.retry, "_bulk_get", halt, || ctx.peer.bulk_get(&requests)).await {
            Ok(items) => return Ok(match_bulk_get(fetches, items)),
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) if !ctx.peer.supports_bulk_get() => {
                debug!(error = %e, "Falling back to individual fetches");
            }
            Err(e) => return Ok(fetches.iter().map(|_| Err(e.duplicate())).collect()),
        }
    }

    let timeout = ctx.config.settings.retry.request_timeout_duration();
    let concurrency = ctx.config.settings.request_pool_size.max(1);
    let requests: Vec<BoxFuture<'_, Result<Value>>> = fetches
        .iter()
        .map(|f| {
            retry_transient(&ctx.retry, "GET doc", halt, move || {
                ctx.peer.get_revision(&f.doc_id, &f.rev, &f.atts_since, Some(timeout))
            })
            .boxed()
        })
        .collect();
    let results = stream::iter(requests).buffered(concurrency).collect::<Vec<_>>().await;
    Ok(results)
}

/// Line `_bulk_get` results up with the requested fetches.
fn match_bulk_get(
    fetches: &[Fetch],
    items: Vec<BulkGetItem>,
) -> Vec<std::result::Result<Value, ReplicationError>> {
    let mut found: HashMap<(String, String), Value> = HashMap::new();
    let mut failed: HashMap<String, (String, String)> = HashMap::new();
    for item in items {
        match item {
            BulkGetItem::Found(doc) => {
                let id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
                let rev = doc.get("_rev").and_then(Value::as_str).unwrap_or_default().to_string();
                found.insert((id, rev), doc);
            }
            BulkGetItem::Failed {
                doc_id,
                rev,
                error,
                reason,
            } => {
                let key = match rev {
                    Some(rev) => format!("{doc_id}\u{0}{rev}"),
                    None => doc_id,
                };
                failed.insert(key, (error, reason));
            }
        }
    }

    fetches
        .iter()
        .map(|f| {
            let rev = f.rev.to_string();
            if let Some(doc) = found.remove(&(f.doc_id.clone(), rev.clone())) {
                return Ok(doc);
            }
            let failure = failed
                .get(&format!("{}\u{0}{rev}", f.doc_id))
                .or_else(|| failed.get(&f.doc_id));
            let reason = match failure {
                Some((error, reason)) => format!("{error}: {reason}"),
                None => "missing from _bulk_get response".to_string(),
            };
            Err(ReplicationError::rejected("_bulk_get", f.doc_id.clone(), reason))
        })
        .collect()
}
