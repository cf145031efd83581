// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Plumbing shared by the puller and pusher tasks.

use super::types::Role;
use crate::checkpoint::Checkpointer;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::peer::PeerClient;
use crate::resilience::{HaltSignal, RetryConfig};
use crate::sequence::{SequenceToken, SequenceTracker};
use crate::store::{LocalStore, StoredRevision};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Decides whether a local revision is pushed.
pub type PushFilter = Arc<dyn Fn(&StoredRevision) -> bool + Send + Sync>;

/// Everything a role task needs that outlives a single run of it.
pub(crate) struct SessionContext<S: LocalStore> {
    pub store: Arc<S>,
    pub peer: Arc<PeerClient>,
    pub config: Arc<ReplicationConfig>,
    pub retry: RetryConfig,
    pub push_filter: Option<PushFilter>,
    pub feed_subscriptions: Arc<AtomicUsize>,
}

/// Progress reported from a role task to the worker.
#[derive(Debug)]
pub(crate) enum RoleEvent {
    Discovered(Role, u64),
    Completed(Role, u64),
    CaughtUp(Role),
    Failed(Role, ReplicationError),
    BatchClean(Role),
    Checkpoint(Role, String),
}

/// A role task's event sender.
#[derive(Clone)]
pub(crate) struct RoleEvents {
    role: Role,
    tx: mpsc::UnboundedSender<RoleEvent>,
}

impl RoleEvents {
    pub fn new(role: Role, tx: mpsc::UnboundedSender<RoleEvent>) -> Self {
        Self { role, tx }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn send(&self, event: RoleEvent) {
        // Worker gone means the session is being torn down.
        let _ = self.tx.send(event);
    }

    pub fn discovered(&self, count: usize) {
        if count > 0 {
            self.send(RoleEvent::Discovered(self.role, count as u64));
        }
    }

    pub fn completed(&self, count: usize) {
        if count > 0 {
            self.send(RoleEvent::Completed(self.role, count as u64));
        }
    }

    pub fn caught_up(&self) {
        self.send(RoleEvent::CaughtUp(self.role));
    }

    pub fn failed(&self, error: ReplicationError) {
        self.send(RoleEvent::Failed(self.role, error));
    }

    pub fn batch_clean(&self) {
        self.send(RoleEvent::BatchClean(self.role));
    }

    pub fn checkpoint(&self, sequence: &str) {
        self.send(RoleEvent::Checkpoint(self.role, sequence.to_string()));
    }
}

/// Per-run signals for one role task.
#[derive(Clone)]
pub(crate) struct RoleContext {
    pub halt: HaltSignal,
    pub online: watch::Receiver<bool>,
    pub events: RoleEvents,
}

impl RoleContext {
    /// Wait until the session is online. `false` if halted first.
    pub async fn wait_online(&mut self) -> bool {
        if self.halt.is_halted() {
            return false;
        }
        if *self.online.borrow() {
            return true;
        }
        debug!("Offline, waiting");
        let mut halt = self.halt.clone();
        tokio::select! {
            biased;
            _ = halt.halted() => false,
            r = self.online.wait_for(|online| *online) => r.is_ok(),
        }
    }

    /// Sleep, returning early with `false` if halted or taken offline.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        let mut halt = self.halt.clone();
        let mut online = self.online.clone();
        tokio::select! {
            biased;
            _ = halt.halted() => false,
            _ = online.wait_for(|online| !*online) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Resolves when `online` flips to false. Pending forever otherwise.
pub(crate) async fn went_offline(mut online: watch::Receiver<bool>) {
    if online.wait_for(|online| !*online).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A finished role task hands its checkpointer back for reuse on restart.
pub(crate) struct RoleOutcome {
    pub role: Role,
    pub checkpointer: Checkpointer,
    pub result: Result<()>,
}

/// Counts open change-feed subscriptions for as long as it lives.
pub(crate) struct FeedSubscription {
    counter: Arc<AtomicUsize>,
}

impl FeedSubscription {
    pub fn open(counter: &Arc<AtomicUsize>) -> Self {
        let open = counter.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_feed_subscriptions(open);
        if open > 1 {
            warn!(open, "More than one change feed subscription open");
        }
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        let open = self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::set_feed_subscriptions(open);
    }
}

/// Outcome of one attempt at one batch item.
pub(crate) enum ItemResult {
    Done,
    Failed(ReplicationError),
    /// Transient failure after retries; the item is tried again later.
    Retry(ReplicationError),
    /// Dropped because the session is halting. Not tracked either way.
    Abandoned,
}

impl ItemResult {
    /// Classify a request error for one item. Session-fatal errors come back
    /// as `Err` and end the role.
    pub fn from_error(error: ReplicationError) -> Result<Self> {
        match error {
            ReplicationError::Shutdown => Ok(Self::Abandoned),
            e if e.is_session_fatal() => Err(e),
            e if e.is_retryable() => Ok(Self::Retry(e)),
            e => Ok(Self::Failed(e)),
        }
    }
}

/// A batch item that holds a place in a [`SequenceTracker`].
pub(crate) trait TrackedItem {
    fn token(&self) -> SequenceToken;
    fn doc_id(&self) -> &str;
}

/// Items left over after [`settle`], to be tried again.
pub(crate) struct Settled<T> {
    pub retry: Vec<T>,
    pub retry_error: Option<ReplicationError>,
}

/// Record one batch attempt: complete or fail each item in the tracker,
/// move the checkpoint, and report progress.
pub(crate) fn settle<T, Q>(
    tracker: &Mutex<SequenceTracker<Q>>,
    checkpointer: &mut Checkpointer,
    events: &RoleEvents,
    items: Vec<T>,
    results: Vec<ItemResult>,
) -> Settled<T>
where
    T: TrackedItem,
    Q: Clone + ToString,
{
    let role = events.role();
    let mut completed = 0;
    let mut failures = 0;
    let mut retry = Vec::new();
    let mut retry_error = None;
    {
        let mut tracker = tracker.lock();
        for (item, result) in items.into_iter().zip(results) {
            match result {
                ItemResult::Done => {
                    completed += 1;
                    if let Some(seq) = tracker.complete(item.token()) {
                        checkpointer.advance(seq.to_string());
                    }
                }
                ItemResult::Failed(e) => {
                    completed += 1;
                    failures += 1;
                    tracker.fail(item.token());
                    warn!(role = %role, doc_id = %item.doc_id(), error = %e, "Document failed");
                    events.failed(e);
                }
                ItemResult::Retry(e) => {
                    retry_error.get_or_insert(e);
                    retry.push(item);
                }
                ItemResult::Abandoned => {}
            }
        }
    }

    events.completed(completed);
    crate::metrics::record_permanent_failures(role.as_str(), failures);
    if failures == 0 && retry.is_empty() && completed > 0 {
        events.batch_clean();
    }
    Settled { retry, retry_error }
}

/// Save the role's checkpoint and report it. Errors are reported, not returned.
pub(crate) async fn save_checkpoint(checkpointer: &mut Checkpointer, halt: &HaltSignal, events: &RoleEvents) {
    match checkpointer.flush(halt).await {
        Ok(true) => {
            if let Some(seq) = checkpointer.saved_sequence() {
                events.checkpoint(seq);
            }
        }
        Ok(false) => {}
        Err(ReplicationError::Shutdown) => {}
        Err(e) => events.failed(e),
    }
}
