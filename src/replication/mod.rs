// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication sessions.
//!
//! A [`Replication`] moves documents between a [`LocalStore`] and one remote
//! database, in one or both directions, once or continuously.
//!
//! # Architecture
//!
//! - The public handle only enqueues control messages and reads the latest
//!   [`ReplicationStatus`] snapshot from a watch channel.
//! - A worker task owns the state machine and the role tasks.
//! - The puller and pusher each own their [`Checkpointer`](crate::checkpoint::Checkpointer),
//!   so saves for one checkpoint id never overlap.
//! - Notifications go through an [`EventBus`] and are delivered on their own
//!   task.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = Arc::new(MemoryStore::new("local-db"));
//! let config = ReplicationConfig::new("https://sg.example.com:4984/db", Direction::Both)
//!     .continuous(true);
//!
//! let replication = ReplicationBuilder::new(config, store).build()?;
//! replication.subscribe(Arc::new(|n: &ReplicationNotification| {
//!     println!("{:?} {}", n.kind, n.status.state);
//! }));
//! replication.start().await?;
//! // ...
//! replication.stop();
//! replication.wait_until_stopped().await;
//! ```

mod events;
mod puller;
mod pusher;
mod role;
mod types;
mod worker;

pub use events::{EventBus, Handler, SubscriptionHandle};
pub use role::PushFilter;
pub use types::{NotificationKind, ReplicationNotification, ReplicationState, ReplicationStatus, Role};

use crate::auth::{self, Authenticator};
use crate::checkpoint::{CheckpointId, CheckpointMirror};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::PeerClient;
use crate::resilience::{Bulkhead, RateLimiter};
use crate::store::LocalStore;
use crate::transport::{HttpTransport, ReqwestTransport};
use parking_lot::Mutex;
use role::SessionContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, Instrument};
use worker::{Control, Worker};

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Assembles a [`Replication`].
pub struct ReplicationBuilder<S: LocalStore> {
    config: ReplicationConfig,
    store: Arc<S>,
    transport: Option<Arc<dyn HttpTransport>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    push_filter: Option<PushFilter>,
    request_pool: Option<Arc<Bulkhead>>,
}

impl<S: LocalStore> ReplicationBuilder<S> {
    pub fn new(config: ReplicationConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            transport: None,
            authenticator: None,
            push_filter: None,
            request_pool: None,
        }
    }

    /// Use this transport instead of the default reqwest client.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this authenticator instead of the one built from `config.auth`.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Only push revisions this returns `true` for.
    pub fn push_filter(mut self, filter: PushFilter) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Share a request pool with other sessions.
    pub fn request_pool(mut self, pool: Arc<Bulkhead>) -> Self {
        self.request_pool = Some(pool);
        self
    }

    /// Validate the config and build the session. Nothing is sent until
    /// [`Replication::start`].
    pub fn build(self) -> Result<Replication<S>> {
        self.config.validate()?;
        let settings = &self.config.settings;

        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(settings.retry.request_timeout_duration())?),
        };
        let pool = self
            .request_pool
            .unwrap_or_else(|| Arc::new(Bulkhead::new(settings.request_pool_size)));
        let rate_limiter = settings.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let peer = Arc::new(
            PeerClient::new(transport, self.config.database_url()?, pool)
                .with_headers(self.config.headers.clone())
                .with_rate_limiter(rate_limiter)
                .with_request_timeout(settings.retry.request_timeout_duration()),
        );

        let filter = self.config.effective_filter();
        let store_id = self.store.store_id();
        let mut checkpoint_ids = Vec::new();
        for (role, enabled) in [
            (Role::Pull, self.config.direction.pulls()),
            (Role::Push, self.config.direction.pushes()),
        ] {
            if enabled {
                let id = CheckpointId::derive(
                    &store_id,
                    peer.base_url().as_str(),
                    role,
                    filter.as_ref(),
                    &self.config.doc_ids,
                );
                checkpoint_ids.push((role, id));
            }
        }

        let authenticator = self.authenticator.or_else(|| auth::from_config(&self.config.auth));
        let retry = settings.retry.retry_config();
        let config = Arc::new(self.config);
        let ctx = Arc::new(SessionContext {
            store: self.store,
            peer,
            config,
            retry,
            push_filter: self.push_filter,
            feed_subscriptions: Arc::new(AtomicUsize::new(0)),
        });

        let (status_tx, _) = watch::channel(ReplicationStatus::default());
        Ok(Replication {
            ctx,
            authenticator,
            checkpoint_ids,
            status_tx: Arc::new(status_tx),
            events: EventBus::new(),
            control: Mutex::new(None),
            start_offline: Mutex::new(false),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replication
// ═══════════════════════════════════════════════════════════════════════════════

/// One replication session between a local store and a remote database.
///
/// Lifecycle calls never wait on the network. They enqueue a message for
/// the worker task and return; observe the effect through
/// [`status`](Self::status) or a subscription.
pub struct Replication<S: LocalStore> {
    ctx: Arc<SessionContext<S>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    checkpoint_ids: Vec<(Role, CheckpointId)>,
    status_tx: Arc<watch::Sender<ReplicationStatus>>,
    events: EventBus,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    /// `go_offline` was called while stopped.
    start_offline: Mutex<bool>,
    start_lock: tokio::sync::Mutex<()>,
}

impl<S: LocalStore> Replication<S> {
    /// Start the session.
    ///
    /// Opens the checkpoint mirror (if configured) and spawns the worker,
    /// which authenticates and loads checkpoints before any role runs.
    /// Fails with [`ReplicationError::InvalidState`] unless stopped.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        let state = self.state();
        if state != ReplicationState::Stopped {
            return Err(ReplicationError::InvalidState {
                expected: ReplicationState::Stopped.to_string(),
                actual: state.to_string(),
            });
        }

        let settings = &self.ctx.config.settings;
        let mirror = match &settings.checkpoint.mirror_path {
            Some(path) => {
                let mirror = CheckpointMirror::open(path).await?;
                info!(path = %path, "Checkpoint mirror opened");
                Some(Arc::new(mirror))
            }
            None => None,
        };

        self.events.ensure_dispatcher();
        let online = !std::mem::take(&mut *self.start_offline.lock());
        let state = if online {
            ReplicationState::Active
        } else {
            ReplicationState::Offline
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.control.lock() = Some(control_tx);

        // A fresh run starts with fresh counts but keeps the last checkpoints.
        let previous = self.status_tx.borrow().clone();
        let status = ReplicationStatus {
            state,
            push_checkpoint: previous.push_checkpoint,
            pull_checkpoint: previous.pull_checkpoint,
            ..Default::default()
        };
        self.status_tx.send_replace(status.clone());
        metrics::set_replication_state(&state.to_string());
        metrics::record_state_transition(&state.to_string());
        self.events.publisher().publish(ReplicationNotification {
            kind: NotificationKind::StateChanged,
            status,
        });

        let worker = Worker {
            ctx: Arc::clone(&self.ctx),
            authenticator: self.authenticator.clone(),
            mirror,
            checkpoint_ids: self.checkpoint_ids.clone(),
            control: control_rx,
            status_tx: Arc::clone(&self.status_tx),
            publisher: self.events.publisher(),
            online,
        };
        let span = tracing::info_span!("replication", remote = %self.ctx.peer.base_url());
        tokio::spawn(worker.run().instrument(span));
        Ok(())
    }

    fn send(&self, control: Control) -> bool {
        match self.control.lock().as_ref() {
            Some(tx) => tx.send(control).is_ok(),
            None => false,
        }
    }

    /// Ask the session to stop. Idempotent; returns at once.
    ///
    /// The in-flight batch is allowed to finish (bounded by the drain
    /// timeout), checkpoints are saved, and exactly one
    /// [`NotificationKind::Stopped`] notification follows.
    pub fn stop(&self) {
        if !self.state().is_running() {
            debug!(state = %self.state(), "Stop ignored");
            return;
        }
        self.send(Control::Stop);
    }

    /// Suspend network activity. Remembered if called while stopped.
    pub fn go_offline(&self) {
        if self.state() == ReplicationState::Stopped {
            *self.start_offline.lock() = true;
            return;
        }
        self.send(Control::GoOffline);
    }

    /// Resume after [`go_offline`](Self::go_offline).
    pub fn go_online(&self) {
        if self.state() == ReplicationState::Stopped {
            *self.start_offline.lock() = false;
            return;
        }
        self.send(Control::GoOnline);
    }

    /// Close and re-open the change feed and push loop from the in-memory
    /// checkpoints, without a terminal notification.
    pub fn restart(&self) -> Result<()> {
        let state = self.state();
        if !state.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "running".to_string(),
                actual: state.to_string(),
            });
        }
        self.send(Control::Restart);
        Ok(())
    }

    /// Resolve once the session is stopped.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|s| s.state == ReplicationState::Stopped).await;
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ReplicationStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ReplicationState {
        self.status_tx.borrow().state
    }

    /// Receiver that sees every status snapshot.
    pub fn status_receiver(&self) -> watch::Receiver<ReplicationStatus> {
        self.status_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.status_tx.borrow().last_error.clone()
    }

    pub fn subscribe(&self, handler: Handler) -> SubscriptionHandle {
        self.events.subscribe(handler)
    }

    /// Returns `false` if the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.events.unsubscribe(handle)
    }

    /// Checkpoint id for `role`, if the session runs that role.
    pub fn checkpoint_id(&self, role: Role) -> Option<&CheckpointId> {
        self.checkpoint_ids
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, id)| id)
    }

    /// Set a cookie sent with every later request.
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.ctx.peer.set_cookie(name, value);
    }

    pub fn delete_cookie(&self, name: &str) {
        self.ctx.peer.delete_cookie(name);
    }

    /// Change-feed requests open right now. Never more than one.
    pub fn active_feed_subscriptions(&self) -> usize {
        self.ctx.feed_subscriptions.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &PeerClient {
        &self.ctx.peer
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.ctx.store
    }
}

impl<S: LocalStore> Drop for Replication<S> {
    fn drop(&mut self) {
        // Dropping the control sender stops the worker.
        self.control.get_mut().take();
    }
}
