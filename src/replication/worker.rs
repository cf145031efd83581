// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The session worker.
//!
//! One task per running session owns the state machine. Callers talk to it
//! through [`Control`] messages; role tasks report through [`RoleEvent`]s and
//! hand their checkpointer back when they finish.
//!
//! ```text
//! start ─▶ pre-flight (auth, checkpoint loads) ─▶ spawn roles ─▶ select loop
//!                                                                  │ control
//!                                                                  │ role events
//!                                                                  │ role exits
//!                                                                  ▼
//!                                stop / drained / fatal ─▶ halt, drain, Stopped
//! ```

use super::events::Publisher;
use super::puller;
use super::pusher;
use super::role::{RoleContext, RoleEvent, RoleEvents, RoleOutcome, SessionContext};
use super::types::{NotificationKind, ReplicationNotification, ReplicationState, ReplicationStatus, Role};
use crate::auth::{self, Authenticator};
use crate::checkpoint::{CheckpointId, CheckpointMirror, Checkpointer, RemoteCheckpointStore};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{halt_pair, HaltHandle, HaltSignal};
use crate::store::LocalStore;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Requests from the public handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Stop,
    GoOffline,
    GoOnline,
    Restart,
}

/// What a spawned role task yields. `None` if it panicked.
type Joined = (Role, Option<RoleOutcome>);

/// Everything needed to run one session, handed to the worker task.
pub(crate) struct Worker<S: LocalStore> {
    pub ctx: Arc<SessionContext<S>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub mirror: Option<Arc<CheckpointMirror>>,
    pub checkpoint_ids: Vec<(Role, CheckpointId)>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub status_tx: Arc<watch::Sender<ReplicationStatus>>,
    pub publisher: Publisher,
    pub online: bool,
}

impl<S: LocalStore> Worker<S> {
    pub(crate) async fn run(self) {
        let Worker {
            ctx,
            authenticator,
            mirror,
            checkpoint_ids,
            control,
            status_tx,
            publisher,
            online,
        } = self;

        let (online_tx, _) = watch::channel(online);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (halt, _) = halt_pair();
        let status = status_tx.borrow().clone();

        let mut session = Session {
            ctx,
            mirror,
            checkpoint_ids,
            control,
            online_tx,
            events_tx,
            events_rx,
            status_tx,
            status,
            publisher,
            roles: JoinSet::new(),
            running: BTreeSet::new(),
            parked: Vec::new(),
            caught_up: BTreeSet::new(),
            halt,
            fatal: false,
        };
        session.run(authenticator).await;
    }
}

struct Session<S: LocalStore> {
    ctx: Arc<SessionContext<S>>,
    mirror: Option<Arc<CheckpointMirror>>,
    checkpoint_ids: Vec<(Role, CheckpointId)>,
    control: mpsc::UnboundedReceiver<Control>,
    online_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<RoleEvent>,
    events_rx: mpsc::UnboundedReceiver<RoleEvent>,
    status_tx: Arc<watch::Sender<ReplicationStatus>>,
    /// Latest snapshot; also what `status_tx` holds.
    status: ReplicationStatus,
    publisher: Publisher,
    roles: JoinSet<Joined>,
    running: BTreeSet<Role>,
    /// Checkpointers of roles that have finished this run.
    parked: Vec<(Role, Checkpointer)>,
    caught_up: BTreeSet<Role>,
    halt: HaltHandle,
    /// A session-fatal error was recorded; it stays the last error.
    fatal: bool,
}

impl<S: LocalStore> Session<S> {
    async fn run(&mut self, authenticator: Option<Arc<dyn Authenticator>>) {
        info!(remote = %self.ctx.peer.base_url(), continuous = self.ctx.config.continuous, "Replication session starting");

        let checkpointers: Vec<(Role, Checkpointer)> = self
            .checkpoint_ids
            .iter()
            .map(|(role, id)| (*role, self.make_checkpointer(*role, id.clone())))
            .collect();
        let preflight = preflight(
            Arc::clone(&self.ctx),
            authenticator,
            checkpointers,
            self.halt.signal(),
            self.online_tx.subscribe(),
        );
        tokio::pin!(preflight);

        let ready = loop {
            tokio::select! {
                result = &mut preflight => break result,
                control = self.control.recv() => match control {
                    Some(Control::GoOffline) => self.set_online(false),
                    Some(Control::GoOnline) => self.set_online(true),
                    Some(Control::Restart) => debug!("Restart requested before roles started"),
                    Some(Control::Stop) | None => {
                        self.finish().await;
                        return;
                    }
                },
            }
        };

        match ready {
            Ok(checkpointers) => {
                for (role, checkpointer) in &checkpointers {
                    self.status.set_checkpoint(*role, checkpointer.last_sequence());
                }
                let signal = self.halt.signal();
                self.spawn_roles(checkpointers, signal);
                self.publish(NotificationKind::Progress);
            }
            Err(e) => {
                error!(error = %e, "Pre-flight failed, stopping");
                self.record_error(e);
                self.finish().await;
                return;
            }
        }

        loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::GoOffline) => self.set_online(false),
                    Some(Control::GoOnline) => self.set_online(true),
                    Some(Control::Restart) => {
                        if !self.restart().await {
                            break;
                        }
                    }
                    Some(Control::Stop) | None => {
                        info!("Stop requested");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => {
                    self.apply_event(event);
                    self.publish_change();
                }
                Some(joined) = self.roles.join_next(), if !self.roles.is_empty() => {
                    self.absorb(joined);
                    self.publish_change();
                    if self.fatal {
                        warn!("Session-fatal error, stopping");
                        break;
                    }
                    if self.running.is_empty() {
                        info!("All roles finished");
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    fn make_checkpointer(&self, role: Role, id: CheckpointId) -> Checkpointer {
        Checkpointer::new(
            id,
            role,
            RemoteCheckpointStore::new(Arc::clone(&self.ctx.peer)),
            self.mirror.clone(),
            self.ctx.retry.clone(),
        )
    }

    fn spawn_roles(&mut self, checkpointers: Vec<(Role, Checkpointer)>, halt: HaltSignal) {
        for (role, checkpointer) in checkpointers {
            let role_ctx = RoleContext {
                halt: halt.clone(),
                online: self.online_tx.subscribe(),
                events: RoleEvents::new(role, self.events_tx.clone()),
            };
            let span = match role {
                Role::Pull => info_span!("puller", checkpoint_id = %checkpointer.id()),
                Role::Push => info_span!("pusher", checkpoint_id = %checkpointer.id()),
            };
            let ctx = Arc::clone(&self.ctx);
            let task = async move {
                let outcome = match role {
                    Role::Pull => AssertUnwindSafe(puller::run(ctx, checkpointer, role_ctx)).catch_unwind().await,
                    Role::Push => AssertUnwindSafe(pusher::run(ctx, checkpointer, role_ctx)).catch_unwind().await,
                };
                (role, outcome.ok())
            };
            self.roles.spawn(task.instrument(span));
            self.running.insert(role);
            debug!(role = %role, "Spawned role task");
        }
    }

    /// Take in a finished role task.
    fn absorb(&mut self, joined: std::result::Result<Joined, JoinError>) {
        match joined {
            Ok((role, Some(outcome))) => {
                self.running.remove(&role);
                self.status.set_checkpoint(role, outcome.checkpointer.saved_sequence());
                match outcome.result {
                    Ok(()) => debug!(role = %role, "Role finished"),
                    Err(e) => {
                        warn!(role = %role, error = %e, "Role failed");
                        self.record_error(e);
                    }
                }
                self.parked.push((role, outcome.checkpointer));
            }
            Ok((role, None)) => {
                error!(role = %role, "Role task panicked");
                self.running.remove(&role);
                self.record_error(ReplicationError::Internal(format!("{role} task panicked")));
            }
            Err(e) => warn!(error = %e, "Role task aborted"),
        }
    }

    fn apply_event(&mut self, event: RoleEvent) {
        match event {
            RoleEvent::Discovered(_, n) => self.status.changes_count += n,
            RoleEvent::Completed(_, n) => self.status.completed_changes_count += n,
            RoleEvent::CaughtUp(role) => {
                if self.caught_up.insert(role) {
                    debug!(role = %role, "Caught up");
                }
            }
            RoleEvent::Failed(role, e) => {
                debug!(role = %role, error = %e, "Recording error");
                self.record_error(e);
            }
            RoleEvent::BatchClean(_) => {
                if !self.fatal {
                    self.status.last_error = None;
                }
            }
            RoleEvent::Checkpoint(role, seq) => {
                debug!(role = %role, seq = %seq, "Checkpoint saved");
                self.status.set_checkpoint(role, Some(&seq));
            }
        }
    }

    fn record_error(&mut self, e: ReplicationError) {
        if self.fatal {
            return;
        }
        if e.is_session_fatal() {
            self.fatal = true;
        }
        self.status.last_error = Some(Arc::new(e));
    }

    fn set_online(&mut self, online: bool) {
        if *self.online_tx.borrow() == online {
            return;
        }
        info!(online, "Connectivity changed");
        self.online_tx.send_replace(online);
        // Feeds re-open in catch-up mode.
        self.caught_up.clear();
        self.publish_change();
    }

    /// Halt the role tasks and start them again from their in-memory
    /// checkpoints. Returns false when a session-fatal error turned up while
    /// draining; nothing is respawned and the session must finish.
    async fn restart(&mut self) -> bool {
        info!("Restarting role tasks");
        self.halt.halt();
        let mut checkpointers = self.drain_roles().await;
        if self.fatal {
            warn!("Session-fatal error while draining, not restarting");
            self.parked = checkpointers;
            return false;
        }

        let (handle, signal) = halt_pair();
        self.halt = handle;
        self.caught_up.clear();

        // Roles that did not come back (aborted or panicked) start over from
        // the stored checkpoint.
        let missing: Vec<(Role, CheckpointId)> = self
            .checkpoint_ids
            .iter()
            .filter(|(role, _)| !checkpointers.iter().any(|(r, _)| r == role))
            .cloned()
            .collect();
        for (role, id) in missing {
            let mut checkpointer = self.make_checkpointer(role, id);
            match checkpointer.load(&signal).await {
                Ok(_) => checkpointers.push((role, checkpointer)),
                Err(e) => {
                    error!(role = %role, error = %e, "Could not reload checkpoint");
                    self.record_error(e);
                }
            }
        }

        self.spawn_roles(checkpointers, signal);
        self.publish_change();
        true
    }

    /// Wait for every role task to finish, aborting after the drain timeout.
    /// Returns the checkpointers handed back.
    async fn drain_roles(&mut self) -> Vec<(Role, Checkpointer)> {
        let drain = self.ctx.config.settings.drain_timeout_duration();
        let roles = &mut self.roles;
        let mut joined = Vec::new();

        let drained = tokio::time::timeout(drain, async {
            while let Some(j) = roles.join_next().await {
                joined.push(j);
            }
        })
        .await;
        if drained.is_err() {
            warn!(timeout_ms = drain.as_millis() as u64, "Role tasks did not drain in time, aborting");
            roles.abort_all();
            while let Some(j) = roles.join_next().await {
                joined.push(j);
            }
        }

        for j in joined {
            self.absorb(j);
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
        }
        self.running.clear();
        std::mem::take(&mut self.parked)
    }

    async fn finish(&mut self) {
        self.set_state(ReplicationState::Stopping);
        self.halt.halt();
        self.drain_roles().await;

        if let Some(mirror) = &self.mirror {
            mirror.close().await;
        }

        self.status.state = ReplicationState::Stopped;
        metrics::set_replication_state(&ReplicationState::Stopped.to_string());
        metrics::record_state_transition(&ReplicationState::Stopped.to_string());
        self.status_tx.send_replace(self.status.clone());
        self.publisher.publish(ReplicationNotification {
            kind: NotificationKind::Stopped,
            status: self.status.clone(),
        });
        info!(
            changes = self.status.changes_count,
            completed = self.status.completed_changes_count,
            error = ?self.status.last_error.as_ref().map(|e| e.to_string()),
            "Replication session stopped"
        );
    }

    fn derived_state(&self) -> ReplicationState {
        if !*self.online_tx.borrow() {
            return ReplicationState::Offline;
        }
        let all_caught_up = !self.running.is_empty() && self.running.iter().all(|r| self.caught_up.contains(r));
        let drained = self.status.completed_changes_count >= self.status.changes_count;
        if self.ctx.config.continuous && all_caught_up && drained {
            ReplicationState::Idle
        } else {
            ReplicationState::Active
        }
    }

    fn set_state(&mut self, state: ReplicationState) {
        if self.status.state == state {
            return;
        }
        info!(from = %self.status.state, to = %state, "State transition");
        self.status.state = state;
        metrics::set_replication_state(&state.to_string());
        metrics::record_state_transition(&state.to_string());
        self.publish(NotificationKind::StateChanged);
    }

    /// Re-derive the state and publish whatever changed.
    fn publish_change(&mut self) {
        let state = self.derived_state();
        if state != self.status.state {
            self.set_state(state);
        } else {
            self.publish(NotificationKind::Progress);
        }
    }

    fn publish(&self, kind: NotificationKind) {
        self.status_tx.send_replace(self.status.clone());
        self.publisher.publish(ReplicationNotification {
            kind,
            status: self.status.clone(),
        });
    }
}

/// Authenticate, then load every checkpoint. Waits while offline before
/// each step.
async fn preflight<S: LocalStore>(
    ctx: Arc<SessionContext<S>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    mut checkpointers: Vec<(Role, Checkpointer)>,
    halt: HaltSignal,
    mut online: watch::Receiver<bool>,
) -> Result<Vec<(Role, Checkpointer)>> {
    wait_until_online(&mut online).await?;
    if let Some(authenticator) = &authenticator {
        auth::run(authenticator.as_ref(), &ctx.peer).await?;
    }
    for (_, checkpointer) in &mut checkpointers {
        wait_until_online(&mut online).await?;
        checkpointer.load(&halt).await?;
    }
    Ok(checkpointers)
}

async fn wait_until_online(online: &mut watch::Receiver<bool>) -> Result<()> {
    if !*online.borrow() {
        debug!("Offline, pre-flight waiting");
    }
    online
        .wait_for(|online| *online)
        .await
        .map(|_| ())
        .map_err(|_| ReplicationError::Shutdown)
}
