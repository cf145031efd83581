// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session state types.
//!
//! # State Transitions
//!
//! ```text
//!             start()
//! Stopped ───────────────▶ Active ◀──────▶ Idle
//!    ▲                       │  ▲            │
//!    │            go_offline()│  │go_online() │go_offline()
//!    │                       ▼  │            │
//!    │                     Offline ◀─────────┘
//!    │                       │
//!    │     stop() / drained / fatal error (from any running state)
//!    └──────── Stopping ◀────┘
//! ```
//!
//! - **Stopped**: not running. Initial and terminal state.
//! - **Active**: work is pending or in flight.
//! - **Idle**: continuous session, caught up, nothing pending.
//! - **Offline**: feed suspended, no new outbound batches.
//! - **Stopping**: draining the in-flight batch and saving checkpoints.

use crate::error::ReplicationError;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationState {
    #[default]
    Stopped,
    Active,
    Idle,
    Offline,
    Stopping,
}

impl ReplicationState {
    /// Active, Idle or Offline.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::Offline)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "Stopped",
            Self::Active => "Active",
            Self::Idle => "Idle",
            Self::Offline => "Offline",
            Self::Stopping => "Stopping",
        })
    }
}

/// Direction a role task moves documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Push,
    Pull,
}

impl Role {
    /// Label used in logs, metrics and checkpoint ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "pusher",
            Self::Pull => "puller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a session, replaced on every change.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStatus {
    pub state: ReplicationState,
    /// Changes discovered (local or remote) this session.
    pub changes_count: u64,
    /// Changes fully processed, successfully or not.
    pub completed_changes_count: u64,
    /// Most recent unresolved error.
    pub last_error: Option<Arc<ReplicationError>>,
    pub push_checkpoint: Option<String>,
    pub pull_checkpoint: Option<String>,
}

impl ReplicationStatus {
    pub fn checkpoint(&self, role: Role) -> Option<&str> {
        match role {
            Role::Push => self.push_checkpoint.as_deref(),
            Role::Pull => self.pull_checkpoint.as_deref(),
        }
    }

    /// Record a role's checkpoint. `None` leaves the current value alone.
    pub(crate) fn set_checkpoint(&mut self, role: Role, sequence: Option<&str>) {
        let Some(sequence) = sequence else {
            return;
        };
        let slot = match role {
            Role::Push => &mut self.push_checkpoint,
            Role::Pull => &mut self.pull_checkpoint,
        };
        *slot = Some(sequence.to_string());
    }
}

/// Why a notification was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The session moved to a new state.
    StateChanged,
    /// Counts or a checkpoint advanced.
    Progress,
    /// The session reached Stopped. Emitted exactly once per run.
    Stopped,
}

/// Delivered to subscribers on the notification task.
#[derive(Debug, Clone)]
pub struct ReplicationNotification {
    pub kind: NotificationKind,
    pub status: ReplicationStatus,
}
