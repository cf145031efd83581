// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Every interaction with the peer ends in one of three classes, and the
//! class decides what the session does next.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Session-fatal | Description |
//! |------------|-----------|---------------|-------------|
//! | `TransientNetwork` | Yes | No | I/O failure, connection reset, timeout |
//! | `TransientServer` | Yes | No | HTTP 408, 429, 500, 502, 503, 504 |
//! | `PermanentRejection` | No | No | Any other 4xx, or a per-document rejection |
//! | `Authentication` | No | Yes | 401/403 from the handshake or any request |
//! | `LocalStorage` | No | Yes | The local store is unusable |
//! | `Configuration` | No | Yes | Invalid config, raised at construction |
//! | `CheckpointConflict` | No | No | Checkpoint changed remotely twice in a row |
//! | `CheckpointMirror` | No | No | Local SQLite mirror failure |
//! | `Protocol` | No | No | Peer sent a body we could not understand |
//! | `InvalidState` | No | No | Lifecycle call in the wrong state |
//! | `Shutdown` | No | No | Operation abandoned because the session is halting |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether to back off and
//! try again. Retryable errors never surface to listeners unless the retry
//! budget is exhausted.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// HTTP statuses that indicate a temporary condition on the peer.
pub const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network-level failure talking to the peer.
    #[error("Network error ({operation}): {message}")]
    TransientNetwork { operation: String, message: String },

    /// The peer answered with a temporary failure status.
    #[error("Server error ({operation}): HTTP {status}")]
    TransientServer { operation: String, status: u16 },

    /// The peer (or the local validation hook) refused an item.
    ///
    /// `status` is the HTTP status when the refusal came from the peer.
    #[error("Rejected ({operation}{}): {reason}", doc_id.as_deref().map(|d| format!(", doc {d}")).unwrap_or_default())]
    PermanentRejection {
        operation: String,
        status: Option<u16>,
        doc_id: Option<String>,
        reason: String,
    },

    /// Credentials were refused.
    #[error("Authentication failed ({operation}): HTTP {status}")]
    Authentication { operation: String, status: u16 },

    /// The local document store failed.
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// Invalid replication configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote checkpoint document kept changing underneath us.
    #[error("Checkpoint conflict for {checkpoint_id}")]
    CheckpointConflict { checkpoint_id: String },

    /// SQLite error in the local checkpoint mirror.
    #[error("Checkpoint mirror error: {0}")]
    CheckpointMirror(#[from] sqlx::Error),

    /// The peer returned something that does not follow the protocol.
    #[error("Protocol error ({operation}): {message}")]
    Protocol { operation: String, message: String },

    /// Lifecycle method called in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The session is halting.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Classify an HTTP status returned for `operation`.
    ///
    /// Callers only invoke this for non-success statuses.
    pub fn from_status(operation: impl Into<String>, status: u16, doc_id: Option<&str>) -> Self {
        let operation = operation.into();
        match status {
            401 | 403 => Self::Authentication { operation, status },
            s if TRANSIENT_STATUSES.contains(&s) => Self::TransientServer { operation, status },
            s => Self::PermanentRejection {
                operation,
                status: Some(s),
                doc_id: doc_id.map(str::to_string),
                reason: format!("HTTP {s}"),
            },
        }
    }

    /// Create a network error.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a per-document rejection.
    pub fn rejected(
        operation: impl Into<String>,
        doc_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PermanentRejection {
            operation: operation.into(),
            status: None,
            doc_id: Some(doc_id.into()),
            reason: reason.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::TransientServer { .. } => true,
            Self::PermanentRejection { .. } => false,
            Self::Authentication { .. } => false,
            Self::LocalStorage(_) => false,
            Self::Configuration(_) => false,
            Self::CheckpointConflict { .. } => false,
            Self::CheckpointMirror(_) => false,
            Self::Protocol { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must stop the session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::LocalStorage(_) | Self::Configuration(_)
        )
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TransientServer { status, .. } => Some(*status),
            Self::Authentication { status, .. } => Some(*status),
            Self::PermanentRejection { status, .. } => *status,
            _ => None,
        }
    }

    /// A copy for reporting the same failure against several items.
    ///
    /// `sqlx::Error` is not `Clone`, so a mirror error is copied as
    /// [`Internal`](Self::Internal) with the same message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::TransientNetwork { operation, message } => Self::network(operation.clone(), message.clone()),
            Self::TransientServer { operation, status } => Self::TransientServer {
                operation: operation.clone(),
                status: *status,
            },
            Self::PermanentRejection {
                operation,
                status,
                doc_id,
                reason,
            } => Self::PermanentRejection {
                operation: operation.clone(),
                status: *status,
                doc_id: doc_id.clone(),
                reason: reason.clone(),
            },
            Self::Authentication { operation, status } => Self::Authentication {
                operation: operation.clone(),
                status: *status,
            },
            Self::LocalStorage(m) => Self::LocalStorage(m.clone()),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::CheckpointConflict { checkpoint_id } => Self::CheckpointConflict {
                checkpoint_id: checkpoint_id.clone(),
            },
            Self::CheckpointMirror(e) => Self::Internal(format!("checkpoint mirror: {e}")),
            Self::Protocol { operation, message } => Self::protocol(operation.clone(), message.clone()),
            Self::InvalidState { expected, actual } => Self::InvalidState {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::Shutdown => Self::Shutdown,
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol("json", e.to_string())
    }
}

impl From<crate::store::StoreError> for ReplicationError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::LocalStorage(e.0)
    }
}
