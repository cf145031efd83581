//! # Document Replicator
//!
//! Replicates documents between a local store and a CouchDB-compatible
//! remote database (CouchDB, Sync Gateway), pushing, pulling, or both.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             Replication                                  │
//! │                                                                          │
//! │   control ──► worker (state machine) ──► notifications (EventBus)        │
//! │                 │                                                        │
//! │       ┌─────────┴──────────┐                                             │
//! │       ▼                    ▼                                             │
//! │  ┌──────────┐        ┌──────────┐                                        │
//! │  │ Puller   │        │ Pusher   │        ┌─────────────────────────────┐ │
//! │  │ _changes │        │ changes_ │        │ PeerClient                  │ │
//! │  │ GET doc  │        │  since   │───────►│ cookies, headers, Server    │ │
//! │  │ _bulk_get│        │ _revs_   │        │ request pool, rate limit    │ │
//! │  └────┬─────┘        │  diff    │        └──────────────┬──────────────┘ │
//! │       │              │ _bulk_   │                       ▼              │
//! │       ▼              │  docs    │                 HttpTransport         │
//! │   LocalStore ◄───────┴──────────┘                                        │
//! │       │                                                                  │
//! │       └── Checkpointer ──► _local/<id> on the peer (+ SQLite mirror)     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each role reads its feed into a [`batch`] batcher, processes a batch at a
//! time, and advances its checkpoint only over the contiguous prefix of
//! entries that fully succeeded ([`sequence::SequenceTracker`]).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replicator::{Direction, MemoryStore, ReplicationBuilder, ReplicationConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> doc_replicator::Result<()> {
//!     let store = Arc::new(MemoryStore::new("local-db"));
//!     let config = ReplicationConfig::new("http://localhost:4984/db", Direction::Both);
//!
//!     let replication = ReplicationBuilder::new(config, store).build()?;
//!     replication.start().await?;
//!     replication.wait_until_stopped().await;
//!
//!     if let Some(e) = replication.last_error() {
//!         eprintln!("replication failed: {e}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod changes;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod replication;
pub mod resilience;
pub mod revision;
pub mod revs_diff;
pub mod sequence;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use auth::{Authenticator, BasicAuthenticator, SessionAuthenticator, TokenAuthenticator};
pub use checkpoint::CheckpointId;
pub use config::{AuthConfig, Direction, ReplicationConfig, ReplicationSettings};
pub use error::{ReplicationError, Result};
pub use replication::{
    NotificationKind, PushFilter, Replication, ReplicationBuilder, ReplicationNotification, ReplicationState,
    ReplicationStatus, Role, SubscriptionHandle,
};
pub use revision::RevisionId;
pub use store::{LocalStore, MemoryStore};
pub use transport::{HttpTransport, ReqwestTransport};
