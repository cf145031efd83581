//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory Sync Gateway peer (`MockPeer`)
//! - Helpers for building replications against it and waiting on state

#![allow(dead_code)]

pub mod mock_peer;

pub use mock_peer::*;

use doc_replicator::{
    Direction, MemoryStore, Replication, ReplicationBuilder, ReplicationConfig, ReplicationNotification,
    ReplicationState, ReplicationStatus,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Route replicator logs to the test harness. Set `RUST_LOG=doc_replicator=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh local store.
pub fn local_store(name: &str) -> Arc<MemoryStore> {
    init_tracing();
    Arc::new(MemoryStore::new(name))
}

/// Test-sized configuration against the mock.
pub fn test_config(direction: Direction) -> ReplicationConfig {
    ReplicationConfig::for_testing(MOCK_URL, direction)
}

/// Hold partial batches until the feed closes, so a one-shot run of a few
/// documents is processed as a single batch.
pub fn one_batch(mut config: ReplicationConfig) -> ReplicationConfig {
    config.settings.batch.flush_delay = "5s".into();
    config
}

/// A replication of `local` against `peer`.
pub fn replication(
    config: ReplicationConfig,
    local: &Arc<MemoryStore>,
    peer: &Arc<MockPeer>,
) -> Replication<MemoryStore> {
    ReplicationBuilder::new(config, Arc::clone(local))
        .transport(Arc::clone(peer) as _)
        .build()
        .expect("valid test config")
}

/// Write `count` documents named `<prefix>-<n>`.
pub async fn seed(store: &MemoryStore, prefix: &str, count: usize) {
    for n in 0..count {
        store
            .put(&format!("{prefix}-{n}"), serde_json::json!({"n": n}))
            .await
            .expect("seed write");
    }
}

/// Start a one-shot replication and wait for it to stop.
pub async fn run_to_completion(replication: &Replication<MemoryStore>) -> ReplicationStatus {
    replication.start().await.expect("start");
    tokio::time::timeout(Duration::from_secs(10), replication.wait_until_stopped())
        .await
        .expect("replication did not stop in time");
    replication.status()
}

/// Wait until the session reaches `state`.
pub async fn wait_for_state(replication: &Replication<MemoryStore>, state: ReplicationState) {
    let mut rx = replication.status_receiver();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .expect("status channel closed");
}

/// Wait until `condition` holds for the published status.
pub async fn wait_for_status<F>(replication: &Replication<MemoryStore>, mut condition: F)
where
    F: FnMut(&ReplicationStatus) -> bool,
{
    let mut rx = replication.status_receiver();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| condition(s)))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
}

/// Wait until `doc_id` exists in `store`.
pub async fn wait_for_doc(store: &MemoryStore, doc_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(body) = body_of(store, doc_id).await {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{doc_id} never arrived"))
}

/// Collects every notification delivered to a subscriber.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<ReplicationNotification>>>,
}

impl Recorder {
    pub fn attach(&self, replication: &Replication<MemoryStore>) {
        let seen = Arc::clone(&self.seen);
        replication.subscribe(Arc::new(move |n: &ReplicationNotification| {
            seen.lock().push(n.clone());
        }));
    }

    pub fn notifications(&self) -> Vec<ReplicationNotification> {
        self.seen.lock().clone()
    }
}

/// Body of the winning revision, underscore fields stripped.
pub async fn body_of(store: &MemoryStore, doc_id: &str) -> Option<Value> {
    store
        .get_document(doc_id)
        .await
        .expect("store read")
        .map(|rev| Value::Object(rev.body))
}
