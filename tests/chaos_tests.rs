// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the replicator handles failures without panics,
//! deadlocks, or checkpoints that run ahead of the data.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use doc_replicator::transport::Method;
use doc_replicator::{Direction, ReplicationError, ReplicationState, Role};
use serde_json::json;
use std::time::Duration;

// =============================================================================
// Transient Failures
// =============================================================================

/// Test: a short burst of network failures on the change feed is absorbed
#[tokio::test]
async fn changes_feed_survives_network_burst() {
    let peer = MockPeer::new();
    seed(&peer.store, "doc", 5).await;
    // Two failures leave the third attempt to succeed.
    peer.fail_next(Some(Method::Get), "_changes", Fault::Network, 2);

    let local = local_store("local");
    let replication = replication(test_config(Direction::Pull), &local, &peer);
    let status = run_to_completion(&replication).await;

    assert!(status.last_error.is_none(), "burst leaked: {:?}", status.last_error);
    assert_eq!(local.document_count().await, 5);
}

/// Test: mixed 5xx statuses on every endpoint still converge
#[tokio::test]
async fn push_survives_mixed_server_errors() {
    let peer = MockPeer::new();
    peer.fail_next(Some(Method::Post), "_revs_diff", Fault::Status(502), 1);
    peer.fail_next(Some(Method::Post), "_bulk_docs", Fault::Status(429), 1);
    peer.fail_next(Some(Method::Put), "_local/", Fault::Status(500), 1);
    let local = local_store("local");
    seed(&local, "doc", 4).await;

    let replication = replication(one_batch(test_config(Direction::Push)), &local, &peer);
    let status = run_to_completion(&replication).await;

    assert!(status.last_error.is_none(), "{:?}", status.last_error);
    assert_eq!(peer.store.document_count().await, 4);
    let id = replication.checkpoint_id(Role::Push).unwrap();
    assert_eq!(peer.checkpoint(id).as_deref(), Some("4"));
}

/// Test: a one-shot run that exhausts its retries reports a transient error
/// and leaves the checkpoint where it was
#[tokio::test]
async fn one_shot_retry_exhaustion_is_reported() {
    let peer = MockPeer::new();
    peer.fail_next(Some(Method::Post), "_bulk_docs", Fault::Status(503), 100);
    let local = local_store("local");
    seed(&local, "doc", 2).await;

    let replication = replication(test_config(Direction::Push), &local, &peer);
    let status = run_to_completion(&replication).await;

    let error = status.last_error.expect("exhausted retries must be reported");
    assert!(error.is_retryable());
    assert_eq!(error.status(), Some(503));
    assert_eq!(status.state, ReplicationState::Stopped);

    let id = replication.checkpoint_id(Role::Push).unwrap();
    assert_eq!(peer.checkpoint(id), None);
    assert_eq!(peer.store.document_count().await, 0);
}

/// Test: a continuous run keeps retrying a failed batch and clears the
/// error once it goes through
#[tokio::test]
async fn continuous_push_recovers_after_outage() {
    let peer = MockPeer::new();
    // More failures than one retry round allows.
    peer.fail_next(Some(Method::Post), "_bulk_docs", Fault::Status(503), 4);
    let local = local_store("local");
    seed(&local, "doc", 2).await;

    let mut config = test_config(Direction::Push);
    config.continuous = true;
    let replication = replication(config, &local, &peer);
    let recorder = Recorder::default();
    recorder.attach(&replication);

    replication.start().await.unwrap();
    wait_for_status(&replication, |s| {
        s.push_checkpoint.as_deref() == Some("2") && s.last_error.is_none()
    })
    .await;

    assert!(
        recorder.notifications().iter().any(|n| n.status.last_error.is_some()),
        "the outage should have been visible to listeners"
    );
    assert_eq!(peer.store.document_count().await, 2);

    replication.stop();
    tokio::time::timeout(Duration::from_secs(5), replication.wait_until_stopped())
        .await
        .expect("stop");
}

/// Test: stop() during an endless outage returns promptly
#[tokio::test]
async fn stop_during_outage_does_not_hang() {
    let peer = MockPeer::new();
    peer.fail_next(None, "_bulk_docs", Fault::Network, usize::MAX);
    let local = local_store("local");
    seed(&local, "doc", 3).await;

    let mut config = test_config(Direction::Push);
    config.continuous = true;
    let replication = replication(config, &local, &peer);
    replication.start().await.unwrap();
    wait_for_status(&replication, |s| s.last_error.is_some()).await;

    replication.stop();
    tokio::time::timeout(Duration::from_secs(5), replication.wait_until_stopped())
        .await
        .expect("stop hung during outage");
    assert_eq!(replication.state(), ReplicationState::Stopped);
    assert_eq!(peer.store.document_count().await, 0);
}

/// Test: checkpoint saves that keep failing never lose uploaded data
#[tokio::test]
async fn checkpoint_save_failures_are_not_fatal() {
    let peer = MockPeer::new();
    peer.fail_next(Some(Method::Put), "_local/", Fault::Status(503), 100);
    let local = local_store("local");
    seed(&local, "doc", 3).await;

    let replication = replication(test_config(Direction::Push), &local, &peer);
    let status = run_to_completion(&replication).await;

    assert_eq!(status.state, ReplicationState::Stopped);
    assert_eq!(peer.store.document_count().await, 3);
    let id = replication.checkpoint_id(Role::Push).unwrap();
    assert_eq!(peer.checkpoint(id), None);
}

// =============================================================================
// Unreachable Peer
// =============================================================================

/// Test: an unreachable peer fails pre-flight and stops the session
#[tokio::test]
async fn unreachable_peer_stops_at_preflight() {
    let peer = MockPeer::new();
    peer.set_offline(true);
    let local = local_store("local");
    local.put("doc", json!({})).await.unwrap();

    let replication = replication(test_config(Direction::Both), &local, &peer);
    let status = run_to_completion(&replication).await;

    let error = status.last_error.expect("pre-flight failure must be reported");
    assert!(matches!(*error, ReplicationError::TransientNetwork { .. }), "{error}");
    assert_eq!(status.changes_count, 0);
}

/// Test: a continuous session also gives up when pre-flight fails
#[tokio::test]
async fn unreachable_peer_stops_continuous_session() {
    let peer = MockPeer::new();
    peer.set_offline(true);
    let local = local_store("local");

    let mut config = test_config(Direction::Pull);
    config.continuous = true;
    let replication = replication(config, &local, &peer);
    let status = run_to_completion(&replication).await;

    assert!(status.last_error.is_some());
    assert_eq!(status.state, ReplicationState::Stopped);
}

// =============================================================================
// Local Store Failures
// =============================================================================

/// Test: a broken local store is fatal even for a continuous session
#[tokio::test]
async fn unavailable_local_store_is_fatal() {
    let peer = MockPeer::new();
    let local = local_store("local");
    seed(&local, "doc", 2).await;
    local.set_unavailable(true);

    let mut config = test_config(Direction::Push);
    config.continuous = true;
    let replication = replication(config, &local, &peer);
    let status = run_to_completion(&replication).await;

    let error = status.last_error.expect("store failure must be reported");
    assert!(matches!(*error, ReplicationError::LocalStorage(_)), "{error}");
    assert!(error.is_session_fatal());
    assert_eq!(peer.store.document_count().await, 0);
}

/// Test: a store failure while applying pulled revisions stops the pull
#[tokio::test]
async fn local_store_failure_during_pull_is_fatal() {
    let peer = MockPeer::new();
    seed(&peer.store, "doc", 3).await;
    let local = local_store("local");
    local.set_unavailable(true);

    let replication = replication(test_config(Direction::Pull), &local, &peer);
    let status = run_to_completion(&replication).await;

    let error = status.last_error.expect("store failure must be reported");
    assert!(matches!(*error, ReplicationError::LocalStorage(_)), "{error}");
    let id = replication.checkpoint_id(Role::Pull).unwrap();
    assert_eq!(peer.checkpoint(id), None);
}
