// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded batcher between feed producers and batch consumers.
//!
//! Producers insert items one at a time. The consumer receives a batch as
//! soon as `capacity` items are queued, or when `flush_delay` has elapsed
//! since the first item of the batch arrived.
//!
//! # Design
//!
//! ```text
//! producer ──send()──▶ [permit] ──▶ unbounded mpsc ──▶ next_batch() ──▶ Batch<T>
//!                        ▲                                               │
//!                        └──── permits released when BatchSlots drop ◀───┘
//! ```
//!
//! Each queued item holds one permit from a semaphore sized to `capacity`.
//! Permits travel with the items into the [`Batch`]. The consumer splits it
//! with [`Batch::into_parts`] and keeps the [`BatchSlots`] until the items
//! are processed, so a producer blocks while `capacity` items are queued or
//! still being processed. Items are never reordered.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Configuration for batching.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum items per batch, and maximum items queued at once.
    pub capacity: usize,
    /// Maximum time a batch waits for more items after its first one.
    pub flush_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            flush_delay: Duration::from_millis(500),
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            capacity: 10,
            flush_delay: Duration::from_millis(5),
        }
    }
}

/// The consumer side has gone away.
#[derive(Debug, Clone, thiserror::Error)]
#[error("batcher closed")]
pub struct BatcherClosed;

/// Create a connected sender/receiver pair.
pub fn batcher<T>(config: BatchConfig) -> (BatchSender<T>, BatchReceiver<T>) {
    let capacity = config.capacity.max(1);
    let permits = Arc::new(Semaphore::new(capacity));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BatchSender {
            tx,
            permits: Arc::clone(&permits),
        },
        BatchReceiver {
            rx,
            permits,
            capacity,
            flush_delay: config.flush_delay,
        },
    )
}

/// Producer handle. Cloneable; the batcher closes when every clone is dropped.
pub struct BatchSender<T> {
    tx: mpsc::UnboundedSender<(T, OwnedSemaphorePermit)>,
    permits: Arc<Semaphore>,
}

impl<T> Clone for BatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<T> BatchSender<T> {
    /// Queue one item, waiting while the batcher is full.
    ///
    /// Cancel-safe: if the future is dropped before a slot frees up, nothing
    /// is queued.
    pub async fn send(&self, item: T) -> Result<(), BatcherClosed> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BatcherClosed)?;
        self.tx.send((item, permit)).map_err(|_| BatcherClosed)
    }

    /// Number of items that can be queued without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Consumer handle.
pub struct BatchReceiver<T> {
    rx: mpsc::UnboundedReceiver<(T, OwnedSemaphorePermit)>,
    permits: Arc<Semaphore>,
    capacity: usize,
    flush_delay: Duration,
}

impl<T> BatchReceiver<T> {
    /// Wait for the next batch.
    ///
    /// Returns `None` once every sender is dropped (or [`close`](Self::close)
    /// was called) and all queued items have been handed out.
    pub async fn next_batch(&mut self) -> Option<Batch<T>> {
        let first = self.rx.recv().await?;
        let deadline = Instant::now() + self.flush_delay;
        let mut items = Vec::with_capacity(self.capacity);
        let mut permits = Vec::with_capacity(self.capacity);
        items.push(first.0);
        permits.push(first.1);

        while items.len() < self.capacity {
            tokio::select! {
                biased;
                next = self.rx.recv() => match next {
                    Some((item, permit)) => {
                        items.push(item);
                        permits.push(permit);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        Some(Batch {
            items,
            permits,
        })
    }

    /// Stop accepting items. Already-queued items are still delivered.
    pub fn close(&mut self) {
        self.permits.close();
        self.rx.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A released batch. Dereferences to its items in insertion order.
pub struct Batch<T> {
    items: Vec<T>,
    permits: Vec<OwnedSemaphorePermit>,
}

impl<T> Batch<T> {
    /// Split into the items and the slots they occupy. Producers stay
    /// blocked on those slots until the [`BatchSlots`] is dropped.
    pub fn into_parts(self) -> (Vec<T>, BatchSlots) {
        (self.items, BatchSlots(self.permits))
    }
}

/// Batcher slots held by a batch whose items are still being processed.
#[must_use = "dropping the slots lets producers refill the batcher"]
pub struct BatchSlots(Vec<OwnedSemaphorePermit>);

impl BatchSlots {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").field("items", &self.items).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_config_default() {
        let config = BatchConfig::default();
        assert_eq!(config.capacity, 100);
        assert_eq!(config.flush_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_batch_config_testing() {
        let config = BatchConfig::testing();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.flush_delay, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_releases_at_capacity() {
        let (tx, mut rx) = batcher(BatchConfig {
            capacity: 3,
            flush_delay: Duration::from_secs(60),
        });
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        let batch = tokio::time::timeout(Duration::from_secs(1), rx.next_batch())
            .await
            .expect("capacity should release without waiting for the delay")
            .unwrap();
        assert_eq!(&*batch, &[0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_releases_after_flush_delay() {
        let (tx, mut rx) = batcher(BatchConfig {
            capacity: 10,
            flush_delay: Duration::from_millis(500),
        });
        tx.send("a").await.unwrap();
        let start = Instant::now();
        let batch = rx.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_backpressure_blocks_producer() {
        let (tx, mut rx) = batcher(BatchConfig {
            capacity: 2,
            flush_delay: Duration::from_millis(1),
        });
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(tx.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(3)).await;
        assert!(blocked.is_err(), "third send should wait for a free slot");

        let batch = rx.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        drop(batch);
        assert_eq!(tx.available(), 2);
        tx.send(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_slots_held_until_processed() {
        let (tx, mut rx) = batcher(BatchConfig {
            capacity: 2,
            flush_delay: Duration::from_millis(1),
        });
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        let (items, slots) = rx.next_batch().await.unwrap().into_parts();
        assert_eq!(items, vec![1, 2]);
        assert_eq!(slots.len(), 2);

        // Items taken out but not yet processed still occupy the batcher.
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(3)).await;
        assert!(blocked.is_err(), "producer ran ahead of an unprocessed batch");
        assert_eq!(tx.available(), 0);

        drop(slots);
        assert_eq!(tx.available(), 2);
        tx.send(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_drains_after_senders_dropped() {
        let (tx, mut rx) = batcher(BatchConfig {
            capacity: 2,
            flush_delay: Duration::from_millis(1),
        });
        let producer = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(batch) = rx.next_batch().await {
            assert!(batch.len() <= 2);
            let (items, _slots) = batch.into_parts();
            seen.extend(items);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_rejects_new_items() {
        let (tx, mut rx) = batcher::<u32>(BatchConfig::testing());
        tx.send(1).await.unwrap();
        rx.close();
        assert!(tx.send(2).await.is_err());
        let batch = rx.next_batch().await.unwrap();
        assert_eq!(&*batch, &[1]);
        assert!(rx.next_batch().await.is_none());
    }
}
