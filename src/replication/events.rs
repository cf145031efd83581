// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Publish/subscribe for lifecycle notifications.
//!
//! The worker publishes into an unbounded queue and never waits on
//! subscribers. A dispatcher task drains the queue and calls each handler
//! with a snapshot of the subscriber list, so no lock is held while user code
//! runs and a handler may (un)subscribe from inside a callback.

use super::types::ReplicationNotification;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Callback invoked for each notification.
pub type Handler = Arc<dyn Fn(&ReplicationNotification) + Send + Sync>;

/// Returned by `subscribe`; pass to `unsubscribe` to stop deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

type Handlers = Arc<Mutex<BTreeMap<u64, Handler>>>;

/// Notification queue plus its subscriber registry.
pub struct EventBus {
    tx: mpsc::UnboundedSender<ReplicationNotification>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ReplicationNotification>>>,
    handlers: Handlers,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, handler: Handler) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        SubscriptionHandle(id)
    }

    /// Returns `false` if the handle was not subscribed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.handlers.lock().remove(&handle.0).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Cheap handle the worker publishes through.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            tx: self.tx.clone(),
        }
    }

    /// Start the dispatcher task if it is not running yet. Must be called
    /// from inside a Tokio runtime.
    pub fn ensure_dispatcher(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let handlers = Arc::clone(&self.handlers);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let snapshot: Vec<Handler> = handlers.lock().values().cloned().collect();
                trace!(kind = ?notification.kind, subscribers = snapshot.len(), "Dispatching notification");
                for handler in snapshot {
                    handler(&notification);
                }
            }
            debug!("Notification dispatcher stopped");
        });
    }
}

/// Sending side of the notification queue.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<ReplicationNotification>,
}

impl Publisher {
    pub fn publish(&self, notification: ReplicationNotification) {
        // Dispatcher gone means the session is being dropped.
        let _ = self.tx.send(notification);
    }
}
