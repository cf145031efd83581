// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry logic, backoff, rate limiting, bulkheads.
//!
//! This module provides the patterns every peer request goes through:
//!
//! - [`RetryConfig`] and [`retry_transient`]: exponential backoff for
//!   transient failures, abandoned promptly when the session halts
//! - [`HaltSignal`]: the stop notification role tasks watch
//! - [`RateLimiter`]: optional token bucket for outbound requests
//! - [`Bulkhead`]: semaphore bounding concurrent requests (the request pool)
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_replicator::resilience::BulkheadFull> {
//! use doc_replicator::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Rate limit: max 1000 requests/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Request pool: max 8 concurrent requests
//! let pool = Bulkhead::new(8);
//! let _permit = pool.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use governor::{Quota, RateLimiter as GovLimiter, state::{InMemoryState, NotKeyed}, clock::DefaultClock, middleware::NoOpMiddleware};
use tokio::sync::{watch, Semaphore, OwnedSemaphorePermit};
use tracing::warn;

/// Configuration for connection retry behavior.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    /// Set to `usize::MAX` to never give up.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    ///
    /// Fails quickly to avoid slow tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        // Clamp before converting: the product overflows to infinity long
        // before an unbounded retry loop gives up.
        let delay_secs = (self.initial_delay.as_secs_f64() * multiplier)
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay_secs)
    }
}

// =============================================================================
// Halt signal
// =============================================================================

/// Sending half of a [`HaltSignal`].
#[derive(Debug)]
pub struct HaltHandle {
    tx: watch::Sender<bool>,
}

impl HaltHandle {
    /// Signal every receiver. Idempotent.
    pub fn halt(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_halted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> HaltSignal {
        HaltSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

/// Receiving half: tells long-running work to wind down.
///
/// A signal whose [`HaltHandle`] has been dropped counts as halted.
#[derive(Debug, Clone)]
pub struct HaltSignal {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected handle/signal pair.
pub fn halt_pair() -> (HaltHandle, HaltSignal) {
    let (tx, rx) = watch::channel(false);
    (
        HaltHandle { tx },
        HaltSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl HaltSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once halted. Cancel-safe.
    pub async fn halted(&mut self) {
        let _ = self.rx.wait_for(|halted| *halted).await;
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Run `f` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only [`ReplicationError::is_retryable`] errors are retried. The backoff
/// sleep is abandoned with [`ReplicationError::Shutdown`] as soon as `halt`
/// fires; an attempt already in flight is allowed to finish.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    halt: &HaltSignal,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        if halt.is_halted() {
            return Err(ReplicationError::Shutdown);
        }
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Transient failure, retrying");
                crate::metrics::record_retry(operation);

                let mut halt = halt.clone();
                tokio::select! {
                    biased;
                    _ = halt.halted() => return Err(ReplicationError::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Caps the rate of outbound requests when the server asks clients to
/// slow down. Thread-safe and async-aware.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() {
/// use doc_replicator::resilience::{RateLimiter, RateLimitConfig};
/// let limiter = RateLimiter::new(RateLimitConfig::default());
///
/// for _request in 0..3 {
///     limiter.acquire().await; // Blocks if over limit
///     // send(request).await;
/// }
/// # }
/// ```
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        // Create quota: `burst_size` tokens, refilling at `refill_rate` per second
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Bulkhead pattern: limits concurrent operations to prevent resource exhaustion.
///
/// Uses a semaphore to limit how many operations can run simultaneously.
/// When the bulkhead is "full", new operations wait for a slot.
///
/// The replicator uses one as its request pool: every HTTP exchange with the
/// peer holds a permit. Sessions can share a pool through
/// `ReplicationBuilder::request_pool`.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> Result<(), doc_replicator::resilience::BulkheadFull> {
/// use doc_replicator::resilience::Bulkhead;
/// let bulkhead = Bulkhead::new(10); // Max 10 concurrent
///
/// let permit = bulkhead.acquire().await?;
/// // do_work().await;
/// drop(permit); // Release slot
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}
