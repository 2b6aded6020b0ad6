// =============================================================================
// Engine Counters — lock-free observability for every recovered error
// =============================================================================
//
// Nothing in the engine is silently swallowed: every recovered error and every
// dropped unit of work increments one of these counters. The snapshot is
// logged periodically and on shutdown.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters shared across all tasks via `Arc<Counters>`.
#[derive(Debug, Default)]
pub struct Counters {
    /// Ticks produced by the market-data feed.
    pub ticks_produced: AtomicU64,
    /// Consecutive feed failures (reset on success).
    pub feed_consecutive_failures: AtomicU64,
    /// Technical signals published by the execution engine.
    pub signals_published: AtomicU64,
    /// Signals dropped by the bounded-channel overflow policy.
    pub signals_dropped: AtomicU64,
    /// Source fetches that errored and contributed a neutral reading.
    pub fetch_failures: AtomicU64,
    /// Broker placeOrder retries performed.
    pub broker_retries: AtomicU64,
    /// Persistence write retries performed.
    pub persistence_retries: AtomicU64,
    /// All other locally recovered errors.
    pub recovered_errors: AtomicU64,
}

/// Point-in-time copy of all counters, for logging and alert payloads.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub ticks_produced: u64,
    pub feed_consecutive_failures: u64,
    pub signals_published: u64,
    pub signals_dropped: u64,
    pub fetch_failures: u64,
    pub broker_retries: u64,
    pub persistence_retries: u64,
    pub recovered_errors: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            ticks_produced: self.ticks_produced.load(Ordering::Relaxed),
            feed_consecutive_failures: self.feed_consecutive_failures.load(Ordering::Relaxed),
            signals_published: self.signals_published.load(Ordering::Relaxed),
            signals_dropped: self.signals_dropped.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            broker_retries: self.broker_retries.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            recovered_errors: self.recovered_errors.load(Ordering::Relaxed),
        }
    }
}

/// Increment helper so call sites stay one line.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
