// =============================================================================
// Price Window — bounded rolling tick history per symbol
// =============================================================================
//
// Owned exclusively by the strategy execution engine (single writer). All
// other readers receive a snapshot copy. Invariants:
//   - Timestamps are strictly non-decreasing.
//   - Length never exceeds the configured capacity.
// =============================================================================

use std::collections::VecDeque;

use tracing::warn;

use crate::types::Tick;

/// Bounded ordered sequence of the most recent ticks for one symbol.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    ticks: VecDeque<Tick>,
    capacity: usize,
}

impl PriceWindow {
    /// Create an empty window holding at most `capacity` ticks.
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a tick, evicting the oldest while over capacity.
    ///
    /// A tick older than the newest already in the window violates the
    /// ordering invariant; it is rejected with a warning and the window is
    /// left untouched. Returns whether the tick was accepted.
    pub fn push(&mut self, tick: Tick) -> bool {
        if let Some(last) = self.ticks.back() {
            if tick.ts < last.ts {
                warn!(
                    symbol = %tick.symbol,
                    tick_ts = %tick.ts,
                    window_ts = %last.ts,
                    "out-of-order tick rejected"
                );
                return false;
            }
        }

        self.ticks.push_back(tick);
        while self.ticks.len() > self.capacity {
            self.ticks.pop_front();
        }
        true
    }

    /// Grow (never shrink) the capacity. Used when a strategy with a larger
    /// lookback registers for this symbol.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&Tick> {
        self.ticks.back()
    }

    /// Close prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.ticks.iter().map(|t| t.price).collect()
    }

    /// Volumes, oldest first.
    pub fn volumes(&self) -> Vec<f64> {
        self.ticks.iter().map(|t| t.volume).collect()
    }

    /// Point-in-time copy for readers outside the engine.
    pub fn snapshot(&self) -> Vec<Tick> {
        self.ticks.iter().cloned().collect()
    }
}
