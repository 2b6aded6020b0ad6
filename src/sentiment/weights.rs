// =============================================================================
// Source Weights — adaptive per-source multipliers, atomically published
// =============================================================================
//
// The aggregator combines source readings under a weight snapshot. The
// controller recomputes weights on a schedule from recent realized outcomes
// and publishes a new immutable snapshot; readers always see a consistent
// map (a single `Arc` swap, never an in-place mutation).
//
// Adjustment rule per cycle over closed positions of the last 24 h:
//   win rate > 0.6 : highest-agreeing source +0.01, lowest -0.005
//   win rate < 0.4 : the inverse
//   otherwise      : no update
// Weights are clamped to [0.05, 0.5] and renormalised to sum to 1.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sentiment::SentimentSource;
use crate::trading::lifecycle::{Position, TradeLifecycleManager};

/// Per-source weight floor after adjustment.
const WEIGHT_FLOOR: f64 = 0.05;
/// Per-source weight ceiling after adjustment.
const WEIGHT_CEIL: f64 = 0.5;
/// Nudge applied to the best-attributed source.
const NUDGE_UP: f64 = 0.01;
/// Nudge applied to the worst-attributed source.
const NUDGE_DOWN: f64 = 0.005;
/// Attribution window over closed positions, in hours.
const ATTRIBUTION_WINDOW_HOURS: i64 = 24;

/// Immutable per-source weight map, sum-normalised to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWeights {
    weights: HashMap<SentimentSource, f64>,
}

impl SourceWeights {
    /// Equal weight for every source.
    pub fn uniform() -> Self {
        let share = 1.0 / SentimentSource::ALL.len() as f64;
        Self {
            weights: SentimentSource::ALL.iter().map(|s| (*s, share)).collect(),
        }
    }

    /// Build from a raw map: clamp to bounds, then renormalise to sum 1.
    pub fn normalized(raw: HashMap<SentimentSource, f64>) -> Self {
        let mut weights: HashMap<SentimentSource, f64> = SentimentSource::ALL
            .iter()
            .map(|s| {
                let w = raw.get(s).copied().unwrap_or(WEIGHT_FLOOR);
                (*s, w.clamp(WEIGHT_FLOOR, WEIGHT_CEIL))
            })
            .collect();

        let sum: f64 = weights.values().sum();
        if sum > 0.0 {
            for w in weights.values_mut() {
                *w /= sum;
            }
        }
        Self { weights }
    }

    pub fn get(&self, source: SentimentSource) -> f64 {
        self.weights.get(&source).copied().unwrap_or(0.0)
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn as_map(&self) -> &HashMap<SentimentSource, f64> {
        &self.weights
    }
}

/// Shared handle: single writer (the controller), snapshot readers.
pub struct WeightsHandle {
    current: RwLock<Arc<SourceWeights>>,
}

impl WeightsHandle {
    pub fn new(initial: SourceWeights) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// One immutable snapshot per aggregation cycle.
    pub fn snapshot(&self) -> Arc<SourceWeights> {
        Arc::clone(&self.current.read())
    }

    /// Atomically publish the next snapshot.
    pub fn publish(&self, next: SourceWeights) {
        *self.current.write() = Arc::new(next);
    }
}

impl Default for WeightsHandle {
    fn default() -> Self {
        Self::new(SourceWeights::uniform())
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Periodically recomputes source weights from realized performance.
pub struct AdaptiveWeightsController {
    lifecycle: Arc<TradeLifecycleManager>,
    handle: Arc<WeightsHandle>,
    interval: Duration,
}

impl AdaptiveWeightsController {
    pub fn new(
        lifecycle: Arc<TradeLifecycleManager>,
        handle: Arc<WeightsHandle>,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            handle,
            interval,
        }
    }

    /// Run the recompute loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "adaptive weights controller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // immediate first tick consumed

        loop {
            tokio::select! {
                _ = ticker.tick() => self.recompute_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("adaptive weights controller stopped");
    }

    /// One recompute pass over the last 24 h of closed positions.
    pub fn recompute_once(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(ATTRIBUTION_WINDOW_HOURS);
        let closed = self.lifecycle.closed_positions_since(cutoff);

        match adjust(&self.handle.snapshot(), &closed) {
            Some(next) => {
                debug!(weights = ?next.as_map(), "publishing adjusted source weights");
                self.handle.publish(next);
            }
            None => debug!(
                closed_count = closed.len(),
                "no weight adjustment this cycle"
            ),
        }
    }
}

/// Compute the next weight snapshot, or `None` when no adjustment applies
/// (no closed positions, or a win rate in the neutral band).
pub fn adjust(current: &SourceWeights, closed: &[Position]) -> Option<SourceWeights> {
    if closed.is_empty() {
        return None;
    }

    let wins = closed
        .iter()
        .filter(|p| p.realized_pnl.unwrap_or(0.0) > 0.0)
        .count();
    let win_rate = wins as f64 / closed.len() as f64;

    // Per-source attribution: how strongly each source's entry-time score
    // agreed with the realized price direction.
    let mut agreement: HashMap<SentimentSource, f64> =
        SentimentSource::ALL.iter().map(|s| (*s, 0.0)).collect();
    for position in closed {
        let Some(exit) = position.exit_price else {
            continue;
        };
        let realized_direction = (exit - position.entry_price).signum();
        for (source, score) in &position.entry_source_scores {
            *agreement.entry(*source).or_insert(0.0) += score * realized_direction;
        }
    }

    let top = *agreement
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?
        .0;
    let bottom = *agreement
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?
        .0;

    let (up_source, down_source) = if win_rate > 0.6 {
        (top, bottom)
    } else if win_rate < 0.4 {
        (bottom, top)
    } else {
        return None;
    };

    let mut raw = current.as_map().clone();
    *raw.entry(up_source).or_insert(WEIGHT_FLOOR) += NUDGE_UP;
    *raw.entry(down_source).or_insert(WEIGHT_FLOOR) -= NUDGE_DOWN;

    Some(SourceWeights::normalized(raw))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::lifecycle::PositionStatus;
    use crate::types::TradeSide;

    fn closed_position(
        pnl: f64,
        entry: f64,
        exit: f64,
        scores: &[(SentimentSource, f64)],
    ) -> Position {
        Position {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "session-1".to_string(),
            symbol: "BTC".to_string(),
            side: TradeSide::Buy,
            opened_at: Utc::now(),
            entry_price: entry,
            quantity: 1.0,
            status: PositionStatus::Closed,
            exit_price: Some(exit),
            closed_at: Some(Utc::now()),
            realized_pnl: Some(pnl),
            strategy_id: "rsi-1".to_string(),
            entry_confidence: 0.7,
            entry_source_scores: scores.iter().copied().collect(),
            current_price: exit,
            unrealized_pnl: 0.0,
            watermark_price: exit,
        }
    }

    #[test]
    fn uniform_weights_sum_to_one() {
        let w = SourceWeights::uniform();
        assert!((w.sum() - 1.0).abs() < 1e-9);
        for s in SentimentSource::ALL {
            assert!((w.get(s) - 0.2).abs() < 1e-9);
        }
    }

    #[test]
    fn normalized_clamps_and_sums_to_one() {
        let mut raw = HashMap::new();
        raw.insert(SentimentSource::Microblog, 5.0); // clamps to 0.5
        raw.insert(SentimentSource::Forum, -1.0); // clamps to 0.05
        let w = SourceWeights::normalized(raw);
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_positions_no_update() {
        assert!(adjust(&SourceWeights::uniform(), &[]).is_none());
    }

    #[test]
    fn neutral_win_rate_no_update() {
        // Exactly 50% win rate sits in the dead band.
        let closed = vec![
            closed_position(10.0, 100.0, 110.0, &[(SentimentSource::News, 0.5)]),
            closed_position(-10.0, 100.0, 90.0, &[(SentimentSource::News, 0.5)]),
        ];
        assert!(adjust(&SourceWeights::uniform(), &closed).is_none());
    }

    #[test]
    fn winning_streak_boosts_agreeing_source() {
        // News agreed with the realized up-moves; forum fought them.
        let scores: &[(SentimentSource, f64)] = &[
            (SentimentSource::News, 0.8),
            (SentimentSource::Forum, -0.6),
        ];
        let closed: Vec<Position> = (0..5)
            .map(|_| closed_position(10.0, 100.0, 110.0, scores))
            .collect();

        let before = SourceWeights::uniform();
        let after = adjust(&before, &closed).unwrap();

        assert!((after.sum() - 1.0).abs() < 1e-9);
        assert!(after.get(SentimentSource::News) > before.get(SentimentSource::News));
        assert!(after.get(SentimentSource::Forum) < before.get(SentimentSource::Forum));
    }

    #[test]
    fn losing_streak_inverts_adjustment() {
        let scores: &[(SentimentSource, f64)] = &[
            (SentimentSource::News, 0.8),
            (SentimentSource::Forum, -0.6),
        ];
        // Losses on positions that went down: news still "agreed" with the
        // original bullish read, so news is the one to demote.
        let closed: Vec<Position> = (0..5)
            .map(|_| closed_position(-10.0, 100.0, 90.0, scores))
            .collect();

        let before = SourceWeights::uniform();
        let after = adjust(&before, &closed).unwrap();

        assert!((after.sum() - 1.0).abs() < 1e-9);
        // Realized direction was down; forum's bearish read agreed, news's
        // bullish read disagreed. Losing regime promotes the disagreeing one
        // inverted: the top-agreeing source (forum) is demoted.
        assert!(after.get(SentimentSource::Forum) < before.get(SentimentSource::Forum));
        assert!(after.get(SentimentSource::News) > before.get(SentimentSource::News));
    }

    #[test]
    fn handle_swaps_snapshots_atomically() {
        let handle = WeightsHandle::default();
        let first = handle.snapshot();

        let mut raw = first.as_map().clone();
        raw.insert(SentimentSource::News, 0.4);
        handle.publish(SourceWeights::normalized(raw));

        let second = handle.snapshot();
        // The old snapshot is untouched; the new one reflects the update.
        assert!((first.get(SentimentSource::News) - 0.2).abs() < 1e-9);
        assert!(second.get(SentimentSource::News) > first.get(SentimentSource::News));
    }
}
