// =============================================================================
// Neural-Confidence Strategy — shallow adaptive pattern scorer
// =============================================================================
//
// Over the lookback window the strategy computes normalised returns and feeds
// them through a stack of fixed-function transforms: a weighted tanh
// projection followed by tanh gain layers. Weights are seeded
// deterministically from the strategy id, and the first layer is refined
// every `adaptation_period` distinct ticks by a gradient step of size
// `learning_rate` toward the sign of the most recent realised return.
//
// This is a pattern detector, not a training framework: an identical input
// stream always produces an identical output stream.
// =============================================================================

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::strategies::{IndicatorSnapshot, NeuralConfidenceParams};
use crate::types::{Action, Tick};

/// Return normalisation: one percent of price movement saturates most of the
/// tanh input range.
const RETURN_SCALE: f64 = 100.0;

/// Deterministic adaptive state for one Neural-Confidence instance.
#[derive(Debug, Clone)]
pub struct NeuralState {
    /// Input projection weights, one per return in the lookback window.
    first_layer: Vec<f64>,
    /// Gain of each deeper layer, applied as `h = tanh(gain * h)`.
    gains: Vec<f64>,
    /// Distinct ticks evaluated so far; drives the adaptation cadence.
    ticks_seen: u64,
}

impl NeuralState {
    /// Seed weights from the strategy id. The id is part of the seed by
    /// construction, so re-creating the instance reproduces the weights.
    pub fn seeded(strategy_id: &str, params: &NeuralConfidenceParams) -> Self {
        let mut rng = StdRng::seed_from_u64(fnv1a64(strategy_id));

        let inputs = params.lookback_window.saturating_sub(1).max(1);
        let first_layer: Vec<f64> = (0..inputs).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let gains: Vec<f64> = (0..params.neural_layers.saturating_sub(1))
            .map(|_| rng.gen_range(1.0..2.0))
            .collect();

        Self {
            first_layer,
            gains,
            ticks_seen: 0,
        }
    }

    #[cfg(test)]
    pub fn first_layer(&self) -> &[f64] {
        &self.first_layer
    }
}

/// FNV-1a over the strategy id: a stable, explicit seed derivation.
fn fnv1a64(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub(crate) fn evaluate(
    params: &NeuralConfidenceParams,
    state: &mut NeuralState,
    window: &[Tick],
    fresh_tick: bool,
) -> (Action, f64, String, IndicatorSnapshot) {
    let closes: Vec<f64> = window.iter().map(|t| t.price).collect();
    if closes.len() < params.lookback_window {
        return (
            Action::Hold,
            0.1,
            format!("insufficient data: {} closes", closes.len()),
            IndicatorSnapshot::default(),
        );
    }

    // Normalised returns over the lookback window.
    let tail = &closes[closes.len() - params.lookback_window..];
    let inputs: Vec<f64> = tail
        .windows(2)
        .map(|w| {
            if w[0] != 0.0 {
                ((w[1] - w[0]) / w[0] * RETURN_SCALE).tanh()
            } else {
                0.0
            }
        })
        .collect();

    // Adapt first, then score: replaying the same tick skips adaptation and
    // therefore reproduces the same output.
    if fresh_tick {
        state.ticks_seen += 1;
        if state.ticks_seen % params.adaptation_period == 0 {
            let recent_sign = inputs.last().map(|r| r.signum()).unwrap_or(0.0);
            for (w, x) in state.first_layer.iter_mut().zip(inputs.iter()) {
                *w += params.learning_rate * recent_sign * x;
            }
        }
    }

    // Forward pass.
    let n = inputs.len().max(1) as f64;
    let projected: f64 = state
        .first_layer
        .iter()
        .zip(inputs.iter())
        .map(|(w, x)| w * x)
        .sum::<f64>()
        / n.sqrt();
    let mut output = projected.tanh();
    for gain in &state.gains {
        output = (gain * output).tanh();
    }

    let snapshot = IndicatorSnapshot {
        neural_output: Some(output),
        ..Default::default()
    };

    let confidence = (output.abs() * params.risk_multiplier).min(0.95);

    if output > params.confidence_threshold {
        (
            Action::Buy,
            confidence,
            format!("pattern score {output:.3}"),
            snapshot,
        )
    } else if output < -params.confidence_threshold {
        (
            Action::Sell,
            confidence,
            format!("pattern score {output:.3}"),
            snapshot,
        )
    } else {
        (
            Action::Hold,
            0.1,
            format!("pattern score {output:.3} below threshold"),
            snapshot,
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn window(prices: &[f64], offset_secs: i64) -> Vec<Tick> {
        let start = Utc::now() + Duration::seconds(offset_secs);
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Tick {
                symbol: "BTC".to_string(),
                ts: start + Duration::seconds(i as i64),
                price: p,
                volume: 1.0,
            })
            .collect()
    }

    fn params() -> NeuralConfidenceParams {
        NeuralConfidenceParams {
            lookback_window: 10,
            ..Default::default()
        }
    }

    #[test]
    fn seeding_is_deterministic_per_id() {
        let p = params();
        let a = NeuralState::seeded("neural-1", &p);
        let b = NeuralState::seeded("neural-1", &p);
        let c = NeuralState::seeded("neural-2", &p);
        assert_eq!(a.first_layer(), b.first_layer());
        assert_ne!(a.first_layer(), c.first_layer());
    }

    #[test]
    fn identical_input_stream_identical_output() {
        let p = params();
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + (i as f64).sin()).collect();

        let mut s1 = NeuralState::seeded("neural-1", &p);
        let mut s2 = NeuralState::seeded("neural-1", &p);
        for step in 0..20 {
            let w = window(&prices, step);
            let r1 = evaluate(&p, &mut s1, &w, true);
            let r2 = evaluate(&p, &mut s2, &w, true);
            assert_eq!(r1.0, r2.0);
            assert_eq!(r1.1, r2.1);
        }
    }

    #[test]
    fn flat_window_holds() {
        let p = params();
        let mut state = NeuralState::seeded("neural-1", &p);
        let w = window(&[100.0; 10], 0);
        let (action, _, _, snap) = evaluate(&p, &mut state, &w, true);
        assert_eq!(action, Action::Hold);
        assert!(snap.neural_output.unwrap().abs() < 1e-9);
    }

    #[test]
    fn insufficient_data_holds() {
        let p = params();
        let mut state = NeuralState::seeded("neural-1", &p);
        let (action, _, reason, _) = evaluate(&p, &mut state, &window(&[100.0; 3], 0), true);
        assert_eq!(action, Action::Hold);
        assert!(reason.contains("insufficient data"));
    }

    #[test]
    fn adaptation_respects_cadence_and_replay() {
        let mut p = params();
        p.adaptation_period = 2;
        let mut state = NeuralState::seeded("neural-1", &p);
        let initial = state.first_layer.clone();

        let prices: Vec<f64> = (0..10).map(|i| 100.0 * 1.02_f64.powi(i)).collect();

        // First fresh tick: no adaptation yet (1 % 2 != 0).
        let _ = evaluate(&p, &mut state, &window(&prices, 0), true);
        assert_eq!(state.first_layer, initial);

        // Replaying the same tick does not advance the cadence.
        let _ = evaluate(&p, &mut state, &window(&prices, 0), false);
        assert_eq!(state.first_layer, initial);

        // Second fresh tick: adaptation fires.
        let _ = evaluate(&p, &mut state, &window(&prices, 1), true);
        assert_ne!(state.first_layer, initial);
    }

    #[test]
    fn sustained_uptrend_adapts_into_buy() {
        // Strong 2% up-moves with aggressive adaptation: the first-layer
        // weights align with the positive return sign and the output crosses
        // the confidence threshold.
        let p = NeuralConfidenceParams {
            lookback_window: 10,
            learning_rate: 0.5,
            adaptation_period: 1,
            ..Default::default()
        };
        let mut state = NeuralState::seeded("neural-1", &p);
        let prices: Vec<f64> = (0..10).map(|i| 100.0 * 1.02_f64.powi(i)).collect();

        let mut last_action = Action::Hold;
        for step in 0..10 {
            let w = window(&prices, step);
            let (action, confidence, _, _) = evaluate(&p, &mut state, &w, true);
            assert!(confidence <= 0.95);
            last_action = action;
        }
        assert_eq!(last_action, Action::Buy);
    }
}
