// =============================================================================
// Quantum-Oscillator Strategy
// =============================================================================
//
// MACD-histogram momentum crosses gated by where the fast EMA sits inside the
// window's price range (the "oscillator position", normalised to [0, 100])
// and by a volume surge filter.
//
//   BUY : histogram crosses above zero, oscillator position below the
//         oversold level, and current volume exceeds its rolling mean times
//         the volume multiplier.
//   SELL: the mirror above the overbought level.
//
// Confidence = clamp(|hist| / momentum_threshold, 0, 0.95).
// =============================================================================

use crate::indicators::ema::ema;
use crate::indicators::macd::calculate_macd;
use crate::strategies::{IndicatorSnapshot, QuantumOscillatorParams};
use crate::types::{Action, Tick};

pub(crate) fn evaluate(
    params: &QuantumOscillatorParams,
    window: &[Tick],
) -> (Action, f64, String, IndicatorSnapshot) {
    let closes: Vec<f64> = window.iter().map(|t| t.price).collect();
    let volumes: Vec<f64> = window.iter().map(|t| t.volume).collect();

    let Some(macd) = calculate_macd(
        &closes,
        params.fast_period,
        params.slow_period,
        params.signal_period,
    ) else {
        return (
            Action::Hold,
            0.1,
            format!("insufficient data: {} closes", closes.len()),
            IndicatorSnapshot::default(),
        );
    };

    // Oscillator position: where the fast EMA sits inside the window's price
    // range, normalised to [0, 100]. A flat window reads as neutral 50.
    let fast_ema = ema(&closes, params.fast_period).unwrap_or_else(|| {
        closes.last().copied().unwrap_or(0.0)
    });
    let lo = closes.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = closes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let osc_position = if hi > lo {
        ((fast_ema - lo) / (hi - lo) * 100.0).clamp(0.0, 100.0)
    } else {
        50.0
    };

    // Volume surge: current volume against the rolling mean of the rest.
    let volume_mean = if volumes.len() > 1 {
        volumes[..volumes.len() - 1].iter().sum::<f64>() / (volumes.len() - 1) as f64
    } else {
        0.0
    };
    let current_volume = volumes.last().copied().unwrap_or(0.0);
    let volume_ok = volume_mean > 0.0 && current_volume > volume_mean * params.volume_multiplier;

    let snapshot = IndicatorSnapshot {
        macd: Some(macd.macd),
        macd_signal: Some(macd.signal),
        macd_hist: Some(macd.hist),
        volume_mean: Some(volume_mean),
        ..Default::default()
    };

    let confidence = (macd.hist.abs() / params.momentum_threshold).clamp(0.0, 0.95);

    let crossed_up = macd.hist > 0.0 && macd.prev_hist.map(|h| h <= 0.0).unwrap_or(false);
    let crossed_down = macd.hist < 0.0 && macd.prev_hist.map(|h| h >= 0.0).unwrap_or(false);

    if crossed_up && osc_position < params.oversold_level && volume_ok {
        return (
            Action::Buy,
            confidence,
            format!(
                "momentum cross up, hist {:.4}, osc {:.1}",
                macd.hist, osc_position
            ),
            snapshot,
        );
    }

    if crossed_down && osc_position > params.overbought_level && volume_ok {
        return (
            Action::Sell,
            confidence,
            format!(
                "momentum cross down, hist {:.4}, osc {:.1}",
                macd.hist, osc_position
            ),
            snapshot,
        );
    }

    (
        Action::Hold,
        0.1,
        format!("no momentum setup (hist {:.4})", macd.hist),
        snapshot,
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn ticks(prices: &[f64], volumes: &[f64]) -> Vec<Tick> {
        let start = Utc::now();
        prices
            .iter()
            .zip(volumes.iter())
            .enumerate()
            .map(|(i, (&p, &v))| Tick {
                symbol: "BTC".to_string(),
                ts: start + Duration::seconds(i as i64),
                price: p,
                volume: v,
            })
            .collect()
    }

    fn small_params() -> QuantumOscillatorParams {
        QuantumOscillatorParams {
            fast_period: 3,
            slow_period: 6,
            signal_period: 3,
            oversold_level: 45.0,
            overbought_level: 55.0,
            momentum_threshold: 0.5,
            volume_multiplier: 1.5,
        }
    }

    /// Decline into a sharp reversal: during the linear decline the histogram
    /// sits at zero, so the first bounce tick flips it positive while the
    /// fast EMA still sits near the bottom of the window range.
    fn reversal_prices() -> Vec<f64> {
        let mut prices: Vec<f64> = (0..25).map(|i| 200.0 - 3.0 * i as f64).collect();
        prices.push(130.0);
        prices
    }

    #[test]
    fn reversal_with_volume_surge_buys() {
        let prices = reversal_prices();
        let mut volumes = vec![10.0; prices.len()];
        *volumes.last_mut().unwrap() = 50.0; // surge on the trigger tick
        let (action, confidence, reason, snap) =
            evaluate(&small_params(), &ticks(&prices, &volumes));

        assert_eq!(action, Action::Buy, "reason: {reason}");
        assert!(confidence > 0.0 && confidence <= 0.95);
        assert!(snap.macd_hist.unwrap() > 0.0);
        assert!(reason.contains("momentum cross up"));
    }

    #[test]
    fn reversal_without_volume_surge_holds() {
        let prices = reversal_prices();
        let volumes = vec![10.0; prices.len()];
        let (action, _, _, _) = evaluate(&small_params(), &ticks(&prices, &volumes));
        assert_eq!(action, Action::Hold);
    }

    #[test]
    fn rally_rollover_with_volume_sells() {
        // Mirror: rally then sharp pullback near the top of the range.
        let mut prices: Vec<f64> = (0..25).map(|i| 100.0 + 3.0 * i as f64).collect();
        prices.push(170.0);
        let mut volumes = vec![10.0; prices.len()];
        *volumes.last_mut().unwrap() = 50.0;

        let (action, _, reason, snap) = evaluate(&small_params(), &ticks(&prices, &volumes));
        assert_eq!(action, Action::Sell, "reason: {reason}");
        assert!(snap.macd_hist.unwrap() < 0.0);
    }

    #[test]
    fn confidence_scales_with_histogram() {
        let prices = reversal_prices();
        let mut volumes = vec![10.0; prices.len()];
        *volumes.last_mut().unwrap() = 50.0;
        let window = ticks(&prices, &volumes);

        let mut strong = small_params();
        strong.momentum_threshold = 0.1; // small threshold inflates confidence
        let (_, conf_strong, _, _) = evaluate(&strong, &window);

        let mut weak = small_params();
        weak.momentum_threshold = 100.0; // huge threshold deflates it
        let (_, conf_weak, _, _) = evaluate(&weak, &window);

        assert!(conf_strong > conf_weak);
        assert!(conf_strong <= 0.95);
    }

    #[test]
    fn insufficient_data_holds() {
        let (action, _, reason, _) = evaluate(
            &QuantumOscillatorParams::default(),
            &ticks(&[100.0, 101.0], &[1.0, 1.0]),
        );
        assert_eq!(action, Action::Hold);
        assert!(reason.contains("insufficient data"));
    }
}
