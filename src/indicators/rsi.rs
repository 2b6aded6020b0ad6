// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Ratio of smoothed gains to total smoothed movement over the lookback,
// scaled to [0, 100]:
//
//   RSI = 100 * avg_gain / (avg_gain + avg_loss)
//
// The averages are Wilder-smoothed: seeded with the plain mean of the first
// `period` deltas, then nudged toward each new delta by 1/period. Readings
// above 70 are conventionally overbought, below 30 oversold.
// =============================================================================

/// Most recent RSI value for the given `closes` and `period`.
///
/// Fewer than `period + 1` closes (or a zero period) cannot produce a
/// reading, so the neutral midpoint 50.0 comes back instead. Output is in
/// [0, 100].
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    calculate_rsi(closes, period).last().copied().unwrap_or(50.0)
}

/// Full RSI series for `closes`, one value per close from index `period` on
/// (the earlier closes only feed the average seeds).
///
/// An empty series means the input was too short or the period was zero. A
/// non-finite close poisons the running averages, so the series is cut off
/// at the last trustworthy value rather than propagating NaN downstream.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let inv_period = 1.0 / period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    let mut series = Vec::with_capacity(closes.len() - period);

    for (i, pair) in closes.windows(2).enumerate() {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };

        if i < period {
            // Seed phase: plain mean of the first `period` deltas.
            avg_gain += gain * inv_period;
            avg_loss += loss * inv_period;
            if i + 1 < period {
                continue;
            }
        } else {
            // Wilder smoothing, written as a nudge toward the new delta.
            avg_gain += (gain - avg_gain) * inv_period;
            avg_loss += (loss - avg_loss) * inv_period;
        }

        let value = strength_ratio(avg_gain, avg_loss);
        if !value.is_finite() {
            break;
        }
        series.push(value);
    }

    series
}

/// Scale the smoothed averages to [0, 100].
///
/// Zero loss saturates at 100 when any gain exists; a completely flat
/// window (both averages zero) sits at the 50 midpoint.
fn strength_ratio(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        if avg_gain > 0.0 {
            100.0
        } else {
            50.0
        }
    } else {
        100.0 * avg_gain / (avg_gain + avg_loss)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- rsi (last value, neutral sentinel) ------------------------------

    #[test]
    fn rsi_neutral_on_short_input() {
        // One delta short of a full lookback still reads as the midpoint.
        assert_eq!(rsi(&[], 14), 50.0);
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert_eq!(rsi(&closes, 14), 50.0);
    }

    #[test]
    fn rsi_last_value_matches_series() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let series = calculate_rsi(&closes, 14);
        assert_eq!(rsi(&closes, 14), *series.last().unwrap());
    }

    // ---- calculate_rsi ---------------------------------------------------

    #[test]
    fn series_empty_on_degenerate_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
        // Exactly `period` closes gives only period-1 deltas.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 14).is_empty());
    }

    #[test]
    fn series_length_tracks_input() {
        // One value per close from index `period` on.
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let series = calculate_rsi(&closes, 14);
        assert_eq!(series.len(), closes.len() - 14);
    }

    #[test]
    fn one_sided_moves_saturate() {
        // Nothing but gains pins RSI to 100; nothing but losses pins it to 0.
        let rising: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for &v in &calculate_rsi(&rising, 14) {
            assert!((v - 100.0).abs() < 1e-10, "expected saturation high, got {v}");
        }

        let falling: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for &v in &calculate_rsi(&falling, 14) {
            assert!(v.abs() < 1e-10, "expected saturation low, got {v}");
        }
    }

    #[test]
    fn flat_market_sits_at_midpoint() {
        let closes = vec![100.0; 30];
        let series = calculate_rsi(&closes, 14);
        assert!(!series.is_empty());
        for &v in &series {
            assert!((v - 50.0).abs() < 1e-10, "expected 50.0, got {v}");
        }
    }

    #[test]
    fn values_stay_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for &v in &calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn nan_close_truncates_series() {
        // The poisoned average must not leak: the series stops at the last
        // finite value instead.
        let mut closes: Vec<f64> = (1..=20).map(|x| 100.0 + x as f64).collect();
        closes[10] = f64::NAN;
        let series = calculate_rsi(&closes, 5);
        assert!(series.len() < closes.len() - 5);
        for &v in &series {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn known_balance_of_gains_and_losses() {
        // Period 2, a long slide then a bounce of one third: the smoothed
        // averages land at gain 1/6 vs loss 1/2, i.e. RSI 25.
        let mut closes: Vec<f64> = (0..19).map(|i| 30.0 - i as f64).collect();
        let last = *closes.last().unwrap();
        closes.push(last + 1.0 / 3.0);
        let series = calculate_rsi(&closes, 2);
        assert!((series.last().unwrap() - 25.0).abs() < 1e-9);
    }
}
