// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// Volatility as the Wilder-smoothed average of the true range, where each
// bar's true range is the widest of: the bar's own span, and the distance
// of either extreme from the previous close (so gaps count in full).
//
// When the caller only has trade prices (no OHLC bars), passing the close
// series for highs and lows degrades the true range to |close - prevClose|,
// which is the right tick-level volatility measure.
// =============================================================================

/// Most recent ATR over parallel `highs`/`lows`/`closes` slices (oldest
/// first).
///
/// `None` when the period is zero, the slices disagree in length, there are
/// fewer than `period + 1` bars (every range needs a previous close), or
/// the data is not finite.
pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = closes.len();
    if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n {
        return None;
    }

    let inv_period = 1.0 / period as f64;
    let mut atr = 0.0;

    for i in 1..n {
        let prev_close = closes[i - 1];
        let true_range = (highs[i] - lows[i])
            .max((highs[i] - prev_close).abs())
            .max((lows[i] - prev_close).abs());

        if i <= period {
            // Seed phase: plain mean of the first `period` ranges.
            atr += true_range * inv_period;
        } else {
            // Wilder smoothing, written as a nudge toward the new range.
            atr += (true_range - atr) * inv_period;
        }
    }

    atr.is_finite().then_some(atr)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_input_yields_none() {
        let xs = vec![100.0; 20];
        assert!(calculate_atr(&xs, &xs, &xs, 0).is_none());

        // period + 1 bars are required; ten is not enough for period 14.
        let short = vec![100.0; 10];
        assert!(calculate_atr(&short, &short, &short, 14).is_none());

        // Slice lengths must agree.
        let highs = vec![101.0; 19];
        let lows = vec![99.0; 20];
        assert!(calculate_atr(&highs, &lows, &xs, 5).is_none());
    }

    #[test]
    fn constant_range_converges_to_it() {
        // Every bar spans ten points around a slowly drifting base, so the
        // smoothed average must settle right at ten.
        let n = 30;
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * 0.1).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 5.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 5.0).collect();
        let atr = calculate_atr(&highs, &lows, &closes, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn gaps_count_against_the_previous_close() {
        // The second bar opens far above the first close: its true range is
        // the 20-point gap, not the 7-point bar span.
        let highs = vec![105.0, 115.0, 118.0, 120.0];
        let lows = vec![95.0, 108.0, 110.0, 113.0];
        let closes = vec![95.0, 112.0, 115.0, 118.0];
        let atr = calculate_atr(&highs, &lows, &closes, 3).unwrap();
        assert!(atr > 7.0, "ATR should carry the gap, got {atr}");
    }

    #[test]
    fn tick_series_degrades_to_close_deltas() {
        // Highs = lows = closes: the range collapses to |close deltas|.
        let closes: Vec<f64> = vec![100.0, 102.0, 101.0, 103.0, 102.0, 104.0];
        let atr = calculate_atr(&closes, &closes, &closes, 3).unwrap();
        assert!(atr > 0.0);
        assert!(atr < 3.0);
    }

    #[test]
    fn rising_volatility_lifts_the_average() {
        let mut highs = Vec::new();
        let mut lows = Vec::new();
        let mut closes = Vec::new();
        for i in 0..30 {
            let spread = 1.0 + i as f64 * 0.5;
            highs.push(100.0 + spread);
            lows.push(100.0 - spread);
            closes.push(100.0);
        }
        let atr = calculate_atr(&highs, &lows, &closes, 5).unwrap();
        assert!(atr > 5.0, "expected ATR above 5.0 for widening bars, got {atr}");
    }

    #[test]
    fn nan_yields_none() {
        let mut highs = vec![105.0; 5];
        highs[2] = f64::NAN;
        let lows = vec![95.0; 5];
        let closes = vec![100.0; 5];
        assert!(calculate_atr(&highs, &lows, &closes, 3).is_none());
    }
}
