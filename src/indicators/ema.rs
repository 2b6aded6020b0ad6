// =============================================================================
// Moving Averages — EMA and SMA
// =============================================================================
//
// Both averages run over a caller-supplied slice and keep no history. The
// exponential variant folds each new value into a running average with
// weight 2/(period + 1), seeded from the plain mean of the first `period`
// values, so it tracks turns faster than the simple mean while staying on
// the window's scale.
// =============================================================================

/// Most recent EMA value, or `None` when the input is too short.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    calculate_ema(values, period).last().copied()
}

/// Mean of the trailing `period` values. `None` when the slice is shorter
/// than the period, the period is zero, or the data is not finite.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mean = values[values.len() - period..].iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// EMA series for `values`, one element per input from index `period - 1`
/// on (the seed mean counts as the first element).
///
/// An empty series means the input was too short or the period was zero.
/// A non-finite value poisons the running average, so the series is cut
/// off at the last trustworthy element instead of carrying NaN forward.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let weight = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(values.len() - period + 1);

    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    if !current.is_finite() {
        return series;
    }
    series.push(current);

    for &value in &values[period..] {
        // Nudge the running average toward the new value.
        current += (value - current) * weight;
        if !current.is_finite() {
            break;
        }
        series.push(current);
    }

    series
}
