// =============================================================================
// MACD (Moving Average Convergence Divergence)
// =============================================================================
//
// Components:
//   MACD line  = EMA(fast) - EMA(slow)
//   Signal     = EMA(MACD line, signal period)
//   Histogram  = MACD line - Signal
//
// Histogram crossing zero is the momentum trigger used by the strategies; the
// previous histogram value is exposed so callers can detect the cross without
// recomputing the series.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// Latest MACD values plus the previous histogram value for cross detection.
#[derive(Debug, Clone)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub hist: f64,
    /// Histogram one step earlier, `None` when the series is a single point.
    pub prev_hist: Option<f64>,
}

/// Compute MACD over `closes` with the given periods.
///
/// Returns `None` when there is not enough data to produce at least one
/// signal-line value, i.e. fewer than `slow + signal` closes, or when any
/// period is zero or `fast >= slow`.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if fast_series.is_empty() || slow_series.is_empty() {
        return None;
    }

    // Align the two series on their shared tail: the slow series is shorter,
    // so drop the head of the fast series.
    let offset = fast_series.len() - slow_series.len();
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[offset + i] - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal);
    if signal_series.is_empty() {
        return None;
    }

    // Histogram over the aligned tail of the MACD line.
    let macd_offset = macd_line.len() - signal_series.len();
    let hist_series: Vec<f64> = signal_series
        .iter()
        .enumerate()
        .map(|(i, sig)| macd_line[macd_offset + i] - sig)
        .collect();

    let macd = *macd_line.last()?;
    let sig = *signal_series.last()?;
    let hist = *hist_series.last()?;
    let prev_hist = if hist_series.len() >= 2 {
        Some(hist_series[hist_series.len() - 2])
    } else {
        None
    };

    if macd.is_finite() && sig.is_finite() && hist.is_finite() {
        Some(MacdResult {
            macd,
            signal: sig,
            hist,
            prev_hist,
        })
    } else {
        None
    }
}
