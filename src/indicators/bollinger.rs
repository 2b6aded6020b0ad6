// =============================================================================
// Bollinger Bands
// =============================================================================
//
// A middle band (mean of the trailing window) bracketed by k population
// standard deviations on each side. The half-band distance is exposed
// directly because breakout confidence is measured in band widths.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Half-band distance k*σ, in price units.
    pub band: f64,
}

/// Bands over the trailing `period` closes.
///
/// `None` when the window is short, the period is zero, the middle band is
/// zero (degenerate input), or the data is not finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    // Population variance: the window is the whole population here, not a
    // sample of one.
    let variance = window
        .iter()
        .map(|close| {
            let deviation = close - middle;
            deviation * deviation
        })
        .sum::<f64>()
        / period as f64;
    let band = k * variance.sqrt();

    band.is_finite().then(|| BollingerResult {
        upper: middle + band,
        middle,
        lower: middle - band,
        band,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_bracket_the_middle_symmetrically() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.band > 0.0);
        assert!(((bb.upper - bb.middle) - (bb.middle - bb.lower)).abs() < 1e-10);
    }

    #[test]
    fn degenerate_input_yields_none() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_bollinger(&closes, 20, 2.0).is_none());
        assert!(calculate_bollinger(&closes, 0, 2.0).is_none());
        assert!(calculate_bollinger(&[f64::NAN; 20], 20, 2.0).is_none());
    }

    #[test]
    fn flat_window_collapses_the_bands() {
        let closes = vec![100.0; 20];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.upper - 100.0).abs() < 1e-10);
        assert!((bb.lower - 100.0).abs() < 1e-10);
        assert!(bb.band.abs() < 1e-10);
    }

    #[test]
    fn population_variance_not_sample() {
        // Window [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population σ exactly 2
        // (the sample estimator would give ~2.14).
        let closes = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bb = calculate_bollinger(&closes, 8, 2.0).unwrap();
        assert!((bb.middle - 5.0).abs() < 1e-10);
        assert!((bb.band - 4.0).abs() < 1e-10);
        assert!((bb.upper - 9.0).abs() < 1e-10);
        assert!((bb.lower - 1.0).abs() < 1e-10);
    }
}
