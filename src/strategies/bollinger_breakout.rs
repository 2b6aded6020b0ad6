// =============================================================================
// Bollinger-Breakout Strategy
// =============================================================================
//
// Trades closes that escape the bands: BUY on a close above the upper band,
// SELL on a close below the lower band. Optional RSI and volume filters gate
// the breakout.
//
// Confidence = clamp((|close - mid| - band) / band, 0, 0.95), i.e. how far
// beyond the band the close travelled, in band widths.
// =============================================================================

use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::rsi::rsi;
use crate::strategies::{BollingerBreakoutParams, IndicatorSnapshot};
use crate::types::{Action, Tick};

/// RSI period used by the optional breakout filter.
const FILTER_RSI_PERIOD: usize = 14;

pub(crate) fn evaluate(
    params: &BollingerBreakoutParams,
    window: &[Tick],
) -> (Action, f64, String, IndicatorSnapshot) {
    let closes: Vec<f64> = window.iter().map(|t| t.price).collect();
    let volumes: Vec<f64> = window.iter().map(|t| t.volume).collect();

    let (Some(upper_bb), Some(lower_bb)) = (
        calculate_bollinger(&closes, params.sma_length, params.ub_offset),
        calculate_bollinger(&closes, params.sma_length, params.lb_offset),
    ) else {
        return (
            Action::Hold,
            0.1,
            format!("insufficient data: {} closes", closes.len()),
            IndicatorSnapshot::default(),
        );
    };

    let close = closes.last().copied().unwrap_or(0.0);
    let rsi_now = rsi(&closes, FILTER_RSI_PERIOD);

    let volume_mean = if volumes.len() > 1 {
        volumes[..volumes.len() - 1].iter().sum::<f64>() / (volumes.len() - 1) as f64
    } else {
        0.0
    };
    let current_volume = volumes.last().copied().unwrap_or(0.0);
    let volume_ok = !params.use_volume_filter || current_volume > volume_mean;

    let snapshot = IndicatorSnapshot {
        rsi: Some(rsi_now),
        upper_band: Some(upper_bb.upper),
        middle_band: Some(upper_bb.middle),
        lower_band: Some(lower_bb.lower),
        volume_mean: Some(volume_mean),
        ..Default::default()
    };

    // --- BUY: close above the upper band -------------------------------------
    if close > upper_bb.upper {
        let rsi_ok = !params.use_rsi_filter || rsi_now > 50.0;
        if rsi_ok && volume_ok {
            let confidence = breakout_confidence(close, upper_bb.middle, upper_bb.band);
            return (
                Action::Buy,
                confidence,
                format!("breakout above upper band at {close:.2}"),
                snapshot,
            );
        }
    }

    // --- SELL: close below the lower band ------------------------------------
    if close < lower_bb.lower {
        let rsi_ok = !params.use_rsi_filter || rsi_now < 50.0;
        if rsi_ok && volume_ok {
            let confidence = breakout_confidence(close, lower_bb.middle, lower_bb.band);
            return (
                Action::Sell,
                confidence,
                format!("breakdown below lower band at {close:.2}"),
                snapshot,
            );
        }
    }

    (
        Action::Hold,
        0.1,
        "price inside bands".to_string(),
        snapshot,
    )
}

/// Distance beyond the band, measured in band widths, clamped to [0, 0.95].
fn breakout_confidence(close: f64, mid: f64, band: f64) -> f64 {
    if band <= 0.0 {
        return 0.0;
    }
    (((close - mid).abs() - band) / band).clamp(0.0, 0.95)
}
