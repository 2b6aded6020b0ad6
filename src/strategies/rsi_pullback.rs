// =============================================================================
// RSI-Pullback Strategy
// =============================================================================
//
// Buys a recovering dip: RSI has fallen below the lower barrier and is turning
// back up while price holds above its moving average. Sells the mirror image
// above the upper barrier.
//
// Confidence starts at 0.5 at the barrier and grows linearly with how deep
// into the threshold band RSI sits, capped at 0.95.
// =============================================================================

use crate::indicators::ema::sma;
use crate::indicators::rsi::calculate_rsi;
use crate::strategies::{IndicatorSnapshot, RsiPullbackParams};
use crate::types::{Action, Tick};

pub(crate) fn evaluate(
    params: &RsiPullbackParams,
    window: &[Tick],
) -> (Action, f64, String, IndicatorSnapshot) {
    let closes: Vec<f64> = window.iter().map(|t| t.price).collect();

    let series = calculate_rsi(&closes, params.lookback);
    if series.is_empty() {
        return (
            Action::Hold,
            0.1,
            format!("insufficient data: {} closes", closes.len()),
            IndicatorSnapshot::default(),
        );
    }

    let rsi_now = *series.last().unwrap_or(&50.0);
    let rsi_prev = if series.len() >= 2 {
        series[series.len() - 2]
    } else {
        rsi_now
    };

    let price = closes.last().copied().unwrap_or(0.0);
    // The MA filter only applies once enough history exists for it.
    let ma = sma(&closes, params.ma_length);

    let snapshot = IndicatorSnapshot {
        rsi: Some(rsi_now),
        sma: ma,
        ..Default::default()
    };

    // --- BUY: RSI below the lower barrier and turning up ---------------------
    let buy_zone = rsi_now < params.lower_barrier && rsi_now >= rsi_prev;
    let buy_ma_ok = ma.map(|m| price > m).unwrap_or(true);
    if buy_zone && buy_ma_ok {
        let depth = ((params.lower_barrier - rsi_now)
            / (params.lower_barrier - params.lower_threshold))
            .clamp(0.0, 1.0);
        let confidence = (0.5 + 0.5 * depth).min(0.95);
        return (
            Action::Buy,
            confidence,
            format!("RSI oversold at {rsi_now:.2}"),
            snapshot,
        );
    }

    // --- SELL: RSI above the upper barrier and turning down ------------------
    let sell_zone = rsi_now > params.upper_barrier && rsi_now <= rsi_prev;
    let sell_ma_ok = ma.map(|m| price < m).unwrap_or(true);
    if sell_zone && sell_ma_ok {
        let depth = ((rsi_now - params.upper_barrier)
            / (params.upper_threshold - params.upper_barrier))
            .clamp(0.0, 1.0);
        let confidence = (0.5 + 0.5 * depth).min(0.95);
        return (
            Action::Sell,
            confidence,
            format!("RSI overbought at {rsi_now:.2}"),
            snapshot,
        );
    }

    (
        Action::Hold,
        0.1,
        format!("no pullback setup (RSI {rsi_now:.2})"),
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

    fn ticks(prices: &[f64]) -> Vec<Tick> {
        let start = Utc::now();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Tick {
                symbol: "BTC".to_string(),
                ts: start + Duration::seconds(30 * i as i64),
                price: p,
                volume: 1.0,
            })
            .collect()
    }

    /// 20 closes: a steady decline of 1.0, then a +1/3 bounce. With RSI(2)
    /// Wilder smoothing this lands exactly on RSI = 25.
    fn oversold_bounce_prices() -> Vec<f64> {
        let mut prices: Vec<f64> = (0..19).map(|i| 30.0 - i as f64).collect();
        let last = *prices.last().unwrap();
        prices.push(last + 1.0 / 3.0);
        prices
    }

    #[test]
    fn oversold_bounce_triggers_buy_at_expected_confidence() {
        let params = RsiPullbackParams {
            lookback: 2,
            ..Default::default()
        };
        let window = ticks(&oversold_bounce_prices());
        let (action, confidence, reason, snapshot) = evaluate(&params, &window);

        assert_eq!(action, Action::Buy);
        // RSI = 25 with barrier 30 / threshold 20: depth 0.5, conf 0.75.
        assert!((confidence - 0.75).abs() < 1e-9, "confidence {confidence}");
        assert_eq!(reason, "RSI oversold at 25.00");
        assert!((snapshot.rsi.unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn continued_decline_does_not_buy() {
        // RSI still falling: no recovery, no entry.
        let params = RsiPullbackParams {
            lookback: 2,
            ..Default::default()
        };
        let prices: Vec<f64> = (0..20).map(|i| 30.0 - i as f64).collect();
        let (action, _, _, _) = evaluate(&params, &ticks(&prices));
        assert_eq!(action, Action::Hold);
    }

    #[test]
    fn overbought_rollover_triggers_sell() {
        let params = RsiPullbackParams {
            lookback: 2,
            ..Default::default()
        };
        // Mirror of the buy case: rally then a -1/3 dip lands on RSI = 75.
        let mut prices: Vec<f64> = (0..19).map(|i| 10.0 + i as f64).collect();
        let last = *prices.last().unwrap();
        prices.push(last - 1.0 / 3.0);

        let (action, confidence, reason, _) = evaluate(&params, &ticks(&prices));
        assert_eq!(action, Action::Sell);
        assert!((confidence - 0.75).abs() < 1e-9, "confidence {confidence}");
        assert_eq!(reason, "RSI overbought at 75.00");
    }

    #[test]
    fn ma_filter_blocks_buy_below_average() {
        // Enough history for the MA: price far below it blocks the entry.
        let params = RsiPullbackParams {
            lookback: 2,
            ma_length: 10,
            ..Default::default()
        };
        let window = ticks(&oversold_bounce_prices());
        // Final price 11.33 is far below SMA(10) of the declining tail.
        let (action, _, _, _) = evaluate(&params, &window);
        assert_eq!(action, Action::Hold);
    }

    #[test]
    fn insufficient_data_holds() {
        let params = RsiPullbackParams::default();
        let (action, confidence, reason, _) = evaluate(&params, &ticks(&[100.0, 101.0]));
        assert_eq!(action, Action::Hold);
        assert!((confidence - 0.1).abs() < f64::EPSILON);
        assert!(reason.contains("insufficient data"));
    }

    #[test]
    fn confidence_caps_at_095() {
        // RSI near zero: depth clamps to 1, confidence to min(1.0, 0.95).
        let params = RsiPullbackParams {
            lookback: 2,
            lower_threshold: 29.0, // any dip below 29 saturates the band
            ..Default::default()
        };
        let mut prices: Vec<f64> = (0..19).map(|i| 100.0 - 2.0 * i as f64).collect();
        let last = *prices.last().unwrap();
        prices.push(last + 0.01); // tiny bounce keeps RSI very low
        let (action, confidence, _, _) = evaluate(&params, &ticks(&prices));
        assert_eq!(action, Action::Buy);
        assert!(confidence <= 0.95);
    }
}
