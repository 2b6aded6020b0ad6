// =============================================================================
// Sentiment Aggregator — fan-out/fan-in across all sources
// =============================================================================
//
// Per cycle per symbol: every source fetcher runs concurrently (bounded
// parallelism) with its own deadline. A failed source contributes a neutral
// reading and never aborts the cycle. Readings are combined under the current
// weights snapshot; sources reporting zero confidence contribute zero weight.
//
// Critical-event extraction scans the structured fields of each reading; a
// HACK or critical REGULATORY event forces STRONG_SELL at confidence 0.9
// regardless of score.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::counters::{bump, Counters};
use crate::market_data::OrderBookManager;
use crate::sentiment::nlp::OnChainMetrics;
use crate::sentiment::weights::WeightsHandle;
use crate::sentiment::{
    AggregatedSentiment, Fetcher, SentimentCache, SentimentSource, SourceReading, SourceWeights,
    TradingSignal,
};
use crate::types::{
    CriticalEvent, EventKind, EventSeverity, RiskLevel, SentimentCategory, SignalAction,
};

/// Bounded fan-out across source fetchers.
const MAX_CONCURRENT_FETCHES: usize = 8;
/// Order-book confidence that can override a low-confidence cycle.
const ORDER_BOOK_OVERRIDE_CONFIDENCE: f64 = 0.8;
/// Score-space distance treated as disagreement with the order book.
const ORDER_BOOK_DISAGREE_DISTANCE: f64 = 0.5;
/// Score-space distance treated as alignment with the order book.
const ORDER_BOOK_ALIGN_DISTANCE: f64 = 0.2;
/// Large-transfer count that registers as whale movement.
const WHALE_TRANSFER_THRESHOLD: f64 = 100.0;

// ---------------------------------------------------------------------------
// Market context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Low,
    Normal,
    High,
    Extreme,
}

/// Coarse market state used by the category-to-action table.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MarketContext {
    pub trend: Trend,
    pub volatility: Level,
    pub volume: Level,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            trend: Trend::Flat,
            volatility: Level::Normal,
            volume: Level::Normal,
        }
    }
}

/// Derive the context from order-book intelligence (when available) and the
/// cycle's source readings.
pub fn derive_context(
    orderbook: Option<&Arc<OrderBookManager>>,
    symbol: &str,
    readings: &[SourceReading],
) -> MarketContext {
    let mut context = MarketContext::default();

    if let Some(intel) = orderbook.and_then(|m| m.intelligence(symbol)) {
        context.trend = if intel.market_pressure > 15.0 {
            Trend::Up
        } else if intel.market_pressure < -15.0 {
            Trend::Down
        } else {
            Trend::Flat
        };
        // Thin books read as volatile.
        context.volatility = if intel.liquidity_score < 30.0 {
            Level::Extreme
        } else if intel.liquidity_score < 50.0 {
            Level::High
        } else if intel.liquidity_score < 75.0 {
            Level::Normal
        } else {
            Level::Low
        };
    }

    let total_volume: f64 = readings.iter().map(|r| r.volume).sum();
    context.volume = if total_volume >= 10_000.0 {
        Level::Extreme
    } else if total_volume >= 1_000.0 {
        Level::High
    } else if total_volume >= 100.0 {
        Level::Normal
    } else {
        Level::Low
    };

    context
}

// ---------------------------------------------------------------------------
// Pure combination core
// ---------------------------------------------------------------------------

/// Combine one cycle's readings into an aggregated sentiment.
pub fn combine_readings(
    symbol: &str,
    readings: Vec<SourceReading>,
    weights: &SourceWeights,
    context: MarketContext,
) -> AggregatedSentiment {
    // --- Weighted score / confidence ------------------------------------------
    // The denominator is the full weight sum: a source reporting zero
    // confidence contributes weight 0 to the numerators, so dead sources pull
    // both the score and the confidence toward neutral.
    let mut score_num = 0.0;
    let mut conf_num = 0.0;
    for reading in &readings {
        if reading.confidence <= 0.0 {
            continue;
        }
        let w = weights.get(reading.source);
        score_num += reading.score * w;
        conf_num += reading.confidence * w;
    }
    let weight_den = weights.sum();

    let overall_score = if weight_den > 0.0 {
        (score_num / weight_den).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let overall_confidence = if weight_den > 0.0 {
        (conf_num / weight_den).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let category = SentimentCategory::from_score(overall_score);
    let critical_events = extract_critical_events(&readings);
    let trading_signal = derive_trading_signal(
        overall_score,
        overall_confidence,
        category,
        &critical_events,
        &readings,
        context,
    );

    let per_source: HashMap<SentimentSource, SourceReading> =
        readings.into_iter().map(|r| (r.source, r)).collect();

    AggregatedSentiment {
        symbol: symbol.to_string(),
        ts: Utc::now(),
        overall_score,
        overall_confidence,
        category,
        per_source,
        critical_events,
        trading_signal,
    }
}

/// Scan each reading's structured payload for high-impact events.
fn extract_critical_events(readings: &[SourceReading]) -> Vec<CriticalEvent> {
    let mut events = Vec::new();

    for reading in readings {
        // Text payloads: scan every string in the raw envelope.
        let mut strings = Vec::new();
        collect_strings(&reading.raw, &mut strings);
        for text in &strings {
            if let Some(event) = classify_text_event(text, reading.source) {
                events.push(event);
            }
        }

        // On-chain payloads: whale movement from the transfer counters.
        if reading.source == SentimentSource::OnChain {
            if let Ok(metrics) = serde_json::from_value::<OnChainMetrics>(reading.raw.clone()) {
                if metrics.large_transfer_count > WHALE_TRANSFER_THRESHOLD {
                    let inflow_heavy = metrics.exchange_inflow > metrics.exchange_outflow;
                    events.push(CriticalEvent {
                        kind: EventKind::WhaleMove,
                        severity: EventSeverity::High,
                        impact: if inflow_heavy { -4.0 } else { 3.0 },
                        source: reading.source.to_string(),
                        ts: reading.produced_at,
                        description: format!(
                            "{} large transfers, {}",
                            metrics.large_transfer_count,
                            if inflow_heavy {
                                "net exchange inflow"
                            } else {
                                "net exchange outflow"
                            }
                        ),
                    });
                }
            }
        }
    }

    events
}

/// Map one text to an event, if it mentions a high-impact keyword.
///
/// Matching is token-based (lowercased words) so that e.g. "ban" does not
/// fire on "bank".
fn classify_text_event(text: &str, source: SentimentSource) -> Option<CriticalEvent> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    let has_prefix = |prefixes: &[&str]| {
        tokens
            .iter()
            .any(|t| prefixes.iter().any(|p| t.starts_with(p)))
    };
    let has_word = |words: &[&str]| tokens.iter().any(|t| words.iter().any(|w| t == w));

    let (kind, severity, impact) = if has_prefix(&["hack", "exploit", "breach", "drain"]) {
        (EventKind::Hack, EventSeverity::Critical, -9.0)
    } else if has_word(&["ban", "banned", "bans"]) {
        (EventKind::Regulatory, EventSeverity::Critical, -7.0)
    } else if has_word(&["sec"]) || has_prefix(&["regulat", "lawsuit"]) {
        (EventKind::Regulatory, EventSeverity::High, -5.0)
    } else if has_prefix(&["partnership"]) {
        (EventKind::Partnership, EventSeverity::Medium, 5.0)
    } else if has_word(&["listing", "listed"]) {
        (EventKind::Listing, EventSeverity::Medium, 4.0)
    } else {
        return None;
    };

    Some(CriticalEvent {
        kind,
        severity,
        impact,
        source: source.to_string(),
        ts: Utc::now(),
        description: text.chars().take(140).collect(),
    })
}

/// Gather every string value in a JSON payload.
fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(arr) => {
            for v in arr {
                collect_strings(v, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Category x context to action, with critical-event and order-book overrides.
fn derive_trading_signal(
    overall_score: f64,
    overall_confidence: f64,
    category: SentimentCategory,
    events: &[CriticalEvent],
    readings: &[SourceReading],
    context: MarketContext,
) -> TradingSignal {
    // --- Forced exit on catastrophic events ----------------------------------
    if let Some(event) = events.iter().find(|e| {
        e.kind == EventKind::Hack
            || (e.kind == EventKind::Regulatory && e.severity >= EventSeverity::Critical)
    }) {
        return TradingSignal {
            action: SignalAction::StrongSell,
            confidence: 0.9,
            reason: format!("{} event: {}", event.kind, event.description),
            risk_level: RiskLevel::Extreme,
        };
    }

    let order_book = readings
        .iter()
        .find(|r| r.source == SentimentSource::OrderBook && r.confidence > 0.0);

    // --- Low-confidence cycles wait unless the book overrides ----------------
    if overall_confidence < 0.5 {
        if let Some(ob) = order_book.filter(|r| r.confidence > ORDER_BOOK_OVERRIDE_CONFIDENCE) {
            // A strong book read is downgraded one notch: STRONG_BUY acts
            // as BUY when the rest of the sources cannot confirm it.
            let action = if ob.score >= 0.2 {
                SignalAction::Buy
            } else if ob.score <= -0.2 {
                SignalAction::Sell
            } else {
                SignalAction::Hold
            };
            return TradingSignal {
                action,
                confidence: ob.confidence,
                reason: format!(
                    "order-book override: book score {:.2} at confidence {:.2}",
                    ob.score, ob.confidence
                ),
                risk_level: RiskLevel::Medium,
            };
        }
        return TradingSignal {
            action: SignalAction::Wait,
            confidence: overall_confidence,
            reason: format!("overall confidence {overall_confidence:.2} below 0.50"),
            risk_level: RiskLevel::Medium,
        };
    }

    // --- Category x market context table -------------------------------------
    let (action, mut risk, reason) = match category {
        SentimentCategory::ExtremeBullish => {
            if context.volatility == Level::Extreme {
                (
                    SignalAction::Buy,
                    RiskLevel::High,
                    "extreme bullish sentiment under extreme volatility".to_string(),
                )
            } else {
                (
                    SignalAction::StrongBuy,
                    RiskLevel::Medium,
                    "extreme bullish sentiment".to_string(),
                )
            }
        }
        SentimentCategory::Bullish => {
            if context.volume >= Level::High {
                (
                    SignalAction::Buy,
                    RiskLevel::Medium,
                    "bullish sentiment with strong volume".to_string(),
                )
            } else {
                (
                    SignalAction::Hold,
                    RiskLevel::Low,
                    "bullish sentiment without volume confirmation".to_string(),
                )
            }
        }
        SentimentCategory::Bearish => {
            if context.trend == Trend::Down {
                (
                    SignalAction::Sell,
                    RiskLevel::Medium,
                    "bearish sentiment in a downtrend".to_string(),
                )
            } else {
                (
                    SignalAction::Hold,
                    RiskLevel::Medium,
                    "bearish sentiment without trend confirmation".to_string(),
                )
            }
        }
        SentimentCategory::ExtremeBearish => {
            if context.volatility == Level::Extreme {
                (
                    SignalAction::StrongSell,
                    RiskLevel::Extreme,
                    "extreme bearish sentiment under extreme volatility".to_string(),
                )
            } else {
                (
                    SignalAction::Sell,
                    RiskLevel::High,
                    "extreme bearish sentiment".to_string(),
                )
            }
        }
        SentimentCategory::Neutral => (
            SignalAction::Hold,
            RiskLevel::Low,
            "neutral sentiment".to_string(),
        ),
    };

    // --- Order-book alignment adjustment --------------------------------------
    let mut confidence = overall_confidence;
    let mut reason = reason;
    if let Some(ob) = order_book {
        let distance = (ob.score - overall_score).abs();
        if distance >= ORDER_BOOK_DISAGREE_DISTANCE {
            confidence *= 0.8;
            risk = risk.escalate();
            reason.push_str(&format!("; order book disagrees ({:.2} apart)", distance));
        } else if distance <= ORDER_BOOK_ALIGN_DISTANCE {
            confidence = (confidence * 1.1).min(0.95);
            risk = risk.deescalate();
            reason.push_str("; order book aligned");
        }
    }

    TradingSignal {
        action,
        confidence,
        reason,
        risk_level: risk,
    }
}

// ---------------------------------------------------------------------------
// Aggregator task
// ---------------------------------------------------------------------------

async fn fetch_or_neutral(
    fetcher: &Fetcher,
    symbol: &str,
    source_timeout: Duration,
    counters: Arc<Counters>,
) -> SourceReading {
    let source = fetcher.source();
    match fetcher.fetch(symbol, source_timeout).await {
        Ok(reading) => reading,
        Err(e) => {
            bump(&counters.fetch_failures);
            debug!(source = %source, symbol, error = %e, "substituting neutral reading");
            SourceReading::neutral(source, symbol)
        }
    }
}

/// Long-lived aggregation component: one cycle per symbol per interval.
pub struct SentimentAggregator {
    fetchers: Vec<Fetcher>,
    weights: Arc<WeightsHandle>,
    cache: Arc<SentimentCache>,
    orderbook: Option<Arc<OrderBookManager>>,
    alerts: Arc<dyn AlertSink>,
    source_timeout: Duration,
    counters: Arc<Counters>,
}

impl SentimentAggregator {
    pub fn new(
        fetchers: Vec<Fetcher>,
        weights: Arc<WeightsHandle>,
        cache: Arc<SentimentCache>,
        orderbook: Option<Arc<OrderBookManager>>,
        alerts: Arc<dyn AlertSink>,
        source_timeout: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            fetchers,
            weights,
            cache,
            orderbook,
            alerts,
            source_timeout,
            counters,
        }
    }

    /// One aggregation cycle for `symbol`: fan out, normalise failures,
    /// combine under the current weights snapshot, publish to the cache.
    pub async fn aggregate_symbol(&self, symbol: &str) -> AggregatedSentiment {
        let weights = self.weights.snapshot();

        let source_timeout = self.source_timeout;
        let counters = self.counters.clone();
        let mut fetch_futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = SourceReading> + Send + '_>>,
        > = Vec::with_capacity(self.fetchers.len());
        for fetcher in self.fetchers.iter() {
            fetch_futures.push(Box::pin(fetch_or_neutral(
                fetcher,
                symbol,
                source_timeout,
                counters.clone(),
            )));
        }
        let readings: Vec<SourceReading> = stream::iter(fetch_futures)
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await;

        let context = derive_context(self.orderbook.as_ref(), symbol, &readings);
        let sentiment = combine_readings(symbol, readings, &weights, context);

        debug!(
            symbol,
            score = sentiment.overall_score,
            confidence = sentiment.overall_confidence,
            category = %sentiment.category,
            action = %sentiment.trading_signal.action,
            events = sentiment.critical_events.len(),
            "sentiment cycle complete"
        );

        self.cache.publish(sentiment.clone());
        sentiment
    }

    /// Run cycles for every symbol until shutdown.
    pub async fn run(
        self,
        symbols: Vec<String>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            symbols = ?symbols,
            interval_ms = interval.as_millis() as u64,
            sources = self.fetchers.len(),
            "sentiment aggregator started"
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for symbol in &symbols {
                        let sentiment = self.aggregate_symbol(symbol).await;
                        for event in &sentiment.critical_events {
                            if event.severity >= EventSeverity::High {
                                warn!(
                                    symbol,
                                    kind = %event.kind,
                                    severity = %event.severity,
                                    description = %event.description,
                                    "critical event detected"
                                );
                                self.alerts.send_alert(Alert::new(
                                    AlertKind::CriticalEvent,
                                    event.severity,
                                    serde_json::json!({
                                        "symbol": symbol,
                                        "kind": event.kind.to_string(),
                                        "impact": event.impact,
                                        "description": event.description,
                                        "source": event.source,
                                    }),
                                ));
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sentiment aggregator stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading(source: SentimentSource, score: f64, confidence: f64) -> SourceReading {
        SourceReading {
            source,
            symbol: "BTC".to_string(),
            score,
            confidence,
            volume: 10.0,
            produced_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn weighted_combination_bounds_hold_under_failures() {
        // Invariant: scores stay in [-1, 1] and confidence in [0, 1] no
        // matter which sources fail.
        let weights = SourceWeights::uniform();
        let readings = vec![
            reading(SentimentSource::Microblog, 0.9, 0.8),
            reading(SentimentSource::Forum, -1.0, 1.0),
            SourceReading::neutral(SentimentSource::News, "BTC"),
            SourceReading::neutral(SentimentSource::OnChain, "BTC"),
            SourceReading::neutral(SentimentSource::OrderBook, "BTC"),
        ];
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());
        assert!((-1.0..=1.0).contains(&agg.overall_score));
        assert!((0.0..=1.0).contains(&agg.overall_confidence));
    }

    #[test]
    fn all_sources_failed_is_neutral_wait() {
        let weights = SourceWeights::uniform();
        let readings: Vec<SourceReading> = SentimentSource::ALL
            .iter()
            .map(|s| SourceReading::neutral(*s, "BTC"))
            .collect();
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());
        assert_eq!(agg.overall_score, 0.0);
        assert_eq!(agg.overall_confidence, 0.0);
        assert_eq!(agg.trading_signal.action, SignalAction::Wait);
    }

    #[test]
    fn zero_confidence_sources_dilute_but_never_distort() {
        // Round-trip law: the per-source map reproduces the reading's own
        // score/confidence exactly; dead sources only dilute the overall.
        let weights = SourceWeights::uniform();
        let readings = vec![
            reading(SentimentSource::Microblog, 0.65, 0.7),
            SourceReading::neutral(SentimentSource::Forum, "BTC"),
            SourceReading::neutral(SentimentSource::News, "BTC"),
            SourceReading::neutral(SentimentSource::OnChain, "BTC"),
            SourceReading::neutral(SentimentSource::OrderBook, "BTC"),
        ];
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());

        let kept = &agg.per_source[&SentimentSource::Microblog];
        assert!((kept.score - 0.65).abs() < 1e-9);
        assert!((kept.confidence - 0.7).abs() < 1e-9);

        // One live source out of five at weight 0.2 each.
        assert!((agg.overall_score - 0.65 * 0.2).abs() < 1e-9);
        assert!((agg.overall_confidence - 0.7 * 0.2).abs() < 1e-9);
    }

    #[test]
    fn category_mapping_through_combination() {
        let weights = SourceWeights::uniform();
        let readings = vec![
            reading(SentimentSource::Microblog, 0.8, 0.9),
            reading(SentimentSource::Forum, 0.8, 0.9),
            reading(SentimentSource::News, 0.8, 0.9),
            reading(SentimentSource::OnChain, 0.7, 0.8),
            reading(SentimentSource::OrderBook, 0.8, 0.9),
        ];
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());
        // Weighted score 0.78 crosses the EXTREME_BULLISH threshold.
        assert_eq!(agg.category, SentimentCategory::ExtremeBullish);
        assert_eq!(agg.trading_signal.action, SignalAction::StrongBuy);
    }

    #[test]
    fn hack_event_forces_strong_sell() {
        let weights = SourceWeights::uniform();
        // Bullish scores everywhere; the exploit headline must still win.
        let mut news = reading(SentimentSource::News, 0.8, 0.9);
        news.raw = json!({ "titles": ["Protocol treasury drained in exploit"] });
        let agg = combine_readings("BTC", vec![news], &weights, MarketContext::default());

        assert!(agg
            .critical_events
            .iter()
            .any(|e| e.kind == EventKind::Hack));
        assert_eq!(agg.trading_signal.action, SignalAction::StrongSell);
        assert!((agg.trading_signal.confidence - 0.9).abs() < 1e-9);
        assert_eq!(agg.trading_signal.risk_level, RiskLevel::Extreme);
    }

    #[test]
    fn whale_move_extracted_from_onchain_metrics() {
        let weights = SourceWeights::uniform();
        let mut onchain = reading(SentimentSource::OnChain, -0.2, 0.6);
        onchain.raw = json!({
            "tx_count": 9000.0,
            "large_transfer_count": 250.0,
            "exchange_inflow": 900.0,
            "exchange_outflow": 100.0,
        });
        let agg = combine_readings("BTC", vec![onchain], &weights, MarketContext::default());
        let whale = agg
            .critical_events
            .iter()
            .find(|e| e.kind == EventKind::WhaleMove)
            .expect("whale event");
        assert_eq!(whale.severity, EventSeverity::High);
        assert!(whale.impact < 0.0); // inflow-heavy reads bearish
    }

    #[test]
    fn order_book_override_on_low_confidence() {
        // End-to-end scenario: sentiment neutral at low confidence, order
        // book strongly bid. Expect a BUY whose rationale references the
        // order-book override.
        let weights = SourceWeights::uniform();
        let readings = vec![
            reading(SentimentSource::Microblog, 0.0, 0.3),
            reading(SentimentSource::OrderBook, 0.8, 0.85),
        ];
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());
        assert!(agg.overall_confidence < 0.5);
        assert_eq!(agg.trading_signal.action, SignalAction::Buy);
        assert!(agg.trading_signal.reason.contains("order-book override"));
    }

    #[test]
    fn order_book_disagreement_cuts_confidence_and_escalates_risk() {
        let weights = SourceWeights::uniform();
        // Bullish text sources, bearish book; heavy volume so the category
        // table lands on BUY before the adjustment.
        let mut readings = vec![
            reading(SentimentSource::News, 0.8, 0.9),
            reading(SentimentSource::Microblog, 0.8, 0.9),
            reading(SentimentSource::Forum, 0.6, 0.8),
            reading(SentimentSource::OnChain, 0.3, 0.7),
            reading(SentimentSource::OrderBook, -0.4, 0.7),
        ];
        for r in &mut readings {
            r.volume = 3_000.0;
        }
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());

        assert_eq!(agg.category, SentimentCategory::Bullish);
        assert!(agg.trading_signal.confidence < agg.overall_confidence);
        assert!(agg.trading_signal.reason.contains("order book disagrees"));
        assert!(agg.trading_signal.risk_level >= RiskLevel::High);
    }

    #[test]
    fn order_book_alignment_boosts_confidence() {
        let weights = SourceWeights::uniform();
        let readings: Vec<SourceReading> = SentimentSource::ALL
            .iter()
            .map(|s| reading(*s, 0.8, 0.7))
            .collect();
        let agg = combine_readings("BTC", readings, &weights, MarketContext::default());
        assert!(agg.trading_signal.confidence > agg.overall_confidence);
        assert!(agg.trading_signal.confidence <= 0.95);
        assert!(agg.trading_signal.reason.contains("order book aligned"));
    }

    #[test]
    fn bearish_needs_downtrend_to_sell() {
        let weights = SourceWeights::uniform();
        let readings: Vec<SourceReading> = SentimentSource::ALL
            .iter()
            .map(|s| reading(*s, -0.5, 0.8))
            .collect();

        let flat = combine_readings("BTC", readings.clone(), &weights, MarketContext::default());
        assert_eq!(flat.category, SentimentCategory::Bearish);
        assert_eq!(flat.trading_signal.action, SignalAction::Hold);

        let downtrend = MarketContext {
            trend: Trend::Down,
            ..Default::default()
        };
        let down = combine_readings("BTC", readings, &weights, downtrend);
        assert_eq!(down.trading_signal.action, SignalAction::Sell);
    }

    #[test]
    fn extreme_bullish_under_extreme_volatility_downgrades() {
        let weights = SourceWeights::uniform();
        // No order-book reading: the volatility downgrade must survive
        // without an alignment adjustment on top.
        let readings = vec![
            reading(SentimentSource::News, 0.9, 0.9),
            reading(SentimentSource::Microblog, 0.9, 0.9),
            reading(SentimentSource::Forum, 0.9, 0.9),
            reading(SentimentSource::OnChain, 0.9, 0.9),
        ];
        let ctx = MarketContext {
            volatility: Level::Extreme,
            ..Default::default()
        };
        let agg = combine_readings("BTC", readings, &weights, ctx);
        assert_eq!(agg.category, SentimentCategory::ExtremeBullish);
        assert_eq!(agg.trading_signal.action, SignalAction::Buy);
        assert_eq!(agg.trading_signal.risk_level, RiskLevel::High);
    }
}
