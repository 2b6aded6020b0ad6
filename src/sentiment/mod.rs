// =============================================================================
// Sentiment Module
// =============================================================================
//
// Multi-source sentiment intelligence pipeline:
//   - Source fetchers (microblog, forum, news, on-chain, order-book) with
//     per-source deadlines and circuit breakers
//   - Keyword NLP scoring over short texts and structured on-chain metrics
//   - Fan-out/fan-in aggregation under adaptive per-source weights
//   - Adaptive weights controller fed by realized trade outcomes

pub mod aggregator;
pub mod fetchers;
pub mod nlp;
pub mod weights;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{CriticalEvent, RiskLevel, SentimentCategory, SignalAction};

pub use aggregator::SentimentAggregator;
pub use fetchers::Fetcher;
pub use nlp::KeywordScorer;
pub use weights::{AdaptiveWeightsController, SourceWeights, WeightsHandle};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// The sentiment data sources the aggregator fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentSource {
    Microblog,
    Forum,
    News,
    OnChain,
    OrderBook,
}

impl SentimentSource {
    pub const ALL: [SentimentSource; 5] = [
        Self::Microblog,
        Self::Forum,
        Self::News,
        Self::OnChain,
        Self::OrderBook,
    ];
}

impl std::fmt::Display for SentimentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microblog => write!(f, "microblog"),
            Self::Forum => write!(f, "forum"),
            Self::News => write!(f, "news"),
            Self::OnChain => write!(f, "on_chain"),
            Self::OrderBook => write!(f, "order_book"),
        }
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// Normalised output of one fetcher invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReading {
    pub source: SentimentSource,
    pub symbol: String,
    /// Directional sentiment in [-1, 1].
    pub score: f64,
    /// Reliability in [0, 1]; zero means "contributes no weight".
    pub confidence: f64,
    /// Source-specific activity measure (posts, engagement, transactions).
    pub volume: f64,
    pub produced_at: DateTime<Utc>,
    /// Source payload retained for critical-event extraction and audit.
    pub raw: serde_json::Value,
}

impl SourceReading {
    /// The neutral reading a failed fetch contributes for one cycle.
    pub fn neutral(source: SentimentSource, symbol: &str) -> Self {
        Self {
            source,
            symbol: symbol.to_string(),
            score: 0.0,
            confidence: 0.0,
            volume: 0.0,
            produced_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }
}

/// Actionable recommendation derived from one aggregation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub action: SignalAction,
    pub confidence: f64,
    pub reason: String,
    pub risk_level: RiskLevel,
}

/// The combined across-sources result for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSentiment {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    /// Weighted score in [-1, 1].
    pub overall_score: f64,
    /// Weighted confidence in [0, 1].
    pub overall_confidence: f64,
    pub category: SentimentCategory,
    pub per_source: HashMap<SentimentSource, SourceReading>,
    pub critical_events: Vec<CriticalEvent>,
    pub trading_signal: TradingSignal,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Latest aggregated sentiment per symbol, shared between the aggregator
/// (writer) and the fusion layer (reader).
pub struct SentimentCache {
    inner: RwLock<HashMap<String, AggregatedSentiment>>,
}

impl SentimentCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn publish(&self, sentiment: AggregatedSentiment) {
        self.inner
            .write()
            .insert(sentiment.symbol.clone(), sentiment);
    }

    /// Latest sentiment for `symbol` no older than `max_age`.
    pub fn latest(&self, symbol: &str, max_age: Duration) -> Option<AggregatedSentiment> {
        let map = self.inner.read();
        let sentiment = map.get(symbol)?;
        let age = Utc::now().signed_duration_since(sentiment.ts);
        if age.to_std().map(|a| a <= max_age).unwrap_or(true) {
            Some(sentiment.clone())
        } else {
            None
        }
    }
}

impl Default for SentimentCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentiment(symbol: &str, ts: DateTime<Utc>) -> AggregatedSentiment {
        AggregatedSentiment {
            symbol: symbol.to_string(),
            ts,
            overall_score: 0.2,
            overall_confidence: 0.6,
            category: SentimentCategory::Neutral,
            per_source: HashMap::new(),
            critical_events: Vec::new(),
            trading_signal: TradingSignal {
                action: SignalAction::Hold,
                confidence: 0.6,
                reason: "test".to_string(),
                risk_level: RiskLevel::Low,
            },
        }
    }

    #[test]
    fn cache_returns_fresh_and_drops_stale() {
        let cache = SentimentCache::new();
        cache.publish(sentiment("BTC", Utc::now()));
        assert!(cache.latest("BTC", Duration::from_secs(30)).is_some());
        assert!(cache.latest("ETH", Duration::from_secs(30)).is_none());

        cache.publish(sentiment("ETH", Utc::now() - chrono::Duration::seconds(120)));
        assert!(cache.latest("ETH", Duration::from_secs(30)).is_none());
    }

    #[test]
    fn neutral_reading_is_zeroed() {
        let r = SourceReading::neutral(SentimentSource::Forum, "BTC");
        assert_eq!(r.score, 0.0);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.volume, 0.0);
    }
}
