// =============================================================================
// Source Fetchers — one per sentiment source, uniform contract
// =============================================================================
//
// Contract: fetch(symbol, deadline) -> SourceReading | error. Each fetcher
// owns an independent failure counter and circuit breaker (open for 60 s
// after 5 consecutive failures, half-open probe once the window elapses).
// A failing fetcher never aborts the aggregation cycle: the aggregator
// substitutes a neutral reading for that source.
//
// Every source envelope is normalised here; nothing downstream ever sees a
// source-specific format.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::market_data::OrderBookManager;
use crate::sentiment::nlp::{KeywordScorer, OnChainMetrics};
use crate::sentiment::{SentimentSource, SourceReading};

/// Consecutive failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the breaker stays open before a half-open probe.
const BREAKER_OPEN_FOR: Duration = Duration::from_secs(60);

/// Items pulled from the microblog stream per cycle.
const MICROBLOG_MAX_ITEMS: usize = 50;
/// Forum posts retained after engagement ranking.
const FORUM_TOP_POSTS: usize = 50;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Independent circuit breaker, one per fetcher.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call may proceed. An open breaker allows one probe per
    /// open-interval once the interval has elapsed (half-open).
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(at) if at.elapsed() >= BREAKER_OPEN_FOR => {
                // Half-open: rearm the window so only one probe goes out.
                state.opened_at = Some(Instant::now());
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BREAKER_THRESHOLD {
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state
            .opened_at
            .map(|at| at.elapsed() < BREAKER_OPEN_FOR)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Fetchers
// ---------------------------------------------------------------------------

/// The uniform fetcher interface the aggregator drives. One variant per
/// source so dispatch stays static and the set is closed by construction.
pub enum Fetcher {
    Microblog(MicroblogFetcher),
    Forum(ForumFetcher),
    News(NewsFetcher),
    OnChain(OnChainFetcher),
    OrderBook(OrderBookFetcher),
}

impl Fetcher {
    pub fn source(&self) -> SentimentSource {
        match self {
            Self::Microblog(_) => SentimentSource::Microblog,
            Self::Forum(_) => SentimentSource::Forum,
            Self::News(_) => SentimentSource::News,
            Self::OnChain(_) => SentimentSource::OnChain,
            Self::OrderBook(_) => SentimentSource::OrderBook,
        }
    }

    fn breaker(&self) -> &CircuitBreaker {
        match self {
            Self::Microblog(f) => &f.breaker,
            Self::Forum(f) => &f.breaker,
            Self::News(f) => &f.breaker,
            Self::OnChain(f) => &f.breaker,
            Self::OrderBook(f) => &f.breaker,
        }
    }

    /// Fetch one reading, guarded by the source's circuit breaker and the
    /// per-source deadline.
    pub async fn fetch(&self, symbol: &str, deadline: Duration) -> Result<SourceReading, EngineError> {
        let breaker = self.breaker();
        if !breaker.allow() {
            return Err(EngineError::Transient(format!(
                "{} circuit breaker open",
                self.source()
            )));
        }

        let result = tokio::time::timeout(deadline, async {
            match self {
                Self::Microblog(f) => f.fetch(symbol, deadline).await,
                Self::Forum(f) => f.fetch(symbol, deadline).await,
                Self::News(f) => f.fetch(symbol, deadline).await,
                Self::OnChain(f) => f.fetch(symbol, deadline).await,
                Self::OrderBook(f) => f.fetch(symbol).await,
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::Transient(format!(
                "{} fetch exceeded {} ms deadline",
                self.source(),
                deadline.as_millis()
            )))
        });

        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                breaker.record_failure();
                warn!(
                    source = %self.source(),
                    symbol,
                    error = %e,
                    consecutive_failures = breaker.consecutive_failures(),
                    "source fetch failed"
                );
            }
        }

        result
    }
}

fn http_client(deadline: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(deadline)
        .build()
        .unwrap_or_default()
}

async fn get_json(
    client: &reqwest::Client,
    url: &str,
    source: SentimentSource,
) -> Result<serde_json::Value, EngineError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| EngineError::Transient(format!("{source} request failed: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(EngineError::Transient(format!(
            "{source} endpoint returned {status}"
        )));
    }

    resp.json()
        .await
        .map_err(|e| EngineError::Transient(format!("{source} returned malformed JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Microblog
// ---------------------------------------------------------------------------

/// Keyword-filtered cashtag stream, bounded per cycle.
pub struct MicroblogFetcher {
    client: reqwest::Client,
    base_url: String,
    scorer: Arc<KeywordScorer>,
    breaker: CircuitBreaker,
}

impl MicroblogFetcher {
    pub fn new(base_url: impl Into<String>, scorer: Arc<KeywordScorer>, deadline: Duration) -> Self {
        Self {
            client: http_client(deadline),
            base_url: base_url.into(),
            scorer,
            breaker: CircuitBreaker::new(),
        }
    }

    async fn fetch(&self, symbol: &str, _deadline: Duration) -> Result<SourceReading, EngineError> {
        let url = format!(
            "{}/microblog/posts?cashtag=%24{}&limit={}",
            self.base_url, symbol, MICROBLOG_MAX_ITEMS
        );
        let body = get_json(&self.client, &url, SentimentSource::Microblog).await?;

        let texts: Vec<String> = body["posts"]
            .as_array()
            .map(|posts| {
                posts
                    .iter()
                    .filter_map(|p| p["text"].as_str().map(str::to_string))
                    .take(MICROBLOG_MAX_ITEMS)
                    .collect()
            })
            .unwrap_or_default();

        Ok(score_texts_reading(
            &self.scorer,
            SentimentSource::Microblog,
            symbol,
            &texts,
            texts.len() as f64,
        ))
    }
}

// ---------------------------------------------------------------------------
// Forum
// ---------------------------------------------------------------------------

/// Forum threads ranked by engagement (upvotes + 2 * comments), top 50 kept.
pub struct ForumFetcher {
    client: reqwest::Client,
    base_url: String,
    scorer: Arc<KeywordScorer>,
    breaker: CircuitBreaker,
}

impl ForumFetcher {
    pub fn new(base_url: impl Into<String>, scorer: Arc<KeywordScorer>, deadline: Duration) -> Self {
        Self {
            client: http_client(deadline),
            base_url: base_url.into(),
            scorer,
            breaker: CircuitBreaker::new(),
        }
    }

    async fn fetch(&self, symbol: &str, _deadline: Duration) -> Result<SourceReading, EngineError> {
        let url = format!("{}/forum/threads?symbol={}", self.base_url, symbol);
        let body = get_json(&self.client, &url, SentimentSource::Forum).await?;

        let mut threads: Vec<(String, f64)> = body["threads"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        let title = t["title"].as_str()?.to_string();
                        let upvotes = t["upvotes"].as_f64().unwrap_or(0.0);
                        let comments = t["comments"].as_f64().unwrap_or(0.0);
                        Some((title, upvotes + 2.0 * comments))
                    })
                    .collect()
            })
            .unwrap_or_default();

        threads.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        threads.truncate(FORUM_TOP_POSTS);

        let engagement: f64 = threads.iter().map(|t| t.1).sum();
        let titles: Vec<String> = threads.into_iter().map(|t| t.0).collect();

        Ok(score_texts_reading(
            &self.scorer,
            SentimentSource::Forum,
            symbol,
            &titles,
            engagement,
        ))
    }
}

// ---------------------------------------------------------------------------
// News
// ---------------------------------------------------------------------------

/// Headline feed filtered by symbol keywords.
pub struct NewsFetcher {
    client: reqwest::Client,
    base_url: String,
    scorer: Arc<KeywordScorer>,
    breaker: CircuitBreaker,
}

impl NewsFetcher {
    pub fn new(base_url: impl Into<String>, scorer: Arc<KeywordScorer>, deadline: Duration) -> Self {
        Self {
            client: http_client(deadline),
            base_url: base_url.into(),
            scorer,
            breaker: CircuitBreaker::new(),
        }
    }

    async fn fetch(&self, symbol: &str, _deadline: Duration) -> Result<SourceReading, EngineError> {
        let url = format!("{}/news/headlines?symbol={}", self.base_url, symbol);
        let body = get_json(&self.client, &url, SentimentSource::News).await?;

        let keyword = symbol.to_lowercase();
        let titles: Vec<String> = body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i["title"].as_str())
                    .filter(|t| t.to_lowercase().contains(&keyword))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(score_texts_reading(
            &self.scorer,
            SentimentSource::News,
            symbol,
            &titles,
            titles.len() as f64,
        ))
    }
}

// ---------------------------------------------------------------------------
// On-chain
// ---------------------------------------------------------------------------

/// Scalar on-chain metric queries, scored by the NLP scorer's structured path.
pub struct OnChainFetcher {
    client: reqwest::Client,
    base_url: String,
    scorer: Arc<KeywordScorer>,
    breaker: CircuitBreaker,
}

impl OnChainFetcher {
    pub fn new(base_url: impl Into<String>, scorer: Arc<KeywordScorer>, deadline: Duration) -> Self {
        Self {
            client: http_client(deadline),
            base_url: base_url.into(),
            scorer,
            breaker: CircuitBreaker::new(),
        }
    }

    async fn fetch(&self, symbol: &str, _deadline: Duration) -> Result<SourceReading, EngineError> {
        let url = format!("{}/onchain/metrics?symbol={}", self.base_url, symbol);
        let body = get_json(&self.client, &url, SentimentSource::OnChain).await?;

        let metrics: OnChainMetrics = serde_json::from_value(body.clone())
            .map_err(|e| EngineError::Transient(format!("on-chain envelope malformed: {e}")))?;

        let scored = self.scorer.score_onchain(&metrics);

        Ok(SourceReading {
            source: SentimentSource::OnChain,
            symbol: symbol.to_string(),
            score: scored.score,
            confidence: scored.confidence,
            volume: metrics.tx_count,
            produced_at: Utc::now(),
            raw: body,
        })
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// Reads the latest order-book intelligence and projects it onto the common
/// score/confidence scale.
pub struct OrderBookFetcher {
    manager: Arc<OrderBookManager>,
    breaker: CircuitBreaker,
}

impl OrderBookFetcher {
    pub fn new(manager: Arc<OrderBookManager>) -> Self {
        Self {
            manager,
            breaker: CircuitBreaker::new(),
        }
    }

    async fn fetch(&self, symbol: &str) -> Result<SourceReading, EngineError> {
        let Some(intel) = self.manager.intelligence(symbol) else {
            return Err(EngineError::Stale {
                data_source: "order_book".to_string(),
                age_secs: 0,
            });
        };

        debug!(
            symbol,
            entry_signal = %intel.entry_signal,
            confidence_score = intel.confidence_score,
            "order-book intelligence read"
        );

        Ok(SourceReading {
            source: SentimentSource::OrderBook,
            symbol: symbol.to_string(),
            score: intel.entry_signal.to_score(),
            confidence: intel.confidence_score / 100.0,
            volume: intel.whale_activity,
            produced_at: Utc::now(),
            raw: json!({
                "entry_signal": intel.entry_signal.to_string(),
                "confidence_score": intel.confidence_score,
                "market_pressure": intel.market_pressure,
                "institutional_flow": intel.institutional_flow,
                "liquidity_score": intel.liquidity_score,
                "is_stale": intel.is_stale,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Shared normalisation
// ---------------------------------------------------------------------------

/// Fold a batch of scored texts into one reading. Per-text scores are
/// weighted by their own confidence so empty chatter dilutes nothing.
fn score_texts_reading(
    scorer: &KeywordScorer,
    source: SentimentSource,
    symbol: &str,
    texts: &[String],
    volume: f64,
) -> SourceReading {
    let scores = scorer.score_batch(texts.iter().map(String::as_str));

    let weight_sum: f64 = scores.iter().map(|s| s.confidence).sum();
    let (score, confidence) = if weight_sum > 0.0 {
        let score = scores
            .iter()
            .map(|s| s.score * s.confidence)
            .sum::<f64>()
            / weight_sum;
        let confidence = weight_sum / scores.len() as f64;
        (score.clamp(-1.0, 1.0), confidence.min(1.0))
    } else {
        (0.0, 0.0)
    };

    SourceReading {
        source,
        symbol: symbol.to_string(),
        score,
        confidence,
        volume,
        produced_at: Utc::now(),
        raw: json!({ "titles": texts }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.allow());
        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_success_resets() {
        let breaker = CircuitBreaker::new();
        for _ in 0..BREAKER_THRESHOLD {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
        assert!(breaker.allow());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn failures_below_threshold_keep_breaker_closed() {
        let breaker = CircuitBreaker::new();
        for _ in 0..BREAKER_THRESHOLD - 1 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());
        assert!(breaker.allow());
    }

    #[test]
    fn text_reading_normalisation() {
        let scorer = KeywordScorer::new();
        let texts = vec![
            "bullish rally breakout".to_string(),
            "just market chatter".to_string(),
        ];
        let reading =
            score_texts_reading(&scorer, SentimentSource::Microblog, "BTC", &texts, 2.0);
        assert!(reading.score > 0.0);
        assert!((-1.0..=1.0).contains(&reading.score));
        assert!((0.0..=1.0).contains(&reading.confidence));
        assert_eq!(reading.volume, 2.0);
        assert_eq!(reading.raw["titles"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_text_batch_is_neutral() {
        let scorer = KeywordScorer::new();
        let reading = score_texts_reading(&scorer, SentimentSource::News, "BTC", &[], 0.0);
        assert_eq!(reading.score, 0.0);
        assert_eq!(reading.confidence, 0.0);
    }

    #[tokio::test]
    async fn orderbook_fetcher_without_book_errors() {
        let manager = Arc::new(OrderBookManager::new(10.0, Duration::from_secs(5)));
        let fetcher = Fetcher::OrderBook(OrderBookFetcher::new(manager));
        let err = fetcher.fetch("BTC", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::Stale { .. }));
    }

    #[tokio::test]
    async fn orderbook_fetcher_projects_intelligence() {
        let manager = Arc::new(OrderBookManager::new(10.0, Duration::from_secs(5)));
        let levels: Vec<(String, f64, f64)> = vec![
            ("100.0".to_string(), 100.0, 60.0),
            ("99.5".to_string(), 99.5, 40.0),
        ];
        let asks: Vec<(String, f64, f64)> = vec![("100.1".to_string(), 100.1, 2.0)];
        manager.apply_snapshot("BTC", &levels, &asks);

        let fetcher = Fetcher::OrderBook(OrderBookFetcher::new(manager));
        let reading = fetcher.fetch("BTC", Duration::from_millis(100)).await.unwrap();
        assert_eq!(reading.source, SentimentSource::OrderBook);
        assert!(reading.score > 0.0); // heavily bid book
        assert!((0.0..=1.0).contains(&reading.confidence));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_fetch() {
        let manager = Arc::new(OrderBookManager::new(10.0, Duration::from_secs(5)));
        let fetcher = Fetcher::OrderBook(OrderBookFetcher::new(manager));
        // Five failed fetches (no book data) trip the breaker.
        for _ in 0..5 {
            let _ = fetcher.fetch("BTC", Duration::from_millis(50)).await;
        }
        let err = fetcher.fetch("BTC", Duration::from_millis(50)).await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker open"));
    }
}
