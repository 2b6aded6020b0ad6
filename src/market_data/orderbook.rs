// =============================================================================
// Order-Book Analyzer — per-symbol depth snapshots and derived intelligence
// =============================================================================
//
// The depth transport task is the single writer per symbol: every upstream
// update (full snapshot or delta) rebuilds the derived snapshot and publishes
// it with an atomic `Arc` swap, so readers always observe a consistent
// point-in-time copy and never a half-applied update.
//
// Intelligence derived from a snapshot older than the staleness window reports
// `confidence_score = 0` while remaining readable.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Derived types
// ---------------------------------------------------------------------------

/// Which side of the book carries a wall of large resting orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WallPressure {
    Buy,
    Sell,
    None,
}

/// Directional entry recommendation derived from book structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySignal {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

impl EntrySignal {
    /// Project the signal onto the sentiment score space [-1, 1].
    pub fn to_score(self) -> f64 {
        match self {
            Self::StrongBuy => 0.8,
            Self::Buy => 0.4,
            Self::Neutral => 0.0,
            Self::Sell => -0.4,
            Self::StrongSell => -0.8,
        }
    }
}

impl std::fmt::Display for EntrySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "STRONG_BUY"),
            Self::Buy => write!(f, "BUY"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Sell => write!(f, "SELL"),
            Self::StrongSell => write!(f, "STRONG_SELL"),
        }
    }
}

/// Suggested holding horizon for a book-driven entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Timeframe {
    Scalp,
    Short,
    Medium,
}

/// Consistent point-in-time copy of one symbol's depth.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    /// (price, size), best bid first (descending price).
    pub bids: Vec<(f64, f64)>,
    /// (price, size), best ask first (ascending price).
    pub asks: Vec<(f64, f64)>,
    pub spread: f64,
    /// (Σ bid size − Σ ask size) / (Σ bid size + Σ ask size), in [-1, 1].
    pub depth_imbalance: f64,
    pub large_bid_count: usize,
    pub large_ask_count: usize,
    pub wall_pressure: WallPressure,
}

/// Metrics derived from one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookIntelligence {
    pub symbol: String,
    pub liquidity_score: f64,
    /// [-100, 100]
    pub market_pressure: f64,
    /// [-100, 100]
    pub institutional_flow: f64,
    /// [0, 100]
    pub whale_activity: f64,
    pub entry_signal: EntrySignal,
    /// [0, 100]; zero when the underlying snapshot is stale.
    pub confidence_score: f64,
    pub timeframe: Timeframe,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub position_size_pct: f64,
    pub is_stale: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Reference depth used to normalise total book depth into a [0, 1] bonus.
const DEPTH_REF: f64 = 100.0;
/// Top-of-book concentration above this marks urgent institutional flow.
const URGENCY_THRESHOLD: f64 = 0.6;

/// Raw per-symbol levels keyed by the upstream price string, so deltas can
/// update or remove exact levels without float-equality comparisons.
#[derive(Debug, Default)]
struct DepthLevels {
    bids: HashMap<String, (f64, f64)>,
    asks: HashMap<String, (f64, f64)>,
}

/// Maintains depth state for multiple symbols. The transport task is the only
/// writer; readers obtain immutable `Arc` snapshots.
pub struct OrderBookManager {
    levels: RwLock<HashMap<String, DepthLevels>>,
    snapshots: RwLock<HashMap<String, Arc<OrderBookSnapshot>>>,
    large_order_threshold: f64,
    staleness: Duration,
}

impl OrderBookManager {
    pub fn new(large_order_threshold: f64, staleness: Duration) -> Self {
        Self {
            levels: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            large_order_threshold,
            staleness,
        }
    }

    /// Replace the full book for `symbol` and publish a fresh snapshot.
    pub fn apply_snapshot(&self, symbol: &str, bids: &[(String, f64, f64)], asks: &[(String, f64, f64)]) {
        {
            let mut all = self.levels.write();
            let levels = all.entry(symbol.to_string()).or_default();
            levels.bids.clear();
            levels.asks.clear();
            for (key, price, size) in bids {
                if *size > 0.0 {
                    levels.bids.insert(key.clone(), (*price, *size));
                }
            }
            for (key, price, size) in asks {
                if *size > 0.0 {
                    levels.asks.insert(key.clone(), (*price, *size));
                }
            }
        }
        self.publish(symbol);
    }

    /// Apply a delta (size 0 removes the level) and publish a fresh snapshot.
    pub fn apply_delta(&self, symbol: &str, bids: &[(String, f64, f64)], asks: &[(String, f64, f64)]) {
        {
            let mut all = self.levels.write();
            let levels = all.entry(symbol.to_string()).or_default();
            for (key, price, size) in bids {
                if *size > 0.0 {
                    levels.bids.insert(key.clone(), (*price, *size));
                } else {
                    levels.bids.remove(key);
                }
            }
            for (key, price, size) in asks {
                if *size > 0.0 {
                    levels.asks.insert(key.clone(), (*price, *size));
                } else {
                    levels.asks.remove(key);
                }
            }
        }
        self.publish(symbol);
    }

    /// Rebuild the derived snapshot from the raw levels and swap it in.
    fn publish(&self, symbol: &str) {
        let snapshot = {
            let all = self.levels.read();
            let Some(levels) = all.get(symbol) else {
                return;
            };

            let mut bids: Vec<(f64, f64)> = levels.bids.values().copied().collect();
            let mut asks: Vec<(f64, f64)> = levels.asks.values().copied().collect();
            bids.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            asks.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

            let best_bid = bids.first().map(|l| l.0).unwrap_or(0.0);
            let best_ask = asks.first().map(|l| l.0).unwrap_or(0.0);
            let spread = if best_bid > 0.0 && best_ask > 0.0 {
                best_ask - best_bid
            } else {
                0.0
            };

            let bid_depth: f64 = bids.iter().map(|l| l.1).sum();
            let ask_depth: f64 = asks.iter().map(|l| l.1).sum();
            let total_depth = bid_depth + ask_depth;
            let depth_imbalance = if total_depth > 0.0 {
                (bid_depth - ask_depth) / total_depth
            } else {
                0.0
            };

            let large_bid_count = bids.iter().filter(|l| l.1 > self.large_order_threshold).count();
            let large_ask_count = asks.iter().filter(|l| l.1 > self.large_order_threshold).count();

            let wall_pressure = if large_bid_count > 0 && large_bid_count >= 3 * large_ask_count {
                WallPressure::Buy
            } else if large_ask_count > 0 && large_ask_count >= 3 * large_bid_count {
                WallPressure::Sell
            } else {
                WallPressure::None
            };

            Arc::new(OrderBookSnapshot {
                symbol: symbol.to_string(),
                ts: Utc::now(),
                bids,
                asks,
                spread,
                depth_imbalance,
                large_bid_count,
                large_ask_count,
                wall_pressure,
            })
        };

        self.snapshots.write().insert(symbol.to_string(), snapshot);
    }

    /// Current snapshot for `symbol`, if any update has arrived.
    pub fn snapshot(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.snapshots.read().get(symbol).cloned()
    }

    /// Derive intelligence from the current snapshot.
    ///
    /// A stale snapshot (older than the staleness window, e.g. while the
    /// transport reconnects) still yields metrics but with
    /// `confidence_score = 0`.
    pub fn intelligence(&self, symbol: &str) -> Option<OrderBookIntelligence> {
        let snap = self.snapshot(symbol)?;
        let is_stale = Utc::now()
            .signed_duration_since(snap.ts)
            .to_std()
            .map(|age| age > self.staleness)
            .unwrap_or(false);

        Some(derive_intelligence(&snap, self.large_order_threshold, is_stale))
    }
}

/// Compute all derived metrics from one snapshot.
fn derive_intelligence(
    snap: &OrderBookSnapshot,
    large_order_threshold: f64,
    is_stale: bool,
) -> OrderBookIntelligence {
    let bid_depth: f64 = snap.bids.iter().map(|l| l.1).sum();
    let ask_depth: f64 = snap.asks.iter().map(|l| l.1).sum();
    let total_depth = bid_depth + ask_depth;

    let mid = match (snap.bids.first(), snap.asks.first()) {
        (Some(b), Some(a)) => (b.0 + a.0) / 2.0,
        _ => 0.0,
    };
    let spread_bps = if mid > 0.0 {
        snap.spread / mid * 10_000.0
    } else {
        0.0
    };

    // --- Liquidity: depth bonus + tight-spread bonus - impact penalty --------
    let depth_bonus = (total_depth / DEPTH_REF).min(1.0);
    let spread_bonus = (10.0 - spread_bps).clamp(0.0, 10.0);
    let impact_penalty = (spread_bps * 2.0).min(20.0);
    let liquidity_score = (50.0 + 30.0 * depth_bonus + spread_bonus - impact_penalty).clamp(0.0, 100.0);

    // --- Market pressure ------------------------------------------------------
    let wall_bias = match snap.wall_pressure {
        WallPressure::Buy => 1.0,
        WallPressure::Sell => -1.0,
        WallPressure::None => 0.0,
    };
    let market_pressure = (50.0 * snap.depth_imbalance
        + 25.0 * wall_bias
        + 5.0 * (snap.large_bid_count as f64 - snap.large_ask_count as f64))
        .clamp(-100.0, 100.0);

    // --- Institutional flow ---------------------------------------------------
    let large_bid_depth: f64 = snap
        .bids
        .iter()
        .filter(|l| l.1 > large_order_threshold)
        .map(|l| l.1)
        .sum();
    let large_ask_depth: f64 = snap
        .asks
        .iter()
        .filter(|l| l.1 > large_order_threshold)
        .map(|l| l.1)
        .sum();
    let large_total = large_bid_depth + large_ask_depth;
    let mut institutional_flow = if large_total > 0.0 {
        (large_bid_depth - large_ask_depth) / large_total * 100.0
    } else {
        0.0
    };

    // Urgency: how concentrated the book is at the top three levels.
    let top_depth: f64 = snap.bids.iter().take(3).map(|l| l.1).sum::<f64>()
        + snap.asks.iter().take(3).map(|l| l.1).sum::<f64>();
    let urgency = if total_depth > 0.0 {
        top_depth / total_depth
    } else {
        0.0
    };
    if urgency >= URGENCY_THRESHOLD {
        institutional_flow = (institutional_flow * 1.3).clamp(-100.0, 100.0);
    }

    // --- Whale activity -------------------------------------------------------
    let whale_activity =
        ((snap.large_bid_count + snap.large_ask_count) as f64 * 12.5).clamp(0.0, 100.0);

    // --- Entry signal from combined pressure buckets --------------------------
    let combined = (market_pressure + institutional_flow) / 2.0;
    let entry_signal = if combined >= 50.0 {
        EntrySignal::StrongBuy
    } else if combined >= 20.0 {
        EntrySignal::Buy
    } else if combined <= -50.0 {
        EntrySignal::StrongSell
    } else if combined <= -20.0 {
        EntrySignal::Sell
    } else {
        EntrySignal::Neutral
    };

    // --- Confidence from structural strength ----------------------------------
    let confidence_score = if is_stale {
        0.0
    } else {
        (combined.abs() * 0.6 + liquidity_score * 0.4).clamp(0.0, 100.0)
    };

    // --- Horizon and exit bounds ----------------------------------------------
    let timeframe = if liquidity_score >= 70.0 && spread_bps < 5.0 {
        Timeframe::Scalp
    } else if liquidity_score >= 40.0 {
        Timeframe::Short
    } else {
        Timeframe::Medium
    };

    let (stop_loss_pct, take_profit_pct, position_size_pct) = match timeframe {
        Timeframe::Scalp => (0.005, 0.01, 0.10),
        Timeframe::Short => (0.01, 0.02, 0.07),
        Timeframe::Medium => (0.02, 0.04, 0.05),
    };

    OrderBookIntelligence {
        symbol: snap.symbol.clone(),
        liquidity_score,
        market_pressure,
        institutional_flow,
        whale_activity,
        entry_signal,
        confidence_score,
        timeframe,
        stop_loss_pct,
        take_profit_pct,
        position_size_pct,
        is_stale,
    }
}

// ---------------------------------------------------------------------------
// Depth WebSocket transport
// ---------------------------------------------------------------------------

/// Connect to the depth WebSocket for one symbol and feed updates into
/// `manager` until the stream ends, an error occurs, or shutdown is signalled.
///
/// Updates may be full snapshots (`bids`/`asks` keys) or deltas (`b`/`a`
/// keys); both shapes are handled.
pub async fn run_depth_stream(
    symbol: &str,
    ws_url: &str,
    manager: &Arc<OrderBookManager>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let url = format!("{}?symbol={}&levels=20", ws_url, symbol.to_lowercase());
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    if let Err(e) = handle_depth_message(symbol, &text, manager) {
                        warn!(symbol = %symbol, error = %e, "failed to parse depth message");
                    }
                }
                Some(Ok(_)) => {} // ping/pong/binary — ignored
                Some(Err(e)) => {
                    warn!(symbol = %symbol, error = %e, "depth WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol = %symbol, "depth WebSocket stream ended");
                    return Ok(());
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(symbol = %symbol, "depth stream shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Reconnect wrapper: run the depth stream with exponential backoff between
/// attempts until shutdown. During a gap the last snapshot remains readable
/// (its staleness flag drives `confidence_score = 0`).
pub async fn run_depth_stream_forever(
    symbol: String,
    ws_url: String,
    manager: Arc<OrderBookManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_depth_stream(&symbol, &ws_url, &manager, &mut shutdown).await {
            Ok(()) => {
                if *shutdown.borrow() {
                    break;
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!(symbol = %symbol, error = %e, failures, "depth stream error");
            }
        }
        let delay = Duration::from_secs(2u64.saturating_pow(failures.min(5)));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(symbol = %symbol, "depth stream loop stopped");
}

/// Parse one depth message and apply it.
fn handle_depth_message(symbol: &str, text: &str, manager: &Arc<OrderBookManager>) -> Result<()> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    // Full snapshot shape: {"bids": [[p, s], ...], "asks": [[p, s], ...]}
    if root.get("bids").is_some() || root.get("asks").is_some() {
        let bids = parse_levels(root.get("bids"))?;
        let asks = parse_levels(root.get("asks"))?;
        manager.apply_snapshot(symbol, &bids, &asks);
        return Ok(());
    }

    // Delta shape: {"b": [[p, s], ...], "a": [[p, s], ...]}
    if root.get("b").is_some() || root.get("a").is_some() {
        let bids = parse_levels(root.get("b"))?;
        let asks = parse_levels(root.get("a"))?;
        manager.apply_delta(symbol, &bids, &asks);
        return Ok(());
    }

    anyhow::bail!("depth message has neither snapshot nor delta shape")
}

/// Parse an array of `[price, size]` pairs; both strings and numbers accepted.
fn parse_levels(value: Option<&serde_json::Value>) -> Result<Vec<(String, f64, f64)>> {
    let Some(arr) = value.and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };

    let mut levels = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry.as_array().context("depth level is not an array")?;
        if pair.len() < 2 {
            continue;
        }
        let (key, price) = parse_price(&pair[0])?;
        let (_, size) = parse_price(&pair[1])?;
        levels.push((key, price, size));
    }
    Ok(levels)
}

/// Parse a JSON value that may be either a string or a number into `f64`,
/// keeping the canonical string form as the level key.
fn parse_price(val: &serde_json::Value) -> Result<(String, f64)> {
    if let Some(s) = val.as_str() {
        let parsed = s
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))?;
        Ok((s.to_string(), parsed))
    } else if let Some(n) = val.as_f64() {
        Ok((n.to_string(), n))
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn levels(raw: &[(f64, f64)]) -> Vec<(String, f64, f64)> {
        raw.iter().map(|(p, s)| (p.to_string(), *p, *s)).collect()
    }

    fn manager() -> OrderBookManager {
        OrderBookManager::new(10.0, Duration::from_secs(5))
    }

    #[test]
    fn snapshot_orders_and_spread() {
        let m = manager();
        m.apply_snapshot(
            "BTC",
            &levels(&[(99.0, 1.0), (100.0, 2.0), (98.0, 3.0)]),
            &levels(&[(102.0, 1.0), (101.0, 2.0), (103.0, 3.0)]),
        );
        let snap = m.snapshot("BTC").unwrap();
        assert_eq!(snap.bids[0].0, 100.0); // best bid first
        assert_eq!(snap.asks[0].0, 101.0); // best ask first
        assert!((snap.spread - 1.0).abs() < 1e-10);
    }

    #[test]
    fn depth_imbalance_bounds() {
        let m = manager();
        m.apply_snapshot("BTC", &levels(&[(100.0, 30.0)]), &levels(&[(101.0, 10.0)]));
        let snap = m.snapshot("BTC").unwrap();
        assert!((snap.depth_imbalance - 0.5).abs() < 1e-10);
        assert!((-1.0..=1.0).contains(&snap.depth_imbalance));
    }

    #[test]
    fn delta_updates_and_removes_levels() {
        let m = manager();
        m.apply_snapshot(
            "BTC",
            &levels(&[(100.0, 2.0), (99.0, 1.0)]),
            &levels(&[(101.0, 2.0)]),
        );
        // Remove the best bid, grow the ask.
        m.apply_delta("BTC", &levels(&[(100.0, 0.0)]), &levels(&[(101.0, 5.0)]));
        let snap = m.snapshot("BTC").unwrap();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].0, 99.0);
        assert_eq!(snap.asks[0].1, 5.0);
    }

    #[test]
    fn wall_pressure_requires_three_to_one() {
        let m = manager();
        // Three large bids, one large ask: 3 >= 3*1 -> BUY wall.
        m.apply_snapshot(
            "BTC",
            &levels(&[(100.0, 20.0), (99.0, 15.0), (98.0, 25.0)]),
            &levels(&[(101.0, 30.0), (102.0, 2.0)]),
        );
        let snap = m.snapshot("BTC").unwrap();
        assert_eq!(snap.large_bid_count, 3);
        assert_eq!(snap.large_ask_count, 1);
        assert_eq!(snap.wall_pressure, WallPressure::Buy);

        // Balanced large orders: no wall.
        m.apply_snapshot(
            "ETH",
            &levels(&[(100.0, 20.0)]),
            &levels(&[(101.0, 20.0)]),
        );
        assert_eq!(m.snapshot("ETH").unwrap().wall_pressure, WallPressure::None);
    }

    #[test]
    fn intelligence_ranges() {
        let m = manager();
        m.apply_snapshot(
            "BTC",
            &levels(&[(100.0, 40.0), (99.5, 30.0), (99.0, 20.0)]),
            &levels(&[(100.1, 5.0), (100.5, 3.0)]),
        );
        let intel = m.intelligence("BTC").unwrap();
        assert!((0.0..=100.0).contains(&intel.liquidity_score));
        assert!((-100.0..=100.0).contains(&intel.market_pressure));
        assert!((-100.0..=100.0).contains(&intel.institutional_flow));
        assert!((0.0..=100.0).contains(&intel.whale_activity));
        assert!((0.0..=100.0).contains(&intel.confidence_score));
        // Heavy bid book should lean bullish.
        assert!(intel.market_pressure > 0.0);
        assert!(!intel.is_stale);
    }

    #[test]
    fn stale_snapshot_zeroes_confidence() {
        let m = OrderBookManager::new(10.0, Duration::from_millis(0));
        m.apply_snapshot("BTC", &levels(&[(100.0, 50.0)]), &levels(&[(101.0, 1.0)]));
        // Staleness window of zero: anything already published is stale.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let intel = m.intelligence("BTC").unwrap();
        assert!(intel.is_stale);
        assert_eq!(intel.confidence_score, 0.0);
    }

    #[test]
    fn full_snapshot_and_delta_messages_parse() {
        let m = Arc::new(manager());
        handle_depth_message(
            "BTC",
            r#"{"bids": [["100.0", "2.0"], ["99.0", "1.0"]], "asks": [["101.0", "1.5"]]}"#,
            &m,
        )
        .unwrap();
        assert_eq!(m.snapshot("BTC").unwrap().bids.len(), 2);

        handle_depth_message("BTC", r#"{"b": [["99.0", "0"]], "a": []}"#, &m).unwrap();
        assert_eq!(m.snapshot("BTC").unwrap().bids.len(), 1);

        assert!(handle_depth_message("BTC", r#"{"x": 1}"#, &m).is_err());
    }

    #[test]
    fn entry_signal_score_projection() {
        assert_eq!(EntrySignal::StrongBuy.to_score(), 0.8);
        assert_eq!(EntrySignal::Sell.to_score(), -0.4);
        assert_eq!(EntrySignal::Neutral.to_score(), 0.0);
    }
}
