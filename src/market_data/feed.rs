// =============================================================================
// Market-Data Feed — polling quote producer with tick broadcast
// =============================================================================
//
// One producer task per symbol pulls a last-price quote from the configured
// exchange adapter at a fixed cadence and broadcasts the resulting tick.
// Every subscriber sees every tick exactly once, in arrival order.
//
// Upstream failure: exponential backoff with jitter, bounded at 60 s. The
// last known price is retained for observability but never re-emitted as a
// tick — the feed does not synthesize prices.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::counters::{bump, Counters};
use crate::types::Tick;

/// Maximum backoff between failed quote pulls.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A last-price quote from the upstream exchange adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct Quote {
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
    pub ts: DateTime<Utc>,
}

/// Pluggable exchange adapter contract.
pub trait QuoteProvider: Send + Sync {
    fn get_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Quote>>;
}

/// HTTP implementation of [`QuoteProvider`] against a plain-JSON quote
/// endpoint (`GET {base}/v1/quote?symbol=...`).
pub struct HttpQuoteProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl QuoteProvider for HttpQuoteProvider {
    fn get_quote<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Quote>> {
        async move {
            let url = format!("{}/v1/quote?symbol={}", self.base_url, symbol);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("quote request failed")?;

            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("quote endpoint returned {status}");
            }

            let quote: Quote = resp.json().await.context("failed to parse quote JSON")?;
            if !(quote.price.is_finite() && quote.price > 0.0) {
                anyhow::bail!("quote price is not a positive finite number");
            }
            Ok(quote)
        }
        .boxed()
    }
}

// =============================================================================
// Feed
// =============================================================================

/// The market-data feed: owns the tick broadcast and the per-symbol poll loops.
pub struct MarketDataFeed {
    provider: Arc<dyn QuoteProvider>,
    tick_tx: broadcast::Sender<Tick>,
    interval: Duration,
    counters: Arc<Counters>,
    last_price: parking_lot::RwLock<std::collections::HashMap<String, f64>>,
}

impl MarketDataFeed {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        interval: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        // Broadcast capacity sized generously; a lagging subscriber is a bug
        // surfaced by the broadcast error, not silently absorbed.
        let (tick_tx, _) = broadcast::channel(4096);
        Self {
            provider,
            tick_tx,
            interval,
            counters,
            last_price: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Subscribe to the tick stream. Every subscriber sees every tick in
    /// arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tick_tx.subscribe()
    }

    /// Last price successfully pulled for `symbol`, if any.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_price.read().get(symbol).copied()
    }

    /// Spawn one poll loop per symbol. Loops exit when `shutdown` flips true.
    pub fn spawn_all(
        self: &Arc<Self>,
        symbols: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        symbols
            .iter()
            .map(|symbol| {
                let feed = Arc::clone(self);
                let symbol = symbol.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { feed.run_symbol(symbol, shutdown).await })
            })
            .collect()
    }

    /// Poll loop for a single symbol.
    async fn run_symbol(&self, symbol: String, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %symbol, interval_ms = self.interval.as_millis() as u64, "feed loop started");

        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.provider.get_quote(&symbol).await {
                Ok(quote) => {
                    if consecutive_failures > 0 {
                        info!(symbol = %symbol, after_failures = consecutive_failures, "feed recovered");
                    }
                    consecutive_failures = 0;
                    self.counters
                        .feed_consecutive_failures
                        .store(0, std::sync::atomic::Ordering::Relaxed);

                    let tick = Tick {
                        symbol: symbol.clone(),
                        ts: quote.ts,
                        price: quote.price,
                        volume: quote.volume,
                    };
                    self.last_price.write().insert(symbol.clone(), quote.price);
                    bump(&self.counters.ticks_produced);

                    // Send fails only when there are no subscribers yet.
                    if self.tick_tx.send(tick).is_err() {
                        debug!(symbol = %symbol, "no tick subscribers");
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    bump(&self.counters.feed_consecutive_failures);
                    bump(&self.counters.recovered_errors);
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        consecutive_failures,
                        "quote pull failed"
                    );
                }
            }

            let delay = if consecutive_failures == 0 {
                self.interval
            } else {
                backoff_with_jitter(self.interval, consecutive_failures)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(symbol = %symbol, "feed loop stopped");
    }
}

/// Exponential backoff with jitter, bounded at [`MAX_BACKOFF`].
fn backoff_with_jitter(base: Duration, failures: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(failures.min(6)));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    (capped + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted provider: yields quotes or errors from a queue.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<Quote>>>,
    }

    impl QuoteProvider for ScriptedProvider {
        fn get_quote<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, Result<Quote>> {
            async move {
                let mut script = self.script.lock();
                if script.is_empty() {
                    anyhow::bail!("script exhausted")
                } else {
                    script.remove(0)
                }
            }
            .boxed()
        }
    }

    fn quote(price: f64) -> Quote {
        Quote {
            price,
            volume: 2.0,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_tick_in_order() {
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![Ok(quote(100.0)), Ok(quote(101.0)), Ok(quote(102.0))]),
        });
        let feed = Arc::new(MarketDataFeed::new(
            provider,
            Duration::from_millis(1),
            Arc::new(Counters::new()),
        ));

        let mut rx_a = feed.subscribe();
        let mut rx_b = feed.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = feed.spawn_all(&["BTC".to_string()], shutdown_rx);

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in [100.0, 101.0, 102.0] {
                let tick = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .expect("tick timeout")
                    .expect("broadcast closed");
                assert_eq!(tick.price, expected);
                assert_eq!(tick.symbol, "BTC");
            }
        }

        shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn failures_do_not_emit_ticks() {
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Err(anyhow::anyhow!("timeout")),
                Ok(quote(99.5)),
            ]),
        });
        let counters = Arc::new(Counters::new());
        let feed = Arc::new(MarketDataFeed::new(
            provider,
            Duration::from_millis(1),
            Arc::clone(&counters),
        ));
        let mut rx = feed.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = feed.spawn_all(&["ETH".to_string()], shutdown_rx);

        // The first successful pull is the first tick; the failure produced
        // nothing.
        let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("tick timeout")
            .expect("broadcast closed");
        assert_eq!(tick.price, 99.5);
        assert!(counters.snapshot().recovered_errors >= 1);

        shutdown_tx.send(true).unwrap();
        for h in handles {
            let _ = h.await;
        }
    }

    #[test]
    fn backoff_is_bounded() {
        for failures in 0..20 {
            let d = backoff_with_jitter(Duration::from_secs(30), failures);
            assert!(d <= MAX_BACKOFF);
        }
    }
}
