// =============================================================================
// Quasar Paper Nexus — Main Entry Point
// =============================================================================
//
// Startup: configuration, persistence store, broker session, strategy
// registration, then one long-lived task per component (feed, order-book
// transport, execution engine, sentiment aggregator, fusion consumer, exit
// monitor, adaptive weights controller).
//
// Shutdown order: market-data feed stops first, the signal queue drains, the
// lifecycle manager finishes in-flight work within the drain window, state is
// persisted, transports disconnect.
//
// Exit codes: 0 clean shutdown; 1 fatal startup error (bad config, store
// unreachable); 2 fatal steady-state error after retries exhausted.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod config;
mod counters;
mod engine;
mod errors;
mod fusion;
mod indicators;
mod market_data;
mod persistence;
mod sentiment;
mod strategies;
mod trading;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::LogAlertSink;
use crate::config::Config;
use crate::counters::Counters;
use crate::engine::{ExecutionEngine, SignalQueue};
use crate::fusion::{FusionConfig, SignalFusion};
use crate::market_data::feed::HttpQuoteProvider;
use crate::market_data::{orderbook, MarketDataFeed, OrderBookManager};
use crate::persistence::PersistenceStore;
use crate::sentiment::fetchers::{
    Fetcher, ForumFetcher, MicroblogFetcher, NewsFetcher, OnChainFetcher, OrderBookFetcher,
};
use crate::sentiment::{
    AdaptiveWeightsController, KeywordScorer, SentimentAggregator, SentimentCache, WeightsHandle,
};
use crate::strategies::{StrategyInstance, StrategyParams, StrategyRegistry};
use crate::trading::broker::BrokerAdapter;
use crate::trading::{PaperBroker, TradeLifecycleManager};

/// Depth level size above which a resting order counts as large.
const LARGE_ORDER_THRESHOLD: f64 = 25.0;
/// Snapshot age beyond which order-book intelligence reports zero confidence.
const ORDER_BOOK_STALENESS: Duration = Duration::from_secs(5);
/// Session summary alert cadence.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Counters snapshot log cadence.
const COUNTERS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Quasar Paper Nexus — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    let counters = Arc::new(Counters::new());

    // ── 2. Persistence store ─────────────────────────────────────────────
    let store = match PersistenceStore::open(
        &config.store_path,
        &config.journal_path,
        Arc::clone(&counters),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "persistence store unreachable");
            return 1;
        }
    };

    let alerts: Arc<dyn alerts::AlertSink> = Arc::new(LogAlertSink);

    // ── 3. Strategy registry ─────────────────────────────────────────────
    let mut registry = StrategyRegistry::new();
    let default_strategies = [
        (
            "rsi-pullback-1",
            "RSI Pullback",
            StrategyParams::RsiPullback(Default::default()),
        ),
        (
            "quantum-oscillator-1",
            "Quantum Oscillator",
            StrategyParams::QuantumOscillator(Default::default()),
        ),
        (
            "neural-confidence-1",
            "Neural Confidence",
            StrategyParams::NeuralConfidence(Default::default()),
        ),
        (
            "bollinger-breakout-1",
            "Bollinger Breakout",
            StrategyParams::BollingerBreakout(Default::default()),
        ),
    ];
    for (id, name, params) in default_strategies {
        let instance = StrategyInstance::new(id, name, params, config.symbols.clone());
        if let Err(e) = registry.register(instance) {
            // Validation failures skip the offending entity; the engine runs on.
            warn!(strategy_id = id, error = %e, "strategy registration skipped");
        }
    }
    let registry = Arc::new(registry);

    // ── 4. Shared infrastructure ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();

    let orderbook_manager = config.enable_order_book.then(|| {
        Arc::new(OrderBookManager::new(
            LARGE_ORDER_THRESHOLD,
            ORDER_BOOK_STALENESS,
        ))
    });

    let scorer = Arc::new(KeywordScorer::new());
    let weights = Arc::new(WeightsHandle::default());
    let sentiment_cache = Arc::new(SentimentCache::new());
    let signal_queue = Arc::new(SignalQueue::new(
        config.signal_channel_capacity,
        Arc::clone(&counters),
    ));

    // ── 5. Broker + lifecycle manager ────────────────────────────────────
    let broker: Arc<dyn BrokerAdapter> = Arc::new(PaperBroker::new(
        config.broker_base_url.clone(),
        &config.broker_api_key,
    ));
    let lifecycle = Arc::new(TradeLifecycleManager::new(
        broker,
        Arc::clone(&store),
        Arc::clone(&alerts),
        Arc::clone(&counters),
        trading::lifecycle::LifecycleConfig {
            min_exec_confidence: config.min_exec_confidence,
            min_exit_confidence: config.min_exit_confidence,
            broker_retry_attempts: config.broker_retry_attempts,
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            max_hold: config.max_hold,
            position_notional: config.position_notional,
            default_starting_balance: config.default_starting_balance,
        },
    ));
    lifecycle.set_fatal_channel(fatal_tx);
    if let Err(e) = lifecycle.start_session().await {
        error!(error = %e, "failed to start trading session");
        return 1;
    }

    // ── 6. Market-data feed ──────────────────────────────────────────────
    let provider = Arc::new(HttpQuoteProvider::new(
        config.quote_base_url.clone(),
        config.source_timeout,
    ));
    let feed = Arc::new(MarketDataFeed::new(
        provider,
        config.feed_interval,
        Arc::clone(&counters),
    ));
    // Subscribe before the poll loops start so no tick is missed.
    let engine_ticks = feed.subscribe();
    let mut exit_ticks = feed.subscribe();
    feed.spawn_all(&config.symbols, shutdown_rx.clone());

    // ── 7. Order-book depth streams ──────────────────────────────────────
    if let Some(manager) = &orderbook_manager {
        for symbol in &config.symbols {
            tokio::spawn(orderbook::run_depth_stream_forever(
                symbol.clone(),
                config.depth_ws_url.clone(),
                Arc::clone(manager),
                shutdown_rx.clone(),
            ));
        }
        info!(count = config.symbols.len(), "order-book depth streams launched");
    } else {
        info!("order-book analyzer disabled");
    }

    // ── 8. Sentiment aggregator ──────────────────────────────────────────
    let mut fetchers = vec![
        Fetcher::Microblog(MicroblogFetcher::new(
            config.sources_base_url.clone(),
            Arc::clone(&scorer),
            config.source_timeout,
        )),
        Fetcher::Forum(ForumFetcher::new(
            config.sources_base_url.clone(),
            Arc::clone(&scorer),
            config.source_timeout,
        )),
        Fetcher::News(NewsFetcher::new(
            config.sources_base_url.clone(),
            Arc::clone(&scorer),
            config.source_timeout,
        )),
        Fetcher::OnChain(OnChainFetcher::new(
            config.sources_base_url.clone(),
            Arc::clone(&scorer),
            config.source_timeout,
        )),
    ];
    if let Some(manager) = &orderbook_manager {
        fetchers.push(Fetcher::OrderBook(OrderBookFetcher::new(Arc::clone(
            manager,
        ))));
    }
    let aggregator = SentimentAggregator::new(
        fetchers,
        Arc::clone(&weights),
        Arc::clone(&sentiment_cache),
        orderbook_manager.clone(),
        Arc::clone(&alerts),
        config.source_timeout,
        Arc::clone(&counters),
    );
    tokio::spawn(aggregator.run(
        config.symbols.clone(),
        config.feed_interval,
        shutdown_rx.clone(),
    ));

    // ── 9. Strategy execution engine ─────────────────────────────────────
    let execution_engine = ExecutionEngine::new(
        Arc::clone(&registry),
        Arc::clone(&signal_queue),
        Arc::clone(&counters),
    );
    tokio::spawn(execution_engine.run(engine_ticks, shutdown_rx.clone()));

    // ── 10. Fusion consumer ──────────────────────────────────────────────
    let fusion = SignalFusion::new(
        Arc::clone(&sentiment_cache),
        FusionConfig {
            sentiment_staleness: config.sentiment_staleness,
            min_sentiment_confidence: config.min_sentiment_confidence,
            conflict_threshold: config.sentiment_conflict_threshold,
            max_sentiment_boost: config.max_sentiment_boost,
        },
    );
    let consumer_queue = Arc::clone(&signal_queue);
    let consumer_lifecycle = Arc::clone(&lifecycle);
    let consumer = tokio::spawn(async move {
        while let Some(signal) = consumer_queue.pop().await {
            let fused = fusion.fuse(signal);
            consumer_lifecycle.handle_signal(fused).await;
        }
        info!("signal consumer drained");
    });

    // ── 11. Exit monitor ─────────────────────────────────────────────────
    let exit_lifecycle = Arc::clone(&lifecycle);
    let mut exit_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = exit_ticks.recv() => match received {
                    Ok(tick) => exit_lifecycle.on_tick(&tick).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "exit monitor lagged behind the tick stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = exit_shutdown.changed() => {
                    if *exit_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // ── 12. Adaptive weights controller ──────────────────────────────────
    let controller = AdaptiveWeightsController::new(
        Arc::clone(&lifecycle),
        Arc::clone(&weights),
        config.weights_update_interval,
    );
    tokio::spawn(controller.run(shutdown_rx.clone()));

    // ── 13. Session summary + counters heartbeat ─────────────────────────
    let summary_lifecycle = Arc::clone(&lifecycle);
    let mut summary_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => summary_lifecycle.emit_session_summary(),
                _ = summary_shutdown.changed() => {
                    if *summary_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let heartbeat_counters = Arc::clone(&counters);
    let mut heartbeat_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(COUNTERS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = heartbeat_counters.snapshot();
                    info!(
                        ticks = snap.ticks_produced,
                        signals = snap.signals_published,
                        dropped = snap.signals_dropped,
                        fetch_failures = snap.fetch_failures,
                        broker_retries = snap.broker_retries,
                        "engine heartbeat"
                    );
                }
                _ = heartbeat_shutdown.changed() => {
                    if *heartbeat_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 14. Wait for shutdown or a fatal error ───────────────────────────
    let fatal_reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        reason = fatal_rx.recv() => Some(reason.unwrap_or_else(|| "fatal channel closed".to_string())),
    };

    if let Some(reason) = &fatal_reason {
        error!(reason = %reason, "fatal steady-state error — shutting down");
    } else {
        warn!("Shutdown signal received — stopping gracefully");
    }

    // Stop the feed (and every other loop) first, then drain the signal
    // queue through the consumer within the drain window.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.drain_timeout, consumer)
        .await
        .is_err()
    {
        warn!(
            timeout_s = config.drain_timeout.as_secs(),
            "signal consumer did not drain in time"
        );
    }

    lifecycle.emit_session_summary();

    let snap = counters.snapshot();
    info!(
        ticks = snap.ticks_produced,
        signals = snap.signals_published,
        dropped = snap.signals_dropped,
        recovered_errors = snap.recovered_errors,
        "final counters"
    );
    info!("Quasar Paper Nexus shut down complete.");

    if fatal_reason.is_some() {
        2
    } else {
        0
    }
}
