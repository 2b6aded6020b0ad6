// =============================================================================
// Engine Configuration — read once from the environment at startup
// =============================================================================
//
// Every tunable lives here. Values come from environment variables (after
// `dotenv` has been loaded); anything unset falls back to the documented
// default. A malformed value is a validation error and aborts startup with
// exit code 1 — the engine never runs on a half-parsed configuration.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::errors::EngineError;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
    ]
}

const DEFAULT_FEED_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SENTIMENT_STALENESS_MS: u64 = 30_000;
const DEFAULT_SIGNAL_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_BROKER_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_WEIGHTS_UPDATE_INTERVAL_S: u64 = 3600;
const DEFAULT_MIN_EXEC_CONFIDENCE: f64 = 0.6;
const DEFAULT_MIN_EXIT_CONFIDENCE: f64 = 0.6;
const DEFAULT_STOP_LOSS_PCT: f64 = 0.02;
const DEFAULT_TAKE_PROFIT_PCT: f64 = 0.04;
const DEFAULT_MIN_SENTIMENT_CONFIDENCE: f64 = 0.4;
const DEFAULT_SENTIMENT_CONFLICT_THRESHOLD: f64 = 0.3;
const DEFAULT_MAX_SENTIMENT_BOOST: f64 = 0.2;
const DEFAULT_DRAIN_TIMEOUT_S: u64 = 10;
const DEFAULT_POSITION_NOTIONAL: f64 = 500.0;
const DEFAULT_STARTING_BALANCE: f64 = 10_000.0;

/// Complete engine configuration, assembled once in `main` and shared by
/// reference with every component.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Symbols the engine watches and trades (base asset, e.g. "BTC").
    pub symbols: Vec<String>,

    // --- Cadences ------------------------------------------------------------
    /// Market-data poll cadence.
    pub feed_interval: Duration,
    /// Per-source fetcher deadline.
    pub source_timeout: Duration,
    /// Maximum sentiment age the fusion layer accepts.
    pub sentiment_staleness: Duration,
    /// Adaptive-weights recompute cadence.
    pub weights_update_interval: Duration,
    /// How long the lifecycle manager may finish in-flight work on shutdown.
    pub drain_timeout: Duration,

    // --- Channels ------------------------------------------------------------
    /// Capacity of the technical-signal channel (engine -> fusion).
    pub signal_channel_capacity: usize,

    // --- Execution gates -----------------------------------------------------
    /// Minimum fused confidence required to open a position.
    pub min_exec_confidence: f64,
    /// Minimum fused confidence an opposing signal needs to force an exit.
    pub min_exit_confidence: f64,
    /// Broker placeOrder retry attempts.
    pub broker_retry_attempts: u32,
    /// Notional value (quote currency) per opened position.
    pub position_notional: f64,
    /// Fallback starting balance when the broker account reports none.
    pub default_starting_balance: f64,

    // --- Exit bounds ---------------------------------------------------------
    /// Stop-loss as a fraction of entry price (0.02 = 2%).
    pub stop_loss_pct: f64,
    /// Take-profit as a fraction of entry price.
    pub take_profit_pct: f64,
    /// Optional maximum holding period; `None` disables the time-based exit.
    pub max_hold: Option<Duration>,

    // --- Fusion --------------------------------------------------------------
    /// Below this sentiment confidence the technical signal passes unchanged.
    pub min_sentiment_confidence: f64,
    /// Minimum |sentiment score| for a conflict to force SKIP.
    pub sentiment_conflict_threshold: f64,
    /// Cap on the multiplicative confidence boost from aligned sentiment.
    pub max_sentiment_boost: f64,

    // --- Feature toggles -----------------------------------------------------
    /// Toggles the order-book analyzer (and its sentiment source) entirely.
    pub enable_order_book: bool,

    // --- Endpoints -----------------------------------------------------------
    /// Base URL of the exchange quote endpoint.
    pub quote_base_url: String,
    /// WebSocket URL template for the order-book depth transport.
    pub depth_ws_url: String,
    /// Base URL of the paper-trading broker.
    pub broker_base_url: String,
    /// Broker API key (sent as a header; never logged).
    #[serde(skip_serializing)]
    pub broker_api_key: String,
    /// Base URL shared by the sentiment source APIs.
    pub sources_base_url: String,

    // --- Persistence ---------------------------------------------------------
    /// Path of the SQLite store.
    pub store_path: String,
    /// Path of the emergency journal written when the store is unreachable.
    pub journal_path: String,
}

impl Config {
    /// Assemble the configuration from environment variables.
    ///
    /// Returns `EngineError::Validation` on any malformed value so the caller
    /// can abort startup with exit code 1.
    pub fn from_env() -> Result<Self, EngineError> {
        let symbols = match std::env::var("QUASAR_SYMBOLS") {
            Ok(raw) => {
                let parsed: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                if parsed.is_empty() {
                    default_symbols()
                } else {
                    parsed
                }
            }
            Err(_) => default_symbols(),
        };

        let config = Self {
            symbols,
            feed_interval: Duration::from_millis(env_u64(
                "FEED_INTERVAL_MS",
                DEFAULT_FEED_INTERVAL_MS,
            )?),
            source_timeout: Duration::from_millis(env_u64(
                "SOURCE_TIMEOUT_MS",
                DEFAULT_SOURCE_TIMEOUT_MS,
            )?),
            sentiment_staleness: Duration::from_millis(env_u64(
                "SENTIMENT_STALENESS_MS",
                DEFAULT_SENTIMENT_STALENESS_MS,
            )?),
            weights_update_interval: Duration::from_secs(env_u64(
                "WEIGHTS_UPDATE_INTERVAL_S",
                DEFAULT_WEIGHTS_UPDATE_INTERVAL_S,
            )?),
            drain_timeout: Duration::from_secs(env_u64("DRAIN_TIMEOUT_S", DEFAULT_DRAIN_TIMEOUT_S)?),
            signal_channel_capacity: env_u64(
                "SIGNAL_CHANNEL_CAPACITY",
                DEFAULT_SIGNAL_CHANNEL_CAPACITY as u64,
            )? as usize,
            min_exec_confidence: env_f64("MIN_EXEC_CONFIDENCE", DEFAULT_MIN_EXEC_CONFIDENCE)?,
            min_exit_confidence: env_f64("MIN_EXIT_CONFIDENCE", DEFAULT_MIN_EXIT_CONFIDENCE)?,
            broker_retry_attempts: env_u64(
                "BROKER_RETRY_ATTEMPTS",
                DEFAULT_BROKER_RETRY_ATTEMPTS as u64,
            )? as u32,
            position_notional: env_f64("POSITION_NOTIONAL", DEFAULT_POSITION_NOTIONAL)?,
            default_starting_balance: env_f64(
                "DEFAULT_STARTING_BALANCE",
                DEFAULT_STARTING_BALANCE,
            )?,
            stop_loss_pct: env_f64("STOP_LOSS_PCT", DEFAULT_STOP_LOSS_PCT)?,
            take_profit_pct: env_f64("TAKE_PROFIT_PCT", DEFAULT_TAKE_PROFIT_PCT)?,
            max_hold: match env_u64("MAX_HOLD_S", 0)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            min_sentiment_confidence: env_f64(
                "MIN_SENTIMENT_CONFIDENCE",
                DEFAULT_MIN_SENTIMENT_CONFIDENCE,
            )?,
            sentiment_conflict_threshold: env_f64(
                "SENTIMENT_CONFLICT_THRESHOLD",
                DEFAULT_SENTIMENT_CONFLICT_THRESHOLD,
            )?,
            max_sentiment_boost: env_f64("MAX_SENTIMENT_BOOST", DEFAULT_MAX_SENTIMENT_BOOST)?,
            enable_order_book: env_bool("ENABLE_ORDER_BOOK", true)?,
            quote_base_url: env_string("QUOTE_BASE_URL", "https://api.exchange.example.com"),
            depth_ws_url: env_string("DEPTH_WS_URL", "wss://stream.exchange.example.com/depth"),
            broker_base_url: env_string("BROKER_BASE_URL", "https://paper-api.broker.example.com"),
            broker_api_key: env_string("BROKER_API_KEY", ""),
            sources_base_url: env_string("SOURCES_BASE_URL", "https://intel.example.com"),
            store_path: env_string("STORE_PATH", "quasar.db"),
            journal_path: env_string("JOURNAL_PATH", "quasar-emergency.jsonl"),
        };

        config.validate()?;

        info!(
            symbols = ?config.symbols,
            feed_interval_ms = config.feed_interval.as_millis() as u64,
            signal_channel_capacity = config.signal_channel_capacity,
            enable_order_book = config.enable_order_book,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Sanity-check cross-field constraints that per-value parsing cannot see.
    fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() {
            return Err(EngineError::Validation("no symbols configured".into()));
        }
        if self.signal_channel_capacity == 0 {
            return Err(EngineError::Validation(
                "SIGNAL_CHANNEL_CAPACITY must be positive".into(),
            ));
        }
        for (name, value) in [
            ("MIN_EXEC_CONFIDENCE", self.min_exec_confidence),
            ("MIN_EXIT_CONFIDENCE", self.min_exit_confidence),
            ("MIN_SENTIMENT_CONFIDENCE", self.min_sentiment_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Validation(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.stop_loss_pct <= 0.0 || self.take_profit_pct <= 0.0 {
            return Err(EngineError::Validation(
                "STOP_LOSS_PCT and TAKE_PROFIT_PCT must be positive".into(),
            ));
        }
        if self.feed_interval.is_zero() {
            return Err(EngineError::Validation(
                "FEED_INTERVAL_MS must be positive".into(),
            ));
        }
        if self.weights_update_interval.is_zero() {
            return Err(EngineError::Validation(
                "WEIGHTS_UPDATE_INTERVAL_S must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Env parsing helpers
// =============================================================================

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| EngineError::Validation(format!("{key} is not an integer: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::Validation(format!("{key} is not a number: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, EngineError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(EngineError::Validation(format!(
                "{key} is not a boolean: '{other}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; serialise them behind one lock.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    fn clear_quasar_env() {
        for key in [
            "QUASAR_SYMBOLS",
            "FEED_INTERVAL_MS",
            "SOURCE_TIMEOUT_MS",
            "SENTIMENT_STALENESS_MS",
            "SIGNAL_CHANNEL_CAPACITY",
            "BROKER_RETRY_ATTEMPTS",
            "WEIGHTS_UPDATE_INTERVAL_S",
            "MIN_EXEC_CONFIDENCE",
            "MIN_EXIT_CONFIDENCE",
            "STOP_LOSS_PCT",
            "TAKE_PROFIT_PCT",
            "MAX_HOLD_S",
            "ENABLE_ORDER_BOOK",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let _guard = ENV_LOCK.lock();
        clear_quasar_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.feed_interval, Duration::from_millis(30_000));
        assert_eq!(cfg.source_timeout, Duration::from_millis(2_000));
        assert_eq!(cfg.sentiment_staleness, Duration::from_millis(30_000));
        assert_eq!(cfg.signal_channel_capacity, 1024);
        assert_eq!(cfg.broker_retry_attempts, 3);
        assert!((cfg.min_exec_confidence - 0.6).abs() < f64::EPSILON);
        assert!(cfg.max_hold.is_none());
        assert!(cfg.enable_order_book);
    }

    #[test]
    fn malformed_integer_is_rejected() {
        let _guard = ENV_LOCK.lock();
        clear_quasar_env();
        std::env::set_var("FEED_INTERVAL_MS", "not-a-number");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        std::env::remove_var("FEED_INTERVAL_MS");
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let _guard = ENV_LOCK.lock();
        clear_quasar_env();
        std::env::set_var("MIN_EXEC_CONFIDENCE", "1.5");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        std::env::remove_var("MIN_EXEC_CONFIDENCE");
    }

    #[test]
    fn symbols_are_uppercased_and_trimmed() {
        let _guard = ENV_LOCK.lock();
        clear_quasar_env();
        std::env::set_var("QUASAR_SYMBOLS", " btc , eth ,");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH"]);
        std::env::remove_var("QUASAR_SYMBOLS");
    }

    #[test]
    fn max_hold_zero_means_disabled() {
        let _guard = ENV_LOCK.lock();
        clear_quasar_env();
        std::env::set_var("MAX_HOLD_S", "0");
        let cfg = Config::from_env().unwrap();
        assert!(cfg.max_hold.is_none());
        std::env::set_var("MAX_HOLD_S", "7200");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.max_hold, Some(Duration::from_secs(7200)));
        std::env::remove_var("MAX_HOLD_S");
    }
}
