// =============================================================================
// Strategy Registry — typed strategies over rolling price windows
// =============================================================================
//
// Each strategy kind declares a typed parameter struct with per-field defaults
// and bounds. Registration validates parameters: out-of-range values are
// clamped and a warning is recorded. Uniqueness is enforced per
// (strategy id, symbol) pair.
//
// Evaluation is a function of (window, params) -> TechnicalSignal. The
// Neural-Confidence kind additionally carries deterministic adaptive state;
// its seed derives from the strategy id, so an identical input stream always
// produces identical output.
// =============================================================================

pub mod bollinger_breakout;
pub mod neural_confidence;
pub mod quantum_oscillator;
pub mod rsi_pullback;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::types::{Action, Tick};

pub use neural_confidence::NeuralState;

// ---------------------------------------------------------------------------
// Signal types
// ---------------------------------------------------------------------------

/// Values of the indicators that drove a signal, captured for the audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper_band: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_band: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower_band: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neural_output: Option<f64>,
}

/// A signal produced by one strategy from market data alone. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub strategy_id: String,
    pub symbol: String,
    pub action: Action,
    /// In [0, 1].
    pub confidence: f64,
    pub indicators: IndicatorSnapshot,
    pub reason: String,
    /// Inherited from the tick that produced this signal.
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Parameter schemas
// ---------------------------------------------------------------------------

/// The four supported strategy kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RsiPullback,
    QuantumOscillator,
    NeuralConfidence,
    BollingerBreakout,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RsiPullback => write!(f, "rsi-pullback"),
            Self::QuantumOscillator => write!(f, "quantum-oscillator"),
            Self::NeuralConfidence => write!(f, "neural-confidence"),
            Self::BollingerBreakout => write!(f, "bollinger-breakout"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiPullbackParams {
    pub lookback: usize,
    pub lower_barrier: f64,
    pub lower_threshold: f64,
    pub upper_barrier: f64,
    pub upper_threshold: f64,
    pub ma_length: usize,
    pub atr_mult_sl: f64,
    pub atr_mult_tp: f64,
}

impl Default for RsiPullbackParams {
    fn default() -> Self {
        Self {
            lookback: 14,
            lower_barrier: 30.0,
            lower_threshold: 20.0,
            upper_barrier: 70.0,
            upper_threshold: 80.0,
            ma_length: 50,
            atr_mult_sl: 1.5,
            atr_mult_tp: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumOscillatorParams {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_period: usize,
    pub overbought_level: f64,
    pub oversold_level: f64,
    pub momentum_threshold: f64,
    pub volume_multiplier: f64,
}

impl Default for QuantumOscillatorParams {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
            signal_period: 9,
            overbought_level: 70.0,
            oversold_level: 30.0,
            momentum_threshold: 0.5,
            volume_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralConfidenceParams {
    pub neural_layers: usize,
    pub learning_rate: f64,
    pub lookback_window: usize,
    pub confidence_threshold: f64,
    pub adaptation_period: u64,
    pub risk_multiplier: f64,
}

impl Default for NeuralConfidenceParams {
    fn default() -> Self {
        Self {
            neural_layers: 2,
            learning_rate: 0.01,
            lookback_window: 20,
            confidence_threshold: 0.6,
            adaptation_period: 50,
            risk_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BollingerBreakoutParams {
    pub sma_length: usize,
    pub ub_offset: f64,
    pub lb_offset: f64,
    pub use_rsi_filter: bool,
    pub use_volume_filter: bool,
}

impl Default for BollingerBreakoutParams {
    fn default() -> Self {
        Self {
            sma_length: 20,
            ub_offset: 2.0,
            lb_offset: 2.0,
            use_rsi_filter: true,
            use_volume_filter: true,
        }
    }
}

/// Kind-specific parameters, validated at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StrategyParams {
    RsiPullback(RsiPullbackParams),
    QuantumOscillator(QuantumOscillatorParams),
    NeuralConfidence(NeuralConfidenceParams),
    BollingerBreakout(BollingerBreakoutParams),
}

impl StrategyParams {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::RsiPullback(_) => StrategyKind::RsiPullback,
            Self::QuantumOscillator(_) => StrategyKind::QuantumOscillator,
            Self::NeuralConfidence(_) => StrategyKind::NeuralConfidence,
            Self::BollingerBreakout(_) => StrategyKind::BollingerBreakout,
        }
    }

    /// Ticks of history this parameter set needs to evaluate one tick.
    pub fn lookback(&self) -> usize {
        match self {
            Self::RsiPullback(p) => (p.lookback + 1).max(p.ma_length),
            Self::QuantumOscillator(p) => p.slow_period + p.signal_period + 1,
            Self::NeuralConfidence(p) => p.lookback_window,
            Self::BollingerBreakout(p) => p.sma_length.max(15),
        }
    }

    /// Clamp out-of-range fields in place, returning one warning per clamp.
    pub fn clamp_into_bounds(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self {
            Self::RsiPullback(p) => {
                clamp_usize("lookback", &mut p.lookback, 2, 100, &mut warnings);
                clamp_f64("lower_barrier", &mut p.lower_barrier, 5.0, 50.0, &mut warnings);
                clamp_f64("lower_threshold", &mut p.lower_threshold, 1.0, 49.0, &mut warnings);
                clamp_f64("upper_barrier", &mut p.upper_barrier, 50.0, 95.0, &mut warnings);
                clamp_f64("upper_threshold", &mut p.upper_threshold, 51.0, 99.0, &mut warnings);
                clamp_usize("ma_length", &mut p.ma_length, 2, 200, &mut warnings);
                clamp_f64("atr_mult_sl", &mut p.atr_mult_sl, 0.1, 10.0, &mut warnings);
                clamp_f64("atr_mult_tp", &mut p.atr_mult_tp, 0.1, 20.0, &mut warnings);
                // The threshold must sit strictly beyond the barrier.
                if p.lower_threshold >= p.lower_barrier {
                    warnings.push(format!(
                        "lower_threshold {} >= lower_barrier {}, clamped",
                        p.lower_threshold, p.lower_barrier
                    ));
                    p.lower_threshold = (p.lower_barrier - 1.0).max(1.0);
                }
                if p.upper_threshold <= p.upper_barrier {
                    warnings.push(format!(
                        "upper_threshold {} <= upper_barrier {}, clamped",
                        p.upper_threshold, p.upper_barrier
                    ));
                    p.upper_threshold = (p.upper_barrier + 1.0).min(99.0);
                }
            }
            Self::QuantumOscillator(p) => {
                clamp_usize("fast_period", &mut p.fast_period, 2, 50, &mut warnings);
                clamp_usize("slow_period", &mut p.slow_period, 3, 100, &mut warnings);
                clamp_usize("signal_period", &mut p.signal_period, 2, 50, &mut warnings);
                clamp_f64("overbought_level", &mut p.overbought_level, 50.0, 100.0, &mut warnings);
                clamp_f64("oversold_level", &mut p.oversold_level, 0.0, 50.0, &mut warnings);
                clamp_f64("momentum_threshold", &mut p.momentum_threshold, 1e-6, 100.0, &mut warnings);
                clamp_f64("volume_multiplier", &mut p.volume_multiplier, 0.1, 10.0, &mut warnings);
                if p.fast_period >= p.slow_period {
                    warnings.push(format!(
                        "fast_period {} >= slow_period {}, clamped",
                        p.fast_period, p.slow_period
                    ));
                    p.fast_period = p.slow_period - 1;
                }
            }
            Self::NeuralConfidence(p) => {
                clamp_usize("neural_layers", &mut p.neural_layers, 1, 4, &mut warnings);
                clamp_f64("learning_rate", &mut p.learning_rate, 1e-5, 1.0, &mut warnings);
                clamp_usize("lookback_window", &mut p.lookback_window, 5, 200, &mut warnings);
                clamp_f64("confidence_threshold", &mut p.confidence_threshold, 0.05, 0.95, &mut warnings);
                if p.adaptation_period == 0 {
                    warnings.push("adaptation_period 0 clamped to 1".to_string());
                    p.adaptation_period = 1;
                }
                clamp_f64("risk_multiplier", &mut p.risk_multiplier, 0.1, 5.0, &mut warnings);
            }
            Self::BollingerBreakout(p) => {
                clamp_usize("sma_length", &mut p.sma_length, 5, 200, &mut warnings);
                clamp_f64("ub_offset", &mut p.ub_offset, 0.5, 5.0, &mut warnings);
                clamp_f64("lb_offset", &mut p.lb_offset, 0.5, 5.0, &mut warnings);
            }
        }
        warnings
    }
}

fn clamp_f64(name: &str, value: &mut f64, min: f64, max: f64, warnings: &mut Vec<String>) {
    if !value.is_finite() {
        warnings.push(format!("{name} is not finite, reset to {min}"));
        *value = min;
    } else if *value < min || *value > max {
        let clamped = value.clamp(min, max);
        warnings.push(format!("{name} {value} out of [{min}, {max}], clamped to {clamped}"));
        *value = clamped;
    }
}

fn clamp_usize(name: &str, value: &mut usize, min: usize, max: usize, warnings: &mut Vec<String>) {
    if *value < min || *value > max {
        let clamped = (*value).clamp(min, max);
        warnings.push(format!("{name} {value} out of [{min}, {max}], clamped to {clamped}"));
        *value = clamped;
    }
}

// ---------------------------------------------------------------------------
// Strategy instance
// ---------------------------------------------------------------------------

/// A registered strategy: validated parameters plus (for the neural kind)
/// deterministic adaptive state.
#[derive(Debug)]
pub struct StrategyInstance {
    pub id: String,
    pub name: String,
    pub params: StrategyParams,
    pub symbols: Vec<String>,
    pub active: bool,
    /// Adaptive state, present only for Neural-Confidence.
    neural: Option<NeuralState>,
    /// Timestamp of the last distinct tick evaluated; guards replay
    /// idempotence for the adaptive kind.
    last_tick_ts: Option<DateTime<Utc>>,
}

impl StrategyInstance {
    /// Build an instance, filling defaults and clamping out-of-range values.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        mut params: StrategyParams,
        symbols: Vec<String>,
    ) -> Self {
        let id = id.into();
        let warnings = params.clamp_into_bounds();
        for w in &warnings {
            warn!(strategy_id = %id, warning = %w, "strategy parameter clamped");
        }

        let neural = match &params {
            StrategyParams::NeuralConfidence(p) => Some(NeuralState::seeded(&id, p)),
            _ => None,
        };

        Self {
            id,
            name: name.into(),
            params,
            symbols,
            active: true,
            neural,
            last_tick_ts: None,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.params.kind()
    }

    /// Evaluate one tick's window and produce a signal (possibly HOLD).
    pub fn evaluate(&mut self, symbol: &str, window: &[Tick]) -> TechnicalSignal {
        let ts = window.last().map(|t| t.ts).unwrap_or_else(Utc::now);

        // Count a tick only once; replaying the same tick must not advance
        // adaptive state (idempotent re-evaluation).
        let fresh_tick = self.last_tick_ts != Some(ts);
        if fresh_tick {
            self.last_tick_ts = Some(ts);
        }

        let (action, confidence, reason, indicators) = match (&self.params, &mut self.neural) {
            (StrategyParams::RsiPullback(p), _) => rsi_pullback::evaluate(p, window),
            (StrategyParams::QuantumOscillator(p), _) => quantum_oscillator::evaluate(p, window),
            (StrategyParams::NeuralConfidence(p), Some(state)) => {
                neural_confidence::evaluate(p, state, window, fresh_tick)
            }
            (StrategyParams::NeuralConfidence(_), None) => {
                // Unreachable by construction; fail closed with a HOLD.
                (Action::Hold, 0.0, "neural state missing".to_string(), IndicatorSnapshot::default())
            }
            (StrategyParams::BollingerBreakout(p), _) => bollinger_breakout::evaluate(p, window),
        };

        TechnicalSignal {
            strategy_id: self.id.clone(),
            symbol: symbol.to_string(),
            action,
            confidence: confidence.clamp(0.0, 1.0),
            indicators,
            reason,
            ts,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of live strategies keyed by (strategy id, symbol). Built at
/// startup and shared immutably with the execution engine.
pub struct StrategyRegistry {
    entries: Vec<Arc<Mutex<StrategyInstance>>>,
    by_symbol: HashMap<String, Vec<Arc<Mutex<StrategyInstance>>>>,
    keys: HashSet<(String, String)>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_symbol: HashMap::new(),
            keys: HashSet::new(),
        }
    }

    /// Register a strategy for all its symbols.
    ///
    /// Fails with a validation error on a duplicate (id, symbol) pair; the
    /// offending entity is skipped and the system continues.
    pub fn register(&mut self, instance: StrategyInstance) -> Result<(), EngineError> {
        if instance.symbols.is_empty() {
            return Err(EngineError::Validation(format!(
                "strategy '{}' has no symbols",
                instance.id
            )));
        }
        for symbol in &instance.symbols {
            let key = (instance.id.clone(), symbol.clone());
            if self.keys.contains(&key) {
                return Err(EngineError::Validation(format!(
                    "duplicate registration for strategy '{}' on symbol '{}'",
                    instance.id, symbol
                )));
            }
        }

        info!(
            strategy_id = %instance.id,
            kind = %instance.kind(),
            symbols = ?instance.symbols,
            lookback = instance.params.lookback(),
            "strategy registered"
        );

        let symbols = instance.symbols.clone();
        let id = instance.id.clone();
        let shared = Arc::new(Mutex::new(instance));
        self.entries.push(Arc::clone(&shared));
        for symbol in symbols {
            self.keys.insert((id.clone(), symbol.clone()));
            self.by_symbol.entry(symbol).or_default().push(Arc::clone(&shared));
        }
        Ok(())
    }

    /// All active strategies registered for `symbol`.
    pub fn for_symbol(&self, symbol: &str) -> Vec<Arc<Mutex<StrategyInstance>>> {
        self.by_symbol
            .get(symbol)
            .map(|v| v.iter().filter(|s| s.lock().active).cloned().collect())
            .unwrap_or_default()
    }

    /// Maximum lookback across live strategies for `symbol`, used to size
    /// that symbol's price window.
    pub fn max_lookback(&self, symbol: &str) -> usize {
        self.by_symbol
            .get(symbol)
            .map(|v| {
                v.iter()
                    .map(|s| s.lock().params.lookback())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            .max(2)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ticks(prices: &[f64]) -> Vec<Tick> {
        let start = Utc::now();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| Tick {
                symbol: "BTC".to_string(),
                ts: start + Duration::seconds(i as i64),
                price: p,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn out_of_range_params_are_clamped_with_warnings() {
        let mut params = StrategyParams::RsiPullback(RsiPullbackParams {
            lookback: 1000,
            lower_barrier: -5.0,
            ..Default::default()
        });
        let warnings = params.clamp_into_bounds();
        assert!(warnings.len() >= 2);
        if let StrategyParams::RsiPullback(p) = &params {
            assert_eq!(p.lookback, 100);
            assert_eq!(p.lower_barrier, 5.0);
        } else {
            panic!("wrong kind");
        }
    }

    #[test]
    fn quantum_fast_must_stay_below_slow() {
        let mut params = StrategyParams::QuantumOscillator(QuantumOscillatorParams {
            fast_period: 30,
            slow_period: 26,
            ..Default::default()
        });
        let warnings = params.clamp_into_bounds();
        assert!(!warnings.is_empty());
        if let StrategyParams::QuantumOscillator(p) = &params {
            assert!(p.fast_period < p.slow_period);
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = StrategyRegistry::new();
        registry
            .register(StrategyInstance::new(
                "rsi-1",
                "RSI Pullback",
                StrategyParams::RsiPullback(Default::default()),
                vec!["BTC".to_string()],
            ))
            .unwrap();
        let err = registry
            .register(StrategyInstance::new(
                "rsi-1",
                "RSI Pullback",
                StrategyParams::RsiPullback(Default::default()),
                vec!["BTC".to_string()],
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn max_lookback_covers_all_strategies() {
        let mut registry = StrategyRegistry::new();
        registry
            .register(StrategyInstance::new(
                "rsi-1",
                "RSI Pullback",
                StrategyParams::RsiPullback(RsiPullbackParams {
                    lookback: 14,
                    ma_length: 50,
                    ..Default::default()
                }),
                vec!["BTC".to_string()],
            ))
            .unwrap();
        registry
            .register(StrategyInstance::new(
                "qo-1",
                "Quantum Oscillator",
                StrategyParams::QuantumOscillator(Default::default()),
                vec!["BTC".to_string()],
            ))
            .unwrap();
        // Quantum needs 26 + 9 + 1 = 36; RSI needs max(15, 50) = 50.
        assert_eq!(registry.max_lookback("BTC"), 50);
        assert_eq!(registry.max_lookback("DOGE"), 2); // floor for unknown symbols
    }

    #[test]
    fn evaluation_is_idempotent_for_same_window() {
        // Invariant: replaying the same tick with the same window state
        // yields identical signals.
        let mut instance = StrategyInstance::new(
            "neural-1",
            "Neural Confidence",
            StrategyParams::NeuralConfidence(NeuralConfidenceParams {
                adaptation_period: 1, // adapt on every fresh tick
                ..Default::default()
            }),
            vec!["BTC".to_string()],
        );
        let prices: Vec<f64> = (0..25).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let window = ticks(&prices);

        let first = instance.evaluate("BTC", &window);
        let second = instance.evaluate("BTC", &window);
        assert_eq!(first.action, second.action);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.reason, second.reason);
    }

    #[test]
    fn signal_timestamp_inherited_from_tick() {
        let mut instance = StrategyInstance::new(
            "bb-1",
            "Bollinger Breakout",
            StrategyParams::BollingerBreakout(Default::default()),
            vec!["BTC".to_string()],
        );
        let window = ticks(&[100.0; 25]);
        let sig = instance.evaluate("BTC", &window);
        assert_eq!(sig.ts, window.last().unwrap().ts);
    }
}
