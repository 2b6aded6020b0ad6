// =============================================================================
// Trade Lifecycle Manager — positions, orders, sessions, realized outcomes
// =============================================================================
//
// Position state machine:
//
//   [no position] --executable signal--> OPEN --exit rule fires--> CLOSED
//
//   - A duplicate entry for the same (symbol, strategy) is ignored.
//   - Exactly one exit per position: concurrent exit attempts may all read
//     OPEN, but the position leaves the open set under a single write lock,
//     so only the first close wins and the losers become no-ops.
//   - A CLOSED position never reopens; observing one in the open set is an
//     invariant violation and takes the process down.
//
// Exit rules, evaluated on every tick while OPEN:
//   1. Stop-loss from the high-water mark (trails the best price seen).
//   2. Take-profit against the entry price.
//   3. Strategy-driven exit: opposing signal at sufficient confidence.
//   4. Optional time-based exit.
//
// Broker failures retry with exponential backoff; exhausted retries raise an
// alert and leave the signal marked unexecuted. Persistence failures keep
// in-memory state authoritative and escalate through the fatal channel.
//
// Session aggregates move only on CLOSED transitions, so realized PnL,
// total trades, and winning trades stay monotonic with realized outcomes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::counters::{bump, Counters};
use crate::errors::EngineError;
use crate::fusion::EnhancedSignal;
use crate::persistence::PersistenceStore;
use crate::sentiment::SentimentSource;
use crate::trading::broker::{BrokerAdapter, OrderRequest, OrderType, TimeInForce};
use crate::types::{EventSeverity, FinalAction, Tick, TradeSide};

/// Base delay for broker retry backoff (200 ms, 400 ms, 800 ms, ...).
const BROKER_RETRY_BASE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Outstanding (or archived) exposure created by one entry trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub session_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub opened_at: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: f64,
    pub status: PositionStatus,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub strategy_id: String,
    pub entry_confidence: f64,
    /// Per-source sentiment scores at entry time, read by the adaptive
    /// weights controller for attribution.
    #[serde(default)]
    pub entry_source_scores: HashMap<SentimentSource, f64>,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    /// Best price seen since entry (highest for longs, lowest for shorts);
    /// the stop-loss trails it.
    #[serde(default)]
    pub watermark_price: f64,
}

/// Immutable audit record: one fill leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub position_id: String,
    pub session_id: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub value: f64,
    pub ts: DateTime<Utc>,
    pub is_entry: bool,
    pub strategy: String,
    pub source_reason: String,
}

/// Aggregates for one trading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub starting_balance: f64,
    pub current_balance: f64,
    pub realized_pnl: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub active: bool,
}

impl TradingSession {
    fn new(starting_balance: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            starting_balance,
            current_balance: starting_balance,
            realized_pnl: 0.0,
            total_trades: 0,
            winning_trades: 0,
            active: true,
        }
    }

    /// Win rate over realized outcomes of closed positions.
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Lifecycle tunables, lifted from the engine config at startup.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub min_exec_confidence: f64,
    pub min_exit_confidence: f64,
    pub broker_retry_attempts: u32,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_hold: Option<Duration>,
    pub position_notional: f64,
    pub default_starting_balance: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_exec_confidence: 0.6,
            min_exit_confidence: 0.6,
            broker_retry_attempts: 3,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            max_hold: None,
            position_notional: 500.0,
            default_starting_balance: 10_000.0,
        }
    }
}

/// Owns every position and session aggregate; all other components read via
/// queries.
pub struct TradeLifecycleManager {
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<PersistenceStore>,
    alerts: Arc<dyn AlertSink>,
    counters: Arc<Counters>,
    config: LifecycleConfig,
    session: RwLock<TradingSession>,
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    last_price: RwLock<HashMap<String, f64>>,
    /// Entry fills this session (drives the first-trade alert).
    entries_recorded: AtomicU64,
    fatal_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl TradeLifecycleManager {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        store: Arc<PersistenceStore>,
        alerts: Arc<dyn AlertSink>,
        counters: Arc<Counters>,
        config: LifecycleConfig,
    ) -> Self {
        let placeholder = TradingSession::new(config.default_starting_balance);
        Self {
            broker,
            store,
            alerts,
            counters,
            config,
            session: RwLock::new(placeholder),
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            last_price: RwLock::new(HashMap::new()),
            entries_recorded: AtomicU64::new(0),
            fatal_tx: RwLock::new(None),
        }
    }

    /// Wire the channel that escalates persistence failures to `main`.
    pub fn set_fatal_channel(&self, tx: mpsc::UnboundedSender<String>) {
        *self.fatal_tx.write() = Some(tx);
    }

    /// Start the trading session. The starting balance comes from the broker
    /// account; the local default applies only when the adapter reports none.
    pub async fn start_session(&self) -> Result<(), EngineError> {
        let starting_balance = match self.broker.get_account().await {
            Ok(account) => account
                .starting_balance()
                .unwrap_or(self.config.default_starting_balance),
            Err(e) => {
                warn!(error = %e, "broker account unavailable; using default starting balance");
                bump(&self.counters.recovered_errors);
                self.config.default_starting_balance
            }
        };

        let session = TradingSession::new(starting_balance);
        info!(
            session_id = %session.id,
            starting_balance,
            "trading session started"
        );
        self.persist_session(&session);
        *self.session.write() = session;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signal handling
    // -------------------------------------------------------------------------

    /// Route one fused signal through execution and persist the outcome.
    /// Returns the signal with its execution fields filled in.
    pub async fn handle_signal(&self, mut signal: EnhancedSignal) -> EnhancedSignal {
        match signal.final_action {
            FinalAction::Hold => {
                signal.execute_reason = Some("hold signal".to_string());
            }
            FinalAction::Skip => {
                signal.execute_reason = Some(format!("skipped: {}", signal.rationale));
            }
            FinalAction::Buy | FinalAction::Sell => {
                self.execute_directional(&mut signal).await;
            }
        }

        self.persist_signal(&signal);
        signal
    }

    async fn execute_directional(&self, signal: &mut EnhancedSignal) {
        let symbol = signal.technical.symbol.clone();
        let strategy_id = signal.technical.strategy_id.clone();
        let desired_side = match signal.final_action {
            FinalAction::Buy => TradeSide::Buy,
            _ => TradeSide::Sell,
        };

        let price = self.last_price.read().get(&symbol).copied();

        // --- Strategy-driven exit: opposing signal on an open position --------
        let opposing_id = self.open.read().iter().find_map(|p| {
            (p.symbol == symbol && p.strategy_id == strategy_id && p.side != desired_side)
                .then(|| p.id.clone())
        });
        if let Some(position_id) = opposing_id {
            if signal.final_confidence >= self.config.min_exit_confidence {
                let Some(exit_price) = price.filter(|p| *p > 0.0) else {
                    signal.execute_reason = Some("no market price for symbol".to_string());
                    return;
                };
                if let Some((_pnl, trade_id)) = self
                    .close_position(&position_id, exit_price, "StrategyExit")
                    .await
                {
                    signal.was_executed = true;
                    signal.execute_reason = Some("strategy exit".to_string());
                    signal.execution_time = Some(Utc::now());
                    signal.trade_id = Some(trade_id);
                }
            } else {
                signal.execute_reason = Some(format!(
                    "opposing signal confidence {:.2} below exit gate {:.2}",
                    signal.final_confidence, self.config.min_exit_confidence
                ));
            }
            return;
        }

        // --- Entry gate --------------------------------------------------------
        if signal.final_confidence < self.config.min_exec_confidence {
            signal.execute_reason = Some(format!(
                "confidence {:.2} below execution gate {:.2}",
                signal.final_confidence, self.config.min_exec_confidence
            ));
            return;
        }

        // Duplicate entry for the same (symbol, strategy): ignored.
        let duplicate = self
            .open
            .read()
            .iter()
            .any(|p| p.symbol == symbol && p.strategy_id == strategy_id);
        if duplicate {
            signal.execute_reason = Some("duplicate position for symbol/strategy".to_string());
            return;
        }

        let Some(entry_price) = price.filter(|p| *p > 0.0) else {
            signal.execute_reason = Some("no market price for symbol".to_string());
            return;
        };

        let quantity = self.config.position_notional / entry_price;
        let request = OrderRequest {
            symbol: symbol.clone(),
            side: desired_side,
            qty: quantity,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(entry_price),
        };

        match self.place_with_retry(request).await {
            Ok(ack) => {
                let fill_price = if ack.fill_price > 0.0 {
                    ack.fill_price
                } else {
                    entry_price
                };
                let trade_id = self.open_position(signal, desired_side, fill_price, ack.qty);
                signal.was_executed = true;
                signal.execute_reason = Some("executed".to_string());
                signal.execution_time = Some(Utc::now());
                signal.trade_id = Some(trade_id);
            }
            Err(e) => {
                self.alerts.send_alert(Alert::new(
                    AlertKind::BrokerFailure,
                    EventSeverity::High,
                    json!({
                        "symbol": symbol,
                        "strategy": strategy_id,
                        "side": desired_side.to_string(),
                        "error": e.to_string(),
                    }),
                ));
                signal.execute_reason = Some(e.to_string());
            }
        }
    }

    /// Place an order with bounded exponential-backoff retries. Exactly one
    /// position is created per successful acknowledgement, never more.
    async fn place_with_retry(
        &self,
        request: OrderRequest,
    ) -> Result<crate::trading::broker::OrderAck, EngineError> {
        let attempts = self.config.broker_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.broker.place_order(request.clone()).await {
                Ok(ack) => return Ok(ack),
                Err(e) => {
                    warn!(
                        symbol = %request.symbol,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "broker placeOrder failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        bump(&self.counters.broker_retries);
                        let delay = BROKER_RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(EngineError::Broker {
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Create the OPEN position and its entry trade. Returns the trade id.
    fn open_position(
        &self,
        signal: &EnhancedSignal,
        side: TradeSide,
        fill_price: f64,
        quantity: f64,
    ) -> String {
        let session_id = self.session.read().id.clone();
        let now = Utc::now();

        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            symbol: signal.technical.symbol.clone(),
            side,
            opened_at: now,
            entry_price: fill_price,
            quantity,
            status: PositionStatus::Open,
            exit_price: None,
            closed_at: None,
            realized_pnl: None,
            strategy_id: signal.technical.strategy_id.clone(),
            entry_confidence: signal.final_confidence,
            entry_source_scores: signal.source_scores.clone(),
            current_price: fill_price,
            unrealized_pnl: 0.0,
            watermark_price: fill_price,
        };

        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            session_id,
            side,
            quantity,
            price: fill_price,
            value: fill_price * quantity,
            ts: now,
            is_entry: true,
            strategy: position.strategy_id.clone(),
            source_reason: signal.technical.reason.clone(),
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %side,
            entry_price = fill_price,
            quantity,
            confidence = signal.final_confidence,
            "position opened"
        );

        self.persist_position(&position);
        self.persist_trade(&trade);
        self.open.write().push(position);

        if self.entries_recorded.fetch_add(1, Ordering::SeqCst) == 0 {
            self.alerts.send_alert(Alert::new(
                AlertKind::FirstTrade,
                EventSeverity::Low,
                json!({
                    "symbol": signal.technical.symbol,
                    "strategy": signal.technical.strategy_id,
                    "price": fill_price,
                }),
            ));
        }

        trade.id
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Evaluate price-driven exit rules for every open position on `symbol`.
    pub async fn on_tick(&self, tick: &Tick) {
        self.last_price
            .write()
            .insert(tick.symbol.clone(), tick.price);

        let now = Utc::now();
        let mut exits: Vec<(String, String)> = Vec::new();
        {
            let mut open = self.open.write();
            for position in open.iter_mut().filter(|p| p.symbol == tick.symbol) {
                let price = tick.price;
                position.current_price = price;
                position.unrealized_pnl =
                    (price - position.entry_price) * position.quantity * position.side.direction();

                let is_long = position.side == TradeSide::Buy;

                // Watermark: best price seen since entry.
                if is_long {
                    position.watermark_price = position.watermark_price.max(price);
                } else {
                    position.watermark_price = position.watermark_price.min(price);
                }

                // 1. Stop-loss, trailing the watermark.
                let stop_hit = if is_long {
                    price <= position.watermark_price * (1.0 - self.config.stop_loss_pct)
                } else {
                    price >= position.watermark_price * (1.0 + self.config.stop_loss_pct)
                };
                if stop_hit {
                    exits.push((position.id.clone(), "StopLoss".to_string()));
                    continue;
                }

                // 2. Take-profit against entry.
                let tp_hit = if is_long {
                    price >= position.entry_price * (1.0 + self.config.take_profit_pct)
                } else {
                    price <= position.entry_price * (1.0 - self.config.take_profit_pct)
                };
                if tp_hit {
                    exits.push((position.id.clone(), "TakeProfit".to_string()));
                    continue;
                }

                // 3. Optional time-based exit.
                if let Some(max_hold) = self.config.max_hold {
                    let held = now
                        .signed_duration_since(position.opened_at)
                        .to_std()
                        .unwrap_or_default();
                    if held >= max_hold {
                        exits.push((position.id.clone(), "MaxHold".to_string()));
                    }
                }
            }
        }

        for (position_id, reason) in exits {
            self.close_position(&position_id, tick.price, &reason).await;
        }
    }

    /// Close one position. Returns `(realized_pnl, exit_trade_id)`, or `None`
    /// when another exit already won the race.
    pub async fn close_position(
        &self,
        position_id: &str,
        exit_price: f64,
        reason: &str,
    ) -> Option<(f64, String)> {
        // The position leaves the open set under a single write lock; losers
        // of a concurrent race find nothing and become no-ops.
        let mut position = {
            let mut open = self.open.write();
            let idx = open.iter().position(|p| p.id == position_id)?;
            open.remove(idx)
        };

        if position.status != PositionStatus::Open {
            self.raise_fatal(EngineError::Invariant(format!(
                "position {} in open set with status {}",
                position.id, position.status
            )));
            return None;
        }

        let now = Utc::now();
        let pnl =
            (exit_price - position.entry_price) * position.quantity * position.side.direction();

        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.closed_at = Some(now);
        position.realized_pnl = Some(pnl);
        position.current_price = exit_price;
        position.unrealized_pnl = 0.0;

        let exit_trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            session_id: position.session_id.clone(),
            side: position.side.opposite(),
            quantity: position.quantity,
            price: exit_price,
            value: exit_price * position.quantity,
            ts: now,
            is_entry: false,
            strategy: position.strategy_id.clone(),
            source_reason: reason.to_string(),
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            reason,
            exit_price,
            realized_pnl = pnl,
            "position closed"
        );

        // Route the closing order to the broker; the local close stands even
        // if the paper endpoint is unreachable (in-memory authoritative).
        let close_request = OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            qty: position.quantity,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(exit_price),
        };
        if let Err(e) = self.place_with_retry(close_request).await {
            self.alerts.send_alert(Alert::new(
                AlertKind::BrokerFailure,
                EventSeverity::High,
                json!({
                    "symbol": position.symbol,
                    "position_id": position.id,
                    "error": e.to_string(),
                    "phase": "exit",
                }),
            ));
        }

        // Session aggregates move only on this transition.
        let session_snapshot = {
            let mut session = self.session.write();
            session.realized_pnl += pnl;
            session.current_balance += pnl;
            session.total_trades += 1;
            if pnl > 0.0 {
                session.winning_trades += 1;
            }
            session.clone()
        };

        self.persist_position(&position);
        self.persist_trade(&exit_trade);
        self.persist_session(&session_snapshot);
        self.closed.write().push(position);

        Some((pnl, exit_trade.id))
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    /// Closed positions whose close time is at or after `cutoff`.
    pub fn closed_positions_since(&self, cutoff: DateTime<Utc>) -> Vec<Position> {
        self.closed
            .read()
            .iter()
            .filter(|p| p.closed_at.map(|t| t >= cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn session(&self) -> TradingSession {
        self.session.read().clone()
    }

    /// Emit the session summary alert (daily cadence and shutdown).
    pub fn emit_session_summary(&self) {
        let session = self.session();
        self.alerts.send_alert(Alert::new(
            AlertKind::DailySummary,
            EventSeverity::Low,
            json!({
                "session_id": session.id,
                "realized_pnl": session.realized_pnl,
                "total_trades": session.total_trades,
                "winning_trades": session.winning_trades,
                "win_rate": session.win_rate(),
                "current_balance": session.current_balance,
            }),
        ));
    }

    // -------------------------------------------------------------------------
    // Persistence plumbing
    // -------------------------------------------------------------------------

    fn persist_signal(&self, signal: &EnhancedSignal) {
        if let Err(e) = self.store.insert_signal(signal) {
            self.raise_fatal(e);
        }
    }

    fn persist_position(&self, position: &Position) {
        if let Err(e) = self.store.upsert_position(position) {
            self.raise_fatal(e);
        }
    }

    fn persist_trade(&self, trade: &Trade) {
        if let Err(e) = self.store.insert_trade(trade) {
            self.raise_fatal(e);
        }
    }

    fn persist_session(&self, session: &TradingSession) {
        if let Err(e) = self.store.upsert_session(session) {
            self.raise_fatal(e);
        }
    }

    /// Escalate an unrecoverable error to `main` (exit code 2 path).
    fn raise_fatal(&self, err: EngineError) {
        error!(error = %err, "unrecoverable lifecycle error");
        if let Some(tx) = self.fatal_tx.read().as_ref() {
            let _ = tx.send(err.to_string());
        }
    }
}
