// =============================================================================
// Persistence Store — SQLite-backed outcome trail with bounded-retry writes
// =============================================================================
//
// All writers go through one pooled connection behind a mutex. Every write is
// wrapped in a bounded retry (10 attempts spaced 1 s); once retries are
// exhausted the record is flushed to an emergency JSON-lines journal on disk
// and a persistence error propagates, which the caller treats as fatal
// (exit code 2). In-memory state stays authoritative during retries.
//
// Entities keep their full serde payload alongside the queryable columns, so
// a load reproduces a semantically identical value.
// =============================================================================

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::counters::{bump, Counters};
use crate::errors::EngineError;
use crate::fusion::EnhancedSignal;
use crate::trading::lifecycle::{Position, Trade, TradingSession};

/// Write attempts before the store gives up.
const RETRY_ATTEMPTS: u32 = 10;
/// Spacing between write attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS enhanced_signals (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    strategy TEXT NOT NULL,
    technical_score REAL NOT NULL,
    technical_action TEXT NOT NULL,
    sentiment_score REAL NOT NULL,
    sentiment_confidence REAL NOT NULL,
    sentiment_conflict INTEGER NOT NULL,
    combined_confidence REAL NOT NULL,
    final_action TEXT NOT NULL,
    confidence_boost REAL NOT NULL,
    was_executed INTEGER NOT NULL,
    execute_reason TEXT,
    signal_time TEXT NOT NULL,
    execution_time TEXT,
    trade_id TEXT,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_signals_symbol_time
    ON enhanced_signals(symbol, signal_time DESC);

CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    status TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    entry_price REAL NOT NULL,
    quantity REAL NOT NULL,
    exit_price REAL,
    closed_at TEXT,
    realized_pnl REAL,
    strategy_id TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_positions_session
    ON positions(session_id, status);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    position_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL NOT NULL,
    value REAL NOT NULL,
    ts TEXT NOT NULL,
    is_entry INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    source_reason TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_position
    ON trades(position_id, is_entry);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    starting_balance REAL NOT NULL,
    current_balance REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    total_trades INTEGER NOT NULL,
    winning_trades INTEGER NOT NULL,
    active INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);
"#;

/// The persistence store: one serialized connection fronting all writers.
pub struct PersistenceStore {
    conn: Mutex<Connection>,
    journal_path: PathBuf,
    counters: Arc<Counters>,
}

impl PersistenceStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(
        path: &str,
        journal_path: &str,
        counters: Arc<Counters>,
    ) -> Result<Self, EngineError> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::Persistence(format!("failed to open store {path}: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| EngineError::Persistence(format!("failed to apply schema: {e}")))?;

        info!(path, "persistence store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            journal_path: PathBuf::from(journal_path),
            counters,
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory(counters: Arc<Counters>) -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        conn.execute_batch(SCHEMA_SQL).expect("schema");
        Self {
            conn: Mutex::new(conn),
            journal_path: std::env::temp_dir().join("quasar-test-journal.jsonl"),
            counters,
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, signal: &EnhancedSignal) -> Result<(), EngineError> {
        let payload = to_payload(signal)?;
        self.with_retry("insert_signal", signal, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO enhanced_signals (
                    id, symbol, strategy, technical_score, technical_action,
                    sentiment_score, sentiment_confidence, sentiment_conflict,
                    combined_confidence, final_action, confidence_boost,
                    was_executed, execute_reason, signal_time, execution_time,
                    trade_id, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    signal.id,
                    signal.technical.symbol,
                    signal.technical.strategy_id,
                    signal.technical.confidence,
                    signal.technical.action.to_string(),
                    signal.sentiment_score,
                    signal.sentiment_confidence,
                    signal.conflict as i64,
                    signal.final_confidence,
                    signal.final_action.to_string(),
                    signal.confidence_boost,
                    signal.was_executed as i64,
                    signal.execute_reason,
                    signal.signal_time.to_rfc3339(),
                    signal.execution_time.map(|t| t.to_rfc3339()),
                    signal.trade_id,
                    payload,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn upsert_position(&self, position: &Position) -> Result<(), EngineError> {
        let payload = to_payload(position)?;
        self.with_retry("upsert_position", position, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO positions (
                    id, session_id, symbol, side, status, opened_at,
                    entry_price, quantity, exit_price, closed_at, realized_pnl,
                    strategy_id, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    position.id,
                    position.session_id,
                    position.symbol,
                    position.side.to_string(),
                    position.status.to_string(),
                    position.opened_at.to_rfc3339(),
                    position.entry_price,
                    position.quantity,
                    position.exit_price,
                    position.closed_at.map(|t| t.to_rfc3339()),
                    position.realized_pnl,
                    position.strategy_id,
                    payload,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn insert_trade(&self, trade: &Trade) -> Result<(), EngineError> {
        let payload = to_payload(trade)?;
        self.with_retry("insert_trade", trade, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trades (
                    id, position_id, session_id, side, quantity, price, value,
                    ts, is_entry, strategy, source_reason, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    trade.id,
                    trade.position_id,
                    trade.session_id,
                    trade.side.to_string(),
                    trade.quantity,
                    trade.price,
                    trade.value,
                    trade.ts.to_rfc3339(),
                    trade.is_entry as i64,
                    trade.strategy,
                    trade.source_reason,
                    payload,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn upsert_session(&self, session: &TradingSession) -> Result<(), EngineError> {
        let payload = to_payload(session)?;
        self.with_retry("upsert_session", session, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (
                    id, started_at, starting_balance, current_balance,
                    realized_pnl, total_trades, winning_trades, active,
                    payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id,
                    session.started_at.to_rfc3339(),
                    session.starting_balance,
                    session.current_balance,
                    session.realized_pnl,
                    session.total_trades as i64,
                    session.winning_trades as i64,
                    session.active as i64,
                    payload,
                ],
            )
            .map(|_| ())
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn load_position(&self, id: &str) -> Result<Option<Position>, EngineError> {
        self.load_payload("positions", id)
    }

    pub fn load_signal(&self, id: &str) -> Result<Option<EnhancedSignal>, EngineError> {
        self.load_payload("enhanced_signals", id)
    }

    pub fn load_trade(&self, id: &str) -> Result<Option<Trade>, EngineError> {
        self.load_payload("trades", id)
    }

    pub fn load_session(&self, id: &str) -> Result<Option<TradingSession>, EngineError> {
        self.load_payload("sessions", id)
    }

    /// Trades linked to one position, entries first.
    pub fn trades_for_position(&self, position_id: &str) -> Result<Vec<Trade>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT payload_json FROM trades
                 WHERE position_id = ?1 ORDER BY is_entry DESC, ts ASC",
            )
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map(params![position_id], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        let mut trades = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| EngineError::Persistence(e.to_string()))?;
            let trade = serde_json::from_str(&payload)
                .map_err(|e| EngineError::Persistence(format!("corrupt trade payload: {e}")))?;
            trades.push(trade);
        }
        Ok(trades)
    }

    fn load_payload<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, EngineError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT payload_json FROM {table} WHERE id = ?1");
        let payload: Option<String> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .map(Some)
            .or_else(|e| {
                if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                    Ok(None)
                } else {
                    Err(e)
                }
            })
            .map_err(|e: rusqlite::Error| EngineError::Persistence(e.to_string()))?;

        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| EngineError::Persistence(format!("corrupt {table} payload: {e}"))),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Retry machinery
    // -------------------------------------------------------------------------

    /// Run `write` with bounded retries. After exhaustion the record lands in
    /// the emergency journal and a persistence error propagates.
    fn with_retry<R: Serialize>(
        &self,
        operation: &str,
        record: &R,
        write: impl Fn(&Connection) -> rusqlite::Result<()>,
    ) -> Result<(), EngineError> {
        let mut last_error = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            let result = {
                let conn = self.conn.lock();
                write(&conn)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    bump(&self.counters.persistence_retries);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = RETRY_ATTEMPTS,
                        error = %e,
                        "persistence write failed"
                    );
                    last_error = Some(e);
                    if attempt < RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_BACKOFF);
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.journal_record(operation, record);
        error!(
            operation,
            error = %reason,
            "persistence retries exhausted; record journaled"
        );
        Err(EngineError::Persistence(format!(
            "{operation} failed after {RETRY_ATTEMPTS} attempts: {reason}"
        )))
    }

    /// Best-effort flush of an unwritable record to the on-disk journal.
    fn journal_record<R: Serialize>(&self, operation: &str, record: &R) {
        let line = serde_json::json!({
            "operation": operation,
            "at": chrono::Utc::now().to_rfc3339(),
            "record": record,
        });
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            error!(path = %self.journal_path.display(), error = %e, "emergency journal write failed");
        }
    }
}

fn to_payload<T: Serialize>(record: &T) -> Result<String, EngineError> {
    serde_json::to_string(record)
        .map_err(|e| EngineError::Persistence(format!("serialisation failed: {e}")))
}
