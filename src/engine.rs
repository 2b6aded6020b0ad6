// =============================================================================
// Strategy Execution Engine — tick fan-out over the strategy registry
// =============================================================================
//
// Single long-running control loop. On each tick:
//   1. Append the tick to the symbol's price window (evicting the oldest).
//   2. Evaluate every strategy registered for the symbol; evaluations for
//      distinct strategies are independent and run concurrently.
//   3. Publish every resulting signal (HOLD included) to the bounded signal
//      queue.
//
// Signals derived from the same tick share the tick's timestamp; across
// ticks, signal timestamps are monotonic per symbol (the window rejects
// out-of-order ticks).
//
// Backpressure: the queue is bounded. Overflow drops the oldest HOLD signal
// first; non-HOLD signals are retained and every drop is counted.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::counters::{bump, Counters};
use crate::market_data::PriceWindow;
use crate::strategies::{StrategyRegistry, TechnicalSignal};
use crate::types::{Action, Tick};

// ---------------------------------------------------------------------------
// Signal queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<TechnicalSignal>,
    closed: bool,
}

/// Bounded signal channel between the execution engine and signal fusion.
pub struct SignalQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    counters: Arc<Counters>,
}

impl SignalQueue {
    pub fn new(capacity: usize, counters: Arc<Counters>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            counters,
        }
    }

    /// Publish a signal, applying the overflow policy when full.
    pub fn push(&self, signal: TechnicalSignal) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            while state.queue.len() >= self.capacity {
                if let Some(pos) = state.queue.iter().position(|s| s.action == Action::Hold) {
                    state.queue.remove(pos);
                    bump(&self.counters.signals_dropped);
                } else if signal.action == Action::Hold {
                    // Queue full of non-HOLD work; the incoming HOLD loses.
                    bump(&self.counters.signals_dropped);
                    return;
                } else {
                    // Full of non-HOLD signals: drop the oldest to keep the
                    // queue bounded.
                    state.queue.pop_front();
                    bump(&self.counters.signals_dropped);
                }
            }

            state.queue.push_back(signal);
        }
        self.notify.notify_one();
    }

    /// Wait for the next signal. Returns `None` once the queue is closed and
    /// drained, which is the consumer's signal to stop.
    pub async fn pop(&self) -> Option<TechnicalSignal> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(signal) = state.queue.pop_front() {
                    return Some(signal);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue: producers become no-ops, consumers drain then stop.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The tick-driven strategy execution engine. Owns every price window.
pub struct ExecutionEngine {
    registry: Arc<StrategyRegistry>,
    queue: Arc<SignalQueue>,
    counters: Arc<Counters>,
    windows: HashMap<String, PriceWindow>,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        queue: Arc<SignalQueue>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            registry,
            queue,
            counters,
            windows: HashMap::new(),
        }
    }

    /// Process one tick: window update plus concurrent strategy evaluation.
    pub async fn on_tick(&mut self, tick: Tick) {
        let symbol = tick.symbol.clone();
        let capacity = self.registry.max_lookback(&symbol);

        let window = self
            .windows
            .entry(symbol.clone())
            .or_insert_with(|| PriceWindow::new(capacity));
        window.ensure_capacity(capacity);

        if !window.push(tick) {
            bump(&self.counters.recovered_errors);
            return;
        }

        let strategies = self.registry.for_symbol(&symbol);
        if strategies.is_empty() {
            return;
        }

        // Readers get a snapshot; the window itself stays single-writer.
        let snapshot: Arc<Vec<Tick>> = Arc::new(window.snapshot());

        let mut tasks = JoinSet::new();
        for strategy in strategies {
            let snapshot = Arc::clone(&snapshot);
            let symbol = symbol.clone();
            tasks.spawn(async move { strategy.lock().evaluate(&symbol, &snapshot) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(signal) => {
                    bump(&self.counters.signals_published);
                    debug!(
                        strategy_id = %signal.strategy_id,
                        symbol = %signal.symbol,
                        action = %signal.action,
                        confidence = signal.confidence,
                        "technical signal"
                    );
                    self.queue.push(signal);
                }
                Err(e) => {
                    bump(&self.counters.recovered_errors);
                    warn!(symbol = %symbol, error = %e, "strategy evaluation task failed");
                }
            }
        }
    }

    /// Run until the tick stream closes or shutdown is signalled, then close
    /// the signal queue so the fusion consumer can drain.
    pub async fn run(
        mut self,
        mut ticks: broadcast::Receiver<Tick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(strategies = self.registry.len(), "strategy execution engine started");

        loop {
            tokio::select! {
                received = ticks.recv() => match received {
                    Ok(tick) => self.on_tick(tick).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        bump(&self.counters.recovered_errors);
                        warn!(skipped, "tick subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.queue.close();
        info!("strategy execution engine stopped; signal queue closed");
    }
}
