pub mod broker;
pub mod lifecycle;

pub use broker::{AccountInfo, BrokerAdapter, OrderAck, OrderRequest, PaperBroker};
pub use lifecycle::{Position, PositionStatus, Trade, TradeLifecycleManager, TradingSession};
