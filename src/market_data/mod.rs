pub mod feed;
pub mod orderbook;
pub mod window;

pub use feed::{MarketDataFeed, Quote, QuoteProvider};
pub use orderbook::{EntrySignal, OrderBookIntelligence, OrderBookManager, OrderBookSnapshot};
pub use window::PriceWindow;
