pub mod aggregator;
pub mod feed;
pub mod models;
pub mod timeframe;

pub use aggregator::{CandleAggregator, CandleWindow};
pub use feed::{create_feed, FeedAdapter, FeedError, FeedKind, MarketTransport};
pub use models::{Candle, CandleKind, Market, OhlcvBucket, Trade};
pub use timeframe::Timeframe;
