//! 行情适配层
//!
//! 交易所按能力分为两类：推送OHLCV（交易所自己聚合K线）与逐笔成交（由本服务聚合）。
//! 两类各有一个 `FeedAdapter` 实现，启动时按交易所标识选择。真正的线路协议客户端
//! 藏在 `MarketTransport` 之后，它把收到的数据写入共享的 `FeedSink` 缓存。

pub mod binance;
pub mod memory;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::market::models::{Candle, CandleKind, Market, OhlcvBucket, Trade};
use crate::market::timeframe::Timeframe;

#[cfg(test)]
mod tests;

/// 推送OHLCV的交易所
pub const PUSH_OHLCV_EXCHANGES: &[&str] = &["binance_futures"];

/// 只提供逐笔成交的交易所
pub const TRADE_TICK_EXCHANGES: &[&str] = &["binance_spot", "bitfinex", "kraken", "kucoin", "huobipro"];

/// 每个 品种×周期 缓存的K线桶数量
const OHLCV_CACHE_LEN: usize = 10;

/// 逐笔成交缓存保留时长（毫秒）
const TRADE_RETENTION_MS: i64 = 10 * 60_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// 网络类错误，可退避重试
    #[error("network error: {0}")]
    Network(String),

    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    PushOhlcv,
    TradeTick,
}

pub fn feed_kind_for(exchange: &str) -> Result<FeedKind, FeedError> {
    if PUSH_OHLCV_EXCHANGES.contains(&exchange) {
        Ok(FeedKind::PushOhlcv)
    } else if TRADE_TICK_EXCHANGES.contains(&exchange) {
        Ok(FeedKind::TradeTick)
    } else {
        Err(FeedError::UnsupportedExchange(exchange.to_string()))
    }
}

/// 线路协议客户端需要打开的流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRequest {
    Ohlcv(Timeframe),
    Trades,
}

#[derive(Default)]
struct FeedCache {
    ohlcv: HashMap<(String, Timeframe), VecDeque<OhlcvBucket>>,
    trades: HashMap<String, VecDeque<Trade>>,
}

/// 线路客户端写入、适配器读取的共享缓存，以交易对符号（ASSET/CURRENCY）为键
#[derive(Clone, Default)]
pub struct FeedSink {
    inner: Arc<RwLock<FeedCache>>,
}

impl FeedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入或替换一个K线桶
    pub async fn push_ohlcv(&self, symbol: &str, tf: Timeframe, bucket: OhlcvBucket) {
        let mut cache = self.inner.write().await;
        let buckets = cache.ohlcv.entry((symbol.to_string(), tf)).or_default();
        match buckets.back() {
            Some(last) if last.time == bucket.time => {
                buckets.pop_back();
                buckets.push_back(bucket);
            }
            Some(last) if last.time > bucket.time => {
                if let Some(slot) = buckets.iter_mut().find(|b| b.time == bucket.time) {
                    *slot = bucket;
                }
            }
            _ => buckets.push_back(bucket),
        }
        while buckets.len() > OHLCV_CACHE_LEN {
            buckets.pop_front();
        }
    }

    pub async fn push_trade(&self, symbol: &str, trade: Trade) {
        let mut cache = self.inner.write().await;
        let trades = cache.trades.entry(symbol.to_string()).or_default();
        trades.push_back(trade);
        let horizon = trade.timestamp - TRADE_RETENTION_MS;
        while matches!(trades.front(), Some(t) if t.timestamp < horizon) {
            trades.pop_front();
        }
    }

    pub async fn ohlcv(&self, symbol: &str, tf: Timeframe) -> Vec<OhlcvBucket> {
        let cache = self.inner.read().await;
        cache
            .ohlcv
            .get(&(symbol.to_string(), tf))
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 时间落在 [from, to) 内的成交
    pub async fn trades_between(&self, symbol: &str, from: i64, to: i64) -> Vec<Trade> {
        let cache = self.inner.read().await;
        cache
            .trades
            .get(symbol)
            .map(|t| t.iter().filter(|t| t.timestamp >= from && t.timestamp < to).copied().collect())
            .unwrap_or_default()
    }

    pub async fn forget(&self, symbol: &str) {
        let mut cache = self.inner.write().await;
        cache.ohlcv.retain(|(s, _), _| s != symbol);
        cache.trades.remove(symbol);
    }
}

/// 交易所线路协议客户端
#[async_trait]
pub trait MarketTransport: Send + Sync {
    /// 打开实时流并把数据写入 `sink`，对已打开的流幂等
    async fn open_stream(&self, market: &Market, request: StreamRequest, sink: FeedSink) -> Result<(), FeedError>;

    /// 拉取当前进行中的K线
    async fn fetch_candle(&self, market: &Market, tf: Timeframe) -> Result<OhlcvBucket, FeedError>;

    /// 关闭某个品种的全部流
    async fn close_market(&self, market: &Market);

    async fn close_all(&self);
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn kind(&self) -> FeedKind;

    fn exchange(&self) -> &str;

    async fn watch_ohlcv(&self, market: &Market, tf: Timeframe) -> Result<(), FeedError>;

    async fn watch_trades(&self, market: &Market) -> Result<(), FeedError>;

    async fn get_current_candle(&self, market: &Market, tf: Timeframe) -> Result<Candle, FeedError>;

    /// 适配器缓存中的K线桶，推送OHLCV形态使用
    async fn ohlcv_buckets(&self, market: &Market, tf: Timeframe) -> Vec<OhlcvBucket>;

    /// 适配器缓存中的成交，逐笔成交形态使用
    async fn trades_between(&self, market: &Market, from: i64, to: i64) -> Vec<Trade>;

    async fn unwatch(&self, market: &Market);

    async fn unwatch_all(&self);
}

pub struct PushOhlcvFeed {
    exchange: String,
    transport: Arc<dyn MarketTransport>,
    sink: FeedSink,
}

impl PushOhlcvFeed {
    pub fn new(exchange: &str, transport: Arc<dyn MarketTransport>) -> Self {
        Self {
            exchange: exchange.to_string(),
            transport,
            sink: FeedSink::new(),
        }
    }
}

#[async_trait]
impl FeedAdapter for PushOhlcvFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::PushOhlcv
    }

    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn watch_ohlcv(&self, market: &Market, tf: Timeframe) -> Result<(), FeedError> {
        self.transport.open_stream(market, StreamRequest::Ohlcv(tf), self.sink.clone()).await
    }

    async fn watch_trades(&self, market: &Market) -> Result<(), FeedError> {
        self.transport.open_stream(market, StreamRequest::Trades, self.sink.clone()).await
    }

    async fn get_current_candle(&self, market: &Market, tf: Timeframe) -> Result<Candle, FeedError> {
        let bucket = self.transport.fetch_candle(market, tf).await?;
        Ok(Candle::from_bucket(market, tf, &bucket, CandleKind::Loaded))
    }

    async fn ohlcv_buckets(&self, market: &Market, tf: Timeframe) -> Vec<OhlcvBucket> {
        self.sink.ohlcv(&market.symbol(), tf).await
    }

    async fn trades_between(&self, _market: &Market, _from: i64, _to: i64) -> Vec<Trade> {
        Vec::new()
    }

    async fn unwatch(&self, market: &Market) {
        self.transport.close_market(market).await;
        self.sink.forget(&market.symbol()).await;
    }

    async fn unwatch_all(&self) {
        self.transport.close_all().await;
    }
}

pub struct TradeTickFeed {
    exchange: String,
    transport: Arc<dyn MarketTransport>,
    sink: FeedSink,
}

impl TradeTickFeed {
    pub fn new(exchange: &str, transport: Arc<dyn MarketTransport>) -> Self {
        Self {
            exchange: exchange.to_string(),
            transport,
            sink: FeedSink::new(),
        }
    }
}

#[async_trait]
impl FeedAdapter for TradeTickFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::TradeTick
    }

    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn watch_ohlcv(&self, _market: &Market, _tf: Timeframe) -> Result<(), FeedError> {
        Err(FeedError::Exchange(format!("{} does not push OHLCV", self.exchange)))
    }

    async fn watch_trades(&self, market: &Market) -> Result<(), FeedError> {
        self.transport.open_stream(market, StreamRequest::Trades, self.sink.clone()).await
    }

    async fn get_current_candle(&self, market: &Market, tf: Timeframe) -> Result<Candle, FeedError> {
        let bucket = self.transport.fetch_candle(market, tf).await?;
        Ok(Candle::from_bucket(market, tf, &bucket, CandleKind::Loaded))
    }

    async fn ohlcv_buckets(&self, _market: &Market, _tf: Timeframe) -> Vec<OhlcvBucket> {
        Vec::new()
    }

    async fn trades_between(&self, market: &Market, from: i64, to: i64) -> Vec<Trade> {
        self.sink.trades_between(&market.symbol(), from, to).await
    }

    async fn unwatch(&self, market: &Market) {
        self.transport.close_market(market).await;
        self.sink.forget(&market.symbol()).await;
    }

    async fn unwatch_all(&self) {
        self.transport.close_all().await;
    }
}

/// 按交易所标识选择适配器，不支持的交易所直接报错
pub fn create_feed(exchange: &str, transport: Arc<dyn MarketTransport>) -> Result<Arc<dyn FeedAdapter>, FeedError> {
    let kind = feed_kind_for(exchange)?;
    info!(target: "行情适配", exchange, ?kind, "行情适配器已创建");
    let feed: Arc<dyn FeedAdapter> = match kind {
        FeedKind::PushOhlcv => Arc::new(PushOhlcvFeed::new(exchange, transport)),
        FeedKind::TradeTick => Arc::new(TradeTickFeed::new(exchange, transport)),
    };
    debug!(target: "行情适配", exchange, "适配器就绪");
    Ok(feed)
}
