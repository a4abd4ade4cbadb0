//! 内存线路客户端，用于回放与测试
//!
//! 不连接任何交易所：打开的流只被记录下来，数据通过 `publish_*` 注入，
//! 失败通过 `fail_next` 预先编排。

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

use super::{FeedError, FeedSink, MarketTransport, StreamRequest};
use crate::market::models::{Market, OhlcvBucket, Trade};
use crate::market::timeframe::Timeframe;

#[derive(Default)]
struct MemoryState {
    failures: VecDeque<FeedError>,
    candles: HashMap<(String, Timeframe), OhlcvBucket>,
    opened: HashMap<String, HashSet<StreamRequest>>,
    sinks: HashMap<String, FeedSink>,
    open_calls: usize,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的若干次调用依次返回这些错误
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = FeedError>) {
        self.state.lock().await.failures.extend(errors);
    }

    pub async fn set_candle(&self, market: &Market, tf: Timeframe, bucket: OhlcvBucket) {
        self.state.lock().await.candles.insert((market.symbol(), tf), bucket);
    }

    pub async fn is_open(&self, market: &Market, request: StreamRequest) -> bool {
        self.state
            .lock()
            .await
            .opened
            .get(&market.symbol())
            .map(|s| s.contains(&request))
            .unwrap_or(false)
    }

    pub async fn open_calls(&self) -> usize {
        self.state.lock().await.open_calls
    }

    pub async fn publish_trade(&self, market: &Market, trade: Trade) {
        let sink = self.state.lock().await.sinks.get(&market.symbol()).cloned();
        if let Some(sink) = sink {
            sink.push_trade(&market.symbol(), trade).await;
        }
    }

    pub async fn publish_ohlcv(&self, market: &Market, tf: Timeframe, bucket: OhlcvBucket) {
        let sink = self.state.lock().await.sinks.get(&market.symbol()).cloned();
        if let Some(sink) = sink {
            sink.push_ohlcv(&market.symbol(), tf, bucket).await;
        }
    }
}

#[async_trait]
impl MarketTransport for MemoryTransport {
    async fn open_stream(&self, market: &Market, request: StreamRequest, sink: FeedSink) -> Result<(), FeedError> {
        let mut state = self.state.lock().await;
        state.open_calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let symbol = market.symbol();
        state.opened.entry(symbol.clone()).or_default().insert(request);
        state.sinks.insert(symbol, sink);
        Ok(())
    }

    async fn fetch_candle(&self, market: &Market, tf: Timeframe) -> Result<OhlcvBucket, FeedError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state
            .candles
            .get(&(market.symbol(), tf))
            .copied()
            .ok_or_else(|| FeedError::Exchange(format!("no candle for {} {}", market.symbol(), tf)))
    }

    async fn close_market(&self, market: &Market) {
        let mut state = self.state.lock().await;
        state.opened.remove(&market.symbol());
        state.sinks.remove(&market.symbol());
    }

    async fn close_all(&self) {
        let mut state = self.state.lock().await;
        state.opened.clear();
        state.sinks.clear();
    }
}
