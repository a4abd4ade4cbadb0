//! 订阅管理（Exwatcher）
//!
//! 每个品种一条订阅记录，状态机：
//! pending → importing（请求历史回补）→ subscribed；importing 超时或回补失败 → failed；
//! 订阅时的非重试类错误 → failed；关闭时 → unsubscribed；显式移除时删除。
//!
//! 订阅表由一把 `Mutex` 保护，所有网络调用都在锁外进行。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::common::backoff::{retry_feed, RetryPolicy};
use crate::common::config::constants::{CANDLE_WINDOW_SIZE, IMPORT_STUCK_MINUTES};
use crate::common::events::{DomainEvent, EventBus, ImporterStatus, IMPORT_TYPE_RECENT};
use crate::common::store::Store;
use crate::common::{AppError, Result};
use crate::market::aggregator::CandleAggregator;
use crate::market::feed::{FeedAdapter, FeedError, FeedKind};
use crate::market::models::{Candle, Market};
use crate::market::timeframe::{self, Timeframe, MINUTE_MS};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Importing,
    Subscribed,
    Unsubscribed,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Importing => "importing",
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Unsubscribed => "unsubscribed",
            SubscriptionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubscriptionStatus::Pending),
            "importing" => Some(SubscriptionStatus::Importing),
            "subscribed" => Some(SubscriptionStatus::Subscribed),
            "unsubscribed" => Some(SubscriptionStatus::Unsubscribed),
            "failed" => Some(SubscriptionStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// exchange.ASSET.CURRENCY
    pub id: String,
    pub exchange: String,
    pub asset: String,
    pub currency: String,
    pub status: SubscriptionStatus,
    /// 历史导入的关联ID，重新导入时沿用
    pub importer_id: Option<String>,
    pub import_started_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Subscription {
    pub fn new(market: &Market) -> Self {
        Self {
            id: market.id(),
            exchange: market.exchange.clone(),
            asset: market.asset.clone(),
            currency: market.currency.clone(),
            status: SubscriptionStatus::Pending,
            importer_id: None,
            import_started_at: None,
            last_error: None,
        }
    }

    pub fn market(&self) -> Market {
        Market {
            exchange: self.exchange.clone(),
            asset: self.asset.clone(),
            currency: self.currency.clone(),
        }
    }
}

pub struct SubscriptionManager {
    exchange: String,
    feed: Arc<dyn FeedAdapter>,
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    aggregator: Arc<RwLock<CandleAggregator>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    retry: RetryPolicy,
    history_limit: usize,
    import_timeout_ms: i64,
}

impl SubscriptionManager {
    pub fn new(
        feed: Arc<dyn FeedAdapter>,
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        aggregator: Arc<RwLock<CandleAggregator>>,
    ) -> Self {
        Self {
            exchange: feed.exchange().to_string(),
            feed,
            store,
            bus,
            aggregator,
            subscriptions: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            history_limit: CANDLE_WINDOW_SIZE,
            import_timeout_ms: IMPORT_STUCK_MINUTES * MINUTE_MS,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_import_timeout_minutes(mut self, minutes: i64) -> Self {
        self.import_timeout_ms = minutes * MINUTE_MS;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn get(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.lock().await.get(id).cloned()
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.subscriptions.lock().await.values().cloned().collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        subs
    }

    /// 启动时重新接入存储中本交易所的全部订阅
    #[instrument(target = "订阅管理", skip_all, fields(exchange = %self.exchange))]
    pub async fn resubscribe(&self, now: i64) -> Result<usize> {
        let stored = self.store.load_subscriptions(&self.exchange).await?;
        let count = stored.len();
        {
            let mut table = self.subscriptions.lock().await;
            for sub in &stored {
                table.entry(sub.id.clone()).or_insert_with(|| sub.clone());
            }
        }
        for sub in stored {
            self.add_subscription(&sub.exchange, &sub.asset, &sub.currency, now).await;
        }
        info!(target: "订阅管理", log_type = "low_freq", count, "已恢复持久化订阅");
        Ok(count)
    }

    /// 请求订阅一个品种：先发起历史回补，回补完成后再打开实时行情
    pub async fn add_subscription(&self, exchange: &str, asset: &str, currency: &str, now: i64) {
        if exchange != self.exchange {
            debug!(target: "订阅管理", exchange, own = %self.exchange, "忽略其他交易所的订阅请求");
            return;
        }
        let market = Market::new(exchange, asset, currency);

        let (snapshot, event) = {
            let mut table = self.subscriptions.lock().await;
            let sub = table
                .entry(market.id())
                .or_insert_with(|| Subscription::new(&market));

            match sub.status {
                SubscriptionStatus::Subscribed => return,
                SubscriptionStatus::Importing
                    if sub.import_started_at.map_or(false, |t| now - t <= self.import_timeout_ms) =>
                {
                    return
                }
                _ => {}
            }

            sub.status = SubscriptionStatus::Pending;
            let importer_id = sub
                .importer_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            sub.importer_id = Some(importer_id.clone());
            sub.status = SubscriptionStatus::Importing;
            sub.import_started_at = Some(now);

            let event = DomainEvent::ImporterStart {
                id: importer_id,
                exchange: sub.exchange.clone(),
                asset: sub.asset.clone(),
                currency: sub.currency.clone(),
                import_type: IMPORT_TYPE_RECENT.to_string(),
            };
            (sub.clone(), event)
        };

        info!(
            target: "订阅管理",
            subscription = %snapshot.id,
            importer_id = ?snapshot.importer_id,
            "请求历史回补"
        );
        self.persist(&snapshot).await;
        self.bus.emit(event);
    }

    /// 周期对账：卡住的导入判为失败，失败/未订阅的重新回补，已订阅的重新确认行情流
    #[instrument(target = "订阅管理", skip_all)]
    pub async fn check(&self, now: i64) {
        let mut timed_out = Vec::new();
        let mut to_add = Vec::new();
        let mut to_rewatch = Vec::new();
        {
            let mut table = self.subscriptions.lock().await;
            for sub in table.values_mut() {
                if sub.status == SubscriptionStatus::Importing
                    && sub.import_started_at.map_or(true, |t| now - t > self.import_timeout_ms)
                {
                    warn!(target: "订阅管理", subscription = %sub.id, started_at = ?sub.import_started_at, "历史导入超时");
                    sub.status = SubscriptionStatus::Failed;
                    sub.last_error = Some("import timeout".to_string());
                    timed_out.push(sub.clone());
                }
                match sub.status {
                    SubscriptionStatus::Pending | SubscriptionStatus::Unsubscribed | SubscriptionStatus::Failed => {
                        to_add.push(sub.market())
                    }
                    SubscriptionStatus::Subscribed => to_rewatch.push(sub.id.clone()),
                    SubscriptionStatus::Importing => {}
                }
            }
        }

        for sub in &timed_out {
            self.persist(sub).await;
        }
        for market in to_add {
            self.add_subscription(&market.exchange, &market.asset, &market.currency, now)
                .await;
        }
        for id in to_rewatch {
            let Some(market) = self.get(&id).await.map(|s| s.market()) else {
                continue;
            };
            if let Err(e) = self.watch(&market).await {
                self.mark_failed(&id, &e).await;
            }
        }
    }

    /// 打开实时行情。成功时转为 subscribed 并用存储中截至 `now` 已收盘的历史K线初始化聚合窗口。
    #[instrument(target = "订阅管理", skip(self))]
    pub async fn subscribe(&self, id: &str, now: i64) -> Result<bool> {
        let market = self
            .get(id)
            .await
            .map(|s| s.market())
            .ok_or_else(|| AppError::NotFound(format!("subscription {}", id)))?;

        let current = match self.open_feed(&market).await {
            Ok(current) => current,
            Err(e) => {
                self.mark_failed(id, &e).await;
                return Ok(false);
            }
        };

        let snapshot = {
            let mut table = self.subscriptions.lock().await;
            let Some(sub) = table.get_mut(id) else {
                // 订阅期间被移除
                return Ok(false);
            };
            sub.status = SubscriptionStatus::Subscribed;
            sub.import_started_at = None;
            sub.last_error = None;
            sub.clone()
        };
        self.persist(&snapshot).await;

        let timeframes = self.aggregator.read().await.timeframes().to_vec();
        let mut history = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            // 存储中进行中的K线不进入窗口
            let until = timeframe::prev_since(now, tf);
            let candles = self.store.load_candles(&market, tf, until, self.history_limit).await?;
            history.push((tf, candles));
        }

        let loaded: usize = history.iter().map(|(_, c)| c.len()).sum();
        {
            let mut aggregator = self.aggregator.write().await;
            aggregator.add_market(&market);
            for (tf, candles) in history {
                aggregator.load_history(&market, tf, candles);
            }
            for candle in current {
                aggregator.seed_working(candle);
            }
        }

        info!(target: "订阅管理", subscription = %id, history_candles = loaded, "订阅成功");
        Ok(true)
    }

    /// 导入服务回报。导入完成并订阅成功时返回该品种，调用方据此加载机器人。
    pub async fn on_importer_event(&self, importer_id: &str, status: &ImporterStatus, now: i64) -> Result<Option<Market>> {
        let found = {
            let table = self.subscriptions.lock().await;
            table
                .values()
                .find(|s| s.importer_id.as_deref() == Some(importer_id))
                .map(|s| (s.id.clone(), s.status, s.market()))
        };
        let Some((id, current_status, market)) = found else {
            warn!(target: "订阅管理", importer_id, "未找到与导入ID对应的订阅");
            return Ok(None);
        };

        match status {
            ImporterStatus::Finished => {
                if current_status != SubscriptionStatus::Importing {
                    debug!(target: "订阅管理", subscription = %id, status = current_status.as_str(), "订阅不在导入中，忽略导入完成");
                    return Ok(None);
                }
                Ok(self.subscribe(&id, now).await?.then_some(market))
            }
            ImporterStatus::Failed { error } => {
                let snapshot = {
                    let mut table = self.subscriptions.lock().await;
                    let Some(sub) = table.get_mut(&id) else {
                        return Ok(None);
                    };
                    sub.status = SubscriptionStatus::Failed;
                    sub.last_error = Some(error.clone());
                    sub.clone()
                };
                warn!(target: "订阅管理", subscription = %id, %error, "历史导入失败");
                self.persist(&snapshot).await;
                Ok(None)
            }
        }
    }

    /// 移除订阅：关闭行情、清理聚合状态并删除记录
    pub async fn remove_subscription(&self, asset: &str, currency: &str) -> Result<()> {
        let market = Market::new(&self.exchange, asset, currency);
        let id = market.id();
        self.subscriptions.lock().await.remove(&id);
        self.feed.unwatch(&market).await;
        self.aggregator.write().await.remove_market(&market);
        self.store.delete_subscription(&id).await?;
        info!(target: "订阅管理", subscription = %id, "订阅已移除");
        Ok(())
    }

    /// 关闭时全部转为 unsubscribed，记录保留
    pub async fn unsubscribe_all(&self) {
        let snapshots: Vec<Subscription> = {
            let mut table = self.subscriptions.lock().await;
            table
                .values_mut()
                .map(|sub| {
                    sub.status = SubscriptionStatus::Unsubscribed;
                    sub.clone()
                })
                .collect()
        };
        for sub in &snapshots {
            self.feed.unwatch(&sub.market()).await;
            self.persist(sub).await;
        }
        info!(target: "订阅管理", count = snapshots.len(), "全部订阅已取消");
    }

    /// 只打开行情流
    async fn watch(&self, market: &Market) -> std::result::Result<(), FeedError> {
        let feed = &self.feed;
        match feed.kind() {
            FeedKind::PushOhlcv => {
                let timeframes = self.aggregator.read().await.timeframes().to_vec();
                for tf in timeframes {
                    retry_feed(&self.retry, "watch_ohlcv", move || feed.watch_ohlcv(market, tf)).await?;
                }
            }
            FeedKind::TradeTick => {
                retry_feed(&self.retry, "watch_trades", move || feed.watch_trades(market)).await?;
            }
        }
        Ok(())
    }

    /// 打开行情流；逐笔成交交易所还要拉取每个周期的当前K线作为种子
    async fn open_feed(&self, market: &Market) -> std::result::Result<Vec<Candle>, FeedError> {
        self.watch(market).await?;
        if self.feed.kind() == FeedKind::PushOhlcv {
            return Ok(Vec::new());
        }

        let feed = &self.feed;
        let timeframes: Vec<Timeframe> = self.aggregator.read().await.timeframes().to_vec();
        let mut current = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            let candle = retry_feed(&self.retry, "get_current_candle", move || feed.get_current_candle(market, tf)).await?;
            current.push(candle);
        }
        Ok(current)
    }

    async fn mark_failed(&self, id: &str, e: &FeedError) {
        let snapshot = {
            let mut table = self.subscriptions.lock().await;
            let Some(sub) = table.get_mut(id) else {
                return;
            };
            sub.status = SubscriptionStatus::Failed;
            sub.last_error = Some(e.to_string());
            sub.clone()
        };

        let err = AppError::from(e.clone());
        error!(
            target: "订阅管理",
            subscription = %id,
            error.summary = err.get_error_type_summary(),
            error.details = %err,
            "订阅失败"
        );
        self.persist(&snapshot).await;
        self.bus.emit(DomainEvent::ExwatcherError {
            exchange: snapshot.exchange.clone(),
            asset: snapshot.asset.clone(),
            currency: snapshot.currency.clone(),
            error: e.to_string(),
        });
    }

    async fn persist(&self, sub: &Subscription) {
        if let Err(e) = self.store.upsert_subscription(sub).await {
            error!(
                target: "持久化",
                subscription = %sub.id,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "保存订阅状态失败"
            );
        }
    }
}
