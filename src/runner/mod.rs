//! 协调器
//!
//! 持有全部共享状态（`CoordinatorState`），并以若干独立的周期任务驱动系统：
//!
//! | 任务 | 周期 | 作用 |
//! |---|---|---|
//! | candle_tick | 1s | 从适配器缓存推进K线聚合，到点强制收盘 |
//! | candle_flush | 1s | 待落库K线批量写入存储 |
//! | subscription_check | 30s | 订阅对账 |
//! | alert_check | 1s | 条件单触发检查 |
//! | scheduler | 2s | 周期边界上的机器人定时运行 |
//! | event_loop | - | 入站事件路由 |
//!
//! 每个任务都是 `select!` 关闭信号与 `interval`（`MissedTickBehavior::Skip`）。

pub mod alerts;
pub mod lifecycle;
pub mod scheduler;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::common::events::{EventBus, InboundEvent, RobotCommand};
use crate::common::store::Store;
use crate::common::{AppError, Result, RunnerConfig};
use crate::exwatcher::SubscriptionManager;
use crate::market::aggregator::CandleAggregator;
use crate::market::feed::{FeedAdapter, FeedKind};
use crate::robot::registry::RobotRegistry;
use crate::robot::worker_pool::StrategyWorkerPool;

pub use alerts::AlertBook;
pub use scheduler::RunScheduler;

#[cfg(test)]
mod tests;

/// 协调器拥有的全部可变集合
pub struct CoordinatorState {
    /// 工作K线、滚动窗口与最新价
    pub aggregator: Arc<RwLock<CandleAggregator>>,
    pub alerts: Mutex<AlertBook>,
    pub robots: RobotRegistry,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 节拍滞后时间，给晚到的成交留一秒
const TICK_LAG_MS: i64 = 1000;

/// 聚合节拍的时间：取整到秒再滞后一秒，整分钟的节拍才会触发强制收盘
pub fn tick_date(now: i64) -> i64 {
    now.div_euclid(1000) * 1000 - TICK_LAG_MS
}

pub struct Coordinator {
    config: Arc<RunnerConfig>,
    state: Arc<CoordinatorState>,
    feed: Arc<dyn FeedAdapter>,
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    pool: Arc<StrategyWorkerPool>,
    exwatcher: SubscriptionManager,
    scheduler: Mutex<RunScheduler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Coordinator {
    pub fn new(
        config: RunnerConfig,
        feed: Arc<dyn FeedAdapter>,
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        pool: Arc<StrategyWorkerPool>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if feed.exchange() != config.exchange {
            return Err(AppError::ConfigError(format!(
                "行情适配器交易所 {} 与配置 {} 不一致",
                feed.exchange(),
                config.exchange
            )));
        }

        let aggregator = Arc::new(RwLock::new(CandleAggregator::new(
            config.timeframes()?,
            config.feed.window_size,
        )));
        let exwatcher = SubscriptionManager::new(feed.clone(), store.clone(), bus.clone(), aggregator.clone())
            .with_import_timeout_minutes(config.feed.import_stuck_minutes)
            .with_history_limit(config.feed.window_size);
        let scheduler = RunScheduler::new(config.scheduler.settle_delay_ms as i64);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            state: Arc::new(CoordinatorState {
                aggregator,
                alerts: Mutex::new(AlertBook::new()),
                robots: RobotRegistry::new(),
            }),
            config: Arc::new(config),
            feed,
            store,
            bus,
            pool,
            exwatcher,
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> &Arc<CoordinatorState> {
        &self.state
    }

    pub fn exwatcher(&self) -> &SubscriptionManager {
        &self.exwatcher
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// 恢复订阅、订阅配置中的品种并启动全部周期任务
    pub async fn start(self: &Arc<Self>, inbound: mpsc::Receiver<InboundEvent>) -> Result<()> {
        let now = now_ms();
        self.exwatcher.resubscribe(now).await?;
        for (asset, currency) in self.config.market_pairs()? {
            self.exwatcher
                .add_subscription(&self.config.exchange, &asset, &currency, now)
                .await;
        }

        let feed_cfg = &self.config.feed;
        let sched_cfg = &self.config.scheduler;
        let mut tasks = self.tasks.lock().await;

        let me = self.clone();
        tasks.push((
            "candle_tick",
            tokio::spawn(run_periodic(
                "candle_tick",
                Duration::from_millis(feed_cfg.tick_interval_ms),
                self.shutdown_tx.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        if let Err(e) = me.tick(tick_date(now_ms())).await {
                            tracing::event!(target: "K线聚合", tracing::Level::ERROR, error.summary = e.get_error_type_summary(), error.details = %e, "K线节拍失败");
                        }
                    }
                },
            )),
        ));

        let me = self.clone();
        tasks.push((
            "candle_flush",
            tokio::spawn(run_periodic(
                "candle_flush",
                Duration::from_millis(feed_cfg.tick_interval_ms),
                self.shutdown_tx.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        me.flush().await;
                    }
                },
            )),
        ));

        let me = self.clone();
        tasks.push((
            "subscription_check",
            tokio::spawn(run_periodic(
                "subscription_check",
                Duration::from_secs(feed_cfg.check_interval_s),
                self.shutdown_tx.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        me.exwatcher.check(now_ms()).await;
                    }
                },
            )),
        ));

        let me = self.clone();
        tasks.push((
            "alert_check",
            tokio::spawn(run_periodic(
                "alert_check",
                Duration::from_millis(sched_cfg.alert_check_interval_ms),
                self.shutdown_tx.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        me.check_alerts(now_ms()).await;
                    }
                },
            )),
        ));

        let me = self.clone();
        tasks.push((
            "scheduler",
            tokio::spawn(run_periodic(
                "scheduler",
                Duration::from_millis(sched_cfg.check_interval_ms),
                self.shutdown_tx.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        me.run_scheduler(now_ms()).await;
                    }
                },
            )),
        ));

        let me = self.clone();
        tasks.push((
            "event_loop",
            tokio::spawn(me.run_event_loop(inbound, self.shutdown_tx.subscribe())),
        ));

        info!(target: "应用生命周期", log_type = "low_freq", exchange = %self.config.exchange, tasks = tasks.len(), "协调器已启动");
        Ok(())
    }

    /// 一个聚合节拍：读取适配器缓存、折叠进工作K线，并强制收盘到期周期
    pub async fn tick(&self, date: i64) -> Result<usize> {
        let markets = self.state.aggregator.read().await.markets();

        match self.feed.kind() {
            FeedKind::PushOhlcv => {
                let timeframes = self.state.aggregator.read().await.timeframes().to_vec();
                let mut updates = Vec::with_capacity(markets.len() * timeframes.len());
                for market in &markets {
                    for &tf in &timeframes {
                        let buckets = self.feed.ohlcv_buckets(market, tf).await;
                        if !buckets.is_empty() {
                            updates.push((market, tf, buckets));
                        }
                    }
                }
                let mut aggregator = self.state.aggregator.write().await;
                for (market, tf, buckets) in updates {
                    aggregator.apply_ohlcv(market, date, tf, &buckets);
                }
            }
            FeedKind::TradeTick => {
                let lookback = self.config.feed.tick_interval_ms as i64;
                let (from, to) = self.state.aggregator.write().await.trade_slice(date, lookback);
                let mut batches = Vec::with_capacity(markets.len());
                for market in &markets {
                    batches.push((market, self.feed.trades_between(market, from, to).await));
                }
                let mut aggregator = self.state.aggregator.write().await;
                for (market, trades) in batches {
                    aggregator.apply_trades(market, date, &trades);
                }
            }
        }

        let closed = {
            let mut aggregator = self.state.aggregator.write().await;
            aggregator.close_due(date);
            aggregator.take_closed()
        };
        if !closed.is_empty() {
            debug!(target: "K线聚合", date, closed = closed.len(), "本节拍K线收盘");
        }
        Ok(closed.len())
    }

    /// 待落库K线写入存储；写入失败时记录并丢弃这一批
    pub async fn flush(&self) -> usize {
        let pending = self.state.aggregator.write().await.drain_pending();
        if pending.is_empty() {
            return 0;
        }
        match self.store.upsert_candles(&pending).await {
            Ok(written) => written,
            Err(e) => {
                error!(
                    target: "持久化",
                    dropped = pending.len(),
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "K线批量写入失败"
                );
                0
            }
        }
    }

    /// 入站事件分发
    pub async fn handle_inbound(&self, event: InboundEvent, now: i64) {
        let outcome = match event {
            InboundEvent::RobotStatus { robot_id, status } => match status {
                RobotCommand::Starting => self.start_robot(&robot_id, now).await,
                RobotCommand::Stopping => self.stop_robot(&robot_id).await,
            },
            InboundEvent::SubscriptionCheck => {
                self.exwatcher.check(now).await;
                Ok(())
            }
            InboundEvent::MarketSubscribe {
                exchange,
                asset,
                currency,
            } => {
                self.exwatcher.add_subscription(&exchange, &asset, &currency, now).await;
                Ok(())
            }
            InboundEvent::MarketUnsubscribe {
                exchange,
                asset,
                currency,
            } => {
                if exchange == self.config.exchange {
                    self.exwatcher.remove_subscription(&asset, &currency).await
                } else {
                    Ok(())
                }
            }
            InboundEvent::ImporterStatus { id, status } => {
                match self.exwatcher.on_importer_event(&id, &status, now).await {
                    Ok(Some(market)) => self.load_market_robots(&market).await.map(|_| ()),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = outcome {
            tracing::event!(
                target: "应用生命周期",
                tracing::Level::ERROR,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "入站事件处理失败"
            );
        }
    }

    #[instrument(target = "应用生命周期", skip_all, name = "event_loop")]
    async fn run_event_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                },
                maybe = inbound.recv() => match maybe {
                    Some(event) => self.handle_inbound(event, now_ms()).await,
                    None => {
                        warn!(target: "应用生命周期", "入站事件通道已关闭");
                        break;
                    }
                },
            }
        }
        debug!(target: "应用生命周期", "事件循环已退出");
    }

    /// 优雅关闭：停止周期任务、取消订阅、等待宽限期、落库剩余K线、回收工作池
    pub async fn shutdown(&self) {
        info!(target: "应用生命周期", log_type = "low_freq", "开始关闭协调器");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<(&'static str, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock().await);
        for (task, handle) in tasks {
            if let Err(e) = handle.await {
                error!(target: "应用生命周期", task, panic = ?e, "周期任务在退出时发生 panic");
            }
        }

        self.exwatcher.unsubscribe_all().await;
        self.feed.unwatch_all().await;

        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_period_s);
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        let flushed = self.flush().await;
        self.pool.shutdown().await;
        info!(target: "应用生命周期", log_type = "low_freq", flushed, "协调器已关闭");
    }
}

/// 周期任务骨架：每个 `interval` 节拍执行一次 `tick`，收到关闭信号后退出
async fn run_periodic<F, Fut>(task: &'static str, period: Duration, mut shutdown_rx: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(target: "应用生命周期", task, period_ms = period.as_millis() as u64, "周期任务已启动");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            },
            _ = interval.tick() => tick().await,
        }
    }
    debug!(target: "应用生命周期", task, "周期任务已退出");
}
