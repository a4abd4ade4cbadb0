use super::scheduler::RunOutcome;
use super::*;
use crate::common::events::{BroadcastEventBus, DomainEvent, ImporterStatus};
use crate::common::store::SqliteStore;
use crate::exwatcher::SubscriptionStatus;
use crate::market::feed::create_feed;
use crate::market::feed::memory::MemoryTransport;
use crate::market::models::{Candle, CandleKind, Market, OhlcvBucket, Trade};
use crate::market::timeframe::Timeframe;
use crate::robot::models::{PositionStatus, RobotState, RobotStatus, SignalType, TradeAction};
use crate::robot::strategy::StrategyRegistry;
use serde_json::json;
use tokio::sync::broadcast;

const T0: i64 = 1_709_251_200_000;
const M5: i64 = 5 * 60_000;

struct Fixture {
    coordinator: Arc<Coordinator>,
    transport: Arc<MemoryTransport>,
    store: Arc<SqliteStore>,
    events: broadcast::Receiver<DomainEvent>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
}

fn test_config(exchange: &str) -> RunnerConfig {
    let mut config = RunnerConfig::for_exchange(exchange);
    config.feed.timeframes = vec![5, 60];
    config.worker_pool.concurrency = 2;
    config.scheduler.shutdown_grace_period_s = 0;
    config
}

fn fixture_with(config: RunnerConfig) -> Fixture {
    let transport = Arc::new(MemoryTransport::new());
    let feed = create_feed(&config.exchange, transport.clone()).unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let (bus, inbound) = BroadcastEventBus::new(256);
    let events = bus.subscribe();
    let pool = Arc::new(StrategyWorkerPool::new(2, Arc::new(StrategyRegistry::with_builtin())).unwrap());
    let coordinator = Coordinator::new(config, feed, store.clone(), Arc::new(bus), pool).unwrap();
    Fixture {
        coordinator,
        transport,
        store,
        events,
        inbound: Some(inbound),
    }
}

fn fixture(exchange: &str) -> Fixture {
    fixture_with(test_config(exchange))
}

fn drain(events: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

fn btc() -> Market {
    Market::new("binance_futures", "BTC", "USDT")
}

fn candle(market: &Market, time: i64, high: f64, low: f64) -> Candle {
    Candle {
        high,
        low,
        volume: 1.0,
        kind: CandleKind::Created,
        ..Candle::flat(market, Timeframe::M5, time, 100.0)
    }
}

/// T0 之前的三根 5m K线，通道上沿 103、下沿 97
async fn seed_history(fx: &Fixture, market: &Market) {
    let history = vec![
        candle(market, T0 - 3 * M5, 101.0, 99.0),
        candle(market, T0 - 2 * M5, 102.0, 98.0),
        candle(market, T0 - M5, 103.0, 97.0),
    ];
    fx.store.upsert_candles(&history).await.unwrap();
}

async fn activate(fx: &Fixture, market: &Market, now: i64) {
    let exwatcher = fx.coordinator.exwatcher();
    exwatcher
        .add_subscription(&market.exchange, &market.asset, &market.currency, now)
        .await;
    let importer_id = exwatcher.get(&market.id()).await.unwrap().importer_id.unwrap();
    fx.coordinator
        .handle_inbound(
            InboundEvent::ImporterStatus {
                id: importer_id,
                status: ImporterStatus::Finished,
            },
            now,
        )
        .await;
    assert_eq!(
        exwatcher.get(&market.id()).await.unwrap().status,
        SubscriptionStatus::Subscribed
    );
}

async fn save_robot(fx: &Fixture, id: &str, strategy: &str, status: RobotStatus) -> RobotState {
    let mut state = RobotState::new(id, &btc(), Timeframe::M5, strategy, json!({ "period": 3 }));
    state.status = status;
    fx.store.save_robot_state(&state).await.unwrap();
    state
}

/// 启动 r1 并在 T0 边界运行一次，挂出 103/97 两个突破条件单
async fn started_with_alerts(fx: &Fixture) {
    seed_history(fx, &btc()).await;
    activate(fx, &btc(), T0 + 1000).await;
    save_robot(fx, "r1", "breakout", RobotStatus::Stopped).await;
    fx.coordinator.start_robot("r1", T0 + 2000).await.unwrap();

    let outcomes = fx.coordinator.run_boundary(T0, &[Timeframe::M5]).await;
    assert_eq!(outcomes, vec![RunOutcome::Executed]);
}

async fn breakout_bar(fx: &Fixture) {
    let bucket = OhlcvBucket {
        time: T0,
        open: 100.0,
        high: 104.0,
        low: 99.5,
        close: 103.5,
        volume: 5.0,
    };
    fx.transport.publish_ohlcv(&btc(), Timeframe::M5, bucket).await;
    fx.coordinator.tick(T0 + 1000).await.unwrap();
}

#[tokio::test]
async fn test_trade_tick_aggregation_through_coordinator() {
    let fx = fixture("kraken");
    let market = Market::new("kraken", "ETH", "USD");
    for tf in [Timeframe::M5, Timeframe::H1] {
        let seed = OhlcvBucket {
            time: T0,
            open: 99.0,
            high: 99.0,
            low: 99.0,
            close: 99.0,
            volume: 0.0,
        };
        fx.transport.set_candle(&market, tf, seed).await;
    }
    activate(&fx, &market, T0).await;

    fx.coordinator.tick(T0 + 1000).await.unwrap();
    for (i, price) in [100.0, 105.0, 98.0].into_iter().enumerate() {
        let trade = Trade {
            amount: 1.0,
            price,
            timestamp: T0 + 1000 * (i as i64 + 1),
        };
        fx.transport.publish_trade(&market, trade).await;
    }
    fx.coordinator.tick(T0 + 4000).await.unwrap();

    // 5m 边界收盘
    let closed = fx.coordinator.tick(T0 + M5).await.unwrap();
    assert_eq!(closed, 1);
    // 空闲的一个周期
    fx.coordinator.tick(T0 + 2 * M5).await.unwrap();

    let aggregator = fx.coordinator.state().aggregator.read().await;
    let window: Vec<Candle> = aggregator.window(&market, Timeframe::M5).unwrap().iter().cloned().collect();
    drop(aggregator);
    assert_eq!(window.len(), 2);

    let first = &window[0];
    assert_eq!(
        (first.open, first.high, first.low, first.close, first.volume),
        (100.0, 105.0, 98.0, 98.0, 3.0)
    );
    assert_eq!(first.kind, CandleKind::Created);

    let idle = &window[1];
    assert_eq!((idle.open, idle.high, idle.low, idle.close), (98.0, 98.0, 98.0, 98.0));
    assert_eq!(idle.volume, 0.0);
    assert_eq!(idle.kind, CandleKind::Previous);

    assert!(fx.coordinator.flush().await >= 2);
    let stored = fx.store.load_candles(&market, Timeframe::M5, i64::MAX, 10).await.unwrap();
    let times: Vec<i64> = stored.iter().map(|c| c.time).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(times.contains(&T0) && times.contains(&(T0 + M5)));
    println!("✅ 逐笔成交聚合测试通过");
}

#[tokio::test]
async fn test_scheduled_run_then_alert_fill() {
    let mut fx = fixture("binance_futures");
    started_with_alerts(&fx).await;
    assert_eq!(fx.coordinator.state().alerts.lock().await.for_robot("r1").len(), 2);

    // 同一边界重复调度不会再次运行
    let again = fx.coordinator.run_boundary(T0, &[Timeframe::M5]).await;
    assert_eq!(again, vec![RunOutcome::AlreadyProcessed]);

    breakout_bar(&fx).await;
    drain(&mut fx.events);
    let pass = fx.coordinator.check_alerts(T0 + 2000).await;
    assert_eq!((pass.triggered, pass.executed, pass.busy), (1, 1, 0));

    let events = drain(&mut fx.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DomainEvent::SignalTrade(s) if s.action == TradeAction::Long && s.price == 103.5)));

    let stored = fx.store.load_robot_state("r1").await.unwrap().unwrap();
    assert_eq!(stored.positions[0].status, PositionStatus::Open);

    // 挂单提醒与成交都已落库
    let signals = fx.store.load_signals("r1").await.unwrap();
    assert!(signals.iter().any(|r| r.kind == SignalType::Trade
        && r.signal.action == TradeAction::Long
        && r.signal.price == 103.5));
    assert!(signals.iter().filter(|r| r.kind == SignalType::Alert).count() >= 2);

    // 剩下的是多单的保护性止损
    let remaining = fx.coordinator.state().alerts.lock().await.for_robot("r1");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action, TradeAction::CloseLong);
    assert_eq!(remaining[0].price, 97.0);
}

#[tokio::test]
async fn test_busy_robot_is_retried_next_pass() {
    let fx = fixture("binance_futures");
    started_with_alerts(&fx).await;
    breakout_bar(&fx).await;

    let entry = fx.coordinator.state().robots.get("r1").await.unwrap();
    let guard = entry.lock().await;
    let pass = fx.coordinator.check_alerts(T0 + 2000).await;
    assert_eq!((pass.triggered, pass.executed, pass.busy), (1, 0, 1));
    assert_eq!(fx.coordinator.state().alerts.lock().await.for_robot("r1").len(), 2);
    drop(guard);

    let pass = fx.coordinator.check_alerts(T0 + 3000).await;
    assert_eq!(pass.executed, 1);
}

#[tokio::test]
async fn test_expired_alerts_are_purged() {
    let fx = fixture("binance_futures");
    started_with_alerts(&fx).await;

    let pass = fx.coordinator.check_alerts(T0 + M5).await;
    assert_eq!(pass.expired, 2);
    assert!(fx.coordinator.state().alerts.lock().await.is_empty());
}

#[tokio::test]
async fn test_stop_robot_evicts_and_persists() {
    let mut fx = fixture("binance_futures");
    started_with_alerts(&fx).await;
    drain(&mut fx.events);

    fx.coordinator.stop_robot("r1").await.unwrap();

    assert!(fx.coordinator.state().robots.is_empty().await);
    assert!(fx.coordinator.state().alerts.lock().await.is_empty());
    let stored = fx.store.load_robot_state("r1").await.unwrap().unwrap();
    assert_eq!(stored.status, RobotStatus::Stopped);
    assert!(!stored.has_alerts);
    assert!(drain(&mut fx.events)
        .iter()
        .any(|e| matches!(e, DomainEvent::RobotStopped { robot_id } if robot_id == "r1")));

    // 停止未运行的机器人不是错误
    fx.coordinator.stop_robot("r1").await.unwrap();
}

#[tokio::test]
async fn test_subscription_activation_loads_started_robots() {
    let fx = fixture("binance_futures");
    save_robot(&fx, "r2", "breakout", RobotStatus::Started).await;
    save_robot(&fx, "r3", "breakout", RobotStatus::Stopped).await;

    activate(&fx, &btc(), T0).await;

    let robots = &fx.coordinator.state().robots;
    assert!(robots.contains("r2").await);
    assert!(!robots.contains("r3").await);
}

#[tokio::test]
async fn test_strategy_error_leaves_state_unchanged() {
    let mut fx = fixture("binance_futures");
    seed_history(&fx, &btc()).await;
    let saved = save_robot(&fx, "broken", "no_such_strategy", RobotStatus::Started).await;
    activate(&fx, &btc(), T0 + 1000).await;
    drain(&mut fx.events);

    let outcomes = fx.coordinator.run_boundary(T0, &[Timeframe::M5]).await;
    assert_eq!(outcomes, vec![RunOutcome::Failed]);
    assert!(drain(&mut fx.events)
        .iter()
        .any(|e| matches!(e, DomainEvent::RobotError { robot_id, .. } if robot_id == "broken")));

    let entry = fx.coordinator.state().robots.get("broken").await.unwrap();
    let handle = entry.lock().await;
    assert_eq!(handle.state, saved);
    assert!(handle.is_runnable());
}

#[tokio::test]
async fn test_start_then_shutdown() {
    let mut config = test_config("binance_futures");
    config.markets = vec!["btc/usdt".to_string()];
    let mut fx = fixture_with(config);

    let inbound = fx.inbound.take().unwrap();
    fx.coordinator.start(inbound).await.unwrap();
    assert_eq!(
        fx.coordinator.exwatcher().get("binance_futures.BTC.USDT").await.unwrap().status,
        SubscriptionStatus::Importing
    );

    fx.coordinator.shutdown().await;
    let stored = fx.store.load_subscriptions("binance_futures").await.unwrap();
    assert_eq!(stored[0].status, SubscriptionStatus::Unsubscribed);
    println!("✅ 协调器启动与关闭测试通过");
}

#[tokio::test]
async fn test_trade_delivered_after_its_tick_is_still_folded() {
    let fx = fixture("kraken");
    let market = Market::new("kraken", "ETH", "USD");
    for tf in [Timeframe::M5, Timeframe::H1] {
        let seed = OhlcvBucket {
            time: T0,
            open: 99.0,
            high: 99.0,
            low: 99.0,
            close: 99.0,
            volume: 0.0,
        };
        fx.transport.set_candle(&market, tf, seed).await;
    }
    activate(&fx, &market, T0).await;
    assert_eq!(tick_date(T0 + 2500), T0 + 1000);

    fx.coordinator.tick(tick_date(T0 + 1000)).await.unwrap();
    let first = Trade {
        amount: 1.0,
        price: 100.0,
        timestamp: T0 + 1500,
    };
    fx.transport.publish_trade(&market, first).await;
    fx.coordinator.tick(tick_date(T0 + 2000)).await.unwrap();

    // 成交时间早于上一节拍，送达却在其后
    let late = Trade {
        amount: 1.0,
        price: 120.0,
        timestamp: T0 + 1600,
    };
    fx.transport.publish_trade(&market, late).await;
    fx.coordinator.tick(tick_date(T0 + 3000)).await.unwrap();

    let working = fx
        .coordinator
        .state()
        .aggregator
        .read()
        .await
        .working(&market, Timeframe::M5)
        .cloned()
        .unwrap();
    assert_eq!(
        (working.open, working.high, working.close, working.volume),
        (100.0, 120.0, 120.0, 2.0)
    );
    println!("✅ 晚到成交折叠测试通过");
}

#[tokio::test]
async fn test_boundary_retried_when_candle_closes_late() {
    let fx = fixture("binance_futures");
    started_with_alerts(&fx).await;
    breakout_bar(&fx).await;

    // 聚合节拍滞后：T0 这根5m K线还没收盘
    assert_eq!(fx.coordinator.run_scheduler(T0 + M5 + 1500).await, 0);

    fx.coordinator.tick(T0 + M5).await.unwrap();
    assert_eq!(fx.coordinator.run_scheduler(T0 + M5 + 3500).await, 1);
    assert_eq!(fx.coordinator.run_scheduler(T0 + M5 + 5500).await, 0);

    let entry = fx.coordinator.state().robots.get("r1").await.unwrap();
    assert_eq!(entry.lock().await.state.last_candle.as_ref().map(|c| c.time), Some(T0));
}
