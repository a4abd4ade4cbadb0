use super::models::{OrderType, PositionStatus, TradeAction};
use super::*;
use crate::common::events::DomainEvent;
use crate::market::models::{Candle, CandleKind, Market};
use crate::market::timeframe::Timeframe;
use serde_json::json;

const T0: i64 = 1_709_251_200_000;
const H: i64 = 3_600_000;

fn market() -> Market {
    Market::new("binance_futures", "BTC", "USDT")
}

fn candle(time: i64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        open: close,
        high,
        low,
        close,
        volume: 1.0,
        kind: CandleKind::Created,
        ..Candle::flat(&market(), Timeframe::H1, time, close)
    }
}

fn history() -> Vec<Candle> {
    vec![
        candle(T0, 101.0, 99.0, 100.0),
        candle(T0 + H, 102.0, 98.0, 100.0),
        candle(T0 + 2 * H, 103.0, 97.0, 100.0),
    ]
}

fn started_state() -> RobotState {
    let mut state = RobotState::new("r1", &market(), Timeframe::H1, "breakout", json!({ "period": 3 }));
    state.status = RobotStatus::Started;
    state
}

fn run(kind: JobKind, state: RobotState, candles: Vec<Candle>, current: Option<Candle>) -> JobResult {
    execute_job(
        &StrategyRegistry::with_builtin(),
        RobotJob {
            kind,
            state,
            candles,
            current,
        },
    )
    .expect("任务应执行成功")
}

fn signals(events: &[DomainEvent]) -> (Vec<TradeAction>, Vec<TradeAction>) {
    let mut alerts = Vec::new();
    let mut trades = Vec::new();
    for e in events {
        match e {
            DomainEvent::SignalAlert(s) => alerts.push(s.action),
            DomainEvent::SignalTrade(s) => trades.push(s.action),
            _ => {}
        }
    }
    (alerts, trades)
}

#[test]
fn test_candle_job_places_breakout_alerts() {
    let result = run(JobKind::Candle, started_state(), history(), None);

    assert!(result.state.initialized);
    assert_eq!(result.state.last_candle.as_ref().map(|c| c.time), Some(T0 + 2 * H));
    assert!(result.state.has_alerts);
    assert_eq!(result.state.positions.len(), 1);
    assert_eq!(result.state.positions[0].code, "breakout_1");
    assert_eq!(result.positions_to_save.len(), 1);

    let (alerts, trades) = signals(&result.events);
    assert_eq!(alerts, vec![TradeAction::Long, TradeAction::Short]);
    assert!(trades.is_empty());

    assert_eq!(result.alerts.len(), 2);
    let long = &result.alerts[0];
    assert_eq!((long.order_type, long.price), (OrderType::Stop, 103.0));
    assert_eq!(long.active_from, T0 + 3 * H);
    assert_eq!(long.active_to, T0 + 4 * H - 1);
}

#[test]
fn test_candle_job_is_idempotent_per_candle() {
    let first = run(JobKind::Candle, started_state(), history(), None);
    let again = run(JobKind::Candle, first.state.clone(), history(), None);
    assert_eq!(again.state, first.state);
    assert!(again.events.is_empty());
    assert!(again.positions_to_save.is_empty());
}

#[test]
fn test_alert_fill_then_protective_stop_then_exit() {
    let placed = run(JobKind::Candle, started_state(), history(), None);

    // 进行中的K线向上突破
    let current = candle(T0 + 3 * H, 104.0, 100.0, 103.5);
    let entered = run(JobKind::Alerts, placed.state, history(), Some(current));
    let (alerts, trades) = signals(&entered.events);
    assert_eq!(trades, vec![TradeAction::Long]);
    assert_eq!(alerts, vec![TradeAction::CloseLong]);

    let position = &entered.state.positions[0];
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.entry.as_ref().map(|f| f.price), Some(103.5));
    // 止损单在当前K线内仍然有效
    assert_eq!(entered.alerts.len(), 1);
    assert_eq!(entered.alerts[0].active_from, T0 + 3 * H);
    assert_eq!(entered.alerts[0].price, 97.0);

    let current = candle(T0 + 3 * H, 104.0, 96.0, 96.5);
    let exited = run(JobKind::Alerts, entered.state, history(), Some(current));
    let (_, trades) = signals(&exited.events);
    assert_eq!(trades, vec![TradeAction::CloseLong]);
    assert!(exited
        .events
        .iter()
        .any(|e| matches!(e, DomainEvent::StatsRecalc { robot_id } if robot_id == "r1")));

    assert!(exited.state.positions.is_empty());
    assert!(!exited.state.has_alerts);
    assert!(exited.alerts.is_empty());
    let closed = &exited.positions_to_save[0];
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit.as_ref().map(|f| f.price), Some(96.5));
}

#[test]
fn test_start_and_stop_jobs() {
    let mut state = started_state();
    state.status = RobotStatus::Starting;
    let started = run(JobKind::Start, state, Vec::new(), None);
    assert_eq!(started.state.status, RobotStatus::Started);
    assert!(started.state.started_at.is_some());
    assert_eq!(started.state.variables, json!({ "period": 3 }));
    assert!(matches!(started.events[0], DomainEvent::RobotStarted { .. }));

    let placed = run(JobKind::Candle, started.state, history(), None);
    let stopped = run(JobKind::Stop, placed.state, Vec::new(), None);
    assert_eq!(stopped.state.status, RobotStatus::Stopped);
    assert!(stopped.alerts.is_empty());
    assert!(matches!(stopped.events.last(), Some(DomainEvent::RobotStopped { .. })));
}

#[test]
fn test_invalid_settings_fail_the_job() {
    let mut state = started_state();
    state.settings = json!({ "period": "long" });
    let err = execute_job(
        &StrategyRegistry::with_builtin(),
        RobotJob {
            kind: JobKind::Candle,
            state,
            candles: history(),
            current: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, StrategyError::InvalidParameters(_)));
}

#[test]
fn test_state_survives_codec_exactly() {
    let mut state = run(JobKind::Candle, started_state(), history(), None).state;
    state.variables = json!({
        "ema": 0.1 + 0.2,
        "tiny": 5e-324,
        "big": 1.7976931348623157e308,
        "series": [1.0 / 3.0, -2.5, null, "text"],
        "nested": { "flag": true, "count": 42 }
    });
    state.positions[0].internal_state = json!({ "trail": 101.123456789012345 });

    let encoded = serde_json::to_vec(&state).unwrap();
    let decoded: RobotState = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(decoded, state);
    println!("✅ 机器人状态编解码一致性测试通过");
}
