//! 策略执行
//!
//! `execute_job` 是工作线程上运行的纯函数：输入一个机器人状态和K线快照，
//! 输出新状态、需要落库的持仓、待发布的事件和新的条件单。不做任何 I/O。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::common::events::DomainEvent;
use crate::market::models::Candle;
use crate::market::timeframe::{self, Timeframe};
use crate::robot::models::{
    collect_alerts, Alert, OrderType, PositionDirection, PositionStatus, RobotPosition, RobotState, RobotStatus,
    Signal, SignalRecord, SignalType, TradeAction, TradeFill,
};
use crate::robot::position::new_position;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrategyError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("position error: {0}")]
    Position(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job codec error: {0}")]
    Codec(String),

    #[error("strategy panicked: {0}")]
    Panicked(String),
}

/// 策略实现。各钩子只通过 `StrategyContext` 读写机器人状态。
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 首次运行前调用一次
    fn init(&self, _ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }

    /// 每根收盘K线调用一次
    fn check(&self, ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError>;

    /// 条件单成交后，用进行中的K线再运行一次
    fn check_current(&self, _ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_stop(&self, _ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Ok(())
    }
}

/// 一次策略调用可见的上下文
pub struct StrategyContext<'a> {
    pub settings: &'a Value,
    pub variables: &'a mut Value,
    /// 截止到本次运行的已收盘K线，按时间升序
    pub candles: &'a [Candle],
    /// 本次运行对应的K线：收盘运行为最后一根收盘K线，条件单运行为进行中的K线
    pub candle: Option<&'a Candle>,
    state: &'a mut RobotState,
    /// 新挂条件单所属的K线时间
    alert_candle_time: i64,
}

impl<'a> StrategyContext<'a> {
    pub fn timeframe(&self) -> Timeframe {
        self.state.timeframe
    }

    pub fn positions(&self) -> &[RobotPosition] {
        &self.state.positions
    }

    pub fn has_active_position(&self) -> bool {
        self.state.positions.iter().any(|p| p.is_open())
    }

    /// 当前持仓（已开仓且未平仓）
    pub fn active_position(&mut self) -> Option<PositionHandle<'_>> {
        let candle_time = self.alert_candle_time;
        self.state
            .positions
            .iter_mut()
            .find(|p| p.is_open())
            .map(|position| PositionHandle { position, candle_time })
    }

    /// 尚未开仓的持仓，没有时新建一个
    pub fn pending_or_new_position(&mut self, prefix: &str) -> PositionHandle<'_> {
        let idx = match self
            .state
            .positions
            .iter()
            .position(|p| p.status == PositionStatus::New && p.prefix == prefix)
        {
            Some(idx) => idx,
            None => {
                let position = new_position(self.state, prefix, None);
                self.state.positions.push(position);
                self.state.positions.len() - 1
            }
        };
        PositionHandle {
            position: &mut self.state.positions[idx],
            candle_time: self.alert_candle_time,
        }
    }

    pub fn create_position(&mut self, prefix: &str, parent_id: Option<String>) -> PositionHandle<'_> {
        let position = new_position(self.state, prefix, parent_id);
        self.state.positions.push(position);
        let idx = self.state.positions.len() - 1;
        PositionHandle {
            position: &mut self.state.positions[idx],
            candle_time: self.alert_candle_time,
        }
    }

    pub fn param_usize(&self, name: &str, default: usize) -> Result<usize, StrategyError> {
        match self.settings.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| StrategyError::InvalidParameters(format!("{} must be a positive integer", name))),
        }
    }

    pub fn param_f64(&self, name: &str, default: f64) -> Result<f64, StrategyError> {
        match self.settings.get(name) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| StrategyError::InvalidParameters(format!("{} must be a number", name))),
        }
    }
}

/// 对一个持仓下单的句柄
pub struct PositionHandle<'p> {
    position: &'p mut RobotPosition,
    candle_time: i64,
}

impl PositionHandle<'_> {
    pub fn position(&self) -> &RobotPosition {
        self.position
    }

    pub fn direction(&self) -> Option<PositionDirection> {
        self.position.direction
    }

    pub fn set_internal_state(&mut self, value: Value) {
        self.position.internal_state = value;
    }

    pub fn buy_at_market(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Long, OrderType::Market, price)
    }

    pub fn buy_at_stop(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Long, OrderType::Stop, price)
    }

    pub fn buy_at_limit(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Long, OrderType::Limit, price)
    }

    pub fn sell_at_market(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseLong, OrderType::Market, price)
    }

    pub fn sell_at_stop(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseLong, OrderType::Stop, price)
    }

    pub fn sell_at_limit(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseLong, OrderType::Limit, price)
    }

    pub fn short_at_market(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Short, OrderType::Market, price)
    }

    pub fn short_at_stop(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Short, OrderType::Stop, price)
    }

    pub fn short_at_limit(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::Short, OrderType::Limit, price)
    }

    pub fn cover_at_market(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseShort, OrderType::Market, price)
    }

    pub fn cover_at_stop(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseShort, OrderType::Stop, price)
    }

    pub fn cover_at_limit(&mut self, price: f64) -> Result<(), StrategyError> {
        self.order(TradeAction::CloseShort, OrderType::Limit, price)
    }

    fn order(&mut self, action: TradeAction, order_type: OrderType, price: f64) -> Result<(), StrategyError> {
        self.position.add_alert(action, order_type, price, self.candle_time)
    }
}

/// 按名称查找策略
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置策略的注册表
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ChannelBreakout));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Strategy>, StrategyError> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

/// 通道突破：价格突破最近 `period` 根K线的最高价做多、跌破最低价做空，
/// 持仓后以反向通道边界止损
pub struct ChannelBreakout;

impl ChannelBreakout {
    fn protective_stop(ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        let highest = ctx.variables.get("highest").and_then(Value::as_f64);
        let lowest = ctx.variables.get("lowest").and_then(Value::as_f64);
        let Some(mut position) = ctx.active_position() else {
            return Ok(());
        };
        if position.position().has_alerts() {
            return Ok(());
        }
        match (position.direction(), highest, lowest) {
            (Some(PositionDirection::Long), _, Some(lowest)) => position.sell_at_stop(lowest),
            (Some(PositionDirection::Short), Some(highest), _) => position.cover_at_stop(highest),
            _ => Ok(()),
        }
    }
}

impl Strategy for ChannelBreakout {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn init(&self, ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        let period = ctx.param_usize("period", 20)?;
        if period == 0 {
            return Err(StrategyError::InvalidParameters("period must be > 0".into()));
        }
        *ctx.variables = serde_json::json!({ "period": period });
        Ok(())
    }

    fn check(&self, ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        let period = ctx.param_usize("period", 20)?;
        let tick = ctx.param_f64("tick", 0.0)?;
        if period == 0 || ctx.candles.len() < period {
            return Ok(());
        }

        let recent = &ctx.candles[ctx.candles.len() - period..];
        let highest = recent.iter().map(|c| c.high).fold(f64::MIN, f64::max) + tick;
        let lowest = recent.iter().map(|c| c.low).fold(f64::MAX, f64::min) - tick;
        *ctx.variables = serde_json::json!({ "period": period, "highest": highest, "lowest": lowest });

        if ctx.has_active_position() {
            return Self::protective_stop(ctx);
        }

        let mut position = ctx.pending_or_new_position("breakout");
        position.buy_at_stop(highest)?;
        position.short_at_stop(lowest)
    }

    fn check_current(&self, ctx: &mut StrategyContext<'_>) -> Result<(), StrategyError> {
        Self::protective_stop(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Start,
    Candle,
    Alerts,
    Stop,
}

/// 发往工作线程的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotJob {
    pub kind: JobKind,
    pub state: RobotState,
    /// 已收盘K线快照，`candle` 任务以最后一根为本次运行的K线
    #[serde(default)]
    pub candles: Vec<Candle>,
    /// `alerts` 任务使用的进行中K线
    #[serde(default)]
    pub current: Option<Candle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub state: RobotState,
    pub positions_to_save: Vec<RobotPosition>,
    pub events: Vec<DomainEvent>,
    /// 机器人当前全部有效条件单，替换告警簿中该机器人的旧条目
    pub alerts: Vec<Alert>,
    /// 本次运行产生的信号，与持仓一起落库
    #[serde(default)]
    pub signals: Vec<SignalRecord>,
}

fn signal(state: &RobotState, position: &RobotPosition, action: TradeAction, order_type: OrderType, price: f64, candle_time: i64) -> Signal {
    Signal {
        id: uuid::Uuid::new_v4().to_string(),
        robot_id: state.id.clone(),
        exchange: state.exchange.clone(),
        asset: state.asset.clone(),
        currency: state.currency.clone(),
        timeframe: state.timeframe,
        action,
        order_type,
        price,
        candle_time,
        position_id: position.id.clone(),
        position_prefix: position.prefix.clone(),
        position_code: position.code.clone(),
        position_parent_id: position.parent_id.clone(),
    }
}

/// 每个持仓的条件单快照，用来识别本次运行新挂的条件单
fn alert_snapshot(state: &RobotState) -> HashMap<String, usize> {
    state.positions.iter().map(|p| (p.id.clone(), p.alerts.len())).collect()
}

fn run_hook<F>(state: &mut RobotState, candles: &[Candle], candle: Option<&Candle>, alert_candle_time: i64, hook: F) -> Result<(), StrategyError>
where
    F: FnOnce(&mut StrategyContext<'_>) -> Result<(), StrategyError>,
{
    let settings = state.settings.clone();
    let mut variables = std::mem::take(&mut state.variables);
    let outcome = {
        let mut ctx = StrategyContext {
            settings: &settings,
            variables: &mut variables,
            candles,
            candle,
            state: &mut *state,
            alert_candle_time,
        };
        hook(&mut ctx)
    };
    state.variables = variables;
    outcome
}

/// 在工作线程上执行一个任务
pub fn execute_job(registry: &StrategyRegistry, job: RobotJob) -> Result<JobResult, StrategyError> {
    let RobotJob {
        kind,
        mut state,
        candles,
        current,
    } = job;
    let strategy = registry.get(&state.strategy)?;
    let tf = state.timeframe;
    let mut events = Vec::new();
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut closed: Vec<RobotPosition> = Vec::new();

    let before = alert_snapshot(&state);
    let mut alert_candle_time = None;

    match kind {
        JobKind::Start => {
            if !state.initialized {
                let anchor = candles.last().map(|c| c.time).unwrap_or(0);
                run_hook(&mut state, &candles, candles.last(), anchor, |ctx| strategy.init(ctx))?;
                state.initialized = true;
            }
            state.status = RobotStatus::Started;
            state.started_at = Some(timeframe::iso(chrono::Utc::now().timestamp_millis()));
            state.stopped_at = None;
            events.push(DomainEvent::RobotStarted {
                robot_id: state.id.clone(),
            });
        }
        JobKind::Stop => {
            let anchor = state.last_candle.as_ref().map(|c| c.time).unwrap_or(0);
            run_hook(&mut state, &candles, None, anchor, |ctx| strategy.on_stop(ctx))?;
            for position in state.positions.iter_mut().filter(|p| p.has_alerts()) {
                position.clear_alerts();
                touched.insert(position.id.clone());
            }
            state.status = RobotStatus::Stopped;
            state.stopped_at = Some(timeframe::iso(chrono::Utc::now().timestamp_millis()));
            events.push(DomainEvent::RobotStopped {
                robot_id: state.id.clone(),
            });
        }
        JobKind::Candle => {
            let candle = candles
                .last()
                .ok_or_else(|| StrategyError::InvalidJob("candle job without closed candles".into()))?;
            if matches!(&state.last_candle, Some(last) if last.time >= candle.time) {
                return Ok(JobResult {
                    alerts: collect_alerts(&state),
                    state,
                    positions_to_save: Vec::new(),
                    events,
                    signals: Vec::new(),
                });
            }

            for position in state.positions.iter_mut() {
                position.handle_candle(candle);
                if position.has_alerts() {
                    // 上一根K线的条件单已过期
                    position.clear_alerts();
                    touched.insert(position.id.clone());
                }
            }

            if !state.initialized {
                run_hook(&mut state, &candles, Some(candle), candle.time, |ctx| strategy.init(ctx))?;
                state.initialized = true;
            }
            run_hook(&mut state, &candles, Some(candle), candle.time, |ctx| strategy.check(ctx))?;
            state.last_candle = Some(candle.clone());
            alert_candle_time = Some(candle.time);
        }
        JobKind::Alerts => {
            let current = current
                .as_ref()
                .ok_or_else(|| StrategyError::InvalidJob("alerts job without current candle".into()))?;

            let mut fills: Vec<(usize, TradeFill)> = Vec::new();
            for (idx, position) in state.positions.iter_mut().enumerate() {
                if let Some(fill) = position.check_alerts(current, tf) {
                    touched.insert(position.id.clone());
                    fills.push((idx, fill));
                }
            }

            for (idx, fill) in &fills {
                let position = &state.positions[*idx];
                events.push(DomainEvent::SignalTrade(signal(
                    &state,
                    position,
                    fill.action,
                    fill.order_type,
                    fill.price,
                    fill.candle_time,
                )));
            }

            if !fills.is_empty() {
                let anchor = current.time - tf.ms();
                run_hook(&mut state, &candles, Some(current), anchor, |ctx| strategy.check_current(ctx))?;
                alert_candle_time = Some(anchor);
            }
        }
    }

    // 新挂的条件单发布提醒信号，市价单除外
    if let Some(candle_time) = alert_candle_time {
        for position in &state.positions {
            let known = before.get(&position.id).copied().unwrap_or(0);
            let fresh = position.alerts.iter().filter(|a| a.candle_time == candle_time);
            let fresh: Vec<_> = if known == 0 || touched.contains(&position.id) {
                fresh.collect()
            } else {
                fresh.skip(known).collect()
            };
            if !fresh.is_empty() {
                touched.insert(position.id.clone());
            }
            for alert in fresh {
                if alert.order_type != OrderType::Market {
                    events.push(DomainEvent::SignalAlert(signal(
                        &state,
                        position,
                        alert.action,
                        alert.order_type,
                        alert.price,
                        alert.candle_time,
                    )));
                }
            }
        }
    }

    if state.positions.iter().any(|p| p.is_closed()) {
        events.push(DomainEvent::StatsRecalc {
            robot_id: state.id.clone(),
        });
    }

    // 已平仓的持仓落库后移出状态，未挂单的新持仓直接丢弃
    let mut kept = Vec::with_capacity(state.positions.len());
    for position in std::mem::take(&mut state.positions) {
        if position.is_closed() {
            closed.push(position);
        } else if position.status == PositionStatus::New && !position.has_alerts() {
            continue;
        } else {
            kept.push(position);
        }
    }
    state.positions = kept;
    state.refresh_has_alerts();

    let mut positions_to_save: Vec<RobotPosition> = state
        .positions
        .iter()
        .filter(|p| touched.contains(&p.id))
        .cloned()
        .collect();
    positions_to_save.extend(closed);

    let signals = events
        .iter()
        .filter_map(|event| match event {
            DomainEvent::SignalAlert(signal) => Some(SignalRecord {
                kind: SignalType::Alert,
                signal: signal.clone(),
            }),
            DomainEvent::SignalTrade(signal) => Some(SignalRecord {
                kind: SignalType::Trade,
                signal: signal.clone(),
            }),
            _ => None,
        })
        .collect();

    Ok(JobResult {
        alerts: collect_alerts(&state),
        state,
        positions_to_save,
        events,
        signals,
    })
}

/// 工作线程入口：解码任务、执行、编码结果
pub fn execute_encoded(registry: &StrategyRegistry, payload: &[u8]) -> Result<Vec<u8>, StrategyError> {
    let job: RobotJob = serde_json::from_slice(payload).map_err(|e| StrategyError::Codec(e.to_string()))?;
    let result = execute_job(registry, job)?;
    serde_json::to_vec(&result).map_err(|e| StrategyError::Codec(e.to_string()))
}
