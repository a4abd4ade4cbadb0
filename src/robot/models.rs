use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::market::models::{Candle, Market};
use crate::market::timeframe::Timeframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl RobotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RobotStatus::Stopped => "stopped",
            RobotStatus::Starting => "starting",
            RobotStatus::Started => "started",
            RobotStatus::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TradeAction {
    Long,
    Short,
    CloseLong,
    CloseShort,
}

impl TradeAction {
    /// 买方向：开多或平空
    pub fn is_buy_side(self) -> bool {
        matches!(self, TradeAction::Long | TradeAction::CloseShort)
    }

    pub fn is_entry(self) -> bool {
        matches!(self, TradeAction::Long | TradeAction::Short)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Long => "long",
            TradeAction::Short => "short",
            TradeAction::CloseLong => "closeLong",
            TradeAction::CloseShort => "closeShort",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Stop,
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Stop => "stop",
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    New,
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::New => "new",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// 持仓上挂着的条件单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionAlert {
    pub action: TradeAction,
    pub order_type: OrderType,
    pub price: f64,
    /// 产生该条件单的K线开盘时间
    pub candle_time: i64,
}

/// 一次成交的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill {
    pub action: TradeAction,
    pub order_type: OrderType,
    pub price: f64,
    pub candle_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotPosition {
    pub id: String,
    pub robot_id: String,
    pub timeframe: Timeframe,
    pub prefix: String,
    pub code: String,
    pub parent_id: Option<String>,
    pub direction: Option<PositionDirection>,
    pub status: PositionStatus,
    pub entry: Option<TradeFill>,
    pub exit: Option<TradeFill>,
    pub bars_held: u32,
    pub alerts: Vec<PositionAlert>,
    pub highest_high: Option<f64>,
    pub lowest_low: Option<f64>,
    /// 策略自定义的持仓状态，内核不解释
    #[serde(default)]
    pub internal_state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub id: String,
    pub exchange: String,
    pub asset: String,
    pub currency: String,
    pub timeframe: Timeframe,
    /// 策略名称，对应 StrategyRegistry 中的键
    pub strategy: String,
    #[serde(default)]
    pub settings: Value,
    /// 策略变量，形状由策略决定
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub positions: Vec<RobotPosition>,
    /// 每个前缀下最后使用的持仓编号
    #[serde(default)]
    pub pos_last_numb: BTreeMap<String, u32>,
    pub last_candle: Option<Candle>,
    #[serde(default)]
    pub has_alerts: bool,
    pub status: RobotStatus,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
}

impl RobotState {
    pub fn new(id: &str, market: &Market, timeframe: Timeframe, strategy: &str, settings: Value) -> Self {
        Self {
            id: id.to_string(),
            exchange: market.exchange.clone(),
            asset: market.asset.clone(),
            currency: market.currency.clone(),
            timeframe,
            strategy: strategy.to_string(),
            settings,
            variables: Value::Null,
            initialized: false,
            positions: Vec::new(),
            pos_last_numb: BTreeMap::new(),
            last_candle: None,
            has_alerts: false,
            status: RobotStatus::Stopped,
            started_at: None,
            stopped_at: None,
        }
    }

    pub fn market(&self) -> Market {
        Market {
            exchange: self.exchange.clone(),
            asset: self.asset.clone(),
            currency: self.currency.clone(),
        }
    }

    pub fn refresh_has_alerts(&mut self) {
        self.has_alerts = self.positions.iter().any(|p| !p.alerts.is_empty());
    }
}

/// 对外发布的交易信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub robot_id: String,
    pub exchange: String,
    pub asset: String,
    pub currency: String,
    pub timeframe: Timeframe,
    pub action: TradeAction,
    pub order_type: OrderType,
    pub price: f64,
    pub candle_time: i64,
    pub position_id: String,
    pub position_prefix: String,
    pub position_code: String,
    pub position_parent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    /// 新挂出的条件单
    Alert,
    /// 条件单成交
    Trade,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Alert => "alert",
            SignalType::Trade => "trade",
        }
    }
}

/// 需要落库的信号记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub signal: Signal,
}

/// 告警簿中的一条条件单，由机器人持仓上的 `PositionAlert` 展开而来
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub robot_id: String,
    pub market: Market,
    pub timeframe: Timeframe,
    pub position_id: String,
    pub action: TradeAction,
    pub order_type: OrderType,
    pub price: f64,
    pub candle_time: i64,
    /// 生效的K线开盘时间 = candle_time + tf
    pub active_from: i64,
    /// 失效时间 = candle_time + 2·tf − 1ms
    pub active_to: i64,
}

impl Alert {
    pub fn from_position(state: &RobotState, position: &RobotPosition, alert: &PositionAlert) -> Self {
        let tf = state.timeframe.ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            robot_id: state.id.clone(),
            market: state.market(),
            timeframe: state.timeframe,
            position_id: position.id.clone(),
            action: alert.action,
            order_type: alert.order_type,
            price: alert.price,
            candle_time: alert.candle_time,
            active_from: alert.candle_time + tf,
            active_to: alert.candle_time + 2 * tf - 1,
        }
    }

    pub fn is_active(&self, now: i64) -> bool {
        self.active_from <= now && now < self.active_to
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.active_to
    }
}

/// 机器人全部持仓上的条件单
pub fn collect_alerts(state: &RobotState) -> Vec<Alert> {
    state
        .positions
        .iter()
        .flat_map(|p| p.alerts.iter().map(move |a| Alert::from_position(state, p, a)))
        .collect()
}
