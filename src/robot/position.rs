//! 持仓与条件单的成交规则
//!
//! 买方向（开多、平空）与卖方向（开空、平多）在三种订单类型下的触发条件和成交价：
//!
//! | 类型   | 买方向触发       | 买方向成交价       | 卖方向触发       | 卖方向成交价       |
//! |--------|------------------|--------------------|------------------|--------------------|
//! | stop   | high ≥ price     | max(close, price)  | low ≤ price      | min(close, price)  |
//! | limit  | high ≤ price     | min(close, price)  | low ≥ price      | max(close, price)  |
//! | market | 总是             | max(close, price)  | 总是             | min(close, price)  |

use serde_json::Value;

use crate::market::models::Candle;
use crate::market::timeframe::Timeframe;
use crate::robot::models::{
    OrderType, PositionAlert, PositionDirection, PositionStatus, RobotPosition, RobotState, TradeAction, TradeFill,
};
use crate::robot::strategy::StrategyError;

/// 条件单在这根K线上是否触发，触发时返回成交价
pub fn fill_price(order_type: OrderType, action: TradeAction, price: f64, candle: &Candle) -> Option<f64> {
    let buy = action.is_buy_side();
    match order_type {
        OrderType::Stop => {
            if buy && candle.high >= price {
                Some(candle.close.max(price))
            } else if !buy && candle.low <= price {
                Some(candle.close.min(price))
            } else {
                None
            }
        }
        OrderType::Limit => {
            if buy && candle.high <= price {
                Some(candle.close.min(price))
            } else if !buy && candle.low >= price {
                Some(candle.close.max(price))
            } else {
                None
            }
        }
        OrderType::Market => {
            if buy {
                Some(candle.close.max(price))
            } else {
                Some(candle.close.min(price))
            }
        }
    }
}

/// 分配下一个持仓编号并构造新持仓，调用方负责放入机器人状态
pub fn new_position(state: &mut RobotState, prefix: &str, parent_id: Option<String>) -> RobotPosition {
    let numb = state.pos_last_numb.entry(prefix.to_string()).or_insert(0);
    *numb += 1;
    RobotPosition {
        id: uuid::Uuid::new_v4().to_string(),
        robot_id: state.id.clone(),
        timeframe: state.timeframe,
        prefix: prefix.to_string(),
        code: format!("{}_{}", prefix, numb),
        parent_id,
        direction: None,
        status: PositionStatus::New,
        entry: None,
        exit: None,
        bars_held: 0,
        alerts: Vec::new(),
        highest_high: None,
        lowest_low: None,
        internal_state: Value::Null,
    }
}

impl RobotPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn has_alerts(&self) -> bool {
        !self.alerts.is_empty()
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    /// 挂一个条件单，动作必须与持仓当前状态相符
    pub fn add_alert(
        &mut self,
        action: TradeAction,
        order_type: OrderType,
        price: f64,
        candle_time: i64,
    ) -> Result<(), StrategyError> {
        if !price.is_finite() || price < 0.0 {
            return Err(StrategyError::Position(format!("{}: invalid price {}", self.code, price)));
        }

        let allowed = match action {
            TradeAction::Long | TradeAction::Short => self.status == PositionStatus::New,
            TradeAction::CloseLong => self.is_open() && self.direction == Some(PositionDirection::Long),
            TradeAction::CloseShort => self.is_open() && self.direction == Some(PositionDirection::Short),
        };
        if !allowed {
            return Err(StrategyError::Position(format!(
                "{}: {:?} not allowed in status {}",
                self.code,
                action,
                self.status.as_str()
            )));
        }

        self.alerts.push(PositionAlert {
            action,
            order_type,
            price,
            candle_time,
        });
        Ok(())
    }

    /// 收盘K线到达时更新持仓期间的最高最低价
    pub fn handle_candle(&mut self, candle: &Candle) {
        if !self.is_open() {
            return;
        }
        self.highest_high = Some(self.highest_high.map_or(candle.high, |h| h.max(candle.high)));
        self.lowest_low = Some(self.lowest_low.map_or(candle.low, |l| l.min(candle.low)));
    }

    /// 用进行中的K线检查条件单，第一笔触发的成交生效并清空其余条件单
    pub fn check_alerts(&mut self, candle: &Candle, tf: Timeframe) -> Option<TradeFill> {
        let fill = self.alerts.iter().find_map(|alert| {
            // 条件单只在下一根K线内有效
            if alert.candle_time + tf.ms() != candle.time {
                return None;
            }
            fill_price(alert.order_type, alert.action, alert.price, candle).map(|price| TradeFill {
                action: alert.action,
                order_type: alert.order_type,
                price,
                candle_time: candle.time,
            })
        })?;

        self.apply_fill(&fill, tf);
        self.alerts.clear();
        Some(fill)
    }

    fn apply_fill(&mut self, fill: &TradeFill, tf: Timeframe) {
        if fill.action.is_entry() {
            self.direction = Some(if fill.action == TradeAction::Long {
                PositionDirection::Long
            } else {
                PositionDirection::Short
            });
            self.status = PositionStatus::Open;
            self.highest_high = Some(fill.price);
            self.lowest_low = Some(fill.price);
            self.entry = Some(fill.clone());
        } else {
            self.status = PositionStatus::Closed;
            if let Some(entry) = &self.entry {
                let bars = (fill.candle_time - entry.candle_time).div_euclid(tf.ms());
                self.bars_held = u32::try_from(bars.max(0)).unwrap_or(u32::MAX);
            }
            self.exit = Some(fill.clone());
        }
    }
}
