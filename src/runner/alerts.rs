//! 告警簿与告警检查
//!
//! 告警簿保存所有机器人挂出的条件单。检查每秒一次：条件单的生效K线正在进行中、
//! 且该K线的最高/最低价满足触发规则时，尝试获取机器人锁并提交 `alerts` 任务。
//! 机器人正忙时本轮跳过，下一轮再试。

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};

use crate::market::models::Candle;
use crate::robot::models::Alert;
use crate::robot::position::fill_price;
use crate::robot::strategy::{JobKind, RobotJob};
use crate::runner::Coordinator;

#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: HashMap<String, Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用机器人最新的条件单集合替换旧条目
    pub fn replace_robot(&mut self, robot_id: &str, alerts: Vec<Alert>) {
        self.remove_robot(robot_id);
        for alert in alerts {
            self.alerts.insert(alert.id.clone(), alert);
        }
    }

    pub fn remove_robot(&mut self, robot_id: &str) -> usize {
        let before = self.alerts.len();
        self.alerts.retain(|_, a| a.robot_id != robot_id);
        before - self.alerts.len()
    }

    pub fn remove(&mut self, alert_id: &str) -> Option<Alert> {
        self.alerts.remove(alert_id)
    }

    /// 删除已过期的条件单
    pub fn purge_expired(&mut self, now: i64) -> usize {
        let before = self.alerts.len();
        self.alerts.retain(|_, a| !a.is_expired(now));
        before - self.alerts.len()
    }

    /// 当前有效的条件单，按机器人排序
    pub fn active(&self, now: i64) -> Vec<Alert> {
        let mut active: Vec<Alert> = self.alerts.values().filter(|a| a.is_active(now)).cloned().collect();
        active.sort_by(|a, b| a.robot_id.cmp(&b.robot_id).then(a.id.cmp(&b.id)));
        active
    }

    pub fn contains(&self, alert_id: &str) -> bool {
        self.alerts.contains_key(alert_id)
    }

    pub fn for_robot(&self, robot_id: &str) -> Vec<Alert> {
        self.alerts.values().filter(|a| a.robot_id == robot_id).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlertPass {
    pub expired: usize,
    pub triggered: usize,
    pub executed: usize,
    pub busy: usize,
}

enum AlertOutcome {
    Executed,
    Busy,
    Skipped,
}

impl Coordinator {
    /// 一轮告警检查
    pub async fn check_alerts(&self, now: i64) -> AlertPass {
        let mut pass = AlertPass::default();
        let candidates = {
            let mut book = self.state.alerts.lock().await;
            pass.expired = book.purge_expired(now);
            book.active(now)
        };
        if pass.expired > 0 {
            trace!(target: "告警检查", expired = pass.expired, "已清理过期条件单");
        }
        if candidates.is_empty() {
            return pass;
        }

        // 每个机器人只需要一次 alerts 任务，任务内会处理该机器人的全部条件单
        let mut triggered: BTreeMap<String, (Vec<String>, Candle)> = BTreeMap::new();
        {
            let aggregator = self.state.aggregator.read().await;
            for alert in candidates {
                let Some(candle) = aggregator.working(&alert.market, alert.timeframe) else {
                    continue;
                };
                if candle.time != alert.active_from {
                    continue;
                }
                if fill_price(alert.order_type, alert.action, alert.price, candle).is_none() {
                    continue;
                }
                debug!(
                    target: "告警检查",
                    robot_id = %alert.robot_id,
                    action = ?alert.action,
                    order_type = ?alert.order_type,
                    price = alert.price,
                    high = candle.high,
                    low = candle.low,
                    "条件单触发"
                );
                pass.triggered += 1;
                triggered
                    .entry(alert.robot_id.clone())
                    .or_insert_with(|| (Vec::new(), candle.clone()))
                    .0
                    .push(alert.id);
            }
        }

        let runs = triggered.into_iter().map(|(robot_id, (alert_ids, candle))| async move {
            let outcome = self.run_alerts_job(&robot_id, &alert_ids, candle).await;
            (robot_id, alert_ids, outcome)
        });
        for (robot_id, alert_ids, outcome) in futures::future::join_all(runs).await {
            match outcome {
                AlertOutcome::Executed => {
                    pass.executed += 1;
                    let mut book = self.state.alerts.lock().await;
                    for id in &alert_ids {
                        book.remove(id);
                    }
                }
                AlertOutcome::Busy => {
                    pass.busy += 1;
                    debug!(target: "告警检查", robot_id = %robot_id, "机器人正忙，下一轮重试");
                }
                AlertOutcome::Skipped => {}
            }
        }

        if pass.executed > 0 {
            info!(target: "告警检查", triggered = pass.triggered, executed = pass.executed, busy = pass.busy, "告警检查完成");
        }
        pass
    }

    async fn run_alerts_job(&self, robot_id: &str, alert_ids: &[String], current: Candle) -> AlertOutcome {
        let Some(entry) = self.state.robots.get(robot_id).await else {
            // 机器人已不在注册表中，条件单随之作废
            self.state.alerts.lock().await.remove_robot(robot_id);
            return AlertOutcome::Skipped;
        };
        let Some(mut handle) = entry.try_lock() else {
            return AlertOutcome::Busy;
        };
        if !handle.is_runnable() {
            return AlertOutcome::Skipped;
        }
        {
            // 拿到锁之前另一轮检查可能已经处理过这些条件单
            let book = self.state.alerts.lock().await;
            if !alert_ids.iter().any(|id| book.contains(id)) {
                return AlertOutcome::Skipped;
            }
        }

        let tf = entry.timeframe;
        let candles = self
            .state
            .aggregator
            .read()
            .await
            .window_until(&entry.market, tf, current.time - tf.ms());
        let job = RobotJob {
            kind: JobKind::Alerts,
            state: handle.state.clone(),
            candles,
            current: Some(current),
        };

        match self.pool.execute(&job).await {
            Ok(result) => {
                self.apply_result(&mut handle, result).await;
                AlertOutcome::Executed
            }
            Err(e) => {
                self.report_job_error(robot_id, JobKind::Alerts, &e);
                AlertOutcome::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::models::Market;
    use crate::market::timeframe::Timeframe;
    use crate::robot::models::{OrderType, TradeAction};

    const T0: i64 = 1_709_251_200_000;
    const H: i64 = 3_600_000;

    fn alert(id: &str, robot_id: &str, candle_time: i64) -> Alert {
        Alert {
            id: id.to_string(),
            robot_id: robot_id.to_string(),
            market: Market::new("binance_futures", "BTC", "USDT"),
            timeframe: Timeframe::H1,
            position_id: "p1".to_string(),
            action: TradeAction::Long,
            order_type: OrderType::Stop,
            price: 100.0,
            candle_time,
            active_from: candle_time + H,
            active_to: candle_time + 2 * H - 1,
        }
    }

    #[test]
    fn test_active_window_and_expiry() {
        let mut book = AlertBook::new();
        book.replace_robot("r1", vec![alert("a", "r1", T0)]);

        assert!(book.active(T0 + H - 1).is_empty());
        assert_eq!(book.active(T0 + H).len(), 1);
        assert_eq!(book.active(T0 + 2 * H - 2).len(), 1);
        assert!(book.active(T0 + 2 * H - 1).is_empty());

        assert_eq!(book.purge_expired(T0 + 2 * H - 2), 0);
        assert_eq!(book.purge_expired(T0 + 2 * H - 1), 1);
        assert!(book.is_empty());
    }

    #[test]
    fn test_replace_only_touches_one_robot() {
        let mut book = AlertBook::new();
        book.replace_robot("r1", vec![alert("a", "r1", T0), alert("b", "r1", T0)]);
        book.replace_robot("r2", vec![alert("c", "r2", T0)]);
        book.replace_robot("r1", vec![alert("d", "r1", T0 + H)]);

        let mut ids: Vec<String> = book.for_robot("r1").into_iter().map(|a| a.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["d".to_string()]);
        assert_eq!(book.len(), 2);
        assert_eq!(book.remove_robot("r2"), 1);
    }
}
