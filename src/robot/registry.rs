//! 机器人注册表与单机器人互斥
//!
//! 每个机器人的状态放在自己的 `tokio::sync::Mutex` 里，只有持锁才能读写。
//! 告警检查与定时调度都通过这把锁进入，保证同一机器人不会被并发执行。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::market::models::Market;
use crate::market::timeframe::Timeframe;
use crate::robot::models::{RobotState, RobotStatus};

/// 锁内的机器人
#[derive(Debug)]
pub struct RobotHandle {
    pub state: RobotState,
    /// 已停止并被移出注册表的句柄，等锁的任务拿到后应直接放弃
    pub evicted: bool,
}

impl RobotHandle {
    pub fn is_runnable(&self) -> bool {
        !self.evicted && self.state.status == RobotStatus::Started
    }
}

/// 注册表条目，键信息在锁外可读
pub struct RobotEntry {
    pub id: String,
    pub market: Market,
    pub timeframe: Timeframe,
    handle: Mutex<RobotHandle>,
}

impl RobotEntry {
    fn new(state: RobotState) -> Self {
        Self {
            id: state.id.clone(),
            market: state.market(),
            timeframe: state.timeframe,
            handle: Mutex::new(RobotHandle { state, evicted: false }),
        }
    }

    /// 等待获取机器人锁，按请求顺序排队
    pub async fn lock(&self) -> MutexGuard<'_, RobotHandle> {
        self.handle.lock().await
    }

    /// 锁被占用时立即返回 None
    pub fn try_lock(&self) -> Option<MutexGuard<'_, RobotHandle>> {
        self.handle.try_lock().ok()
    }
}

#[derive(Default)]
pub struct RobotRegistry {
    robots: RwLock<HashMap<String, Arc<RobotEntry>>>,
}

impl RobotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册机器人；已注册时返回已有条目，状态不被覆盖
    pub async fn register(&self, state: RobotState) -> Arc<RobotEntry> {
        let mut robots = self.robots.write().await;
        robots
            .entry(state.id.clone())
            .or_insert_with(|| {
                debug!(target: "机器人调度", robot_id = %state.id, timeframe = %state.timeframe, "机器人已注册");
                Arc::new(RobotEntry::new(state))
            })
            .clone()
    }

    pub async fn get(&self, robot_id: &str) -> Option<Arc<RobotEntry>> {
        self.robots.read().await.get(robot_id).cloned()
    }

    pub async fn contains(&self, robot_id: &str) -> bool {
        self.robots.read().await.contains_key(robot_id)
    }

    /// 移出注册表。调用方应已持有该机器人的锁并把句柄标记为 evicted。
    pub async fn evict(&self, robot_id: &str) -> Option<Arc<RobotEntry>> {
        self.robots.write().await.remove(robot_id)
    }

    pub async fn robots_for_timeframe(&self, tf: Timeframe) -> Vec<Arc<RobotEntry>> {
        let mut entries: Vec<Arc<RobotEntry>> = self
            .robots
            .read()
            .await
            .values()
            .filter(|e| e.timeframe == tf)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub async fn robots_for_market(&self, market: &Market) -> Vec<Arc<RobotEntry>> {
        self.robots
            .read()
            .await
            .values()
            .filter(|e| &e.market == market)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.robots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.robots.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(id: &str, tf: Timeframe) -> RobotState {
        let mut s = RobotState::new(id, &Market::new("kraken", "ETH", "USD"), tf, "breakout", json!({}));
        s.status = RobotStatus::Started;
        s
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_filters() {
        let registry = RobotRegistry::new();
        registry.register(state("a", Timeframe::H1)).await;
        registry.register(state("b", Timeframe::M5)).await;

        let mut changed = state("a", Timeframe::H1);
        changed.variables = json!({"x": 1});
        let entry = registry.register(changed).await;
        assert_eq!(entry.lock().await.state.variables, serde_json::Value::Null);

        let hourly: Vec<String> = registry
            .robots_for_timeframe(Timeframe::H1)
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(hourly, vec!["a".to_string()]);
        assert_eq!(registry.robots_for_market(&Market::new("kraken", "eth", "usd")).await.len(), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_try_lock_skips_busy_robot() {
        let registry = RobotRegistry::new();
        let entry = registry.register(state("a", Timeframe::H1)).await;

        let guard = entry.lock().await;
        assert!(entry.try_lock().is_none());
        drop(guard);
        assert!(entry.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_evicted_handle_is_not_runnable() {
        let registry = RobotRegistry::new();
        let entry = registry.register(state("a", Timeframe::H1)).await;
        {
            let mut handle = entry.lock().await;
            assert!(handle.is_runnable());
            handle.evicted = true;
        }
        registry.evict("a").await;
        assert!(!registry.contains("a").await);
        assert!(!entry.lock().await.is_runnable());
    }
}
