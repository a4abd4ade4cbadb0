//! 定时运行调度
//!
//! 每 2 秒检查一次。整分钟边界过去 `settle_delay` 之后（给聚合器留出收盘时间），
//! 对该边界上收盘的每个周期，并发运行该周期下全部已启动的机器人。边界上的机器人都
//! 拿到收盘K线后才标记完成，聚合节拍滞后时下一次检查重试，直到下一个分钟边界。

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::market::timeframe::{self, Timeframe, MINUTE_MS};
use crate::robot::registry::RobotEntry;
use crate::robot::strategy::{JobKind, RobotJob};
use crate::runner::Coordinator;

#[derive(Debug)]
pub struct RunScheduler {
    settle_delay_ms: i64,
    last_boundary: Option<i64>,
}

impl RunScheduler {
    pub fn new(settle_delay_ms: i64) -> Self {
        Self {
            settle_delay_ms,
            last_boundary: None,
        }
    }

    /// 返回本次需要处理的分钟边界及其收盘周期；已完成或无周期收盘时返回 None
    pub fn due(&mut self, now: i64) -> Option<(i64, Vec<Timeframe>)> {
        let boundary = (now - self.settle_delay_ms).div_euclid(MINUTE_MS) * MINUTE_MS;
        if self.last_boundary.map_or(false, |last| boundary <= last) {
            return None;
        }
        let timeframes = timeframe::boundaries_at(boundary);
        if timeframes.is_empty() {
            self.complete(boundary);
            return None;
        }
        Some((boundary, timeframes))
    }

    pub fn complete(&mut self, boundary: i64) {
        self.last_boundary = Some(self.last_boundary.map_or(boundary, |last| last.max(boundary)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Executed,
    /// 该K线已处理过
    AlreadyProcessed,
    /// 机器人未启动或已被移出
    NotRunnable,
    /// 窗口中还没有这根K线
    MissingCandle,
    Failed,
}

impl Coordinator {
    /// 调度检查入口，返回本次实际运行的机器人数
    pub async fn run_scheduler(&self, now: i64) -> usize {
        let due = self.scheduler.lock().await.due(now);
        let Some((boundary, timeframes)) = due else {
            return 0;
        };
        let outcomes = self.run_boundary(boundary, &timeframes).await;
        if outcomes.contains(&RunOutcome::MissingCandle) {
            debug!(target: "机器人调度", boundary = %timeframe::iso(boundary), "收盘K线未就绪，下次检查重试");
        } else {
            self.scheduler.lock().await.complete(boundary);
        }
        outcomes.iter().filter(|o| **o == RunOutcome::Executed).count()
    }

    /// 对 `boundary` 处收盘的各周期运行全部机器人
    #[instrument(target = "机器人调度", skip(self, timeframes), fields(timeframes = ?timeframes))]
    pub async fn run_boundary(&self, boundary: i64, timeframes: &[Timeframe]) -> Vec<RunOutcome> {
        let mut runs = Vec::new();
        for &tf in timeframes {
            let candle_time = timeframe::prev_since(boundary, tf);
            for entry in self.state.robots.robots_for_timeframe(tf).await {
                runs.push(self.run_scheduled(entry, candle_time));
            }
        }
        if runs.is_empty() {
            return Vec::new();
        }

        let total = runs.len();
        let outcomes = futures::future::join_all(runs).await;
        let executed = outcomes.iter().filter(|o| **o == RunOutcome::Executed).count();
        info!(
            target: "机器人调度",
            boundary = %timeframe::iso(boundary),
            total,
            executed,
            "定时运行完成"
        );
        outcomes
    }

    /// 在机器人锁内用截至 `candle_time` 的K线运行一次
    pub async fn run_scheduled(&self, entry: Arc<RobotEntry>, candle_time: i64) -> RunOutcome {
        let mut handle = entry.lock().await;
        if !handle.is_runnable() {
            return RunOutcome::NotRunnable;
        }
        if handle.state.last_candle.as_ref().map_or(false, |c| c.time >= candle_time) {
            debug!(target: "机器人调度", robot_id = %entry.id, candle_time, "该K线已处理");
            return RunOutcome::AlreadyProcessed;
        }

        let candles = self
            .state
            .aggregator
            .read()
            .await
            .window_until(&entry.market, entry.timeframe, candle_time);
        if candles.last().map(|c| c.time) != Some(candle_time) {
            warn!(
                target: "机器人调度",
                robot_id = %entry.id,
                market = %entry.market,
                timeframe = %entry.timeframe,
                candle_time,
                "窗口中没有待运行的K线"
            );
            return RunOutcome::MissingCandle;
        }

        let job = RobotJob {
            kind: JobKind::Candle,
            state: handle.state.clone(),
            candles,
            current: None,
        };
        match self.pool.execute(&job).await {
            Ok(result) => {
                self.apply_result(&mut handle, result).await;
                RunOutcome::Executed
            }
            Err(e) => {
                self.report_job_error(&entry.id, JobKind::Candle, &e);
                RunOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 1_709_251_200_000;

    #[test]
    fn test_due_once_per_boundary_after_settle() {
        let mut scheduler = RunScheduler::new(1500);

        // 边界后 1 秒：还在等待收盘，上一分钟没有周期收盘
        assert!(scheduler.due(DAY + 1000).is_none());

        let (boundary, tfs) = scheduler.due(DAY + 1500).unwrap();
        assert_eq!(boundary, DAY);
        assert_eq!(tfs, Timeframe::ALL.to_vec());
        scheduler.complete(boundary);

        assert!(scheduler.due(DAY + 3500).is_none());
        assert!(scheduler.due(DAY + 30_000).is_none());
    }

    #[test]
    fn test_minutes_without_closing_timeframe_are_skipped() {
        let mut scheduler = RunScheduler::new(1500);
        scheduler.due(DAY + 1500);
        scheduler.complete(DAY);
        // 00:01 没有周期收盘
        assert!(scheduler.due(DAY + MINUTE_MS + 1500).is_none());
        let (boundary, tfs) = scheduler.due(DAY + 5 * MINUTE_MS + 1500).unwrap();
        assert_eq!(boundary, DAY + 5 * MINUTE_MS);
        assert_eq!(tfs, vec![Timeframe::M5]);
    }

    #[test]
    fn test_unfinished_boundary_is_due_again() {
        let mut scheduler = RunScheduler::new(1500);
        let (boundary, _) = scheduler.due(DAY + 5 * MINUTE_MS + 1500).unwrap();

        // 未标记完成时下一次检查仍返回同一边界
        assert_eq!(scheduler.due(DAY + 5 * MINUTE_MS + 3500).map(|(b, _)| b), Some(boundary));
        scheduler.complete(boundary);
        assert!(scheduler.due(DAY + 5 * MINUTE_MS + 5500).is_none());

        // 下一个分钟边界到来后不再回头
        let mut lagging = RunScheduler::new(1500);
        lagging.due(DAY + 5 * MINUTE_MS + 1500);
        assert!(lagging.due(DAY + 6 * MINUTE_MS + 1500).is_none());
        assert!(lagging.due(DAY + 6 * MINUTE_MS + 3500).is_none());
    }
}
