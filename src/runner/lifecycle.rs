//! 机器人生命周期：启动、停止、随订阅激活加载，以及任务结果（信号、持仓、状态）的合并与持久化

use tracing::{error, info, warn};

use crate::common::events::DomainEvent;
use crate::common::{AppError, Result};
use crate::market::models::Market;
use crate::market::timeframe;
use crate::robot::models::{collect_alerts, RobotStatus};
use crate::robot::registry::RobotHandle;
use crate::robot::strategy::{JobKind, JobResult, RobotJob};
use crate::runner::{now_ms, Coordinator};

impl Coordinator {
    /// 合并任务结果：替换状态，落库信号与持仓并保存状态，再发布事件并刷新告警簿
    pub(crate) async fn apply_result(&self, handle: &mut RobotHandle, result: JobResult) {
        let JobResult {
            state,
            positions_to_save,
            events,
            alerts,
            signals,
        } = result;
        handle.state = state;
        let robot_id = handle.state.id.clone();

        if let Err(e) = self.store.save_signals(&signals).await {
            error!(
                target: "持久化",
                robot_id = %robot_id,
                signals = signals.len(),
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "保存信号失败"
            );
        }

        if let Err(e) = self.store.upsert_positions(&positions_to_save).await {
            error!(
                target: "持久化",
                robot_id = %robot_id,
                positions = positions_to_save.len(),
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "保存持仓失败"
            );
        }
        self.save_state(handle).await;

        for event in events {
            self.bus.emit(event);
        }
        self.state.alerts.lock().await.replace_robot(&robot_id, alerts);
    }

    /// 策略错误只记录并通知，机器人状态保持不变，下次仍可运行
    pub(crate) fn report_job_error(&self, robot_id: &str, kind: JobKind, e: &AppError) {
        error!(
            target: "机器人调度",
            robot_id,
            kind = ?kind,
            error.summary = e.get_error_type_summary(),
            error.details = %e,
            "机器人任务失败"
        );
        self.bus.emit(DomainEvent::RobotError {
            robot_id: robot_id.to_string(),
            error: e.to_string(),
        });
    }

    async fn save_state(&self, handle: &RobotHandle) {
        if let Err(e) = self.store.save_robot_state(&handle.state).await {
            error!(
                target: "持久化",
                robot_id = %handle.state.id,
                error.summary = e.get_error_type_summary(),
                error.details = %e,
                "保存机器人状态失败"
            );
        }
    }

    /// 处理 starting 信号
    pub async fn start_robot(&self, robot_id: &str, now: i64) -> Result<()> {
        if let Some(entry) = self.state.robots.get(robot_id).await {
            if entry.lock().await.is_runnable() {
                info!(target: "机器人调度", robot_id, "机器人已在运行");
                return Ok(());
            }
        }

        let mut state = self
            .store
            .load_robot_state(robot_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("robot {}", robot_id)))?;
        if state.exchange != self.config.exchange {
            warn!(target: "机器人调度", robot_id, exchange = %state.exchange, "机器人不属于本交易所，忽略");
            return Ok(());
        }
        state.status = RobotStatus::Starting;
        let market = state.market();
        let tf = state.timeframe;

        let entry = self.state.robots.register(state).await;
        let mut handle = entry.lock().await;
        // 注册表中已有条目时以已有状态为准
        handle.state.status = RobotStatus::Starting;

        let candles = self
            .state
            .aggregator
            .read()
            .await
            .window_until(&market, tf, timeframe::prev_since(now, tf));
        let job = RobotJob {
            kind: JobKind::Start,
            state: handle.state.clone(),
            candles,
            current: None,
        };

        match self.pool.execute(&job).await {
            Ok(result) => {
                self.apply_result(&mut handle, result).await;
                info!(target: "机器人调度", robot_id, market = %market, timeframe = %tf, "机器人已启动");
            }
            Err(e) => {
                self.report_job_error(robot_id, JobKind::Start, &e);
                handle.state.status = RobotStatus::Stopped;
                handle.evicted = true;
                self.save_state(&handle).await;
                drop(handle);
                self.state.robots.evict(robot_id).await;
                return Err(e);
            }
        }
        drop(handle);

        self.exwatcher
            .add_subscription(&market.exchange, &market.asset, &market.currency, now)
            .await;
        Ok(())
    }

    /// 处理 stopping 信号：等锁、撤销条件单、运行停止钩子、落库并移出注册表
    pub async fn stop_robot(&self, robot_id: &str) -> Result<()> {
        let Some(entry) = self.state.robots.get(robot_id).await else {
            warn!(target: "机器人调度", robot_id, "停止信号对应的机器人未在运行");
            return Ok(());
        };

        let mut handle = entry.lock().await;
        self.state.alerts.lock().await.remove_robot(robot_id);
        handle.state.status = RobotStatus::Stopping;

        let job = RobotJob {
            kind: JobKind::Stop,
            state: handle.state.clone(),
            candles: Vec::new(),
            current: None,
        };
        match self.pool.execute(&job).await {
            Ok(result) => self.apply_result(&mut handle, result).await,
            Err(e) => {
                self.report_job_error(robot_id, JobKind::Stop, &e);
                handle.state.status = RobotStatus::Stopped;
                handle.state.stopped_at = Some(timeframe::iso(now_ms()));
                for position in handle.state.positions.iter_mut() {
                    position.clear_alerts();
                }
                handle.state.refresh_has_alerts();
                self.save_state(&handle).await;
                self.bus.emit(DomainEvent::RobotStopped {
                    robot_id: robot_id.to_string(),
                });
            }
        }

        handle.evicted = true;
        drop(handle);
        self.state.robots.evict(robot_id).await;
        self.state.alerts.lock().await.remove_robot(robot_id);
        info!(target: "机器人调度", robot_id, "机器人已停止");
        Ok(())
    }

    /// 订阅激活后加载该品种上全部已启动的机器人（不运行启动钩子）
    pub async fn load_market_robots(&self, market: &Market) -> Result<usize> {
        let states = self.store.load_started_robots(market).await?;
        let mut loaded = 0;
        for state in states {
            if self.state.robots.contains(&state.id).await {
                continue;
            }
            let robot_id = state.id.clone();
            let alerts = collect_alerts(&state);
            self.state.robots.register(state).await;
            self.state.alerts.lock().await.replace_robot(&robot_id, alerts);
            loaded += 1;
        }
        info!(target: "机器人调度", market = %market, loaded, "已加载品种上的机器人");
        Ok(loaded)
    }
}
