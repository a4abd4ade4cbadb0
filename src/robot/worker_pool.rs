//! 策略工作池
//!
//! 固定数量的具名 OS 线程，从 crossbeam 通道领取任务。任务与结果都是 serde_json 字节，
//! 工作线程看不到协调器的任何内存。信号量限制同时在途的任务数。

use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::common::{AppError, Result};
use crate::robot::strategy::{execute_encoded, JobResult, RobotJob, StrategyError, StrategyRegistry};

struct PoolTask {
    payload: Vec<u8>,
    reply: oneshot::Sender<std::result::Result<Vec<u8>, StrategyError>>,
}

pub struct StrategyWorkerPool {
    sender: Mutex<Option<Sender<PoolTask>>>,
    slots: Arc<Semaphore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_loop(worker_id: usize, rx: Receiver<PoolTask>, registry: Arc<StrategyRegistry>) {
    debug!(target: "策略工作池", worker_id, "工作线程已启动");
    // 发送端全部丢弃后 recv 返回错误，此时队列中的任务已被处理完
    while let Ok(task) = rx.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| execute_encoded(&registry, &task.payload)));
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(target: "策略工作池", worker_id, panic = %message, "策略执行发生 panic");
                Err(StrategyError::Panicked(message))
            }
        };
        if task.reply.send(result).is_err() {
            warn!(target: "策略工作池", worker_id, "任务结果无人接收");
        }
    }
    debug!(target: "策略工作池", worker_id, "工作线程已退出");
}

impl StrategyWorkerPool {
    pub fn new(concurrency: usize, registry: Arc<StrategyRegistry>) -> Result<Self> {
        if concurrency == 0 {
            return Err(AppError::WorkerPoolError("concurrency must be > 0".into()));
        }

        let (tx, rx) = crossbeam_channel::unbounded::<PoolTask>();
        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let rx = rx.clone();
            let registry = registry.clone();
            let parent_span = Span::current();
            let handle = std::thread::Builder::new()
                .name(format!("strategy-worker-{}", worker_id))
                .spawn(move || parent_span.in_scope(|| worker_loop(worker_id, rx, registry)))
                .map_err(|e| AppError::WorkerPoolError(format!("启动工作线程失败: {}", e)))?;
            workers.push(handle);
        }

        info!(target: "策略工作池", log_type = "low_freq", concurrency, "策略工作池已启动");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            slots: Arc::new(Semaphore::new(concurrency)),
            workers: Mutex::new(workers),
            concurrency,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 提交一个任务并等待结果。策略错误或 panic 只让这一个任务失败。
    #[instrument(target = "策略工作池", skip_all, fields(robot_id = %job.state.id, kind = ?job.kind))]
    pub async fn execute(&self, job: &RobotJob) -> Result<JobResult> {
        let payload = serde_json::to_vec(job)?;

        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| AppError::WorkerPoolError("pool is shut down".into()))?;

        let (reply, rx) = oneshot::channel();
        {
            let sender = self.sender.lock().await;
            let sender = sender
                .as_ref()
                .ok_or_else(|| AppError::WorkerPoolError("pool is shut down".into()))?;
            sender
                .send(PoolTask { payload, reply })
                .map_err(|_| AppError::WorkerPoolError("all workers have exited".into()))?;
        }

        let bytes = rx
            .await
            .map_err(|_| AppError::WorkerPoolError("worker dropped the job".into()))??;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// 停止接收新任务，等待在途任务完成后回收线程
    pub async fn shutdown(&self) {
        self.slots.close();
        self.sender.lock().await.take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        let joined = tokio::task::spawn_blocking(move || {
            handles.into_iter().map(|h| h.join().is_ok()).filter(|ok| *ok).count()
        })
        .await;
        match joined {
            Ok(clean) => info!(target: "策略工作池", workers = count, clean, "策略工作池已关闭"),
            Err(e) => warn!(target: "策略工作池", error = %e, "回收工作线程失败"),
        }
    }
}
