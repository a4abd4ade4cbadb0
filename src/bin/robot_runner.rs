//! 启动机器人运行服务。
//!
//! ## 执行模型
//! - 日志系统最先初始化，守卫在 main 中持有到进程结束。
//! - main 手动创建多线程 `io_runtime`，协调器的全部周期任务运行在其上。
//! - 策略计算在工作池的独立 OS 线程中执行，与 I/O 运行时隔离。
//! - Ctrl+C 触发优雅关闭：停止周期任务、取消订阅、落库剩余K线、回收工作池。

use anyhow::Result;
use clap::Parser;
use robot_runner::common::config::constants::DEFAULT_CONFIG_PATH;
use robot_runner::common::events::{BroadcastEventBus, DomainEvent, ImporterStatus, InboundEvent};
use robot_runner::common::logging_setup::init_logging;
use robot_runner::common::store::SqliteStore;
use robot_runner::common::RunnerConfig;
use robot_runner::market::feed::binance::BinanceTransport;
use robot_runner::market::feed::create_feed;
use robot_runner::robot::{StrategyRegistry, StrategyWorkerPool};
use robot_runner::runner::Coordinator;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, span, warn, Instrument, Level};

/// 事件总线缓冲
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "robot_runner", about = "实时K线聚合与交易机器人调度服务")]
struct Cli {
    /// 配置文件路径，未指定时读取环境变量 CONFIG_PATH，再退回默认路径
    #[arg(long)]
    config: Option<String>,

    /// 覆盖配置中的交易所
    #[arg(long)]
    exchange: Option<String>,
}

fn load_config(cli: &Cli) -> Result<(RunnerConfig, String)> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RunnerConfig::from_file(&path)?;
    if let Some(exchange) = &cli.exchange {
        config.exchange = exchange.clone();
        config.validate()?;
    }
    Ok((config, path))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_config(&cli)?;

    // 1. ==================== 日志系统必须最先初始化 ====================
    let _guard = init_logging(&config.logging)?;

    // 设置一个 panic hook 来捕获未处理的 panic
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(target: "应用生命周期", panic_info = %panic_info, "程序发生未捕获的Panic，即将退出");
        original_hook(panic_info);
        std::process::exit(1);
    }));

    // 2. 手动创建主 I/O 运行时
    let io_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("io-worker")
        .build()?;

    let main_span = span!(target: "应用生命周期", Level::INFO, "robot_runner_lifecycle");
    let result = io_runtime.block_on(run_app(config, config_path).instrument(main_span));

    if let Err(e) = &result {
        error!(target: "应用生命周期", error = ?e, "应用因顶层错误而异常退出");
    } else {
        info!(target: "应用生命周期", log_type = "low_freq", "应用程序正常关闭");
    }

    info!(target: "应用生命周期", "主IO运行时开始关闭...");
    io_runtime.shutdown_timeout(Duration::from_secs(5));
    info!(target: "应用生命周期", "主IO运行时已关闭");

    result
}

#[instrument(target = "应用生命周期", skip_all, name = "run_app")]
async fn run_app(config: RunnerConfig, config_path: String) -> Result<()> {
    info!(
        target: "应用生命周期",
        log_type = "low_freq",
        path = %config_path,
        exchange = %config.exchange,
        "配置文件加载成功"
    );

    // 不支持的交易所在这里直接失败
    let transport = Arc::new(BinanceTransport::for_exchange(&config.exchange)?);
    let feed = create_feed(&config.exchange, transport)?;

    let store = Arc::new(SqliteStore::open(
        &config.database.database_path,
        config.database.pool_size,
    )?);

    let (bus, inbound) = BroadcastEventBus::new(EVENT_BUS_CAPACITY);
    let bus = Arc::new(bus);

    let pool = Arc::new(StrategyWorkerPool::new(
        config.worker_pool.concurrency,
        Arc::new(StrategyRegistry::with_builtin()),
    )?);

    let loopback = config.importer.loopback.then(|| {
        warn!(target: "应用生命周期", log_type = "low_freq", "使用进程内回环导入器，历史回补直接视为完成");
        tokio::spawn(run_loopback_importer(bus.subscribe(), bus.inbound()))
    });

    let coordinator = Coordinator::new(config, feed, store, bus.clone(), pool)?;
    coordinator.start(inbound).await?;

    info!(target: "应用生命周期", "所有服务已启动，等待关闭信号 (Ctrl+C)...");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "应用生命周期", error = %e, "监听关闭信号失败，立即关闭");
    } else {
        info!(target: "应用生命周期", log_type = "low_freq", reason = "received_ctrl_c", "接收到关闭信号，开始优雅关闭");
    }

    coordinator.shutdown().await;
    if let Some(handle) = loopback {
        handle.abort();
    }
    Ok(())
}

/// 回环导入器：收到导入请求后立即回报完成
#[instrument(target = "订阅管理", skip_all, name = "loopback_importer")]
async fn run_loopback_importer(mut events: broadcast::Receiver<DomainEvent>, inbound: mpsc::Sender<InboundEvent>) {
    loop {
        match events.recv().await {
            Ok(DomainEvent::ImporterStart { id, asset, currency, .. }) => {
                debug!(target: "订阅管理", importer_id = %id, %asset, %currency, "回环导入完成");
                let reply = InboundEvent::ImporterStatus {
                    id,
                    status: ImporterStatus::Finished,
                };
                if inbound.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "订阅管理", skipped, "回环导入器落后，部分事件被跳过");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
