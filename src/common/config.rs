//! 机器人运行服务配置模块

use serde::{Deserialize, Serialize};

use crate::common::{AppError, Result};
use crate::market::timeframe::Timeframe;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/RobotRunnerConfig.toml";

    /// 每个品种×周期保留的已收盘K线数量
    pub const CANDLE_WINDOW_SIZE: usize = 300;

    /// K线节拍与落库间隔（毫秒）
    pub const CANDLE_TICK_INTERVAL_MS: u64 = 1000;

    /// 订阅对账间隔（秒）
    pub const SUBSCRIPTION_CHECK_INTERVAL_S: u64 = 30;

    /// 导入超时（分钟），超过即视为卡死
    pub const IMPORT_STUCK_MINUTES: i64 = 4;

    /// 告警检查间隔（毫秒）
    pub const ALERT_CHECK_INTERVAL_MS: u64 = 1000;

    /// 调度检查间隔（毫秒）
    pub const SCHEDULER_CHECK_INTERVAL_MS: u64 = 2000;

    /// 边界到达后等待K线收盘的时间（毫秒）
    pub const SCHEDULER_SETTLE_DELAY_MS: u64 = 1500;

    /// 策略工作池默认并发
    pub const DEFAULT_WORKER_CONCURRENCY: usize = 10;

    /// 关闭时的宽限期（秒）
    pub const SHUTDOWN_GRACE_PERIOD_S: u64 = 5;
}

use constants::*;

fn default_window_size() -> usize {
    CANDLE_WINDOW_SIZE
}

fn default_tick_interval_ms() -> u64 {
    CANDLE_TICK_INTERVAL_MS
}

fn default_check_interval_s() -> u64 {
    SUBSCRIPTION_CHECK_INTERVAL_S
}

fn default_import_stuck_minutes() -> i64 {
    IMPORT_STUCK_MINUTES
}

fn default_alert_interval_ms() -> u64 {
    ALERT_CHECK_INTERVAL_MS
}

fn default_scheduler_interval_ms() -> u64 {
    SCHEDULER_CHECK_INTERVAL_MS
}

fn default_settle_delay_ms() -> u64 {
    SCHEDULER_SETTLE_DELAY_MS
}

fn default_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}

fn default_grace_period_s() -> u64 {
    SHUTDOWN_GRACE_PERIOD_S
}

fn default_timeframes() -> Vec<u32> {
    Timeframe::ALL.iter().map(|tf| tf.minutes()).collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

/// 服务总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// 本进程负责的交易所，如 binance_futures
    pub exchange: String,

    /// 启动时额外订阅的市场，格式 ASSET/CURRENCY
    #[serde(default)]
    pub markets: Vec<String>,

    pub database: DatabaseConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    #[serde(default)]
    pub importer: ImporterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,
}

/// 行情与K线聚合配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// 参与聚合的周期（分钟）
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<u32>,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,

    #[serde(default = "default_import_stuck_minutes")]
    pub import_stuck_minutes: i64,
}

/// 调度与告警配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_alert_interval_ms")]
    pub alert_check_interval_ms: u64,

    #[serde(default = "default_scheduler_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_grace_period_s")]
    pub shutdown_grace_period_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// 历史导入协作方配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImporterConfig {
    /// 为 true 时进程内直接回复导入完成，用于独立运行
    #[serde(default)]
    pub loopback: bool,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 滚动日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 文件日志是否使用JSON格式
    #[serde(default = "default_true")]
    pub json_file: bool,

    #[serde(default = "default_true")]
    pub enable_console_output: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/robot_runner.db".to_string(),
            pool_size: 10,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            window_size: CANDLE_WINDOW_SIZE,
            tick_interval_ms: CANDLE_TICK_INTERVAL_MS,
            check_interval_s: SUBSCRIPTION_CHECK_INTERVAL_S,
            import_stuck_minutes: IMPORT_STUCK_MINUTES,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            alert_check_interval_ms: ALERT_CHECK_INTERVAL_MS,
            check_interval_ms: SCHEDULER_CHECK_INTERVAL_MS,
            settle_delay_ms: SCHEDULER_SETTLE_DELAY_MS,
            shutdown_grace_period_s: SHUTDOWN_GRACE_PERIOD_S,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            json_file: true,
            enable_console_output: true,
        }
    }
}

impl RunnerConfig {
    /// 以默认值构造，主要供测试使用
    pub fn for_exchange(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            markets: Vec::new(),
            database: DatabaseConfig::default(),
            feed: FeedConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            importer: ImporterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 解析后的周期列表，按分钟升序
    pub fn timeframes(&self) -> Result<Vec<Timeframe>> {
        let mut tfs = self
            .feed
            .timeframes
            .iter()
            .map(|m| {
                Timeframe::from_minutes(*m)
                    .ok_or_else(|| AppError::ConfigError(format!("不支持的周期: {}", m)))
            })
            .collect::<Result<Vec<_>>>()?;
        tfs.sort();
        tfs.dedup();
        Ok(tfs)
    }

    /// 解析 markets 列表为 (asset, currency)
    pub fn market_pairs(&self) -> Result<Vec<(String, String)>> {
        self.markets
            .iter()
            .map(|m| match m.split_once('/') {
                Some((asset, currency)) if !asset.is_empty() && !currency.is_empty() => {
                    Ok((asset.to_uppercase(), currency.to_uppercase()))
                }
                _ => Err(AppError::ConfigError(format!("无效的市场格式: {}", m))),
            })
            .collect()
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            return Err(AppError::ConfigError("exchange 不能为空".to_string()));
        }

        if self.feed.timeframes.is_empty() {
            return Err(AppError::ConfigError("支持的时间周期列表不能为空".to_string()));
        }
        self.timeframes()?;
        self.market_pairs()?;

        if self.feed.window_size == 0 {
            return Err(AppError::ConfigError("window_size 必须大于0".to_string()));
        }

        if self.worker_pool.concurrency == 0 {
            return Err(AppError::ConfigError("worker_pool.concurrency 必须大于0".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("database.pool_size 必须大于0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let raw = r#"
            exchange = "binance_futures"
            markets = ["btc/usdt"]

            [database]
            database_path = "data/test.db"
            pool_size = 4

            [feed]
            timeframes = [60, 5, 15]
        "#;
        let config: RunnerConfig = toml::from_str(raw).expect("配置应能解析");
        config.validate().expect("配置应有效");

        assert_eq!(config.feed.window_size, CANDLE_WINDOW_SIZE);
        assert_eq!(config.worker_pool.concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert!(!config.importer.loopback);
        assert_eq!(
            config.timeframes().unwrap(),
            vec![Timeframe::M5, Timeframe::M15, Timeframe::H1]
        );
        assert_eq!(
            config.market_pairs().unwrap(),
            vec![("BTC".to_string(), "USDT".to_string())]
        );
    }

    #[test]
    fn test_reject_unsupported_timeframe() {
        let mut config = RunnerConfig::for_exchange("binance_futures");
        config.feed.timeframes = vec![5, 7];
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }
}
