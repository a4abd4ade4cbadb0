use thiserror::Error;

use crate::market::feed::FeedError;
use crate::robot::strategy::StrategyError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Feed error: {0}")]
    FeedError(#[from] FeedError),

    #[error("Strategy error: {0}")]
    StrategyError(#[from] StrategyError),

    #[error("Worker pool error: {0}")]
    WorkerPoolError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的错误分类字段 `error.summary`
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情数据获取
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::FeedError(e) if e.is_retryable() => "market_feed_network_failed",
            AppError::FeedError(_) => "market_feed_rejected",

            // 数据处理
            AppError::JsonError(_) => "robot_state_codec_failed",
            AppError::DataError(_) => "market_data_validation_failed",

            // 存储
            AppError::DatabaseError(_) => "robot_data_persistence_failed",
            AppError::SqliteError(_) => "robot_storage_operation_failed",

            // 策略执行
            AppError::StrategyError(_) => "strategy_execution_failed",
            AppError::WorkerPoolError(_) => "strategy_worker_pool_failed",

            // 系统资源
            AppError::IoError(_) => "file_operation_failed",

            AppError::ConfigError(_) => "service_configuration_invalid",
            AppError::NotFound(_) => "entity_not_found",
            AppError::InitializationError(_) => "service_initialization_failed",
        }
    }

    /// 检查错误是否为可重试类型
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(_) => true,
            AppError::FeedError(e) => e.is_retryable(),

            AppError::IoError(_) => true,

            // 数据库锁争用等可重试
            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            }
            AppError::SqliteError(_) => true,

            AppError::JsonError(_)
            | AppError::DataError(_)
            | AppError::ConfigError(_)
            | AppError::StrategyError(_)
            | AppError::WorkerPoolError(_)
            | AppError::NotFound(_)
            | AppError::InitializationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
