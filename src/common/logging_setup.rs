//! 日志系统初始化
//!
//! 一个 `Registry` 上叠加三层：控制台输出、按天滚动的文件日志（JSON），以及只收集
//! WARN/ERROR 和软断言事件的问题摘要层。`log` 生态的记录经 `tracing-log` 转入。

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::common::config::LoggingConfig;
use crate::common::{AppError, Result};

/// 日志守卫，main 持有到进程退出，丢弃时刷新文件写入器
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// 问题摘要条目
#[derive(Debug, Serialize)]
struct ProblemSummary {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    attributes: BTreeMap<String, Value>,
}

struct JsonVisitor<'a>(&'a mut BTreeMap<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
    }
}

/// 问题摘要层：只捕获问题、警告和软断言
pub struct ProblemSummaryLayer {
    writer: Mutex<BufWriter<File>>,
}

impl ProblemSummaryLayer {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, summary: &ProblemSummary) {
        let Ok(json) = serde_json::to_string(summary) else {
            return;
        };
        // 写日志的路径上不能再 panic，锁中毒时沿用内部数据
        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if writeln!(writer, "{}", json).is_ok() {
            let _ = writer.flush();
        }
    }
}

impl<S> Layer<S> for ProblemSummaryLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();

        let mut attributes = BTreeMap::new();
        event.record(&mut JsonVisitor(&mut attributes));

        let is_problem = level <= tracing::Level::WARN;
        let is_assertion = attributes.get("log_type").and_then(|v| v.as_str()) == Some("assertion");
        if !is_problem && !is_assertion {
            return;
        }

        let message = attributes
            .remove("message")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| metadata.name().to_string());

        self.write(&ProblemSummary {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.to_string(),
            target: metadata.target().to_string(),
            message,
            attributes,
        });
    }
}

fn filter_directive(level: &str) -> String {
    format!("{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn", level)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level)))
}

/// 初始化日志系统，返回的守卫必须由调用方持有
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "robot_runner.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if config.json_file {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_target(true)
            .with_filter(env_filter(&config.log_level))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_writer)
            .with_target(true)
            .with_filter(env_filter(&config.log_level))
            .boxed()
    };

    let console_layer = config.enable_console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_filter(env_filter(&config.log_level))
    });

    let summary_path = Path::new(&config.log_dir).join("problem_summary.log");
    let summary_layer = ProblemSummaryLayer::open(&summary_path)?;

    let subscriber = Registry::default()
        .with(file_layer)
        .with(console_layer)
        .with(summary_layer.with_filter(env_filter(&config.log_level)));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::InitializationError(format!("日志订阅者初始化失败: {}", e)))?;

    tracing_log::LogTracer::init()
        .map_err(|e| AppError::InitializationError(format!("日志桥接初始化失败: {}", e)))?;

    tracing::info!(
        target: "应用生命周期",
        log_type = "low_freq",
        log_level = %config.log_level,
        log_dir = %config.log_dir,
        json_file = config.json_file,
        console = config.enable_console_output,
        "日志系统初始化完成"
    );

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_summary_layer_keeps_only_problems() {
        let dir = std::env::temp_dir().join(format!("robot_runner_log_{}", std::process::id()));
        let path = dir.join("problem_summary.log");
        let layer = ProblemSummaryLayer::open(&path).expect("应能创建摘要文件");
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "K线聚合", "普通信息");
            tracing::warn!(target: "K线聚合", market = "BTC/USDT", "窗口写入被拒绝");
            crate::soft_assert!(1 > 2, message = "断言失败", left = 1);
        });

        let content = std::fs::read_to_string(&path).expect("应能读取摘要文件");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("窗口写入被拒绝"));
        assert!(lines[1].contains("\"log_type\":\"assertion\""));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_filter_directive_quietens_dependencies() {
        let directive = filter_directive("debug");
        assert!(directive.starts_with("debug,"));
        assert!(directive.contains("reqwest=warn"));
    }
}
