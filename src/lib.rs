// 导出模块
pub mod common;
pub mod exwatcher;
pub mod market;
pub mod robot;
pub mod runner;

// Re-export error types
pub use common::error::AppError;

// soft_assert! 通过 #[macro_export] 自动导出到 crate 根
