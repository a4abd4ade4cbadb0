//! 业务逻辑软断言
//!
//! 条件不成立时只记录一条 `log_type = "assertion"` 的 WARN 事件，不中断流程。
//! 这些事件会被 `ProblemSummaryLayer` 收集进问题摘要文件。

/// 业务逻辑软断言。
///
/// ```
/// use robot_runner::soft_assert;
///
/// let high = 10.0;
/// let low = 9.0;
/// soft_assert!(high >= low, message = "K线高低价倒挂", high = high, low = low);
/// soft_assert!(high > 0.0, message = "价格应为正数");
/// ```
#[macro_export]
macro_rules! soft_assert {
    ($condition:expr, message = $msg:expr, $($key:ident = $value:expr),+ $(,)?) => {
        if !$condition {
            tracing::warn!(
                log_type = "assertion",
                condition = stringify!($condition),
                message = $msg,
                $($key = $value),+
            );
        }
    };
    ($condition:expr, message = $msg:expr $(,)?) => {
        if !$condition {
            tracing::warn!(
                log_type = "assertion",
                condition = stringify!($condition),
                message = $msg,
            );
        }
    };
}
