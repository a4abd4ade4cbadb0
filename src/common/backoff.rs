//! 行情请求的指数退避重试
//!
//! 只有 `FeedError::Network` 会被重试，交易所拒绝或不支持的品种立即失败。

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::market::feed::FeedError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 含首次调用在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 抖动占延迟的比例，0 表示不抖动
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次重试前的等待时间（从 0 开始）
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let spread = capped.as_secs_f64() * self.jitter.max(0.0);
        if spread <= 0.0 {
            return capped;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
    }
}

/// 按策略重试一个行情操作，`label` 只用于日志
pub async fn retry_feed<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    target: "订阅管理",
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "行情请求失败，退避后重试"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let ms = policy.delay_for(1).as_millis();
            assert!((799..=1201).contains(&ms), "delay was {}", ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_feed(&no_jitter(), "watch", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(FeedError::Network("reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_errors_fail_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), FeedError> = retry_feed(&no_jitter(), "watch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Exchange("bad symbol".into()))
        })
        .await;
        assert!(matches!(result, Err(FeedError::Exchange(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), FeedError> = retry_feed(&no_jitter(), "watch", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Network("timeout".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        println!("✅ 退避重试次数上限测试通过");
    }
}
