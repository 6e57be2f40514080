//! 调用方重试策略
//!
//! 下载池自身从不重试。失败的下载项以 `NetworkError` 结束后，由调用方决定是否重新入队。

use std::time::Duration;

use super::error::FailureReason;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 抖动因子，避免同时重试
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// 只有网络类失败值得重试，解析、文件系统和取消都不重试
    pub fn should_retry(&self, reason: FailureReason, retry_count: u32) -> bool {
        retry_count < self.max_retries && reason.is_retryable()
    }

    /// 第 `retry_count` 次重试前的等待时间（从 0 开始计）
    pub fn get_delay(&self, retry_count: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(retry_count as i32);
        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let delay = Duration::from_secs_f64((delay_secs + jitter).max(0.1)); // 最小100ms
        delay.min(self.max_delay)
    }
}
