//! 重试策略模块

pub mod exponential;

pub use exponential::ExponentialBackoffPolicy;

use std::time::Duration;

/// 重试策略 trait
pub trait RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间（从 0 开始）
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}
