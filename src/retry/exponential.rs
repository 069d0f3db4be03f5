use rand::Rng;
use std::time::Duration;

use super::RetryPolicy;
use crate::config::PoolConfig;

/// 指数退避重试策略
///
/// 第 n 次重试的延迟为 `base_delay * multiplier^n`，不超过 `max_delay`，
/// 再叠加 `±jitter` 比例的随机抖动。
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 不含抖动的延迟
    pub fn base_backoff(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl From<&PoolConfig> for ExponentialBackoffPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self::new(
            config.max_attempts as usize,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_multiplier(config.multiplier)
        .with_jitter(config.jitter)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn backoff_duration(&self, attempt: usize) -> Duration {
        let delay = self.base_backoff(attempt).as_secs_f64();
        if self.jitter == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay * (1.0 + spread)).max(0.0))
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
