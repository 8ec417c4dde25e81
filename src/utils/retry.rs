use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::FailureKind;

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// 重试策略，时间单位为毫秒
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed {
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        delay: Duration,
    },
    /// 指数退避
    Exponential {
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        max_delay: Duration,
    },
    /// 线性退避
    Linear {
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        initial: Duration,
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        increment: Duration,
        #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// 计算第 n 次重试的延迟（n 从 0 开始）
    pub fn get_delay(&self, retry: u32) -> Duration {
        match self {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(retry as f64);
                if !delay.is_finite() || delay >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                // 负的倍数会得到负延迟
                Duration::from_secs_f64(delay.max(0.0))
            }
            RetryStrategy::Linear { initial, increment, max_delay } => {
                let delay = *initial + increment.saturating_mul(retry);
                std::cmp::min(delay, *max_delay)
            }
        }
    }
}

impl RetryStrategy {
    /// Rejects parameters that cannot produce a sensible backoff.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RetryStrategy::Exponential { multiplier, .. } if !multiplier.is_finite() || *multiplier < 0.0 => {
                Err(format!("exponential multiplier must be a non-negative number, got {}", multiplier))
            }
            _ => Ok(()),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Scheduler-level retry policy. Jobs themselves never retry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: RetryStrategy) -> Self {
        Self { max_retries, strategy }
    }

    /// Delay before the next attempt, or `None` when the failure is final.
    ///
    /// `attempt` is the number of attempts already executed.
    pub fn next_delay(&self, kind: FailureKind, attempt: u32) -> Option<Duration> {
        if !kind.is_retryable() || attempt > self.max_retries {
            return None;
        }

        Some(self.strategy.get_delay(attempt.saturating_sub(1)))
    }
}
