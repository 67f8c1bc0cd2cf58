//! Backoff policies for the retry-topic chain
//!
//! ```text
//! SINGLE_TOPIC    -> Fixed { period = delay }
//! MULTIPLE_TOPICS -> Exponential { initial = delay, multiplier,
//!                                  max = delay * (1 + m + ... + m^(n-1)) }
//! ```
//!
//! The cap bounds the last topic's delay by the total time spent in all
//! attempts instead of letting it grow by one more multiplication.

use crate::settings::{RetryTopicConfig, SameIntervalTopicReuseStrategy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackOffPolicy {
    /// Same delay for every attempt
    Fixed { period: u64 },
    /// Geometric growth capped at `max_interval`
    Exponential {
        initial_interval: u64,
        multiplier: f64,
        max_interval: u64,
    },
}

impl BackOffPolicy {
    /// Select the policy for a merged configuration
    pub fn for_config(config: &RetryTopicConfig) -> Self {
        match config.reuse_strategy {
            SameIntervalTopicReuseStrategy::SingleTopic => BackOffPolicy::Fixed {
                period: config.delay,
            },
            SameIntervalTopicReuseStrategy::MultipleTopics => BackOffPolicy::Exponential {
                initial_interval: config.delay,
                multiplier: config.multiplier,
                max_interval: max_interval(config.delay, config.multiplier, config.retry_attempts),
            },
        }
    }

    /// Delay of each retry attempt, in order
    pub fn delays(&self, retry_attempts: u32) -> Vec<u64> {
        match *self {
            BackOffPolicy::Fixed { period } => vec![period; retry_attempts as usize],
            BackOffPolicy::Exponential {
                initial_interval,
                multiplier,
                max_interval,
            } => {
                let mut delays = Vec::with_capacity(retry_attempts as usize);
                let mut current = initial_interval.min(max_interval);
                for _ in 0..retry_attempts {
                    delays.push(current);
                    current = scale(current, multiplier).min(max_interval);
                }
                delays
            }
        }
    }
}

/// Sum of the geometric series `delay * m^i` for `retry_attempts` terms.
/// Fewer than two attempts cap at `delay` itself.
pub fn max_interval(delay: u64, multiplier: f64, retry_attempts: u32) -> u64 {
    if retry_attempts < 2 {
        return delay;
    }

    let mut total: u64 = 0;
    let mut term = delay;
    for _ in 0..retry_attempts {
        total = total.saturating_add(term);
        term = scale(term, multiplier);
    }
    total
}

fn scale(value: u64, multiplier: f64) -> u64 {
    let scaled = value as f64 * multiplier;
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}
