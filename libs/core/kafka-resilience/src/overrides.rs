//! Per-listener configuration overrides
//!
//! Each listener may override any field of its topic family's
//! [`RetryTopicConfig`] with a string expression. An absent, empty or
//! [`UNSET`] value falls back to the static configuration. Overrides are
//! merged once, at registration time.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{ResilienceError, ResilienceResult};
use crate::settings::{MIN_DELAY_MS, RetryTopicConfig};

/// Sentinel meaning "use the static configuration".
pub const UNSET: &str = "unset";

/// String-valued overrides declared on a listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryTopicOverrides {
    pub enabled: Option<String>,
    pub retry_attempts: Option<String>,
    pub last_retry_attempts: Option<String>,
    pub delay: Option<String>,
    pub multiplier: Option<String>,
    pub dlt_topic_suffix: Option<String>,
    pub retry_topic_suffix: Option<String>,
    pub group_based_naming: Option<String>,
    pub use_dlt_on_no_retryable_exception: Option<String>,
    pub listener_factory_ref: Option<String>,
    pub auto_create_topics: Option<String>,
    pub dlt_enabled: Option<String>,
    pub reuse_strategy: Option<String>,
    pub dlt_strategy: Option<String>,
    pub timeout: Option<String>,
}

impl RetryTopicOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_attempts(mut self, value: impl Into<String>) -> Self {
        self.retry_attempts = Some(value.into());
        self
    }

    pub fn with_delay(mut self, value: impl Into<String>) -> Self {
        self.delay = Some(value.into());
        self
    }

    pub fn with_multiplier(mut self, value: impl Into<String>) -> Self {
        self.multiplier = Some(value.into());
        self
    }

    pub fn with_reuse_strategy(mut self, value: impl Into<String>) -> Self {
        self.reuse_strategy = Some(value.into());
        self
    }

    pub fn with_group_based_naming(mut self, value: impl Into<String>) -> Self {
        self.group_based_naming = Some(value.into());
        self
    }

    /// Merge onto `base`. Override values win unless unset; the result is
    /// clamped and validated.
    pub fn merge(&self, base: &RetryTopicConfig) -> ResilienceResult<RetryTopicConfig> {
        let retry_attempts = match set_value(self.retry_attempts.as_deref()) {
            Some(raw) => clamp_to_u32(parse::<i64>("retryAttempts", raw)?),
            None => base.retry_attempts,
        };
        let last_retry_attempts = match set_value(self.last_retry_attempts.as_deref()) {
            Some(raw) => clamp_to_u32(parse::<i64>("lastRetryAttempts", raw)?),
            None => base.last_retry_attempts,
        };
        let delay = match set_value(self.delay.as_deref()) {
            Some(raw) => parse::<i64>("delay", raw)?.max(MIN_DELAY_MS as i64) as u64,
            None => base.delay,
        };
        let timeout = match set_value(self.timeout.as_deref()) {
            Some(raw) => Some(parse::<i64>("timeout", raw)?).filter(|t| *t > 0).map(|t| t as u64),
            None => base.timeout,
        };

        let merged = RetryTopicConfig {
            enabled: override_bool("enabled", self.enabled.as_deref(), base.enabled)?,
            retry_attempts,
            last_retry_attempts,
            delay,
            multiplier: override_or("multiplier", self.multiplier.as_deref(), base.multiplier)?,
            dlt_topic_suffix: override_or(
                "dltTopicSuffix",
                self.dlt_topic_suffix.as_deref(),
                base.dlt_topic_suffix.clone(),
            )?,
            retry_topic_suffix: override_or(
                "retryTopicSuffix",
                self.retry_topic_suffix.as_deref(),
                base.retry_topic_suffix.clone(),
            )?,
            group_based_naming: override_bool(
                "groupBasedNaming",
                self.group_based_naming.as_deref(),
                base.group_based_naming,
            )?,
            use_dlt_on_no_retryable_exception: override_bool(
                "useDltOnNoRetryableException",
                self.use_dlt_on_no_retryable_exception.as_deref(),
                base.use_dlt_on_no_retryable_exception,
            )?,
            listener_factory_ref: set_value(self.listener_factory_ref.as_deref())
                .map(str::to_string)
                .or_else(|| base.listener_factory_ref.clone()),
            auto_create_topics: override_bool(
                "autoCreateTopics",
                self.auto_create_topics.as_deref(),
                base.auto_create_topics,
            )?,
            dlt_enabled: override_bool("dltEnabled", self.dlt_enabled.as_deref(), base.dlt_enabled)?,
            reuse_strategy: override_or(
                "reuseStrategy",
                self.reuse_strategy.as_deref(),
                base.reuse_strategy,
            )?,
            dlt_strategy: override_or("dltStrategy", self.dlt_strategy.as_deref(), base.dlt_strategy)?,
            timeout,
            ..base.clone()
        }
        .normalized();

        merged.validate()?;
        Ok(merged)
    }
}

/// The override value, or `None` when it means "fall back".
fn set_value(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(UNSET))
}

fn parse<T>(field: &'static str, raw: &str) -> ResilienceResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ResilienceError::InvalidOverride {
        field,
        value: raw.to_string(),
        details: e.to_string(),
    })
}

/// Typed "override or fallback" for one field.
pub fn override_or<T>(field: &'static str, raw: Option<&str>, fallback: T) -> ResilienceResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match set_value(raw) {
        Some(value) => parse(field, value),
        None => Ok(fallback),
    }
}

/// Case-insensitive boolean override.
pub fn override_bool(field: &'static str, raw: Option<&str>, fallback: bool) -> ResilienceResult<bool> {
    match set_value(raw) {
        Some(value) if value.eq_ignore_ascii_case("true") => Ok(true),
        Some(value) if value.eq_ignore_ascii_case("false") => Ok(false),
        Some(value) => Err(ResilienceError::InvalidOverride {
            field,
            value: value.to_string(),
            details: "expected true or false".to_string(),
        }),
        None => Ok(fallback),
    }
}

fn clamp_to_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}
