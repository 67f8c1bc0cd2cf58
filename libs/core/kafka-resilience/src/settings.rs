//! Configuration surface
//!
//! - `RetryTopicConfig`: per topic family retry settings
//! - `RetryTopicProperties`: defaults plus a map keyed by base topic name
//! - `KafkaSettings`: process-wide settings loaded from the environment

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use strum::{AsRefStr, Display as StrumDisplay, EnumString};
use thiserror::Error;

use crate::error::ResilienceError;

/// Smallest delay a retry topic may use.
pub const MIN_DELAY_MS: u64 = 1000;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

impl From<ConfigError> for ResilienceError {
    fn from(err: ConfigError) -> Self {
        ResilienceError::Config(err.to_string())
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Environment variable or a default
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Environment variable or `MissingEnvVar`
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Deployment environment, drives log formatting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        if env_or_default("APP_ENV", "development").eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Listener acknowledgment mode of the broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(StrumDisplay, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckMode {
    /// Commit after each record returns
    Record,
    /// Commit after each poll batch
    #[default]
    Batch,
    /// Listener acknowledges, commits are queued
    Manual,
    /// Listener acknowledges, commit happens immediately
    ManualImmediate,
}

impl AckMode {
    /// Whether the listener itself must acknowledge
    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual | AckMode::ManualImmediate)
    }
}

/// How attempts with the same interval are spread over retry topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(StrumDisplay, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SameIntervalTopicReuseStrategy {
    /// One retry topic per attempt
    #[default]
    MultipleTopics,
    /// All attempts share one retry topic (fixed backoff)
    SingleTopic,
}

/// What happens when processing on the DLT itself fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(StrumDisplay, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DltStrategy {
    /// Send the record back to the DLT
    #[default]
    AlwaysRetryOnError,
    /// Give up, acknowledge and stop
    FailOnError,
}

/// Retry settings for one topic family.
///
/// Every field has a default so partial JSON documents deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryTopicConfig {
    pub enabled: bool,
    /// Retries after the first delivery
    pub retry_attempts: u32,
    /// Extra deliveries on the last retry topic before giving up
    pub last_retry_attempts: u32,
    /// Initial delay in millis
    pub delay: u64,
    pub multiplier: f64,
    pub dlt_topic_suffix: String,
    pub retry_topic_suffix: String,
    #[serde(alias = "groupBasedRetryAndDltTopics")]
    pub group_based_naming: bool,
    pub use_dlt_on_no_retryable_exception: bool,
    pub listener_factory_ref: Option<String>,
    pub auto_create_topics: bool,
    pub num_partitions: i32,
    pub replication_factor: i16,
    pub dlt_enabled: bool,
    pub reuse_strategy: SameIntervalTopicReuseStrategy,
    pub dlt_strategy: DltStrategy,
    /// Millis after the original timestamp when retrying stops
    pub timeout: Option<u64>,
    /// Prefix stripped from group ids for group-based naming
    pub resource_prefix: Option<String>,
}

impl Default for RetryTopicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_attempts: 3,
            last_retry_attempts: 0,
            delay: MIN_DELAY_MS,
            multiplier: 2.0,
            dlt_topic_suffix: "-dlt".to_string(),
            retry_topic_suffix: "-retry".to_string(),
            group_based_naming: false,
            use_dlt_on_no_retryable_exception: true,
            listener_factory_ref: None,
            auto_create_topics: true,
            num_partitions: 1,
            replication_factor: 1,
            dlt_enabled: true,
            reuse_strategy: SameIntervalTopicReuseStrategy::MultipleTopics,
            dlt_strategy: DltStrategy::AlwaysRetryOnError,
            timeout: None,
            resource_prefix: None,
        }
    }
}

impl RetryTopicConfig {
    /// Total deliveries including the first one
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    /// Clamp values into their valid ranges
    pub fn normalized(mut self) -> Self {
        self.delay = self.delay.max(MIN_DELAY_MS);
        self
    }

    /// Reject configurations the topology builder cannot honour.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::config(format!(
                "multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.retry_topic_suffix.is_empty() || self.dlt_topic_suffix.is_empty() {
            return Err(ResilienceError::config("retry and dlt suffixes must not be empty"));
        }
        if self.retry_topic_suffix == self.dlt_topic_suffix {
            return Err(ResilienceError::config(format!(
                "retry and dlt suffixes must differ, both are '{}'",
                self.retry_topic_suffix
            )));
        }
        if self.num_partitions < 1 || self.replication_factor < 1 {
            return Err(ResilienceError::config(
                "numPartitions and replicationFactor must be positive",
            ));
        }
        Ok(())
    }
}

/// Retry settings of every topic family, keyed by base topic name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryTopicProperties {
    /// Used for topics without an explicit entry
    pub defaults: RetryTopicConfig,
    pub topics: HashMap<String, RetryTopicConfig>,
}

impl RetryTopicProperties {
    pub fn new(defaults: RetryTopicConfig) -> Self {
        Self {
            defaults,
            topics: HashMap::new(),
        }
    }

    pub fn with_topic(mut self, base_topic: impl Into<String>, config: RetryTopicConfig) -> Self {
        self.topics.insert(base_topic.into(), config);
        self
    }

    /// Configuration for a base topic
    pub fn for_topic(&self, base_topic: &str) -> &RetryTopicConfig {
        self.topics.get(base_topic).unwrap_or(&self.defaults)
    }

    /// Explicit entry for a base topic, if any
    pub fn explicit(&self, base_topic: &str) -> Option<&RetryTopicConfig> {
        self.topics.get(base_topic)
    }

    /// Parse a JSON object of base topic to config
    pub fn from_json(raw: &str) -> Result<HashMap<String, RetryTopicConfig>, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn apply_resource_prefix(&mut self, prefix: &str) {
        for config in std::iter::once(&mut self.defaults).chain(self.topics.values_mut()) {
            if config.resource_prefix.is_none() {
                config.resource_prefix = Some(prefix.to_string());
            }
        }
    }
}

/// Central cross-service dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDltSettings {
    pub enabled: bool,
    pub topic: String,
}

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub environment: Environment,
    pub application_name: String,
    pub ack_mode: AckMode,
    pub central_dlt: CentralDltSettings,
    /// Redelivery delay when a breaker rejects a call
    pub nack_delay_ms: u64,
    pub retry_topics: RetryTopicProperties,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            application_name: "kafka-app".to_string(),
            ack_mode: AckMode::Manual,
            central_dlt: CentralDltSettings {
                enabled: false,
                topic: "central-dlt".to_string(),
            },
            nack_delay_ms: 1000,
            retry_topics: RetryTopicProperties::default(),
        }
    }
}

impl FromEnv for KafkaSettings {
    /// Reads `KAFKA_*` variables. `KAFKA_CENTRAL_DLT_TOPIC` is required when
    /// the central DLT is enabled.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = KafkaSettings::default();

        let central_enabled = env_parse("KAFKA_CENTRAL_DLT_ENABLED", false)?;
        let central_topic = if central_enabled {
            env_required("KAFKA_CENTRAL_DLT_TOPIC")?
        } else {
            env_or_default("KAFKA_CENTRAL_DLT_TOPIC", &defaults.central_dlt.topic)
        };

        let mut retry_topics = RetryTopicProperties::default();
        if let Ok(raw) = env::var("KAFKA_RETRY_TOPICS") {
            retry_topics.topics =
                RetryTopicProperties::from_json(&raw).map_err(|e| ConfigError::ParseError {
                    key: "KAFKA_RETRY_TOPICS".to_string(),
                    details: e.to_string(),
                })?;
        }
        if let Ok(prefix) = env::var("KAFKA_RESOURCE_PREFIX") {
            retry_topics.apply_resource_prefix(&prefix);
        }

        Ok(Self {
            environment: Environment::from_env(),
            application_name: env_or_default("KAFKA_APPLICATION_NAME", &defaults.application_name),
            ack_mode: env_parse("KAFKA_ACK_MODE", defaults.ack_mode)?,
            central_dlt: CentralDltSettings {
                enabled: central_enabled,
                topic: central_topic,
            },
            nack_delay_ms: env_parse("KAFKA_NACK_DELAY_MS", defaults.nack_delay_ms)?,
            retry_topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KAFKA_VARS: [&str; 8] = [
        "APP_ENV",
        "KAFKA_APPLICATION_NAME",
        "KAFKA_ACK_MODE",
        "KAFKA_CENTRAL_DLT_ENABLED",
        "KAFKA_CENTRAL_DLT_TOPIC",
        "KAFKA_NACK_DELAY_MS",
        "KAFKA_RESOURCE_PREFIX",
        "KAFKA_RETRY_TOPICS",
    ];

    #[test]
    fn test_defaults_when_env_unset() {
        temp_env::with_vars_unset(KAFKA_VARS, || {
            let settings = KafkaSettings::from_env().unwrap();
            assert_eq!(settings.ack_mode, AckMode::Manual);
            assert!(!settings.central_dlt.enabled);
            assert_eq!(settings.nack_delay_ms, 1000);
            assert_eq!(settings.environment, Environment::Development);
            assert!(settings.retry_topics.topics.is_empty());
        });
    }

    #[test]
    fn test_from_env_full() {
        temp_env::with_vars(
            [
                ("APP_ENV", Some("PRODUCTION")),
                ("KAFKA_APPLICATION_NAME", Some("orders-service")),
                ("KAFKA_ACK_MODE", Some("manual_immediate")),
                ("KAFKA_CENTRAL_DLT_ENABLED", Some("true")),
                ("KAFKA_CENTRAL_DLT_TOPIC", Some("platform-dlt")),
                ("KAFKA_NACK_DELAY_MS", Some("2500")),
                ("KAFKA_RESOURCE_PREFIX", Some("shop")),
                (
                    "KAFKA_RETRY_TOPICS",
                    Some(r#"{"orders":{"retryAttempts":5,"delay":2000,"reuseStrategy":"SINGLE_TOPIC"}}"#),
                ),
            ],
            || {
                let settings = KafkaSettings::from_env().unwrap();
                assert!(settings.environment.is_production());
                assert_eq!(settings.application_name, "orders-service");
                assert_eq!(settings.ack_mode, AckMode::ManualImmediate);
                assert!(settings.ack_mode.is_manual());
                assert_eq!(settings.central_dlt.topic, "platform-dlt");
                assert_eq!(settings.nack_delay_ms, 2500);

                let orders = settings.retry_topics.for_topic("orders");
                assert_eq!(orders.retry_attempts, 5);
                assert_eq!(orders.delay, 2000);
                assert_eq!(orders.reuse_strategy, SameIntervalTopicReuseStrategy::SingleTopic);
                assert_eq!(orders.dlt_topic_suffix, "-dlt");
                assert_eq!(orders.resource_prefix.as_deref(), Some("shop"));
                assert_eq!(
                    settings.retry_topics.for_topic("payments").resource_prefix.as_deref(),
                    Some("shop")
                );
            },
        );
    }

    #[test]
    fn test_central_dlt_topic_required_when_enabled() {
        temp_env::with_vars(
            [
                ("KAFKA_CENTRAL_DLT_ENABLED", Some("true")),
                ("KAFKA_CENTRAL_DLT_TOPIC", None),
            ],
            || {
                let err = KafkaSettings::from_env().unwrap_err();
                assert!(err.to_string().contains("KAFKA_CENTRAL_DLT_TOPIC"));
            },
        );
    }

    #[test]
    fn test_invalid_values_are_reported() {
        temp_env::with_var("KAFKA_ACK_MODE", Some("sometimes"), || {
            let err = KafkaSettings::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "KAFKA_ACK_MODE"));
        });

        temp_env::with_var("KAFKA_RETRY_TOPICS", Some("[1,2"), || {
            assert!(KafkaSettings::from_env().is_err());
        });
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryTopicConfig::default().validate().is_ok());

        let bad = RetryTopicConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().is_fatal());

        let bad = RetryTopicConfig {
            retry_topic_suffix: "-x".into(),
            dlt_topic_suffix: "-x".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_normalized_clamps_delay() {
        let config = RetryTopicConfig {
            delay: 10,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.delay, MIN_DELAY_MS);
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn test_group_based_alias() {
        let config: RetryTopicConfig =
            serde_json::from_str(r#"{"groupBasedRetryAndDltTopics":true}"#).unwrap();
        assert!(config.group_based_naming);
        assert_eq!(config.retry_attempts, 3);
    }
}
