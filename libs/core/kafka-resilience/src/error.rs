//! Error types and failure classification
//!
//! Failures coming out of a listener are classified once into a
//! [`FailureKind`], which decides how the resolver routes the record:
//! - **NoRetryable**: explicitly marked by the handler, never retried
//! - **Poison**: the record could not be (de)serialized, never retried
//! - **Transient**: everything else, drives the retry-topic chain

use std::error::Error as StdError;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Errors raised by the control plane itself.
///
/// Bootstrap errors (`Config`, `InvalidOverride`) are fatal; everything else
/// is scoped to a single record.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A per-listener override could not be parsed
    #[error("Invalid override for '{field}': '{value}' ({details})")]
    InvalidOverride {
        field: &'static str,
        value: String,
        details: String,
    },

    /// No topology registered for the listener
    #[error("No retry topology registered for listener '{0}'")]
    UnknownListener(String),

    /// The listener is known but the topic is not part of its topology
    #[error("Topic '{topic}' is not part of the retry topology of listener '{listener}'")]
    UnknownTopic { listener: String, topic: String },

    /// Serialization of a record or snapshot failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker client failed to publish
    #[error("Failed to publish to '{topic}': {message}")]
    Publish { topic: String, message: String },

    /// At least one mandatory dead-letter action failed
    #[error("Mandatory dead-letter actions failed: {}", .0.join(", "))]
    MandatoryActionsFailed(Vec<String>),

    /// Acknowledging or nacking the record failed
    #[error("Acknowledgment error: {0}")]
    Acknowledgment(String),
}

impl ResilienceError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ResilienceError::Config(message.into())
    }

    /// Create a publish error
    pub fn publish(topic: impl Into<String>, message: impl ToString) -> Self {
        ResilienceError::Publish {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error must abort process startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ResilienceError::Config(_) | ResilienceError::InvalidOverride { .. }
        )
    }
}

pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Marker error: the handler declares the record must not be retried.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct NoRetryableError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl NoRetryableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Marker error: the record itself is malformed (deserialization or
/// serialization failed), independent of any business logic.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct PoisonMessageError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl PoisonMessageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// How a listener failure is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Explicitly marked, goes to the DLT or stops
    NoRetryable,
    /// Malformed record, stops without retry
    Poison,
    /// Retry through the topic chain
    Transient,
}

impl FailureKind {
    /// Whether the retry chain may be advanced for this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// Classify a failure by walking its source chain.
///
/// A no-retryable marker anywhere in the chain wins over a poison marker.
pub fn classify(error: &(dyn StdError + 'static)) -> FailureKind {
    let mut poison = false;
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);

    while let Some(err) = current {
        if err.is::<NoRetryableError>() {
            return FailureKind::NoRetryable;
        }
        if err.is::<PoisonMessageError>() || err.is::<serde_json::Error>() {
            poison = true;
        }
        current = err.source();
    }

    if poison {
        FailureKind::Poison
    } else {
        FailureKind::Transient
    }
}

/// Render an error and its causes, one per line.
pub fn render_cause_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("handler failed")]
    struct HandlerError {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    }

    #[test]
    fn test_plain_error_is_transient() {
        let err = std::io::Error::other("connection reset");
        assert_eq!(classify(&err), FailureKind::Transient);
        assert!(classify(&err).is_retryable());
    }

    #[test]
    fn test_nested_no_retryable_is_detected() {
        let err = HandlerError {
            source: Box::new(NoRetryableError::new("order already cancelled")),
        };
        assert_eq!(classify(&err), FailureKind::NoRetryable);
    }

    #[test]
    fn test_no_retryable_wins_over_poison() {
        let poison = PoisonMessageError::new("bad payload");
        let err = NoRetryableError::with_source("rejected", poison);
        assert_eq!(classify(&err), FailureKind::NoRetryable);

        let err = PoisonMessageError::with_source("bad", NoRetryableError::new("inner"));
        assert_eq!(classify(&err), FailureKind::NoRetryable);
    }

    #[test]
    fn test_deserialization_failure_is_poison() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = HandlerError {
            source: Box::new(json_err),
        };
        assert_eq!(classify(&err), FailureKind::Poison);
        assert_eq!(
            classify(&PoisonMessageError::new("truncated")),
            FailureKind::Poison
        );
    }

    #[test]
    fn test_render_cause_chain() {
        let err = HandlerError {
            source: Box::new(std::io::Error::other("timeout")),
        };
        assert_eq!(render_cause_chain(&err), "handler failed\ncaused by: timeout");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ResilienceError::config("bad").is_fatal());
        assert!(!ResilienceError::UnknownListener("l".into()).is_fatal());
        assert_eq!(
            ResilienceError::MandatoryActionsFailed(vec!["a".into(), "b".into()]).to_string(),
            "Mandatory dead-letter actions failed: a, b"
        );
    }

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::NoRetryable.as_ref(), "no_retryable");
        assert_eq!(FailureKind::Poison.to_string(), "poison");
    }
}
