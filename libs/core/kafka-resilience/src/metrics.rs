//! Counters for the retry and dead-letter control plane
//!
//! Emitted through the `metrics` facade. Installing a recorder is left to
//! the application.

use metrics::counter;

use crate::error::FailureKind;
use crate::topology::DestinationKind;

/// Metrics helper bound to one listener
#[derive(Clone, Debug)]
pub struct ListenerMetrics {
    listener_id: String,
}

impl ListenerMetrics {
    pub fn new(listener_id: impl Into<String>) -> Self {
        Self {
            listener_id: listener_id.into(),
        }
    }

    /// Record a destination resolution
    pub fn resolved(&self, failure: FailureKind, destination: DestinationKind) {
        counter!(
            "kafka_retry_resolutions_total",
            "listener" => self.listener_id.clone(),
            "failure" => failure.as_ref().to_string(),
            "destination" => destination.as_ref().to_string()
        )
        .increment(1);
    }

    /// Record a republish to a retry topic or DLT
    pub fn forwarded(&self, topic: &str) {
        counter!(
            "kafka_retry_forwarded_total",
            "listener" => self.listener_id.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    /// Record a record dropped on the no-ops path
    pub fn dropped(&self) {
        counter!(
            "kafka_retry_dropped_total",
            "listener" => self.listener_id.clone()
        )
        .increment(1);
    }

    /// Record a consumption rejected by an open breaker
    pub fn rejected(&self) {
        counter!(
            "kafka_listener_rejected_total",
            "listener" => self.listener_id.clone()
        )
        .increment(1);
    }
}

/// Record a failed dead-letter action
pub fn dead_letter_action_failed(action: &str, mandatory: bool) {
    counter!(
        "kafka_dead_letter_action_failures_total",
        "action" => action.to_string(),
        "mandatory" => mandatory.to_string()
    )
    .increment(1);
}

/// Record a dead-letter pipeline run
pub fn dead_letter_pipeline(topic: &str, success: bool) {
    counter!(
        "kafka_dead_letter_pipelines_total",
        "topic" => topic.to_string(),
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Record a circuit breaker state change
pub fn breaker_transition(breaker: &str, state: &str) {
    counter!(
        "kafka_circuit_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record containers paused or resumed by the governor
pub fn containers_toggled(breaker: &str, action: &'static str, count: usize) {
    counter!(
        "kafka_governor_container_actions_total",
        "breaker" => breaker.to_string(),
        "action" => action
    )
    .increment(count as u64);
}
