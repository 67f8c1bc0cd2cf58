//! Dead-letter action pipeline
//!
//! Runs once a record is declared dead. Actions run in ascending `order`.
//! Every action runs even when an earlier one failed; a failed mandatory
//! action fails the whole pipeline afterwards, which blocks the
//! acknowledgment so the broker redelivers the record.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ResilienceError, ResilienceResult};
use crate::metrics;
use crate::record::{ConsumerRecord, Headers, KafkaRecordSnapshot, ProducerRecord, header};
use crate::router::RecordPublisher;
use crate::settings::{AckMode, CentralDltSettings};

/// A side effect executed for a dead record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterAction: Send + Sync {
    fn name(&self) -> &'static str;

    /// A failed mandatory action fails the pipeline
    fn is_mandatory(&self) -> bool;

    /// Lower runs first
    fn order(&self) -> i32;

    async fn execute(&self, record: &KafkaRecordSnapshot) -> eyre::Result<()>;
}

/// Acknowledgment handle of the record being processed.
#[cfg_attr(test, mockall::automock)]
pub trait Acknowledgment: Send + Sync {
    fn acknowledge(&self) -> ResilienceResult<()>;

    /// Negative acknowledgment: redeliver after `delay`
    fn nack(&self, delay: Duration) -> ResilienceResult<()>;
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Actions in execution order
    pub executed: Vec<&'static str>,
    pub failed_optional: Vec<&'static str>,
    pub failed_mandatory: Vec<&'static str>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failed_mandatory.is_empty()
    }
}

/// Run `actions` for `record` in ascending order.
///
/// Returns `MandatoryActionsFailed` after all actions ran when at least one
/// mandatory action failed.
pub async fn run_pipeline(
    record: &KafkaRecordSnapshot,
    actions: &[Arc<dyn DeadLetterAction>],
) -> ResilienceResult<PipelineReport> {
    let mut ordered: Vec<&Arc<dyn DeadLetterAction>> = actions.iter().collect();
    ordered.sort_by_key(|action| action.order());

    let mut report = PipelineReport::default();
    for action in ordered {
        let name = action.name();
        report.executed.push(name);

        if let Err(err) = action.execute(record).await {
            let mandatory = action.is_mandatory();
            error!(
                action = name,
                mandatory,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "Dead-letter action failed"
            );
            metrics::dead_letter_action_failed(name, mandatory);

            if mandatory {
                report.failed_mandatory.push(name);
            } else {
                report.failed_optional.push(name);
            }
        }
    }

    metrics::dead_letter_pipeline(record.source_topic(), report.is_success());

    if report.is_success() {
        Ok(report)
    } else {
        Err(ResilienceError::MandatoryActionsFailed(
            report.failed_mandatory.iter().map(|n| n.to_string()).collect(),
        ))
    }
}

/// Dead-letter handler: the action pipeline plus acknowledgment.
#[derive(Clone)]
pub struct DeadLetterHandler {
    actions: Vec<Arc<dyn DeadLetterAction>>,
    ack_mode: AckMode,
}

impl DeadLetterHandler {
    pub fn new(ack_mode: AckMode) -> Self {
        Self {
            actions: Vec::new(),
            ack_mode,
        }
    }

    /// Add an action, keeping the list sorted by order
    pub fn with_action(mut self, action: Arc<dyn DeadLetterAction>) -> Self {
        self.actions.push(action);
        self.actions.sort_by_key(|a| a.order());
        self
    }

    pub fn actions(&self) -> &[Arc<dyn DeadLetterAction>] {
        &self.actions
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Run the pipeline for a snapshot
    pub async fn handle(&self, record: &KafkaRecordSnapshot) -> ResilienceResult<PipelineReport> {
        run_pipeline(record, &self.actions).await
    }

    /// Snapshot `record`, run the pipeline and acknowledge on success.
    ///
    /// Acknowledgment only happens in manual ack modes; otherwise the
    /// container commits on its own. A failed pipeline is never
    /// acknowledged.
    pub async fn handle_and_acknowledge(
        &self,
        record: &ConsumerRecord,
        failure: Option<&(dyn StdError + Send + Sync + 'static)>,
        ack: &dyn Acknowledgment,
    ) -> ResilienceResult<PipelineReport> {
        let mut snapshot = KafkaRecordSnapshot::from_record(record);
        if let Some(failure) = failure {
            snapshot = snapshot.with_failure(failure);
        }

        let report = match self.handle(&snapshot).await {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Dead-letter record not acknowledged, broker will redeliver"
                );
                return Err(err);
            }
        };

        if self.ack_mode.is_manual() {
            ack.acknowledge()?;
        }
        Ok(report)
    }
}

/// Logs the dead record. Optional, runs first, never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAction;

#[async_trait]
impl DeadLetterAction for LoggingAction {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn is_mandatory(&self) -> bool {
        false
    }

    fn order(&self) -> i32 {
        i32::MIN
    }

    async fn execute(&self, record: &KafkaRecordSnapshot) -> eyre::Result<()> {
        error!(
            topic = %record.topic,
            original_topic = %record.source_topic(),
            retry_topic = record.retry_topic.as_deref().unwrap_or("-"),
            partition = record.partition,
            offset = record.offset,
            key = record.key.as_deref().unwrap_or("-"),
            exception = record.exception_message.as_deref().unwrap_or("-"),
            "Record reached the dead-letter topic"
        );
        Ok(())
    }
}

/// Republishes the snapshot, as JSON, to the central cross-service DLT.
/// Mandatory and runs last.
pub struct CentralDltForwardingAction<P> {
    publisher: Arc<P>,
    settings: CentralDltSettings,
    application_name: String,
}

impl<P: RecordPublisher> CentralDltForwardingAction<P> {
    pub fn new(
        publisher: Arc<P>,
        settings: CentralDltSettings,
        application_name: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            settings,
            application_name: application_name.into(),
        }
    }
}

/// Header naming the service that forwarded a record to the central DLT
pub const SOURCE_APPLICATION_HEADER: &str = "x-source-application";

#[async_trait]
impl<P: RecordPublisher + 'static> DeadLetterAction for CentralDltForwardingAction<P> {
    fn name(&self) -> &'static str {
        "central-dlt-forwarding"
    }

    fn is_mandatory(&self) -> bool {
        true
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    async fn execute(&self, record: &KafkaRecordSnapshot) -> eyre::Result<()> {
        if !self.settings.enabled {
            debug!(topic = %record.topic, "Central DLT disabled, skipping");
            return Ok(());
        }

        let key = match record.key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut headers = Headers::new();
        headers.insert(header::ORIGINAL_TOPIC, record.source_topic().as_bytes());
        headers.insert(SOURCE_APPLICATION_HEADER, self.application_name.as_bytes());

        let outgoing = ProducerRecord {
            topic: self.settings.topic.clone(),
            partition: None,
            key: Some(key.into_bytes()),
            value: serde_json::to_vec(record)?,
            headers,
        };
        self.publisher.publish(outgoing).await?;

        debug!(
            topic = %record.topic,
            central_topic = %self.settings.topic,
            "Forwarded record to the central DLT"
        );
        Ok(())
    }
}
