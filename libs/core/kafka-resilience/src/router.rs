//! Republishing failed records along the retry chain

use async_trait::async_trait;
use chrono::Utc;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ResilienceResult, classify, render_cause_chain};
use crate::metrics::ListenerMetrics;
use crate::record::{ConsumerRecord, ProducerRecord, header};
use crate::resolver::DestinationResolver;
use crate::topology::DestinationTopic;

/// Publishing side of the broker client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    /// Publish a record with its headers
    async fn publish(&self, record: ProducerRecord) -> ResilienceResult<()>;
}

/// What happened to a failed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// No-ops destination: nothing published, the caller acknowledges
    Dropped(DestinationTopic),
    /// Republished to a retry topic or the DLT
    Forwarded(DestinationTopic),
}

impl RoutingOutcome {
    pub fn destination(&self) -> &DestinationTopic {
        match self {
            RoutingOutcome::Dropped(d) | RoutingOutcome::Forwarded(d) => d,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self, RoutingOutcome::Forwarded(_))
    }
}

/// Routes failed records to the destination chosen by the resolver.
pub struct RetryTopicRouter<P> {
    resolver: Arc<DestinationResolver>,
    publisher: Arc<P>,
}

impl<P> Clone for RetryTopicRouter<P> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<P: RecordPublisher> RetryTopicRouter<P> {
    pub fn new(resolver: Arc<DestinationResolver>, publisher: Arc<P>) -> Self {
        Self { resolver, publisher }
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    /// Resolve and republish a record whose processing failed.
    pub async fn route(
        &self,
        listener_id: &str,
        record: &ConsumerRecord,
        failure: &(dyn StdError + Send + Sync + 'static),
    ) -> ResilienceResult<RoutingOutcome> {
        self.route_at(listener_id, record, failure, Utc::now().timestamp_millis())
            .await
    }

    /// [`route`](Self::route) with an explicit clock
    pub async fn route_at(
        &self,
        listener_id: &str,
        record: &ConsumerRecord,
        failure: &(dyn StdError + Send + Sync + 'static),
        now: i64,
    ) -> ResilienceResult<RoutingOutcome> {
        let metrics = ListenerMetrics::new(listener_id);
        let attempt = record.headers.attempts().unwrap_or(1);
        let original_timestamp = record.original_timestamp();

        let destination = self.resolver.resolve_at(
            listener_id,
            &record.topic,
            attempt,
            failure,
            original_timestamp,
            now,
        )?;

        if destination.is_no_ops_topic() {
            info!(
                listener_id = %listener_id,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Record dropped, nothing republished"
            );
            metrics.dropped();
            return Ok(RoutingOutcome::Dropped(destination));
        }

        let outgoing = annotate(record, &destination, attempt, original_timestamp, failure, now);
        self.publisher.publish(outgoing).await?;

        debug!(
            listener_id = %listener_id,
            from = %record.topic,
            to = %destination.name(),
            attempt = attempt + 1,
            "Record republished"
        );
        metrics.forwarded(destination.name());

        Ok(RoutingOutcome::Forwarded(destination))
    }
}

fn annotate(
    record: &ConsumerRecord,
    destination: &DestinationTopic,
    attempt: u32,
    original_timestamp: i64,
    failure: &(dyn StdError + 'static),
    now: i64,
) -> ProducerRecord {
    let mut headers = record.headers.clone();

    headers.insert_if_absent(header::ORIGINAL_TOPIC, record.topic.as_bytes());
    if destination.is_retry_topic() {
        headers.insert_if_absent(header::RETRY_TOPIC, destination.name().as_bytes());
    }
    headers.set_attempts(attempt.saturating_add(1));
    headers.insert_if_absent(header::ORIGINAL_TIMESTAMP, original_timestamp.to_string());
    headers.insert_if_absent(header::ORIGINAL_PARTITION, record.partition.to_string());
    headers.insert_if_absent(header::ORIGINAL_OFFSET, record.offset.to_string());

    let due = now.saturating_add(i64::try_from(destination.delay_millis()).unwrap_or(i64::MAX));
    headers.insert(header::BACKOFF_TIMESTAMP, due.to_string());
    headers.insert(header::EXCEPTION_TYPE, classify(failure).as_ref());
    headers.insert(header::EXCEPTION_MESSAGE, failure.to_string());
    headers.insert(header::EXCEPTION_CAUSE_CHAIN, render_cause_chain(failure));

    ProducerRecord {
        topic: destination.name().to_string(),
        partition: None,
        key: record.key.clone(),
        value: record.value.clone(),
        headers,
    }
}

/// Time a retry-topic consumer must still wait before processing `record`.
/// `None` when the record is due or carries no backoff header.
pub fn backoff_remaining(record: &ConsumerRecord, now: i64) -> Option<Duration> {
    let due = record.headers.last_i64(header::BACKOFF_TIMESTAMP)?;
    let remaining = due.checked_sub(now)?;
    if remaining > 0 {
        Some(Duration::from_millis(remaining as u64))
    } else {
        None
    }
}
