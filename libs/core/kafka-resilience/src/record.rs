//! Broker records, headers and the dead-letter snapshot
//!
//! `ConsumerRecord` / `ProducerRecord` are the boundary types exchanged with
//! the broker client. `KafkaRecordSnapshot` is the immutable projection handed
//! to the dead-letter pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;

use crate::error::render_cause_chain;

/// Header names read and written by the retry machinery.
pub mod header {
    /// Source topic of the record, set once and never overwritten
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";
    /// First retry topic the record was routed to
    pub const RETRY_TOPIC: &str = "x-retry-topic";
    /// Delivery attempts so far (4-byte big-endian)
    pub const ATTEMPTS: &str = "retry_topic-attempts";
    /// Epoch millis of the first delivery
    pub const ORIGINAL_TIMESTAMP: &str = "retry_topic-original-timestamp";
    /// Epoch millis before which the record must not be processed
    pub const BACKOFF_TIMESTAMP: &str = "retry_topic-backoff-timestamp";
    pub const ORIGINAL_PARTITION: &str = "kafka_dlt-original-partition";
    pub const ORIGINAL_OFFSET: &str = "kafka_dlt-original-offset";
    pub const EXCEPTION_TYPE: &str = "kafka_dlt-exception-fqcn";
    pub const EXCEPTION_MESSAGE: &str = "kafka_dlt-exception-message";
    pub const EXCEPTION_CAUSE_CHAIN: &str = "kafka_dlt-exception-stacktrace";
}

/// Ordered multi-map of record headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping existing values for the same key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((key.into(), value.into()));
    }

    /// Replace every value of `key` with a single value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.0.retain(|(k, _)| *k != key);
        self.0.push((key, value.into()));
    }

    /// Set `key` only if it is not present yet. Returns whether it was set.
    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<Vec<u8>>) -> bool {
        if self.contains(key) {
            return false;
        }
        self.0.push((key.to_string(), value.into()));
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Last value written for `key`
    pub fn last(&self, key: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Last value for `key` decoded as UTF-8
    pub fn last_str(&self, key: &str) -> Option<String> {
        self.last(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::to_string)
    }

    /// Last value for `key` parsed as a decimal integer
    pub fn last_i64(&self, key: &str) -> Option<i64> {
        self.last_str(key).and_then(|v| v.trim().parse().ok())
    }

    /// Delivery attempt counter. Accepts the 4-byte big-endian encoding and
    /// the legacy single-byte / decimal forms. All-digit values are decimal.
    pub fn attempts(&self) -> Option<u32> {
        let raw = self.last(header::ATTEMPTS)?;
        if !raw.is_empty() && raw.iter().all(u8::is_ascii_digit) {
            return std::str::from_utf8(raw).ok()?.parse().ok();
        }
        match raw.len() {
            4 => Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            1 => Some(u32::from(raw[0])),
            _ => None,
        }
    }

    pub fn set_attempts(&mut self, attempts: u32) {
        self.insert(header::ATTEMPTS, attempts.to_be_bytes().to_vec());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A record as delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker timestamp in epoch millis
    pub timestamp: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl ConsumerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: Utc::now().timestamp_millis(),
            key: None,
            value: value.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.add(key, value);
        self
    }

    /// Topic the record was first published to
    pub fn original_topic(&self) -> String {
        self.headers
            .last_str(header::ORIGINAL_TOPIC)
            .unwrap_or_else(|| self.topic.clone())
    }

    /// Timestamp of the first delivery, falling back to the broker timestamp
    pub fn original_timestamp(&self) -> i64 {
        self.headers
            .last_i64(header::ORIGINAL_TIMESTAMP)
            .unwrap_or(self.timestamp)
    }
}

/// A record handed to the broker client for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// `None` lets the broker client pick the partition
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

/// Immutable projection of a failed record, built when the record is
/// declared dead and discarded once the dead-letter pipeline ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaRecordSnapshot {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Source topic, recovered across the whole retry chain
    pub original_topic: Option<String>,
    /// First retry topic the record passed through
    pub retry_topic: Option<String>,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl KafkaRecordSnapshot {
    /// Project a raw record. Failure details are taken from the exception
    /// headers written when the record was routed.
    pub fn from_record(record: &ConsumerRecord) -> Self {
        let headers = record
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v).into_owned()))
            .collect();

        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
            key: record
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            headers,
            body: String::from_utf8_lossy(&record.value).into_owned(),
            original_topic: record.headers.last_str(header::ORIGINAL_TOPIC),
            retry_topic: record.headers.last_str(header::RETRY_TOPIC),
            exception_message: record.headers.last_str(header::EXCEPTION_MESSAGE),
            exception_stacktrace: record.headers.last_str(header::EXCEPTION_CAUSE_CHAIN),
            failed_at: Utc::now(),
        }
    }

    /// Attach the failure that killed the record in this delivery
    pub fn with_failure(mut self, error: &(dyn StdError + 'static)) -> Self {
        self.exception_message = Some(error.to_string());
        self.exception_stacktrace = Some(render_cause_chain(error));
        self
    }

    /// Topic the record originally came from
    pub fn source_topic(&self) -> &str {
        self.original_topic.as_deref().unwrap_or(&self.topic)
    }

    /// Whether the record carries a non-empty key
    pub fn has_key(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_insert_replaces() {
        let mut headers = Headers::new();
        headers.add("a", "1");
        headers.add("a", "2");
        assert_eq!(headers.last_str("a").as_deref(), Some("2"));
        assert_eq!(headers.len(), 2);

        headers.insert("a", "3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.last_str("a").as_deref(), Some("3"));
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let mut headers = Headers::new();
        assert!(headers.insert_if_absent(header::ORIGINAL_TOPIC, "orders"));
        assert!(!headers.insert_if_absent(header::ORIGINAL_TOPIC, "orders-retry-0"));
        assert_eq!(
            headers.last_str(header::ORIGINAL_TOPIC).as_deref(),
            Some("orders")
        );
    }

    #[test]
    fn test_attempts_encodings() {
        let mut headers = Headers::new();
        assert_eq!(headers.attempts(), None);

        headers.set_attempts(3);
        assert_eq!(headers.last(header::ATTEMPTS), Some(&[0u8, 0, 0, 3][..]));
        assert_eq!(headers.attempts(), Some(3));

        headers.insert(header::ATTEMPTS, vec![2u8]);
        assert_eq!(headers.attempts(), Some(2));

        headers.insert(header::ATTEMPTS, "7");
        assert_eq!(headers.attempts(), Some(7));

        headers.insert(header::ATTEMPTS, "1000");
        assert_eq!(headers.attempts(), Some(1000));

        headers.insert(header::ATTEMPTS, "12");
        assert_eq!(headers.attempts(), Some(12));

        headers.insert(header::ATTEMPTS, vec![0u8, 0, 1, 0]);
        assert_eq!(headers.attempts(), Some(256));

        headers.insert(header::ATTEMPTS, "x1");
        assert_eq!(headers.attempts(), None);
    }

    #[test]
    fn test_snapshot_from_record() {
        let record = ConsumerRecord::new("orders-dlt", 2, 42, r#"{"id":1}"#)
            .with_key("order-1")
            .with_header(header::ORIGINAL_TOPIC, "orders")
            .with_header(header::RETRY_TOPIC, "orders-retry-0")
            .with_header(header::EXCEPTION_MESSAGE, "boom");

        let snapshot = KafkaRecordSnapshot::from_record(&record);
        assert_eq!(snapshot.topic, "orders-dlt");
        assert_eq!(snapshot.partition, 2);
        assert_eq!(snapshot.offset, 42);
        assert_eq!(snapshot.key.as_deref(), Some("order-1"));
        assert_eq!(snapshot.body, r#"{"id":1}"#);
        assert_eq!(snapshot.source_topic(), "orders");
        assert_eq!(snapshot.retry_topic.as_deref(), Some("orders-retry-0"));
        assert_eq!(snapshot.exception_message.as_deref(), Some("boom"));
        assert!(snapshot.has_key());
    }

    #[test]
    fn test_snapshot_with_failure_and_camel_case() {
        let record = ConsumerRecord::new("orders", 0, 1, "x").with_key("");
        let snapshot = KafkaRecordSnapshot::from_record(&record)
            .with_failure(&std::io::Error::other("downstream unavailable"));

        assert!(!snapshot.has_key());
        assert_eq!(snapshot.source_topic(), "orders");
        assert_eq!(
            snapshot.exception_message.as_deref(),
            Some("downstream unavailable")
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("originalTopic").is_some());
        assert!(json.get("exceptionStacktrace").is_some());
    }

    #[test]
    fn test_original_timestamp_fallback() {
        let record = ConsumerRecord::new("orders", 0, 1, "x").with_timestamp(1_000);
        assert_eq!(record.original_timestamp(), 1_000);

        let record = record.with_header(header::ORIGINAL_TIMESTAMP, "500");
        assert_eq!(record.original_timestamp(), 500);
        assert_eq!(record.original_topic(), "orders");
    }
}
