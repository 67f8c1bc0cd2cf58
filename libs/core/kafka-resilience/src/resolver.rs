//! Destination resolver
//!
//! Owns the topology registry and decides where a failed record goes next.
//! Resolution precedence, first match wins:
//!
//! 1. failure on the DLT itself: the family's DLT strategy
//! 2. no-retryable failure: DLT when configured, otherwise no-ops
//! 3. poison failure: no-ops
//! 4. retry window expired: DLT or no-ops
//! 5. last-retry guard: stay on the final retry topic
//! 6. next hop in the chain by attempt number
//!
//! Registration happens once at bootstrap; afterwards every lookup is a
//! read-locked map access.

use chrono::Utc;
use std::borrow::Cow;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info};

use crate::error::{FailureKind, ResilienceError, ResilienceResult, classify, render_cause_chain};
use crate::metrics::ListenerMetrics;
use crate::settings::{DltStrategy, RetryTopicConfig, RetryTopicProperties};
use crate::topology::{DestinationTopic, ListenerEndpoint, RetryTopology, TopicNaming, TopologyBuilder};

/// Family settings the resolver needs for one topic
struct FamilyView<'a> {
    main_topic: Option<&'a str>,
    config: &'a RetryTopicConfig,
    naming: Cow<'a, TopicNaming>,
}

impl FamilyView<'_> {
    fn is_last_retry_topic(&self, topic: &str) -> bool {
        self.naming
            .last_retry_suffix(self.config.retry_attempts)
            .is_some_and(|suffix| topic.ends_with(&suffix))
    }
}

/// Registry of retry topologies keyed by main listener id.
pub struct DestinationResolver {
    properties: RetryTopicProperties,
    topologies: RwLock<HashMap<String, Arc<RetryTopology>>>,
    /// Topic name to owning listener id, append-only
    topic_index: RwLock<HashMap<String, String>>,
}

impl DestinationResolver {
    pub fn new(properties: RetryTopicProperties) -> Self {
        Self {
            properties,
            topologies: RwLock::new(HashMap::new()),
            topic_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn properties(&self) -> &RetryTopicProperties {
        &self.properties
    }

    /// Build and register the topology of a listener.
    ///
    /// Registering the same endpoint twice leaves the topology unchanged.
    /// Errors are fatal for the bootstrap.
    pub fn register(&self, endpoint: &ListenerEndpoint) -> ResilienceResult<Arc<RetryTopology>> {
        let topology = TopologyBuilder::new(&self.properties).build(endpoint)?;
        Ok(self.register_topology(topology))
    }

    /// Register a prebuilt topology, merging into an existing one
    pub fn register_topology(&self, topology: RetryTopology) -> Arc<RetryTopology> {
        let listener_id = topology.main_listener_id().to_string();

        let registered = {
            let mut topologies = self.topologies.write().unwrap_or_else(PoisonError::into_inner);
            let merged = match topologies.get(&listener_id) {
                Some(existing) => {
                    let mut merged = RetryTopology::clone(existing);
                    let added = merged.merge(topology);
                    if added == 0 {
                        info!(listener_id = %listener_id, "Retry topology already registered");
                        return Arc::clone(existing);
                    }
                    merged
                }
                None => topology,
            };
            let merged = Arc::new(merged);
            topologies.insert(listener_id.clone(), Arc::clone(&merged));
            merged
        };

        let mut index = self.topic_index.write().unwrap_or_else(PoisonError::into_inner);
        for destination in registered.destinations() {
            index
                .entry(destination.name().to_string())
                .or_insert_with(|| listener_id.clone());
        }

        info!(
            listener_id = %listener_id,
            destinations = registered.destinations().len(),
            "Registered retry topology"
        );
        registered
    }

    /// Topology registered for a main listener id
    pub fn topology(&self, listener_id: &str) -> Option<Arc<RetryTopology>> {
        self.topologies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(listener_id)
            .cloned()
    }

    /// Topology containing `topic`, main or child. Misses scan every
    /// registered topology once and cache the owner.
    pub fn topology_for_topic(&self, topic: &str) -> Option<Arc<RetryTopology>> {
        let cached = self
            .topic_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned();
        if let Some(listener_id) = cached {
            return self.topology(&listener_id);
        }

        let candidates = [topic, strip_partition_suffix(topic)];
        let found = {
            let topologies = self.topologies.read().unwrap_or_else(PoisonError::into_inner);
            candidates.iter().find_map(|candidate| {
                topologies
                    .values()
                    .find(|t| t.contains(candidate))
                    .map(Arc::clone)
            })
        }?;

        self.topic_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| found.main_listener_id().to_string());
        Some(found)
    }

    /// Registered listener ids
    pub fn listener_ids(&self) -> Vec<String> {
        self.topologies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Next destination for a failed delivery.
    ///
    /// `attempt` is 1-based: the first delivery on the main topic is 1.
    pub fn resolve(
        &self,
        listener_id: &str,
        topic: &str,
        attempt: u32,
        failure: &(dyn StdError + 'static),
        original_timestamp: i64,
    ) -> ResilienceResult<DestinationTopic> {
        self.resolve_at(
            listener_id,
            topic,
            attempt,
            failure,
            original_timestamp,
            Utc::now().timestamp_millis(),
        )
    }

    /// [`resolve`](Self::resolve) with an explicit clock
    pub fn resolve_at(
        &self,
        listener_id: &str,
        topic: &str,
        attempt: u32,
        failure: &(dyn StdError + 'static),
        original_timestamp: i64,
        now: i64,
    ) -> ResilienceResult<DestinationTopic> {
        let topology = self
            .topology(listener_id)
            .or_else(|| self.topology_for_topic(topic))
            .ok_or_else(|| ResilienceError::UnknownListener(listener_id.to_string()))?;

        let kind = classify(failure);
        let family = self.family(&topology, topic);
        let on_dlt = topology
            .get(topic)
            .or_else(|| topology.get(strip_partition_suffix(topic)))
            .filter(|current| current.is_dlt_topic());

        let destination = match (kind, on_dlt) {
            // malformed records never go back to the DLT
            (FailureKind::Poison, _) => {
                error!(
                    listener_id = %listener_id,
                    topic = %topic,
                    attempt,
                    cause = %render_cause_chain(failure),
                    "Poison message, record cannot be processed"
                );
                topology.no_ops().cloned().unwrap_or_else(DestinationTopic::no_ops)
            }
            (_, Some(dlt)) => match family.config.dlt_strategy {
                DltStrategy::AlwaysRetryOnError => dlt.clone(),
                DltStrategy::FailOnError => DestinationTopic::no_ops(),
            },
            (FailureKind::NoRetryable, None) => {
                if family.config.use_dlt_on_no_retryable_exception {
                    dlt_for(&topology, topic, &family).unwrap_or_else(DestinationTopic::no_ops)
                } else {
                    DestinationTopic::no_ops()
                }
            }
            (FailureKind::Transient, None) => {
                self.resolve_transient(&topology, &family, listener_id, topic, attempt, original_timestamp, now)?
            }
        };

        info!(
            listener_id = %listener_id,
            topic = %topic,
            attempt,
            failure = %kind,
            destination = %destination.name(),
            delay = %delay_label(&destination),
            "Resolved destination topic"
        );
        ListenerMetrics::new(listener_id).resolved(kind, destination.kind());

        Ok(destination)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_transient(
        &self,
        topology: &RetryTopology,
        family: &FamilyView<'_>,
        listener_id: &str,
        topic: &str,
        attempt: u32,
        original_timestamp: i64,
        now: i64,
    ) -> ResilienceResult<DestinationTopic> {
        let current = topology
            .get(topic)
            .or_else(|| topology.get(strip_partition_suffix(topic)))
            .ok_or_else(|| ResilienceError::UnknownTopic {
                listener: listener_id.to_string(),
                topic: topic.to_string(),
            })?;

        if current.is_no_ops_topic() {
            return Ok(current.clone());
        }

        if current.is_past_timeout(original_timestamp, now) {
            info!(
                listener_id = %listener_id,
                topic = %topic,
                original_timestamp,
                "Retry window expired"
            );
            return Ok(dlt_for(topology, topic, family).unwrap_or_else(DestinationTopic::no_ops));
        }

        if current.is_retry_topic() && family.is_last_retry_topic(current.name()) {
            let remaining = i64::from(attempt)
                - i64::from(family.config.retry_attempts)
                - i64::from(family.config.last_retry_attempts)
                - 1;
            if remaining < 0 {
                return Ok(current.clone());
            }
        }

        if attempt < current.max_attempts() {
            if current.is_reusable_retry_topic() {
                return Ok(current.clone());
            }
            return Ok(topology
                .next(current.name())
                .cloned()
                .unwrap_or_else(DestinationTopic::no_ops));
        }

        Ok(dlt_for(topology, topic, family).unwrap_or_else(DestinationTopic::no_ops))
    }

    /// Family of `topic`: its topology entry, then the partition-stripped
    /// name, then the static properties keyed by base topic.
    fn family<'a>(&'a self, topology: &'a RetryTopology, topic: &str) -> FamilyView<'a> {
        let stripped = strip_partition_suffix(topic);
        if let Some(family) = topology
            .family_for(topic)
            .or_else(|| topology.family_for(stripped))
        {
            return FamilyView {
                main_topic: Some(family.main_topic.as_str()),
                config: &family.config,
                naming: Cow::Borrowed(&family.naming),
            };
        }

        let defaults = &self.properties.defaults;
        let base = base_topic(stripped, &defaults.retry_topic_suffix, &defaults.dlt_topic_suffix);
        let config = self.properties.for_topic(base);
        FamilyView {
            main_topic: None,
            config,
            naming: Cow::Owned(TopicNaming::ungrouped(config)),
        }
    }
}

fn dlt_for(
    topology: &RetryTopology,
    topic: &str,
    family: &FamilyView<'_>,
) -> Option<DestinationTopic> {
    topology
        .dlt_from(topic)
        .or_else(|| topology.dlt_from(strip_partition_suffix(topic)))
        .or_else(|| family.main_topic.and_then(|main| topology.dlt_from(main)))
        .cloned()
}

fn delay_label(destination: &DestinationTopic) -> String {
    if destination.is_no_ops_topic() {
        "unknown".to_string()
    } else {
        destination.delay_millis().to_string()
    }
}

/// `orders-3` -> `orders`. Names without a numeric suffix are unchanged.
pub fn strip_partition_suffix(topic: &str) -> &str {
    match topic.rsplit_once('-') {
        Some((base, partition))
            if !base.is_empty()
                && !partition.is_empty()
                && partition.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => topic,
    }
}

/// Base topic of a derived name: `orders-retry-1` and `orders-dlt` give
/// `orders`.
fn base_topic<'a>(topic: &'a str, retry_suffix: &str, dlt_suffix: &str) -> &'a str {
    if let Some(base) = topic.strip_suffix(dlt_suffix) {
        return base;
    }
    if let Some(base) = topic.strip_suffix(retry_suffix) {
        return base;
    }
    match topic.rfind(&format!("{retry_suffix}-")) {
        Some(index) => &topic[..index],
        None => topic,
    }
}
