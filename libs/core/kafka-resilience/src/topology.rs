//! Retry topology: destination topics and the builder that derives them
//!
//! For a listener on `orders` with three retries the chain is:
//!
//! ```text
//! orders ──> orders-retry-0 ──> orders-retry-1 ──> orders-retry-2 ──> orders-dlt
//!  main        1000ms             2000ms             4000ms            dlt
//! ```
//!
//! Order is main, retries by increasing index, then the DLT. The resolver
//! relies on it.

use serde::Serialize;
use std::collections::HashMap;
use strum::{AsRefStr, Display};
use tracing::info;

use crate::backoff::BackOffPolicy;
use crate::error::{ResilienceError, ResilienceResult};
use crate::overrides::RetryTopicOverrides;
use crate::settings::{RetryTopicConfig, RetryTopicProperties};

/// Name of the synthetic "acknowledge and stop" destination.
pub const NO_OPS_TOPIC: &str = "no-ops";

/// Role of a destination in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DestinationKind {
    Main,
    Retry,
    /// Retry topic shared by every same-interval attempt
    ReusableRetry,
    Dlt,
    /// Not a real topic: nothing is published
    NoOps,
}

/// One hop of a retry chain. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationTopic {
    name: String,
    delay_millis: u64,
    kind: DestinationKind,
    max_attempts: u32,
    timeout_millis: Option<u64>,
}

impl DestinationTopic {
    pub fn main(name: impl Into<String>, max_attempts: u32, timeout_millis: Option<u64>) -> Self {
        Self::new(name, 0, DestinationKind::Main, max_attempts, timeout_millis)
    }

    pub fn retry(
        name: impl Into<String>,
        delay_millis: u64,
        max_attempts: u32,
        timeout_millis: Option<u64>,
    ) -> Self {
        Self::new(name, delay_millis, DestinationKind::Retry, max_attempts, timeout_millis)
    }

    pub fn reusable_retry(
        name: impl Into<String>,
        delay_millis: u64,
        max_attempts: u32,
        timeout_millis: Option<u64>,
    ) -> Self {
        Self::new(
            name,
            delay_millis,
            DestinationKind::ReusableRetry,
            max_attempts,
            timeout_millis,
        )
    }

    pub fn dlt(name: impl Into<String>, max_attempts: u32, timeout_millis: Option<u64>) -> Self {
        Self::new(name, 0, DestinationKind::Dlt, max_attempts, timeout_millis)
    }

    /// Synthetic terminal destination: acknowledge, publish nothing
    pub fn no_ops() -> Self {
        Self::new(NO_OPS_TOPIC, 0, DestinationKind::NoOps, 0, None)
    }

    fn new(
        name: impl Into<String>,
        delay_millis: u64,
        kind: DestinationKind,
        max_attempts: u32,
        timeout_millis: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            delay_millis,
            kind,
            max_attempts,
            timeout_millis,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay_millis(&self) -> u64 {
        self.delay_millis
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout_millis(&self) -> Option<u64> {
        self.timeout_millis
    }

    pub fn is_main_topic(&self) -> bool {
        self.kind == DestinationKind::Main
    }

    /// True for both single-use and reusable retry topics
    pub fn is_retry_topic(&self) -> bool {
        matches!(self.kind, DestinationKind::Retry | DestinationKind::ReusableRetry)
    }

    pub fn is_reusable_retry_topic(&self) -> bool {
        self.kind == DestinationKind::ReusableRetry
    }

    pub fn is_dlt_topic(&self) -> bool {
        self.kind == DestinationKind::Dlt
    }

    pub fn is_no_ops_topic(&self) -> bool {
        self.kind == DestinationKind::NoOps
    }

    /// Whether `now` is past the retry window opened at `original_timestamp`
    pub fn is_past_timeout(&self, original_timestamp: i64, now: i64) -> bool {
        match self.timeout_millis {
            Some(timeout) => now > original_timestamp.saturating_add(timeout as i64),
            None => false,
        }
    }
}

/// Topic to provision when auto-creation is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
}

/// Effective suffixes of one topic family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNaming {
    retry_suffix: String,
    dlt_suffix: String,
}

impl TopicNaming {
    /// Suffixes for a merged config. Group-based naming infixes the group
    /// segment: `-retry` becomes `-<group>-retry`.
    pub fn for_config(config: &RetryTopicConfig, group_id: Option<&str>) -> ResilienceResult<Self> {
        if !config.group_based_naming {
            return Ok(Self::ungrouped(config));
        }

        let group_id = group_id
            .filter(|g| !g.is_empty())
            .ok_or_else(|| ResilienceError::config("group-based naming requires a group id"))?;
        let segment = group_segment(group_id, config.resource_prefix.as_deref());

        Ok(Self {
            retry_suffix: format!("-{segment}{}", config.retry_topic_suffix),
            dlt_suffix: format!("-{segment}{}", config.dlt_topic_suffix),
        })
    }

    /// Plain configured suffixes, without any group segment
    pub fn ungrouped(config: &RetryTopicConfig) -> Self {
        Self {
            retry_suffix: config.retry_topic_suffix.clone(),
            dlt_suffix: config.dlt_topic_suffix.clone(),
        }
    }

    pub fn retry_suffix(&self) -> &str {
        &self.retry_suffix
    }

    pub fn dlt_suffix(&self) -> &str {
        &self.dlt_suffix
    }

    /// `<base><retrySuffix>-<index>`
    pub fn retry_topic(&self, base: &str, index: usize) -> String {
        format!("{base}{}-{index}", self.retry_suffix)
    }

    /// `<base><retrySuffix>`
    pub fn reusable_retry_topic(&self, base: &str) -> String {
        format!("{base}{}", self.retry_suffix)
    }

    /// `<base><dltSuffix>`
    pub fn dlt_topic(&self, base: &str) -> String {
        format!("{base}{}", self.dlt_suffix)
    }

    /// Suffix of the last retry topic, `None` without retries
    pub fn last_retry_suffix(&self, retry_attempts: u32) -> Option<String> {
        retry_attempts
            .checked_sub(1)
            .map(|last| format!("{}-{last}", self.retry_suffix))
    }
}

/// Group id with the shared resource prefix (and its `_` or `-`
/// separator) removed.
pub fn group_segment(group_id: &str, resource_prefix: Option<&str>) -> String {
    if let Some(prefix) = resource_prefix.filter(|p| !p.is_empty()) {
        for separator in ['_', '-'] {
            if let Some(rest) = group_id.strip_prefix(&format!("{prefix}{separator}")) {
                if !rest.is_empty() {
                    return rest.to_string();
                }
            }
        }
    }
    group_id.to_string()
}

/// Configuration of one main topic and its derived topics.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFamily {
    pub main_topic: String,
    pub config: RetryTopicConfig,
    pub naming: TopicNaming,
}

/// Destinations of every chain registered for one main listener.
#[derive(Debug, Clone, Default)]
pub struct RetryTopology {
    main_listener_id: String,
    destinations: Vec<DestinationTopic>,
    next_hops: HashMap<String, usize>,
    families: Vec<TopicFamily>,
    family_of: HashMap<String, usize>,
    new_topics: Vec<NewTopic>,
}

impl RetryTopology {
    pub fn new(main_listener_id: impl Into<String>) -> Self {
        Self {
            main_listener_id: main_listener_id.into(),
            ..Default::default()
        }
    }

    /// Append a chain. Destinations already present are skipped, so adding
    /// the same chain twice leaves the topology unchanged. Returns the number
    /// of destinations added.
    pub fn add_chain(&mut self, chain: Vec<DestinationTopic>, family: Option<TopicFamily>) -> usize {
        let family_index = family.map(|family| {
            match self
                .families
                .iter()
                .position(|f| f.main_topic == family.main_topic)
            {
                Some(index) => index,
                None => {
                    self.families.push(family);
                    self.families.len() - 1
                }
            }
        });

        let mut added = 0;
        let mut indexes = Vec::with_capacity(chain.len());
        for destination in chain {
            let index = match self.position(destination.name()) {
                Some(index) => index,
                None => {
                    self.destinations.push(destination);
                    added += 1;
                    self.destinations.len() - 1
                }
            };
            if let Some(family_index) = family_index {
                let name = self.destinations[index].name().to_string();
                self.family_of.entry(name).or_insert(family_index);
            }
            indexes.push(index);
        }

        for pair in indexes.windows(2) {
            let source = self.destinations[pair[0]].name().to_string();
            self.next_hops.entry(source).or_insert(pair[1]);
        }

        added
    }

    /// Merge another topology for the same listener into this one
    pub fn merge(&mut self, other: RetryTopology) -> usize {
        let RetryTopology {
            destinations,
            next_hops,
            families,
            family_of,
            new_topics,
            ..
        } = other;

        let mut added = 0;
        for destination in &destinations {
            if self.position(destination.name()).is_none() {
                self.destinations.push(destination.clone());
                added += 1;
            }
        }
        for (source, next) in next_hops {
            let next_name = destinations[next].name();
            if let Some(index) = self.position(next_name) {
                self.next_hops.entry(source).or_insert(index);
            }
        }
        for (topic, family_index) in family_of {
            let family = &families[family_index];
            let index = match self
                .families
                .iter()
                .position(|f| f.main_topic == family.main_topic)
            {
                Some(index) => index,
                None => {
                    self.families.push(family.clone());
                    self.families.len() - 1
                }
            };
            self.family_of.entry(topic).or_insert(index);
        }
        for topic in new_topics {
            if !self.new_topics.iter().any(|t| t.name == topic.name) {
                self.new_topics.push(topic);
            }
        }

        added
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.destinations.iter().position(|d| d.name() == name)
    }

    pub fn main_listener_id(&self) -> &str {
        &self.main_listener_id
    }

    pub fn destinations(&self) -> &[DestinationTopic] {
        &self.destinations
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&DestinationTopic> {
        self.position(name).map(|i| &self.destinations[i])
    }

    /// Next hop after `name` in its chain
    pub fn next(&self, name: &str) -> Option<&DestinationTopic> {
        self.next_hops.get(name).map(|i| &self.destinations[*i])
    }

    /// DLT reachable from `name` (itself when it is the DLT)
    pub fn dlt_from(&self, name: &str) -> Option<&DestinationTopic> {
        let mut current = self.get(name)?;
        for _ in 0..=self.destinations.len() {
            if current.is_dlt_topic() {
                return Some(current);
            }
            current = self.next(current.name())?;
        }
        None
    }

    /// A no-ops destination registered in the topology, if any
    pub fn no_ops(&self) -> Option<&DestinationTopic> {
        self.destinations.iter().find(|d| d.is_no_ops_topic())
    }

    pub fn main_topics(&self) -> impl Iterator<Item = &DestinationTopic> {
        self.destinations.iter().filter(|d| d.is_main_topic())
    }

    pub fn retry_topics(&self) -> impl Iterator<Item = &DestinationTopic> {
        self.destinations.iter().filter(|d| d.is_retry_topic())
    }

    pub fn dlt_topics(&self) -> impl Iterator<Item = &DestinationTopic> {
        self.destinations.iter().filter(|d| d.is_dlt_topic())
    }

    /// Family (main topic + config) a destination belongs to
    pub fn family_for(&self, name: &str) -> Option<&TopicFamily> {
        self.family_of.get(name).map(|i| &self.families[*i])
    }

    pub fn families(&self) -> &[TopicFamily] {
        &self.families
    }

    /// Topics to provision; empty when auto-creation is off
    pub fn topics_to_create(&self) -> &[NewTopic] {
        &self.new_topics
    }
}

/// A listener as declared by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerEndpoint {
    pub id: String,
    pub topics: Vec<String>,
    pub group_id: Option<String>,
    pub overrides: RetryTopicOverrides,
}

impl ListenerEndpoint {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topics: vec![topic.into()],
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_overrides(mut self, overrides: RetryTopicOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Builds retry topologies from static properties plus listener overrides.
pub struct TopologyBuilder<'a> {
    properties: &'a RetryTopicProperties,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(properties: &'a RetryTopicProperties) -> Self {
        Self { properties }
    }

    /// Merge the static config of `base_topic` with the listener overrides
    pub fn resolve_config(
        &self,
        endpoint: &ListenerEndpoint,
        base_topic: &str,
    ) -> ResilienceResult<RetryTopicConfig> {
        endpoint.overrides.merge(self.properties.for_topic(base_topic))
    }

    /// Build the topology of every topic the listener consumes.
    pub fn build(&self, endpoint: &ListenerEndpoint) -> ResilienceResult<RetryTopology> {
        if endpoint.id.is_empty() {
            return Err(ResilienceError::config("listener id must not be empty"));
        }
        if endpoint.topics.is_empty() {
            return Err(ResilienceError::config(format!(
                "listener '{}' declares no topics",
                endpoint.id
            )));
        }

        let mut topology = RetryTopology::new(&endpoint.id);
        for base_topic in &endpoint.topics {
            let config = self.resolve_config(endpoint, base_topic)?;
            let naming = TopicNaming::for_config(&config, endpoint.group_id.as_deref())?;
            let chain = build_chain(base_topic, &config, &naming);

            if config.auto_create_topics {
                for destination in chain.iter().filter(|d| !d.is_main_topic()) {
                    if topology.new_topics.iter().any(|t| t.name == destination.name()) {
                        continue;
                    }
                    topology.new_topics.push(NewTopic {
                        name: destination.name().to_string(),
                        num_partitions: config.num_partitions,
                        replication_factor: config.replication_factor,
                    });
                }
            }

            info!(
                listener_id = %endpoint.id,
                topic = %base_topic,
                destinations = ?chain.iter().map(DestinationTopic::name).collect::<Vec<_>>(),
                "Built retry topology"
            );

            topology.add_chain(
                chain,
                Some(TopicFamily {
                    main_topic: base_topic.clone(),
                    config,
                    naming,
                }),
            );
        }

        Ok(topology)
    }
}

fn build_chain(base_topic: &str, config: &RetryTopicConfig, naming: &TopicNaming) -> Vec<DestinationTopic> {
    let max_attempts = config.max_attempts();
    let timeout = config.timeout;
    let mut chain = vec![DestinationTopic::main(base_topic, max_attempts, timeout)];

    if !config.enabled {
        return chain;
    }

    match BackOffPolicy::for_config(config) {
        BackOffPolicy::Fixed { period } if config.retry_attempts > 0 => {
            chain.push(DestinationTopic::reusable_retry(
                naming.reusable_retry_topic(base_topic),
                period,
                max_attempts,
                timeout,
            ));
        }
        BackOffPolicy::Fixed { .. } => {}
        policy @ BackOffPolicy::Exponential { .. } => {
            for (index, delay) in policy.delays(config.retry_attempts).into_iter().enumerate() {
                chain.push(DestinationTopic::retry(
                    naming.retry_topic(base_topic, index),
                    delay,
                    max_attempts,
                    timeout,
                ));
            }
        }
    }

    if config.dlt_enabled {
        chain.push(DestinationTopic::dlt(
            naming.dlt_topic(base_topic),
            max_attempts,
            timeout,
        ));
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SameIntervalTopicReuseStrategy;

    fn names(topology: &RetryTopology) -> Vec<&str> {
        topology.destinations().iter().map(|d| d.name()).collect()
    }

    fn orders_properties(config: RetryTopicConfig) -> RetryTopicProperties {
        RetryTopicProperties::default().with_topic("orders", config)
    }

    #[test]
    fn test_exponential_chain() {
        let properties = orders_properties(RetryTopicConfig {
            retry_attempts: 3,
            delay: 1000,
            multiplier: 2.0,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("orders-listener", "orders"))
            .unwrap();

        assert_eq!(
            names(&topology),
            vec!["orders", "orders-retry-0", "orders-retry-1", "orders-retry-2", "orders-dlt"]
        );
        let delays: Vec<u64> = topology.destinations().iter().map(|d| d.delay_millis()).collect();
        assert_eq!(delays, vec![0, 1000, 2000, 4000, 0]);

        assert_eq!(topology.main_topics().count(), 1);
        assert_eq!(topology.retry_topics().count(), 3);
        assert_eq!(topology.dlt_topics().count(), 1);
        assert!(topology.destinations().iter().all(|d| d.max_attempts() == 4));
        assert_eq!(topology.next("orders-retry-2").unwrap().name(), "orders-dlt");
        assert!(topology.next("orders-dlt").is_none());
    }

    #[test]
    fn test_retry_count_matches_attempts() {
        for attempts in 0..6u32 {
            let properties = orders_properties(RetryTopicConfig {
                retry_attempts: attempts,
                ..Default::default()
            });
            let topology = TopologyBuilder::new(&properties)
                .build(&ListenerEndpoint::new("l", "orders"))
                .unwrap();
            assert_eq!(topology.retry_topics().count(), attempts as usize);
            assert!(topology.destinations()[0].is_main_topic());
            assert!(topology.destinations().last().unwrap().is_dlt_topic());

            let indexes: Vec<usize> = topology
                .retry_topics()
                .map(|d| d.name().rsplit('-').next().unwrap().parse().unwrap())
                .collect();
            assert_eq!(indexes, (0..attempts as usize).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_dlt_disabled_is_omitted() {
        let properties = orders_properties(RetryTopicConfig {
            retry_attempts: 1,
            dlt_enabled: false,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();
        assert_eq!(names(&topology), vec!["orders", "orders-retry-0"]);
        assert!(topology.dlt_from("orders").is_none());
    }

    #[test]
    fn test_single_topic_reuse() {
        let properties = orders_properties(RetryTopicConfig {
            retry_attempts: 4,
            delay: 5000,
            reuse_strategy: SameIntervalTopicReuseStrategy::SingleTopic,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();
        assert_eq!(names(&topology), vec!["orders", "orders-retry", "orders-dlt"]);
        let retry = topology.get("orders-retry").unwrap();
        assert!(retry.is_retry_topic());
        assert!(retry.is_reusable_retry_topic());
        assert_eq!(retry.delay_millis(), 5000);
    }

    #[test]
    fn test_group_based_naming() {
        let properties = orders_properties(RetryTopicConfig {
            retry_attempts: 1,
            group_based_naming: true,
            resource_prefix: Some("shop".to_string()),
            ..Default::default()
        });
        let builder = TopologyBuilder::new(&properties);

        let topology = builder
            .build(&ListenerEndpoint::new("l", "orders").with_group_id("shop_billing"))
            .unwrap();
        assert_eq!(
            names(&topology),
            vec!["orders", "orders-billing-retry-0", "orders-billing-dlt"]
        );

        let topology = builder
            .build(&ListenerEndpoint::new("l", "orders").with_group_id("shop-audit"))
            .unwrap();
        assert_eq!(
            names(&topology),
            vec!["orders", "orders-audit-retry-0", "orders-audit-dlt"]
        );

        let err = builder.build(&ListenerEndpoint::new("l", "orders")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_group_segment() {
        assert_eq!(group_segment("shop_billing", Some("shop")), "billing");
        assert_eq!(group_segment("shop-billing", Some("shop")), "billing");
        assert_eq!(group_segment("shopbilling", Some("shop")), "shopbilling");
        assert_eq!(group_segment("billing", None), "billing");
        assert_eq!(group_segment("shop_", Some("shop")), "shop_");
    }

    #[test]
    fn test_add_chain_is_idempotent() {
        let properties = orders_properties(RetryTopicConfig::default());
        let built = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();

        let mut topology = built.clone();
        let chain = built.destinations().to_vec();
        assert_eq!(topology.add_chain(chain, None), 0);
        assert_eq!(topology.merge(built.clone()), 0);
        assert_eq!(topology.destinations(), built.destinations());
        assert_eq!(topology.topics_to_create().len(), built.topics_to_create().len());
    }

    #[test]
    fn test_multi_topic_listener_keeps_chains_apart() {
        let properties = RetryTopicProperties::default();
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders").with_topic("payments"))
            .unwrap();

        assert!(topology.next("orders-dlt").is_none());
        assert_eq!(topology.dlt_from("payments-retry-1").unwrap().name(), "payments-dlt");
        assert_eq!(topology.family_for("orders-retry-0").unwrap().main_topic, "orders");
        assert_eq!(topology.family_for("payments-dlt").unwrap().main_topic, "payments");
    }

    #[test]
    fn test_topics_to_create() {
        let properties = orders_properties(RetryTopicConfig {
            retry_attempts: 2,
            num_partitions: 6,
            replication_factor: 3,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();
        let created: Vec<&str> = topology.topics_to_create().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(created, vec!["orders-retry-0", "orders-retry-1", "orders-dlt"]);
        assert!(topology.topics_to_create().iter().all(|t| t.num_partitions == 6));

        let properties = orders_properties(RetryTopicConfig {
            auto_create_topics: false,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();
        assert!(topology.topics_to_create().is_empty());
    }

    #[test]
    fn test_repeated_topic_is_provisioned_once() {
        let properties = RetryTopicProperties::default();
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders").with_topic("orders"))
            .unwrap();

        assert_eq!(topology.destinations().len(), 5);
        let created: Vec<&str> = topology.topics_to_create().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            created,
            vec!["orders-retry-0", "orders-retry-1", "orders-retry-2", "orders-dlt"]
        );
    }

    #[test]
    fn test_disabled_family_has_only_main() {
        let properties = orders_properties(RetryTopicConfig {
            enabled: false,
            ..Default::default()
        });
        let topology = TopologyBuilder::new(&properties)
            .build(&ListenerEndpoint::new("l", "orders"))
            .unwrap();
        assert_eq!(names(&topology), vec!["orders"]);
    }

    #[test]
    fn test_no_ops_flags() {
        let no_ops = DestinationTopic::no_ops();
        assert!(no_ops.is_no_ops_topic());
        assert!(!no_ops.is_main_topic());
        assert!(!no_ops.is_retry_topic());
        assert!(!no_ops.is_dlt_topic());
        assert!(!no_ops.is_reusable_retry_topic());
        assert_eq!(no_ops.delay_millis(), 0);
    }

    #[test]
    fn test_timeout_window() {
        let destination = DestinationTopic::retry("orders-retry-0", 1000, 4, Some(10_000));
        assert!(!destination.is_past_timeout(0, 10_000));
        assert!(destination.is_past_timeout(0, 10_001));
        assert!(!DestinationTopic::retry("r", 1000, 4, None).is_past_timeout(0, i64::MAX));
    }

    #[test]
    fn test_last_retry_suffix() {
        let naming = TopicNaming::for_config(&RetryTopicConfig::default(), None).unwrap();
        assert_eq!(naming.last_retry_suffix(3).as_deref(), Some("-retry-2"));
        assert_eq!(naming.last_retry_suffix(0), None);

        let config = RetryTopicConfig {
            group_based_naming: true,
            ..Default::default()
        };
        assert_eq!(TopicNaming::ungrouped(&config).retry_suffix(), "-retry");
    }
}
