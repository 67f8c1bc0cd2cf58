//! Kafka Resilience
//!
//! Reliability control plane for Kafka listeners.
//!
//! ## Features
//!
//! - **Retry topologies**: main -> `-retry-N` chain -> `-dlt`, fixed or
//!   exponential backoff, per-listener overrides
//! - **Destination resolver**: picks the next topic for a failed record
//!   (no-retryable, poison, last-retry guard, timeout, chain walk)
//! - **Retry router**: republishes with lineage headers
//! - **Dead-letter pipeline**: ordered actions, mandatory failures block the
//!   acknowledgment
//! - **Consumption governor**: pauses and resumes listener containers on
//!   circuit breaker transitions
//!
//! ## Example
//!
//! ```ignore
//! use kafka_resilience::{DestinationResolver, FromEnv, KafkaSettings, ListenerEndpoint, RetryTopicRouter};
//!
//! let settings = KafkaSettings::from_env()?;
//! let resolver = Arc::new(DestinationResolver::new(settings.retry_topics.clone()));
//! resolver.register(&ListenerEndpoint::new("orders-listener", "orders").with_group_id("orders"))?;
//!
//! let router = RetryTopicRouter::new(resolver, publisher);
//! if let Err(err) = handle(&record).await {
//!     router.route("orders-listener", &record, err.as_ref()).await?;
//! }
//! ```

mod backoff;
mod breaker;
mod dead_letter;
mod error;
mod governor;
mod logging;
pub mod metrics;
mod overrides;
mod record;
mod resolver;
mod router;
mod settings;
mod topology;

pub use backoff::{BackOffPolicy, max_interval};
pub use breaker::{
    BreakerCallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    StateTransition,
};
pub use dead_letter::{
    Acknowledgment, CentralDltForwardingAction, DeadLetterAction, DeadLetterHandler, LoggingAction,
    PipelineReport, SOURCE_APPLICATION_HEADER, run_pipeline,
};
pub use error::{
    FailureKind, NoRetryableError, PoisonMessageError, ResilienceError, ResilienceResult, classify,
    render_cause_chain,
};
pub use governor::{
    Consumption, ConsumptionGovernor, ContainerRegistry, GovernedGroup, GovernedListener,
    GovernorAction, ListenerContainer, ListenerDeclaration,
};
pub use logging::init_tracing;
pub use overrides::{RetryTopicOverrides, UNSET, override_bool, override_or};
pub use record::{ConsumerRecord, Headers, KafkaRecordSnapshot, ProducerRecord, header};
pub use resolver::{DestinationResolver, strip_partition_suffix};
pub use router::{RecordPublisher, RetryTopicRouter, RoutingOutcome, backoff_remaining};
pub use settings::{
    AckMode, CentralDltSettings, ConfigError, DltStrategy, Environment, FromEnv, KafkaSettings,
    MIN_DELAY_MS, RetryTopicConfig, RetryTopicProperties, SameIntervalTopicReuseStrategy,
    env_or_default, env_parse, env_required,
};
pub use topology::{
    DestinationKind, DestinationTopic, ListenerEndpoint, NO_OPS_TOPIC, NewTopic, RetryTopology,
    TopicFamily, TopicNaming, TopologyBuilder, group_segment,
};
