//! Circuit-breaker consumption governor
//!
//! Pauses and resumes the listener containers of a topic group when their
//! breaker changes state:
//!
//! | Transition          | Action                                        |
//! |---------------------|-----------------------------------------------|
//! | CLOSED -> OPEN      | pause every governed container                |
//! | OPEN -> HALF_OPEN   | resume all but the last retry topic container |
//! | HALF_OPEN -> OPEN   | pause those same containers again             |
//! | HALF_OPEN -> CLOSED | resume everything                             |
//! | OPEN -> CLOSED      | resume everything (forced reset)              |
//!
//! The governed set is discovered on the first relevant transition and
//! cached for the lifetime of the governor.

use once_cell::sync::OnceCell;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::breaker::{BreakerCallError, CircuitBreaker, CircuitState, StateTransition};
use crate::dead_letter::Acknowledgment;
use crate::error::{ResilienceError, ResilienceResult};
use crate::metrics::{self, ListenerMetrics};
use crate::settings::{AckMode, KafkaSettings};

/// A running consumer owned by the broker client.
pub trait ListenerContainer: Send + Sync {
    fn listener_id(&self) -> &str;
    fn is_running(&self) -> bool;
    fn is_paused(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
}

/// Source of the listener containers of the process.
#[cfg_attr(test, mockall::automock)]
pub trait ContainerRegistry: Send + Sync {
    fn containers(&self) -> Vec<Arc<dyn ListenerContainer>>;
}

/// Which containers a breaker governs.
///
/// A container belongs to the group when its id starts with the breaker
/// name and does not contain the DLT marker. With `retry_topics_only` it
/// must also contain the retry marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernedGroup {
    pub breaker_name: String,
    pub dlt_marker: String,
    pub retry_marker: String,
    pub retry_topics_only: bool,
}

impl GovernedGroup {
    pub fn new(breaker_name: impl Into<String>) -> Self {
        Self {
            breaker_name: breaker_name.into(),
            dlt_marker: "-dlt".to_string(),
            retry_marker: "-retry".to_string(),
            retry_topics_only: false,
        }
    }

    pub fn with_retry_topics_only(mut self, retry_topics_only: bool) -> Self {
        self.retry_topics_only = retry_topics_only;
        self
    }

    pub fn with_markers(mut self, retry_marker: impl Into<String>, dlt_marker: impl Into<String>) -> Self {
        self.retry_marker = retry_marker.into();
        self.dlt_marker = dlt_marker.into();
        self
    }

    pub fn matches(&self, container_id: &str) -> bool {
        container_id.starts_with(&self.breaker_name)
            && !container_id.contains(&self.dlt_marker)
            && (!self.retry_topics_only || container_id.contains(&self.retry_marker))
    }
}

/// What the governor did for one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum GovernorAction {
    PauseAll,
    ResumeExceptLast,
    PauseExceptLast,
    ResumeAll,
    Ignore,
}

struct GovernedContainers {
    all: Vec<Arc<dyn ListenerContainer>>,
    /// Everything except the containers of the highest-index retry topic
    except_last: Vec<Arc<dyn ListenerContainer>>,
}

/// Reacts to breaker transitions by pausing and resuming containers.
pub struct ConsumptionGovernor {
    group: GovernedGroup,
    registry: Arc<dyn ContainerRegistry>,
    retry_index: Regex,
    containers: OnceCell<GovernedContainers>,
}

impl ConsumptionGovernor {
    pub fn new(group: GovernedGroup, registry: Arc<dyn ContainerRegistry>) -> ResilienceResult<Self> {
        let pattern = format!(r"{}-(\d+)", regex::escape(&group.retry_marker));
        let retry_index = Regex::new(&pattern)
            .map_err(|e| ResilienceError::config(format!("invalid retry marker: {e}")))?;

        Ok(Self {
            group,
            registry,
            retry_index,
            containers: OnceCell::new(),
        })
    }

    pub fn group(&self) -> &GovernedGroup {
        &self.group
    }

    /// Apply the transition table. Transitions of other breakers are
    /// ignored.
    pub fn on_transition(&self, transition: &StateTransition) -> GovernorAction {
        if transition.breaker != self.group.breaker_name {
            return GovernorAction::Ignore;
        }

        let action = match (transition.from, transition.to) {
            (CircuitState::Closed, CircuitState::Open) => GovernorAction::PauseAll,
            (CircuitState::Open, CircuitState::HalfOpen) => GovernorAction::ResumeExceptLast,
            (CircuitState::HalfOpen, CircuitState::Open) => GovernorAction::PauseExceptLast,
            (CircuitState::HalfOpen, CircuitState::Closed) | (CircuitState::Open, CircuitState::Closed) => {
                GovernorAction::ResumeAll
            }
            (from, to) => {
                debug!(breaker = %transition.breaker, %from, %to, "Transition ignored by governor");
                return GovernorAction::Ignore;
            }
        };

        let containers = self.containers.get_or_init(|| self.discover());
        let toggled = match action {
            GovernorAction::PauseAll => pause(&containers.all),
            GovernorAction::ResumeExceptLast => resume(&containers.except_last),
            GovernorAction::PauseExceptLast => pause(&containers.except_last),
            GovernorAction::ResumeAll => resume(&containers.all),
            GovernorAction::Ignore => 0,
        };

        let label = match action {
            GovernorAction::PauseAll | GovernorAction::PauseExceptLast => "pause",
            _ => "resume",
        };
        info!(
            breaker = %transition.breaker,
            from = %transition.from,
            to = %transition.to,
            action = %action,
            toggled,
            "Governor applied breaker transition"
        );
        metrics::containers_toggled(&self.group.breaker_name, label, toggled);

        action
    }

    /// Consume transitions until shutdown or until the channel closes.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<StateTransition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(breaker = %self.group.breaker_name, "Starting consumption governor");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal, stopping governor");
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(transition) => {
                            self.on_transition(&transition);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                breaker = %self.group.breaker_name,
                                skipped,
                                "Governor lagged behind breaker transitions"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Breaker transition stream closed, stopping governor");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn discover(&self) -> GovernedContainers {
        let all: Vec<Arc<dyn ListenerContainer>> = self
            .registry
            .containers()
            .into_iter()
            .filter(|c| self.group.matches(c.listener_id()))
            .collect();

        let last_index = all.iter().filter_map(|c| self.retry_index_of(c.listener_id())).max();
        let except_last = all
            .iter()
            .filter(|c| last_index.is_none() || self.retry_index_of(c.listener_id()) != last_index)
            .cloned()
            .collect::<Vec<_>>();

        info!(
            breaker = %self.group.breaker_name,
            governed = all.len(),
            last_retry_index = ?last_index,
            "Discovered governed listener containers"
        );
        GovernedContainers { all, except_last }
    }

    fn retry_index_of(&self, container_id: &str) -> Option<u32> {
        self.retry_index
            .captures(container_id)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

fn pause(containers: &[Arc<dyn ListenerContainer>]) -> usize {
    let mut paused = 0;
    for container in containers {
        if container.is_running() && !container.is_paused() {
            container.pause();
            paused += 1;
        }
    }
    paused
}

fn resume(containers: &[Arc<dyn ListenerContainer>]) -> usize {
    let mut resumed = 0;
    for container in containers {
        if container.is_paused() {
            container.resume();
            resumed += 1;
        }
    }
    resumed
}

/// How a listener is declared by the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerDeclaration {
    pub listener_ids: Vec<String>,
    /// The handler is marked as retry-topic governed
    pub retry_topic_governed: bool,
}

/// Result of a governed consumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption<T> {
    /// Processed and acknowledged
    Processed(T),
    /// Rejected by an open breaker, nacked for redelivery
    Rejected,
}

/// Wraps a listener's processing with its breaker.
///
/// A call rejected by an open breaker is nacked and redelivered after the
/// configured delay without advancing the retry chain. Processing errors
/// are returned to the caller untouched.
pub struct GovernedListener {
    listener_id: String,
    breaker: Arc<CircuitBreaker>,
    nack_delay: Duration,
    metrics: ListenerMetrics,
}

impl GovernedListener {
    /// Fails unless the declaration names exactly one listener id, the ack
    /// mode is manual and the handler is retry-topic governed.
    pub fn new(
        declaration: &ListenerDeclaration,
        settings: &KafkaSettings,
        breaker: Arc<CircuitBreaker>,
    ) -> ResilienceResult<Self> {
        let listener_id = match declaration.listener_ids.as_slice() {
            [id] if !id.is_empty() => id.clone(),
            ids => {
                return Err(ResilienceError::config(format!(
                    "a governed listener needs exactly one listener id, got {}",
                    ids.len()
                )));
            }
        };
        if !settings.ack_mode.is_manual() {
            return Err(ResilienceError::config(format!(
                "listener '{listener_id}' is governed but ack mode is {}, expected {} or {}",
                settings.ack_mode,
                AckMode::Manual,
                AckMode::ManualImmediate
            )));
        }
        if !declaration.retry_topic_governed {
            return Err(ResilienceError::config(format!(
                "listener '{listener_id}' must be marked as retry-topic governed"
            )));
        }

        Ok(Self {
            metrics: ListenerMetrics::new(&listener_id),
            listener_id,
            breaker,
            nack_delay: Duration::from_millis(settings.nack_delay_ms),
        })
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    /// Run `process` through the breaker and settle the acknowledgment.
    pub fn consume<T, E>(
        &self,
        ack: &dyn Acknowledgment,
        process: impl FnOnce() -> Result<T, E>,
    ) -> Result<Consumption<T>, E>
    where
        E: From<ResilienceError>,
    {
        match self.breaker.call(process) {
            Ok(value) => {
                ack.acknowledge()?;
                Ok(Consumption::Processed(value))
            }
            Err(BreakerCallError::NotPermitted(breaker)) => {
                warn!(
                    listener_id = %self.listener_id,
                    breaker = %breaker,
                    delay_ms = self.nack_delay.as_millis() as u64,
                    "Call not permitted, nacking record"
                );
                self.metrics.rejected();
                ack.nack(self.nack_delay)?;
                Ok(Consumption::Rejected)
            }
            Err(BreakerCallError::Failed(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::dead_letter::MockAcknowledgment;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlagContainer {
        id: String,
        paused: AtomicBool,
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl FlagContainer {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                ..Default::default()
            })
        }
    }

    impl ListenerContainer for FlagContainer {
        fn listener_id(&self) -> &str {
            &self.id
        }
        fn is_running(&self) -> bool {
            true
        }
        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
        fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transition(from: CircuitState, to: CircuitState) -> StateTransition {
        StateTransition {
            breaker: "orders".to_string(),
            from,
            to,
        }
    }

    fn registry(containers: &[Arc<FlagContainer>]) -> Arc<dyn ContainerRegistry> {
        let containers: Vec<Arc<dyn ListenerContainer>> = containers
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ListenerContainer>)
            .collect();
        let mut registry = MockContainerRegistry::new();
        registry
            .expect_containers()
            .times(1)
            .returning(move || containers.clone());
        Arc::new(registry)
    }

    #[test]
    fn test_group_matching() {
        let group = GovernedGroup::new("orders");
        assert!(group.matches("orders-listener"));
        assert!(group.matches("orders-retry-0"));
        assert!(!group.matches("orders-dlt"));
        assert!(!group.matches("payments-retry-0"));

        let group = group.with_retry_topics_only(true);
        assert!(!group.matches("orders-listener"));
        assert!(group.matches("orders-retry-1"));
    }

    #[test]
    fn test_transition_table() {
        let main = FlagContainer::new("orders-listener");
        let retry0 = FlagContainer::new("orders-retry-0");
        let retry1 = FlagContainer::new("orders-retry-1");
        let dlt = FlagContainer::new("orders-dlt");
        let governor = ConsumptionGovernor::new(
            GovernedGroup::new("orders"),
            registry(&[main.clone(), retry0.clone(), retry1.clone(), dlt.clone()]),
        )
        .unwrap();

        let action = governor.on_transition(&transition(CircuitState::Closed, CircuitState::Open));
        assert_eq!(action, GovernorAction::PauseAll);
        assert!(main.is_paused() && retry0.is_paused() && retry1.is_paused());
        assert!(!dlt.is_paused());

        let action = governor.on_transition(&transition(CircuitState::Open, CircuitState::HalfOpen));
        assert_eq!(action, GovernorAction::ResumeExceptLast);
        assert!(!main.is_paused() && !retry0.is_paused());
        assert!(retry1.is_paused());

        let action = governor.on_transition(&transition(CircuitState::HalfOpen, CircuitState::Open));
        assert_eq!(action, GovernorAction::PauseExceptLast);
        assert!(main.is_paused() && retry0.is_paused());

        governor.on_transition(&transition(CircuitState::Open, CircuitState::HalfOpen));
        let action = governor.on_transition(&transition(CircuitState::HalfOpen, CircuitState::Closed));
        assert_eq!(action, GovernorAction::ResumeAll);
        assert!(!main.is_paused() && !retry0.is_paused() && !retry1.is_paused());

        assert_eq!(main.pauses.load(Ordering::SeqCst), 2);
        assert_eq!(retry1.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(retry1.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(dlt.pauses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let main = FlagContainer::new("orders-listener");
        let governor =
            ConsumptionGovernor::new(GovernedGroup::new("orders"), registry(&[main.clone()])).unwrap();

        governor.on_transition(&transition(CircuitState::Closed, CircuitState::Open));
        governor.on_transition(&transition(CircuitState::Closed, CircuitState::Open));
        assert_eq!(main.pauses.load(Ordering::SeqCst), 1);

        governor.on_transition(&transition(CircuitState::Open, CircuitState::Closed));
        governor.on_transition(&transition(CircuitState::HalfOpen, CircuitState::Closed));
        assert_eq!(main.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_other_breakers_are_ignored() {
        let mut registry = MockContainerRegistry::new();
        registry.expect_containers().never();
        let governor = ConsumptionGovernor::new(GovernedGroup::new("orders"), Arc::new(registry)).unwrap();

        let event = StateTransition {
            breaker: "payments".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        assert_eq!(governor.on_transition(&event), GovernorAction::Ignore);
        assert_eq!(
            governor.on_transition(&transition(CircuitState::Closed, CircuitState::HalfOpen)),
            GovernorAction::Ignore
        );
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let main = FlagContainer::new("orders-listener");
        let governor =
            ConsumptionGovernor::new(GovernedGroup::new("orders"), registry(&[main.clone()])).unwrap();

        let (events_tx, events_rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        events_tx
            .send(transition(CircuitState::Closed, CircuitState::Open))
            .unwrap();
        drop(events_tx);

        tokio::time::timeout(Duration::from_secs(5), governor.run(events_rx, shutdown_rx))
            .await
            .unwrap();
        assert!(main.is_paused());
        drop(shutdown_tx);
    }

    fn settings(ack_mode: AckMode) -> KafkaSettings {
        KafkaSettings {
            ack_mode,
            nack_delay_ms: 250,
            ..Default::default()
        }
    }

    fn declaration(ids: &[&str]) -> ListenerDeclaration {
        ListenerDeclaration {
            listener_ids: ids.iter().map(|s| s.to_string()).collect(),
            retry_topic_governed: true,
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("orders", CircuitBreakerConfig::new().with_failure_threshold(1)))
    }

    #[test]
    fn test_preconditions() {
        let ok = GovernedListener::new(&declaration(&["orders-listener"]), &settings(AckMode::Manual), breaker());
        assert_eq!(ok.unwrap().listener_id(), "orders-listener");

        let err = GovernedListener::new(&declaration(&["a", "b"]), &settings(AckMode::Manual), breaker())
            .err()
            .unwrap();
        assert!(err.is_fatal());

        assert!(GovernedListener::new(&declaration(&[]), &settings(AckMode::Manual), breaker()).is_err());
        assert!(GovernedListener::new(&declaration(&["a"]), &settings(AckMode::Batch), breaker()).is_err());

        let unmarked = ListenerDeclaration {
            retry_topic_governed: false,
            ..declaration(&["a"])
        };
        assert!(GovernedListener::new(&unmarked, &settings(AckMode::Manual), breaker()).is_err());
    }

    #[test]
    fn test_consume_acknowledges_or_nacks() {
        let breaker = breaker();
        let listener = GovernedListener::new(
            &declaration(&["orders-listener"]),
            &settings(AckMode::ManualImmediate),
            Arc::clone(&breaker),
        )
        .unwrap();

        let mut ack = MockAcknowledgment::new();
        ack.expect_acknowledge().times(1).returning(|| Ok(()));
        ack.expect_nack().never();
        let outcome: eyre::Result<_> = listener.consume(&ack, || Ok::<_, eyre::Report>(5));
        assert_eq!(outcome.unwrap(), Consumption::Processed(5));

        let mut ack = MockAcknowledgment::new();
        ack.expect_acknowledge().never();
        ack.expect_nack().never();
        let outcome = listener.consume(&ack, || Err::<(), _>(eyre::eyre!("stock service down")));
        assert!(outcome.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut ack = MockAcknowledgment::new();
        ack.expect_acknowledge().never();
        ack.expect_nack()
            .withf(|delay| *delay == Duration::from_millis(250))
            .times(1)
            .returning(|_| Ok(()));
        let mut invoked = false;
        let outcome = listener.consume(&ack, || {
            invoked = true;
            Ok::<_, eyre::Report>(())
        });
        assert_eq!(outcome.unwrap(), Consumption::Rejected);
        assert!(!invoked);
    }
}
