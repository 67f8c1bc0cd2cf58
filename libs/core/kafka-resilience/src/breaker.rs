//! Circuit breakers with a state-transition stream
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ open timeout elapsed
//!      │                                   v
//!      │      successes          ┌─────────────┐
//!      └──────────────────────── │  HALF_OPEN  │ ── failure ──> OPEN
//!                                └─────────────┘
//! ```
//!
//! Every state change is published as a [`StateTransition`] on a
//! `tokio::sync::broadcast` channel. Breakers created by one
//! [`CircuitBreakerRegistry`] share a single channel.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics;

const EVENT_CAPACITY: usize = 64;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// Calls are let through to probe recovery
    HalfOpen,
}

/// A state change of one breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub open_timeout: Duration,
    /// Error percentage (0-100) over the window that opens the circuit.
    pub error_rate_threshold: Option<u32>,
    pub window_size: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            error_rate_threshold: None,
            window_size: 100,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Error rate threshold, capped at 100
    pub fn with_error_rate_threshold(mut self, rate: u32) -> Self {
        self.error_rate_threshold = Some(rate.min(100));
        self
    }
}

/// Outcome of a call made through [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerCallError<E> {
    /// The breaker is open, the call was not made
    NotPermitted(String),
    /// The call was made and failed
    Failed(E),
}

impl<E> BreakerCallError<E> {
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, BreakerCallError::NotPermitted(_))
    }
}

impl<E: fmt::Display> fmt::Display for BreakerCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPermitted(breaker) => {
                write!(f, "circuit breaker '{breaker}' is open, call not permitted")
            }
            Self::Failed(err) => err.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerCallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotPermitted(_) => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    window_total: AtomicU32,
    window_failures: AtomicU32,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreaker {
    /// Breaker with its own transition channel
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(name, config, events)
    }

    /// Breaker publishing on an existing channel
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<StateTransition>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            window_total: AtomicU32::new(0),
            window_failures: AtomicU32::new(0),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every later state change of this breaker
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    /// Whether a call may go through. An open breaker whose timeout elapsed
    /// moves to half-open and lets the call through.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.open_timeout_elapsed() {
                    self.transition_to(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.update_sliding_window(false);

        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.update_sliding_window(true);

        match self.state() {
            CircuitState::Closed => {
                if let Some(threshold) = self.config.error_rate_threshold
                    && self.error_rate() >= threshold
                {
                    self.transition_to(CircuitState::Open);
                    return;
                }

                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Error rate over the current window (0-100)
    pub fn error_rate(&self) -> u32 {
        let total = self.window_total.load(Ordering::SeqCst);
        if total == 0 {
            return 0;
        }
        let failures = self.window_failures.load(Ordering::SeqCst);
        ((failures as f64 / total as f64) * 100.0) as u32
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Force the breaker closed and clear the window
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.window_total.store(0, Ordering::SeqCst);
        self.window_failures.store(0, Ordering::SeqCst);
    }

    /// Move to `to`, publishing the transition. Returns false when the
    /// breaker already was in that state.
    pub fn transition_to(&self, to: CircuitState) -> bool {
        let from = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if from == to {
                return false;
            }
            *state = to;
            from
        };

        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap_or_else(PoisonError::into_inner) =
            (to == CircuitState::Open).then(Instant::now);

        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "Circuit breaker OPENED"),
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, %from, "Circuit breaker HALF_OPEN (testing recovery)")
            }
            CircuitState::Closed => info!(breaker = %self.name, %from, "Circuit breaker CLOSED"),
        }
        metrics::breaker_transition(&self.name, to.as_ref());

        // no subscribers is fine
        let _ = self.events.send(StateTransition {
            breaker: self.name.clone(),
            from,
            to,
        });
        true
    }

    /// Run `f` through the breaker, recording its outcome.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerCallError<E>> {
        if !self.can_execute() {
            return Err(BreakerCallError::NotPermitted(self.name.clone()));
        }
        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerCallError::Failed(err))
            }
        }
    }

    /// Async variant of [`call`](Self::call)
    pub async fn call_async<T, E, F>(&self, future: F) -> Result<T, BreakerCallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.can_execute() {
            return Err(BreakerCallError::NotPermitted(self.name.clone()));
        }
        match future.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerCallError::Failed(err))
            }
        }
    }

    fn open_timeout_elapsed(&self) -> bool {
        match *self.opened_at.read().unwrap_or_else(PoisonError::into_inner) {
            Some(opened) => opened.elapsed() >= self.config.open_timeout,
            None => true,
        }
    }

    fn update_sliding_window(&self, is_failure: bool) {
        let total = self.window_total.fetch_add(1, Ordering::SeqCst) + 1;
        if is_failure {
            self.window_failures.fetch_add(1, Ordering::SeqCst);
        }
        if total >= self.config.window_size {
            self.window_total.store(0, Ordering::SeqCst);
            self.window_failures.store(0, Ordering::SeqCst);
        }
    }
}

/// Named breakers sharing one transition channel.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<StateTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Breaker named `name`, created with the default config on first use
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, || self.default_config.clone())
    }

    /// Breaker named `name`, created with `config` on first use
    pub fn breaker_with(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_events(name, config(), self.events.clone()))
        }))
    }

    /// Transitions of every breaker of this registry
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.events.subscribe()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
