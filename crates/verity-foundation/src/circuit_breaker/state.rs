//! Circuit Breaker State Machine
//!
//! Three states:
//! - Closed: calls are admitted; consecutive failures are counted
//! - Open: calls are rejected until the cooldown elapses
//! - Half-Open: exactly one probe call is admitted; its outcome decides
//!   between Closed and Open

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::CircuitBreakerConfig;
use super::metrics::{CircuitBreakerMetrics, StateTransition};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Closed => write!(f, "closed"),
            State::Open => write!(f, "open"),
            State::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; the call proceeds normally.
    Allowed,
    /// The caller holds the single half-open probe slot and must resolve it
    /// with a success, a failure or [`CircuitBreaker::abandon_probe`].
    Probe,
    /// Open, or half-open with a probe already in flight.
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Single-stage breaker. All transitions happen under one short lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let metrics = CircuitBreakerMetrics::new(config.history_len);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    /// Stored state. An open circuit whose cooldown has elapsed still reads
    /// `Open` until the next admission check moves it to half-open.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn probe_in_flight(&self) -> bool {
        self.inner.lock().probe_in_flight
    }

    /// Decides whether a call may proceed, claiming the probe slot when the
    /// circuit is ready to half-open.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        let admission = match inner.state {
            State::Closed => Admission::Allowed,
            State::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    self.transition(&mut inner, State::HalfOpen);
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen if inner.probe_in_flight => Admission::Rejected,
            State::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
        };
        if admission == Admission::Rejected {
            self.metrics.record_rejected();
        }
        admission
    }

    pub fn record_success(&self) {
        self.metrics.record_success();
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => inner.consecutive_failures = 0,
            State::HalfOpen => {
                info!(breaker = %self.name, "probe succeeded, closing circuit");
                self.close(&mut inner);
            }
            // A call admitted before the circuit opened; the open period stands.
            State::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.metrics.record_failure();
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    self.open(&mut inner);
                }
            }
            State::HalfOpen => {
                inner.consecutive_failures += 1;
                warn!(breaker = %self.name, "probe failed, reopening circuit");
                self.open(&mut inner);
            }
            State::Open => inner.consecutive_failures += 1,
        }
    }

    /// Frees a claimed probe slot without a verdict.
    pub fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Forces the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    fn open(&self, inner: &mut Inner) {
        self.transition(inner, State::Open);
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
    }

    fn close(&self, inner: &mut Inner) {
        self.transition(inner, State::Closed);
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        if inner.state == to {
            return;
        }
        self.metrics
            .record_transition(StateTransition::new(inner.state, to));
        inner.state = to;
    }
}
