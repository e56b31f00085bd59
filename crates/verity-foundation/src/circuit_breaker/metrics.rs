//! Circuit Breaker Metrics
//!
//! Request counters and a bounded history of state transitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::state::State;

/// State transition event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: State,
    pub to_state: State,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl StateTransition {
    pub fn new(from_state: State, to_state: State) -> Self {
        Self {
            from_state,
            to_state,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Per-breaker counters
#[derive(Debug)]
pub struct CircuitBreakerMetrics {
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    /// Calls refused because the circuit was open or a probe was outstanding
    total_rejected: AtomicU64,
    total_transitions: AtomicU64,
    transitions: RwLock<VecDeque<StateTransition>>,
    history_len: usize,
}

impl CircuitBreakerMetrics {
    pub fn new(history_len: usize) -> Self {
        Self {
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_transitions: AtomicU64::new(0),
            transitions: RwLock::new(VecDeque::with_capacity(history_len)),
            history_len,
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, transition: StateTransition) {
        self.total_transitions.fetch_add(1, Ordering::Relaxed);
        if self.history_len == 0 {
            return;
        }
        let mut transitions = self.transitions.write();
        transitions.push_back(transition);
        while transitions.len() > self.history_len {
            transitions.pop_front();
        }
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    pub fn total_transitions(&self) -> u64 {
        self.total_transitions.load(Ordering::Relaxed)
    }

    /// Failure rate as a percentage (0-100)
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_successes() + self.total_failures();
        if total == 0 {
            return 0.0;
        }
        (self.total_failures() as f64 / total as f64) * 100.0
    }

    /// Transitions, oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.read().iter().cloned().collect()
    }

    pub fn last_transition(&self) -> Option<StateTransition> {
        self.transitions.read().back().cloned()
    }
}
