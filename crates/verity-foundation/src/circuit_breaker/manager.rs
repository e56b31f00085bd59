//! One breaker per pipeline stage.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use verity_kernel::stage::StageId;

use super::config::CircuitBreakerConfig;
use super::metrics::StateTransition;
use super::state::{Admission, CircuitBreaker, State};

/// Point-in-time view of one stage's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub stage: StageId,
    pub state: State,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    pub last_transition: Option<StateTransition>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

/// Owns the per-stage breakers. Breakers are independent: tripping one stage
/// never affects another, and each is locked separately.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: DashMap<StageId, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let breakers = DashMap::new();
        for stage in StageId::ALL {
            breakers.insert(
                stage,
                Arc::new(CircuitBreaker::new(stage.as_str(), config.clone())),
            );
        }
        Self { config, breakers }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn breaker(&self, stage: StageId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(stage)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(stage.as_str(), self.config.clone())))
            .clone()
    }

    /// Admission check that tells the caller whether it holds the probe slot.
    pub fn try_admit(&self, stage: StageId) -> Admission {
        self.breaker(stage).try_admit()
    }

    /// Whether a call to `stage` may proceed now. A `true` from a half-open
    /// circuit claims its single probe slot.
    pub fn is_eligible(&self, stage: StageId) -> bool {
        self.try_admit(stage).is_admitted()
    }

    pub fn record_success(&self, stage: StageId) {
        self.breaker(stage).record_success();
    }

    pub fn record_failure(&self, stage: StageId) {
        self.breaker(stage).record_failure();
    }

    pub fn abandon_probe(&self, stage: StageId) {
        self.breaker(stage).abandon_probe();
    }

    pub fn reset(&self, stage: StageId) {
        self.breaker(stage).reset();
    }

    pub fn state(&self, stage: StageId) -> State {
        self.breaker(stage).state()
    }

    /// Status of every stage, in cascade order.
    pub fn status(&self) -> Vec<CircuitStatus> {
        StageId::ALL
            .iter()
            .map(|stage| {
                let cb = self.breaker(*stage);
                let metrics = cb.metrics();
                CircuitStatus {
                    stage: *stage,
                    state: cb.state(),
                    consecutive_failures: cb.consecutive_failures(),
                    probe_in_flight: cb.probe_in_flight(),
                    last_transition: metrics.last_transition(),
                    total_successes: metrics.total_successes(),
                    total_failures: metrics.total_failures(),
                    total_rejected: metrics.total_rejected(),
                }
            })
            .collect()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
