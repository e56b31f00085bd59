//! Circuit Breaker Configuration

use std::time::Duration;

use verity_kernel::config::BreakerConfig;

/// Settings for a single stage breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a single probe is let through.
    pub cooldown: Duration,
    /// Number of state transitions kept for inspection.
    pub history_len: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            history_len: 32,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(cfg: &BreakerConfig) -> Self {
        Self::new()
            .with_failure_threshold(cfg.failure_threshold)
            .with_cooldown(cfg.cooldown())
            .with_history_len(cfg.history_len)
    }
}
