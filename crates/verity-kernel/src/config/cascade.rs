//! Static configuration of the cascade.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use super::{ConfigError, ConfigResult, ENV_PREFIX, FileFormat};
use crate::model::ModelUnitDescriptor;
use crate::stage::StageId;

// ============================================================================
// Sections
// ============================================================================

/// Resource monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    /// Utilisation at or above which pressure is `High`.
    pub high_pressure_pct: f64,
    /// Utilisation above which pressure is `Critical`.
    pub critical_pressure_pct: f64,
    /// After this long without a good sample the snapshot is stale and
    /// pressure reads as `Critical`.
    pub stale_after_ms: u64,
    pub history_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1_000,
            high_pressure_pct: 75.0,
            critical_pressure_pct: 90.0,
            stale_after_ms: 5_000,
            history_len: 100,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Model scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub memory_budget_mb: u64,
    /// Headroom kept free at all times; resident memory never exceeds
    /// `memory_budget_mb - safety_margin_mb`.
    pub safety_margin_mb: u64,
    /// Unreferenced units are unloaded after this long.
    pub idle_timeout_secs: u64,
    pub reap_interval_ms: u64,
    /// Maximum number of units loading at the same time.
    pub load_parallelism: usize,
    /// Also bound loads by the device's free memory when a fresh snapshot exists.
    pub respect_device_free: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_budget_mb: 16_384,
            safety_margin_mb: 512,
            idle_timeout_secs: 300,
            reap_interval_ms: 5_000,
            load_parallelism: 2,
            respect_device_free: true,
        }
    }
}

impl SchedulerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Memory available to resident units.
    pub fn usable_mb(&self) -> u64 {
        self.memory_budget_mb.saturating_sub(self.safety_margin_mb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Per-stage circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Transitions kept per breaker for inspection.
    pub history_len: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            history_len: 32,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Semantic cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Similarity at or above which an approximate match is a hit.
    pub similarity_threshold: f32,
    pub max_entries_per_stage: usize,
    pub ttl_secs: u64,
    /// Most recently used entries scanned by approximate lookup.
    pub similarity_window: usize,
    pub cacheable_stages: Vec<StageId>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.8,
            max_entries_per_stage: 1_000,
            ttl_secs: 3_600,
            similarity_window: 256,
            cacheable_stages: vec![
                StageId::Classify,
                StageId::Decompose,
                StageId::Investigate,
                StageId::Synthesize,
            ],
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn is_cacheable(&self, stage: StageId) -> bool {
        self.enabled && self.cacheable_stages.contains(&stage)
    }
}

/// Backoff strategy for requeue delays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed { delay_ms: u64 },
    /// Linear backoff with increment
    Linear {
        initial_delay_ms: u64,
        increment_ms: u64,
    },
    /// Exponential backoff
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
    },
    /// Exponential backoff with jitter
    ExponentialWithJitter {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        jitter_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialWithJitter {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 200,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the given attempt (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => Duration::from_millis(
                initial_delay_ms.saturating_add(increment_ms.saturating_mul(u64::from(attempt))),
            ),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
            } => {
                let delay = initial_delay_ms.saturating_mul(1 << attempt.min(10));
                Duration::from_millis(delay.min(*max_delay_ms))
            }
            Self::ExponentialWithJitter {
                initial_delay_ms,
                max_delay_ms,
                jitter_ms,
            } => {
                let capped = initial_delay_ms
                    .saturating_mul(1 << attempt.min(10))
                    .min(*max_delay_ms);
                if *jitter_ms == 0 {
                    return Duration::from_millis(capped);
                }
                use rand::Rng;
                let offset = rand::thread_rng().gen_range(0..*jitter_ms);
                let millis = capped
                    .saturating_add(offset)
                    .saturating_sub(jitter_ms / 2);
                Duration::from_millis(millis)
            }
        }
    }
}

/// Pipeline orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent pipelines (worker count).
    pub workers: usize,
    /// Per-stage timeout overrides in milliseconds.
    #[serde(deserialize_with = "stage_keyed")]
    pub stage_timeouts_ms: BTreeMap<StageId, u64>,
    /// Requeues after `ResourceExhausted` before the request fails.
    pub max_requeues: u32,
    pub requeue_backoff: BackoffStrategy,
    /// Stage to run in place of another whose circuit is open.
    #[serde(deserialize_with = "stage_keyed")]
    pub fallbacks: BTreeMap<StageId, StageId>,
    /// Skip non-critical stages with an open circuit instead of failing.
    pub degrade_on_open_circuit: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            stage_timeouts_ms: BTreeMap::new(),
            max_requeues: 3,
            requeue_backoff: BackoffStrategy::default(),
            fallbacks: BTreeMap::new(),
            degrade_on_open_circuit: false,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self, stage: StageId) -> Duration {
        self.stage_timeouts_ms
            .get(&stage)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| stage.default_timeout())
    }
}

/// The config layer hands map keys over as plain strings.
fn stage_keyed<'de, D, V>(deserializer: D) -> Result<BTreeMap<StageId, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    BTreeMap::<String, V>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            key.parse::<StageId>()
                .map(|stage| (stage, value))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Progress events buffered before the oldest is dropped.
    pub progress_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { progress_buffer: 256 }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete static configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub delivery: DeliveryConfig,
    pub models: Vec<ModelUnitDescriptor>,
}

impl CascadeConfig {
    /// Loads a file with `VERITY__*` environment overrides and validates it.
    pub fn load(path: &str) -> ConfigResult<Self> {
        let cfg: Self = super::load_with_env(path, ENV_PREFIX)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        let cfg: Self = super::from_str(content, format)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let m = &self.monitor;
        if m.sample_interval_ms == 0 {
            return invalid("monitor.sample_interval_ms must be positive".into());
        }
        if !(0.0 < m.high_pressure_pct
            && m.high_pressure_pct < m.critical_pressure_pct
            && m.critical_pressure_pct <= 100.0)
        {
            return invalid(format!(
                "monitor pressure thresholds must satisfy 0 < high ({}) < critical ({}) <= 100",
                m.high_pressure_pct, m.critical_pressure_pct
            ));
        }
        if m.history_len == 0 {
            return invalid("monitor.history_len must be positive".into());
        }

        let s = &self.scheduler;
        if s.usable_mb() == 0 {
            return invalid(format!(
                "scheduler.memory_budget_mb ({}) must exceed safety_margin_mb ({})",
                s.memory_budget_mb, s.safety_margin_mb
            ));
        }
        if s.load_parallelism == 0 {
            return invalid("scheduler.load_parallelism must be positive".into());
        }
        if s.reap_interval_ms == 0 {
            return invalid("scheduler.reap_interval_ms must be positive".into());
        }

        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be positive".into());
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be positive".into());
        }

        let c = &self.cache;
        if !(c.similarity_threshold > 0.0 && c.similarity_threshold <= 1.0) {
            return invalid(format!(
                "cache.similarity_threshold ({}) must be in (0, 1]",
                c.similarity_threshold
            ));
        }
        if c.max_entries_per_stage == 0 {
            return invalid("cache.max_entries_per_stage must be positive".into());
        }

        let p = &self.pipeline;
        if p.workers == 0 {
            return invalid("pipeline.workers must be positive".into());
        }
        for (stage, ms) in &p.stage_timeouts_ms {
            if *ms == 0 {
                return invalid(format!("pipeline.stage_timeouts_ms.{stage} must be positive"));
            }
        }
        for (stage, fallback) in &p.fallbacks {
            if stage == fallback {
                return invalid(format!("stage {stage} cannot fall back to itself"));
            }
        }

        if self.delivery.progress_buffer == 0 {
            return invalid("delivery.progress_buffer must be positive".into());
        }
        Ok(())
    }
}
