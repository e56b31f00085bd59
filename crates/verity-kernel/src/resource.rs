//! Resource sampling contract and snapshot types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pressure classification of the device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    #[default]
    Normal,
    High,
    Critical,
}

impl PressureLevel {
    /// Classifies a utilisation percentage.
    ///
    /// Below `high_pct` is normal, up to and including `critical_pct` is high,
    /// anything above is critical.
    pub fn classify(used_pct: f64, high_pct: f64, critical_pct: f64) -> Self {
        if used_pct > critical_pct {
            PressureLevel::Critical
        } else if used_pct >= high_pct {
            PressureLevel::High
        } else {
            PressureLevel::Normal
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PressureLevel::Normal => "normal",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Raw reading returned by a [`ResourceProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    pub total_mb: u64,
    pub used_mb: u64,
    /// Device temperature in Celsius, when the probe can read it.
    #[serde(default)]
    pub temperature_c: Option<f32>,
    /// Compute utilisation 0..=100, when available.
    #[serde(default)]
    pub utilization_pct: Option<f32>,
}

impl DeviceSample {
    pub fn free_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }

    pub fn used_pct(&self) -> f64 {
        if self.total_mb == 0 {
            return 100.0;
        }
        self.used_mb as f64 / self.total_mb as f64 * 100.0
    }
}

/// Monitor view of the device at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub used_pct: f64,
    pub pressure: PressureLevel,
    pub temperature_c: Option<f32>,
    pub utilization_pct: Option<f32>,
    /// Milliseconds since the Unix epoch at which the sample was taken.
    pub sampled_at_ms: i64,
    /// Set when the probe has failed for longer than the grace period. A
    /// stale snapshot always reports `Critical` pressure.
    #[serde(default)]
    pub stale: bool,
}

impl ResourceSnapshot {
    /// Pressure follows whichever is higher, memory use or compute utilisation.
    pub fn from_sample(sample: DeviceSample, high_pct: f64, critical_pct: f64, sampled_at_ms: i64) -> Self {
        let used_pct = sample.used_pct();
        let load_pct = sample
            .utilization_pct
            .map_or(used_pct, |util| used_pct.max(f64::from(util)));
        Self {
            total_mb: sample.total_mb,
            used_mb: sample.used_mb,
            free_mb: sample.free_mb(),
            used_pct,
            pressure: PressureLevel::classify(load_pct, high_pct, critical_pct),
            temperature_c: sample.temperature_c,
            utilization_pct: sample.utilization_pct,
            sampled_at_ms,
            stale: false,
        }
    }

    /// Copy of this snapshot marked stale, with pressure forced to `Critical`.
    pub fn into_stale(self) -> Self {
        Self {
            pressure: PressureLevel::Critical,
            stale: true,
            ..self
        }
    }
}

/// Errors reported by a resource probe.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProbeError {
    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("probe failed: {0}")]
    Failed(String),
}

/// Reads the accelerator's memory state. Called from the monitor task only.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<DeviceSample, ProbeError>;
}
