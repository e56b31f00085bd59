//! Simulated model loader and stage executor.
//!
//! Stand-ins for the real inference backend so the cascade can be driven
//! end to end from a terminal. Loads take time proportional to the unit's
//! footprint; each stage answers with a small heuristic JSON payload.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use verity_kernel::model::{LoadError, ModelLoader, ModelUnitDescriptor};
use verity_kernel::stage::{ResidentUnit, StageError, StageExecutor, StageId, StageInput, StageOutput};

/// Link fragments the simulated safety model refuses.
const BLOCKED_HOSTS: [&str; 4] = ["bit.ly", "golpe.com", "premio", "tinyurl.com"];

/// Model set used when the configuration declares none.
pub fn demo_models() -> Vec<ModelUnitDescriptor> {
    vec![
        ModelUnitDescriptor::new("intake-tiny", StageId::Intake, 512).with_priority(8),
        ModelUnitDescriptor::new("classify-small", StageId::Classify, 1_536).with_priority(5),
        ModelUnitDescriptor::new("safety-guard", StageId::Safety, 2_048).with_priority(9),
        ModelUnitDescriptor::new("decompose-8b", StageId::Decompose, 6_144).with_priority(4),
        // Lowest priority: only kept around while the investigator needs it.
        ModelUnitDescriptor::new("retrieval-embedder", StageId::Investigate, 768).with_priority(0),
        ModelUnitDescriptor::new("investigate-8b", StageId::Investigate, 6_144)
            .with_priority(6)
            .with_dependency("retrieval-embedder")
            .with_parameter("max_sources", json!(5)),
        ModelUnitDescriptor::new("synthesize-8b", StageId::Synthesize, 6_144).with_priority(3),
        ModelUnitDescriptor::new("present-small", StageId::Present, 1_536).with_priority(2),
    ]
}

#[derive(Debug, Clone)]
pub struct SimulatedLoader {
    /// Load time per GiB of footprint.
    per_gib: Duration,
}

impl SimulatedLoader {
    pub fn new(per_gib: Duration) -> Self {
        Self { per_gib }
    }
}

impl Default for SimulatedLoader {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

#[async_trait]
impl ModelLoader for SimulatedLoader {
    async fn load(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
        let delay = self.per_gib.mul_f64(unit.footprint_mb as f64 / 1024.0);
        tokio::time::sleep(delay).await;
        debug!(unit = %unit.id, delay_ms = delay.as_millis() as u64, "simulated load");
        Ok(())
    }

    async fn unload(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
        debug!(unit = %unit.id, "simulated unload");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    latency: Duration,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(25))
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        unit: &dyn ResidentUnit,
        input: StageInput,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }

        let claim = input.normalized.as_str();
        if claim.is_empty() {
            return Err(StageError::InvalidInput("empty claim".into()));
        }
        let unit_id = unit.descriptor().id.as_str();
        let output = match input.stage {
            StageId::Intake => StageOutput::new(json!({
                "urls": urls(&input.payload),
                "words": claim.split(' ').count(),
            })),
            StageId::Classify => StageOutput::new(json!({ "topic": topic(claim) })),
            StageId::Safety => {
                let lowered = input.payload.to_lowercase();
                match BLOCKED_HOSTS.iter().find(|h| lowered.contains(*h)) {
                    Some(host) => StageOutput::blocked(
                        format!("link to known scam host {host}"),
                        json!({ "verdict": "unsafe" }),
                    ),
                    None => StageOutput::new(json!({ "verdict": "safe" })),
                }
            }
            StageId::Decompose => StageOutput::new(json!({ "subclaims": subclaims(claim) })),
            StageId::Investigate => {
                let max = unit
                    .descriptor()
                    .parameters
                    .get("max_sources")
                    .and_then(Value::as_u64)
                    .unwrap_or(3);
                let sources: Vec<String> = (1..=max.min(3))
                    .map(|i| format!("https://sources.example/{}/{i}", topic(claim)))
                    .collect();
                StageOutput::new(json!({ "sources": sources }))
            }
            StageId::Synthesize => {
                let sources = input
                    .output_of(StageId::Investigate)
                    .and_then(|o| o.payload.get("sources"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                let verdict = if sources == 0 { "unverified" } else { "needs_context" };
                StageOutput::new(json!({
                    "verdict": verdict,
                    "confidence": (sources as f64 * 0.2).min(0.9),
                }))
            }
            StageId::Present => {
                let verdict = input
                    .output_of(StageId::Synthesize)
                    .and_then(|o| o.payload.get("verdict"))
                    .and_then(Value::as_str)
                    .unwrap_or("unverified")
                    .to_string();
                StageOutput::new(json!({ "summary": format!("Claim \"{claim}\": {verdict}") }))
            }
        };
        debug!(stage = %input.stage, unit = unit_id, "simulated stage done");
        Ok(output)
    }
}

fn urls(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
        .collect()
}

fn topic(claim: &str) -> &'static str {
    const TOPICS: [(&str, &[&str]); 3] = [
        ("health", &["vaccine", "vaccines", "cure", "cures", "virus", "cancer"]),
        ("politics", &["election", "president", "vote", "government"]),
        ("science", &["climate", "moon", "earth", "space"]),
    ];
    TOPICS
        .iter()
        .find(|(_, words)| claim.split(' ').any(|w| words.contains(&w)))
        .map_or("general", |(topic, _)| *topic)
}

fn subclaims(claim: &str) -> Vec<&str> {
    claim
        .split(" and ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
