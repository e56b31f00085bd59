//! Scripted collaborators for the integration tests.
//!
//! [`ScriptedExecutor`] runs every stage with a per-stage [`Behavior`]
//! (succeed by default) and counts calls. Its safety stage blocks payloads
//! that mention a known malicious host, like a real safety model would.
//! [`CountingLoader`] records loads and unloads and can be told to fail.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use verity_kernel::model::{LoadError, ModelLoader, ModelUnitDescriptor};
use verity_kernel::stage::{ResidentUnit, StageError, StageExecutor, StageId, StageInput, StageOutput};

/// Hosts the safety stage treats as malicious.
pub const MALICIOUS_HOSTS: [&str; 3] = ["bit.ly", "golpe.com", "premio-gratis.net"];

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Sleep before succeeding; wakes early and reports `Cancelled` when the
    /// request is cancelled.
    Sleep(Duration),
}

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    behaviors: Mutex<BTreeMap<StageId, Behavior>>,
    calls: Mutex<BTreeMap<StageId, usize>>,
    units: Mutex<Vec<(StageId, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, stage: StageId, behavior: Behavior) -> Self {
        self.set(stage, behavior);
        self
    }

    pub fn set(&self, stage: StageId, behavior: Behavior) {
        self.behaviors.lock().insert(stage, behavior);
    }

    pub fn calls(&self, stage: StageId) -> usize {
        self.calls.lock().get(&stage).copied().unwrap_or(0)
    }

    /// `(stage asked for, unit that ran it)` in call order.
    pub fn units(&self) -> Vec<(StageId, String)> {
        self.units.lock().clone()
    }

    fn output(unit: &dyn ResidentUnit, input: &StageInput) -> StageOutput {
        StageOutput::new(json!({
            "stage": input.stage.as_str(),
            "unit": unit.descriptor().id,
            "claim": input.normalized,
            "seen": input.previous.len(),
        }))
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        unit: &dyn ResidentUnit,
        input: StageInput,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        *self.calls.lock().entry(input.stage).or_default() += 1;
        self.units
            .lock()
            .push((input.stage, unit.descriptor().id.clone()));

        if input.stage == StageId::Safety {
            let payload = input.payload.to_lowercase();
            if let Some(host) = MALICIOUS_HOSTS.iter().find(|h| payload.contains(*h)) {
                return Ok(StageOutput::blocked(
                    format!("malicious URL ({host})"),
                    json!({ "verdict": "unsafe", "host": host }),
                ));
            }
        }

        let behavior = self
            .behaviors
            .lock()
            .get(&input.stage)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(Self::output(unit, &input)),
            Behavior::Fail(message) => Err(StageError::Execution(message)),
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(StageError::Cancelled),
                    _ = tokio::time::sleep(duration) => Ok(Self::output(unit, &input)),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CountingLoader {
    loads: Mutex<BTreeMap<String, usize>>,
    unloads: Mutex<BTreeMap<String, usize>>,
    failing: Mutex<BTreeSet<String>>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, unit_id: &str) {
        self.failing.lock().insert(unit_id.to_string());
    }

    pub fn loads(&self, unit_id: &str) -> usize {
        self.loads.lock().get(unit_id).copied().unwrap_or(0)
    }

    pub fn unloads(&self, unit_id: &str) -> usize {
        self.unloads.lock().get(unit_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ModelLoader for CountingLoader {
    async fn load(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
        if self.failing.lock().contains(&unit.id) {
            return Err(LoadError::Load {
                unit: unit.id.clone(),
                message: "weights missing".into(),
            });
        }
        *self.loads.lock().entry(unit.id.clone()).or_default() += 1;
        Ok(())
    }

    async fn unload(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
        *self.unloads.lock().entry(unit.id.clone()).or_default() += 1;
        Ok(())
    }
}
