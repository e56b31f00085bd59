//! Model unit descriptors, lifecycle states and the loader contract.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::stage::StageId;

/// Static description of a loadable model unit. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUnitDescriptor {
    /// Unique unit name.
    pub id: String,
    /// Stage this unit serves.
    pub specialization: StageId,
    /// Estimated device memory footprint in MB.
    pub footprint_mb: u64,
    /// Higher values are kept resident longer when evicting.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Units that must be resident before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Opaque loader parameters (path, quantization, sampling settings, ...).
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

fn default_priority() -> u32 {
    5
}

impl ModelUnitDescriptor {
    pub fn new(id: impl Into<String>, specialization: StageId, footprint_mb: u64) -> Self {
        Self {
            id: id.into(),
            specialization,
            footprint_mb,
            priority: default_priority(),
            dependencies: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, unit_id: impl Into<String>) -> Self {
        self.dependencies.push(unit_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Lifecycle state of a model unit. Only the scheduler drives transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Unloaded,
    Loading,
    Resident,
    Unloading,
    Failed,
}

impl UnitState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Failed, Loading)
                | (Loading, Resident)
                | (Loading, Failed)
                | (Resident, Unloading)
                | (Unloading, Unloaded)
                | (Unloading, Failed)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Unloaded => "unloaded",
            UnitState::Loading => "loading",
            UnitState::Resident => "resident",
            UnitState::Unloading => "unloading",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors reported by a [`ModelLoader`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadError {
    #[error("failed to load unit {unit}: {message}")]
    Load { unit: String, message: String },

    #[error("failed to unload unit {unit}: {message}")]
    Unload { unit: String, message: String },
}

/// External collaborator that moves model weights on and off the device.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError>;

    async fn unload(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError>;
}
