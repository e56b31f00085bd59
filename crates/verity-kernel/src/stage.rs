//! Stage contract for the verification cascade.
//!
//! A stage is one specialised step of the cascade. The set of stages is
//! closed: [`StageId`] enumerates all of them in execution order, and each
//! stage is served by exactly one [`StageExecutor`] selected by that id.
//!
//! ```text
//! intake → classify → safety → decompose → investigate → synthesize → present
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::ModelUnitDescriptor;
use crate::request::StageRecord;

/// Identifier of a pipeline stage (and of the model specialisation backing it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Intake,
    Classify,
    Safety,
    Decompose,
    Investigate,
    Synthesize,
    Present,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [StageId; 7] = [
        StageId::Intake,
        StageId::Classify,
        StageId::Safety,
        StageId::Decompose,
        StageId::Investigate,
        StageId::Synthesize,
        StageId::Present,
    ];

    /// Position of this stage in the cascade (0-based).
    pub fn index(self) -> usize {
        match self {
            StageId::Intake => 0,
            StageId::Classify => 1,
            StageId::Safety => 2,
            StageId::Decompose => 3,
            StageId::Investigate => 4,
            StageId::Synthesize => 5,
            StageId::Present => 6,
        }
    }

    /// Stage at the given cascade position.
    pub fn from_index(index: usize) -> Option<StageId> {
        Self::ALL.get(index).copied()
    }

    /// Critical stages fail the whole request when they fail.
    pub fn is_critical(self) -> bool {
        matches!(self, StageId::Intake | StageId::Safety)
    }

    /// Default execution timeout, short for gatekeeping stages and long for
    /// evidence gathering and reasoning.
    pub fn default_timeout(self) -> Duration {
        match self {
            StageId::Intake | StageId::Safety => Duration::from_secs(10),
            StageId::Classify | StageId::Present => Duration::from_secs(30),
            StageId::Decompose => Duration::from_secs(60),
            StageId::Synthesize => Duration::from_secs(120),
            StageId::Investigate => Duration::from_secs(180),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Intake => "intake",
            StageId::Classify => "classify",
            StageId::Safety => "safety",
            StageId::Decompose => "decompose",
            StageId::Investigate => "investigate",
            StageId::Synthesize => "synthesize",
            StageId::Present => "present",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intake" => Ok(StageId::Intake),
            "classify" => Ok(StageId::Classify),
            "safety" => Ok(StageId::Safety),
            "decompose" => Ok(StageId::Decompose),
            "investigate" => Ok(StageId::Investigate),
            "synthesize" => Ok(StageId::Synthesize),
            "present" => Ok(StageId::Present),
            other => Err(StageError::InvalidInput(format!("unknown stage: {other}"))),
        }
    }
}

/// Input handed to a stage executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub request_id: Uuid,
    pub stage: StageId,
    /// Raw request payload (text or a media reference).
    pub payload: String,
    /// Normalised form of the payload, also used as the cache key.
    pub normalized: String,
    /// Outputs recorded by earlier stages, in cascade order.
    pub previous: Vec<StageRecord>,
}

impl StageInput {
    /// Output of an earlier stage, if it was recorded.
    pub fn output_of(&self, stage: StageId) -> Option<&StageOutput> {
        self.previous
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }
}

/// Output produced by a stage executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: serde_json::Value,
    /// Set by the safety stage to stop the cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl StageOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            block_reason: None,
        }
    }

    /// An output that blocks the request.
    pub fn blocked(reason: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            payload,
            block_reason: Some(reason.into()),
        }
    }

    /// Placeholder used when a non-critical stage could not produce output.
    pub fn degraded(stage: StageId, reason: &str) -> Self {
        Self::new(serde_json::json!({
            "degraded": true,
            "stage": stage.as_str(),
            "reason": reason,
        }))
    }

    pub fn is_blocking(&self) -> bool {
        self.block_reason.is_some()
    }
}

/// Stage execution errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StageError {
    /// The executor reported a failure.
    #[error("stage execution failed: {0}")]
    Execution(String),

    /// The call exceeded its per-stage timeout.
    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled by the caller.
    #[error("stage call cancelled")]
    Cancelled,

    /// The input could not be processed by this stage.
    #[error("invalid stage input: {0}")]
    InvalidInput(String),
}

/// View of a resident model unit handed to executors.
pub trait ResidentUnit: Send + Sync {
    fn descriptor(&self) -> &ModelUnitDescriptor;
}

/// External collaborator that runs the actual inference/search/reasoning of a stage.
///
/// Implementations must be safely callable concurrently across distinct units.
/// `cancel` fires when the owning request is cancelled; honouring it is best-effort.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        unit: &dyn ResidentUnit,
        input: StageInput,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError>;
}
