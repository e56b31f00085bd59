//! Pipeline requests and their per-stage records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::{StageId, StageOutput};

/// Request priority. Higher priorities are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Lifecycle status of a pipeline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Running,
    Blocked,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Blocked | RequestStatus::Completed | RequestStatus::Failed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Blocked => "blocked",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a stage's output was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDisposition {
    /// The stage's model unit ran.
    Executed,
    /// Served from the semantic cache.
    CacheHit { exact: bool, similarity: f32 },
    /// Another stage's unit and executor ran in its place.
    Substituted { by: StageId },
    /// Non-critical stage failed or was skipped; output is a placeholder.
    Degraded { reason: String },
}

/// Recorded output of one stage. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub output: StageOutput,
    pub disposition: StageDisposition,
    pub latency_ms: u64,
}

impl StageRecord {
    pub fn is_degraded(&self) -> bool {
        matches!(self.disposition, StageDisposition::Degraded { .. })
    }
}

/// Errors raised by illegal request mutations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    #[error("request {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: RequestStatus },

    #[error("stage {got} recorded out of order, expected {expected:?}")]
    OutOfOrder {
        got: StageId,
        expected: Option<StageId>,
    },
}

/// A verification request owned by the orchestrator for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    id: Uuid,
    payload: String,
    arrived_at: DateTime<Utc>,
    priority: Priority,
    stage_index: usize,
    outputs: Vec<StageRecord>,
    status: RequestStatus,
    /// Number of times the request was requeued after resource exhaustion.
    requeues: u32,
}

impl PipelineRequest {
    pub fn new(payload: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload: payload.into(),
            arrived_at: Utc::now(),
            priority,
            stage_index: 0,
            outputs: Vec::new(),
            status: RequestStatus::Pending,
            requeues: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn requeues(&self) -> u32 {
        self.requeues
    }

    /// The next stage to run, or `None` once every stage has a record.
    pub fn current_stage(&self) -> Option<StageId> {
        StageId::from_index(self.stage_index)
    }

    pub fn outputs(&self) -> &[StageRecord] {
        &self.outputs
    }

    pub fn output_of(&self, stage: StageId) -> Option<&StageRecord> {
        self.outputs.iter().find(|r| r.stage == stage)
    }

    /// Name of the last stage that produced a non-degraded record.
    pub fn last_completed_stage(&self) -> Option<StageId> {
        self.outputs
            .iter()
            .rev()
            .find(|r| !r.is_degraded())
            .map(|r| r.stage)
    }

    pub fn degraded_stages(&self) -> Vec<StageId> {
        self.outputs
            .iter()
            .filter(|r| r.is_degraded())
            .map(|r| r.stage)
            .collect()
    }

    /// Appends the record for the current stage and advances the stage index.
    pub fn record(&mut self, record: StageRecord) -> Result<(), RequestError> {
        self.ensure_live()?;
        let expected = self.current_stage();
        if expected != Some(record.stage) {
            return Err(RequestError::OutOfOrder {
                got: record.stage,
                expected,
            });
        }
        self.outputs.push(record);
        self.stage_index += 1;
        Ok(())
    }

    /// Moves the request to a new status. Terminal statuses are final.
    pub fn transition(&mut self, next: RequestStatus) -> Result<(), RequestError> {
        self.ensure_live()?;
        self.status = next;
        Ok(())
    }

    /// Returns a running request to `Pending` for another pass through the queue.
    pub fn mark_requeued(&mut self) -> Result<(), RequestError> {
        self.transition(RequestStatus::Pending)?;
        self.requeues += 1;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), RequestError> {
        if self.status.is_terminal() {
            return Err(RequestError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }
}
