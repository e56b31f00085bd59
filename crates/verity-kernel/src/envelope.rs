//! Terminal envelopes and progress events published for each request.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::{PipelineRequest, RequestStatus, StageDisposition, StageRecord};
use crate::stage::StageId;

/// Machine-readable reason attached to every final envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ReasonCode {
    Completed,
    UnsafeContent,
    StageUnavailable,
    CircuitOpen,
    StageFailed,
    StageTimeout,
    ModelLoadFailed,
    ResourceExhausted,
    Cancelled,
    QueueFull,
    Shutdown,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Completed => "completed",
            ReasonCode::UnsafeContent => "unsafe_content",
            ReasonCode::StageUnavailable => "stage_unavailable",
            ReasonCode::CircuitOpen => "circuit_open",
            ReasonCode::StageFailed => "stage_failed",
            ReasonCode::StageTimeout => "stage_timeout",
            ReasonCode::ModelLoadFailed => "model_load_failed",
            ReasonCode::ResourceExhausted => "resource_exhausted",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::QueueFull => "queue_full",
            ReasonCode::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one of these is delivered per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEnvelope {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub reason: ReasonCode,
    /// Human readable detail (block reason, failing stage error, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Stage at which a failed or blocked request stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_stage: Option<StageId>,
    /// True when at least one non-critical stage was degraded.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_stages: Vec<StageId>,
    pub outputs: Vec<StageRecord>,
    pub finished_at: DateTime<Utc>,
}

impl FinalEnvelope {
    /// Builds the envelope from the request's current records.
    pub fn from_request(
        request: &PipelineRequest,
        status: RequestStatus,
        reason: ReasonCode,
        detail: Option<String>,
    ) -> Self {
        let degraded_stages = request.degraded_stages();
        let failed_stage = match status {
            // The blocking stage has already recorded its output.
            RequestStatus::Blocked => request.outputs().last().map(|r| r.stage),
            RequestStatus::Failed => request.current_stage(),
            _ => None,
        };

        Self {
            request_id: request.id(),
            status,
            reason,
            detail,
            failed_stage,
            last_completed_stage: request.last_completed_stage(),
            degraded: !degraded_stages.is_empty(),
            degraded_stages,
            outputs: request.outputs().to_vec(),
            finished_at: Utc::now(),
        }
    }

    /// Envelope for a request refused before it ever entered the pipeline.
    pub fn rejected(request: &PipelineRequest, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self::from_request(request, RequestStatus::Failed, reason, Some(detail.into()))
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Completed
    }
}

/// Best-effort progress notification emitted after each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub stage: StageId,
    pub disposition: StageDisposition,
    pub latency_ms: u64,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_record(request_id: Uuid, record: &StageRecord) -> Self {
        Self {
            request_id,
            stage: record.stage,
            disposition: record.disposition.clone(),
            latency_ms: record.latency_ms,
            emitted_at: Utc::now(),
        }
    }
}
