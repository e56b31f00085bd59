//! Drives one request through the cascade.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use verity_kernel::envelope::{ProgressEvent, ReasonCode};
use verity_kernel::error::SchedulerError;
use verity_kernel::request::{PipelineRequest, RequestStatus, StageDisposition, StageRecord};
use verity_kernel::stage::{StageError, StageId, StageInput, StageOutput};

use super::OrchestratorInner;
use crate::cache::normalize;
use crate::circuit_breaker::{Admission, State};

/// Where a request goes after a pass through the workers.
pub(super) enum Outcome {
    Finished {
        request: PipelineRequest,
        status: RequestStatus,
        reason: ReasonCode,
        detail: Option<String>,
    },
    Requeue {
        request: PipelineRequest,
        detail: String,
    },
}

/// Result of one stage.
enum Step {
    Record(StageRecord),
    Fail { reason: ReasonCode, detail: String },
    Requeue(String),
}

/// Runs stages from the request's current index until it terminates or
/// must wait for memory.
pub(super) async fn run(
    inner: &Arc<OrchestratorInner>,
    mut request: PipelineRequest,
    token: CancellationToken,
) -> Outcome {
    let finished = |request, status, reason, detail| Outcome::Finished {
        request,
        status,
        reason,
        detail,
    };

    if let Err(e) = request.transition(RequestStatus::Running) {
        warn!(error = %e, "dequeued a terminal request");
        let detail = Some(e.to_string());
        return finished(request, RequestStatus::Failed, ReasonCode::StageFailed, detail);
    }

    let normalized = normalize(request.payload());
    while let Some(stage) = request.current_stage() {
        if token.is_cancelled() {
            let reason = inner.cancel_reason();
            return finished(request, RequestStatus::Failed, reason, Some(format!("cancelled before {stage}")));
        }

        match run_stage(inner, &request, stage, &normalized, &token).await {
            Step::Record(record) => {
                inner
                    .delivery
                    .publish(ProgressEvent::from_record(request.id(), &record));
                let block_reason = record.output.block_reason.clone();
                if let Err(e) = request.record(record) {
                    let detail = Some(e.to_string());
                    return finished(request, RequestStatus::Failed, ReasonCode::StageFailed, detail);
                }
                if let Some(why) = block_reason {
                    info!(%stage, reason = %why, "request blocked");
                    return finished(request, RequestStatus::Blocked, ReasonCode::UnsafeContent, Some(why));
                }
            }
            Step::Fail { reason, detail } => {
                return finished(request, RequestStatus::Failed, reason, Some(detail));
            }
            Step::Requeue(detail) => return Outcome::Requeue { request, detail },
        }
    }

    finished(request, RequestStatus::Completed, ReasonCode::Completed, None)
}

async fn run_stage(
    inner: &Arc<OrchestratorInner>,
    request: &PipelineRequest,
    stage: StageId,
    normalized: &str,
    token: &CancellationToken,
) -> Step {
    let started = Instant::now();
    let elapsed_ms = || started.elapsed().as_millis() as u64;

    let (target, admission) = match admit(inner, stage) {
        Ok(admitted) => admitted,
        Err(reason) => return reject(inner, stage, reason, elapsed_ms()),
    };
    let substituted = target != stage;
    let abandon = || {
        if admission == Admission::Probe {
            inner.breakers.abandon_probe(target);
        }
    };

    let hit = if substituted {
        None
    } else {
        inner.cache.lookup(stage, normalized)
    };
    if let Some(hit) = hit {
        abandon();
        debug!(%stage, exact = hit.exact, similarity = hit.similarity, "stage served from cache");
        return Step::Record(StageRecord {
            stage,
            output: hit.output().clone(),
            disposition: StageDisposition::CacheHit {
                exact: hit.exact,
                similarity: hit.similarity,
            },
            latency_ms: elapsed_ms(),
        });
    }

    let unit_id = inner
        .scheduler
        .registry()
        .primary_for(target)
        .map(|unit| unit.id.clone());
    let (Some(unit_id), Some(executor)) = (unit_id, inner.executors.get(target).cloned()) else {
        abandon();
        return Step::Fail {
            reason: ReasonCode::StageUnavailable,
            detail: format!("no model unit or executor for {target}"),
        };
    };

    let handle = tokio::select! {
        biased;
        _ = token.cancelled() => {
            abandon();
            return cancelled(inner, stage);
        }
        result = inner.scheduler.ensure_resident(&unit_id) => match result {
            Ok(handle) => handle,
            Err(e @ SchedulerError::ResourceExhausted { .. }) => {
                abandon();
                // Refresh the snapshot the scheduler bounds loads with.
                if let Some(monitor) = &inner.monitor {
                    monitor.sample();
                }
                return Step::Requeue(e.to_string());
            }
            // The scheduler records load failures to the breaker. The probe
            // slot can still be held when a dependency's load task died.
            Err(e @ SchedulerError::ModelLoad { .. }) => {
                abandon();
                return failure(stage, ReasonCode::ModelLoadFailed, e.to_string(), elapsed_ms());
            }
            Err(SchedulerError::Shutdown) => {
                abandon();
                return Step::Fail {
                    reason: ReasonCode::Shutdown,
                    detail: "scheduler shut down".into(),
                };
            }
            Err(e) => {
                abandon();
                return Step::Fail {
                    reason: ReasonCode::StageUnavailable,
                    detail: e.to_string(),
                };
            }
        }
    };

    let input = StageInput {
        request_id: request.id(),
        stage: target,
        payload: request.payload().to_string(),
        normalized: normalized.to_string(),
        previous: request.outputs().to_vec(),
    };
    let timeout = inner.config.stage_timeout(target);
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => {
            abandon();
            return cancelled(inner, stage);
        }
        result = tokio::time::timeout(timeout, executor.execute(&handle, input, token.child_token())) => result,
    };
    drop(handle);

    match result {
        Ok(Ok(output)) => {
            inner.breakers.record_success(target);
            if !substituted && !output.is_blocking() {
                inner.cache.store(stage, normalized, output.clone());
            }
            let disposition = if substituted {
                StageDisposition::Substituted { by: target }
            } else {
                StageDisposition::Executed
            };
            Step::Record(StageRecord {
                stage,
                output,
                disposition,
                latency_ms: elapsed_ms(),
            })
        }
        Ok(Err(StageError::Cancelled)) if token.is_cancelled() => {
            abandon();
            cancelled(inner, stage)
        }
        Ok(Err(e)) => {
            inner.breakers.record_failure(target);
            failure(stage, ReasonCode::StageFailed, e.to_string(), elapsed_ms())
        }
        Err(_) => {
            inner.breakers.record_failure(target);
            let detail = StageError::Timeout(timeout).to_string();
            failure(stage, ReasonCode::StageTimeout, detail, elapsed_ms())
        }
    }
}

/// Admission for `stage`, falling back to its configured substitute when
/// the stage's own circuit rejects. On rejection returns the circuit state
/// that caused it.
fn admit(inner: &OrchestratorInner, stage: StageId) -> Result<(StageId, Admission), State> {
    let admission = inner.breakers.try_admit(stage);
    if admission.is_admitted() {
        return Ok((stage, admission));
    }
    if let Some(&fallback) = inner.config.fallbacks.get(&stage) {
        let substitute = inner.breakers.try_admit(fallback);
        if substitute.is_admitted() {
            info!(%stage, %fallback, "circuit open, substituting stage");
            return Ok((fallback, substitute));
        }
    }
    Err(inner.breakers.state(stage))
}

fn reject(inner: &OrchestratorInner, stage: StageId, state: State, latency_ms: u64) -> Step {
    if inner.config.degrade_on_open_circuit && !stage.is_critical() {
        return degraded(stage, format!("circuit {state}"), latency_ms);
    }
    // A half-open circuit is busy with its probe; an open one is cooling down.
    let reason = match state {
        State::HalfOpen => ReasonCode::CircuitOpen,
        _ => ReasonCode::StageUnavailable,
    };
    debug!(%stage, %state, "stage rejected by circuit breaker");
    Step::Fail {
        reason,
        detail: format!("stage {stage} unavailable: circuit {state}"),
    }
}

/// Critical stages fail the request; the rest continue degraded.
fn failure(stage: StageId, reason: ReasonCode, detail: String, latency_ms: u64) -> Step {
    if stage.is_critical() {
        warn!(%stage, %reason, %detail, "critical stage failed");
        return Step::Fail {
            reason,
            detail: format!("{stage}: {detail}"),
        };
    }
    warn!(%stage, %reason, %detail, "stage failed, continuing degraded");
    degraded(stage, detail, latency_ms)
}

fn degraded(stage: StageId, reason: String, latency_ms: u64) -> Step {
    Step::Record(StageRecord {
        stage,
        output: StageOutput::degraded(stage, &reason),
        disposition: StageDisposition::Degraded { reason },
        latency_ms,
    })
}

fn cancelled(inner: &OrchestratorInner, stage: StageId) -> Step {
    Step::Fail {
        reason: inner.cancel_reason(),
        detail: format!("cancelled during {stage}"),
    }
}
