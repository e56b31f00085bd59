//! End-to-end tests for the verification cascade.
//!
//! Every test assembles a real [`Orchestrator`] through
//! [`Orchestrator::from_config`] with scripted collaborators from
//! [`common::scripted`], submits claims and inspects the final envelopes the
//! delivery sink receives.
//!
//! # Running
//!
//! ```bash
//! cargo test -p verity-foundation --test cascade_e2e
//!
//! # With pipeline logs
//! RUST_LOG=verity_foundation=debug cargo test -p verity-foundation --test cascade_e2e -- --nocapture
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::scripted::{Behavior, ScriptedExecutor};
use common::{Harness, cascade_config, unit_id};
use verity_foundation::State;
use verity_kernel::envelope::ReasonCode;
use verity_kernel::error::QueueError;
use verity_kernel::request::{Priority, RequestStatus, StageDisposition};
use verity_kernel::stage::StageId;

fn stages(envelope: &verity_kernel::envelope::FinalEnvelope) -> Vec<StageId> {
    envelope.outputs.iter().map(|r| r.stage).collect()
}

async fn wait_for_call(executor: &ScriptedExecutor, stage: StageId) {
    while executor.calls(stage) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// § 1  Happy path
// ─────────────────────────────────────────────────────────────────────────────

/// A clean claim runs all seven stages in order and publishes one progress
/// event per stage.
#[tokio::test]
async fn clean_claim_completes_every_stage() {
    let mut h = Harness::start(cascade_config(2), Arc::new(ScriptedExecutor::new()));

    let envelope = h.verify("The moon landing happened in 1969").await;

    assert_eq!(envelope.status, RequestStatus::Completed);
    assert_eq!(envelope.reason, ReasonCode::Completed);
    assert!(!envelope.degraded);
    assert_eq!(stages(&envelope), StageId::ALL.to_vec());
    assert_eq!(envelope.last_completed_stage, Some(StageId::Present));

    let progress: Vec<StageId> = h
        .progress_for(envelope.request_id)
        .iter()
        .map(|p| p.stage)
        .collect();
    assert_eq!(progress, StageId::ALL.to_vec());

    let stats = h.orchestrator.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.in_flight, 0);
    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// § 2  Safety
// ─────────────────────────────────────────────────────────────────────────────

/// A claim carrying a malicious link is blocked at the safety stage; no
/// evidence is ever gathered for it.
#[tokio::test]
async fn malicious_link_is_blocked_before_investigation() {
    let mut h = Harness::start(cascade_config(2), Arc::new(ScriptedExecutor::new()));

    let envelope = h
        .verify("Ganhe um premio! Clique em https://bit.ly/premio-agora")
        .await;

    assert_eq!(envelope.status, RequestStatus::Blocked);
    assert_eq!(envelope.reason, ReasonCode::UnsafeContent);
    assert_eq!(envelope.failed_stage, Some(StageId::Safety));
    assert_eq!(
        stages(&envelope),
        vec![StageId::Intake, StageId::Classify, StageId::Safety]
    );
    assert!(envelope.detail.as_deref().unwrap_or_default().contains("bit.ly"));
    for stage in [StageId::Decompose, StageId::Investigate, StageId::Synthesize] {
        assert_eq!(h.executor.calls(stage), 0, "{stage} must not run");
    }
    assert_eq!(h.orchestrator.stats().blocked, 1);
    h.orchestrator.shutdown().await;
}

/// A failing critical stage fails the whole request.
#[tokio::test]
async fn critical_stage_failure_fails_the_request() {
    let executor = ScriptedExecutor::new().with(StageId::Safety, Behavior::Fail("model crashed".into()));
    let mut h = Harness::start(cascade_config(1), Arc::new(executor));

    let envelope = h.verify("Drinking bleach cures flu").await;

    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::StageFailed);
    assert_eq!(envelope.failed_stage, Some(StageId::Safety));
    assert_eq!(envelope.last_completed_stage, Some(StageId::Classify));
    assert_eq!(h.executor.calls(StageId::Decompose), 0);
    assert_eq!(
        h.orchestrator.breakers().breaker(StageId::Safety).consecutive_failures(),
        1
    );
    h.orchestrator.shutdown().await;
}

/// A unit that cannot be loaded fails its critical stage with
/// `ModelLoadFailed` and counts against the stage's circuit.
#[tokio::test]
async fn model_load_failure_on_critical_stage() {
    let h = Harness::build(cascade_config(1), Arc::new(ScriptedExecutor::new()));
    h.loader.fail(&unit_id(StageId::Intake));
    h.orchestrator.start();
    let mut h = h;

    let envelope = h.verify("Any claim at all").await;

    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::ModelLoadFailed);
    assert_eq!(envelope.failed_stage, Some(StageId::Intake));
    assert!(envelope.outputs.is_empty());
    assert_eq!(h.executor.calls(StageId::Intake), 0);
    assert_eq!(
        h.orchestrator.breakers().breaker(StageId::Intake).consecutive_failures(),
        1
    );
    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// § 3  Degradation and circuit breaking
// ─────────────────────────────────────────────────────────────────────────────

/// Non-critical failures leave a placeholder and the cascade carries on.
#[tokio::test]
async fn non_critical_failure_degrades() {
    let executor =
        ScriptedExecutor::new().with(StageId::Synthesize, Behavior::Fail("context overflow".into()));
    let mut h = Harness::start(cascade_config(1), Arc::new(executor));

    let envelope = h.verify("Coffee stunts your growth").await;

    assert_eq!(envelope.status, RequestStatus::Completed);
    assert!(envelope.degraded);
    assert_eq!(envelope.degraded_stages, vec![StageId::Synthesize]);
    assert_eq!(stages(&envelope), StageId::ALL.to_vec());
    let record = &envelope.outputs[StageId::Synthesize.index()];
    assert!(matches!(record.disposition, StageDisposition::Degraded { .. }));
    assert_eq!(record.output.payload["degraded"], true);
    h.orchestrator.shutdown().await;
}

/// Five investigation timeouts open the circuit; the next claim fails with
/// `StageUnavailable` without the investigation unit being called again.
#[tokio::test(start_paused = true)]
async fn repeated_timeouts_open_the_circuit() {
    let mut config = cascade_config(1);
    config.pipeline.stage_timeouts_ms.insert(StageId::Investigate, 200);
    let executor = ScriptedExecutor::new().with(StageId::Investigate, Behavior::Sleep(Duration::from_secs(10)));
    let mut h = Harness::start(config, Arc::new(executor));

    let claims = [
        "Sharks never get cancer",
        "Lightning never strikes twice",
        "Goldfish remember three seconds",
        "Bulls hate the colour red",
        "Great Wall visible from orbit",
    ];
    for claim in claims {
        let envelope = h.verify(claim).await;
        assert_eq!(envelope.status, RequestStatus::Completed);
        assert_eq!(envelope.degraded_stages, vec![StageId::Investigate]);
    }
    assert_eq!(h.executor.calls(StageId::Investigate), 5);
    assert_eq!(h.orchestrator.breakers().state(StageId::Investigate), State::Open);

    let envelope = h.verify("Vaccines contain microchips").await;
    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::StageUnavailable);
    assert_eq!(envelope.failed_stage, Some(StageId::Investigate));
    assert_eq!(h.executor.calls(StageId::Investigate), 5);
    h.orchestrator.shutdown().await;
}

/// After the cooldown exactly one request probes the half-open circuit;
/// a concurrent one is turned away with `CircuitOpen`.
#[tokio::test(start_paused = true)]
async fn half_open_circuit_admits_a_single_probe() {
    let executor = ScriptedExecutor::new().with(StageId::Investigate, Behavior::Sleep(Duration::from_secs(1)));
    let mut h = Harness::start(cascade_config(2), Arc::new(executor));
    for _ in 0..5 {
        h.orchestrator.breakers().record_failure(StageId::Investigate);
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    h.orchestrator.submit("Eating carrots improves night vision", Priority::Normal).unwrap();
    h.orchestrator.submit("Humans only use ten percent of the brain", Priority::Normal).unwrap();
    let envelopes = h.envelopes(2).await;

    let rejected: Vec<_> = envelopes
        .iter()
        .filter(|e| e.reason == ReasonCode::CircuitOpen)
        .collect();
    let completed: Vec<_> = envelopes
        .iter()
        .filter(|e| e.status == RequestStatus::Completed)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(completed.len(), 1);
    assert!(!completed[0].degraded);
    assert_eq!(h.executor.calls(StageId::Investigate), 1);
    assert_eq!(h.orchestrator.breakers().state(StageId::Investigate), State::Closed);
    h.orchestrator.shutdown().await;
}

/// With a fallback configured, an open circuit reroutes the stage to the
/// substitute's unit and executor.
#[tokio::test]
async fn open_circuit_falls_back_to_substitute_stage() {
    let mut config = cascade_config(1);
    config.pipeline.fallbacks.insert(StageId::Investigate, StageId::Synthesize);
    let mut h = Harness::start(config, Arc::new(ScriptedExecutor::new()));
    for _ in 0..5 {
        h.orchestrator.breakers().record_failure(StageId::Investigate);
    }

    let envelope = h.verify("Cracking knuckles causes arthritis").await;

    assert_eq!(envelope.status, RequestStatus::Completed);
    assert!(!envelope.degraded);
    let record = &envelope.outputs[StageId::Investigate.index()];
    assert_eq!(
        record.disposition,
        StageDisposition::Substituted { by: StageId::Synthesize }
    );
    assert_eq!(record.output.payload["unit"], unit_id(StageId::Synthesize));
    assert_eq!(h.executor.calls(StageId::Investigate), 0);
    assert_eq!(h.executor.calls(StageId::Synthesize), 2);
    h.orchestrator.shutdown().await;
}

/// With `degrade_on_open_circuit`, a non-critical stage behind an open
/// circuit is skipped instead of failing the request.
#[tokio::test]
async fn open_circuit_degrades_when_configured() {
    let mut config = cascade_config(1);
    config.pipeline.degrade_on_open_circuit = true;
    let mut h = Harness::start(config, Arc::new(ScriptedExecutor::new()));
    for _ in 0..5 {
        h.orchestrator.breakers().record_failure(StageId::Synthesize);
    }

    let envelope = h.verify("Bats are blind").await;

    assert_eq!(envelope.status, RequestStatus::Completed);
    assert_eq!(envelope.degraded_stages, vec![StageId::Synthesize]);
    assert_eq!(h.executor.calls(StageId::Synthesize), 0);
    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// § 4  Semantic cache
// ─────────────────────────────────────────────────────────────────────────────

/// The same claim twice: cacheable stages are served from the cache the
/// second time, the rest run again.
#[tokio::test]
async fn repeated_claim_is_served_from_cache() {
    let mut h = Harness::start(cascade_config(1), Arc::new(ScriptedExecutor::new()));

    let first = h.verify("Vaccines cause autism!").await;
    let second = h.verify("vaccines cause AUTISM").await;

    assert_eq!(first.status, RequestStatus::Completed);
    assert_eq!(second.status, RequestStatus::Completed);
    assert_eq!(h.executor.calls(StageId::Decompose), 1);
    assert_eq!(h.executor.calls(StageId::Investigate), 1);
    assert_eq!(h.executor.calls(StageId::Intake), 2);
    assert_eq!(h.executor.calls(StageId::Safety), 2);

    let decompose = &second.outputs[StageId::Decompose.index()];
    assert!(matches!(
        decompose.disposition,
        StageDisposition::CacheHit { exact: true, .. }
    ));
    assert_eq!(
        decompose.output,
        first.outputs[StageId::Decompose.index()].output
    );
    assert!(h.orchestrator.cache().stats().exact_hits >= 4);
    h.orchestrator.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// § 5  Admission, cancellation and shutdown
// ─────────────────────────────────────────────────────────────────────────────

/// A full queue rejects at submit time and the request never enters the
/// pipeline.
#[tokio::test]
async fn full_queue_rejects_submission() {
    let mut config = cascade_config(1);
    config.queue.capacity = 1;
    let mut h = Harness::build(config, Arc::new(ScriptedExecutor::new()));

    h.orchestrator.submit("first", Priority::Normal).unwrap();
    let err = h.orchestrator.submit("second", Priority::Critical).unwrap_err();
    assert_eq!(err, QueueError::Full { capacity: 1 });
    assert_eq!(h.orchestrator.stats().submitted, 1);

    h.orchestrator.start();
    let envelope = h.next_envelope().await;
    assert_eq!(envelope.status, RequestStatus::Completed);
    h.orchestrator.shutdown().await;
}

/// A queued request can be cancelled before any stage runs.
#[tokio::test]
async fn queued_request_can_be_cancelled() {
    let mut h = Harness::build(cascade_config(1), Arc::new(ScriptedExecutor::new()));

    let id = h.orchestrator.submit("Cancel me", Priority::Low).unwrap();
    assert!(h.orchestrator.cancel(id));
    assert!(!h.orchestrator.cancel(id));

    let envelope = h.next_envelope().await;
    assert_eq!(envelope.request_id, id);
    assert_eq!(envelope.reason, ReasonCode::Cancelled);
    assert_eq!(envelope.failed_stage, Some(StageId::Intake));
    assert!(envelope.outputs.is_empty());
    assert_eq!(h.executor.calls(StageId::Intake), 0);
}

/// A request a worker has already taken off the queue, but not yet started,
/// is still found by `cancel` and never runs a stage.
#[tokio::test(start_paused = true)]
async fn request_between_queue_and_worker_can_be_cancelled() {
    let mut h = Harness::build(cascade_config(1), Arc::new(ScriptedExecutor::new()));

    let id = h.orchestrator.submit("Caught in transit", Priority::Normal).unwrap();
    let taken = h.orchestrator.queue().try_dequeue().expect("request was queued");
    assert!(!h.orchestrator.queue().contains(id));
    assert!(h.orchestrator.cancel(id));

    // Hand the request to a worker as if it had dequeued it itself.
    h.orchestrator.queue().enqueue(taken).unwrap();
    h.orchestrator.start();

    let envelope = h.next_envelope().await;
    assert_eq!(envelope.request_id, id);
    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::Cancelled);
    assert!(envelope.outputs.is_empty());
    assert_eq!(h.executor.calls(StageId::Intake), 0);
    h.orchestrator.shutdown().await;
}

/// Cancelling a running request interrupts the current stage and releases
/// the unit it was holding.
#[tokio::test(start_paused = true)]
async fn running_request_can_be_cancelled() {
    let executor = ScriptedExecutor::new().with(StageId::Investigate, Behavior::Sleep(Duration::from_secs(60)));
    let mut h = Harness::start(cascade_config(1), Arc::new(executor));

    let id = h.orchestrator.submit("Long investigation", Priority::Normal).unwrap();
    wait_for_call(&h.executor, StageId::Investigate).await;
    assert_eq!(h.orchestrator.scheduler().ref_count(&unit_id(StageId::Investigate)), 1);
    assert!(h.orchestrator.cancel(id));

    let envelope = h.next_envelope().await;
    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::Cancelled);
    assert_eq!(envelope.failed_stage, Some(StageId::Investigate));
    assert_eq!(envelope.last_completed_stage, Some(StageId::Decompose));
    assert_eq!(h.orchestrator.scheduler().ref_count(&unit_id(StageId::Investigate)), 0);
    // Cancellation is not a stage failure.
    assert_eq!(
        h.orchestrator.breakers().breaker(StageId::Investigate).consecutive_failures(),
        0
    );
    h.orchestrator.shutdown().await;
}

/// Shutdown fails queued and running requests with `Shutdown` and delivers
/// every envelope before returning.
#[tokio::test(start_paused = true)]
async fn shutdown_delivers_an_envelope_for_every_request() {
    let executor = ScriptedExecutor::new().with(StageId::Investigate, Behavior::Sleep(Duration::from_secs(60)));
    let mut h = Harness::start(cascade_config(1), Arc::new(executor));

    let running = h.orchestrator.submit("Running claim", Priority::Normal).unwrap();
    wait_for_call(&h.executor, StageId::Investigate).await;
    let queued = h.orchestrator.submit("Queued claim", Priority::Normal).unwrap();

    h.orchestrator.shutdown().await;

    let envelopes = h.envelopes(2).await;
    for envelope in &envelopes {
        assert_eq!(envelope.status, RequestStatus::Failed);
        assert_eq!(envelope.reason, ReasonCode::Shutdown);
    }
    let mut ids: Vec<_> = envelopes.iter().map(|e| e.request_id).collect();
    ids.sort();
    let mut expected = vec![running, queued];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(h.orchestrator.submit("late", Priority::Normal).is_err());
    assert_eq!(h.orchestrator.scheduler().resident_mb(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// § 6  Memory pressure
// ─────────────────────────────────────────────────────────────────────────────

/// A unit that can never fit sends its request back through the queue with
/// backoff until the requeue allowance runs out. Completed stages are not
/// repeated across requeues.
#[tokio::test(start_paused = true)]
async fn resource_exhaustion_requeues_then_fails() {
    let mut config = cascade_config(1);
    config.scheduler.memory_budget_mb = 4_512;
    config.scheduler.safety_margin_mb = 512;
    config.pipeline.max_requeues = 2;
    for unit in &mut config.models {
        unit.footprint_mb = if unit.specialization == StageId::Investigate {
            5_000
        } else {
            500
        };
    }
    let mut h = Harness::start(config, Arc::new(ScriptedExecutor::new()));

    let envelope = h.verify("Too big to check").await;

    assert_eq!(envelope.status, RequestStatus::Failed);
    assert_eq!(envelope.reason, ReasonCode::ResourceExhausted);
    assert_eq!(envelope.failed_stage, Some(StageId::Investigate));
    assert_eq!(envelope.outputs.len(), 4);
    assert_eq!(h.executor.calls(StageId::Intake), 1);
    assert_eq!(h.executor.calls(StageId::Investigate), 0);
    assert_eq!(h.orchestrator.stats().requeues, 2);
    assert!(h.orchestrator.scheduler().resident_mb() <= 4_000);
    h.orchestrator.shutdown().await;
}

/// Units are shared across requests and evicted only when idle.
#[tokio::test]
async fn tight_budget_rotates_units_between_requests() {
    let mut config = cascade_config(1);
    // Room for three 1 GiB units at a time.
    config.scheduler.memory_budget_mb = 3_584;
    config.scheduler.safety_margin_mb = 512;
    config.cache.enabled = false;
    let mut h = Harness::start(config, Arc::new(ScriptedExecutor::new()));

    for claim in ["Claim alpha", "Claim beta"] {
        let envelope = h.verify(claim).await;
        assert_eq!(envelope.status, RequestStatus::Completed);
        assert!(!envelope.degraded);
    }

    let stats = h.orchestrator.scheduler().stats();
    assert!(stats.peak_resident_mb <= 3_072);
    assert!(stats.evictions > 0);
    assert!(h.loader.loads(&unit_id(StageId::Intake)) >= 2);
    h.orchestrator.shutdown().await;
}
