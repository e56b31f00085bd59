//! Pipeline Orchestrator
//!
//! Runs every admitted request through the fixed cascade
//! (intake, classify, safety, decompose, investigate, synthesize, present)
//! on a pool of workers. For each stage a worker consults the circuit
//! breaker, then the semantic cache, then asks the scheduler for the stage's
//! model unit and calls the external executor under the stage timeout.
//!
//! Every request ends in exactly one terminal envelope handed to the
//! delivery channel: `Completed`, `Blocked` or `Failed` with a stable
//! [`ReasonCode`].

mod runner;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use error_stack::{Report, ResultExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use verity_kernel::config::{CascadeConfig, ConfigError, PipelineConfig};
use verity_kernel::delivery::ResultDelivery;
use verity_kernel::envelope::{FinalEnvelope, ReasonCode};
use verity_kernel::error::{KernelError, KernelResult, QueueError};
use verity_kernel::model::ModelLoader;
use verity_kernel::request::{PipelineRequest, Priority, RequestStatus};
use verity_kernel::resource::ResourceProbe;
use verity_kernel::stage::{StageExecutor, StageId};

use crate::cache::SemanticCache;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::delivery::DeliveryChannel;
use crate::monitor::ResourceMonitor;
use crate::queue::RequestQueue;
use crate::registry::ModelRegistry;
use crate::scheduler::ModelScheduler;

/// Executors by stage. A closed set: one entry per [`StageId`].
#[derive(Clone, Default)]
pub struct StageExecutors {
    by_stage: BTreeMap<StageId, Arc<dyn StageExecutor>>,
}

impl StageExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same executor for every stage; it dispatches on `StageInput::stage`.
    pub fn uniform(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            by_stage: StageId::ALL
                .iter()
                .map(|stage| (*stage, executor.clone()))
                .collect(),
        }
    }

    pub fn with(mut self, stage: StageId, executor: Arc<dyn StageExecutor>) -> Self {
        self.by_stage.insert(stage, executor);
        self
    }

    pub fn get(&self, stage: StageId) -> Option<&Arc<dyn StageExecutor>> {
        self.by_stage.get(&stage)
    }

    pub fn missing(&self) -> Vec<StageId> {
        StageId::ALL
            .iter()
            .copied()
            .filter(|s| !self.by_stage.contains_key(s))
            .collect()
    }
}

impl std::fmt::Debug for StageExecutors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_stage.keys()).finish()
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub completed: u64,
    pub blocked: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Terminal envelopes with at least one degraded stage.
    pub degraded: u64,
    pub requeues: u64,
    /// Admitted requests without an envelope yet, queued ones included.
    pub in_flight: usize,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    blocked: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    degraded: AtomicU64,
    requeues: AtomicU64,
    finished: AtomicU64,
    total_latency_ms: AtomicU64,
}

pub(crate) struct OrchestratorInner {
    config: PipelineConfig,
    queue: Arc<RequestQueue>,
    scheduler: ModelScheduler,
    breakers: Arc<CircuitBreakerManager>,
    cache: Arc<SemanticCache>,
    executors: StageExecutors,
    delivery: DeliveryChannel,
    monitor: Option<ResourceMonitor>,
    /// Cancellation tokens of admitted requests that are not finished.
    in_flight: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

impl OrchestratorInner {
    /// Token for a request, shared across requeues.
    fn token_for(&self, id: Uuid) -> CancellationToken {
        self.in_flight
            .entry(id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    /// Reason reported when a request's token fired.
    fn cancel_reason(&self) -> ReasonCode {
        if self.shutdown.is_cancelled() {
            ReasonCode::Shutdown
        } else {
            ReasonCode::Cancelled
        }
    }

    /// Moves `request` to its terminal status and hands the envelope over.
    /// The single exit path of every request.
    fn finish(
        &self,
        mut request: PipelineRequest,
        status: RequestStatus,
        reason: ReasonCode,
        detail: Option<String>,
    ) {
        self.in_flight.remove(&request.id());
        if let Err(e) = request.transition(status) {
            warn!(request_id = %request.id(), error = %e, "request already terminal, not delivered again");
            return;
        }

        let envelope = FinalEnvelope::from_request(&request, status, reason, detail);
        let counter = match status {
            RequestStatus::Completed => &self.counters.completed,
            RequestStatus::Blocked => &self.counters.blocked,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if matches!(reason, ReasonCode::Cancelled | ReasonCode::Shutdown) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        if envelope.degraded {
            self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        }
        let latency_ms = (envelope.finished_at - request.arrived_at())
            .num_milliseconds()
            .max(0) as u64;
        self.counters.finished.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);

        info!(
            request_id = %envelope.request_id,
            status = %status,
            reason = %reason,
            degraded = envelope.degraded,
            latency_ms,
            "request finished"
        );
        if let Err(e) = self.delivery.deliver(envelope) {
            warn!(request_id = %request.id(), error = %e, "final envelope could not be queued");
        }
    }

    /// Puts a request that hit `ResourceExhausted` back into the queue after
    /// the configured backoff, or fails it once out of attempts.
    fn requeue(self: &Arc<Self>, mut request: PipelineRequest, detail: String) {
        if request.requeues() >= self.config.max_requeues {
            self.finish(
                request,
                RequestStatus::Failed,
                ReasonCode::ResourceExhausted,
                Some(format!("{detail} (after {} requeues)", self.config.max_requeues)),
            );
            return;
        }

        let delay = self.config.requeue_backoff.delay(request.requeues());
        if let Err(e) = request.mark_requeued() {
            warn!(request_id = %request.id(), error = %e, "cannot requeue terminal request");
            return;
        }
        self.counters.requeues.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %request.id(),
            attempt = request.requeues(),
            delay_ms = delay.as_millis() as u64,
            "requeueing after resource exhaustion"
        );

        let token = self.token_for(request.id());
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    let reason = inner.cancel_reason();
                    inner.finish(request, RequestStatus::Failed, reason, Some("cancelled during requeue backoff".into()));
                }
                _ = tokio::time::sleep(delay) => {
                    let id = request.id();
                    // Keep a copy: the queue consumes the request even when it rejects it.
                    let fallback = request.clone();
                    match inner.queue.enqueue(request) {
                        Ok(()) => {}
                        Err(QueueError::Closed) => {
                            inner.finish(fallback, RequestStatus::Failed, ReasonCode::Shutdown, Some("queue closed".into()));
                        }
                        Err(e) => {
                            warn!(request_id = %id, error = %e, "requeue rejected");
                            inner.finish(fallback, RequestStatus::Failed, ReasonCode::ResourceExhausted, Some(format!("{detail}; requeue rejected: {e}")));
                        }
                    }
                }
            }
        });
    }
}

/// External collaborators needed to assemble an orchestrator from configuration.
pub struct Collaborators {
    pub loader: Arc<dyn ModelLoader>,
    pub executors: StageExecutors,
    pub sink: Arc<dyn ResultDelivery>,
    /// Device probe for the resource monitor; no monitor without one.
    pub probe: Option<Arc<dyn ResourceProbe>>,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    queue: Option<Arc<RequestQueue>>,
    scheduler: Option<ModelScheduler>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    cache: Option<Arc<SemanticCache>>,
    executors: StageExecutors,
    delivery: Option<DeliveryChannel>,
    monitor: Option<ResourceMonitor>,
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            queue: None,
            scheduler: None,
            breakers: None,
            cache: None,
            executors: StageExecutors::new(),
            delivery: None,
            monitor: None,
        }
    }

    pub fn queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn scheduler(mut self, scheduler: ModelScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn executors(mut self, executors: StageExecutors) -> Self {
        self.executors = executors;
        self
    }

    pub fn delivery(mut self, delivery: DeliveryChannel) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Checks that every stage has an executor and a model unit.
    pub fn build(self) -> KernelResult<Orchestrator> {
        let missing_part = |part: &str| {
            Report::new(KernelError::Internal(format!("orchestrator built without {part}")))
        };
        let scheduler = self.scheduler.ok_or_else(|| missing_part("a scheduler"))?;
        let delivery = self.delivery.ok_or_else(|| missing_part("a delivery channel"))?;

        let missing = self.executors.missing();
        if !missing.is_empty() {
            let names: Vec<_> = missing.iter().map(|s| s.as_str()).collect();
            return Err(Report::new(KernelError::Config(ConfigError::Invalid(format!(
                "no executor for stages: {}",
                names.join(", ")
            )))));
        }
        let unserved: Vec<_> = StageId::ALL
            .iter()
            .filter(|s| scheduler.registry().primary_for(**s).is_none())
            .map(|s| s.as_str())
            .collect();
        if !unserved.is_empty() {
            return Err(Report::new(KernelError::Config(ConfigError::Invalid(format!(
                "no model unit for stages: {}",
                unserved.join(", ")
            )))));
        }
        for (stage, fallback) in &self.config.fallbacks {
            if stage == fallback {
                return Err(Report::new(KernelError::Config(ConfigError::Invalid(format!(
                    "stage {stage} cannot fall back to itself"
                )))));
            }
        }
        if self.config.workers == 0 {
            return Err(Report::new(KernelError::Config(ConfigError::Invalid(
                "pipeline.workers must be positive".into(),
            ))));
        }

        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                queue: self
                    .queue
                    .unwrap_or_else(|| Arc::new(RequestQueue::new(100))),
                breakers: self.breakers.unwrap_or_default(),
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(SemanticCache::new(Default::default()))),
                config: self.config,
                scheduler,
                executors: self.executors,
                delivery,
                monitor: self.monitor,
                in_flight: DashMap::new(),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }
}

/// Handle on a running cascade. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn builder(config: PipelineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Wires every component from one configuration. Must run inside a
    /// tokio runtime (the delivery pump is spawned here).
    pub fn from_config(config: &CascadeConfig, parts: Collaborators) -> KernelResult<Self> {
        config
            .validate()
            .map_err(|e| Report::new(KernelError::Config(e)))
            .attach("invalid cascade configuration")?;

        let registry = ModelRegistry::from_descriptors(config.models.iter().cloned())
            .map_err(|e| Report::new(KernelError::Registry(e)))
            .attach("building model registry")?;
        let registry = Arc::new(registry);

        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::from(
            &config.breaker,
        )));
        let monitor = parts
            .probe
            .map(|probe| ResourceMonitor::new(config.monitor.clone(), probe));

        let mut scheduler = ModelScheduler::builder(config.scheduler.clone(), registry, parts.loader)
            .with_breakers(breakers.clone());
        if let Some(monitor) = &monitor {
            scheduler = scheduler.with_resource_feed(monitor.subscribe());
        }

        let mut builder = Self::builder(config.pipeline.clone())
            .queue(Arc::new(RequestQueue::from_config(&config.queue)))
            .scheduler(scheduler.build())
            .breakers(breakers)
            .cache(Arc::new(SemanticCache::new(config.cache.clone())))
            .executors(parts.executors)
            .delivery(DeliveryChannel::start(&config.delivery, parts.sink));
        if let Some(monitor) = monitor {
            builder = builder.monitor(monitor);
        }
        builder.build().attach("assembling pipeline orchestrator")
    }

    /// Starts the monitor, the idle reaper and the worker pool.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock();
        if !workers.is_empty() {
            warn!("orchestrator already started");
            return;
        }
        if let Some(monitor) = &self.inner.monitor {
            monitor.start();
        }
        self.inner.scheduler.start();
        for worker_id in 0..self.inner.config.workers {
            workers.push(tokio::spawn(worker::run(self.inner.clone(), worker_id)));
        }
        info!(workers = self.inner.config.workers, "pipeline orchestrator started");
    }

    /// Admits a new request. A full queue rejects immediately.
    pub fn submit(&self, payload: impl Into<String>, priority: Priority) -> Result<Uuid, QueueError> {
        self.submit_request(PipelineRequest::new(payload, priority))
    }

    pub fn submit_request(&self, request: PipelineRequest) -> Result<Uuid, QueueError> {
        let id = request.id();
        // Registered before admission so `cancel` finds the request even
        // while a worker is taking it off the queue.
        self.inner.token_for(id);
        if let Err(e) = self.inner.queue.enqueue(request) {
            if !matches!(e, QueueError::Duplicate(_)) {
                self.inner.in_flight.remove(&id);
            }
            return Err(e);
        }
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %id, "request admitted");
        Ok(id)
    }

    /// Cancels a queued, running or requeued request. Returns `false` for
    /// unknown or already finished ids.
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Some(request) = self.inner.queue.cancel(id) {
            self.inner.finish(
                request,
                RequestStatus::Failed,
                ReasonCode::Cancelled,
                Some("cancelled while queued".into()),
            );
            return true;
        }
        match self.inner.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops admission, fails whatever is still queued with `Shutdown`,
    /// cancels running requests and waits for every envelope to be handed
    /// to the sink.
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        for request in self.inner.queue.drain() {
            self.inner.finish(
                request,
                RequestStatus::Failed,
                ReasonCode::Shutdown,
                Some("orchestrator shutting down".into()),
            );
        }
        self.inner.shutdown.cancel();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
        // Requeue timers observe the shutdown token; give them a turn.
        while !self.inner.in_flight.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.inner.scheduler.shutdown().await;
        if let Some(monitor) = &self.inner.monitor {
            monitor.shutdown().await;
        }
        self.inner.delivery.flush_and_close().await;
        info!("pipeline orchestrator stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        let finished = c.finished.load(Ordering::Relaxed);
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            blocked: c.blocked.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
            requeues: c.requeues.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
            avg_latency_ms: if finished == 0 {
                0.0
            } else {
                c.total_latency_ms.load(Ordering::Relaxed) as f64 / finished as f64
            },
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.inner.queue
    }

    pub fn scheduler(&self) -> &ModelScheduler {
        &self.inner.scheduler
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.inner.breakers
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.inner.cache
    }

    pub fn delivery(&self) -> &DeliveryChannel {
        &self.inner.delivery
    }

    pub fn monitor(&self) -> Option<&ResourceMonitor> {
        self.inner.monitor.as_ref()
    }
}
