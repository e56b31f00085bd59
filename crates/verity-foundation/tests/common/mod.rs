//! Common test utilities shared across the `verity-foundation` integration tests.
//!
//! This module is **not** a standalone test binary.  It is declared with
//! `mod common;` inside each integration test file that needs it.

pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;
use verity_foundation::{ChannelSink, Collaborators, Orchestrator, Outbound, StageExecutors};
use verity_kernel::config::{BackoffStrategy, CascadeConfig};
use verity_kernel::envelope::{FinalEnvelope, ProgressEvent};
use verity_kernel::model::ModelUnitDescriptor;
use verity_kernel::stage::StageId;

use scripted::{CountingLoader, ScriptedExecutor};

/// Generous upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(600);

/// Id of the single model unit serving `stage`.
pub fn unit_id(stage: StageId) -> String {
    format!("{stage}-unit")
}

/// One 1 GiB unit per stage, room for all of them, fast requeues.
pub fn cascade_config(workers: usize) -> CascadeConfig {
    let mut config = CascadeConfig::default();
    config.scheduler.memory_budget_mb = 16_384;
    config.scheduler.safety_margin_mb = 512;
    config.scheduler.respect_device_free = false;
    config.pipeline.workers = workers;
    config.pipeline.requeue_backoff = BackoffStrategy::Fixed { delay_ms: 10 };
    config.models = StageId::ALL
        .iter()
        .map(|&stage| ModelUnitDescriptor::new(unit_id(stage), stage, 1024))
        .collect();
    config
}

/// A running orchestrator wired to scripted collaborators.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub executor: Arc<ScriptedExecutor>,
    pub loader: Arc<CountingLoader>,
    pub progress: Vec<ProgressEvent>,
    rx: UnboundedReceiver<Outbound>,
}

impl Harness {
    /// Builds without starting the workers.
    pub fn build(config: CascadeConfig, executor: Arc<ScriptedExecutor>) -> Self {
        let loader = Arc::new(CountingLoader::new());
        let (sink, rx) = ChannelSink::new();
        let orchestrator = Orchestrator::from_config(
            &config,
            Collaborators {
                loader: loader.clone(),
                executors: StageExecutors::uniform(executor.clone()),
                sink: Arc::new(sink),
                probe: None,
            },
        )
        .expect("valid test configuration");

        Self {
            orchestrator,
            executor,
            loader,
            progress: Vec::new(),
            rx,
        }
    }

    pub fn start(config: CascadeConfig, executor: Arc<ScriptedExecutor>) -> Self {
        let harness = Self::build(config, executor);
        harness.orchestrator.start();
        harness
    }

    /// Next final envelope; progress events seen on the way are kept.
    pub async fn next_envelope(&mut self) -> FinalEnvelope {
        loop {
            let item = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("timed out waiting for an envelope")
                .expect("delivery channel closed");
            match item {
                Outbound::Progress(event) => self.progress.push(event),
                Outbound::Final(envelope) => return envelope,
            }
        }
    }

    pub async fn envelopes(&mut self, n: usize) -> Vec<FinalEnvelope> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next_envelope().await);
        }
        out
    }

    /// Submits `payload` and waits for its envelope.
    pub async fn verify(&mut self, payload: &str) -> FinalEnvelope {
        let id = self
            .orchestrator
            .submit(payload, Default::default())
            .expect("queue accepts the request");
        let envelope = self.next_envelope().await;
        assert_eq!(envelope.request_id, id);
        envelope
    }

    pub fn progress_for(&self, id: Uuid) -> Vec<&ProgressEvent> {
        self.progress.iter().filter(|p| p.request_id == id).collect()
    }
}
