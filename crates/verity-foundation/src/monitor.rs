//! Resource Monitor
//!
//! Samples the device through a [`ResourceProbe`] on a fixed interval and
//! publishes [`ResourceSnapshot`]s on a `watch` channel, so the scheduler
//! never has to poll.
//!
//! A failed sample never stops the loop. The last good snapshot is reused;
//! once no good sample has been seen for `stale_after`, the published
//! snapshot is marked stale and reports `Critical` pressure.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use verity_kernel::config::MonitorConfig;
use verity_kernel::resource::{
    DeviceSample, PressureLevel, ProbeError, ResourceProbe, ResourceSnapshot,
};

#[derive(Debug, Default)]
struct MonitorState {
    last_good: Option<ResourceSnapshot>,
    last_good_at: Option<Instant>,
    last_published: Option<ResourceSnapshot>,
    history: VecDeque<ResourceSnapshot>,
    consecutive_failures: u32,
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Arc<dyn ResourceProbe>,
    state: Mutex<MonitorState>,
    tx: watch::Sender<Option<ResourceSnapshot>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Periodic device sampler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                state: Mutex::new(MonitorState::default()),
                tx,
                cancel: CancellationToken::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Starts the background sampling loop.
    pub fn start(&self) {
        let mut handle = self.inner.handle.lock();
        if handle.is_some() {
            warn!("resource monitor already running");
            return;
        }

        let monitor = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.sample_interval();
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("resource monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.sample();
                    }
                }
            }
        }));
        info!(
            interval_ms = self.inner.config.sample_interval_ms,
            "resource monitor started"
        );
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Takes one sample now and publishes the result.
    ///
    /// Returns the snapshot that was published, which is the last good one
    /// when the probe failed, or `None` if the probe has never succeeded.
    pub fn sample(&self) -> Option<ResourceSnapshot> {
        let result = self.inner.probe.sample();
        let published = {
            let mut state = self.inner.state.lock();
            match result {
                Ok(sample) => self.accept(&mut state, sample),
                Err(e) => self.reuse_last_good(&mut state, e),
            }
        };

        if published.is_some() {
            self.inner.tx.send_replace(published);
        }
        published
    }

    fn accept(&self, state: &mut MonitorState, sample: DeviceSample) -> Option<ResourceSnapshot> {
        let cfg = &self.inner.config;
        let snapshot = ResourceSnapshot::from_sample(
            sample,
            cfg.high_pressure_pct,
            cfg.critical_pressure_pct,
            chrono::Utc::now().timestamp_millis(),
        );

        if state.consecutive_failures > 0 {
            info!(
                failures = state.consecutive_failures,
                "resource probe recovered"
            );
        }
        state.consecutive_failures = 0;
        state.last_good = Some(snapshot);
        state.last_good_at = Some(Instant::now());

        state.history.push_back(snapshot);
        while state.history.len() > cfg.history_len {
            state.history.pop_front();
        }

        self.publish(state, snapshot)
    }

    fn reuse_last_good(&self, state: &mut MonitorState, err: ProbeError) -> Option<ResourceSnapshot> {
        state.consecutive_failures += 1;
        warn!(error = %err, failures = state.consecutive_failures, "resource probe failed");

        let last_good = state.last_good?;
        let stale = state
            .last_good_at
            .is_some_and(|at| at.elapsed() >= self.inner.config.stale_after());
        let snapshot = if stale { last_good.into_stale() } else { last_good };
        self.publish(state, snapshot)
    }

    fn publish(&self, state: &mut MonitorState, snapshot: ResourceSnapshot) -> Option<ResourceSnapshot> {
        let previous = state.last_published.map(|s| s.pressure);
        if previous != Some(snapshot.pressure) {
            info!(
                from = ?previous,
                to = %snapshot.pressure,
                used_pct = snapshot.used_pct,
                stale = snapshot.stale,
                "pressure level changed"
            );
        }
        state.last_published = Some(snapshot);
        Some(snapshot)
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.inner.state.lock().last_published
    }

    /// Current pressure level. `Critical` when nothing has been sampled yet
    /// or the last good sample is older than the grace period.
    pub fn pressure_level(&self) -> PressureLevel {
        let state = self.inner.state.lock();
        match (state.last_good, state.last_good_at) {
            (Some(snapshot), Some(at)) if at.elapsed() < self.inner.config.stale_after() => {
                snapshot.pressure
            }
            _ => PressureLevel::Critical,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.inner
            .state
            .lock()
            .last_good_at
            .is_none_or(|at| at.elapsed() >= self.inner.config.stale_after())
    }

    /// Recent good snapshots, oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.inner.state.lock().history.iter().copied().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ResourceSnapshot>> {
        self.inner.tx.subscribe()
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Reports host memory and global CPU usage as device 0. CPU usage reads 0
/// on the first sample.
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::new()
                    .with_memory(MemoryRefreshKind::everything())
                    .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
            )),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> Result<DeviceSample, ProbeError> {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        // sysinfo reports bytes
        let total_mb = sys.total_memory() / (1024 * 1024);
        if total_mb == 0 {
            return Err(ProbeError::Unavailable("host reports no memory".into()));
        }
        let available_mb = sys.available_memory() / (1024 * 1024);

        Ok(DeviceSample {
            total_mb,
            used_mb: total_mb.saturating_sub(available_mb),
            temperature_c: None,
            utilization_pct: Some(sys.global_cpu_usage()),
        })
    }
}

/// Replays a fixed script of samples, then repeats the last entry forever.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<DeviceSample, ProbeError>>>,
    last: Mutex<Result<DeviceSample, ProbeError>>,
}

impl ScriptedProbe {
    pub fn new(script: Vec<Result<DeviceSample, ProbeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Err(ProbeError::Unavailable("empty script".into()))),
        }
    }

    /// A probe that always reports the same reading.
    pub fn constant(total_mb: u64, used_mb: u64) -> Self {
        Self::new(vec![Ok(DeviceSample {
            total_mb,
            used_mb,
            temperature_c: None,
            utilization_pct: None,
        })])
    }

    /// Appends readings to the end of the script.
    pub fn push(&self, reading: Result<DeviceSample, ProbeError>) {
        self.script.lock().push_back(reading);
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&self) -> Result<DeviceSample, ProbeError> {
        let mut last = self.last.lock();
        if let Some(next) = self.script.lock().pop_front() {
            *last = next;
        }
        last.clone()
    }
}
