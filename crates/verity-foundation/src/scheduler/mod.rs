//! Model Scheduler
//!
//! Keeps the set of resident model units inside the device memory budget.
//!
//! - `ensure_resident` hands out a reference-counted [`UnitHandle`], loading
//!   the unit (and its dependencies first) when needed.
//! - When memory is short, unreferenced units are evicted in order of lowest
//!   priority, then longest idle, then unit id.
//! - A background reaper unloads units idle for longer than the idle timeout,
//!   and every idle unit at once when the monitor reports `Critical` pressure.
//!
//! Locking: the resident set and budget live behind one short synchronous
//! mutex that is never held across an await. Loads and unloads of one unit
//! are serialised by a per-unit async lock, load parallelism is capped by a
//! semaphore, and a single async lock serialises eviction decisions. Eviction
//! and reaping only `try_lock` a victim's unit lock, so they never wait on a
//! unit that is busy.

mod budget;
mod handle;

pub use budget::MemoryBudget;
pub use handle::UnitHandle;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use verity_kernel::config::SchedulerConfig;
use verity_kernel::error::SchedulerError;
use verity_kernel::model::{ModelLoader, ModelUnitDescriptor, UnitState};
use verity_kernel::resource::{PressureLevel, ResourceSnapshot};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::registry::ModelRegistry;

type AcquireFuture = Pin<Box<dyn Future<Output = Result<UnitHandle, SchedulerError>> + Send>>;
type ResourceFeed = watch::Receiver<Option<ResourceSnapshot>>;

/// Counters exposed by [`ModelScheduler::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub idle_unloads: u64,
    pub resident_units: usize,
    pub resident_mb: u64,
    pub peak_resident_units: usize,
    pub peak_resident_mb: u64,
    pub usable_mb: u64,
}

/// Resident unit as listed by [`ModelScheduler::resident_units`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidentInfo {
    pub unit_id: String,
    pub footprint_mb: u64,
    pub refs: usize,
    pub idle_ms: u64,
}

#[derive(Debug)]
struct UnitSlot {
    state: UnitState,
    refs: usize,
    last_used: Instant,
    allocated_mb: u64,
}

impl UnitSlot {
    fn new() -> Self {
        Self {
            state: UnitState::Unloaded,
            refs: 0,
            last_used: Instant::now(),
            allocated_mb: 0,
        }
    }

    /// Occupies memory, or is about to.
    fn is_live(&self) -> bool {
        matches!(
            self.state,
            UnitState::Loading | UnitState::Resident | UnitState::Unloading
        )
    }
}

struct SchedulerState {
    slots: BTreeMap<String, UnitSlot>,
    budget: MemoryBudget,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn set_state(&mut self, unit: &str, next: UnitState) {
        if let Some(slot) = self.slots.get_mut(unit) {
            if !slot.state.can_transition_to(next) {
                warn!(unit, from = %slot.state, to = %next, "unexpected unit transition");
            }
            slot.state = next;
        }
    }

    fn resident_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == UnitState::Resident)
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
enum UnloadReason {
    Evicted,
    Idle,
    Shutdown,
}

pub(crate) struct SchedulerInner {
    config: SchedulerConfig,
    registry: Arc<ModelRegistry>,
    loader: Arc<dyn ModelLoader>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    resources: Option<ResourceFeed>,
    state: Mutex<SchedulerState>,
    unit_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    load_permits: Semaphore,
    eviction_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`ModelScheduler`].
pub struct ModelSchedulerBuilder {
    config: SchedulerConfig,
    registry: Arc<ModelRegistry>,
    loader: Arc<dyn ModelLoader>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    resources: Option<ResourceFeed>,
}

impl ModelSchedulerBuilder {
    /// Load failures are reported to the breaker of the unit's stage.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Snapshot feed from the resource monitor.
    pub fn with_resource_feed(mut self, feed: ResourceFeed) -> Self {
        self.resources = Some(feed);
        self
    }

    pub fn build(self) -> ModelScheduler {
        let slots = self
            .registry
            .iter()
            .map(|d| (d.id.clone(), UnitSlot::new()))
            .collect();
        let budget = MemoryBudget::new(self.config.memory_budget_mb, self.config.safety_margin_mb);
        let stats = SchedulerStats {
            usable_mb: budget.usable_mb(),
            ..SchedulerStats::default()
        };
        let permits = self.config.load_parallelism.max(1);

        ModelScheduler {
            inner: Arc::new(SchedulerInner {
                config: self.config,
                registry: self.registry,
                loader: self.loader,
                breakers: self.breakers,
                resources: self.resources,
                state: Mutex::new(SchedulerState {
                    slots,
                    budget,
                    stats,
                }),
                unit_locks: DashMap::new(),
                load_permits: Semaphore::new(permits),
                eviction_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                reaper: Mutex::new(None),
            }),
        }
    }
}

/// Owner of the resident unit set. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ModelScheduler {
    inner: Arc<SchedulerInner>,
}

impl ModelScheduler {
    pub fn builder(
        config: SchedulerConfig,
        registry: Arc<ModelRegistry>,
        loader: Arc<dyn ModelLoader>,
    ) -> ModelSchedulerBuilder {
        ModelSchedulerBuilder {
            config,
            registry,
            loader,
            breakers: None,
            resources: None,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    /// Returns a handle on a resident `unit_id`, loading it if necessary.
    ///
    /// The load itself runs on its own task, so dropping this future (for
    /// example on request cancellation) never leaves a unit half-loaded; a
    /// unit that finishes loading after its caller went away simply becomes
    /// idle.
    pub async fn ensure_resident(&self, unit_id: &str) -> Result<UnitHandle, SchedulerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Shutdown);
        }
        let descriptor = self
            .inner
            .registry
            .lookup(unit_id)
            .map_err(|_| SchedulerError::UnknownUnit(unit_id.to_string()))?
            .clone();

        if let Some(handle) = self.inner.try_acquire_resident(&descriptor) {
            return Ok(handle);
        }

        let task = tokio::spawn(SchedulerInner::acquire(self.inner.clone(), descriptor));
        task.await.map_err(|e| SchedulerError::ModelLoad {
            unit: unit_id.to_string(),
            message: format!("load task aborted: {e}"),
        })?
    }

    /// Gives a handle back. The unit stays resident until evicted or reaped.
    pub fn release(&self, handle: UnitHandle) {
        drop(handle);
    }

    pub fn unit_state(&self, unit_id: &str) -> Option<UnitState> {
        self.inner.state.lock().slots.get(unit_id).map(|s| s.state)
    }

    pub fn ref_count(&self, unit_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .get(unit_id)
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    pub fn resident_units(&self) -> Vec<ResidentInfo> {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter(|(_, s)| s.state == UnitState::Resident)
            .map(|(id, s)| ResidentInfo {
                unit_id: id.clone(),
                footprint_mb: s.allocated_mb,
                refs: s.refs,
                idle_ms: s.last_used.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Memory held by loading, resident and unloading units.
    pub fn resident_mb(&self) -> u64 {
        self.inner.state.lock().budget.used_mb()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            resident_units: state.resident_count(),
            resident_mb: state.budget.used_mb(),
            peak_resident_mb: state.budget.peak_used_mb(),
            ..state.stats.clone()
        }
    }

    /// Unloads unreferenced units. With `force` every idle unit goes;
    /// otherwise only those idle for longer than the idle timeout.
    pub async fn unload_idle(&self, force: bool) -> usize {
        self.inner.reap(force).await
    }

    /// Starts the idle reaper.
    pub fn start(&self) {
        let mut reaper = self.inner.reaper.lock();
        if reaper.is_some() {
            warn!("model scheduler already running");
            return;
        }

        let inner = self.inner.clone();
        *reaper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.reap_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut feed = inner.resources.clone();
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        inner.reap(false).await;
                    }
                    pressure = next_pressure(&mut feed) => {
                        if pressure == Some(PressureLevel::Critical) {
                            let unloaded = inner.reap(true).await;
                            if unloaded > 0 {
                                warn!(unloaded, "critical memory pressure, unloaded idle units");
                            }
                        }
                    }
                }
            }
            debug!("idle reaper stopped");
        }));
        info!(
            usable_mb = self.inner.config.usable_mb(),
            idle_timeout_secs = self.inner.config.idle_timeout_secs,
            "model scheduler started"
        );
    }

    /// Stops the reaper and unloads every unreferenced unit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let reaper = self.inner.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let unloaded = self.inner.reap_with(|_| true, UnloadReason::Shutdown).await;
        let still_held: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .slots
                .iter()
                .filter(|(_, s)| s.refs > 0)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if !still_held.is_empty() {
            warn!(units = ?still_held, "units still referenced at shutdown");
        }
        info!(unloaded, "model scheduler shut down");
    }
}

/// Rolls a reservation back when the load never returns, which happens when
/// the loader panics or the load task is dropped mid-flight.
struct LoadingGuard<'a> {
    inner: &'a SchedulerInner,
    descriptor: &'a ModelUnitDescriptor,
    armed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(inner: &'a SchedulerInner, descriptor: &'a ModelUnitDescriptor) -> Self {
        Self {
            inner,
            descriptor,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(unit = %self.descriptor.id, "load aborted, releasing its reservation");
            self.inner.fail_load(self.descriptor);
        }
    }
}

/// Waits for the next pressure change; never resolves without a feed.
async fn next_pressure(feed: &mut Option<ResourceFeed>) -> Option<PressureLevel> {
    if let Some(rx) = feed.as_mut() {
        if rx.changed().await.is_ok() {
            return rx.borrow().map(|s| s.pressure);
        }
        *feed = None;
    }
    std::future::pending().await
}

impl SchedulerInner {
    fn unit_lock(&self, unit_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.unit_locks
            .entry(unit_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn try_acquire_resident(self: &Arc<Self>, descriptor: &ModelUnitDescriptor) -> Option<UnitHandle> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(&descriptor.id)?;
        if slot.state != UnitState::Resident {
            return None;
        }
        slot.refs += 1;
        slot.last_used = Instant::now();
        Some(UnitHandle::new(self.clone(), descriptor.clone()))
    }

    pub(crate) fn release_ref(&self, unit_id: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(unit_id) {
            slot.refs = slot.refs.saturating_sub(1);
            slot.last_used = Instant::now();
        }
    }

    fn record_load_failure(&self, descriptor: &ModelUnitDescriptor) {
        if let Some(breakers) = &self.breakers {
            breakers.record_failure(descriptor.specialization);
        }
    }

    /// Returns a `Loading` unit's memory, marks it `Failed` and reports the
    /// failure to the unit's stage breaker.
    fn fail_load(&self, descriptor: &ModelUnitDescriptor) {
        {
            let mut state = self.state.lock();
            let allocated = state
                .slots
                .get_mut(&descriptor.id)
                .map(|slot| std::mem::take(&mut slot.allocated_mb))
                .unwrap_or(0);
            state.budget.release(allocated);
            state.set_state(&descriptor.id, UnitState::Failed);
            state.stats.load_failures += 1;
        }
        self.record_load_failure(descriptor);
    }

    fn acquire(inner: Arc<Self>, descriptor: ModelUnitDescriptor) -> AcquireFuture {
        Box::pin(async move {
            // Dependencies stay referenced until this unit is resident.
            let mut dependencies = Vec::with_capacity(descriptor.dependencies.len());
            for dep_id in &descriptor.dependencies {
                let dep = inner
                    .registry
                    .lookup(dep_id)
                    .map_err(|_| SchedulerError::UnknownUnit(dep_id.clone()))?
                    .clone();
                let handle = match inner.try_acquire_resident(&dep) {
                    Some(handle) => handle,
                    None => match Self::acquire(inner.clone(), dep).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            if matches!(e, SchedulerError::ModelLoad { .. }) {
                                inner.record_load_failure(&descriptor);
                            }
                            return Err(e);
                        }
                    },
                };
                dependencies.push(handle);
            }

            let lock = inner.unit_lock(&descriptor.id);
            let _unit_guard = lock.lock_owned().await;
            if let Some(handle) = inner.try_acquire_resident(&descriptor) {
                return Ok(handle);
            }

            let _permit = inner
                .load_permits
                .acquire()
                .await
                .map_err(|_| SchedulerError::Shutdown)?;
            inner.reserve(&descriptor).await?;
            let mut loading = LoadingGuard::new(&inner, &descriptor);

            debug!(unit = %descriptor.id, footprint_mb = descriptor.footprint_mb, "loading unit");
            let started = Instant::now();
            let result = inner.loader.load(&descriptor).await;
            loading.disarm();
            drop(loading);
            match result {
                Ok(()) => {
                    let mut state = inner.state.lock();
                    state.set_state(&descriptor.id, UnitState::Resident);
                    if let Some(slot) = state.slots.get_mut(&descriptor.id) {
                        slot.refs += 1;
                        slot.last_used = Instant::now();
                    }
                    let resident = state.resident_count();
                    state.stats.loads += 1;
                    state.stats.peak_resident_units = state.stats.peak_resident_units.max(resident);
                    info!(
                        unit = %descriptor.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        resident_mb = state.budget.used_mb(),
                        "unit resident"
                    );
                    drop(state);
                    Ok(UnitHandle::new(inner.clone(), descriptor))
                }
                Err(e) => {
                    warn!(unit = %descriptor.id, error = %e, "unit failed to load");
                    inner.fail_load(&descriptor);
                    Err(SchedulerError::ModelLoad {
                        unit: descriptor.id.clone(),
                        message: e.to_string(),
                    })
                }
            }
        })
    }

    /// Upper bound on memory a new load may use right now, given `freed_mb`
    /// already reclaimed during this reservation.
    fn available_mb(&self, state: &SchedulerState, device_headroom: Option<u64>, freed_mb: u64) -> u64 {
        let budget = state.budget.available_mb();
        match device_headroom {
            Some(headroom) => budget.min(headroom.saturating_add(freed_mb)),
            None => budget,
        }
    }

    /// Device free memory minus the safety margin, when a fresh snapshot exists.
    fn device_headroom(&self) -> Option<u64> {
        if !self.config.respect_device_free {
            return None;
        }
        let snapshot = (*self.resources.as_ref()?.borrow())?;
        if snapshot.stale {
            return None;
        }
        Some(snapshot.free_mb.saturating_sub(self.config.safety_margin_mb))
    }

    /// Claims memory for `descriptor` and marks it `Loading`, evicting idle
    /// units when needed.
    async fn reserve(&self, descriptor: &ModelUnitDescriptor) -> Result<(), SchedulerError> {
        let need = descriptor.footprint_mb;
        let headroom = self.device_headroom();
        if self.try_commit(descriptor, headroom, 0) {
            return Ok(());
        }

        let _eviction = self.eviction_lock.lock().await;
        let mut freed = 0;
        loop {
            let victims = {
                let mut state = self.state.lock();
                let available = self.available_mb(&state, headroom, freed);
                if need <= available && Self::commit(&mut state, descriptor) {
                    return Ok(());
                }

                let shortage = need.saturating_sub(available).max(1);
                let exhausted = || SchedulerError::ResourceExhausted {
                    unit: descriptor.id.clone(),
                    required_mb: need,
                    available_mb: available,
                };
                if self.reclaimable_mb(&state, &descriptor.id) < shortage {
                    return Err(exhausted());
                }
                let victims =
                    self.claim_victims(&mut state, &descriptor.id, |_| true, Some(shortage));
                if victims.is_empty() {
                    return Err(exhausted());
                }
                victims
            };

            for (victim, guard) in victims {
                info!(victim = %victim.id, for_unit = %descriptor.id, "evicting unit");
                freed += self.unload(&victim, UnloadReason::Evicted).await;
                drop(guard);
            }
        }
    }

    fn try_commit(&self, descriptor: &ModelUnitDescriptor, headroom: Option<u64>, freed: u64) -> bool {
        let mut state = self.state.lock();
        descriptor.footprint_mb <= self.available_mb(&state, headroom, freed)
            && Self::commit(&mut state, descriptor)
    }

    fn commit(state: &mut SchedulerState, descriptor: &ModelUnitDescriptor) -> bool {
        if !state.budget.allocate(descriptor.footprint_mb) {
            return false;
        }
        let slot = state
            .slots
            .entry(descriptor.id.clone())
            .or_insert_with(UnitSlot::new);
        slot.allocated_mb = descriptor.footprint_mb;
        state.set_state(&descriptor.id, UnitState::Loading);
        true
    }

    /// Whether a live unit other than those in `excluded` depends on `unit_id`.
    fn is_needed(&self, state: &SchedulerState, unit_id: &str, excluded: &BTreeSet<String>) -> bool {
        state.slots.iter().any(|(id, slot)| {
            slot.is_live()
                && !excluded.contains(id)
                && self
                    .registry
                    .lookup(id)
                    .is_ok_and(|d| d.dependencies.iter().any(|dep| dep == unit_id))
        })
    }

    fn is_idle(slot: &UnitSlot) -> bool {
        slot.state == UnitState::Resident && slot.refs == 0
    }

    /// Memory that evicting every idle unit could free, following
    /// dependency chains that become evictable once their dependents go.
    fn reclaimable_mb(&self, state: &SchedulerState, target: &str) -> u64 {
        let mut evictable = BTreeSet::new();
        loop {
            let next: Vec<String> = state
                .slots
                .iter()
                .filter(|(id, slot)| {
                    id.as_str() != target
                        && Self::is_idle(slot)
                        && !evictable.contains(*id)
                        && !self.is_needed(state, id, &evictable)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if next.is_empty() {
                break;
            }
            evictable.extend(next);
        }
        evictable
            .iter()
            .filter_map(|id| state.slots.get(id))
            .map(|s| s.allocated_mb)
            .sum()
    }

    /// Picks idle units in eviction order, locks them and marks them
    /// `Unloading`. Stops once `shortage` is covered, if given.
    fn claim_victims(
        &self,
        state: &mut SchedulerState,
        target: &str,
        filter: impl Fn(&UnitSlot) -> bool,
        shortage: Option<u64>,
    ) -> Vec<(ModelUnitDescriptor, OwnedMutexGuard<()>)> {
        let none = BTreeSet::new();
        let view: &SchedulerState = state;
        let mut candidates: Vec<(ModelUnitDescriptor, Instant, u64)> = view
            .slots
            .iter()
            .filter(|(id, slot)| {
                id.as_str() != target
                    && Self::is_idle(slot)
                    && filter(slot)
                    && !self.is_needed(view, id, &none)
            })
            .filter_map(|(id, slot)| {
                self.registry
                    .lookup(id)
                    .ok()
                    .map(|d| (d.clone(), slot.last_used, slot.allocated_mb))
            })
            .collect();

        // Lowest priority, then longest idle, then unit id.
        candidates.sort_by(|(a, a_used, _), (b, b_used, _)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a_used.cmp(b_used))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut claimed = Vec::new();
        let mut covered = 0;
        for (descriptor, _, allocated_mb) in candidates {
            if shortage.is_some_and(|s| covered >= s) {
                break;
            }
            let Ok(guard) = self.unit_lock(&descriptor.id).try_lock_owned() else {
                continue;
            };
            covered += allocated_mb;
            claimed.push((descriptor, guard));
        }

        for (descriptor, _) in &claimed {
            state.set_state(&descriptor.id, UnitState::Unloading);
        }
        claimed
    }

    /// Unloads a unit already marked `Unloading`. Returns the memory freed.
    async fn unload(&self, descriptor: &ModelUnitDescriptor, reason: UnloadReason) -> u64 {
        let result = self.loader.unload(descriptor).await;

        let mut state = self.state.lock();
        let SchedulerState { slots, budget, stats } = &mut *state;
        let Some(slot) = slots.get_mut(&descriptor.id) else {
            return 0;
        };
        let freed = slot.allocated_mb;
        budget.release(freed);
        slot.allocated_mb = 0;
        slot.state = match &result {
            Ok(()) => UnitState::Unloaded,
            Err(e) => {
                warn!(unit = %descriptor.id, error = %e, "unload reported an error; weights assumed released");
                UnitState::Failed
            }
        };
        match reason {
            UnloadReason::Evicted => stats.evictions += 1,
            UnloadReason::Idle => stats.idle_unloads += 1,
            UnloadReason::Shutdown => {}
        }
        debug!(unit = %descriptor.id, freed_mb = freed, ?reason, "unit unloaded");
        freed
    }

    async fn reap(&self, force: bool) -> usize {
        let idle_timeout = self.config.idle_timeout();
        self.reap_with(
            |slot| force || slot.last_used.elapsed() >= idle_timeout,
            UnloadReason::Idle,
        )
        .await
    }

    /// Repeats until no unit qualifies, so dependencies freed by a round are
    /// picked up by the next.
    async fn reap_with(&self, filter: impl Fn(&UnitSlot) -> bool, reason: UnloadReason) -> usize {
        let mut total = 0;
        loop {
            let victims = {
                let mut state = self.state.lock();
                self.claim_victims(&mut state, "", &filter, None)
            };
            if victims.is_empty() {
                break;
            }
            for (victim, guard) in victims {
                self.unload(&victim, reason).await;
                drop(guard);
                total += 1;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use verity_kernel::model::LoadError;
    use verity_kernel::stage::StageId;

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        unloads: AtomicUsize,
        fail: Mutex<BTreeSet<String>>,
        panic_once: Mutex<BTreeSet<String>>,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
            self.order.lock().push(unit.id.clone());
            if self.panic_once.lock().remove(&unit.id) {
                panic!("driver crashed while loading {}", unit.id);
            }
            if self.fail.lock().contains(&unit.id) {
                return Err(LoadError::Load {
                    unit: unit.id.clone(),
                    message: "weights missing".into(),
                });
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unload(&self, _unit: &ModelUnitDescriptor) -> Result<(), LoadError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(budget_mb: u64) -> SchedulerConfig {
        SchedulerConfig {
            memory_budget_mb: budget_mb,
            safety_margin_mb: 0,
            idle_timeout_secs: 60,
            reap_interval_ms: 1_000,
            load_parallelism: 2,
            respect_device_free: true,
        }
    }

    fn scheduler(
        budget_mb: u64,
        units: Vec<ModelUnitDescriptor>,
    ) -> (ModelScheduler, Arc<CountingLoader>) {
        let registry = Arc::new(ModelRegistry::from_descriptors(units).unwrap());
        let loader = Arc::new(CountingLoader::default());
        let scheduler = ModelScheduler::builder(config(budget_mb), registry, loader.clone()).build();
        (scheduler, loader)
    }

    fn unit(id: &str, stage: StageId, mb: u64) -> ModelUnitDescriptor {
        ModelUnitDescriptor::new(id, stage, mb)
    }

    #[tokio::test]
    async fn resident_unit_is_shared_without_reload() {
        let (sched, loader) = scheduler(4_000, vec![unit("a", StageId::Intake, 1_000)]);
        let h1 = sched.ensure_resident("a").await.unwrap();
        let h2 = sched.ensure_resident("a").await.unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(sched.ref_count("a"), 2);
        sched.release(h1);
        drop(h2);
        assert_eq!(sched.ref_count("a"), 0);
        assert_eq!(sched.unit_state("a"), Some(UnitState::Resident));
    }

    #[tokio::test]
    async fn unknown_unit_is_rejected() {
        let (sched, _) = scheduler(1_000, vec![]);
        assert_eq!(
            sched.ensure_resident("nope").await.unwrap_err(),
            SchedulerError::UnknownUnit("nope".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_lowest_priority_then_longest_idle() {
        let (sched, _) = scheduler(
            3_000,
            vec![
                unit("low-old", StageId::Classify, 1_000).with_priority(1),
                unit("low-new", StageId::Decompose, 1_000).with_priority(1),
                unit("high", StageId::Safety, 1_000).with_priority(9),
                unit("incoming", StageId::Present, 1_000),
            ],
        );
        drop(sched.ensure_resident("low-old").await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(sched.ensure_resident("low-new").await.unwrap());
        drop(sched.ensure_resident("high").await.unwrap());

        let _h = sched.ensure_resident("incoming").await.unwrap();
        assert_eq!(sched.unit_state("low-old"), Some(UnitState::Unloaded));
        assert_eq!(sched.unit_state("low-new"), Some(UnitState::Resident));
        assert_eq!(sched.unit_state("high"), Some(UnitState::Resident));
        assert_eq!(sched.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_units_tie_break_on_id() {
        let (sched, _) = scheduler(
            2_000,
            vec![
                unit("b", StageId::Classify, 1_000),
                unit("a", StageId::Decompose, 1_000),
                unit("c", StageId::Present, 1_000),
            ],
        );
        let hb = sched.ensure_resident("b").await.unwrap();
        let ha = sched.ensure_resident("a").await.unwrap();
        drop(hb);
        drop(ha);

        let _hc = sched.ensure_resident("c").await.unwrap();
        assert_eq!(sched.unit_state("a"), Some(UnitState::Unloaded));
        assert_eq!(sched.unit_state("b"), Some(UnitState::Resident));
    }

    #[tokio::test]
    async fn referenced_units_are_never_evicted() {
        let (sched, _) = scheduler(
            2_000,
            vec![
                unit("held", StageId::Intake, 1_500),
                unit("big", StageId::Investigate, 1_000),
            ],
        );
        let _held = sched.ensure_resident("held").await.unwrap();
        let err = sched.ensure_resident("big").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ResourceExhausted { .. }));
        assert_eq!(sched.unit_state("held"), Some(UnitState::Resident));
        assert_eq!(sched.unit_state("big"), Some(UnitState::Unloaded));
        assert_eq!(sched.resident_mb(), 1_500);
    }

    #[tokio::test]
    async fn safety_margin_is_respected() {
        let registry = Arc::new(
            ModelRegistry::from_descriptors(vec![unit("a", StageId::Intake, 1_000)]).unwrap(),
        );
        let cfg = SchedulerConfig {
            safety_margin_mb: 512,
            ..config(1_400)
        };
        let sched = ModelScheduler::builder(cfg, registry, Arc::new(CountingLoader::default())).build();
        assert!(matches!(
            sched.ensure_resident("a").await,
            Err(SchedulerError::ResourceExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn dependencies_load_first_and_are_protected() {
        let (sched, loader) = scheduler(
            3_000,
            vec![
                unit("tokenizer", StageId::Intake, 500),
                unit("decomposer", StageId::Decompose, 1_500).with_dependency("tokenizer"),
                unit("other", StageId::Present, 1_200),
            ],
        );
        drop(sched.ensure_resident("decomposer").await.unwrap());
        assert_eq!(*loader.order.lock(), vec!["tokenizer", "decomposer"]);
        assert_eq!(sched.ref_count("tokenizer"), 0);

        // 1000 MB free, 1200 needed: the decomposer goes, its tokenizer stays.
        let _other = sched.ensure_resident("other").await.unwrap();
        assert_eq!(sched.unit_state("decomposer"), Some(UnitState::Unloaded));
        assert_eq!(sched.unit_state("tokenizer"), Some(UnitState::Resident));
    }

    #[tokio::test]
    async fn load_failure_marks_failed_and_trips_breaker() {
        let registry = Arc::new(
            ModelRegistry::from_descriptors(vec![unit("bad", StageId::Investigate, 1_000)]).unwrap(),
        );
        let loader = Arc::new(CountingLoader::default());
        loader.fail.lock().insert("bad".into());
        let breakers = Arc::new(CircuitBreakerManager::default());
        let sched = ModelScheduler::builder(config(2_000), registry, loader.clone())
            .with_breakers(breakers.clone())
            .build();

        let err = sched.ensure_resident("bad").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ModelLoad { .. }));
        assert_eq!(sched.unit_state("bad"), Some(UnitState::Failed));
        assert_eq!(sched.resident_mb(), 0);
        assert_eq!(sched.stats().load_failures, 1);
        assert_eq!(breakers.breaker(StageId::Investigate).consecutive_failures(), 1);

        // Failed units may be retried.
        loader.fail.lock().clear();
        assert!(sched.ensure_resident("bad").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_loader_releases_reservation_and_probe() {
        use crate::circuit_breaker::{Admission, CircuitBreakerConfig, State};

        let registry = Arc::new(
            ModelRegistry::from_descriptors(vec![unit("flaky", StageId::Investigate, 1_000)]).unwrap(),
        );
        let loader = Arc::new(CountingLoader::default());
        loader.panic_once.lock().insert("flaky".into());
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_secs(1)),
        ));
        breakers.record_failure(StageId::Investigate);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(breakers.try_admit(StageId::Investigate), Admission::Probe);

        let sched = ModelScheduler::builder(config(1_500), registry, loader.clone())
            .with_breakers(breakers.clone())
            .build();
        let err = sched.ensure_resident("flaky").await.unwrap_err();
        assert!(matches!(err, SchedulerError::ModelLoad { .. }));
        assert_eq!(sched.unit_state("flaky"), Some(UnitState::Failed));
        assert_eq!(sched.resident_mb(), 0);
        assert_eq!(sched.stats().load_failures, 1);

        // The crashed load counts as the probe's verdict.
        let breaker = breakers.breaker(StageId::Investigate);
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.probe_in_flight());

        // Memory came back, so the next attempt loads.
        assert!(sched.ensure_resident("flaky").await.is_ok());
        assert_eq!(sched.resident_mb(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_units_are_reaped_after_timeout() {
        let (sched, loader) = scheduler(2_000, vec![unit("a", StageId::Intake, 1_000)]);
        drop(sched.ensure_resident("a").await.unwrap());

        assert_eq!(sched.unload_idle(false).await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(sched.unload_idle(false).await, 1);
        assert_eq!(sched.unit_state("a"), Some(UnitState::Unloaded));
        assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(sched.stats().idle_unloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_pressure_unloads_all_idle_units() {
        let registry = Arc::new(
            ModelRegistry::from_descriptors(vec![
                unit("idle", StageId::Intake, 500),
                unit("busy", StageId::Safety, 500),
            ])
            .unwrap(),
        );
        let (tx, rx) = watch::channel(None);
        let sched = ModelScheduler::builder(config(4_000), registry, Arc::new(CountingLoader::default()))
            .with_resource_feed(rx)
            .build();
        drop(sched.ensure_resident("idle").await.unwrap());
        let _busy = sched.ensure_resident("busy").await.unwrap();
        sched.start();

        let snapshot = ResourceSnapshot::from_sample(
            verity_kernel::resource::DeviceSample {
                total_mb: 4_000,
                used_mb: 3_900,
                temperature_c: None,
                utilization_pct: None,
            },
            75.0,
            90.0,
            0,
        );
        tx.send_replace(Some(snapshot));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sched.unit_state("idle"), Some(UnitState::Unloaded));
        assert_eq!(sched.unit_state("busy"), Some(UnitState::Resident));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn budget_holds_under_concurrent_requests() {
        let units: Vec<_> = (0..8)
            .map(|i| unit(&format!("u{i}"), StageId::ALL[i % 7], 700))
            .collect();
        let (sched, _) = scheduler(2_000, units);

        let mut tasks = Vec::new();
        for round in 0..4 {
            for i in 0..8 {
                let sched = sched.clone();
                tasks.push(tokio::spawn(async move {
                    if let Ok(handle) = sched.ensure_resident(&format!("u{i}")).await {
                        assert!(sched.resident_mb() <= 2_000);
                        tokio::task::yield_now().await;
                        drop(handle);
                    }
                    round
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(sched.stats().peak_resident_mb <= 2_000);
        assert!(sched.resident_mb() <= 2_000);
    }

    #[tokio::test]
    async fn shutdown_unloads_everything_idle() {
        let (sched, loader) = scheduler(
            3_000,
            vec![unit("a", StageId::Intake, 1_000), unit("b", StageId::Safety, 1_000)],
        );
        drop(sched.ensure_resident("a").await.unwrap());
        drop(sched.ensure_resident("b").await.unwrap());
        sched.shutdown().await;

        assert_eq!(loader.unloads.load(Ordering::SeqCst), 2);
        assert!(sched.resident_units().is_empty());
        assert_eq!(
            sched.ensure_resident("a").await.unwrap_err(),
            SchedulerError::Shutdown
        );
    }
}
