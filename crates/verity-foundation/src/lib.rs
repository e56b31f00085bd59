//! Verity foundation: the orchestration core of the verification cascade.

// monitor module - device memory sampling and pressure levels
pub mod monitor;

// registry module - catalog of loadable model units
pub mod registry;

// scheduler module - resident set under the memory budget
pub mod scheduler;

// queue module - bounded priority admission
pub mod queue;

// Circuit breaker module - per-stage failure isolation
pub mod circuit_breaker;

// cache module - semantic stage-result cache
pub mod cache;

// delivery module - buffered hand-off to the result sink
pub mod delivery;

// orchestrator module - stage cascade and worker pool
pub mod orchestrator;

pub use cache::{CacheHit, CacheStats, SemanticCache};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitStatus, State,
};
pub use delivery::{ChannelSink, DeliveryChannel, DeliveryStats, Outbound};
pub use monitor::{ResourceMonitor, ScriptedProbe, SysinfoProbe};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorBuilder, PipelineStats, StageExecutors};
pub use queue::{QueueStats, RequestQueue};
pub use registry::ModelRegistry;
pub use scheduler::{ModelScheduler, ResidentInfo, SchedulerStats, UnitHandle};
