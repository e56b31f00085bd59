//! Crate-level error types for `verity-kernel`.
//!
//! Each component returns its own typed error on hot paths so callers can
//! match cheaply. [`KernelError`] composes them via `#[from]` for startup
//! boundaries, where [`error_stack::Report`] carries the attached context.
//!
//! # Usage
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use verity_kernel::error::{KernelError, KernelResult};
//!
//! fn boot(path: &str) -> KernelResult<CascadeConfig> {
//!     CascadeConfig::load(path)
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach(format!("loading {path}"))
//! }
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::delivery::DeliveryError;
use crate::model::LoadError;
use crate::request::RequestError;
use crate::resource::ProbeError;
use crate::stage::StageError;

/// Model registry errors. All of them are startup-fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("model unit not found: {0}")]
    NotFound(String),

    #[error("model unit already registered: {0}")]
    Duplicate(String),

    #[error("model unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("invalid model unit {unit}: {reason}")]
    Invalid { unit: String, reason: String },
}

/// Model scheduler errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("unknown model unit: {0}")]
    UnknownUnit(String),

    /// Every resident unit is referenced; nothing can be evicted to make room.
    #[error("resources exhausted loading {unit}: need {required_mb} MB, {available_mb} MB available")]
    ResourceExhausted {
        unit: String,
        required_mb: u64,
        available_mb: u64,
    },

    #[error("model load failed for {unit}: {message}")]
    ModelLoad { unit: String, message: String },

    #[error("scheduler is shutting down")]
    Shutdown,
}

impl SchedulerError {
    /// Transient errors are worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::ResourceExhausted { .. })
    }
}

/// Request queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueError {
    /// Admission rejected; the caller should retry later.
    #[error("queue full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("queue closed")]
    Closed,

    #[error("request {0} is already queued")]
    Duplicate(Uuid),
}

/// Crate-level error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Loader error: {0}")]
    Load(#[from] LoadError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
