//! Verity kernel: contracts and value types for the verification cascade.
//!
//! Concrete components (scheduler, queue, breakers, cache, orchestrator)
//! live in `verity-foundation`; this crate only defines what they exchange
//! and the collaborator traits they call.

// config module
pub mod config;

// error module
pub mod error;

// stage contract
pub mod stage;
pub use stage::*;

// model units
pub mod model;
pub use model::*;

// requests and envelopes
pub mod envelope;
pub mod request;
pub use envelope::*;
pub use request::*;

// resources
pub mod resource;
pub use resource::*;

// delivery
pub mod delivery;
pub use delivery::*;

pub use error::{KernelError, KernelResult, QueueError, RegistryError, SchedulerError};
