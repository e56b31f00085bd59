//! Circuit Breaker Manager
//!
//! Per-stage failure isolation for the cascade. Every stage owns an
//! independent breaker:
//!
//! ```text
//!     +---------+   N consecutive failures   +--------+
//!     | CLOSED  | -------------------------> |  OPEN  |
//!     +---------+                            +--------+
//!          ^                                     |
//!          | probe succeeds                      | cooldown elapsed
//!          |                                     v
//!          |                              +-------------+
//!          +----------------------------- |  HALF-OPEN  |
//!                                         +-------------+
//!                                                |
//!                      probe fails (cooldown restarts) -> OPEN
//! ```
//!
//! While half-open exactly one probe call is admitted; everything else is
//! rejected until that probe reports back.
//!
//! # Usage
//!
//! ```rust,ignore
//! use verity_foundation::circuit_breaker::{Admission, CircuitBreakerManager};
//!
//! let breakers = CircuitBreakerManager::default();
//! match breakers.try_admit(StageId::Investigate) {
//!     Admission::Rejected => { /* fail fast */ }
//!     _ => match run_stage().await {
//!         Ok(_) => breakers.record_success(StageId::Investigate),
//!         Err(_) => breakers.record_failure(StageId::Investigate),
//!     },
//! }
//! ```

pub mod config;
pub mod manager;
pub mod metrics;
pub mod state;

pub use config::CircuitBreakerConfig;
pub use manager::{CircuitBreakerManager, CircuitStatus};
pub use metrics::{CircuitBreakerMetrics, StateTransition};
pub use state::{Admission, CircuitBreaker, State};
