//! Result delivery contract.

use async_trait::async_trait;

use crate::envelope::{FinalEnvelope, ProgressEvent};

/// Errors reported by a delivery sink.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeliveryError {
    #[error("delivery sink closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// External sink that receives progress events and terminal envelopes.
///
/// `deliver` is called exactly once per request. `publish` may be skipped
/// when the progress buffer overflows.
#[async_trait]
pub trait ResultDelivery: Send + Sync {
    async fn publish(&self, event: ProgressEvent) -> Result<(), DeliveryError>;

    async fn deliver(&self, envelope: FinalEnvelope) -> Result<(), DeliveryError>;
}
