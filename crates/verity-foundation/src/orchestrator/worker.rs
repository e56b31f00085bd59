//! Worker loop: one request at a time, end to end.

use std::sync::Arc;

use tracing::{Instrument, debug, info_span};

use super::OrchestratorInner;
use super::runner::{self, Outcome};

pub(super) async fn run(inner: Arc<OrchestratorInner>, worker_id: usize) {
    debug!(worker_id, "pipeline worker started");
    while let Some(request) = inner.queue.dequeue(&inner.shutdown).await {
        let id = request.id();
        let token = inner.token_for(id);
        let span = info_span!("pipeline", request_id = %id, worker_id, attempt = request.requeues());

        match runner::run(&inner, request, token).instrument(span).await {
            Outcome::Finished {
                request,
                status,
                reason,
                detail,
            } => inner.finish(request, status, reason, detail),
            Outcome::Requeue { request, detail } => inner.requeue(request, detail),
        }
    }
    debug!(worker_id, "pipeline worker stopped");
}
