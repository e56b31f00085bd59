//! Result delivery channel.
//!
//! Decouples the pipeline from a possibly slow [`ResultDelivery`] sink.
//! Workers push into a bounded in-memory buffer and never wait on the sink;
//! a pump task forwards items in order. When the buffer is over capacity the
//! oldest *progress* event is dropped. Final envelopes are never dropped and
//! do not count against the capacity. A sink that reports `Failed` for a
//! final envelope gets it again, up to three attempts in all; after that, or
//! on `Closed`, the envelope is logged as lost and counted in `sink_errors`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use verity_kernel::config::DeliveryConfig;
use verity_kernel::delivery::{DeliveryError, ResultDelivery};
use verity_kernel::envelope::{FinalEnvelope, ProgressEvent};

/// Attempts per final envelope, the first one included.
const DELIVER_ATTEMPTS: u32 = 3;
/// Pause before the second attempt; grows linearly after that.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Item travelling from the pipeline to the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Progress(ProgressEvent),
    Final(FinalEnvelope),
}

#[derive(Debug, Default)]
struct Buffer {
    items: VecDeque<Outbound>,
    progress_len: usize,
    closed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub progress_published: u64,
    pub progress_dropped: u64,
    pub envelopes_delivered: u64,
    pub sink_errors: u64,
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct Counters {
    progress_published: AtomicU64,
    progress_dropped: AtomicU64,
    envelopes_delivered: AtomicU64,
    sink_errors: AtomicU64,
}

struct Shared {
    capacity: usize,
    buffer: Mutex<Buffer>,
    notify: Notify,
    counters: Counters,
}

impl Shared {
    fn push(&self, item: Outbound) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return false;
        }
        if matches!(item, Outbound::Progress(_)) {
            if buffer.progress_len >= self.capacity {
                let oldest = buffer
                    .items
                    .iter()
                    .position(|i| matches!(i, Outbound::Progress(_)));
                if let Some(idx) = oldest {
                    buffer.items.remove(idx);
                    buffer.progress_len -= 1;
                    self.counters.progress_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            if self.capacity == 0 {
                self.counters.progress_dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            buffer.progress_len += 1;
        }
        buffer.items.push_back(item);
        drop(buffer);
        self.notify.notify_one();
        true
    }

    /// Next item, or `None` once closed and drained.
    async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            {
                let mut buffer = self.buffer.lock();
                if let Some(item) = buffer.items.pop_front() {
                    if matches!(item, Outbound::Progress(_)) {
                        buffer.progress_len -= 1;
                    }
                    return Some(item);
                }
                if buffer.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Non-blocking front end used by the orchestrator.
#[derive(Clone)]
pub struct DeliveryChannel {
    shared: Arc<Shared>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DeliveryChannel {
    /// Starts the pump forwarding into `sink`.
    pub fn start(config: &DeliveryConfig, sink: Arc<dyn ResultDelivery>) -> Self {
        let shared = Arc::new(Shared {
            capacity: config.progress_buffer,
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
            counters: Counters::default(),
        });

        let pump = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(item) = shared.pop().await {
                    let result = match item {
                        Outbound::Progress(event) => sink.publish(event).await,
                        Outbound::Final(envelope) => {
                            let id = envelope.request_id;
                            let result = deliver_with_retry(sink.as_ref(), envelope).await;
                            match &result {
                                Ok(()) => {
                                    shared
                                        .counters
                                        .envelopes_delivered
                                        .fetch_add(1, Ordering::Relaxed);
                                    debug!(request_id = %id, "envelope delivered");
                                }
                                Err(e) => error!(request_id = %id, error = %e, "final envelope lost"),
                            }
                            result
                        }
                    };
                    if let Err(e) = result {
                        shared.counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "delivery sink error");
                    }
                }
                debug!("delivery pump stopped");
            })
        };

        Self {
            shared,
            pump: Arc::new(Mutex::new(Some(pump))),
        }
    }

    /// Queues a progress event; may displace the oldest buffered one.
    pub fn publish(&self, event: ProgressEvent) {
        if self.shared.push(Outbound::Progress(event)) {
            self.shared
                .counters
                .progress_published
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queues a terminal envelope. Fails only after [`close`](Self::close).
    pub fn deliver(&self, envelope: FinalEnvelope) -> Result<(), DeliveryError> {
        if self.shared.push(Outbound::Final(envelope)) {
            Ok(())
        } else {
            Err(DeliveryError::Closed)
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.shared.counters;
        DeliveryStats {
            progress_published: c.progress_published.load(Ordering::Relaxed),
            progress_dropped: c.progress_dropped.load(Ordering::Relaxed),
            envelopes_delivered: c.envelopes_delivered.load(Ordering::Relaxed),
            sink_errors: c.sink_errors.load(Ordering::Relaxed),
            buffered: self.shared.buffer.lock().items.len(),
        }
    }

    /// Stops accepting items. Already buffered items are still forwarded.
    pub fn close(&self) {
        self.shared.buffer.lock().closed = true;
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }

    /// Closes the channel and waits until everything buffered reached the sink.
    pub async fn flush_and_close(&self) {
        self.close();
        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

async fn deliver_with_retry(
    sink: &dyn ResultDelivery,
    envelope: FinalEnvelope,
) -> Result<(), DeliveryError> {
    let mut attempt = 1;
    loop {
        match sink.deliver(envelope.clone()).await {
            Err(DeliveryError::Failed(reason)) if attempt < DELIVER_ATTEMPTS => {
                warn!(request_id = %envelope.request_id, attempt, %reason, "sink refused final envelope, retrying");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Sink that forwards everything into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultDelivery for ChannelSink {
    async fn publish(&self, event: ProgressEvent) -> Result<(), DeliveryError> {
        self.tx
            .send(Outbound::Progress(event))
            .map_err(|_| DeliveryError::Closed)
    }

    async fn deliver(&self, envelope: FinalEnvelope) -> Result<(), DeliveryError> {
        self.tx
            .send(Outbound::Final(envelope))
            .map_err(|_| DeliveryError::Closed)
    }
}
