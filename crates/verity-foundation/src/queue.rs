//! Request Queue
//!
//! Bounded admission queue in front of the worker pool. Requests are
//! dequeued highest priority first, FIFO within a priority. A full queue
//! rejects immediately with [`QueueError::Full`] instead of blocking the
//! caller.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use verity_kernel::config::QueueConfig;
use verity_kernel::error::QueueError;
use verity_kernel::request::{PipelineRequest, Priority};

/// Queued request with its admission order.
#[derive(Debug)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    request: PipelineRequest,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            // BinaryHeap is a max-heap: the earlier sequence number wins.
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueueEntry>,
    ids: HashSet<Uuid>,
    next_seq: u64,
    closed: bool,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub accepted: u64,
    pub rejected: u64,
    pub dequeued: u64,
    pub cancelled: u64,
    pub size: usize,
    pub capacity: usize,
}

pub struct RequestQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    accepted: AtomicU64,
    rejected: AtomicU64,
    dequeued: AtomicU64,
    cancelled: AtomicU64,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits `request`. Fails with `Full` when at capacity, `Closed` after [`close`](Self::close)
    /// and `Duplicate` when a request with the same id is already waiting.
    pub fn enqueue(&self, request: PipelineRequest) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.ids.contains(&request.id()) {
                return Err(QueueError::Duplicate(request.id()));
            }
            if inner.heap.len() >= self.capacity {
                drop(inner);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request.id(), capacity = self.capacity, "queue full");
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.ids.insert(request.id());
            inner.heap.push(QueueEntry {
                priority: request.priority(),
                seq,
                enqueued_at: Instant::now(),
                request,
            });
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<PipelineRequest> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.heap.pop()?;
            inner.ids.remove(&entry.request.id());
            entry
        };
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = %entry.request.id(),
            waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
            "dequeued request"
        );
        Some(entry.request)
    }

    /// Waits for the next request. Returns `None` when `cancel` fires or the
    /// queue is closed and drained.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<PipelineRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.try_dequeue() {
                // Pass the wakeup on in case more work is waiting.
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return Some(request);
            }
            if self.inner.lock().closed {
                return None;
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Removes a waiting request. Requests already dequeued are not affected.
    pub fn cancel(&self, id: Uuid) -> Option<PipelineRequest> {
        let mut inner = self.inner.lock();
        if !inner.ids.remove(&id) {
            return None;
        }
        let entries = std::mem::take(&mut inner.heap).into_vec();
        let mut found = None;
        for entry in entries {
            if found.is_none() && entry.request.id() == id {
                found = Some(entry.request);
            } else {
                inner.heap.push(entry);
            }
        }
        drop(inner);
        if found.is_some() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().ids.contains(&id)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Stops admission and wakes every waiting consumer. Requests already
    /// queued can still be drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Empties the queue, returning what was waiting in dequeue order.
    pub fn drain(&self) -> Vec<PipelineRequest> {
        let mut inner = self.inner.lock();
        inner.ids.clear();
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            drained.push(entry.request);
        }
        drained
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            size: self.size(),
            capacity: self.capacity,
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn req(payload: &str, priority: Priority) -> PipelineRequest {
        PipelineRequest::new(payload, priority)
    }

    #[test]
    fn priority_then_fifo() {
        let queue = RequestQueue::new(10);
        queue.enqueue(req("n1", Priority::Normal)).unwrap();
        queue.enqueue(req("l1", Priority::Low)).unwrap();
        queue.enqueue(req("c1", Priority::Critical)).unwrap();
        queue.enqueue(req("n2", Priority::Normal)).unwrap();
        queue.enqueue(req("h1", Priority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|r| r.payload().to_string())
            .collect();
        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn full_queue_rejects_without_growing() {
        let queue = RequestQueue::new(2);
        queue.enqueue(req("a", Priority::Normal)).unwrap();
        queue.enqueue(req("b", Priority::Normal)).unwrap();

        let err = queue.enqueue(req("c", Priority::Critical)).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 2 });
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.stats().accepted, 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let queue = RequestQueue::new(4);
        let request = req("a", Priority::Normal);
        queue.enqueue(request.clone()).unwrap();
        assert_eq!(
            queue.enqueue(request.clone()),
            Err(QueueError::Duplicate(request.id()))
        );
    }

    #[test]
    fn cancel_removes_only_the_target() {
        let queue = RequestQueue::new(4);
        let keep = req("keep", Priority::Normal);
        let drop_me = req("drop", Priority::Normal);
        let drop_id = drop_me.id();
        queue.enqueue(keep.clone()).unwrap();
        queue.enqueue(drop_me).unwrap();

        let cancelled = queue.cancel(drop_id).unwrap();
        assert_eq!(cancelled.payload(), "drop");
        assert!(queue.cancel(drop_id).is_none());
        assert!(!queue.contains(drop_id));
        assert!(queue.contains(keep.id()));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_work() {
        let queue = Arc::new(RequestQueue::new(4));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(req("late", Priority::Low)).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.payload(), "late");
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_cancel_or_close() {
        let queue = Arc::new(RequestQueue::new(4));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.is_none());

        let live = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(&live).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(
            queue.enqueue(req("x", Priority::Normal)),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn closed_queue_still_drains() {
        let queue = RequestQueue::new(4);
        queue.enqueue(req("a", Priority::Low)).unwrap();
        queue.enqueue(req("b", Priority::High)).unwrap();
        queue.close();

        let drained: Vec<_> = queue.drain().into_iter().map(|r| r.payload().to_string()).collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(queue.is_empty());
    }
}
