//! # Session Buffer
//!
//! Absorbs the timing mismatch between audio-chunk arrival and forwarding
//! throughput for one session, under an explicit overload policy. The buffer
//! is the only place a forwarding worker may suspend: `dequeue` parks until a
//! chunk arrives or the buffer is closed.
//!
//! ## Backpressure Policies:
//! - **Unbounded**: every chunk accepted, queue grows without bound
//! - **DropNewest(c)**: at capacity `c`, the incoming chunk is discarded
//!   (prefer history)
//! - **DropOldest(c)**: at capacity `c`, the oldest queued chunk is evicted
//!   before appending (prefer freshness — stale audio is the least useful in
//!   a live transcription stream)
//!
//! ## Thread Safety:
//! A mutex-guarded `VecDeque` plus `tokio::sync::Notify` gives the classic
//! wait/notify discipline in async form: producers never block, and any number
//! of workers can call `dequeue` concurrently without double-delivery.

use crate::error::AppError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Overload policy for a session's chunk queue, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// No capacity limit; nothing is ever dropped.
    Unbounded,
    /// At capacity, discard the incoming chunk.
    DropNewest(usize),
    /// At capacity, evict the oldest queued chunk, then append.
    DropOldest(usize),
}

impl BufferPolicy {
    /// Parse the wire-level policy name + capacity from a `start` frame.
    ///
    /// A bounded policy with a zero capacity is rejected rather than silently
    /// reinterpreted as unbounded: a client asking for a bound and providing
    /// none is misconfigured.
    pub fn from_wire(name: &str, queue_capacity: usize) -> Result<Self, AppError> {
        match name {
            "UNBOUNDED" => Ok(BufferPolicy::Unbounded),
            "BOUNDED_DROP_NEWEST" | "BOUNDED_DROP_OLDEST" => {
                if queue_capacity == 0 {
                    return Err(AppError::ConfigInvalid(format!(
                        "Buffer policy {} requires a positive queueCapacity",
                        name
                    )));
                }
                if name == "BOUNDED_DROP_NEWEST" {
                    Ok(BufferPolicy::DropNewest(queue_capacity))
                } else {
                    Ok(BufferPolicy::DropOldest(queue_capacity))
                }
            }
            other => Err(AppError::ConfigInvalid(format!(
                "Unknown buffer policy: {}",
                other
            ))),
        }
    }
}

/// FIFO chunk queue for one session, with drop accounting.
///
/// ## Counters:
/// `chunks_enqueued` counts every enqueue attempt against a live buffer;
/// `chunks_dropped` counts every chunk discarded by a bounded policy. The
/// drop rate the client sees is `dropped / enqueued`.
pub struct SessionBuffer {
    policy: BufferPolicy,
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    closed: AtomicBool,
    chunks_enqueued: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl SessionBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        let initial_capacity = match policy {
            BufferPolicy::Unbounded => 64,
            BufferPolicy::DropNewest(c) | BufferPolicy::DropOldest(c) => c,
        };
        Self {
            policy,
            queue: Mutex::new(VecDeque::with_capacity(initial_capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            chunks_enqueued: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Append one chunk without ever blocking the producer.
    ///
    /// After `close()` this is a silent no-op (chunks may legitimately race a
    /// teardown); counters do not move for closed buffers.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.chunks_enqueued.fetch_add(1, Ordering::Relaxed);

        {
            let mut queue = self.queue.lock().unwrap();
            match self.policy {
                BufferPolicy::Unbounded => queue.push_back(chunk),
                BufferPolicy::DropNewest(capacity) => {
                    if queue.len() >= capacity {
                        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    queue.push_back(chunk);
                }
                BufferPolicy::DropOldest(capacity) => {
                    if queue.len() >= capacity {
                        queue.pop_front();
                        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queue.push_back(chunk);
                }
            }
        }

        self.notify.notify_one();
    }

    /// Remove the oldest pending chunk, suspending while the queue is empty.
    ///
    /// Returns `None` once the buffer is closed and drained of nothing more to
    /// deliver — the worker's signal to exit. Safe for any number of
    /// concurrent callers; each chunk is delivered exactly once.
    pub async fn dequeue(&self) -> Option<Vec<u8>> {
        loop {
            // Register interest before checking the queue, so an enqueue that
            // lands between the check and the await still wakes us.
            let notified = self.notify.notified();

            if let Some(chunk) = self.queue.lock().unwrap().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Close the buffer and wake every parked worker. Idempotent. Pending
    /// chunks that were never dequeued are simply discarded with the buffer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of chunks currently waiting to be forwarded.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks_enqueued(&self) -> u64 {
        self.chunks_enqueued.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }

    /// Fraction of enqueued chunks discarded by the policy, 0.0 before any
    /// chunk has been enqueued.
    pub fn drop_rate(&self) -> f64 {
        let enqueued = self.chunks_enqueued();
        if enqueued == 0 {
            return 0.0;
        }
        self.chunks_dropped() as f64 / enqueued as f64
    }
}
