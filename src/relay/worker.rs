//! # Forwarding Worker Pool
//!
//! Drains a session's buffer concurrently and pushes chunks into the
//! streaming bridge. Each session gets its own fixed set of workers; they are
//! parallel and independent, so chunk order is preserved per worker but not
//! across the pool — an accepted throughput trade-off for raw audio.
//!
//! The very first chunk forwarded by *any* worker triggers the one-shot
//! "forwarding started" milestone. An atomic swap arbitrates the race, so the
//! event fires exactly once no matter how many workers contend.

use crate::recognizer::bridge::BridgeHandle;
use crate::relay::buffer::SessionBuffer;
use crate::telemetry::TelemetryEmitter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The forwarding loops of one session.
///
/// Workers exit on their own when the buffer is closed (dequeue returns
/// `None`) or the bridge goes dead, so teardown never waits on them.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `worker_count` forwarding loops (always at least one).
    pub fn spawn(
        worker_count: usize,
        buffer: Arc<SessionBuffer>,
        bridge: BridgeHandle,
        telemetry: TelemetryEmitter,
    ) -> Self {
        let first_forward = Arc::new(AtomicBool::new(false));
        let count = worker_count.max(1);

        let workers = (0..count)
            .map(|worker_index| {
                let buffer = buffer.clone();
                let bridge = bridge.clone();
                let telemetry = telemetry.clone();
                let first_forward = first_forward.clone();

                tokio::spawn(async move {
                    while let Some(chunk) = buffer.dequeue().await {
                        if bridge.is_closed() {
                            // Dead or finished bridge: stop forwarding silently.
                            break;
                        }
                        if !first_forward.swap(true, Ordering::AcqRel) {
                            telemetry.forwarding_started();
                        }
                        // A failed send is swallowed here; the loop keeps
                        // draining so one hiccup never kills the stream.
                        bridge.send(chunk);
                    }
                    debug!(worker_index, "Forwarding worker stopped");
                })
            })
            .collect();

        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers normally exit via buffer close; aborting here only matters
        // if a session is dropped without teardown.
        for worker in &self.workers {
            worker.abort();
        }
    }
}
