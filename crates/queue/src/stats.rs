//! Queue observability context. Constructed by the caller and handed to
//! `WorkQueue::new`, so several queues (or tests) never share counters.

use std::sync::{PoisonError, RwLock};

use metrics::{counter, gauge};
use serde::Serialize;

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    /// Enqueue calls that hit an identity already queued or in flight.
    pub deduplicated: u64,
    pub dequeued: u64,
    pub retries: u64,
    pub cycles: u64,
    pub dropped: u64,
    pub depth: usize,
    pub processing: usize,
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    counters: RwLock<MetricsSnapshot>,
}

impl QueueMetrics {
    pub fn new() -> Self { Self::default() }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.counters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut c = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut c);
        gauge!("workqueue_depth", c.depth as f64);
        gauge!("workqueue_processing", c.processing as f64);
    }

    pub(crate) fn record_enqueue(&self, deduplicated: bool, depth: usize) {
        counter!("workqueue_enqueue_total", 1u64);
        if deduplicated {
            counter!("workqueue_dedup_total", 1u64);
        }
        self.update(|c| {
            c.enqueued += 1;
            if deduplicated {
                c.deduplicated += 1;
            }
            c.depth = depth;
        });
    }

    pub(crate) fn record_dequeue(&self, depth: usize, processing: usize) {
        counter!("workqueue_dequeue_total", 1u64);
        self.update(|c| {
            c.dequeued += 1;
            c.depth = depth;
            c.processing = processing;
        });
    }

    pub(crate) fn record_retry(&self, new_cycle: bool, depth: usize, processing: usize) {
        counter!("workqueue_retry_total", 1u64);
        if new_cycle {
            counter!("workqueue_cycle_total", 1u64);
        }
        self.update(|c| {
            c.retries += 1;
            if new_cycle {
                c.cycles += 1;
            }
            c.depth = depth;
            c.processing = processing;
        });
    }

    pub(crate) fn record_drop(&self, depth: usize, processing: usize) {
        counter!("workqueue_dropped_total", 1u64);
        self.update(|c| {
            c.dropped += 1;
            c.depth = depth;
            c.processing = processing;
        });
    }

    pub(crate) fn record_done(&self, depth: usize, processing: usize) {
        self.update(|c| {
            c.depth = depth;
            c.processing = processing;
        });
    }
}
