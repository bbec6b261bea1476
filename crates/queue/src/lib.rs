//! kubetemplater work queue: priority scheduling with per-identity
//! deduplication, delayed retries with exponential backoff, and bounded
//! retry cycles.
//!
//! Items live in one of two index-tracking heaps: `ready` (priority
//! descending, earliest readiness first) and `delayed` (earliest readiness
//! first). Consumers move due items from `delayed` to `ready` on every wake,
//! so a cooling-down item never blocks work that is ready now.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kubetemplater_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod heap;
mod stats;

use heap::{delay_order, ready_order, IndexedHeap};
pub use stats::{MetricsSnapshot, QueueMetrics};

/// Upper bound on the backoff exponent; larger retry counts clamp to it.
const MAX_BACKOFF_SHIFT: u32 = 31;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Retries allowed within one cycle before a cooldown starts.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for the exponential backoff, also used as the cooldown between cycles.
    pub max_delay: Duration,
    /// Cycles before an item is dropped. 0 = unlimited.
    pub max_cycles: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            max_cycles: 3,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `KT_QUEUE_MAX_RETRIES`, `KT_QUEUE_INITIAL_DELAY_MS`,
    /// `KT_QUEUE_MAX_DELAY_MS` and `KT_QUEUE_MAX_CYCLES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_retries: env_u64("KT_QUEUE_MAX_RETRIES").map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(d.max_retries),
            initial_delay: env_u64("KT_QUEUE_INITIAL_DELAY_MS").map(Duration::from_millis).unwrap_or(d.initial_delay),
            max_delay: env_u64("KT_QUEUE_MAX_DELAY_MS").map(Duration::from_millis).unwrap_or(d.max_delay),
            max_cycles: env_u64("KT_QUEUE_MAX_CYCLES").map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(d.max_cycles),
        }
    }

    /// Delay before retry number `retries` (1-based) within a cycle:
    /// `initial_delay * 2^(retries-1)`, capped at `max_delay`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let shift = retries.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        match self.initial_delay.checked_mul(1u32 << shift) {
            Some(d) => d.min(self.max_delay),
            None => self.max_delay,
        }
    }
}

/// One scheduled unit of reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ObjectKey,
    pub priority: i32,
    /// Retries in the current cycle.
    pub retries: u32,
    /// Completed retry cycles.
    pub cycles: u32,
    pub enqueued_at: Instant,
    pub ready_at: Instant,
    seq: u64,
}

/// What `requeue` did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Re-inserted, ready again after `delay`.
    Scheduled { delay: Duration, retries: u32, cycles: u32 },
    /// Cycle cap reached; the item is gone. The owner must be marked paused.
    Dropped { cycles: u32 },
    /// The queue is shut down; nothing was re-inserted.
    Closed,
}

struct State {
    ready: IndexedHeap,
    delayed: IndexedHeap,
    /// Identities handed out by `dequeue` and not yet finished.
    processing: FxHashSet<ObjectKey>,
    /// Enqueues that arrived while their identity was processing.
    dirty: FxHashMap<ObjectKey, i32>,
    closed: bool,
    seq: u64,
}

impl State {
    fn depth(&self) -> usize { self.ready.len() + self.delayed.len() }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn fresh_item(&mut self, key: ObjectKey, priority: i32, now: Instant) -> WorkItem {
        WorkItem { key, priority, retries: 0, cycles: 0, enqueued_at: now, ready_at: now, seq: self.next_seq() }
    }

    fn insert(&mut self, item: WorkItem, now: Instant) {
        if item.ready_at <= now { self.ready.push(item) } else { self.delayed.push(item) }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|i| i.ready_at <= now) {
            if let Some(item) = self.delayed.pop() {
                self.ready.push(item);
            }
        }
    }
}

/// Thread-safe priority work queue shared by watchers (producers) and
/// reconcile workers (consumers).
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig, metrics: Arc<QueueMetrics>) -> Self {
        info!(
            max_retries = config.max_retries,
            initial_delay_ms = config.initial_delay.as_millis() as u64,
            max_delay_ms = config.max_delay.as_millis() as u64,
            max_cycles = config.max_cycles,
            "work queue created"
        );
        Self {
            state: Mutex::new(State {
                ready: IndexedHeap::new(ready_order),
                delayed: IndexedHeap::new(delay_order),
                processing: FxHashSet::default(),
                dirty: FxHashMap::default(),
                closed: false,
                seq: 0,
            }),
            notify: Notify::new(),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &QueueConfig { &self.config }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `key`, or raise its priority if it is already queued. Returns false
    /// once the queue is shut down.
    pub fn enqueue(&self, key: ObjectKey, priority: i32) -> bool {
        let now = Instant::now();
        let mut st = self.lock();
        if st.closed {
            return false;
        }
        let deduplicated = if st.processing.contains(&key) {
            let slot = st.dirty.entry(key.clone()).or_insert(priority);
            *slot = (*slot).max(priority);
            debug!(key = %key, priority, "enqueue while processing; deferred");
            true
        } else if let Some(raised) = st.ready.raise_priority(&key, priority).or_else(|| st.delayed.raise_priority(&key, priority)) {
            debug!(key = %key, priority, raised, "enqueue deduplicated");
            true
        } else {
            let item = st.fresh_item(key, priority, now);
            debug!(key = %item.key, priority, "enqueued");
            st.ready.push(item);
            false
        };
        self.metrics.record_enqueue(deduplicated, st.depth());
        drop(st);
        self.notify.notify_one();
        true
    }

    /// Wait for the highest-ranked ready item. Returns `None` once the queue
    /// is shut down.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wake between the check and the wait is lost.
            notified.as_mut().enable();

            let next_due = {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                let now = Instant::now();
                st.promote_due(now);
                if let Some(item) = st.ready.pop() {
                    st.processing.insert(item.key.clone());
                    let more = !st.ready.is_empty();
                    self.metrics.record_dequeue(st.depth(), st.processing.len());
                    drop(st);
                    if more {
                        // Pass the baton: another consumer may be parked on work that is ready.
                        self.notify.notify_one();
                    }
                    debug!(key = %item.key, priority = item.priority, retries = item.retries, "dequeued");
                    return Some(item);
                }
                st.delayed.peek().map(|i| i.ready_at)
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Schedule a failed item for another attempt with backoff, start a new
    /// cycle after a cooldown when the per-cycle budget is spent, or drop the
    /// item when the cycle cap is reached.
    pub fn requeue(&self, mut item: WorkItem, cause: &str) -> RequeueOutcome {
        let now = Instant::now();
        let mut st = self.lock();
        st.processing.remove(&item.key);
        let dirty = st.dirty.remove(&item.key);
        if st.closed {
            return RequeueOutcome::Closed;
        }

        item.retries = item.retries.saturating_add(1);
        let mut new_cycle = false;
        let delay = if item.retries > self.config.max_retries {
            if self.config.max_cycles > 0 && item.cycles >= self.config.max_cycles {
                warn!(key = %item.key, cycles = item.cycles, cause, "retry cycles exhausted; dropping work item");
                if let Some(priority) = dirty {
                    // A newer event arrived while this attempt ran; it starts over.
                    let fresh = st.fresh_item(item.key.clone(), priority, now);
                    st.ready.push(fresh);
                }
                self.metrics.record_drop(st.depth(), st.processing.len());
                let requeued = dirty.is_some();
                drop(st);
                if requeued {
                    self.notify.notify_one();
                }
                return RequeueOutcome::Dropped { cycles: item.cycles };
            }
            item.cycles += 1;
            item.retries = 0;
            new_cycle = true;
            self.config.max_delay
        } else {
            self.config.backoff(item.retries)
        };

        if let Some(priority) = dirty {
            item.priority = item.priority.max(priority);
        }
        item.ready_at = now + delay;
        item.seq = st.next_seq();
        let outcome = RequeueOutcome::Scheduled { delay, retries: item.retries, cycles: item.cycles };
        if new_cycle {
            warn!(key = %item.key, cycle = item.cycles, cooldown_ms = delay.as_millis() as u64, cause, "retry budget spent; cooling down");
        } else {
            debug!(key = %item.key, retries = item.retries, delay_ms = delay.as_millis() as u64, cause, "requeued");
        }
        st.insert(item, now);
        self.metrics.record_retry(new_cycle, st.depth(), st.processing.len());
        drop(st);
        self.notify.notify_one();
        outcome
    }

    /// Mark a dequeued item finished. Calling it twice is harmless.
    pub fn done(&self, item: &WorkItem) {
        let now = Instant::now();
        let mut st = self.lock();
        if !st.processing.remove(&item.key) {
            return;
        }
        let mut requeued = false;
        if let Some(priority) = st.dirty.remove(&item.key) {
            if !st.closed {
                let fresh = st.fresh_item(item.key.clone(), priority, now);
                st.ready.push(fresh);
                requeued = true;
            }
        }
        self.metrics.record_done(st.depth(), st.processing.len());
        drop(st);
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Close the queue and release every parked consumer.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            info!(depth = st.depth(), processing = st.processing.len(), "work queue shutting down");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().closed }

    /// Items waiting in the queue (ready or delayed), excluding in-flight work.
    pub fn len(&self) -> usize { self.lock().depth() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        let st = self.lock();
        st.ready.contains(key) || st.delayed.contains(key)
    }

    pub fn is_processing(&self, key: &ObjectKey) -> bool { self.lock().processing.contains(key) }

    /// Priority of a queued item, if present.
    pub fn priority_of(&self, key: &ObjectKey) -> Option<i32> {
        let st = self.lock();
        st.ready.get(key).or_else(|| st.delayed.get(key)).map(|i| i.priority)
    }

    pub fn metrics(&self) -> MetricsSnapshot { self.metrics.snapshot() }
}
