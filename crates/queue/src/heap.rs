//! Binary heap of work items with a key -> slot index, so lookups and
//! priority raises by key stay O(log n).

use kubetemplater_core::ObjectKey;
use rustc_hash::FxHashMap;

use crate::WorkItem;

/// Returns true when `a` must be served before `b`.
pub(crate) type Order = fn(&WorkItem, &WorkItem) -> bool;

/// Ready items: priority descending, then earliest readiness, then FIFO.
pub(crate) fn ready_order(a: &WorkItem, b: &WorkItem) -> bool {
    (b.priority, a.ready_at, a.seq) < (a.priority, b.ready_at, b.seq)
}

/// Delayed items: earliest readiness, then priority descending, then FIFO.
pub(crate) fn delay_order(a: &WorkItem, b: &WorkItem) -> bool {
    (a.ready_at, b.priority, a.seq) < (b.ready_at, a.priority, b.seq)
}

pub(crate) struct IndexedHeap {
    items: Vec<WorkItem>,
    index: FxHashMap<ObjectKey, usize>,
    before: Order,
}

impl IndexedHeap {
    pub(crate) fn new(before: Order) -> Self {
        Self { items: Vec::new(), index: FxHashMap::default(), before }
    }

    pub(crate) fn len(&self) -> usize { self.items.len() }
    pub(crate) fn is_empty(&self) -> bool { self.items.is_empty() }
    pub(crate) fn contains(&self, key: &ObjectKey) -> bool { self.index.contains_key(key) }
    pub(crate) fn peek(&self) -> Option<&WorkItem> { self.items.first() }

    pub(crate) fn get(&self, key: &ObjectKey) -> Option<&WorkItem> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    /// Insert an item whose key is not present yet.
    pub(crate) fn push(&mut self, item: WorkItem) {
        debug_assert!(!self.index.contains_key(&item.key), "duplicate key {}", item.key);
        let pos = self.items.len();
        self.index.insert(item.key.clone(), pos);
        self.items.push(item);
        self.sift_up(pos);
    }

    pub(crate) fn pop(&mut self) -> Option<WorkItem> {
        if self.items.is_empty() {
            return None;
        }
        self.take(0)
    }

    /// Raise the priority of `key` if `priority` is strictly greater.
    /// Returns `None` when the key is absent, `Some(changed)` otherwise.
    pub(crate) fn raise_priority(&mut self, key: &ObjectKey, priority: i32) -> Option<bool> {
        let pos = *self.index.get(key)?;
        if priority <= self.items[pos].priority {
            return Some(false);
        }
        self.items[pos].priority = priority;
        let pos = self.sift_up(pos);
        self.sift_down(pos);
        Some(true)
    }

    fn take(&mut self, pos: usize) -> Option<WorkItem> {
        let last = self.items.len().checked_sub(1)?;
        self.swap(pos, last);
        let item = self.items.pop()?;
        self.index.remove(&item.key);
        if pos < self.items.len() {
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(item)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.items.swap(a, b);
        self.index.insert(self.items[a].key.clone(), a);
        self.index.insert(self.items[b].key.clone(), b);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !(self.before)(&self.items[pos], &self.items[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < len && (self.before)(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < len && (self.before)(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == pos {
                return;
            }
            self.swap(pos, best);
            pos = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    fn item(name: &str, priority: i32, delay_ms: u64, seq: u64, base: Instant) -> WorkItem {
        WorkItem {
            key: ObjectKey::new("ns", name),
            priority,
            retries: 0,
            cycles: 0,
            enqueued_at: base,
            ready_at: base + Duration::from_millis(delay_ms),
            seq,
        }
    }

    fn drain(heap: &mut IndexedHeap) -> Vec<String> {
        std::iter::from_fn(|| heap.pop()).map(|i| i.key.name).collect()
    }

    #[test]
    fn ready_order_prefers_priority_then_readiness() {
        let base = Instant::now();
        let mut heap = IndexedHeap::new(ready_order);
        heap.push(item("low", 1, 0, 0, base));
        heap.push(item("high-late", 9, 20, 1, base));
        heap.push(item("high-early", 9, 10, 2, base));
        heap.push(item("mid", 5, 0, 3, base));
        assert_eq!(drain(&mut heap), vec!["high-early", "high-late", "mid", "low"]);
    }

    #[test]
    fn raise_priority_reorders_and_ignores_lower_values() {
        let base = Instant::now();
        let mut heap = IndexedHeap::new(ready_order);
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            heap.push(item(name, i as i32, 0, i as u64, base));
        }
        let d = ObjectKey::new("ns", "d");
        assert_eq!(heap.raise_priority(&ObjectKey::new("ns", "a"), 10), Some(true));
        assert_eq!(heap.raise_priority(&d, 1), Some(false));
        assert_eq!(heap.raise_priority(&ObjectKey::new("ns", "zz"), 1), None);
        assert_eq!(heap.get(&d).map(|i| i.priority), Some(3));
        assert_eq!(drain(&mut heap), vec!["a", "e", "d", "c", "b"]);
    }

    #[test]
    fn delay_order_drains_by_readiness_and_keeps_index_consistent() {
        let base = Instant::now();
        let mut heap = IndexedHeap::new(delay_order);
        for i in 0..16u64 {
            heap.push(item(&format!("i{i}"), (i % 3) as i32, 100 - i, i, base));
        }
        assert!(heap.raise_priority(&ObjectKey::new("ns", "i7"), 9).is_some());
        assert_eq!(heap.len(), 16);
        let mut last = base;
        while let Some(next) = heap.pop() {
            assert!(next.ready_at >= last);
            last = next.ready_at;
            assert!(!heap.contains(&next.key));
        }
        assert!(heap.is_empty());
    }
}
