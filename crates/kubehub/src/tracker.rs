//! Known templates and the generation last enqueued for each.

use std::sync::{Mutex, PoisonError};

use kubetemplater_core::ObjectKey;
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct GenerationTracker {
    seen: Mutex<FxHashMap<ObjectKey, Option<i64>>>,
}

impl GenerationTracker {
    pub fn new() -> Self { Self::default() }

    /// Record `generation`; true when the template is new or its spec changed.
    /// Status-only writes keep the generation and return false.
    pub fn observe(&self, key: &ObjectKey, generation: Option<i64>) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        match seen.insert(key.clone(), generation) {
            Some(prev) => prev != generation,
            None => true,
        }
    }

    pub fn forget(&self, key: &ObjectKey) -> bool {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    /// Drop every key not in `keep`, e.g. after a watch relist. Returns the dropped keys.
    pub fn retain(&self, keep: impl Fn(&ObjectKey) -> bool) -> Vec<ObjectKey> {
        let mut dropped = Vec::new();
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).retain(|k, _| {
            let kept = keep(k);
            if !kept {
                dropped.push(k.clone());
            }
            kept
        });
        dropped.sort();
        dropped
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.seen.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn keys_in(&self, namespace: &str) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.seen.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
