//! Per-policy validation counters feeding `KubeTemplatePolicyStatus`.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use kubetemplater_core::{KubeTemplatePolicyStatus, ObjectKey};
use metrics::counter;
use rustc_hash::FxHashMap;

use crate::resolver::{PolicyEntry, PolicyIndex, ResolveError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyCounters {
    pub successes: u64,
    pub failures: u64,
    pub governed: BTreeSet<ObjectKey>,
    pub last_validation: Option<DateTime<Utc>>,
}

/// Shared registry; workers record one outcome per validation pass.
#[derive(Debug, Default)]
pub struct PolicyStats {
    inner: Mutex<FxHashMap<ObjectKey, PolicyCounters>>,
}

impl PolicyStats {
    pub fn new() -> Self { Self::default() }

    /// Record one template pass against `policy`.
    pub fn record(&self, policy: &ObjectKey, template: &ObjectKey, passed: bool) {
        let now = Utc::now();
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let c = map.entry(policy.clone()).or_default();
        if passed {
            c.successes += 1;
        } else {
            c.failures += 1;
        }
        c.governed.insert(template.clone());
        c.last_validation = Some(now);
        drop(map);
        let outcome = if passed { "success" } else { "failure" };
        counter!("policy_validation_total", 1u64, "policy" => policy.to_string(), "outcome" => outcome);
    }

    /// A template was deleted; it no longer counts as governed.
    pub fn forget_template(&self, template: &ObjectKey) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for c in map.values_mut() {
            c.governed.remove(template);
        }
    }

    pub fn forget_policy(&self, policy: &ObjectKey) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(policy);
    }

    pub fn get(&self, policy: &ObjectKey) -> PolicyCounters {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(policy).cloned().unwrap_or_default()
    }

    /// Status for an indexed policy: active flag from compilation and
    /// ambiguity within `index`, counters from this registry.
    pub fn status_for(&self, entry: &PolicyEntry, index: &PolicyIndex) -> KubeTemplatePolicyStatus {
        let c = self.get(&entry.key);
        let (active, message) = match (&entry.compiled, index.resolve(&entry.source_namespace)) {
            (Err(e), _) => (false, Some(e.to_string())),
            (Ok(_), Err(e @ ResolveError::Ambiguous { .. })) => (false, Some(e.to_string())),
            (Ok(p), _) => (true, Some(format!("governing namespace {} with {} rule(s)", p.source_namespace, p.rules.len()))),
        };
        KubeTemplatePolicyStatus {
            active,
            message,
            governed_templates: u32::try_from(c.governed.len()).unwrap_or(u32::MAX),
            validation_successes: c.successes,
            validation_failures: c.failures,
            last_validation_time: c.last_validation.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}
