//! Policy Resolver: source namespace to governing policy, and kind/namespace
//! authorization against the policy's rules.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kubetemplater_core::{Gvk, KubeTemplatePolicy, ObjectKey, DEFAULT_POLICY_NAMESPACE};
use tracing::{debug, info, warn};

use crate::cel::CelEngine;
use crate::compile::{CompiledPolicy, CompiledRule, ConfigError};

/// Environment knob naming the control namespace policies are read from.
pub const POLICY_NAMESPACE_ENV: &str = "KT_POLICY_NAMESPACE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No KubeTemplatePolicy found for source namespace {namespace}")]
    NotFound { namespace: String },
    #[error("multiple KubeTemplatePolicies govern source namespace {namespace}: {}", .policies.join(", "))]
    Ambiguous { namespace: String, policies: Vec<String> },
    #[error("KubeTemplatePolicy {policy} is invalid: {error}")]
    Invalid { policy: String, error: ConfigError },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("resource {gvk} is not allowed by policy {policy}")]
    KindNotAllowed { policy: String, gvk: String },
    #[error("no target namespaces defined for resource {kind}")]
    NoTargetNamespaces { kind: String },
    #[error("{namespace} is not an allowed target for resource {kind} (allowed: [{}])", .allowed.join(", "))]
    NamespaceNotAllowed { namespace: String, kind: String, allowed: Vec<String> },
}

impl CompiledPolicy {
    /// First rule whose group/version/kind matches wins; rules for the same
    /// kind are never merged.
    pub fn authorize(&self, gvk: &Gvk, target_namespace: &str) -> Result<&CompiledRule, AuthzError> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.gvk == *gvk)
            .ok_or_else(|| AuthzError::KindNotAllowed { policy: self.key.to_string(), gvk: gvk.to_string() })?;
        if rule.target_namespaces.is_empty() {
            return Err(AuthzError::NoTargetNamespaces { kind: gvk.kind.clone() });
        }
        if !rule.target_namespaces.iter().any(|n| n == target_namespace) {
            return Err(AuthzError::NamespaceNotAllowed {
                namespace: target_namespace.to_string(),
                kind: gvk.kind.clone(),
                allowed: rule.target_namespaces.clone(),
            });
        }
        Ok(rule)
    }
}

/// One indexed policy. Policies that failed compilation stay indexed so the
/// templates they govern are rejected with the configuration error.
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub key: ObjectKey,
    pub source_namespace: String,
    pub generation: Option<i64>,
    pub compiled: Result<Arc<CompiledPolicy>, ConfigError>,
}

impl PolicyEntry {
    pub fn is_active(&self) -> bool { self.compiled.is_ok() }
}

/// Immutable snapshot swapped whole on every policy change.
#[derive(Debug, Clone, Default)]
pub struct PolicyIndex {
    pub epoch: u64,
    pub entries: BTreeMap<ObjectKey, PolicyEntry>,
}

impl PolicyIndex {
    /// Entries claiming `namespace`, in key order.
    pub fn governing<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a PolicyEntry> + 'a {
        self.entries.values().filter(move |e| e.source_namespace == namespace)
    }

    pub fn resolve(&self, namespace: &str) -> Result<Arc<CompiledPolicy>, ResolveError> {
        let mut matches = self.governing(namespace);
        let first = matches.next().ok_or_else(|| ResolveError::NotFound { namespace: namespace.to_string() })?;
        let rest: Vec<_> = matches.collect();
        if !rest.is_empty() {
            let policies = std::iter::once(first).chain(rest).map(|e| e.key.to_string()).collect();
            return Err(ResolveError::Ambiguous { namespace: namespace.to_string(), policies });
        }
        match &first.compiled {
            Ok(p) => Ok(Arc::clone(p)),
            Err(error) => Err(ResolveError::Invalid { policy: first.key.to_string(), error: error.clone() }),
        }
    }
}

/// Lock-free reads for workers; the policy watcher swaps whole snapshots.
pub struct PolicyResolver {
    control_namespace: String,
    index: ArcSwap<PolicyIndex>,
    cel: Arc<dyn CelEngine>,
}

impl PolicyResolver {
    pub fn new(control_namespace: impl Into<String>, cel: Arc<dyn CelEngine>) -> Self {
        Self { control_namespace: control_namespace.into(), index: ArcSwap::from_pointee(PolicyIndex::default()), cel }
    }

    /// Control namespace from `KT_POLICY_NAMESPACE`, falling back to the default.
    pub fn from_env(cel: Arc<dyn CelEngine>) -> Self {
        let ns = std::env::var(POLICY_NAMESPACE_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_POLICY_NAMESPACE.to_string());
        Self::new(ns, cel)
    }

    pub fn control_namespace(&self) -> &str { &self.control_namespace }

    /// Compile and index a policy. Returns the entry when the policy lives in
    /// the control namespace, `None` when it was ignored.
    pub fn upsert(&self, policy: &KubeTemplatePolicy) -> Option<PolicyEntry> {
        let key = ObjectKey::of(policy);
        if key.namespace != self.control_namespace {
            debug!(policy = %key, control = %self.control_namespace, "ignoring policy outside control namespace");
            return None;
        }
        let compiled = CompiledPolicy::compile(policy, self.cel.as_ref()).map(Arc::new);
        match &compiled {
            Ok(p) => info!(policy = %key, source = %p.source_namespace, rules = p.rules.len(), "policy indexed"),
            Err(e) => warn!(policy = %key, error = %e, "policy failed to compile; marking inactive"),
        }
        let entry = PolicyEntry {
            key: key.clone(),
            source_namespace: policy.spec.source_namespace.trim().to_string(),
            generation: policy.metadata.generation,
            compiled,
        };
        let stored = entry.clone();
        self.index.rcu(move |cur| {
            let mut next = PolicyIndex::clone(cur);
            next.epoch = next.epoch.saturating_add(1);
            next.entries.insert(key.clone(), stored.clone());
            next
        });
        Some(entry)
    }

    /// Drop a policy; returns the removed entry if it was indexed.
    pub fn remove(&self, key: &ObjectKey) -> Option<PolicyEntry> {
        let current = self.index.load();
        let removed = current.entries.get(key).cloned()?;
        self.index.rcu(|cur| {
            let mut next = PolicyIndex::clone(cur);
            if next.entries.remove(key).is_some() {
                next.epoch = next.epoch.saturating_add(1);
            }
            next
        });
        info!(policy = %key, source = %removed.source_namespace, "policy removed");
        Some(removed)
    }

    pub fn resolve(&self, source_namespace: &str) -> Result<Arc<CompiledPolicy>, ResolveError> {
        self.index.load().resolve(source_namespace)
    }

    pub fn snapshot(&self) -> Arc<PolicyIndex> { self.index.load_full() }

    pub fn is_active(&self, key: &ObjectKey) -> bool {
        self.index.load().entries.get(key).is_some_and(PolicyEntry::is_active)
    }
}
