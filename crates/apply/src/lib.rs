//! kubetemplater apply: the cluster object store seam, server-side apply with
//! dry runs, and classification of API errors into retryable and terminal.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use kubetemplater_core::Gvk;
use serde_json::Value as Json;

mod kube_store;
mod manifest;
#[cfg(any(test, feature = "testing"))]
mod memory;

pub use kube_store::KubeObjectStore;
pub use manifest::{
    diff_summary, ensure_metadata, parse_yaml_documents, parse_yaml_documents_with, strip_noisy, target_from_manifest, DiffSummary,
    YamlLimits,
};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryStore, Mutation};

/// Identity of one target object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    pub gvk: Gvk,
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("resource {0} is not served by the cluster")]
    UnknownKind(String),
    #[error("immutable field changed: {0}")]
    Immutable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by the API server: {0}")]
    Invalid(String),
    #[error("transient error: {0}")]
    Transient(String),
}

impl ApplyError {
    /// Retrying can succeed without the template changing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplyError::Conflict(_) | ApplyError::NotFound(_) | ApplyError::Transient(_) | ApplyError::UnknownKind(_)
        )
    }

    /// Classify an API status code and message.
    pub fn from_status(code: u16, message: &str) -> Self {
        let msg = message.to_string();
        match code {
            422 if message.to_ascii_lowercase().contains("immutable") => ApplyError::Immutable(msg),
            409 => ApplyError::Conflict(msg),
            404 => ApplyError::NotFound(msg),
            400..=499 if code != 429 => ApplyError::Invalid(msg),
            _ => ApplyError::Transient(msg),
        }
    }
}

impl From<kube::Error> for ApplyError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => ApplyError::from_status(resp.code, &resp.message),
            other => ApplyError::Transient(other.to_string()),
        }
    }
}

/// Create, patch and delete arbitrary objects. `dry_run` asks the backend to
/// validate and admit the mutation without persisting it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, target: &TargetRef) -> Result<Option<Json>, ApplyError>;
    async fn create(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError>;
    /// Server-side apply of `object` over the live object.
    async fn patch(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError>;
    /// Delete and, unless `dry_run`, wait until the object is gone.
    async fn delete(&self, target: &TargetRef, dry_run: bool) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Patched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub action: ApplyAction,
    /// The object the API server returned against the live object before the
    /// write, noisy fields stripped. All adds for a create.
    pub summary: DiffSummary,
}

impl Applied {
    /// A patch that leaves the live object as it was.
    pub fn is_noop(&self) -> bool { self.action == ApplyAction::Patched && self.summary.is_empty() }
}

/// Create the object when absent, otherwise server-side apply over it.
pub async fn create_or_patch(
    store: &dyn ObjectStore,
    target: &TargetRef,
    desired: &Json,
    dry_run: bool,
) -> Result<Applied, ApplyError> {
    let t0 = std::time::Instant::now();
    let result = match store.get(target).await? {
        None => store.create(target, desired, dry_run).await.map(|object| Applied {
            action: ApplyAction::Created,
            summary: diff_summary(&strip_noisy(object), &Json::Object(Default::default())),
        }),
        Some(live) => store.patch(target, desired, dry_run).await.map(|object| Applied {
            action: ApplyAction::Patched,
            summary: diff_summary(&strip_noisy(object), &strip_noisy(live)),
        }),
    };
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) if e.is_retryable() => "retryable",
        Err(_) => "terminal",
    };
    metrics::counter!("apply_total", 1u64, "outcome" => outcome, "dry_run" => if dry_run { "true" } else { "false" });
    if !dry_run {
        metrics::histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    }
    result
}
