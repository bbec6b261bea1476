//! kubetemplater reconcile: the template state machine (validate, plan,
//! commit), status aggregation and the queue-driven worker loop.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kubetemplater_core::{KubeTemplate, KubeTemplatePolicyStatus, KubeTemplateStatus, ObjectKey};

mod reconciler;
mod status;
mod worker;

pub use reconciler::{ReconcileOutcome, Reconciler, Trigger};
pub use status::{now_rfc3339, StatusBuilder};
pub use worker::{run_worker, WorkerContext};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("reading template {key}: {message}")]
    Source { key: String, message: String },
    #[error("writing status of {key}: {message}")]
    Status { key: String, message: String },
}

impl ReconcileError {
    pub fn source(key: &ObjectKey, err: impl std::fmt::Display) -> Self {
        ReconcileError::Source { key: key.to_string(), message: err.to_string() }
    }

    pub fn status(key: &ObjectKey, err: impl std::fmt::Display) -> Self {
        ReconcileError::Status { key: key.to_string(), message: err.to_string() }
    }
}

/// Reads templates by identity. `None` means the template is gone.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<KubeTemplate>, ReconcileError>;
}

/// Writes the status subresources of templates and policies.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn template_status(&self, key: &ObjectKey, status: &KubeTemplateStatus) -> Result<(), ReconcileError>;
    async fn policy_status(&self, key: &ObjectKey, status: &KubeTemplatePolicyStatus) -> Result<(), ReconcileError>;
}
