//! Status aggregation for one reconciliation pass.

use chrono::{SecondsFormat, Utc};
use kubetemplater_apply::TargetRef;
use kubetemplater_core::{KubeTemplateStatus, TargetError, TemplatePhase};

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Collects per-target errors and warnings; the first error's message
/// becomes the status line.
#[derive(Debug, Clone, Default)]
pub struct StatusBuilder {
    generation: Option<i64>,
    policy: Option<String>,
    errors: Vec<TargetError>,
    warnings: Vec<String>,
    applied: u32,
}

impl StatusBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self { generation, ..Default::default() }
    }

    pub fn policy(&mut self, policy: impl Into<String>) -> &mut Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn error(&mut self, index: usize, target: Option<&TargetRef>, message: impl Into<String>) -> &mut Self {
        self.errors.push(TargetError {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            kind: target.map(|t| t.gvk.kind.clone()).unwrap_or_default(),
            name: target.map(|t| t.name.clone()).unwrap_or_default(),
            namespace: target.and_then(|t| t.namespace.clone()).unwrap_or_default(),
            message: message.into(),
        });
        self
    }

    pub fn warning(&mut self, message: impl Into<String>) -> &mut Self {
        self.warnings.push(message.into());
        self
    }

    pub fn applied(&mut self) -> &mut Self {
        self.applied += 1;
        self
    }

    pub fn has_errors(&self) -> bool { !self.errors.is_empty() }

    pub fn first_error(&self) -> Option<&str> { self.errors.first().map(|e| e.message.as_str()) }

    /// Snapshot with an explicit phase and status line.
    pub fn build(&self, phase: TemplatePhase, status: impl Into<String>) -> KubeTemplateStatus {
        KubeTemplateStatus {
            phase,
            status: status.into(),
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            applied_objects: self.applied,
            policy: self.policy.clone(),
            observed_generation: self.generation,
            last_reconcile_time: Some(now_rfc3339()),
        }
    }

    /// `phase` with the first error as the status line.
    pub fn failure(&self, phase: TemplatePhase) -> KubeTemplateStatus {
        let line = self.first_error().unwrap_or("reconciliation failed").to_string();
        self.build(phase, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetemplater_core::Gvk;

    #[test]
    fn first_error_becomes_the_status_line() {
        let t = TargetRef { gvk: Gvk::new("", "v1", "ConfigMap"), namespace: Some("ns".into()), name: "c".into() };
        let mut b = StatusBuilder::new(Some(4));
        b.policy("sys/p").error(1, Some(&t), "first").error(2, None, "second").warning("w");
        let s = b.failure(TemplatePhase::Rejected);
        assert_eq!(s.status, "first");
        assert_eq!(s.errors.len(), 2);
        assert_eq!(s.errors[0].kind, "ConfigMap");
        assert_eq!(s.errors[0].namespace, "ns");
        assert_eq!(s.errors[1].name, "");
        assert_eq!(s.observed_generation, Some(4));
        assert_eq!(s.policy.as_deref(), Some("sys/p"));
        assert_eq!(s.warnings, vec!["w".to_string()]);
    }

    #[test]
    fn success_counts_applied_objects() {
        let mut b = StatusBuilder::new(None);
        b.applied().applied();
        let s = b.build(TemplatePhase::Succeeded, "Applied 2 object(s)");
        assert_eq!(s.applied_objects, 2);
        assert!(s.errors.is_empty());
        assert!(s.last_reconcile_time.is_some());
    }
}
