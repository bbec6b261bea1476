//! One reconciliation pass over a template: resolve and authorize, validate,
//! plan with dry runs, then commit.

use std::sync::Arc;
use std::time::Instant;

use kubetemplater_apply::{
    create_or_patch, ensure_metadata, target_from_manifest, ApplyAction, ApplyError, DiffSummary, ObjectStore, TargetRef,
};
use kubetemplater_core::{priority, KubeTemplate, KubeTemplateStatus, ObjectKey, TemplatePhase};
use kubetemplater_policy::{check_target, CompiledPolicy, PolicyResolver, PolicyStats};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::status::StatusBuilder;
use crate::StatusSink;

/// Why a template is being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The template or its policy changed.
    Change,
    /// Periodic resync; terminal phases recorded for the current generation are kept.
    Resync,
}

impl Trigger {
    pub fn from_priority(p: i32) -> Self {
        if p <= priority::RESYNC { Trigger::Resync } else { Trigger::Change }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Succeeded,
    /// Refused by policy or validation. Not retried for this generation.
    Rejected(String),
    Failed { message: String, retryable: bool },
    /// A terminal phase is already recorded for this generation.
    Skipped,
}

impl ReconcileOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Succeeded => "succeeded",
            ReconcileOutcome::Rejected(_) => "rejected",
            ReconcileOutcome::Failed { retryable: true, .. } => "failed_retryable",
            ReconcileOutcome::Failed { retryable: false, .. } => "failed",
            ReconcileOutcome::Skipped => "skipped",
        }
    }
}

/// A target that passed authorization and validation.
#[derive(Debug)]
struct Target {
    index: usize,
    target: TargetRef,
    desired: Json,
    replace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Create,
    Patch,
    /// The dry run left the live object as it was; nothing to write.
    Unchanged,
    /// Delete then create; only planned when an in-place update hits an
    /// immutable field and the target allows replacement.
    Replace,
}

fn apply_failure(index: usize, target: &TargetRef, err: &ApplyError, replace: bool) -> String {
    match err {
        ApplyError::Immutable(_) if !replace => {
            format!("Failed to apply object {index} ({target}): {err}; set replace: true to delete and recreate it")
        }
        _ => format!("Failed to apply object {index} ({target}): {err}"),
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    policies: Arc<PolicyResolver>,
    stats: Arc<PolicyStats>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, policies: Arc<PolicyResolver>, stats: Arc<PolicyStats>) -> Self {
        Self { store, policies, stats }
    }

    pub fn policies(&self) -> &Arc<PolicyResolver> { &self.policies }

    pub fn stats(&self) -> &Arc<PolicyStats> { &self.stats }

    pub async fn reconcile(&self, template: &KubeTemplate, trigger: Trigger, sink: &dyn StatusSink) -> ReconcileOutcome {
        let key = ObjectKey::of(template);
        let generation = template.metadata.generation;
        if trigger == Trigger::Resync {
            if let Some(st) = &template.status {
                if st.phase.is_terminal() && st.observed_generation == generation {
                    debug!(template = %key, phase = %st.phase, "terminal phase recorded for this generation; skipping");
                    counter!("reconcile_total", 1u64, "outcome" => "skipped");
                    return ReconcileOutcome::Skipped;
                }
            }
        }

        let t0 = Instant::now();
        let mut builder = StatusBuilder::new(generation);
        let (outcome, status) = self.run(&key, template, &mut builder, sink).await;
        publish(sink, &key, &status).await;

        match &outcome {
            ReconcileOutcome::Succeeded => info!(template = %key, applied = status.applied_objects, "template applied"),
            ReconcileOutcome::Rejected(msg) => info!(template = %key, reason = %msg, "template rejected"),
            ReconcileOutcome::Failed { message, retryable } => warn!(template = %key, retryable, error = %message, "template failed"),
            ReconcileOutcome::Skipped => {}
        }
        counter!("reconcile_total", 1u64, "outcome" => outcome.label());
        histogram!("reconcile_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn run(
        &self,
        key: &ObjectKey,
        template: &KubeTemplate,
        builder: &mut StatusBuilder,
        sink: &dyn StatusSink,
    ) -> (ReconcileOutcome, KubeTemplateStatus) {
        publish(sink, key, &builder.build(TemplatePhase::Validating, "validating template objects")).await;

        let policy = match self.policies.resolve(&key.namespace) {
            Ok(p) => p,
            Err(e) => {
                let msg = e.to_string();
                return (ReconcileOutcome::Rejected(msg.clone()), builder.build(TemplatePhase::Rejected, msg));
            }
        };
        builder.policy(policy.key.to_string());

        let targets = self.validate(key, template, &policy, builder);
        self.stats.record(&policy.key, key, !builder.has_errors());
        self.publish_policy(sink, &policy).await;
        if builder.has_errors() {
            let status = builder.failure(TemplatePhase::Rejected);
            return (ReconcileOutcome::Rejected(status.status.clone()), status);
        }

        publish(sink, key, &builder.build(TemplatePhase::Applying, format!("applying {} object(s)", targets.len()))).await;

        let steps = match self.plan(&targets, builder).await {
            Ok(steps) => steps,
            Err(retryable) => {
                let status = builder.failure(TemplatePhase::Failed);
                return (ReconcileOutcome::Failed { message: status.status.clone(), retryable }, status);
            }
        };
        if let Err(retryable) = self.commit(&targets, &steps, builder).await {
            let status = builder.failure(TemplatePhase::Failed);
            return (ReconcileOutcome::Failed { message: status.status.clone(), retryable }, status);
        }
        let status = builder.build(TemplatePhase::Succeeded, format!("Applied {} object(s)", targets.len()));
        (ReconcileOutcome::Succeeded, status)
    }

    /// Authorize and validate every target. Errors land in `builder`; the
    /// pass is all-or-nothing so every target is still checked.
    fn validate(&self, key: &ObjectKey, template: &KubeTemplate, policy: &CompiledPolicy, builder: &mut StatusBuilder) -> Vec<Target> {
        let mut out = Vec::with_capacity(template.spec.templates.len());
        for (index, item) in template.spec.templates.iter().enumerate() {
            let target = match target_from_manifest(&item.object, Some(&key.namespace)) {
                Ok(t) => t,
                Err(e) => {
                    builder.error(index, None, format!("template object {index}: {e}"));
                    continue;
                }
            };
            let mut desired = item.object.clone();
            ensure_metadata(&mut desired, &target);
            let ns = target.namespace.clone().unwrap_or_default();
            match check_target(policy, &target.gvk, &ns, &desired) {
                Ok(_) => out.push(Target { index, target, desired, replace: item.replace }),
                Err(e) => {
                    debug!(template = %key, target = %target, error = %e, "target refused");
                    builder.error(index, Some(&target), e.to_string());
                }
            }
        }
        out
    }

    /// Dry-run every mutation. `Err(retryable)` when any target cannot be
    /// applied; nothing has been written at that point.
    async fn plan(&self, targets: &[Target], builder: &mut StatusBuilder) -> Result<Vec<Step>, bool> {
        let mut steps = Vec::with_capacity(targets.len());
        let mut retryable = true;
        for t in targets {
            match create_or_patch(self.store.as_ref(), &t.target, &t.desired, true).await {
                Ok(applied) => {
                    let DiffSummary { adds, updates, removes } = applied.summary;
                    debug!(target = %t.target, action = ?applied.action, adds, updates, removes, "planned");
                    steps.push(match applied.action {
                        _ if applied.is_noop() => Step::Unchanged,
                        ApplyAction::Created => Step::Create,
                        ApplyAction::Patched => Step::Patch,
                    });
                }
                Err(ApplyError::Immutable(msg)) if t.replace => {
                    debug!(target = %t.target, reason = %msg, "immutable change; planning replacement");
                    steps.push(Step::Replace);
                }
                Err(e) => {
                    retryable &= e.is_retryable();
                    builder.error(t.index, Some(&t.target), apply_failure(t.index, &t.target, &e, t.replace));
                }
            }
        }
        if builder.has_errors() { Err(retryable) } else { Ok(steps) }
    }

    /// Perform the planned writes in order, stopping at the first failure.
    async fn commit(&self, targets: &[Target], steps: &[Step], builder: &mut StatusBuilder) -> Result<(), bool> {
        for (t, step) in targets.iter().zip(steps) {
            let res = match step {
                Step::Replace => self.replace(t, builder).await,
                Step::Unchanged => Ok(()),
                Step::Create | Step::Patch => create_or_patch(self.store.as_ref(), &t.target, &t.desired, false).await.map(|_| ()),
            };
            if let Err(e) = res {
                builder.error(t.index, Some(&t.target), apply_failure(t.index, &t.target, &e, t.replace));
                return Err(e.is_retryable());
            }
            builder.applied();
        }
        Ok(())
    }

    async fn replace(&self, t: &Target, builder: &mut StatusBuilder) -> Result<(), ApplyError> {
        warn!(target = %t.target, "deleting and recreating object to change immutable fields");
        self.store.delete(&t.target, false).await?;
        self.store.create(&t.target, &t.desired, false).await?;
        counter!("reconcile_replacements_total", 1u64);
        builder.warning(format!(
            "{} was deleted and recreated to change immutable fields; cluster-assigned fields were reset",
            t.target
        ));
        Ok(())
    }

    async fn publish_policy(&self, sink: &dyn StatusSink, policy: &CompiledPolicy) {
        let snap = self.policies.snapshot();
        if let Some(entry) = snap.entries.get(&policy.key) {
            let status = self.stats.status_for(entry, &snap);
            if let Err(e) = sink.policy_status(&entry.key, &status).await {
                warn!(policy = %entry.key, error = %e, "policy status update failed");
            }
        }
    }
}

/// Best effort: a lost write is repaired by the next pass.
pub(crate) async fn publish(sink: &dyn StatusSink, key: &ObjectKey, status: &KubeTemplateStatus) {
    if let Err(e) = sink.template_status(key, status).await {
        warn!(template = %key, phase = %status.phase, error = %e, "status update failed");
    }
}
