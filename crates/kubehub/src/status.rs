//! Template source and status writers backed by the API server.

use anyhow::Context;
use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use kubetemplater_core::{KubeTemplate, KubeTemplatePolicy, KubeTemplatePolicyStatus, KubeTemplateStatus, ObjectKey, FIELD_MANAGER};
use kubetemplater_reconcile::{ReconcileError, StatusSink, TemplateSource};
use serde_json::{json, Value as Json};

/// Merge patch body replacing the whole status. Fields the status omits are
/// cleared explicitly; a merge patch would otherwise keep stale values.
pub fn template_status_patch(status: &KubeTemplateStatus) -> anyhow::Result<Json> {
    let mut v = serde_json::to_value(status).context("serializing template status")?;
    if let Some(obj) = v.as_object_mut() {
        for list in ["errors", "warnings"] {
            obj.entry(list).or_insert_with(|| json!([]));
        }
        for opt in ["policy", "observedGeneration", "lastReconcileTime"] {
            obj.entry(opt).or_insert(Json::Null);
        }
    }
    Ok(json!({ "status": v }))
}

pub fn policy_status_patch(status: &KubeTemplatePolicyStatus) -> anyhow::Result<Json> {
    let mut v = serde_json::to_value(status).context("serializing policy status")?;
    if let Some(obj) = v.as_object_mut() {
        for opt in ["message", "lastValidationTime"] {
            obj.entry(opt).or_insert(Json::Null);
        }
    }
    Ok(json!({ "status": v }))
}

pub struct KubeTemplateSource {
    client: Client,
}

impl KubeTemplateSource {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl TemplateSource for KubeTemplateSource {
    async fn get(&self, key: &ObjectKey) -> Result<Option<KubeTemplate>, ReconcileError> {
        let api: Api<KubeTemplate> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(|e| ReconcileError::source(key, e))
    }
}

pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self { Self { client } }

    async fn patch_template(&self, key: &ObjectKey, status: &KubeTemplateStatus) -> anyhow::Result<()> {
        let api: Api<KubeTemplate> = Api::namespaced(self.client.clone(), &key.namespace);
        let body = template_status_patch(status)?;
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.patch_status(&key.name, &pp, &Patch::Merge(&body))
            .await
            .with_context(|| format!("patching status of KubeTemplate {key}"))?;
        Ok(())
    }

    async fn patch_policy(&self, key: &ObjectKey, status: &KubeTemplatePolicyStatus) -> anyhow::Result<()> {
        let api: Api<KubeTemplatePolicy> = Api::namespaced(self.client.clone(), &key.namespace);
        let body = policy_status_patch(status)?;
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.patch_status(&key.name, &pp, &Patch::Merge(&body))
            .await
            .with_context(|| format!("patching status of KubeTemplatePolicy {key}"))?;
        Ok(())
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn template_status(&self, key: &ObjectKey, status: &KubeTemplateStatus) -> Result<(), ReconcileError> {
        metrics::counter!("status_writes_total", 1u64, "kind" => "KubeTemplate");
        self.patch_template(key, status).await.map_err(|e| ReconcileError::status(key, format!("{e:#}")))
    }

    async fn policy_status(&self, key: &ObjectKey, status: &KubeTemplatePolicyStatus) -> Result<(), ReconcileError> {
        metrics::counter!("status_writes_total", 1u64, "kind" => "KubeTemplatePolicy");
        self.patch_policy(key, status).await.map_err(|e| ReconcileError::status(key, format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetemplater_core::TemplatePhase;

    #[test]
    fn template_patch_clears_omitted_fields() {
        let status = KubeTemplateStatus { phase: TemplatePhase::Succeeded, status: "Applied 1 object(s)".into(), applied_objects: 1, ..Default::default() };
        let patch = template_status_patch(&status).unwrap();
        let s = &patch["status"];
        assert_eq!(s["phase"], "Succeeded");
        assert_eq!(s["appliedObjects"], 1);
        assert_eq!(s["errors"], json!([]));
        assert_eq!(s["warnings"], json!([]));
        assert!(s["policy"].is_null() && s.get("policy").is_some());
        assert!(s.get("lastReconcileTime").is_some());
    }

    #[test]
    fn policy_patch_keeps_counters() {
        let status = KubeTemplatePolicyStatus { active: true, validation_successes: 3, ..Default::default() };
        let patch = policy_status_patch(&status).unwrap();
        assert_eq!(patch["status"]["validationSuccesses"], 3);
        assert_eq!(patch["status"]["active"], true);
        assert!(patch["status"].get("message").is_some());
    }
}
