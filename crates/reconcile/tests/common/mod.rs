#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kubetemplater_apply::{MemoryStore, TargetRef};
use kubetemplater_core::{
    Gvk, KubeTemplate, KubeTemplatePolicy, KubeTemplatePolicyStatus, KubeTemplateSpec, KubeTemplateStatus, ObjectKey,
    TemplateObject, TemplatePhase,
};
use kubetemplater_policy::{DisabledCel, PolicyResolver, PolicyStats};
use kubetemplater_reconcile::{ReconcileError, Reconciler, StatusSink, TemplateSource};
use serde_json::Value as Json;

pub const APP_NS: &str = "app-namespace";

pub const POLICY: &str = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplatePolicy
metadata:
  name: app-policy
  namespace: kubetemplater-system
spec:
  sourceNamespace: app-namespace
  validationRules:
    - version: v1
      kind: ConfigMap
      targetNamespaces: [app-namespace]
      fieldValidations:
        - name: has-mode
          fieldPath: data.mode
          type: required
    - version: v1
      kind: Secret
      targetNamespaces: []
    - version: v1
      kind: Service
      targetNamespaces: [app-namespace]
"#;

#[derive(Default)]
pub struct RecordingSink {
    pub templates: Mutex<Vec<(ObjectKey, KubeTemplateStatus)>>,
    pub policies: Mutex<Vec<(ObjectKey, KubeTemplatePolicyStatus)>>,
}

impl RecordingSink {
    pub fn phases(&self) -> Vec<TemplatePhase> {
        self.templates.lock().unwrap().iter().map(|(_, s)| s.phase).collect()
    }

    pub fn last(&self) -> Option<KubeTemplateStatus> {
        self.templates.lock().unwrap().last().map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn template_status(&self, key: &ObjectKey, status: &KubeTemplateStatus) -> Result<(), ReconcileError> {
        self.templates.lock().unwrap().push((key.clone(), status.clone()));
        Ok(())
    }

    async fn policy_status(&self, key: &ObjectKey, status: &KubeTemplatePolicyStatus) -> Result<(), ReconcileError> {
        self.policies.lock().unwrap().push((key.clone(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MapSource {
    pub templates: Mutex<BTreeMap<ObjectKey, KubeTemplate>>,
}

impl MapSource {
    pub fn put(&self, t: KubeTemplate) {
        self.templates.lock().unwrap().insert(ObjectKey::of(&t), t);
    }
}

#[async_trait]
impl TemplateSource for MapSource {
    async fn get(&self, key: &ObjectKey) -> Result<Option<KubeTemplate>, ReconcileError> {
        Ok(self.templates.lock().unwrap().get(key).cloned())
    }
}

pub fn resolver(with_policy: bool) -> Arc<PolicyResolver> {
    let r = PolicyResolver::new("kubetemplater-system", Arc::new(DisabledCel));
    if with_policy {
        let p: KubeTemplatePolicy = serde_yaml::from_str(POLICY).unwrap();
        r.upsert(&p).unwrap();
    }
    Arc::new(r)
}

pub fn reconciler(store: Arc<MemoryStore>, with_policy: bool) -> Reconciler {
    Reconciler::new(store, resolver(with_policy), Arc::new(PolicyStats::new()))
}

pub fn template(name: &str, objects: Vec<(Json, bool)>) -> KubeTemplate {
    let mut t = KubeTemplate::new(
        name,
        KubeTemplateSpec {
            templates: objects.into_iter().map(|(object, replace)| TemplateObject { object, replace }).collect(),
        },
    );
    t.metadata.namespace = Some(APP_NS.into());
    t.metadata.generation = Some(1);
    t
}

pub fn configmap(name: &str, ns: Option<&str>, mode: &str) -> Json {
    let mut v = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name },
        "data": { "mode": mode }
    });
    if let Some(ns) = ns {
        v["metadata"]["namespace"] = Json::String(ns.into());
    }
    v
}

pub fn service(name: &str, cluster_ip: Option<&str>) -> Json {
    let mut v = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name },
        "spec": { "ports": [{ "port": 80 }] }
    });
    if let Some(ip) = cluster_ip {
        v["spec"]["clusterIP"] = Json::String(ip.into());
    }
    v
}

pub fn target(kind: &str, name: &str) -> TargetRef {
    TargetRef { gvk: Gvk::new("", "v1", kind), namespace: Some(APP_NS.into()), name: name.into() }
}
