//! Offline policy check: the validation half of a reconcile pass, without a cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use kubetemplater_apply::{ensure_metadata, parse_yaml_documents, target_from_manifest};
use kubetemplater_core::{KubeTemplate, KubeTemplatePolicy, ObjectKey};
use kubetemplater_policy::{check_target, CelEngine, PolicyResolver};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Verdict {
    pub template: String,
    pub index: usize,
    pub target: Option<String>,
    pub allowed: bool,
    pub message: String,
}

/// Verdicts for every object of every template in `template_yaml`, judged by
/// the policies in `policy_yaml`. Policies without a namespace are placed in
/// `control_namespace`.
pub fn check(policy_yaml: &str, template_yaml: &str, control_namespace: &str, cel: Arc<dyn CelEngine>) -> Result<Vec<Verdict>> {
    let resolver = PolicyResolver::new(control_namespace, cel);
    for doc in parse_yaml_documents(policy_yaml).context("parsing policy file")? {
        let mut policy: KubeTemplatePolicy = serde_json::from_value(doc).context("decoding KubeTemplatePolicy")?;
        if policy.metadata.namespace.is_none() {
            policy.metadata.namespace = Some(control_namespace.to_string());
        }
        resolver.upsert(&policy);
    }

    let mut out = Vec::new();
    for doc in parse_yaml_documents(template_yaml).context("parsing template file")? {
        let template: KubeTemplate = serde_json::from_value(doc).context("decoding KubeTemplate")?;
        let key = ObjectKey::of(&template);
        if key.namespace.is_empty() {
            let message = "template has no metadata.namespace; its namespace selects the governing policy".to_string();
            out.push(Verdict { template: key.name, index: 0, target: None, allowed: false, message });
            continue;
        }
        let policy = match resolver.resolve(&key.namespace) {
            Ok(p) => p,
            Err(e) => {
                out.push(Verdict { template: key.to_string(), index: 0, target: None, allowed: false, message: e.to_string() });
                continue;
            }
        };
        for (index, item) in template.spec.templates.iter().enumerate() {
            let target = match target_from_manifest(&item.object, Some(&key.namespace)) {
                Ok(t) => t,
                Err(e) => {
                    out.push(Verdict { template: key.to_string(), index, target: None, allowed: false, message: e.to_string() });
                    continue;
                }
            };
            let mut desired = item.object.clone();
            ensure_metadata(&mut desired, &target);
            let ns = target.namespace.clone().unwrap_or_default();
            let (allowed, message) = match check_target(&policy, &target.gvk, &ns, &desired) {
                Ok(_) => (true, format!("allowed by {}", policy.key)),
                Err(e) => (false, e.to_string()),
            };
            out.push(Verdict { template: key.to_string(), index, target: Some(target.to_string()), allowed, message });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetemplater_policy::DisabledCel;

    const POLICY: &str = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplatePolicy
metadata:
  name: app-policy
spec:
  sourceNamespace: app
  validationRules:
    - version: v1
      kind: ConfigMap
      targetNamespaces: [app]
      fieldValidations:
        - name: has-mode
          fieldPath: data.mode
          type: required
"#;

    const TEMPLATES: &str = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplate
metadata:
  name: web
  namespace: app
spec:
  templates:
    - object:
        apiVersion: v1
        kind: ConfigMap
        metadata: {name: ok}
        data: {mode: prod}
    - object:
        apiVersion: v1
        kind: ConfigMap
        metadata: {name: empty}
        data: {mode: ""}
    - object:
        apiVersion: v1
        kind: Secret
        metadata: {name: creds}
---
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplate
metadata:
  name: stray
  namespace: elsewhere
spec:
  templates: []
"#;

    #[test]
    fn verdicts_per_object() {
        let v = check(POLICY, TEMPLATES, "kubetemplater-system", Arc::new(DisabledCel)).unwrap();
        assert_eq!(v.len(), 4);
        assert!(v[0].allowed, "{v:?}");
        assert_eq!(v[0].message, "allowed by kubetemplater-system/app-policy");
        assert!(!v[1].allowed);
        assert_eq!(v[1].message, "data.mode failed validation rule: has-mode (value is required)");
        assert!(!v[2].allowed);
        assert_eq!(v[3].template, "elsewhere/stray");
        assert!(v[3].message.contains("No KubeTemplatePolicy found"));
    }

    #[test]
    fn templates_without_a_namespace_are_rejected() {
        let templates = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplate
metadata:
  name: loose
spec:
  templates:
    - object: {apiVersion: v1, kind: ConfigMap, metadata: {name: ok}, data: {mode: prod}}
"#;
        let v = check(POLICY, templates, "kubetemplater-system", Arc::new(DisabledCel)).unwrap();
        assert_eq!(v.len(), 1);
        assert!(!v[0].allowed);
        assert_eq!(v[0].template, "loose");
        assert!(v[0].message.contains("no metadata.namespace"), "{}", v[0].message);
    }

    #[test]
    fn bad_policy_yaml_is_an_error() {
        assert!(check("kind: [", TEMPLATES, "ns", Arc::new(DisabledCel)).is_err());
    }

    #[cfg(feature = "cel")]
    #[test]
    fn cel_rules_evaluate_with_the_default_engine() {
        let policy = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplatePolicy
metadata:
  name: app-policy
spec:
  sourceNamespace: app
  validationRules:
    - version: v1
      kind: ConfigMap
      rule: "object.kind == 'ConfigMap'"
      targetNamespaces: [app]
      fieldValidations:
        - name: is-prod
          fieldPath: data.mode
          type: cel
          cel: "value == 'prod'"
"#;
        let v = check(policy, TEMPLATES, "kubetemplater-system", kubetemplater_policy::default_engine()).unwrap();
        assert!(v[0].allowed, "{v:?}");
        assert!(!v[1].allowed);
        assert!(v[1].message.contains("is-prod"), "{}", v[1].message);
    }
}
