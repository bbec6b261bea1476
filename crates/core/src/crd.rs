//! KubeTemplate and KubeTemplatePolicy custom resources.

use std::fmt;

use kube::CustomResource;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A template listing the objects to materialize from its namespace.
///
/// ```yaml
/// apiVersion: kubetemplater.io/v1alpha1
/// kind: KubeTemplate
/// metadata:
///   name: web
///   namespace: app-namespace
/// spec:
///   templates:
///     - object:
///         apiVersion: v1
///         kind: ConfigMap
///         metadata: { name: web-config }
///         data: { mode: prod }
///     - replace: true
///       object:
///         apiVersion: v1
///         kind: Service
///         metadata: { name: web }
///         spec: { ports: [{ port: 80 }] }
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubetemplater.io",
    version = "v1alpha1",
    kind = "KubeTemplate",
    namespaced,
    status = "KubeTemplateStatus",
    shortname = "kt",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplateSpec {
    /// Objects to create or update, applied in order.
    #[serde(default)]
    pub templates: Vec<TemplateObject>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateObject {
    /// Full object manifest (apiVersion, kind, metadata, ...).
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub object: serde_json::Value,

    /// Delete and recreate the object when an in-place update would touch an
    /// immutable field. Destructive: cluster-assigned fields are reallocated.
    #[serde(default)]
    pub replace: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TemplatePhase {
    #[default]
    Pending,
    Validating,
    Applying,
    Succeeded,
    Rejected,
    Failed,
    Paused,
}

impl TemplatePhase {
    /// Phases that are not retried for the generation that produced them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TemplatePhase::Rejected | TemplatePhase::Paused)
    }
}

impl fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TemplatePhase::Pending => "Pending",
            TemplatePhase::Validating => "Validating",
            TemplatePhase::Applying => "Applying",
            TemplatePhase::Succeeded => "Succeeded",
            TemplatePhase::Rejected => "Rejected",
            TemplatePhase::Failed => "Failed",
            TemplatePhase::Paused => "Paused",
        };
        f.write_str(s)
    }
}

/// Outcome of the last reconciliation pass. Overwritten on every pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplateStatus {
    #[serde(default)]
    pub phase: TemplatePhase,

    /// Human-readable outcome; the first failure message on Rejected/Failed.
    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TargetError>,

    /// Notices the user should see, e.g. destructive replacements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub applied_objects: u32,

    /// Policy that governed the pass, as `namespace/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetError {
    /// Position of the target in `spec.templates`.
    pub index: u32,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub message: String,
}

/// Policy governing which objects templates in one source namespace may create.
///
/// Only policies in the controller's policy namespace are honored, and at most
/// one may govern a given source namespace.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubetemplater.io",
    version = "v1alpha1",
    kind = "KubeTemplatePolicy",
    namespaced,
    status = "KubeTemplatePolicyStatus",
    shortname = "ktp",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourceNamespace"}"#,
    printcolumn = r#"{"name":"Active","type":"boolean","jsonPath":".status.active"}"#,
    printcolumn = r#"{"name":"Templates","type":"integer","jsonPath":".status.governedTemplates"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplatePolicySpec {
    pub source_namespace: String,

    /// First rule matching a target's group/version/kind wins.
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,

    /// Deprecated whole-object CEL expression (variable `object`). Evaluated
    /// before `fieldValidations` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// Message reported when `rule` fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// All must pass; evaluation stops at the first failure.
    #[serde(default)]
    pub field_validations: Vec<FieldValidation>,

    /// Namespaces this kind may be created in. Empty forbids the kind.
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    Cel,
    Regex,
    Range,
    Required,
    Forbidden,
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationType::Cel => "cel",
            ValidationType::Regex => "regex",
            ValidationType::Range => "range",
            ValidationType::Required => "required",
            ValidationType::Forbidden => "forbidden",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldValidation {
    pub name: String,

    /// Dot path such as `spec.replicas` or `spec.ports[0].port`.
    /// Empty or `object` addresses the whole object.
    #[serde(default)]
    pub field_path: String,

    #[serde(rename = "type")]
    pub kind: ValidationType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplatePolicyStatus {
    /// Compiled without configuration errors and unambiguous for its namespace.
    #[serde(default)]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub governed_templates: u32,

    #[serde(default)]
    pub validation_successes: u64,

    #[serde(default)]
    pub validation_failures: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validation_time: Option<String>,
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".into(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn policy_yaml_parses_field_validations() {
        let yaml = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplatePolicy
metadata:
  name: app-policy
  namespace: kubetemplater-system
spec:
  sourceNamespace: app-namespace
  validationRules:
    - kind: ConfigMap
      version: v1
      targetNamespaces: [app-namespace]
      fieldValidations:
        - name: has-mode
          fieldPath: data.mode
          type: required
        - name: replicas-bounded
          fieldPath: spec.replicas
          type: range
          minValue: 1
          maxValue: 10
"#;
        let p: KubeTemplatePolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.spec.source_namespace, "app-namespace");
        let rule = &p.spec.validation_rules[0];
        assert_eq!(rule.group, "");
        assert_eq!(rule.field_validations[0].kind, ValidationType::Required);
        assert_eq!(rule.field_validations[1].min_value, Some(1));
        assert_eq!(rule.field_validations[1].max_value, Some(10));
    }

    #[test]
    fn template_yaml_defaults_replace_to_false() {
        let yaml = r#"
apiVersion: kubetemplater.io/v1alpha1
kind: KubeTemplate
metadata:
  name: web
  namespace: app-namespace
spec:
  templates:
    - object:
        apiVersion: v1
        kind: ConfigMap
        metadata: { name: cfg }
    - replace: true
      object:
        apiVersion: v1
        kind: Service
        metadata: { name: svc }
"#;
        let t: KubeTemplate = serde_yaml::from_str(yaml).unwrap();
        assert!(!t.spec.templates[0].replace);
        assert!(t.spec.templates[1].replace);
        assert_eq!(t.spec.templates[1].object["kind"], "Service");
    }

    #[test]
    fn template_crd_preserves_unknown_object_fields() {
        let crd = serde_json::to_value(KubeTemplate::crd()).unwrap();
        let object_schema = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
            ["properties"]["templates"]["items"]["properties"]["object"];
        assert_eq!(object_schema["x-kubernetes-preserve-unknown-fields"], true);
        assert_eq!(crd["spec"]["names"]["kind"], "KubeTemplate");
    }

    #[test]
    fn terminal_phases() {
        assert!(TemplatePhase::Rejected.is_terminal());
        assert!(TemplatePhase::Paused.is_terminal());
        assert!(!TemplatePhase::Failed.is_terminal());
        assert!(!TemplatePhase::Succeeded.is_terminal());
        assert_eq!(TemplatePhase::Paused.to_string(), "Paused");
    }
}
