//! Policy compilation: every configuration check happens here, once, when a
//! policy is loaded. Evaluation never re-parses rules.

use std::fmt;
use std::sync::Arc;

use kubetemplater_core::{FieldValidation, Gvk, KubeTemplatePolicy, ObjectKey, ValidationRule, ValidationType};
use regex::Regex;

use crate::cel::{CelEngine, CelProgram};
use crate::path::FieldPath;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("spec.sourceNamespace is required")]
    MissingSourceNamespace,
    #[error("validation rule {index}: version and kind are required")]
    MissingGvk { index: usize },
    #[error("validation rule {index} ({gvk}): rule: {message}")]
    LegacyRule { index: usize, gvk: String, message: String },
    #[error("validation rule {index} ({gvk}): field validation {name:?}: {message}")]
    Field { index: usize, gvk: String, name: String, message: String },
}

#[derive(Debug, Clone)]
pub(crate) enum Check {
    Cel(Arc<dyn CelProgram>),
    Regex(Regex),
    Range { min: Option<i64>, max: Option<i64> },
    Required,
    Forbidden,
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,
    pub path: FieldPath,
    pub kind: ValidationType,
    pub message: Option<String>,
    pub(crate) check: Check,
}

#[derive(Debug, Clone)]
pub(crate) struct LegacyRule {
    pub(crate) expr: String,
    pub(crate) program: Arc<dyn CelProgram>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub gvk: Gvk,
    pub message: Option<String>,
    pub fields: Vec<CompiledField>,
    pub target_namespaces: Vec<String>,
    pub(crate) legacy: Option<LegacyRule>,
}

impl CompiledRule {
    pub fn legacy_expr(&self) -> Option<&str> { self.legacy.as_ref().map(|l| l.expr.as_str()) }
}

/// A policy whose rules all passed configuration checks.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub key: ObjectKey,
    pub source_namespace: String,
    pub generation: Option<i64>,
    pub rules: Vec<CompiledRule>,
}

impl fmt::Display for CompiledPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.key) }
}

impl CompiledPolicy {
    pub fn compile(policy: &KubeTemplatePolicy, cel: &dyn CelEngine) -> Result<Self, ConfigError> {
        let spec = &policy.spec;
        if spec.source_namespace.trim().is_empty() {
            return Err(ConfigError::MissingSourceNamespace);
        }
        let rules = spec
            .validation_rules
            .iter()
            .enumerate()
            .map(|(index, rule)| compile_rule(index, rule, cel))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledPolicy {
            key: ObjectKey::of(policy),
            source_namespace: spec.source_namespace.clone(),
            generation: policy.metadata.generation,
            rules,
        })
    }
}

fn compile_rule(index: usize, rule: &ValidationRule, cel: &dyn CelEngine) -> Result<CompiledRule, ConfigError> {
    if rule.version.trim().is_empty() || rule.kind.trim().is_empty() {
        return Err(ConfigError::MissingGvk { index });
    }
    let gvk = Gvk::new(rule.group.trim(), rule.version.trim(), rule.kind.trim());
    let legacy = match rule.rule.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(expr) => {
            let program = cel.compile(expr).map_err(|e| ConfigError::LegacyRule {
                index,
                gvk: gvk.to_string(),
                message: e.to_string(),
            })?;
            Some(LegacyRule { expr: expr.to_string(), program })
        }
        None => None,
    };
    let fields = rule
        .field_validations
        .iter()
        .map(|fv| {
            compile_field(fv, cel).map_err(|message| ConfigError::Field {
                index,
                gvk: gvk.to_string(),
                name: fv.name.clone(),
                message,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledRule {
        gvk,
        message: rule.message.clone(),
        fields,
        target_namespaces: rule.target_namespaces.iter().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()).collect(),
        legacy,
    })
}

fn non_empty(v: Option<&String>) -> Option<&str> {
    v.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn compile_field(fv: &FieldValidation, cel: &dyn CelEngine) -> Result<CompiledField, String> {
    if fv.name.trim().is_empty() {
        return Err("name is required".into());
    }
    let path = FieldPath::parse(&fv.field_path).ok_or_else(|| format!("invalid fieldPath {:?}", fv.field_path))?;
    let check = match fv.kind {
        ValidationType::Cel => {
            let expr = non_empty(fv.cel.as_ref()).ok_or("type cel requires a cel expression")?;
            let program = cel.compile(expr).map_err(|e| e.to_string())?;
            Check::Cel(program)
        }
        ValidationType::Regex => {
            let pattern = non_empty(fv.regex.as_ref()).ok_or("type regex requires a regex pattern")?;
            Check::Regex(Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?)
        }
        ValidationType::Range => {
            let (min, max) = (fv.min_value, fv.max_value);
            match (min, max) {
                (None, None) => return Err("type range requires minValue and/or maxValue".into()),
                (Some(lo), Some(hi)) if lo > hi => return Err(format!("minValue {lo} is greater than maxValue {hi}")),
                _ => Check::Range { min, max },
            }
        }
        ValidationType::Required => Check::Required,
        ValidationType::Forbidden => {
            if path.is_whole_object() {
                return Err("type forbidden needs a fieldPath".into());
            }
            Check::Forbidden
        }
    };
    Ok(CompiledField { name: fv.name.clone(), path, kind: fv.kind, message: fv.message.clone(), check })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cel::DisabledCel;
    use kubetemplater_core::{KubeTemplatePolicySpec, ValidationRule};

    fn fv(name: &str, kind: ValidationType) -> FieldValidation {
        FieldValidation {
            name: name.into(),
            field_path: "spec.replicas".into(),
            kind,
            cel: None,
            regex: None,
            min_value: None,
            max_value: None,
            message: None,
        }
    }

    fn policy(fields: Vec<FieldValidation>) -> KubeTemplatePolicy {
        let mut p = KubeTemplatePolicy::new(
            "p",
            KubeTemplatePolicySpec {
                source_namespace: "app".into(),
                validation_rules: vec![ValidationRule {
                    version: "v1".into(),
                    group: "apps".into(),
                    kind: "Deployment".into(),
                    field_validations: fields,
                    target_namespaces: vec!["app".into(), " ".into()],
                    ..Default::default()
                }],
            },
        );
        p.metadata.namespace = Some("kubetemplater-system".into());
        p
    }

    fn compile_err(fields: Vec<FieldValidation>) -> String {
        CompiledPolicy::compile(&policy(fields), &DisabledCel).unwrap_err().to_string()
    }

    #[test]
    fn range_without_bounds_is_a_config_error() {
        let err = compile_err(vec![fv("r", ValidationType::Range)]);
        assert!(err.contains("requires minValue"), "{err}");
        assert!(err.contains("apps/v1/Deployment"), "{err}");
    }

    #[test]
    fn inverted_range_is_a_config_error() {
        let mut r = fv("r", ValidationType::Range);
        r.min_value = Some(10);
        r.max_value = Some(1);
        assert!(compile_err(vec![r]).contains("greater than maxValue"));
    }

    #[test]
    fn missing_or_bad_regex_is_a_config_error() {
        assert!(compile_err(vec![fv("re", ValidationType::Regex)]).contains("requires a regex"));
        let mut bad = fv("re", ValidationType::Regex);
        bad.regex = Some("(unclosed".into());
        assert!(compile_err(vec![bad]).contains("invalid regex"));
    }

    #[test]
    fn cel_without_engine_or_expression_is_a_config_error() {
        assert!(compile_err(vec![fv("c", ValidationType::Cel)]).contains("requires a cel expression"));
        let mut c = fv("c", ValidationType::Cel);
        c.cel = Some("value > 0".into());
        assert!(compile_err(vec![c]).contains("not enabled"));
    }

    #[test]
    fn bad_field_path_and_missing_name_are_config_errors() {
        let mut p = fv("x", ValidationType::Required);
        p.field_path = "spec..replicas".into();
        assert!(compile_err(vec![p]).contains("invalid fieldPath"));
        assert!(compile_err(vec![fv(" ", ValidationType::Required)]).contains("name is required"));
    }

    #[test]
    fn valid_policy_compiles_and_drops_blank_namespaces() {
        let mut r = fv("r", ValidationType::Range);
        r.min_value = Some(1);
        let compiled = CompiledPolicy::compile(&policy(vec![r, fv("req", ValidationType::Required)]), &DisabledCel).unwrap();
        assert_eq!(compiled.key, ObjectKey::new("kubetemplater-system", "p"));
        assert_eq!(compiled.rules[0].gvk, Gvk::new("apps", "v1", "Deployment"));
        assert_eq!(compiled.rules[0].target_namespaces, vec!["app".to_string()]);
        assert_eq!(compiled.rules[0].fields.len(), 2);
        assert!(compiled.rules[0].legacy_expr().is_none());
    }

    #[test]
    fn empty_source_namespace_is_rejected() {
        let mut p = policy(vec![]);
        p.spec.source_namespace = String::new();
        assert_eq!(CompiledPolicy::compile(&p, &DisabledCel).unwrap_err(), ConfigError::MissingSourceNamespace);
    }
}
