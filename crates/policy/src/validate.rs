//! Field Validation Engine. The legacy whole-object expression runs first,
//! then field validations in order; the first failure wins.

use std::fmt;

use serde_json::Value as Json;

use crate::cel::{Bindings, CelProgram};
use crate::compile::{Check, CompiledField, CompiledRule};

/// Name reported for failures of the legacy whole-object expression.
pub const LEGACY_RULE_NAME: &str = "rule";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Expression evaluated to false.
    Rejected,
    /// Expression could not be evaluated.
    EvalError(String),
    Missing,
    Empty,
    Present,
    NoMatch { pattern: String },
    OutOfRange { value: i64, min: Option<i64>, max: Option<i64> },
    TypeMismatch { expected: &'static str, found: &'static str },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected => f.write_str("expression evaluated to false"),
            FailureReason::EvalError(e) => write!(f, "expression error: {e}"),
            FailureReason::Missing => f.write_str("field not found"),
            FailureReason::Empty => f.write_str("value is required"),
            FailureReason::Present => f.write_str("field must not be set"),
            FailureReason::NoMatch { pattern } => write!(f, "value does not match {pattern:?}"),
            FailureReason::OutOfRange { value, min, max } => {
                let lo = min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into());
                let hi = max.map(|v| v.to_string()).unwrap_or_else(|| "+inf".into());
                write!(f, "{value} is outside [{lo}, {hi}]")
            }
            FailureReason::TypeMismatch { expected, found } => write!(f, "expected {expected}, found {found}"),
        }
    }
}

/// The first failing validation for an object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationFailure {
    /// Field validation name, or `rule` for the legacy expression.
    pub rule: String,
    pub field_path: String,
    pub reason: FailureReason,
    /// Custom message when configured, otherwise a generated description.
    pub message: String,
}

impl ValidationFailure {
    fn new(rule: &str, field_path: String, reason: FailureReason, custom: Option<&String>) -> Self {
        let message = match custom.map(|m| m.trim()).filter(|m| !m.is_empty()) {
            Some(m) => m.to_string(),
            None => format!("{field_path} failed validation rule: {rule} ({reason})"),
        };
        Self { rule: rule.to_string(), field_path, reason, message }
    }
}

/// Validate `object` against one rule. `Ok(())` when every check passes.
pub fn validate(object: &Json, rule: &CompiledRule) -> Result<(), ValidationFailure> {
    if let Some(legacy) = &rule.legacy {
        let mut bindings = Bindings::new();
        bindings.insert("object".into(), object.clone());
        if let Err(reason) = eval_cel(legacy.program.as_ref(), &bindings) {
            let custom = rule.message.as_ref();
            let message = match custom.map(|m| m.trim()).filter(|m| !m.is_empty()) {
                Some(m) => m.to_string(),
                None => format!("object failed validation rule: {} ({reason})", legacy.expr),
            };
            return Err(ValidationFailure { rule: LEGACY_RULE_NAME.into(), field_path: "object".into(), reason, message });
        }
    }
    for field in &rule.fields {
        if let Err(reason) = check_field(object, field) {
            return Err(ValidationFailure::new(&field.name, field.path.to_string(), reason, field.message.as_ref()));
        }
    }
    Ok(())
}

fn eval_cel(program: &dyn CelProgram, bindings: &Bindings) -> Result<(), FailureReason> {
    match program.eval(bindings) {
        Ok(true) => Ok(()),
        Ok(false) => Err(FailureReason::Rejected),
        Err(e) => Err(FailureReason::EvalError(e.to_string())),
    }
}

fn check_field(object: &Json, field: &CompiledField) -> Result<(), FailureReason> {
    let value = field.path.resolve(object);
    match &field.check {
        Check::Required => match value {
            None => Err(FailureReason::Missing),
            Some(v) if is_empty(v) => Err(FailureReason::Empty),
            Some(_) => Ok(()),
        },
        Check::Forbidden => match value {
            Some(v) if !is_empty(v) => Err(FailureReason::Present),
            _ => Ok(()),
        },
        Check::Regex(re) => match value {
            None => Err(FailureReason::Missing),
            Some(Json::String(s)) => {
                // Substring semantics: anchor the pattern to require a full match.
                if re.is_match(s) { Ok(()) } else { Err(FailureReason::NoMatch { pattern: re.as_str().to_string() }) }
            }
            Some(other) => Err(FailureReason::TypeMismatch { expected: "string", found: type_name(other) }),
        },
        Check::Range { min, max } => {
            let v = value.ok_or(FailureReason::Missing)?;
            let n = as_i64(v).ok_or(FailureReason::TypeMismatch { expected: "integer", found: type_name(v) })?;
            if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) {
                return Err(FailureReason::OutOfRange { value: n, min: *min, max: *max });
            }
            Ok(())
        }
        Check::Cel(program) => {
            let mut bindings = Bindings::new();
            if field.path.is_whole_object() {
                bindings.insert("object".into(), object.clone());
            } else {
                bindings.insert("value".into(), value.cloned().unwrap_or(Json::Null));
            }
            eval_cel(program.as_ref(), &bindings)
        }
    }
}

/// Absent-equivalent values: null, "", 0, false, [] and {}.
pub fn is_empty(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Bool(b) => !b,
        Json::Number(n) => n.as_f64() == Some(0.0),
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(o) => o.is_empty(),
    }
}

fn as_i64(v: &Json) -> Option<i64> {
    match v {
        Json::Number(n) => n.as_i64().or_else(|| {
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
        }),
        Json::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cel::{CelEngine, CelError, CelProgram};
    use crate::compile::CompiledPolicy;
    use kubetemplater_core::{FieldValidation, KubeTemplatePolicy, KubeTemplatePolicySpec, ValidationRule, ValidationType};
    use serde_json::json;
    use std::sync::Arc;

    /// Test engine understanding two expressions.
    struct TinyCel;

    #[derive(Debug)]
    struct Tiny(String);

    impl CelProgram for Tiny {
        fn eval(&self, b: &Bindings) -> Result<bool, CelError> {
            match self.0.as_str() {
                "value > 2" => b["value"].as_i64().map(|v| v > 2).ok_or_else(|| CelError::Eval("no such overload".into())),
                "has(object.metadata.labels)" => Ok(b["object"]["metadata"].get("labels").is_some()),
                other => Err(CelError::Eval(format!("unsupported {other}"))),
            }
        }
    }

    impl CelEngine for TinyCel {
        fn compile(&self, expr: &str) -> Result<Arc<dyn CelProgram>, CelError> {
            Ok(Arc::new(Tiny(expr.to_string())))
        }
    }

    fn fv(name: &str, path: &str, kind: ValidationType) -> FieldValidation {
        FieldValidation { name: name.into(), field_path: path.into(), kind, cel: None, regex: None, min_value: None, max_value: None, message: None }
    }

    fn rule(legacy: Option<&str>, fields: Vec<FieldValidation>) -> CompiledRule {
        let mut p = KubeTemplatePolicy::new(
            "p",
            KubeTemplatePolicySpec {
                source_namespace: "app".into(),
                validation_rules: vec![ValidationRule {
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    rule: legacy.map(String::from),
                    field_validations: fields,
                    target_namespaces: vec!["app".into()],
                    ..Default::default()
                }],
            },
        );
        p.metadata.namespace = Some("sys".into());
        CompiledPolicy::compile(&p, &TinyCel).unwrap().rules.remove(0)
    }

    fn range(min: Option<i64>, max: Option<i64>) -> CompiledRule {
        let mut r = fv("replicas-range", "spec.replicas", ValidationType::Range);
        r.min_value = min;
        r.max_value = max;
        rule(None, vec![r])
    }

    #[test]
    fn required_fails_on_empty_string_and_passes_on_value() {
        let r = rule(None, vec![fv("has-mode", "data.mode", ValidationType::Required)]);
        let err = validate(&json!({"data": {"mode": ""}}), &r).unwrap_err();
        assert_eq!(err.reason, FailureReason::Empty);
        assert_eq!(err.message, "data.mode failed validation rule: has-mode (value is required)");
        assert_eq!(validate(&json!({"data": {}}), &r).unwrap_err().reason, FailureReason::Missing);
        assert!(validate(&json!({"data": {"mode": "prod"}}), &r).is_ok());
    }

    #[test]
    fn empty_values_cover_zero_and_collections() {
        for v in [json!(null), json!(""), json!(0), json!(0.0), json!(false), json!([]), json!({})] {
            assert!(is_empty(&v), "{v} should be empty");
        }
        for v in [json!("x"), json!(1), json!(true), json!([0]), json!({"a": null})] {
            assert!(!is_empty(&v), "{v} should not be empty");
        }
    }

    #[test]
    fn range_is_inclusive() {
        let r = range(Some(1), Some(10));
        assert!(validate(&json!({"spec": {"replicas": 5}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"replicas": 1}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"replicas": 10}}), &r).is_ok());
        let low = validate(&json!({"spec": {"replicas": 0}}), &r).unwrap_err();
        assert_eq!(low.reason, FailureReason::OutOfRange { value: 0, min: Some(1), max: Some(10) });
        assert!(low.message.contains("0 is outside [1, 10]"), "{}", low.message);
        assert!(validate(&json!({"spec": {"replicas": 11}}), &r).is_err());
    }

    #[test]
    fn range_with_one_bound_is_open_on_the_other_side() {
        let r = range(None, Some(3));
        assert!(validate(&json!({"spec": {"replicas": i64::MIN}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"replicas": 4}}), &r).is_err());
        let r = range(Some(2), None);
        assert!(validate(&json!({"spec": {"replicas": "42"}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"replicas": 2.0}}), &r).is_ok());
    }

    #[test]
    fn range_rejects_non_numeric_values() {
        let r = range(Some(1), Some(10));
        let err = validate(&json!({"spec": {"replicas": "many"}}), &r).unwrap_err();
        assert_eq!(err.reason, FailureReason::TypeMismatch { expected: "integer", found: "string" });
        let err = validate(&json!({"spec": {"replicas": 2.5}}), &r).unwrap_err();
        assert!(matches!(err.reason, FailureReason::TypeMismatch { .. }));
    }

    #[test]
    fn range_rejects_floats_beyond_i64() {
        // 2^63 is exactly representable as f64 but not as i64.
        let r = range(Some(1), None);
        let err = validate(&json!({"spec": {"replicas": 9223372036854775808.0}}), &r).unwrap_err();
        assert_eq!(err.reason, FailureReason::TypeMismatch { expected: "integer", found: "number" });
        let err = validate(&json!({"spec": {"replicas": -9223372036854777856.0}}), &r).unwrap_err();
        assert!(matches!(err.reason, FailureReason::TypeMismatch { .. }));
    }

    #[test]
    fn regex_matches_anywhere_and_requires_strings() {
        let mut re = fv("image-registry", "spec.image", ValidationType::Regex);
        re.regex = Some("registry\\.example\\.com/".into());
        re.message = Some("images must come from the internal registry".into());
        let r = rule(None, vec![re]);
        assert!(validate(&json!({"spec": {"image": "registry.example.com/web:1"}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"image": "mirror/registry.example.com/web"}}), &r).is_ok());
        let err = validate(&json!({"spec": {"image": "docker.io/web"}}), &r).unwrap_err();
        assert_eq!(err.message, "images must come from the internal registry");
        assert_eq!(err.rule, "image-registry");
        assert_eq!(err.field_path, "spec.image");
        let err = validate(&json!({"spec": {"image": 7}}), &r).unwrap_err();
        assert_eq!(err.reason, FailureReason::TypeMismatch { expected: "string", found: "number" });
    }

    #[test]
    fn forbidden_allows_absent_or_empty() {
        let r = rule(None, vec![fv("no-host-network", "spec.hostNetwork", ValidationType::Forbidden)]);
        assert!(validate(&json!({"spec": {}}), &r).is_ok());
        assert!(validate(&json!({"spec": {"hostNetwork": false}}), &r).is_ok());
        let err = validate(&json!({"spec": {"hostNetwork": true}}), &r).unwrap_err();
        assert_eq!(err.reason, FailureReason::Present);
    }

    #[test]
    fn cel_binds_value_and_treats_errors_as_failures() {
        let mut c = fv("min-replicas", "spec.replicas", ValidationType::Cel);
        c.cel = Some("value > 2".into());
        let r = rule(None, vec![c]);
        assert!(validate(&json!({"spec": {"replicas": 3}}), &r).is_ok());
        assert_eq!(validate(&json!({"spec": {"replicas": 1}}), &r).unwrap_err().reason, FailureReason::Rejected);
        let err = validate(&json!({"spec": {}}), &r).unwrap_err();
        assert!(matches!(err.reason, FailureReason::EvalError(_)));
    }

    #[test]
    fn cel_on_whole_object_binds_object() {
        let mut c = fv("labelled", "object", ValidationType::Cel);
        c.cel = Some("has(object.metadata.labels)".into());
        let r = rule(None, vec![c]);
        assert!(validate(&json!({"metadata": {"labels": {"a": "b"}}}), &r).is_ok());
        assert!(validate(&json!({"metadata": {}}), &r).is_err());
    }

    #[test]
    fn legacy_rule_runs_first_and_short_circuits() {
        let r = rule(
            Some("has(object.metadata.labels)"),
            vec![fv("has-mode", "data.mode", ValidationType::Required)],
        );
        let err = validate(&json!({"metadata": {}}), &r).unwrap_err();
        assert_eq!(err.rule, LEGACY_RULE_NAME);
        assert!(err.message.contains("has(object.metadata.labels)"), "{}", err.message);

        let err = validate(&json!({"metadata": {"labels": {}}}), &r).unwrap_err();
        assert_eq!(err.rule, "has-mode");
    }

    #[test]
    fn first_failing_field_is_reported() {
        let r = rule(
            None,
            vec![
                fv("a", "data.a", ValidationType::Required),
                fv("b", "data.b", ValidationType::Required),
            ],
        );
        assert_eq!(validate(&json!({"data": {}}), &r).unwrap_err().rule, "a");
        assert_eq!(validate(&json!({"data": {"a": "x"}}), &r).unwrap_err().rule, "b");
    }
}
