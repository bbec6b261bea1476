//! Manifest helpers: target identity, bounded YAML intake, and change
//! summaries between an object and its previous version.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use kubetemplater_core::Gvk;

use crate::{ApplyError, TargetRef};

/// Bounds on YAML accepted by `parse_yaml_documents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YamlLimits {
    /// Whole stream, in bytes.
    pub max_bytes: usize,
    /// Values per document once converted to JSON.
    pub max_nodes: usize,
}

impl Default for YamlLimits {
    fn default() -> Self { Self { max_bytes: 1 << 20, max_nodes: 100_000 } }
}

impl YamlLimits {
    /// Defaults overridden by `KT_MAX_YAML_BYTES` and `KT_MAX_YAML_NODES`; zero is ignored.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().and_then(|s| s.trim().parse::<usize>().ok()).filter(|n| *n > 0);
        let d = Self::default();
        Self {
            max_bytes: var("KT_MAX_YAML_BYTES").unwrap_or(d.max_bytes),
            max_nodes: var("KT_MAX_YAML_NODES").unwrap_or(d.max_nodes),
        }
    }
}

/// True once more than `max` values have been seen. Iterative, so deeply
/// nested input cannot exhaust the stack.
fn exceeds_nodes(root: &Json, max: usize) -> bool {
    let mut pending = vec![root];
    let mut seen = 0usize;
    while let Some(v) = pending.pop() {
        seen += 1;
        if seen > max {
            return true;
        }
        match v {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items),
            _ => {}
        }
    }
    false
}

/// Parse a YAML stream into JSON documents under `YamlLimits::from_env`,
/// skipping empty documents.
pub fn parse_yaml_documents(yaml: &str) -> Result<Vec<Json>, ApplyError> {
    parse_yaml_documents_with(yaml, YamlLimits::from_env())
}

pub fn parse_yaml_documents_with(yaml: &str, limits: YamlLimits) -> Result<Vec<Json>, ApplyError> {
    if yaml.len() > limits.max_bytes {
        return Err(ApplyError::Manifest(format!("YAML is {} bytes; the limit is {}", yaml.len(), limits.max_bytes)));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| ApplyError::Manifest(format!("parsing YAML: {e}")))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| ApplyError::Manifest(format!("converting YAML to JSON: {e}")))?;
        if exceeds_nodes(&json, limits.max_nodes) {
            return Err(ApplyError::Manifest(format!("YAML document {i} has more than {} values", limits.max_nodes)));
        }
        out.push(json);
    }
    Ok(out)
}

/// Identity of a manifest. Namespaced objects without `metadata.namespace`
/// land in `default_namespace`.
pub fn target_from_manifest(json: &Json, default_namespace: Option<&str>) -> Result<TargetRef, ApplyError> {
    let str_at = |ptr: &str| json.pointer(ptr).and_then(Json::as_str).filter(|s| !s.is_empty());
    let api_version = str_at("/apiVersion").ok_or_else(|| ApplyError::Manifest("object missing apiVersion".into()))?;
    let kind = str_at("/kind").ok_or_else(|| ApplyError::Manifest("object missing kind".into()))?;
    let name = str_at("/metadata/name").ok_or_else(|| ApplyError::Manifest("object missing metadata.name".into()))?;
    let namespace = str_at("/metadata/namespace").or(default_namespace).map(str::to_string);
    Ok(TargetRef { gvk: Gvk::from_api_version(api_version, kind), namespace, name: name.to_string() })
}

/// Drop server-populated fields that would otherwise show up in every diff.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Pin `metadata.name`/`metadata.namespace` to the target identity.
pub fn ensure_metadata(v: &mut Json, target: &TargetRef) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("name".into(), Json::String(target.name.clone()));
        if let Some(ns) = &target.namespace {
            obj.insert("namespace".into(), Json::String(ns.clone()));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Leaf-level changes that turn `base` into `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
