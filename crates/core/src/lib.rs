//! kubetemplater core types: work identities, GVK keys, and the two CRDs.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod crd;

pub use crd::{
    FieldValidation, KubeTemplate, KubeTemplatePolicy, KubeTemplatePolicySpec, KubeTemplatePolicyStatus,
    KubeTemplateSpec, KubeTemplateStatus, TargetError, TemplateObject, TemplatePhase, ValidationRule,
    ValidationType,
};

/// API group shared by both custom resources.
pub const API_GROUP: &str = "kubetemplater.io";
/// Field manager name used for server-side apply and status patches.
pub const FIELD_MANAGER: &str = "kubetemplater";
/// Namespace policies are read from unless overridden.
pub const DEFAULT_POLICY_NAMESPACE: &str = "kubetemplater-system";

/// Enqueue priorities. Higher is served first.
pub mod priority {
    /// A template's spec (generation) changed.
    pub const TEMPLATE_CHANGE: i32 = 10;
    /// The policy governing the template's namespace changed.
    pub const POLICY_CHANGE: i32 = 5;
    /// Periodic resync of every known template.
    pub const RESYNC: i32 = 0;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("invalid object key: {0} (expect namespace/name)")]
    InvalidObjectKey(String),
}

/// Identity of a template: the unit of deduplication in the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key for any namespaced resource; cluster-scoped objects get an empty namespace.
    pub fn of<K: kube::ResourceExt>(obj: &K) -> Self {
        Self { namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(CoreError::InvalidObjectKey(s.to_string())),
        }
    }
}

/// Group/version/kind triple. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split a manifest `apiVersion` ("v1" or "apps/v1") and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Gvk {
    type Err = CoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Gvk::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Gvk::new(*group, *version, *kind)),
            _ => Err(CoreError::InvalidGvkKey(key.to_string())),
        }
    }
}
