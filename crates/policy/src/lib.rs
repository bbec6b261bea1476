//! kubetemplater policy: policy resolution, kind/namespace authorization and
//! field validation of target objects.

#![forbid(unsafe_code)]

use kubetemplater_core::Gvk;
use serde_json::Value as Json;

pub mod cel;
mod compile;
mod path;
mod resolver;
mod stats;
mod validate;

pub use cel::{default_engine, Bindings, CelEngine, CelError, CelProgram, DisabledCel};
#[cfg(feature = "cel")]
pub use cel::InterpreterCel;
pub use compile::{CompiledField, CompiledPolicy, CompiledRule, ConfigError};
pub use path::FieldPath;
pub use resolver::{AuthzError, PolicyEntry, PolicyIndex, PolicyResolver, ResolveError, POLICY_NAMESPACE_ENV};
pub use stats::{PolicyCounters, PolicyStats};
pub use validate::{is_empty, validate, FailureReason, ValidationFailure, LEGACY_RULE_NAME};

/// Any reason a target object is refused by its policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
}

/// Authorize then validate one target object. The policy's rule for the
/// object's kind is returned on success.
pub fn check_target<'p>(
    policy: &'p CompiledPolicy,
    gvk: &Gvk,
    target_namespace: &str,
    object: &Json,
) -> Result<&'p CompiledRule, PolicyError> {
    let rule = policy.authorize(gvk, target_namespace)?;
    validate(object, rule)?;
    Ok(rule)
}
