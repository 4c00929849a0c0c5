//! Kubernetes helpers shared by the Strata controllers

use std::time::Duration;

use base64::Engine;
use kube::api::DeleteParams;
use kube::discovery::ApiResource;
use tracing::{info, warn};

use crate::Error;

/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

/// Check if a condition of the given type has status "True"
///
/// Returns `false` when the conditions are missing or the type is absent.
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Map a 404 from a get into `None`.
pub fn ok_if_not_found<T>(
    result: std::result::Result<T, kube::Error>,
) -> std::result::Result<Option<T>, kube::Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletion propagation policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are deleted before the owner disappears
    Foreground,
    /// Owner disappears first, dependents are garbage collected
    Background,
    /// Dependents are left running without an owner
    Orphan,
}

impl Propagation {
    /// DeleteParams carrying this propagation policy
    pub fn delete_params(self) -> DeleteParams {
        match self {
            Self::Foreground => DeleteParams::foreground(),
            Self::Background => DeleteParams::background(),
            Self::Orphan => DeleteParams::orphan(),
        }
    }
}

/// Add `finalizer` if missing. Returns true when the list changed.
pub fn add_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Remove every occurrence of `finalizer`. Returns true when the list changed.
pub fn remove_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Parse a Go-style duration string ("30s", "15m", "1h30m").
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, Error> {
    humantime::parse_duration(value).map_err(|e| {
        Error::validation_for_field(
            crate::error::UNKNOWN_CONTEXT,
            field,
            format!("invalid duration {value:?}: {e}"),
        )
    })
}

/// Compare two duration strings by value, so "1m" equals "60s".
///
/// Falls back to string equality when either side does not parse.
pub fn durations_equal(a: &str, b: &str) -> bool {
    match (humantime::parse_duration(a), humantime::parse_duration(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// SHA-256 of the serialized values, URL-safe base64 encoded.
///
/// Only used as a diagnostic fingerprint in logs.
pub fn values_fingerprint(values: &serde_json::Value) -> Result<String, Error> {
    use aws_lc_rs::digest;

    let bytes = serde_json::to_vec(values)
        .map_err(|e| Error::serialization_for_kind("values", e.to_string()))?;
    let hash = digest::digest(&digest::SHA256, &bytes);
    Ok(base64::engine::general_purpose::URL_SAFE.encode(hash.as_ref()))
}

/// Split an apiVersion into (group, version); core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from an apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Look up a resource in pre-computed API discovery results.
///
/// Returns `None` if the CRD is not installed (not an error).
pub fn find_discovered_resource(
    discovery: &kube::discovery::Discovery,
    group: &str,
    kind: &str,
) -> Option<ApiResource> {
    for api_group in discovery.groups() {
        if api_group.name() != group {
            continue;
        }
        for (ar, _caps) in api_group.resources_by_stability() {
            if ar.kind == kind {
                info!(
                    group = %group,
                    kind = %kind,
                    api_version = %ar.api_version,
                    "discovered CRD version"
                );
                return Some(ar);
            }
        }
    }
    warn!(group = %group, kind = %kind, "CRD not found in API discovery");
    None
}
