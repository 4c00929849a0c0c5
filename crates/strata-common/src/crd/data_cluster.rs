//! DataCluster Custom Resource Definition
//!
//! A DataCluster describes a desired data-cluster deployment. The controller
//! turns it into a Flux HelmRepository and HelmRelease and reports their
//! readiness back through the status.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::flux::RemediationStrategy;
use super::types::{
    condition_reasons, set_condition, Condition, ConditionStatus, Readiness, CONDITION_READY,
};
use crate::{DATA_CLUSTER_FINALIZER, MANAGED_ANNOTATION};

/// Specification for a DataCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.strata.dev",
    version = "v1alpha1",
    kind = "DataCluster",
    plural = "dataclusters",
    shortname = "dc",
    status = "DataClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".status.helmRelease"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.lastAttemptedRevision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataClusterSpec {
    /// Which chart to install and how Flux should roll it out
    #[serde(default)]
    pub chart_ref: ChartRef,

    /// Chart values, passed through to the HelmRelease untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub cluster_spec: Option<serde_json::Value>,

    /// Adoption of resources created by the legacy operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationSpec>,
}

/// Chart coordinates and rollout settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart version constraint; empty means latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    /// Override for the generated HelmRepository name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_repository_name: Option<String>,

    /// Helm action timeout, e.g. "15m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// HelmRelease reconcile interval, e.g. "30s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Upgrade behaviour; unset fields keep the operator defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradePolicy>,
}

/// Caller-supplied upgrade settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePolicy {
    /// Force resource updates through replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,

    /// Delete newly created resources when the upgrade fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_on_fail: Option<bool>,

    /// Reuse the last release's values and merge in overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_values: Option<bool>,

    /// What to do when the upgrade fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationPolicy>,
}

/// Caller-supplied upgrade remediation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicy {
    /// rollback or uninstall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RemediationStrategy>,

    /// Retries before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
}

/// Migration from the legacy operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Run the migration on every reconcile while true
    #[serde(default)]
    pub enabled: bool,

    /// Legacy Cluster resource; defaults to the DataCluster's name and namespace
    #[serde(default)]
    pub cluster_ref: LegacyRef,

    /// Legacy Console resource; defaults to the DataCluster's name and namespace
    #[serde(default)]
    pub console_ref: LegacyRef,
}

/// Reference to a legacy custom resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRef {
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Resource namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl LegacyRef {
    /// Resolve against defaults, treating empty strings as unset
    pub fn resolve(&self, default_namespace: &str, default_name: &str) -> (String, String) {
        let namespace = non_empty(self.namespace.as_deref()).unwrap_or(default_namespace);
        let name = non_empty(self.name.as_deref()).unwrap_or(default_name);
        (namespace.to_string(), name.to_string())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};

    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Observed state of a DataCluster
///
/// Name and revision fields are serialized even when empty so that a status
/// merge patch can clear them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataClusterStatus {
    /// Conditions representing the DataCluster state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the HelmRepository created for this DataCluster
    #[serde(default)]
    pub helm_repository: Option<String>,

    /// Latched readiness of the HelmRepository
    #[serde(default)]
    pub helm_repository_ready: Readiness,

    /// Name of the HelmRelease created for this DataCluster
    #[serde(default)]
    pub helm_release: Option<String>,

    /// Latched readiness of the HelmRelease
    #[serde(default)]
    pub helm_release_ready: Readiness,

    /// Last chart revision Flux attempted to install
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
}

impl DataClusterStatus {
    /// Set Ready=Unknown while a new generation rolls out
    pub fn mark_progressing(&mut self, generation: Option<i64>) {
        set_condition(
            &mut self.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::Unknown,
                condition_reasons::PROGRESSING,
                "Reconciliation in progress",
            )
            .with_observed_generation(generation),
        );
    }

    /// Set Ready=False with the given reason
    pub fn mark_not_ready(
        &mut self,
        reason: &str,
        message: impl Into<String>,
        generation: Option<i64>,
    ) {
        set_condition(
            &mut self.conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, reason, message)
                .with_observed_generation(generation),
        );
    }

    /// Set Ready=True
    pub fn mark_ready(&mut self, generation: Option<i64>) {
        set_condition(
            &mut self.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                condition_reasons::SUCCEEDED,
                "HelmRepository and HelmRelease are ready",
            )
            .with_observed_generation(generation),
        );
    }

    /// The recorded HelmRelease name, if any
    pub fn recorded_release(&self) -> Option<&str> {
        non_empty(self.helm_release.as_deref())
    }

    /// Forget both dependents
    pub fn clear_dependents(&mut self) {
        self.helm_repository = None;
        self.helm_release = None;
    }
}

impl DataCluster {
    /// `namespace/name`, for log fields and error contexts
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// False when the unmanaged sentinel annotation is set
    pub fn is_managed(&self) -> bool {
        self.annotations()
            .get(MANAGED_ANNOTATION)
            .map(|v| v != "false")
            .unwrap_or(true)
    }

    /// True when the operator finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == DATA_CLUSTER_FINALIZER)
    }

    /// True when migration from the legacy operator is switched on
    pub fn migration_enabled(&self) -> bool {
        self.spec
            .migration
            .as_ref()
            .map(|m| m.enabled)
            .unwrap_or(false)
    }

    /// HelmRepository name: the override, else `<name>-repository`
    pub fn helm_repository_name(&self) -> String {
        match non_empty(self.spec.chart_ref.helm_repository_name.as_deref()) {
            Some(name) => name.to_string(),
            None => format!("{}-repository", self.name_any()),
        }
    }

    /// HelmRelease name; always the DataCluster name
    pub fn helm_release_name(&self) -> String {
        self.name_any()
    }

    /// Chart values, or an empty object
    pub fn values(&self) -> serde_json::Value {
        self.spec
            .cluster_spec
            .clone()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
    }

    /// Name the chart gives data-plane resources (`fullnameOverride`)
    pub fn resources_name(&self) -> String {
        self.value_str(&["fullnameOverride"])
            .unwrap_or_else(|| self.name_any())
    }

    /// Whether the chart deploys the console (default true)
    pub fn console_enabled(&self) -> bool {
        self.spec
            .cluster_spec
            .as_ref()
            .and_then(|v| v.pointer("/console/enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    /// Name the chart gives console resources (`console.fullnameOverride`)
    pub fn console_resources_name(&self) -> String {
        self.value_str(&["console", "fullnameOverride"])
            .unwrap_or_else(|| self.name_any())
    }

    /// Last attempted chart revision recorded in status
    pub fn last_attempted_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.last_attempted_revision.as_deref())
    }

    fn value_str(&self, path: &[&str]) -> Option<String> {
        let mut current = self.spec.cluster_spec.as_ref()?;
        for segment in path {
            current = current.get(segment)?;
        }
        current
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}
