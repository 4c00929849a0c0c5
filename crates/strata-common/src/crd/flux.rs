//! Flux custom resources the operator writes.
//!
//! Only the fields the DataCluster controller sets or reads are modelled.
//! The CRDs are owned by Flux, so schema generation is disabled.

use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CONDITION_READY;
use crate::kube_utils::{has_condition, HasConditionFields};

/// Kind Flux expects in a chart `sourceRef`
pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";

/// HelmRepository spec (`source.toolkit.fluxcd.io`)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "HelmRepository",
    plural = "helmrepositories",
    namespaced,
    schema = "disabled",
    status = "HelmRepositoryStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// Chart repository URL
    pub url: String,
    /// How often Flux polls the index
    pub interval: String,
}

/// HelmRepository status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    /// Generation last handled by the source controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Flux conditions
    #[serde(default)]
    pub conditions: Vec<FluxCondition>,
}

/// HelmRelease spec (`helm.toolkit.fluxcd.io`)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "helm.toolkit.fluxcd.io",
    version = "v2beta1",
    kind = "HelmRelease",
    plural = "helmreleases",
    namespaced,
    schema = "disabled",
    status = "HelmReleaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart template Flux turns into a HelmChart
    pub chart: HelmChartTemplate,
    /// Release reconcile interval
    pub interval: String,
    /// Timeout for Helm actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Values passed to the chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
    /// Upgrade settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<Upgrade>,
}

/// `spec.chart`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HelmChartTemplate {
    /// `spec.chart.spec`
    pub spec: HelmChartTemplateSpec,
}

/// `spec.chart.spec`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplateSpec {
    /// Chart name in the repository
    pub chart: String,
    /// Version constraint; Flux treats empty as `*`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// How often Flux checks the source for a new chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Where the chart comes from
    pub source_ref: CrossNamespaceObjectReference,
}

/// Reference to a Flux source
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceObjectReference {
    /// Source kind
    pub kind: String,
    /// Source name
    pub name: String,
    /// Source namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// `spec.upgrade`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Upgrade {
    /// Force resource updates through replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    /// Delete new resources on failed upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_on_fail: Option<bool>,
    /// Reuse the previous release's values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_values: Option<bool>,
    /// Failure remediation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<UpgradeRemediation>,
}

/// `spec.upgrade.remediation`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRemediation {
    /// Retries before remediation gives up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
    /// Remediation action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RemediationStrategy>,
}

/// Remediation action after a failed upgrade
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemediationStrategy {
    /// Roll back to the last successful release
    #[default]
    Rollback,
    /// Uninstall the release
    Uninstall,
}

/// HelmRelease status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Generation last handled by the helm controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Flux conditions
    #[serde(default)]
    pub conditions: Vec<FluxCondition>,
    /// Chart revision of the last install/upgrade attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
}

/// Condition as written by the Flux controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FluxCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl HasConditionFields for FluxCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }

    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Raw readiness signals of a Flux object, fed to the readiness latch.
pub trait ReadinessSignals: Resource {
    /// `status.observedGeneration`
    fn observed_generation(&self) -> Option<i64>;

    /// `status.conditions`
    fn conditions(&self) -> &[FluxCondition];

    /// The Flux controller has seen the current spec
    fn is_generation_fresh(&self) -> bool {
        self.meta().generation == self.observed_generation()
    }

    /// `Ready=True`
    fn is_condition_ready(&self) -> bool {
        has_condition(Some(self.conditions()), CONDITION_READY)
    }
}

impl ReadinessSignals for HelmRepository {
    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    fn conditions(&self) -> &[FluxCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}

impl ReadinessSignals for HelmRelease {
    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.observed_generation)
    }

    fn conditions(&self) -> &[FluxCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}

impl HelmRelease {
    /// `status.lastAttemptedRevision`, if Flux has tried a revision yet
    pub fn last_attempted_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.last_attempted_revision.as_deref())
            .filter(|r| !r.is_empty())
    }
}
