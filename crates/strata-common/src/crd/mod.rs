//! Custom Resource Definitions used by the Strata operator
//!
//! `DataCluster` is owned by this operator; the Flux kinds are written but
//! their CRDs come from Flux.

mod data_cluster;
mod flux;
pub mod legacy;
mod types;

pub use data_cluster::{
    ChartRef, DataCluster, DataClusterSpec, DataClusterStatus, LegacyRef, MigrationSpec,
    RemediationPolicy, UpgradePolicy,
};
pub use flux::{
    CrossNamespaceObjectReference, FluxCondition, HelmChartTemplate, HelmChartTemplateSpec,
    HelmRelease, HelmReleaseSpec, HelmReleaseStatus, HelmRepository, HelmRepositorySpec,
    HelmRepositoryStatus, ReadinessSignals, RemediationStrategy, Upgrade, UpgradeRemediation,
    HELM_REPOSITORY_KIND,
};
pub use types::{
    condition_reasons, set_condition, Condition, ConditionStatus, Readiness, CONDITION_READY,
};
