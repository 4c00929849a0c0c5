//! HelmRepository and HelmRelease resolution.
//!
//! The repository is created once and never touched again. The release is
//! created when none is recorded in status, recreated when the recorded one
//! has vanished, and overwritten when its chart, values or interval drift
//! from what the DataCluster asks for.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use strata_common::crd::{
    CrossNamespaceObjectReference, DataCluster, DataClusterStatus, HelmChartTemplate,
    HelmChartTemplateSpec, HelmRelease, HelmReleaseSpec, HelmRepository, HelmRepositorySpec,
    RemediationStrategy, Upgrade, UpgradePolicy, UpgradeRemediation, HELM_REPOSITORY_KIND,
};
use strata_common::events::{actions, reasons, with_revision};
use strata_common::kube_utils::{durations_equal, parse_duration, values_fingerprint};
use strata_common::{Error, CHART_REPOSITORY_URL, DATA_PLANE_NAME};

use crate::controller::Context;

/// How often Flux polls the chart repository index
pub const REPOSITORY_INTERVAL: &str = "30s";

/// How often Flux checks the repository for a new chart version
pub const CHART_INTERVAL: &str = "1m";

/// Release reconcile interval unless `chartRef.interval` is set
pub const DEFAULT_RELEASE_INTERVAL: &str = "30s";

/// Helm action timeout unless `chartRef.timeout` is set
pub const DEFAULT_TIMEOUT: &str = "15m";

/// Remediation retries unless the caller sets them
pub const DEFAULT_REMEDIATION_RETRIES: i64 = 1;

/// Build the HelmRepository for a DataCluster
pub fn helm_repository_template(cluster: &DataCluster) -> HelmRepository {
    HelmRepository {
        metadata: owned_metadata(cluster, cluster.helm_repository_name()),
        spec: HelmRepositorySpec {
            url: CHART_REPOSITORY_URL.to_string(),
            interval: REPOSITORY_INTERVAL.to_string(),
        },
        status: None,
    }
}

/// Build the desired HelmRelease for a DataCluster.
///
/// Fails when `chartRef.timeout` or `chartRef.interval` is not a duration.
pub fn helm_release_template(cluster: &DataCluster) -> Result<HelmRelease, Error> {
    let chart_ref = &cluster.spec.chart_ref;
    let name = cluster.name_any();

    let timeout = duration_or_default(
        &name,
        "spec.chartRef.timeout",
        chart_ref.timeout.as_deref(),
        DEFAULT_TIMEOUT,
    )?;
    let interval = duration_or_default(
        &name,
        "spec.chartRef.interval",
        chart_ref.interval.as_deref(),
        DEFAULT_RELEASE_INTERVAL,
    )?;

    let values = cluster.values();
    let fingerprint = values_fingerprint(&values)?;
    debug!(cluster = %cluster.key(), values_sha256 = %fingerprint, "rendered HelmRelease values");

    Ok(HelmRelease {
        metadata: owned_metadata(cluster, cluster.helm_release_name()),
        spec: HelmReleaseSpec {
            chart: HelmChartTemplate {
                spec: HelmChartTemplateSpec {
                    chart: DATA_PLANE_NAME.to_string(),
                    version: chart_ref.chart_version.clone().filter(|v| !v.is_empty()),
                    interval: Some(CHART_INTERVAL.to_string()),
                    source_ref: CrossNamespaceObjectReference {
                        kind: HELM_REPOSITORY_KIND.to_string(),
                        name: cluster.helm_repository_name(),
                        namespace: cluster.namespace(),
                    },
                },
            },
            interval,
            timeout: Some(timeout),
            values: Some(values),
            upgrade: Some(merge_upgrade(chart_ref.upgrade.as_ref())),
        },
        status: None,
    })
}

fn duration_or_default(
    cluster: &str,
    field: &str,
    value: Option<&str>,
    default: &str,
) -> Result<String, Error> {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => {
            parse_duration(field, v).map_err(|_| {
                Error::validation_for_field(cluster, field, format!("invalid duration {v:?}"))
            })?;
            Ok(v.to_string())
        }
        None => Ok(default.to_string()),
    }
}

/// Overlay the caller's upgrade settings on the operator defaults.
///
/// Defaults are `remediation: {retries: 1, strategy: rollback}`; only fields
/// the caller actually set replace them.
pub fn merge_upgrade(policy: Option<&UpgradePolicy>) -> Upgrade {
    let mut upgrade = Upgrade {
        remediation: Some(UpgradeRemediation {
            retries: Some(DEFAULT_REMEDIATION_RETRIES),
            strategy: Some(RemediationStrategy::Rollback),
        }),
        ..Default::default()
    };
    let Some(policy) = policy else {
        return upgrade;
    };

    if policy.force.is_some() {
        upgrade.force = policy.force;
    }
    if policy.cleanup_on_fail.is_some() {
        upgrade.cleanup_on_fail = policy.cleanup_on_fail;
    }
    if policy.preserve_values.is_some() {
        upgrade.preserve_values = policy.preserve_values;
    }
    if let Some(remediation) = &policy.remediation {
        let current = upgrade.remediation.get_or_insert_with(Default::default);
        if remediation.retries.is_some() {
            current.retries = remediation.retries;
        }
        if remediation.strategy.is_some() {
            current.strategy = remediation.strategy;
        }
    }
    upgrade
}

/// Whether the live release differs from the desired one in a way we manage.
///
/// Compares values, chart name, chart version and interval. An empty version
/// and `*` both mean "latest".
pub fn release_needs_update(live: &HelmRelease, desired: &HelmRelease) -> bool {
    let live_chart = &live.spec.chart.spec;
    let desired_chart = &desired.spec.chart.spec;

    live.spec.values != desired.spec.values
        || live_chart.chart != desired_chart.chart
        || normalized_version(live_chart.version.as_deref())
            != normalized_version(desired_chart.version.as_deref())
        || !durations_equal(&live.spec.interval, &desired.spec.interval)
}

fn normalized_version(version: Option<&str>) -> &str {
    match version {
        None | Some("") => "*",
        Some(v) => v,
    }
}

fn owned_metadata(cluster: &DataCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Get the HelmRepository, creating it if absent. Records its name in status.
pub async fn reconcile_helm_repository(
    cluster: &DataCluster,
    status: &mut DataClusterStatus,
    ctx: &Context,
) -> Result<HelmRepository, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.helm_repository_name();
    let cluster_ref = cluster.object_ref(&());

    let existing = match ctx.kube.get_helm_repository(&namespace, &name).await {
        Ok(existing) => existing,
        Err(e) => {
            let message = format!("error getting HelmRepository: {e}");
            warn_event(ctx, &cluster_ref, status, message).await;
            return Err(e);
        }
    };

    let repository = match existing {
        Some(repository) => repository,
        None => {
            let template = helm_repository_template(cluster);
            match ctx.kube.create_helm_repository(&template).await {
                Ok(created) => {
                    info!(repository = %name, "created HelmRepository");
                    publish(
                        ctx,
                        &cluster_ref,
                        EventType::Normal,
                        reasons::DEPENDENCY_CREATED,
                        actions::CREATE,
                        status,
                        format!("HelmRepository '{namespace}/{name}' created"),
                    )
                    .await;
                    created
                }
                Err(Error::AlreadyExists { .. }) => ctx
                    .kube
                    .get_helm_repository(&namespace, &name)
                    .await?
                    .unwrap_or(template),
                Err(e) => {
                    let message = format!("error creating HelmRepository: {e}");
                    warn_event(ctx, &cluster_ref, status, message).await;
                    return Err(e);
                }
            }
        }
    };

    status.helm_repository = Some(name);
    Ok(repository)
}

/// Get, create or update the HelmRelease. Records its name in status.
pub async fn reconcile_helm_release(
    cluster: &DataCluster,
    status: &mut DataClusterStatus,
    ctx: &Context,
) -> Result<HelmRelease, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_ref = cluster.object_ref(&());

    let desired = match helm_release_template(cluster) {
        Ok(desired) => desired,
        Err(e) => {
            let message = format!("could not create helm release template: {e}");
            warn_event(ctx, &cluster_ref, status, message).await;
            return Err(e);
        }
    };

    let live = match status.recorded_release().map(str::to_string) {
        None => None,
        Some(recorded) => match ctx.kube.get_helm_release(&namespace, &recorded).await? {
            Some(live) => Some(live),
            None => {
                info!(release = %recorded, "recorded HelmRelease is gone, recreating");
                status.helm_release = None;
                None
            }
        },
    };

    match live {
        None => create_helm_release(&namespace, desired, status, &cluster_ref, ctx).await,
        Some(live) => {
            let name = live.name_any();
            if !release_needs_update(&live, &desired) {
                status.helm_release = Some(name);
                return Ok(live);
            }

            let mut updated = live;
            updated.spec = desired.spec;
            let replaced = match ctx.kube.replace_helm_release(&updated).await {
                Ok(replaced) => replaced,
                Err(e) => {
                    warn_event(ctx, &cluster_ref, status, e.to_string()).await;
                    return Err(e);
                }
            };
            info!(release = %name, "updated HelmRelease");
            publish(
                ctx,
                &cluster_ref,
                EventType::Normal,
                reasons::DEPENDENCY_UPDATED,
                actions::UPDATE,
                status,
                format!("HelmRelease '{namespace}/{name}' updated"),
            )
            .await;
            status.helm_release = Some(name);
            Ok(replaced)
        }
    }
}

async fn create_helm_release(
    namespace: &str,
    desired: HelmRelease,
    status: &mut DataClusterStatus,
    cluster_ref: &ObjectReference,
    ctx: &Context,
) -> Result<HelmRelease, Error> {
    let name = desired.name_any();
    let release = match ctx.kube.create_helm_release(&desired).await {
        Ok(created) => {
            info!(release = %name, "created HelmRelease");
            created
        }
        // an earlier pass created it but never recorded the name
        Err(Error::AlreadyExists { .. }) => {
            debug!(release = %name, "HelmRelease already exists");
            ctx.kube
                .get_helm_release(namespace, &name)
                .await?
                .unwrap_or(desired)
        }
        Err(e) => {
            warn_event(ctx, cluster_ref, status, format!("error creating HelmRelease: {e}")).await;
            return Err(e);
        }
    };

    status.helm_release = Some(name.clone());
    publish(
        ctx,
        cluster_ref,
        EventType::Normal,
        reasons::DEPENDENCY_CREATED,
        actions::CREATE,
        status,
        format!("HelmRelease '{namespace}/{name}' created"),
    )
    .await;
    Ok(release)
}

async fn warn_event(
    ctx: &Context,
    cluster_ref: &ObjectReference,
    status: &DataClusterStatus,
    message: String,
) {
    warn!(message = %message, "dependent reconciliation failed");
    publish(
        ctx,
        cluster_ref,
        EventType::Warning,
        reasons::DEPENDENCY_FAILED,
        actions::RECONCILE,
        status,
        message,
    )
    .await;
}

async fn publish(
    ctx: &Context,
    cluster_ref: &ObjectReference,
    type_: EventType,
    reason: &str,
    action: &str,
    status: &DataClusterStatus,
    message: String,
) {
    let note = with_revision(message, status.last_attempted_revision.as_deref());
    ctx.events
        .publish(cluster_ref, type_, reason, action, Some(note))
        .await;
}
