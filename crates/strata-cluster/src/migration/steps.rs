//! Individual adoption steps.
//!
//! Each step checks one legacy object (or the pod set) against the Helm
//! ownership markers the chart expects and mutates it only when something is
//! missing. A step that finds nothing to do issues no writes and no events.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use strata_common::crd::legacy::{
    helm, labels, CONSOLE_ACL_FINALIZER, CONSOLE_SA_FINALIZER, LEGACY_MANAGED_ANNOTATION,
    STATEFULSET_COMPONENT,
};
use strata_common::crd::DataCluster;
use strata_common::events::{actions, reasons, with_revision, EventPublisher};
use strata_common::kube_utils::{remove_finalizer, Propagation};
use strata_common::{Error, CONSOLE_NAME, DATA_CLUSTER_FINALIZER, DATA_PLANE_NAME};

use super::client::{LegacyClient, LegacyKind};

/// The Helm release legacy objects are handed over to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationTarget {
    /// Release name (the DataCluster name)
    pub release: String,
    /// Release namespace (the DataCluster namespace)
    pub namespace: String,
    /// Revision attached to migration events
    pub revision: Option<String>,
}

impl MigrationTarget {
    /// Target derived from a DataCluster
    pub fn for_cluster(cluster: &DataCluster) -> Self {
        Self {
            release: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            revision: cluster.last_attempted_revision().map(str::to_string),
        }
    }
}

/// One unit of migration work
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationStep {
    /// Annotate the legacy Cluster as unmanaged
    DisableLegacyCluster {
        /// Namespace of the legacy Cluster
        namespace: String,
        /// Name of the legacy Cluster
        name: String,
    },
    /// Annotate the legacy Console as unmanaged and strip its finalizers
    DisableLegacyConsole {
        /// Namespace of the legacy Console
        namespace: String,
        /// Name of the legacy Console
        name: String,
    },
    /// Label data-plane pods with the chart's component and drop our finalizer
    RelabelPods {
        /// Namespace to list pods in
        namespace: String,
        /// Label selector of the data-plane pods
        selector: BTreeMap<String, String>,
    },
    /// Add Helm ownership markers, optionally forcing a Service selector
    Stamp {
        /// Step name reported on failure
        step: &'static str,
        /// Kind of the object
        kind: LegacyKind,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
        /// Selector the Service must end up with
        selector: Option<BTreeMap<String, String>>,
        /// Event note on mutation
        message: &'static str,
    },
    /// Delete an object Helm cannot adopt so the chart recreates it
    Recreate {
        /// Step name reported on failure
        step: &'static str,
        /// Kind of the object
        kind: LegacyKind,
        /// Object namespace
        namespace: String,
        /// Object name
        name: String,
        /// Propagation for the delete
        propagation: Propagation,
        /// Event note on mutation
        message: &'static str,
    },
}

/// `{instance: <release>, name: <component>}`
pub fn component_selector(release: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::INSTANCE.to_string(), release.to_string()),
        (labels::NAME.to_string(), component.to_string()),
    ])
}

/// The ordered migration plan for a DataCluster
pub fn plan(cluster: &DataCluster) -> Vec<MigrationStep> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let migration = cluster.spec.migration.clone().unwrap_or_default();
    let resources = cluster.resources_name();
    let data_plane = component_selector(&name, DATA_PLANE_NAME);

    let (cluster_ns, cluster_name) = migration.cluster_ref.resolve(&namespace, &name);
    let (console_ns, console_name) = migration.console_ref.resolve(&namespace, &name);

    let stamp = |step, kind, object: &str, selector, message| MigrationStep::Stamp {
        step,
        kind,
        namespace: namespace.clone(),
        name: object.to_string(),
        selector,
        message,
    };

    let mut steps = vec![
        MigrationStep::DisableLegacyCluster {
            namespace: cluster_ns,
            name: cluster_name,
        },
        MigrationStep::DisableLegacyConsole {
            namespace: console_ns,
            name: console_name,
        },
        MigrationStep::RelabelPods {
            namespace: namespace.clone(),
            selector: data_plane.clone(),
        },
        stamp(
            "internal-service",
            LegacyKind::Service,
            &resources,
            Some(data_plane),
            "update internal Service",
        ),
        stamp(
            "external-service",
            LegacyKind::Service,
            &format!("{resources}-external"),
            None,
            "update external Service",
        ),
        stamp(
            "service-account",
            LegacyKind::ServiceAccount,
            &resources,
            None,
            "update ServiceAccount",
        ),
        stamp(
            "pod-disruption-budget",
            LegacyKind::PodDisruptionBudget,
            &resources,
            None,
            "update PodDisruptionBudget",
        ),
        MigrationStep::Recreate {
            step: "statefulset",
            kind: LegacyKind::StatefulSet,
            namespace: namespace.clone(),
            name: resources,
            propagation: Propagation::Orphan,
            message: "delete StatefulSet with orphan propagation",
        },
    ];

    if cluster.console_enabled() {
        let console = cluster.console_resources_name();
        steps.extend([
            stamp(
                "console-service-account",
                LegacyKind::ServiceAccount,
                &console,
                None,
                "update console ServiceAccount",
            ),
            stamp(
                "console-service",
                LegacyKind::Service,
                &console,
                Some(component_selector(&name, CONSOLE_NAME)),
                "update console Service",
            ),
            MigrationStep::Recreate {
                step: "console-deployment",
                kind: LegacyKind::Deployment,
                namespace: namespace.clone(),
                name: console.clone(),
                propagation: Propagation::Background,
                message: "delete console Deployment",
            },
            stamp(
                "console-ingress",
                LegacyKind::Ingress,
                &console,
                None,
                "update console Ingress",
            ),
        ]);
    }
    steps
}

impl MigrationStep {
    /// Stable name used in logs and in [`super::MigrationError`]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DisableLegacyCluster { .. } => "legacy-cluster",
            Self::DisableLegacyConsole { .. } => "legacy-console",
            Self::RelabelPods { .. } => "pods",
            Self::Stamp { step, .. } | Self::Recreate { step, .. } => *step,
        }
    }

    /// Bring the step's objects in line with `target`.
    ///
    /// Returns the number of objects mutated. Objects that do not exist are
    /// skipped.
    pub async fn ensure_migrated(
        &self,
        target: &MigrationTarget,
        legacy: &dyn LegacyClient,
        events: &dyn EventPublisher,
    ) -> Result<usize, Error> {
        match self {
            Self::DisableLegacyCluster { namespace, name } => {
                let Some(mut object) = fetch(legacy, LegacyKind::Cluster, namespace, name).await?
                else {
                    return Ok(0);
                };
                if is_disabled(&object) {
                    return Ok(0);
                }
                disable(&mut object);
                legacy.replace(LegacyKind::Cluster, &object).await?;
                let message = "update Cluster custom resource";
                notify(events, LegacyKind::Cluster, &object, target, message).await;
                Ok(1)
            }
            Self::DisableLegacyConsole { namespace, name } => {
                let Some(mut object) = fetch(legacy, LegacyKind::Console, namespace, name).await?
                else {
                    return Ok(0);
                };
                let finalizers = object.finalizers();
                let holds_finalizer = finalizers
                    .iter()
                    .any(|f| f == CONSOLE_SA_FINALIZER || f == CONSOLE_ACL_FINALIZER);
                if is_disabled(&object) && !holds_finalizer {
                    return Ok(0);
                }
                disable(&mut object);
                let finalizers = object.finalizers_mut();
                remove_finalizer(finalizers, CONSOLE_SA_FINALIZER);
                remove_finalizer(finalizers, CONSOLE_ACL_FINALIZER);
                legacy.replace(LegacyKind::Console, &object).await?;
                let message = "update Console custom resource";
                notify(events, LegacyKind::Console, &object, target, message).await;
                Ok(1)
            }
            Self::RelabelPods {
                namespace,
                selector,
            } => relabel_pods(namespace, selector, target, legacy, events).await,
            Self::Stamp {
                kind,
                namespace,
                name,
                selector,
                message,
                ..
            } => {
                let Some(mut object) = fetch(legacy, *kind, namespace, name).await? else {
                    return Ok(0);
                };
                let selector_ok = selector
                    .as_ref()
                    .map(|want| &current_selector(&object) == want)
                    .unwrap_or(true);
                if has_helm_ownership(&object, target) && selector_ok {
                    return Ok(0);
                }
                stamp_helm_ownership(&mut object, target);
                if let Some(selector) = selector {
                    set_selector(&mut object, selector)?;
                }
                legacy.replace(*kind, &object).await?;
                notify(events, *kind, &object, target, message).await;
                Ok(1)
            }
            Self::Recreate {
                kind,
                namespace,
                name,
                propagation,
                message,
                ..
            } => {
                let Some(object) = fetch(legacy, *kind, namespace, name).await? else {
                    return Ok(0);
                };
                if has_helm_ownership(&object, target) {
                    return Ok(0);
                }
                legacy.delete(*kind, namespace, name, *propagation).await?;
                notify(events, *kind, &object, target, message).await;
                Ok(1)
            }
        }
    }
}

async fn fetch(
    legacy: &dyn LegacyClient,
    kind: LegacyKind,
    namespace: &str,
    name: &str,
) -> Result<Option<DynamicObject>, Error> {
    let object = legacy.get(kind, namespace, name).await?;
    if object.is_none() {
        debug!(%kind, %namespace, %name, "not found, skipping");
    }
    Ok(object)
}

async fn relabel_pods(
    namespace: &str,
    selector: &BTreeMap<String, String>,
    target: &MigrationTarget,
    legacy: &dyn LegacyClient,
    events: &dyn EventPublisher,
) -> Result<usize, Error> {
    let pods = legacy.list_pods(namespace, selector).await?;
    let mut mutated = 0;
    let mut errors = Vec::new();

    for pod in pods {
        let labelled = pod
            .labels()
            .get(labels::COMPONENT)
            .is_some_and(|v| v == STATEFULSET_COMPONENT);
        let holds_finalizer = pod.finalizers().iter().any(|f| f == DATA_CLUSTER_FINALIZER);
        if labelled && !holds_finalizer {
            continue;
        }

        let mut updated = pod;
        updated
            .labels_mut()
            .insert(labels::COMPONENT.to_string(), STATEFULSET_COMPONENT.to_string());
        remove_finalizer(updated.finalizers_mut(), DATA_CLUSTER_FINALIZER);

        match legacy.replace(LegacyKind::Pod, &updated).await {
            Ok(()) => {
                notify(events, LegacyKind::Pod, &updated, target, "update Pod").await;
                mutated += 1;
            }
            Err(e) => errors.push(format!("{}: {e}", updated.name_any())),
        }
    }

    if errors.is_empty() {
        Ok(mutated)
    } else {
        Err(Error::internal_with_context(
            "migration",
            format!("updating pods: {}", errors.join("; ")),
        ))
    }
}

fn is_disabled(object: &DynamicObject) -> bool {
    object
        .annotations()
        .get(LEGACY_MANAGED_ANNOTATION)
        .is_some_and(|v| v == "false")
}

fn disable(object: &mut DynamicObject) {
    object
        .annotations_mut()
        .insert(LEGACY_MANAGED_ANNOTATION.to_string(), "false".to_string());
}

/// Whether `object` already carries the Helm ownership markers for `target`
pub fn has_helm_ownership(object: &DynamicObject, target: &MigrationTarget) -> bool {
    let managed = object
        .labels()
        .get(helm::MANAGED_BY_LABEL)
        .is_some_and(|v| v == helm::MANAGED_BY_HELM);
    let annotations = object.annotations();
    let release = annotations
        .get(helm::RELEASE_NAME_ANNOTATION)
        .is_some_and(|v| *v == target.release);
    let namespace = annotations
        .get(helm::RELEASE_NAMESPACE_ANNOTATION)
        .is_some_and(|v| *v == target.namespace);
    managed && release && namespace
}

/// Merge the Helm ownership markers into existing metadata
pub fn stamp_helm_ownership(object: &mut DynamicObject, target: &MigrationTarget) {
    object.labels_mut().insert(
        helm::MANAGED_BY_LABEL.to_string(),
        helm::MANAGED_BY_HELM.to_string(),
    );
    let annotations = object.annotations_mut();
    annotations.insert(
        helm::RELEASE_NAME_ANNOTATION.to_string(),
        target.release.clone(),
    );
    annotations.insert(
        helm::RELEASE_NAMESPACE_ANNOTATION.to_string(),
        target.namespace.clone(),
    );
}

fn current_selector(object: &DynamicObject) -> BTreeMap<String, String> {
    object
        .data
        .pointer("/spec/selector")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn set_selector(
    object: &mut DynamicObject,
    selector: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let name = object.name_any();
    let spec = object
        .data
        .get_mut("spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            Error::internal_with_context("migration", format!("Service {name} has no spec"))
        })?;
    let selector = selector
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect::<serde_json::Map<_, _>>();
    spec.insert("selector".to_string(), Value::Object(selector));
    Ok(())
}

fn object_reference(kind: LegacyKind, object: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: object.types.as_ref().map(|t| t.api_version.clone()),
        kind: Some(kind.as_str().to_string()),
        name: object.metadata.name.clone(),
        namespace: object.metadata.namespace.clone(),
        uid: object.metadata.uid.clone(),
        ..Default::default()
    }
}

async fn notify(
    events: &dyn EventPublisher,
    kind: LegacyKind,
    object: &DynamicObject,
    target: &MigrationTarget,
    message: &str,
) {
    debug!(%kind, name = %object.name_any(), message, "migrated object");
    events
        .publish(
            &object_reference(kind, object),
            EventType::Normal,
            reasons::MIGRATED,
            actions::MIGRATE,
            Some(with_revision(message, target.revision.as_deref())),
        )
        .await;
}
