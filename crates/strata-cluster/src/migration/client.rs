//! Untyped access to resources left behind by the legacy operator.
//!
//! Migration only touches metadata, a Service selector and deletions, so
//! every kind is handled as a `DynamicObject`. Built-in kinds use their
//! compiled-in `ApiResource`; the legacy custom kinds come from the
//! [`CrdRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use strata_common::crd_registry::{CrdKind, CrdRegistry};
use strata_common::kube_utils::{ok_if_not_found, Propagation};
use strata_common::{Error, FIELD_MANAGER};

/// Kinds the migration reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LegacyKind {
    /// Legacy `Cluster` custom resource
    Cluster,
    /// Legacy `Console` custom resource
    Console,
    /// Data-plane pods
    Pod,
    /// Internal, external and console Services
    Service,
    /// Data-plane and console ServiceAccounts
    ServiceAccount,
    /// Data-plane PodDisruptionBudget
    PodDisruptionBudget,
    /// Data-plane StatefulSet
    StatefulSet,
    /// Console Deployment
    Deployment,
    /// Console Ingress
    Ingress,
}

impl LegacyKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "Cluster",
            Self::Console => "Console",
            Self::Pod => "Pod",
            Self::Service => "Service",
            Self::ServiceAccount => "ServiceAccount",
            Self::PodDisruptionBudget => "PodDisruptionBudget",
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::Ingress => "Ingress",
        }
    }

    /// Registry entry for kinds not compiled in
    pub fn crd_kind(&self) -> Option<CrdKind> {
        match self {
            Self::Cluster => Some(CrdKind::LegacyCluster),
            Self::Console => Some(CrdKind::LegacyConsole),
            _ => None,
        }
    }

    /// Compiled-in API resource for built-in kinds
    pub fn builtin_resource(&self) -> Option<ApiResource> {
        match self {
            Self::Cluster | Self::Console => None,
            Self::Pod => Some(ApiResource::erase::<Pod>(&())),
            Self::Service => Some(ApiResource::erase::<Service>(&())),
            Self::ServiceAccount => Some(ApiResource::erase::<ServiceAccount>(&())),
            Self::PodDisruptionBudget => Some(ApiResource::erase::<PodDisruptionBudget>(&())),
            Self::StatefulSet => Some(ApiResource::erase::<StatefulSet>(&())),
            Self::Deployment => Some(ApiResource::erase::<Deployment>(&())),
            Self::Ingress => Some(ApiResource::erase::<Ingress>(&())),
        }
    }
}

impl std::fmt::Display for LegacyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client seam for the migration engine
///
/// A kind whose CRD is not installed behaves like an empty namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LegacyClient: Send + Sync {
    /// Get an object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List pods matching every label in `selector`
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Replace an object; it must carry the resourceVersion it was read at
    async fn replace(&self, kind: LegacyKind, object: &DynamicObject) -> Result<(), Error>;

    /// Delete an object with the given propagation
    async fn delete(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error>;
}

/// Real implementation backed by the API server
pub struct LegacyKubeClient {
    client: Client,
    registry: Arc<CrdRegistry>,
}

impl LegacyKubeClient {
    /// Create a client that resolves legacy kinds through `registry`
    pub fn new(client: Client, registry: Arc<CrdRegistry>) -> Self {
        Self { client, registry }
    }

    async fn api(&self, kind: LegacyKind, namespace: &str) -> Option<Api<DynamicObject>> {
        let ar = match kind.builtin_resource() {
            Some(ar) => ar,
            None => {
                let crd = kind.crd_kind()?;
                self.registry.resolve(crd).await?
            }
        };
        Some(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl LegacyClient for LegacyKubeClient {
    async fn get(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let Some(api) = self.api(kind, namespace).await else {
            debug!(%kind, "CRD not installed, nothing to migrate");
            return Ok(None);
        };
        Ok(ok_if_not_found(api.get(name).await)?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let Some(api) = self.api(LegacyKind::Pod, namespace).await else {
            return Ok(Vec::new());
        };
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn replace(&self, kind: LegacyKind, object: &DynamicObject) -> Result<(), Error> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let Some(api) = self.api(kind, &namespace).await else {
            return Err(Error::internal_with_context(
                "migration",
                format!("{kind} CRD is not installed"),
            ));
        };
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&name, &params, object)
            .await
            .map_err(|e| Error::from_kube_for(format!("{kind}/{namespace}/{name}"), e))?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error> {
        let Some(api) = self.api(kind, namespace).await else {
            return Ok(());
        };
        match api.delete(name, &propagation.delete_params()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube_for(format!("{kind}/{namespace}/{name}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(LegacyKind::Pod, "v1", "pods")]
    #[case(LegacyKind::Service, "v1", "services")]
    #[case(LegacyKind::StatefulSet, "apps/v1", "statefulsets")]
    #[case(LegacyKind::Deployment, "apps/v1", "deployments")]
    #[case(LegacyKind::PodDisruptionBudget, "policy/v1", "poddisruptionbudgets")]
    #[case(LegacyKind::Ingress, "networking.k8s.io/v1", "ingresses")]
    fn builtin_kinds_resolve_without_discovery(
        #[case] kind: LegacyKind,
        #[case] api_version: &str,
        #[case] plural: &str,
    ) {
        let ar = kind.builtin_resource().expect("built-in kind");
        assert_eq!(ar.api_version, api_version);
        assert_eq!(ar.plural, plural);
        assert_eq!(ar.kind, kind.as_str());
        assert!(kind.crd_kind().is_none());
    }

    #[test]
    fn legacy_kinds_go_through_registry() {
        assert_eq!(LegacyKind::Cluster.crd_kind(), Some(CrdKind::LegacyCluster));
        assert_eq!(LegacyKind::Console.crd_kind(), Some(CrdKind::LegacyConsole));
        assert!(LegacyKind::Console.builtin_resource().is_none());
    }

    #[test]
    fn selector_is_sorted_and_comma_joined() {
        let selector = BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "strata".to_string()),
            ("app.kubernetes.io/instance".to_string(), "main".to_string()),
        ]);
        assert_eq!(
            selector_string(&selector),
            "app.kubernetes.io/instance=main,app.kubernetes.io/name=strata"
        );
    }
}
