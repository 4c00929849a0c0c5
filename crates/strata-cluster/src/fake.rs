//! In-memory API server for stateful controller tests.
//!
//! Implements both client traits over one shared store. Writes are checked
//! against `resourceVersion` like the real API server and recorded in an
//! operation log; reads are not logged, so a quiet pass leaves the log empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};

use strata_common::crd::{
    DataCluster, DataClusterStatus, FluxCondition, HelmRelease, HelmReleaseStatus,
    HelmRepository, HelmRepositoryStatus, CONDITION_READY,
};
use strata_common::kube_utils::Propagation;
use strata_common::Error;

use crate::controller::KubeClient;
use crate::migration::{LegacyClient, LegacyKind};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn key_of<K: Resource>(object: &K) -> Key {
    key(
        object.meta().namespace.as_deref().unwrap_or_default(),
        object.meta().name.as_deref().unwrap_or_default(),
    )
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<Key, DataCluster>,
    repositories: BTreeMap<Key, HelmRepository>,
    releases: BTreeMap<Key, HelmRelease>,
    legacy: BTreeMap<(LegacyKind, String, String), DynamicObject>,
    failing_gets: BTreeSet<LegacyKind>,
    ops: Vec<String>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> Option<String> {
        self.next_version += 1;
        Some(self.next_version.to_string())
    }

    fn check_version(
        &self,
        resource: String,
        stored: Option<&str>,
        submitted: Option<&str>,
    ) -> Result<(), Error> {
        if submitted.is_some() && stored != submitted {
            return Err(Error::Conflict {
                resource,
                message: "the object has been modified".to_string(),
            });
        }
        Ok(())
    }
}

fn ready_conditions(ready: bool, generation: Option<i64>) -> Vec<FluxCondition> {
    vec![FluxCondition {
        type_: CONDITION_READY.to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        reason: if ready { "Succeeded" } else { "Progressing" }.to_string(),
        message: String::new(),
        observed_generation: generation,
    }]
}

/// Shared in-memory store implementing [`KubeClient`] and [`LegacyClient`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    auto_ready: bool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created or updated Flux objects report ready immediately
    pub fn with_auto_ready(mut self) -> Self {
        self.auto_ready = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake state poisoned")
    }

    pub fn insert_cluster(&self, mut cluster: DataCluster) {
        let mut state = self.state();
        cluster.metadata.generation.get_or_insert(1);
        let uid = format!("uid-{}", cluster.name_any());
        cluster.metadata.uid.get_or_insert(uid);
        cluster.metadata.resource_version = state.bump();
        state.clusters.insert(key_of(&cluster), cluster);
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<DataCluster> {
        self.state().clusters.get(&key(namespace, name)).cloned()
    }

    /// Edit a stored DataCluster; spec changes bump the generation
    pub fn update_cluster(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut DataCluster)) {
        let mut state = self.state();
        let version = state.bump();
        let cluster = state
            .clusters
            .get_mut(&key(namespace, name))
            .expect("cluster exists");
        let before = cluster.spec.clone();
        edit(cluster);
        if cluster.spec != before {
            cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
        }
        cluster.metadata.resource_version = version;
    }

    /// Simulate `kubectl delete` on an object holding finalizers
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        self.update_cluster(namespace, name, |c| {
            c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        });
    }

    pub fn repository(&self, namespace: &str, name: &str) -> Option<HelmRepository> {
        self.state().repositories.get(&key(namespace, name)).cloned()
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<HelmRelease> {
        self.state().releases.get(&key(namespace, name)).cloned()
    }

    /// Flux reports on the repository's current generation
    pub fn set_repository_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state();
        let repository = state
            .repositories
            .get_mut(&key(namespace, name))
            .expect("repository exists");
        let generation = repository.metadata.generation;
        repository.status = Some(HelmRepositoryStatus {
            observed_generation: generation,
            conditions: ready_conditions(ready, generation),
        });
    }

    /// Flux and the garbage collector finish tearing the release down
    pub fn finish_release_deletion(&self, namespace: &str, name: &str) {
        self.state().releases.remove(&key(namespace, name));
    }

    pub fn insert_legacy(&self, kind: LegacyKind, object: DynamicObject) {
        let namespace = object.namespace().unwrap_or_default();
        self.state()
            .legacy
            .insert((kind, namespace, object.name_any()), object);
    }

    pub fn legacy(&self, kind: LegacyKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .legacy
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make every get of `kind` fail
    pub fn fail_legacy_get(&self, kind: LegacyKind) {
        self.state().failing_gets.insert(kind);
    }

    /// Writes issued so far, oldest first
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Number of delete calls issued for `kind`
    pub fn delete_count(&self, kind: &str) -> usize {
        let prefix = format!("delete {kind} ");
        self.state()
            .ops
            .iter()
            .filter(|op| op.starts_with(&prefix))
            .count()
    }

    fn settle_release(&self, release: &mut HelmRelease) {
        if !self.auto_ready {
            return;
        }
        let generation = release.metadata.generation;
        release.status = Some(HelmReleaseStatus {
            observed_generation: generation,
            conditions: ready_conditions(true, generation),
            last_attempted_revision: Some(
                release
                    .spec
                    .chart
                    .spec
                    .version
                    .clone()
                    .unwrap_or_else(|| "latest".to_string()),
            ),
        });
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataCluster>, Error> {
        Ok(self.cluster(namespace, name))
    }

    async fn patch_finalizers(
        &self,
        cluster: &DataCluster,
        finalizers: Vec<String>,
    ) -> Result<DataCluster, Error> {
        let mut state = self.state();
        let k = key_of(cluster);
        let resource = format!("DataCluster/{}/{}", k.0, k.1);
        let stored = state
            .clusters
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::internal(format!("{resource} not found")))?;
        state.check_version(
            resource.clone(),
            stored.metadata.resource_version.as_deref(),
            cluster.metadata.resource_version.as_deref(),
        )?;

        let mut updated = stored;
        updated.metadata.finalizers = Some(finalizers);
        updated.metadata.resource_version = state.bump();
        state.ops.push(format!("finalizers DataCluster {}/{}", k.0, k.1));

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.clusters.remove(&k);
        } else {
            state.clusters.insert(k, updated.clone());
        }
        Ok(updated)
    }

    async fn patch_status(
        &self,
        latest: &DataCluster,
        status: &DataClusterStatus,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let k = key_of(latest);
        let resource = format!("DataCluster/{}/{}", k.0, k.1);
        let stored_version = state
            .clusters
            .get(&k)
            .ok_or_else(|| Error::internal(format!("{resource} not found")))?
            .metadata
            .resource_version
            .clone();
        state.check_version(
            resource,
            stored_version.as_deref(),
            latest.metadata.resource_version.as_deref(),
        )?;

        let version = state.bump();
        if let Some(cluster) = state.clusters.get_mut(&k) {
            cluster.status = Some(status.clone());
            cluster.metadata.resource_version = version;
        }
        state.ops.push(format!("status DataCluster {}/{}", k.0, k.1));
        Ok(())
    }

    async fn get_helm_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRepository>, Error> {
        Ok(self.repository(namespace, name))
    }

    async fn create_helm_repository(
        &self,
        repository: &HelmRepository,
    ) -> Result<HelmRepository, Error> {
        let mut state = self.state();
        let k = key_of(repository);
        if state.repositories.contains_key(&k) {
            return Err(Error::AlreadyExists {
                resource: format!("HelmRepository/{}/{}", k.0, k.1),
            });
        }

        let mut created = repository.clone();
        created.metadata.generation = Some(1);
        created.metadata.resource_version = state.bump();
        if self.auto_ready {
            created.status = Some(HelmRepositoryStatus {
                observed_generation: Some(1),
                conditions: ready_conditions(true, Some(1)),
            });
        }
        state.ops.push(format!("create HelmRepository {}/{}", k.0, k.1));
        state.repositories.insert(k, created.clone());
        Ok(created)
    }

    async fn get_helm_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRelease>, Error> {
        Ok(self.release(namespace, name))
    }

    async fn create_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
        let mut state = self.state();
        let k = key_of(release);
        if state.releases.contains_key(&k) {
            return Err(Error::AlreadyExists {
                resource: format!("HelmRelease/{}/{}", k.0, k.1),
            });
        }

        let mut created = release.clone();
        created.metadata.generation = Some(1);
        created.metadata.resource_version = state.bump();
        self.settle_release(&mut created);
        state.ops.push(format!("create HelmRelease {}/{}", k.0, k.1));
        state.releases.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
        let mut state = self.state();
        let k = key_of(release);
        let resource = format!("HelmRelease/{}/{}", k.0, k.1);
        let stored = state
            .releases
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::internal(format!("{resource} not found")))?;
        state.check_version(
            resource,
            stored.metadata.resource_version.as_deref(),
            release.metadata.resource_version.as_deref(),
        )?;

        let mut replaced = release.clone();
        replaced.status = stored.status;
        replaced.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
        replaced.metadata.resource_version = state.bump();
        self.settle_release(&mut replaced);
        state.ops.push(format!("replace HelmRelease {}/{}", k.0, k.1));
        state.releases.insert(k, replaced.clone());
        Ok(replaced)
    }

    async fn delete_helm_release(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.ops.push(format!("delete HelmRelease {namespace}/{name}"));
        // foreground deletion: the object lingers until its dependents are gone
        if let Some(release) = state.releases.get_mut(&key(namespace, name)) {
            release
                .metadata
                .deletion_timestamp
                .get_or_insert_with(|| Time(chrono::Utc::now()));
        }
        Ok(())
    }
}

#[async_trait]
impl LegacyClient for FakeCluster {
    async fn get(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        if self.state().failing_gets.contains(&kind) {
            return Err(Error::internal_with_context(
                "fake",
                format!("{kind} lookup failed"),
            ));
        }
        Ok(self.legacy(kind, namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        Ok(self
            .state()
            .legacy
            .iter()
            .filter(|((kind, ns, _), _)| *kind == LegacyKind::Pod && ns == namespace)
            .filter(|(_, pod)| {
                selector
                    .iter()
                    .all(|(k, v)| pod.labels().get(k) == Some(v))
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn replace(&self, kind: LegacyKind, object: &DynamicObject) -> Result<(), Error> {
        let mut state = self.state();
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let k = (kind, namespace.clone(), name.clone());
        let resource = format!("{kind}/{namespace}/{name}");
        let stored_version = state
            .legacy
            .get(&k)
            .ok_or_else(|| Error::internal(format!("{resource} not found")))?
            .metadata
            .resource_version
            .clone();
        state.check_version(
            resource,
            stored_version.as_deref(),
            object.metadata.resource_version.as_deref(),
        )?;

        let mut replaced = object.clone();
        replaced.metadata.resource_version = state.bump();
        state.ops.push(format!("replace {kind} {namespace}/{name}"));
        state.legacy.insert(k, replaced);
        Ok(())
    }

    async fn delete(
        &self,
        kind: LegacyKind,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state
            .ops
            .push(format!("delete {kind} {namespace}/{name} ({propagation:?})"));
        state
            .legacy
            .remove(&(kind, namespace.to_string(), name.to_string()));
        Ok(())
    }
}
