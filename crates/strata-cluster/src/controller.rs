//! DataCluster controller implementation
//!
//! Each invocation reads the latest DataCluster, handles deletion and the
//! unmanaged opt-out, ensures the finalizer, optionally migrates legacy
//! resources, and then drives the HelmRepository and HelmRelease to ready.
//! Status is written back at the end of every pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use strata_common::crd::{
    condition_reasons, DataCluster, DataClusterStatus, HelmRelease, HelmRepository,
    ReadinessSignals, Readiness,
};
use strata_common::crd_registry::CrdRegistry;
use strata_common::events::{actions, reasons, with_revision, EventPublisher, KubeEventPublisher};
use strata_common::kube_utils::{add_finalizer, ok_if_not_found, remove_finalizer, Propagation};
use strata_common::{Error, DATA_CLUSTER_FINALIZER, FIELD_MANAGER};

use crate::deletion::reconcile_delete;
use crate::dependents::{reconcile_helm_release, reconcile_helm_repository};
use crate::migration::{self, LegacyClient, LegacyKubeClient};
use crate::readiness::{latch, Dependent, Transition};

/// Requeue delay while a dependent is being deleted
pub const DELETION_REQUEUE: Duration = Duration::from_secs(1);

/// First backoff delay after a failed reconcile
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Upper bound for the backoff delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Trait abstracting Kubernetes client operations for DataCluster
///
/// Lookups return `Ok(None)` for objects that do not exist. Writes carry the
/// caller's `resourceVersion` so concurrent modification surfaces as
/// [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a DataCluster
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<DataCluster>, Error>;

    /// Replace the finalizer list of a DataCluster
    ///
    /// Returns the updated object.
    async fn patch_finalizers(
        &self,
        cluster: &DataCluster,
        finalizers: Vec<String>,
    ) -> Result<DataCluster, Error>;

    /// Merge-patch the status sub-resource of `latest`
    async fn patch_status(
        &self,
        latest: &DataCluster,
        status: &DataClusterStatus,
    ) -> Result<(), Error>;

    /// Get a HelmRepository
    async fn get_helm_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRepository>, Error>;

    /// Create a HelmRepository
    async fn create_helm_repository(
        &self,
        repository: &HelmRepository,
    ) -> Result<HelmRepository, Error>;

    /// Get a HelmRelease
    async fn get_helm_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRelease>, Error>;

    /// Create a HelmRelease
    async fn create_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error>;

    /// Replace a HelmRelease; `release` must carry the live resourceVersion
    async fn replace_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error>;

    /// Delete a HelmRelease with foreground propagation
    ///
    /// Deleting an object that is already gone is not an error.
    async fn delete_helm_release(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn resource_id(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataCluster>, Error> {
        let api: Api<DataCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(ok_if_not_found(api.get(name).await)?)
    }

    async fn patch_finalizers(
        &self,
        cluster: &DataCluster,
        finalizers: Vec<String>,
    ) -> Result<DataCluster, Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let api: Api<DataCluster> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": cluster.resource_version(),
                "finalizers": finalizers,
            }
        });

        api.patch(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube_for(resource_id("DataCluster", &namespace, &name), e))
    }

    async fn patch_status(
        &self,
        latest: &DataCluster,
        status: &DataClusterStatus,
    ) -> Result<(), Error> {
        let namespace = latest.namespace().unwrap_or_default();
        let name = latest.name_any();
        let api: Api<DataCluster> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": latest.resource_version() },
            "status": status,
        });

        api.patch_status(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube_for(resource_id("DataCluster", &namespace, &name), e))?;
        Ok(())
    }

    async fn get_helm_repository(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRepository>, Error> {
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), namespace);
        Ok(ok_if_not_found(api.get(name).await)?)
    }

    async fn create_helm_repository(
        &self,
        repository: &HelmRepository,
    ) -> Result<HelmRepository, Error> {
        let namespace = repository.namespace().unwrap_or_default();
        let api: Api<HelmRepository> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), repository)
            .await
            .map_err(|e| {
                Error::from_kube_for(
                    resource_id("HelmRepository", &namespace, &repository.name_any()),
                    e,
                )
            })
    }

    async fn get_helm_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HelmRelease>, Error> {
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), namespace);
        Ok(ok_if_not_found(api.get(name).await)?)
    }

    async fn create_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
        let namespace = release.namespace().unwrap_or_default();
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), release)
            .await
            .map_err(|e| {
                Error::from_kube_for(
                    resource_id("HelmRelease", &namespace, &release.name_any()),
                    e,
                )
            })
    }

    async fn replace_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
        let namespace = release.namespace().unwrap_or_default();
        let name = release.name_any();
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(), release)
            .await
            .map_err(|e| Error::from_kube_for(resource_id("HelmRelease", &namespace, &name), e))
    }

    async fn delete_helm_release(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), namespace);
        match api
            .delete(name, &Propagation::Foreground.delete_params())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube_for(
                resource_id("HelmRelease", namespace, name),
                e,
            )),
        }
    }
}

/// Tunables for the reconcile loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Requeue delay while a dependent is not ready
    pub requeue_dependencies: Duration,
    /// Deadline for a single reconcile invocation
    pub reconcile_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            requeue_dependencies: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(120),
        }
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, registry)
///     .config(ReconcilerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for DataCluster and Flux objects
    pub kube: Arc<dyn KubeClient>,
    /// Client for resources left by the legacy operator
    pub legacy: Arc<dyn LegacyClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Loop tunables
    pub config: ReconcilerConfig,
    /// Consecutive failures per `namespace/name`, for backoff
    pub failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, registry: Arc<CrdRegistry>) -> ContextBuilder {
        ContextBuilder::new(client, registry)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        legacy: Arc<dyn LegacyClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            legacy,
            events,
            config: ReconcilerConfig::default(),
            failures: DashMap::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    registry: Arc<CrdRegistry>,
    config: ReconcilerConfig,
    kube: Option<Arc<dyn KubeClient>>,
    legacy: Option<Arc<dyn LegacyClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, registry: Arc<CrdRegistry>) -> Self {
        Self {
            client,
            registry,
            config: ReconcilerConfig::default(),
            kube: None,
            legacy: None,
            events: None,
        }
    }

    /// Set the loop tunables
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the legacy resource client
    pub fn legacy_client(mut self, legacy: Arc<dyn LegacyClient>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            legacy: self.legacy.unwrap_or_else(|| {
                Arc::new(LegacyKubeClient::new(
                    self.client.clone(),
                    self.registry.clone(),
                ))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    "strata-controller",
                ))
            }),
            config: self.config,
            failures: DashMap::new(),
        }
    }
}

/// Reconcile a DataCluster
///
/// Runs one pass under the configured deadline. Success clears the key's
/// backoff counter.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.key()))]
pub async fn reconcile(cluster: Arc<DataCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    let key = cluster.key();
    let deadline = ctx.config.reconcile_timeout;

    let result = match tokio::time::timeout(deadline, reconcile_inner(&cluster, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            cluster: key.clone(),
            after: deadline,
        }),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(action) => {
            ctx.failures.remove(&key);
            debug!(elapsed_ms, ?action, "reconcile finished");
        }
        Err(e) => debug!(elapsed_ms, error = %e, "reconcile failed"),
    }
    result
}

async fn reconcile_inner(cluster: &DataCluster, ctx: &Context) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let Some(mut cluster) = ctx.kube.get_cluster(&namespace, &name).await? else {
        debug!("DataCluster no longer exists");
        return Ok(Action::await_change());
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        return reconcile_delete(&cluster, ctx).await;
    }

    if !cluster.is_managed() {
        if cluster.has_finalizer() {
            let mut finalizers = cluster.finalizers().to_vec();
            remove_finalizer(&mut finalizers, DATA_CLUSTER_FINALIZER);
            ctx.kube.patch_finalizers(&cluster, finalizers).await?;
            info!("DataCluster is unmanaged, removed finalizer");
        }
        return Ok(Action::await_change());
    }

    if !cluster.has_finalizer() {
        let mut finalizers = cluster.finalizers().to_vec();
        add_finalizer(&mut finalizers, DATA_CLUSTER_FINALIZER);
        cluster = ctx.kube.patch_finalizers(&cluster, finalizers).await?;
        info!("added finalizer");
    }

    if cluster.migration_enabled() {
        if let Err(e) = migration::migrate(&cluster, ctx.legacy.as_ref(), ctx.events.as_ref()).await
        {
            warn!(error = %e, failed_steps = ?e.failed_steps(), "migration incomplete");
        }
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    let outcome = reconcile_dependents(&cluster, &mut status, ctx).await;
    let persisted = persist_status(&cluster, &status, ctx).await;

    // a failed status write wins over the dependents outcome
    persisted?;
    outcome
}

async fn reconcile_dependents(
    cluster: &DataCluster,
    status: &mut DataClusterStatus,
    ctx: &Context,
) -> Result<Action, Error> {
    let generation = cluster.metadata.generation;

    if status.observed_generation != generation {
        status.observed_generation = generation;
        status.mark_progressing(generation);
        persist_status(cluster, status, ctx).await?;
    }

    let repository = reconcile_helm_repository(cluster, status, ctx).await?;
    if observe_readiness(Dependent::HelmRepository, &repository, cluster, status, ctx).await
        != Readiness::Ready
    {
        status.mark_not_ready(
            condition_reasons::ARTIFACT_FAILED,
            format!("HelmRepository '{}' is not ready", repository.name_any()),
            generation,
        );
        return Ok(Action::requeue(ctx.config.requeue_dependencies));
    }

    let release = reconcile_helm_release(cluster, status, ctx).await?;
    if let Some(revision) = release.last_attempted_revision() {
        status.last_attempted_revision = Some(revision.to_string());
    }
    if observe_readiness(Dependent::HelmRelease, &release, cluster, status, ctx).await
        != Readiness::Ready
    {
        status.mark_not_ready(
            condition_reasons::ARTIFACT_FAILED,
            format!("HelmRelease '{}' is not ready", release.name_any()),
            generation,
        );
        return Ok(Action::requeue(ctx.config.requeue_dependencies));
    }

    status.mark_ready(generation);
    Ok(Action::await_change())
}

/// Feed one observation of `object` into its latch and publish the edge.
async fn observe_readiness<R: ReadinessSignals>(
    dependent: Dependent,
    object: &R,
    cluster: &DataCluster,
    status: &mut DataClusterStatus,
    ctx: &Context,
) -> Readiness {
    let slot = dependent.readiness_mut(status);
    let (next, transition) = latch(
        *slot,
        object.is_generation_fresh(),
        object.is_condition_ready(),
    );
    *slot = next;

    let Some(transition) = transition else {
        return next;
    };

    let namespace = object.meta().namespace.clone().unwrap_or_default();
    let name = object.meta().name.clone().unwrap_or_default();
    let message = transition.message(dependent.kind(), &namespace, &name);
    // both edges are informational
    let reason = match transition {
        Transition::BecameReady => reasons::DEPENDENCY_READY,
        Transition::BecameNotReady => reasons::DEPENDENCY_NOT_READY,
    };
    info!(kind = dependent.kind(), %name, readiness = %next, "dependent readiness changed");

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reason,
            actions::RECONCILE,
            Some(with_revision(message, status.last_attempted_revision.as_deref())),
        )
        .await;
    next
}

/// Write `status` onto the latest copy of the DataCluster.
///
/// Skips the write when nothing changed; a vanished object is not an error.
pub(crate) async fn persist_status(
    cluster: &DataCluster,
    status: &DataClusterStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let Some(latest) = ctx.kube.get_cluster(&namespace, &cluster.name_any()).await? else {
        return Ok(());
    };

    if latest.status.as_ref() == Some(status) {
        return Ok(());
    }

    ctx.kube.patch_status(&latest, status).await?;
    debug!(
        ready = ?status.conditions.first().map(|c| c.status),
        release = ?status.helm_release,
        "status updated"
    );
    Ok(())
}

/// Backoff delay after `retries` consecutive failures
pub fn backoff_delay(retries: u32) -> Duration {
    let factor = 2u32.saturating_pow(retries.saturating_sub(1).min(6));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Error policy for the controller
///
/// Pending deletions come back after [`DELETION_REQUEUE`]. Errors that need
/// a spec change wait for one. Everything else backs off exponentially per
/// DataCluster.
pub fn error_policy(cluster: Arc<DataCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster.key();

    if error.is_deletion_pending() {
        debug!(cluster = %key, %error, "dependent deletion in progress");
        return Action::requeue(DELETION_REQUEUE);
    }

    if !error.is_retryable() {
        error!(cluster = %key, %error, "reconciliation failed, waiting for a spec change");
        return Action::await_change();
    }

    let retries = {
        let mut entry = ctx.failures.entry(key.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    };
    let delay = backoff_delay(retries);
    warn!(cluster = %key, %error, retries, delay_secs = delay.as_secs(), "reconciliation failed");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    use strata_common::crd::{ChartRef, ConditionStatus, DataClusterSpec, MigrationSpec};
    use strata_common::events::RecordingEventPublisher;
    use strata_common::MANAGED_ANNOTATION;

    use crate::fake::FakeCluster;
    use crate::migration::{LegacyKind, MockLegacyClient};

    fn sample_cluster() -> DataCluster {
        DataCluster {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("data".to_string()),
                ..Default::default()
            },
            spec: DataClusterSpec {
                chart_ref: ChartRef {
                    chart_version: Some("5.0.3".to_string()),
                    ..Default::default()
                },
                cluster_spec: Some(serde_json::json!({"statefulset": {"replicas": 3}})),
                migration: None,
            },
            status: None,
        }
    }

    struct Harness {
        fake: Arc<FakeCluster>,
        events: Arc<RecordingEventPublisher>,
        ctx: Arc<Context>,
    }

    impl Harness {
        fn new(fake: FakeCluster) -> Self {
            let fake = Arc::new(fake);
            let events = Arc::new(RecordingEventPublisher::new());
            let ctx = Arc::new(Context::for_testing(
                fake.clone(),
                fake.clone(),
                events.clone(),
            ));
            Self { fake, events, ctx }
        }

        async fn reconcile(&self) -> Result<Action, Error> {
            let cluster = self
                .fake
                .cluster("data", "main")
                .unwrap_or_else(sample_cluster);
            reconcile(Arc::new(cluster), self.ctx.clone()).await
        }

        fn status(&self) -> DataClusterStatus {
            self.fake
                .cluster("data", "main")
                .and_then(|c| c.status)
                .unwrap_or_default()
        }
    }

    mod lifecycle {
        use super::*;

        /// Story: a new DataCluster on a cluster where Flux works instantly
        ///
        /// The first pass adds the finalizer, creates the repository before
        /// the release, and ends Ready with both names recorded.
        #[tokio::test]
        async fn story_first_reconcile_provisions_dependents_in_order() {
            let h = Harness::new(FakeCluster::new().with_auto_ready());
            h.fake.insert_cluster(sample_cluster());

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::await_change());
            let ops = h.fake.ops();
            let repo_at = ops
                .iter()
                .position(|op| op == "create HelmRepository data/main-repository")
                .expect("repository created");
            let release_at = ops
                .iter()
                .position(|op| op == "create HelmRelease data/main")
                .expect("release created");
            assert!(repo_at < release_at);

            let cluster = h.fake.cluster("data", "main").unwrap();
            assert!(cluster.has_finalizer());
            let status = cluster.status.unwrap();
            assert_eq!(status.observed_generation, Some(1));
            assert_eq!(status.helm_repository.as_deref(), Some("main-repository"));
            assert_eq!(status.helm_release.as_deref(), Some("main"));
            assert_eq!(status.helm_repository_ready, Readiness::Ready);
            assert_eq!(status.helm_release_ready, Readiness::Ready);
            assert_eq!(status.last_attempted_revision.as_deref(), Some("5.0.3"));
            assert_eq!(status.conditions[0].status, ConditionStatus::True);

            // first healthy observation is silent; only the creations are reported
            assert_eq!(h.events.with_reason(reasons::DEPENDENCY_CREATED).len(), 2);
            assert!(h.events.with_reason(reasons::DEPENDENCY_READY).is_empty());
        }

        /// Story: the controller is woken again with nothing to do
        ///
        /// A second pass over a steady DataCluster issues no writes and
        /// publishes no events.
        #[tokio::test]
        async fn story_second_reconcile_changes_nothing() {
            let h = Harness::new(FakeCluster::new().with_auto_ready());
            h.fake.insert_cluster(sample_cluster());
            h.reconcile().await.unwrap();
            let before = h.status();
            h.fake.clear_ops();
            h.events.clear();

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::await_change());
            assert!(h.fake.ops().is_empty(), "unexpected writes: {:?}", h.fake.ops());
            assert!(h.events.is_empty());
            assert_eq!(h.status(), before);
        }

        /// Story: Flux has not fetched the chart index yet
        ///
        /// While the repository is not ready, no release is created and the
        /// DataCluster reports ArtifactFailed. Once the repository turns
        /// ready, the next pass moves on to the release.
        #[tokio::test]
        async fn story_release_waits_for_repository() {
            let h = Harness::new(FakeCluster::new());
            h.fake.insert_cluster(sample_cluster());

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
            assert!(h.fake.release("data", "main").is_none());
            let status = h.status();
            assert_eq!(status.helm_repository_ready, Readiness::NotReady);
            assert_eq!(status.conditions[0].status, ConditionStatus::False);
            assert_eq!(status.conditions[0].reason, "ArtifactFailed");
            let not_ready = h.events.with_reason(reasons::DEPENDENCY_NOT_READY);
            assert_eq!(not_ready.len(), 1);
            assert_eq!(not_ready[0].type_, EventType::Normal);

            // steady not-ready does not repeat the event
            h.reconcile().await.unwrap();
            assert_eq!(h.events.with_reason(reasons::DEPENDENCY_NOT_READY).len(), 1);

            h.fake.set_repository_ready("data", "main-repository", true);
            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::requeue(Duration::from_secs(10)));
            assert!(h.fake.release("data", "main").is_some());
            let ready = h.events.with_reason(reasons::DEPENDENCY_READY);
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].type_, EventType::Normal);
            assert_eq!(h.status().helm_repository_ready, Readiness::Ready);
            assert_eq!(h.status().helm_release_ready, Readiness::NotReady);
        }

        #[tokio::test]
        async fn spec_change_overwrites_release_and_reports_update() {
            let h = Harness::new(FakeCluster::new().with_auto_ready());
            h.fake.insert_cluster(sample_cluster());
            h.reconcile().await.unwrap();
            h.events.clear();

            h.fake.update_cluster("data", "main", |c| {
                c.spec.cluster_spec = Some(serde_json::json!({"statefulset": {"replicas": 5}}));
            });
            h.reconcile().await.unwrap();

            let release = h.fake.release("data", "main").unwrap();
            assert_eq!(
                release.spec.values,
                Some(serde_json::json!({"statefulset": {"replicas": 5}}))
            );
            assert_eq!(h.events.with_reason(reasons::DEPENDENCY_UPDATED).len(), 1);
            assert_eq!(h.status().observed_generation, Some(2));
        }

        #[tokio::test]
        async fn missing_cluster_is_a_quiet_success() {
            let h = Harness::new(FakeCluster::new());

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::await_change());
            assert!(h.fake.ops().is_empty());
        }

        #[tokio::test]
        async fn unmanaged_cluster_only_loses_its_finalizer() {
            let h = Harness::new(FakeCluster::new());
            let mut cluster = sample_cluster();
            cluster.metadata.finalizers = Some(vec![DATA_CLUSTER_FINALIZER.to_string()]);
            cluster.metadata.annotations = Some(BTreeMap::from([(
                MANAGED_ANNOTATION.to_string(),
                "false".to_string(),
            )]));
            h.fake.insert_cluster(cluster);

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::await_change());
            assert!(!h.fake.cluster("data", "main").unwrap().has_finalizer());
            assert!(h.fake.repository("data", "main-repository").is_none());

            h.fake.clear_ops();
            h.reconcile().await.unwrap();
            assert!(h.fake.ops().is_empty());
        }

        #[tokio::test]
        async fn migration_failure_does_not_fail_reconcile() {
            let h = Harness::new(FakeCluster::new().with_auto_ready());
            let mut cluster = sample_cluster();
            cluster.spec.migration = Some(MigrationSpec {
                enabled: true,
                ..Default::default()
            });
            h.fake.insert_cluster(cluster);
            h.fake.fail_legacy_get(LegacyKind::Cluster);

            let action = h.reconcile().await.unwrap();

            assert_eq!(action, Action::await_change());
            assert_eq!(h.status().conditions[0].status, ConditionStatus::True);
        }
    }

    mod failures {
        use super::*;

        fn cluster_with_finalizer() -> DataCluster {
            let mut cluster = sample_cluster();
            cluster.metadata.finalizers = Some(vec![DATA_CLUSTER_FINALIZER.to_string()]);
            cluster.metadata.generation = Some(1);
            cluster.metadata.resource_version = Some("1".to_string());
            cluster
        }

        #[tokio::test]
        async fn status_conflict_is_returned() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(cluster_with_finalizer())));
            // once for the generation bump, once for the final write
            kube.expect_patch_status().times(2).returning(|_, _| {
                Err(Error::Conflict {
                    resource: "DataCluster/data/main".to_string(),
                    message: "the object has been modified".to_string(),
                })
            });
            kube.expect_get_helm_repository().never();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            ));

            let result = reconcile(Arc::new(cluster_with_finalizer()), ctx).await;

            assert!(matches!(result, Err(Error::Conflict { .. })));
        }

        /// Story: another writer touches the DataCluster before the finalizer lands
        ///
        /// The versioned finalizer patch is rejected. Nothing is provisioned
        /// without the finalizer in place, and the key backs off.
        #[tokio::test]
        async fn finalizer_conflict_stops_before_dependents() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_cluster().returning(|_, _| {
                let mut cluster = sample_cluster();
                cluster.metadata.resource_version = Some("7".to_string());
                Ok(Some(cluster))
            });
            kube.expect_patch_finalizers()
                .withf(|cluster, finalizers| {
                    cluster.resource_version().as_deref() == Some("7")
                        && finalizers == &vec![DATA_CLUSTER_FINALIZER.to_string()]
                })
                .times(1)
                .returning(|_, _| {
                    Err(Error::Conflict {
                        resource: "DataCluster/data/main".to_string(),
                        message: "the object has been modified".to_string(),
                    })
                });
            kube.expect_patch_status().never();
            kube.expect_get_helm_repository().never();
            kube.expect_create_helm_repository().never();
            kube.expect_get_helm_release().never();
            kube.expect_create_helm_release().never();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            ));

            let result = reconcile(Arc::new(sample_cluster()), ctx.clone()).await;

            let err = match result {
                Err(err @ Error::Conflict { .. }) => err,
                other => panic!("expected conflict, got {other:?}"),
            };
            let action = error_policy(Arc::new(sample_cluster()), &err, ctx);
            assert_eq!(action, Action::requeue(BACKOFF_BASE));
        }

        /// Story: a dependent failure still persists what was learned
        ///
        /// Repository creation fails after the status already recorded the
        /// new generation; the write happens and the error is returned.
        #[tokio::test]
        async fn dependent_error_is_returned_after_status_write() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(cluster_with_finalizer())));
            kube.expect_patch_status().returning(|_, _| Ok(()));
            kube.expect_get_helm_repository()
                .returning(|_, _| Err(Error::internal("apiserver unavailable")));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            ));

            let result = reconcile(Arc::new(cluster_with_finalizer()), ctx).await;

            assert!(matches!(result, Err(Error::Internal { .. })));
        }

        struct SlowKube;

        #[async_trait]
        impl KubeClient for SlowKube {
            async fn get_cluster(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Option<DataCluster>, Error> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            }
            async fn patch_finalizers(
                &self,
                cluster: &DataCluster,
                _: Vec<String>,
            ) -> Result<DataCluster, Error> {
                Ok(cluster.clone())
            }
            async fn patch_status(&self, _: &DataCluster, _: &DataClusterStatus) -> Result<(), Error> {
                Ok(())
            }
            async fn get_helm_repository(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Option<HelmRepository>, Error> {
                Ok(None)
            }
            async fn create_helm_repository(
                &self,
                repository: &HelmRepository,
            ) -> Result<HelmRepository, Error> {
                Ok(repository.clone())
            }
            async fn get_helm_release(
                &self,
                _: &str,
                _: &str,
            ) -> Result<Option<HelmRelease>, Error> {
                Ok(None)
            }
            async fn create_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
                Ok(release.clone())
            }
            async fn replace_helm_release(&self, release: &HelmRelease) -> Result<HelmRelease, Error> {
                Ok(release.clone())
            }
            async fn delete_helm_release(&self, _: &str, _: &str) -> Result<(), Error> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn slow_reconcile_times_out() {
            let mut ctx = Context::for_testing(
                Arc::new(SlowKube),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            );
            ctx.config.reconcile_timeout = Duration::from_millis(10);

            let result = reconcile(Arc::new(sample_cluster()), Arc::new(ctx)).await;

            match result {
                Err(Error::Timeout { cluster, after }) => {
                    assert_eq!(cluster, "data/main");
                    assert_eq!(after, Duration::from_millis(10));
                }
                other => panic!("expected timeout, got {other:?}"),
            }
        }
    }

    mod error_policy_tests {
        use super::*;

        fn context() -> Arc<Context> {
            Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            ))
        }

        #[rstest]
        #[case(1, 5)]
        #[case(2, 10)]
        #[case(3, 20)]
        #[case(6, 160)]
        #[case(7, 300)]
        #[case(50, 300)]
        fn backoff_doubles_up_to_cap(#[case] retries: u32, #[case] secs: u64) {
            assert_eq!(backoff_delay(retries), Duration::from_secs(secs));
        }

        #[test]
        fn deletion_pending_requeues_quickly_without_counting() {
            let ctx = context();
            let action = error_policy(
                Arc::new(sample_cluster()),
                &Error::deletion_pending("HelmRelease/data/main"),
                ctx.clone(),
            );

            assert_eq!(action, Action::requeue(Duration::from_secs(1)));
            assert!(ctx.failures.is_empty());
        }

        #[test]
        fn validation_errors_wait_for_a_change() {
            let action = error_policy(
                Arc::new(sample_cluster()),
                &Error::validation_for("main", "bad interval"),
                context(),
            );

            assert_eq!(action, Action::await_change());
        }

        /// Story: Flux CRDs are installed after the operator, or the API
        /// server throttles
        ///
        /// The DataCluster must come back on its own rather than wait for an
        /// edit.
        #[rstest]
        #[case(404, "NotFound")]
        #[case(408, "Timeout")]
        #[case(429, "TooManyRequests")]
        #[case(500, "InternalError")]
        fn api_errors_back_off(#[case] code: u16, #[case] reason: &str) {
            let ctx = context();
            let err = Error::from_kube_for(
                "HelmRepository/data/main-repository",
                kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: reason.to_string(),
                    reason: reason.to_string(),
                    code,
                }),
            );

            let action = error_policy(Arc::new(sample_cluster()), &err, ctx.clone());

            assert_eq!(action, Action::requeue(BACKOFF_BASE));
            assert_eq!(ctx.failures.get("data/main").map(|v| *v), Some(1));
        }

        #[test]
        fn already_exists_waits_for_a_change() {
            let action = error_policy(
                Arc::new(sample_cluster()),
                &Error::AlreadyExists {
                    resource: "HelmRelease/data/main".to_string(),
                },
                context(),
            );

            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn repeated_failures_back_off_until_success() {
            let ctx = context();
            let cluster = Arc::new(sample_cluster());
            let err = Error::internal("boom");

            let delays: Vec<_> = (0..3)
                .map(|_| error_policy(cluster.clone(), &err, ctx.clone()))
                .collect();

            assert_eq!(
                delays,
                vec![
                    Action::requeue(Duration::from_secs(5)),
                    Action::requeue(Duration::from_secs(10)),
                    Action::requeue(Duration::from_secs(20)),
                ]
            );
            assert_eq!(ctx.failures.get("data/main").map(|v| *v), Some(3));
        }

        #[tokio::test]
        async fn success_resets_backoff() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_cluster().returning(|_, _| Ok(None));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(kube),
                Arc::new(MockLegacyClient::new()),
                Arc::new(RecordingEventPublisher::new()),
            ));
            ctx.failures.insert("data/main".to_string(), 4);

            reconcile(Arc::new(sample_cluster()), ctx.clone()).await.unwrap();

            assert!(ctx.failures.is_empty());
        }
    }
}
