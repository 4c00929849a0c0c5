//! Controller runner - builds the DataCluster controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use strata_cluster::{error_policy, reconcile, Context};
use strata_common::crd::{DataCluster, HelmRelease, HelmRepository};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the DataCluster controller
///
/// Changes to owned HelmReleases and HelmRepositories re-trigger the owning
/// DataCluster, so readiness transitions are picked up without polling.
pub fn build_data_cluster_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let clusters: Api<DataCluster> = scoped(client.clone(), namespace);
    let releases: Api<HelmRelease> = scoped(client.clone(), namespace);
    let repositories: Api<HelmRepository> = scoped(client, namespace);
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- DataCluster controller"),
        None => tracing::info!("- DataCluster controller (all namespaces)"),
    }

    Box::pin(
        Controller::new(clusters, watcher())
            .owns(releases, watcher())
            .owns(repositories, watcher())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("DataCluster")),
    )
}

/// Log the outcome of each reconcile pass
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
