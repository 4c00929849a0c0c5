//! Finalizer-gated teardown of a DataCluster.
//!
//! The HelmRelease is deleted with foreground propagation and the finalizer
//! stays until a later pass sees the release gone. Until then every pass
//! returns [`Error::DeletionPending`], which the error policy turns into a
//! short requeue.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use strata_common::crd::{DataCluster, DataClusterStatus};
use strata_common::kube_utils::remove_finalizer;
use strata_common::{Error, DATA_CLUSTER_FINALIZER};

use crate::controller::{persist_status, Context};

/// Tear down dependents of a DataCluster that is being deleted.
pub async fn reconcile_delete(cluster: &DataCluster, ctx: &Context) -> Result<Action, Error> {
    if !cluster.has_finalizer() {
        debug!("DataCluster is deleting without our finalizer");
        return Ok(Action::await_change());
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    delete_helm_release(cluster, &mut status, ctx).await?;
    persist_status(cluster, &status, ctx).await?;

    // status write bumped the resourceVersion
    let namespace = cluster.namespace().unwrap_or_default();
    let Some(latest) = ctx.kube.get_cluster(&namespace, &cluster.name_any()).await? else {
        return Ok(Action::await_change());
    };
    let mut finalizers = latest.finalizers().to_vec();
    if remove_finalizer(&mut finalizers, DATA_CLUSTER_FINALIZER) {
        ctx.kube.patch_finalizers(&latest, finalizers).await?;
        info!("HelmRelease is gone, removed finalizer");
    }
    Ok(Action::await_change())
}

/// Delete the recorded HelmRelease, returning `DeletionPending` while it exists.
///
/// Clears the recorded names once the release is confirmed absent. A release
/// that already carries a deletion timestamp is not deleted again.
async fn delete_helm_release(
    cluster: &DataCluster,
    status: &mut DataClusterStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let Some(name) = status.recorded_release().map(str::to_string) else {
        status.clear_dependents();
        return Ok(());
    };
    let namespace = cluster.namespace().unwrap_or_default();

    let Some(release) = ctx.kube.get_helm_release(&namespace, &name).await? else {
        debug!(release = %name, "HelmRelease absent");
        status.clear_dependents();
        return Ok(());
    };

    if release.metadata.deletion_timestamp.is_none() {
        ctx.kube.delete_helm_release(&namespace, &name).await?;
        info!(release = %name, "deleting HelmRelease");
    }
    Err(Error::deletion_pending(format!(
        "HelmRelease/{namespace}/{name}"
    )))
}
