//! Adoption of resources left by the legacy operator.
//!
//! The legacy operator is told to stand down, then every object the chart
//! will own is either stamped with Helm ownership markers or, where Helm
//! cannot take over an immutable field, deleted so the chart recreates it.
//! Steps are independent: a failing step is recorded and the rest still run.

mod client;
mod steps;

use tracing::{debug, info, warn};

use strata_common::crd::DataCluster;
use strata_common::events::EventPublisher;
use strata_common::Error;

#[cfg(test)]
pub use client::MockLegacyClient;
pub use client::{LegacyClient, LegacyKind, LegacyKubeClient};
pub use steps::{
    component_selector, has_helm_ownership, plan, stamp_helm_ownership, MigrationStep,
    MigrationTarget,
};

/// A step that did not complete
#[derive(Debug)]
pub struct StepFailure {
    /// Name of the failed step
    pub step: &'static str,
    /// Why it failed
    pub error: Error,
}

/// Every step that failed during one migration pass
#[derive(Debug, thiserror::Error)]
#[error("migration failed in {} step(s): {}", .failures.len(), describe(.failures))]
pub struct MigrationError {
    /// Failures in plan order
    pub failures: Vec<StepFailure>,
}

impl MigrationError {
    /// Names of the failed steps, in plan order
    pub fn failed_steps(&self) -> Vec<&'static str> {
        self.failures.iter().map(|f| f.step).collect()
    }
}

fn describe(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.step, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run every migration step for `cluster`.
///
/// Already-migrated objects are left untouched, so running this on every
/// reconcile is safe.
pub async fn migrate(
    cluster: &DataCluster,
    legacy: &dyn LegacyClient,
    events: &dyn EventPublisher,
) -> Result<(), MigrationError> {
    let target = MigrationTarget::for_cluster(cluster);
    let mut failures = Vec::new();

    for step in plan(cluster) {
        match step.ensure_migrated(&target, legacy, events).await {
            Ok(0) => debug!(step = step.name(), "already migrated"),
            Ok(mutated) => info!(step = step.name(), mutated, "migrated legacy resources"),
            Err(error) => {
                warn!(step = step.name(), %error, "migration step failed");
                failures.push(StepFailure {
                    step: step.name(),
                    error,
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MigrationError { failures })
    }
}
