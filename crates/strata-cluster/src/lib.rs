//! DataCluster reconciliation
//!
//! - [`controller`]: the reconcile entry point, client seam and context
//! - [`dependents`]: HelmRepository/HelmRelease templates and get-or-create
//! - [`readiness`]: the tri-state readiness latch
//! - [`migration`]: adoption of resources left by the legacy operator
//! - [`deletion`]: finalizer-gated teardown

pub mod controller;
pub mod deletion;
pub mod dependents;
pub mod migration;
pub mod readiness;

#[cfg(test)]
mod fake;

pub use controller::{error_policy, reconcile, Context, ReconcilerConfig};
