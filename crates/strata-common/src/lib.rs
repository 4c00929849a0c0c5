//! Common types for Strata: CRDs, errors, events and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod crd_registry;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Field manager used for every write issued by the operator
pub const FIELD_MANAGER: &str = "strata-operator";

/// Finalizer placed on every managed DataCluster (and historically on its pods)
pub const DATA_CLUSTER_FINALIZER: &str = "operator.strata.dev/finalizer";

/// Annotation that, when set to `"false"`, takes a DataCluster out of management
pub const MANAGED_ANNOTATION: &str = "cluster.strata.dev/managed";

/// Chart and `app.kubernetes.io/name` of the data-plane component
pub const DATA_PLANE_NAME: &str = "strata";

/// `app.kubernetes.io/name` of the console component
pub const CONSOLE_NAME: &str = "console";

/// Chart repository every generated HelmRepository points at
pub const CHART_REPOSITORY_URL: &str = "https://charts.strata.dev";
