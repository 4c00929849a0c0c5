//! Markers of the legacy operator.
//!
//! The legacy `Cluster` and `Console` kinds are accessed dynamically through
//! the [`CrdRegistry`](crate::crd_registry::CrdRegistry); only the keys the
//! migration reads and writes live here.

/// API group of the legacy `Cluster` and `Console` kinds
pub const LEGACY_GROUP: &str = "legacy.strata.dev";

/// Annotation that switches legacy reconciliation off when set to `"false"`
pub const LEGACY_MANAGED_ANNOTATION: &str = "legacy.strata.dev/managed";

/// Legacy console finalizer guarding its ServiceAccount cleanup
pub const CONSOLE_SA_FINALIZER: &str = "consoles.legacy.strata.dev/service-account-cleanup";

/// Legacy console finalizer guarding its ACL cleanup
pub const CONSOLE_ACL_FINALIZER: &str = "consoles.legacy.strata.dev/acl-cleanup";

/// Component label the chart puts on data-plane pods
pub const STATEFULSET_COMPONENT: &str = "strata-statefulset";

/// Helm ownership markers the chart expects on adopted resources
pub mod helm {
    /// `app.kubernetes.io/managed-by`
    pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
    /// Value of the managed-by label for Helm-owned objects
    pub const MANAGED_BY_HELM: &str = "Helm";
    /// Release name annotation
    pub const RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
    /// Release namespace annotation
    pub const RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";
}

/// Standard `app.kubernetes.io` label keys
pub mod labels {
    /// `app.kubernetes.io/instance`
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    /// `app.kubernetes.io/name`
    pub const NAME: &str = "app.kubernetes.io/name";
    /// `app.kubernetes.io/component`
    pub const COMPONENT: &str = "app.kubernetes.io/component";
}
