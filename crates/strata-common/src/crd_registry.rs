//! CRD discovery registry
//!
//! Built once at startup and shared via `Arc<CrdRegistry>` with every
//! component that talks to kinds this operator does not own. Flux kinds are
//! checked so a missing Flux install is reported early; the legacy kinds are
//! resolved here because the migration reads them as dynamic objects.

use dashmap::DashMap;
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{info, warn};

use crate::crd::legacy::LEGACY_GROUP;
use crate::kube_utils::{build_api_resource, find_discovered_resource};

/// Third-party CRD kinds the operator depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrdKind {
    /// HelmRepository (source.toolkit.fluxcd.io)
    HelmRepository,
    /// HelmRelease (helm.toolkit.fluxcd.io)
    HelmRelease,
    /// Cluster (legacy.strata.dev)
    LegacyCluster,
    /// Console (legacy.strata.dev)
    LegacyConsole,
}

/// All CrdKind variants for iteration.
pub const ALL_CRD_KINDS: &[CrdKind] = &[
    CrdKind::HelmRepository,
    CrdKind::HelmRelease,
    CrdKind::LegacyCluster,
    CrdKind::LegacyConsole,
];

impl CrdKind {
    /// API group for discovery lookup.
    pub fn group(&self) -> &'static str {
        match self {
            Self::HelmRepository => "source.toolkit.fluxcd.io",
            Self::HelmRelease => "helm.toolkit.fluxcd.io",
            Self::LegacyCluster | Self::LegacyConsole => LEGACY_GROUP,
        }
    }

    /// Kubernetes Kind string for discovery lookup.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::HelmRepository => "HelmRepository",
            Self::HelmRelease => "HelmRelease",
            Self::LegacyCluster => "Cluster",
            Self::LegacyConsole => "Console",
        }
    }

    /// API version used when discovery fails entirely.
    fn hardcoded_api_version(&self) -> &'static str {
        match self {
            Self::HelmRepository => "source.toolkit.fluxcd.io/v1beta2",
            Self::HelmRelease => "helm.toolkit.fluxcd.io/v2beta1",
            Self::LegacyCluster | Self::LegacyConsole => "legacy.strata.dev/v1alpha1",
        }
    }

    /// Whether the operator cannot work at all without this CRD
    pub fn is_required(&self) -> bool {
        matches!(self, Self::HelmRepository | Self::HelmRelease)
    }
}

/// Cache of discovered CRD API resources.
pub struct CrdRegistry {
    client: Client,
    entries: DashMap<CrdKind, ApiResource>,
}

impl CrdRegistry {
    /// Run API discovery once and populate all known CRDs.
    pub async fn discover(client: Client) -> Self {
        use kube::discovery::Discovery;

        let entries = DashMap::new();

        match Discovery::new(client.clone()).run().await {
            Ok(discovery) => {
                for kind in ALL_CRD_KINDS {
                    if let Some(ar) =
                        find_discovered_resource(&discovery, kind.group(), kind.kind_str())
                    {
                        entries.insert(*kind, ar);
                    }
                }
                info!(
                    discovered = entries.len(),
                    total = ALL_CRD_KINDS.len(),
                    "CRD registry populated via API discovery"
                );
            }
            Err(e) => {
                warn!(error = %e, "API discovery failed, falling back to hardcoded CRD versions");
                for kind in ALL_CRD_KINDS {
                    entries.insert(
                        *kind,
                        build_api_resource(kind.hardcoded_api_version(), kind.kind_str()),
                    );
                }
            }
        }

        Self { client, entries }
    }

    /// Get a CRD, running lazy re-discovery if it was missing at startup.
    ///
    /// Returns `None` only if the CRD is genuinely not installed.
    pub async fn resolve(&self, kind: CrdKind) -> Option<ApiResource> {
        if let Some(ar) = self.entries.get(&kind) {
            return Some(ar.clone());
        }

        info!(
            kind = kind.kind_str(),
            group = kind.group(),
            "CRD missing at startup, attempting lazy discovery"
        );

        self.rediscover().await;
        self.entries.get(&kind).map(|r| r.clone())
    }

    /// Required kinds that discovery did not find
    pub fn missing_required(&self) -> Vec<CrdKind> {
        ALL_CRD_KINDS
            .iter()
            .copied()
            .filter(|k| k.is_required() && !self.entries.contains_key(k))
            .collect()
    }

    /// Re-run API discovery and add any newly-installed CRDs.
    ///
    /// Existing entries are never overwritten.
    async fn rediscover(&self) {
        use kube::discovery::Discovery;

        let discovery = match Discovery::new(self.client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "CRD re-discovery failed");
                return;
            }
        };

        let mut newly_found = 0u32;
        for kind in ALL_CRD_KINDS {
            if self.entries.contains_key(kind) {
                continue;
            }
            if let Some(ar) = find_discovered_resource(&discovery, kind.group(), kind.kind_str()) {
                self.entries.insert(*kind, ar);
                newly_found += 1;
            }
        }

        if newly_found > 0 {
            info!(newly_found, "CRD re-discovery found new CRDs");
        }
    }
}
