//! Readiness latch for Flux dependents.
//!
//! Flux reports readiness as a condition that may flap between polls. The
//! latch turns those raw signals into a stored tri-state and reports a
//! transition only when the state actually changes, so steady polling never
//! produces events.

use strata_common::crd::{DataClusterStatus, Readiness};

/// Edge reported by [`latch`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// NotReady -> Ready
    BecameReady,
    /// Unknown or Ready -> NotReady
    BecameNotReady,
}

impl Transition {
    /// Event note for this edge on `kind` `namespace/name`
    pub fn message(&self, kind: &str, namespace: &str, name: &str) -> String {
        match self {
            Self::BecameReady => format!("{kind} '{namespace}/{name}' is ready"),
            Self::BecameNotReady => format!("{kind} '{namespace}/{name}' is not ready"),
        }
    }
}

/// Advance the latch by one observation.
///
/// A stale generation or a missing `Ready=True` both count as not ready.
/// `Unknown` is ready-adjacent: moving from it to `Ready` is silent, moving
/// from it to `NotReady` is reported.
pub fn latch(
    prev: Readiness,
    generation_fresh: bool,
    condition_ready: bool,
) -> (Readiness, Option<Transition>) {
    if !generation_fresh || !condition_ready {
        let transition = (prev != Readiness::NotReady).then_some(Transition::BecameNotReady);
        return (Readiness::NotReady, transition);
    }

    let transition = (prev == Readiness::NotReady).then_some(Transition::BecameReady);
    (Readiness::Ready, transition)
}

/// The two Flux objects whose readiness is latched in status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dependent {
    /// The chart source
    HelmRepository,
    /// The release
    HelmRelease,
}

impl Dependent {
    /// Kubernetes kind, used in event notes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HelmRepository => "HelmRepository",
            Self::HelmRelease => "HelmRelease",
        }
    }

    /// The status field holding this dependent's latch
    pub fn readiness_mut<'a>(&self, status: &'a mut DataClusterStatus) -> &'a mut Readiness {
        match self {
            Self::HelmRepository => &mut status.helm_repository_ready,
            Self::HelmRelease => &mut status.helm_release_ready,
        }
    }
}
