//! Kubernetes Event recording for the Strata controllers.
//!
//! A trait-based wrapper over `kube::runtime::events::Recorder` so that
//! readiness edges, dependent create/update and migration mutations show up
//! in `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "DependencyReady")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Append the DataCluster's last attempted chart revision to an event note.
///
/// Events have no annotations of their own, so the revision travels in the
/// note text. An empty revision leaves the message unchanged.
pub fn with_revision(message: impl Into<String>, revision: Option<&str>) -> String {
    let message = message.into();
    match revision {
        Some(rev) if !rev.is_empty() => format!("{message} (revision {rev})"),
        _ => message,
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Object the event was attached to
    pub object: ObjectReference,
    /// Normal or Warning
    pub type_: EventType,
    /// Reason string
    pub reason: String,
    /// Action string
    pub action: String,
    /// Human-readable note
    pub note: Option<String>,
}

/// Publisher that keeps every event in memory.
///
/// Used by the controller tests to assert on edge-triggered notifications.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events recorded with the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }

    /// Drop everything recorded so far
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.clone(),
                type_,
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A dependent (HelmRepository or HelmRelease) became ready
    pub const DEPENDENCY_READY: &str = "DependencyReady";
    /// A dependent stopped being ready, or never was
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    /// A dependent was created
    pub const DEPENDENCY_CREATED: &str = "DependencyCreated";
    /// The live HelmRelease drifted and was overwritten
    pub const DEPENDENCY_UPDATED: &str = "DependencyUpdated";
    /// Creating, reading or rendering a dependent failed
    pub const DEPENDENCY_FAILED: &str = "DependencyFailed";
    /// A legacy resource was re-tagged, disabled or deleted for adoption
    pub const MIGRATED: &str = "Migrated";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a dependent
    pub const CREATE: &str = "Create";
    /// Overwriting a dependent's spec
    pub const UPDATE: &str = "Update";
    /// Moving a legacy resource to Helm management
    pub const MIGRATE: &str = "Migrate";
}
