//! Error types for the Strata operator
//!
//! Errors carry structured fields (resource names, contexts) so that the
//! reconcile log line is enough to diagnose a failure in production.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is not classified further
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency rejection (HTTP 409 on a versioned write)
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// `Kind/namespace/name` of the object being written
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// Create rejected because the object already exists
    #[error("{resource} already exists")]
    AlreadyExists {
        /// `Kind/namespace/name` of the object being created
        resource: String,
    },

    /// Validation error for a DataCluster spec or a rendered template
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the DataCluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.chartRef.timeout")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A dependent is being deleted; the caller must come back shortly
    #[error("waiting for {resource} deletion")]
    DeletionPending {
        /// `Kind/namespace/name` of the object being deleted
        resource: String,
    },

    /// The reconcile deadline expired before the invocation finished
    #[error("reconcile of {cluster} timed out after {after:?}")]
    Timeout {
        /// `namespace/name` of the DataCluster
        cluster: String,
        /// Configured deadline
        after: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "migration", "registry")
        context: String,
    },
}

impl Error {
    /// Classify a kube error raised while writing `resource`.
    ///
    /// 409 responses become [`Error::AlreadyExists`] or [`Error::Conflict`];
    /// everything else stays a plain [`Error::Kube`].
    pub fn from_kube_for(resource: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    resource: resource.into(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Signal that `resource` was asked to go away and has not yet
    pub fn deletion_pending(resource: impl Into<String>) -> Self {
        Self::DeletionPending {
            resource: resource.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for the expected "dependent still being deleted" signal
    pub fn is_deletion_pending(&self) -> bool {
        matches!(self, Self::DeletionPending { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and AlreadyExists errors need a spec change.
    /// API errors of any status (a missing Flux CRD answers 404, throttling
    /// answers 429) are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::DeletionPending { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}
