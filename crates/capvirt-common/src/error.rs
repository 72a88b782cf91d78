//! Error types for the capvirt provider
//!
//! Errors carry the object and operation they relate to so that a failed
//! reconcile pass can be diagnosed from a single log line. The reconcilers
//! only return errors for fatal conditions; waits on other controllers are
//! expressed as requeue actions instead.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for capvirt operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error without further context
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Kubernetes API error raised while performing a named store operation
    #[error("store error during {op}: {source}")]
    Store {
        /// What was being fetched, created, patched or deleted
        op: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Invalid object specification
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Namespaced name of the offending object
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.volumeTemplates[0]")
        field: Option<String>,
    },

    /// The infrastructure cluster could not be reached from its credential secret
    #[error("infrastructure cluster error for secret {secret}: {message}")]
    InfraCluster {
        /// Namespaced name of the credential secret
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// No free address is left in a cluster's node address pool
    #[error("address pool of {cluster} exhausted ({pool_size} addresses, {pending} machines waiting)")]
    AddressPoolExhausted {
        /// Namespaced name of the VirtinkCluster
        cluster: String,
        /// Number of addresses in the expanded pool
        pool_size: usize,
        /// Number of machines that could not be given an address
        pending: usize,
    },

    /// An annotation template references an unknown placeholder
    #[error("invalid annotation template {template:?}: {message}")]
    InvalidTemplate {
        /// The template value as written
        template: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "leader-election")
        context: String,
    },
}

impl Error {
    /// Wrap a kube error with the store operation that produced it
    pub fn store(op: impl Into<String>, source: kube::Error) -> Self {
        Self::Store {
            op: op.into(),
            source,
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific object and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an infrastructure cluster error
    pub fn infra_cluster(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InfraCluster {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid template error
    pub fn invalid_template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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

    /// Check if this error is retryable
    ///
    /// Configuration problems (bad templates, unreachable infrastructure
    /// credentials, an exhausted pool) need an operator to fix something and
    /// are not retryable. Kubernetes errors are retryable unless the API server
    /// rejected the request outright; conflicts and throttling are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } | Error::Store { source, .. } => is_transient_kube_error(source),
            Error::Validation { .. } => false,
            Error::InfraCluster { .. } => false,
            Error::AddressPoolExhausted { .. } => false,
            Error::InvalidTemplate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

fn is_transient_kube_error(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code),
        _ => true,
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
