//! Operator runtime errors

use thiserror::Error;

/// Errors that can occur in the operator runtime.
///
/// Only `MalformedEvent`, `Crd` and the construction-time variants reach callers
/// synchronously. Watch errors are fatal and go through the
/// [`FatalHandler`](crate::watcher::FatalHandler); write errors are logged and
/// absorbed by the [`StatusPatcher`](crate::status::StatusPatcher).
#[derive(Debug, Error)]
pub enum OperatorError {
    /// A watch notification lacks a required identity field
    #[error("Malformed event for {id}: missing {field}")]
    MalformedEvent {
        /// Resource-type id the notification arrived on
        id: String,
        /// First missing field, as a JSON path
        field: &'static str,
    },

    /// The watch stream reported a protocol error
    #[error("Watch on {id} failed: {reason}")]
    WatchTerminal {
        /// Resource-type id of the failed watch
        id: String,
        /// Error as reported by the API server or transport
        reason: String,
    },

    /// A status or finalizer write was rejected or could not be sent
    #[error("Write to {path} failed: {reason}")]
    WriteFailure {
        /// Request path
        path: String,
        /// Status code and body, or transport error
        reason: String,
    },

    /// No path builder is registered for a resource-type id
    #[error("No resource registered for id {0}")]
    UnknownResource(String),

    /// CRD registration failed for a reason other than "already exists"
    #[error("CRD registration for {name} failed: {reason}")]
    Crd {
        /// CRD metadata.name
        name: String,
        /// Status code and body
        reason: String,
    },

    /// Cluster credentials could not be loaded
    #[error("Authentication setup failed: {0}")]
    Auth(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP request/response error on the write path
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML manifest or kubeconfig parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error reading manifests, kubeconfig or service account files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
