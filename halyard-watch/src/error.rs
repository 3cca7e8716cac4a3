//! Error types for watch consumption.

use thiserror::Error;

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors raised while connecting to or consuming the Kubernetes API.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be loaded or parsed.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// The ConfigMap payload under the configured key did not parse.
    #[error("config payload under key {key:?} did not parse: {detail}")]
    Payload {
        /// ConfigMap key that was read.
        key: String,
        /// Parse failure detail.
        detail: String,
    },
}
