//! Error types for the reconciliation engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reconciler and its backends.
///
/// Variants fall into three classes with distinct propagation policies:
/// transient errors ([`Error::Command`], [`Error::Io`]) are logged, counted
/// and retried on the next tick; configuration errors ([`Error::InvalidConfig`],
/// [`Error::UnresolvedService`], [`Error::Parse`]) skip the offending entry
/// while the rest of the cycle continues; [`Error::Fatal`] propagates out of
/// the reconciler task and terminates the process.
#[derive(Debug, Error)]
pub enum Error {
    /// An external command (ip, ipvsadm, iptables, gobgp) exited nonzero.
    #[error("{program} exited with status {status:?}: {stderr}")]
    Command {
        /// Program that was invoked.
        program: String,
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Trimmed stderr output.
        stderr: String,
    },

    /// Output from a kernel surface could not be parsed.
    #[error("failed to parse {what}: {detail}")]
    Parse {
        /// What was being parsed (e.g. "ipvsadm save output").
        what: &'static str,
        /// Offending input or cause.
        detail: String,
    },

    /// Desired state cannot be materialized from the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A service identity did not resolve through the services index.
    #[error("cluster address not found for identity {0}")]
    UnresolvedService(String),

    /// A kernel subsystem is unreachable or a privileged operation was
    /// refused. Terminates the reconciler.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Aggregated best-effort cleanup failures from shutdown.
    #[error("cleanup finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Cleanup(Vec<String>),

    /// Underlying I/O failure invoking an external command.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error must terminate the reconciler task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
