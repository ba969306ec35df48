//! Unified error types for the testpod workspace.
//!
//! The variants follow the engine's failure taxonomy: creation failures are
//! fatal, not-found is an expected classification, readiness timeouts carry
//! their own diagnostics, and provisioning failures record how many attempts
//! were spent before giving up.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum TestpodError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path (or executable) where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The container exists but is not running.
    #[error("container {id} is not running")]
    NotRunning {
        /// Identifier of the stopped container.
        id: String,
    },

    /// The runtime refused to create the container.
    #[error("failed to create container from {image}: {message}")]
    Create {
        /// Image the container was requested from.
        image: String,
        /// Runtime diagnostic output.
        message: String,
    },

    /// A runtime command failed for a reason that is not otherwise classified.
    #[error("`{command}` failed: {message}")]
    Command {
        /// The runtime subcommand that failed.
        command: String,
        /// Runtime diagnostic output.
        message: String,
    },

    /// A readiness condition did not hold before its deadline.
    #[error(
        "timeout after {elapsed:?} waiting for {condition} (checked {attempts} times)\n{log_tail}"
    )]
    ReadinessTimeout {
        /// Human-readable description of the condition, including its pattern.
        condition: String,
        /// Time spent polling.
        elapsed: Duration,
        /// Number of probes evaluated.
        attempts: u32,
        /// Most recent container output, already trimmed to a short tail.
        log_tail: String,
    },

    /// An operation observed external cancellation and stopped early.
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was interrupted.
        operation: String,
    },

    /// A logical database could not be provisioned.
    #[error("failed to provision database {database} after {attempts} attempts: {message}")]
    Provision {
        /// Name of the logical database.
        database: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure observed.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl TestpodError {
    /// Returns whether this error reports a missing container (or other resource).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns whether the target container is gone or stopped.
    #[must_use]
    pub const fn is_container_gone(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotRunning { .. })
    }

    /// Returns whether this error is a readiness timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TestpodError>;
