//! Domain primitive types used across the testpod workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TestpodError};

/// Runtime-assigned identifier of a container.
///
/// Identifiers handed out by a backend are never empty; [`ContainerId::parse`]
/// enforces that when reading them from runtime output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses an identifier printed by a runtime, rejecting blank output.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Config` if the trimmed input is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TestpodError::Config {
                message: "runtime returned an empty container id".into(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generates a random identifier in the runtime's hex format.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 12-character short form used in log output.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// Container is actively running.
    Running,
    /// Container has exited or been stopped.
    Stopped,
    /// Container has been removed from the runtime.
    Removed,
}

impl ContainerState {
    /// Maps a runtime status string (`docker inspect .State.Status`) to a state.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" => Self::Created,
            "running" | "restarting" | "paused" => Self::Running,
            "removing" | "removed" => Self::Removed,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// A host binding for one exposed container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host address the port is bound to.
    pub host_ip: String,
    /// Host port number as reported by the runtime.
    pub host_port: String,
}

/// Resource limits for a container, in the runtime's own notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit such as `512m` or `1g`.
    pub memory: Option<String>,
    /// CPU quota such as `0.5` or `2`.
    pub cpus: Option<String>,
}

impl ResourceLimits {
    /// Returns whether no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpus.is_none()
    }
}

/// Normalizes a container port to the runtime's `port/proto` key form.
#[must_use]
pub fn port_key(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/tcp")
    }
}
