//! Backend abstraction over container runtimes.
//!
//! A [`Backend`] drives one runtime technology. The runtime is always the
//! source of truth: backends keep no authoritative state of their own and
//! [`Backend::inspect_container`] is the point where callers re-synchronize.

pub mod cli;
pub mod memory;
pub mod registry;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use testpod_common::config::TestpodConfig;
use testpod_common::constants::LOOPBACK_HOST;
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::{ContainerId, ContainerState, PortBinding, ResourceLimits, port_key};

use crate::cancel::CancelToken;
use crate::exec::ExecOutput;
use crate::files::FileEntry;
use crate::logs::{LogRelay, LogSink};
use crate::wait::{self, WaitCondition};

/// A host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Path on the host.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Mount without write access.
    pub read_only: bool,
}

impl BindMount {
    /// Renders the mount in `host:container[:ro]` form.
    #[must_use]
    pub fn spec(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host, self.container)
        } else {
            format!("{}:{}", self.host, self.container)
        }
    }
}

/// Declarative description of a container to create.
///
/// Built incrementally by the option layer and treated as immutable once it
/// is handed to a backend.
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    /// Container name; the runtime picks one when absent.
    pub name: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Ports to publish, either bare (`5432`) or fully specified (`8080:80`).
    pub ports: Vec<String>,
    /// Host directories to mount.
    pub mounts: Vec<BindMount>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Memory and CPU limits.
    pub limits: ResourceLimits,
    /// Run with extended privileges.
    pub privileged: bool,
    /// Files copied in after creation and before start.
    pub files: Vec<FileEntry>,
    /// Conditions that must all hold before the container is ready.
    pub wait: Vec<WaitCondition>,
    /// Overall readiness budget across every wait condition.
    pub startup_timeout: Option<Duration>,
}

impl ContainerRequest {
    /// Drops every setting the backend cannot honour.
    ///
    /// Returns the names of the option families that were removed.
    pub fn restrict_to(&mut self, caps: Capabilities) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        if !caps.mounts && !self.mounts.is_empty() {
            self.mounts.clear();
            dropped.push("mounts");
        }
        if !caps.privileged && self.privileged {
            self.privileged = false;
            dropped.push("privileged");
        }
        if !caps.resource_limits && !self.limits.is_empty() {
            self.limits = ResourceLimits::default();
            dropped.push("resource limits");
        }
        if !caps.networks && self.network.is_some() {
            self.network = None;
            dropped.push("network");
        }
        if !caps.file_injection && !self.files.is_empty() {
            self.files.clear();
            dropped.push("files");
        }
        dropped
    }

    /// Container-side port numbers, without host parts or protocols.
    #[must_use]
    pub fn container_ports(&self) -> Vec<String> {
        self.ports
            .iter()
            .map(|p| {
                let bare = p.rsplit(':').next().unwrap_or(p);
                bare.split('/').next().unwrap_or(bare).to_string()
            })
            .collect()
    }
}

/// Option families a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Bind mounts.
    pub mounts: bool,
    /// Privileged mode.
    pub privileged: bool,
    /// Memory and CPU limits.
    pub resource_limits: bool,
    /// Custom networks.
    pub networks: bool,
    /// Copying files in before start.
    pub file_injection: bool,
    /// Committing a container to an image.
    pub commit: bool,
}

impl Capabilities {
    /// Every option family.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            mounts: true,
            privileged: true,
            resource_limits: true,
            networks: true,
            file_injection: true,
            commit: true,
        }
    }
}

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Runtime identifier.
    pub id: ContainerId,
    /// Container name without the leading slash.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Creation time, when the runtime reports a parseable one.
    pub created: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Exit code of the main process, meaningful once stopped.
    pub exit_code: Option<i32>,
    /// Address on the container network.
    pub internal_ip: Option<String>,
    /// Published ports keyed by `port/proto`.
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    /// Labels attached at creation.
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Returns the host binding for a container port, preferring IPv4.
    #[must_use]
    pub fn host_binding(&self, port: &str) -> Option<&PortBinding> {
        let bindings = self.ports.get(&port_key(port))?;
        bindings
            .iter()
            .find(|b| !b.host_ip.contains(':'))
            .or_else(|| bindings.first())
    }

    /// Returns whether the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Maps a binding address to one a client on the host can connect to.
#[must_use]
pub fn reachable_host(host_ip: &str) -> &str {
    match host_ip {
        "" | "0.0.0.0" | "::" => LOOPBACK_HOST,
        other => other,
    }
}

/// Contract every container backend implements.
///
/// All calls block until the runtime has answered. Errors for a missing
/// container are reported as [`TestpodError::NotFound`] so cleanup paths can
/// tell them apart from real failures.
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Option families this backend honours.
    fn capabilities(&self) -> Capabilities;

    /// Creates (but does not start) a container.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Create` if the runtime refuses the request.
    fn create_container(&self, image: &str, request: &ContainerRequest) -> Result<ContainerId>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or fails to start.
    fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Stops a container, killing it if it ignores the grace period.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container does not exist.
    fn stop_container(&self, id: &ContainerId) -> Result<()>;

    /// Stops and deletes a container.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is already gone.
    fn remove_container(&self, id: &ContainerId) -> Result<()>;

    /// Reads the container's current state from the runtime.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container does not exist.
    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo>;

    /// Runs a command in the container.
    ///
    /// A non-zero exit code is reported in the output, not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command could not be run at all, for
    /// instance because the container is gone or stopped.
    fn exec_in_container(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput>;

    /// Runs a command in the container, giving up once `limit` has passed.
    ///
    /// The default runs [`Backend::exec_in_container`] without a bound;
    /// backends whose exec can hang override it.
    ///
    /// # Errors
    ///
    /// As [`Backend::exec_in_container`], plus `TestpodError::Command` when
    /// the command is still running after `limit`.
    fn exec_with_limit(&self, id: &ContainerId, cmd: &[String], limit: Duration) -> Result<ExecOutput> {
        let _ = limit;
        self.exec_in_container(id, cmd)
    }

    /// Returns the full accumulated output of the container.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container does not exist.
    fn container_logs(&self, id: &ContainerId) -> Result<String>;

    /// Blocks until the container's output contains `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::ReadinessTimeout` if the pattern does not
    /// appear within `timeout`, or `TestpodError::Cancelled`.
    fn wait_for_log(
        &self,
        id: &ContainerId,
        pattern: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let condition = WaitCondition::log(pattern, timeout);
        let settings = wait::PollSettings::new(TestpodConfig::global().poll_interval);
        wait::wait_for_condition(self, id, &condition, &settings, cancel).map(|_| ())
    }

    /// Returns the container's address on its network.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container has no address.
    fn internal_ip(&self, id: &ContainerId) -> Result<String> {
        self.inspect_container(id)?
            .internal_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| TestpodError::NotFound {
                kind: "container address",
                id: id.to_string(),
            })
    }

    /// Saves the container's filesystem as a new image.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot commit the container.
    fn commit(&self, id: &ContainerId, image_name: &str) -> Result<()>;

    /// Extracts a tar archive into `dest` inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be copied.
    fn copy_archive(&self, id: &ContainerId, dest: &str, archive: &[u8]) -> Result<()>;

    /// Relays the container's output to `sink` until the stream ends or
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be started.
    fn follow_logs(&self, id: &ContainerId, sink: LogSink, cancel: CancelToken) -> Result<LogRelay>;

    /// Lists containers carrying `label` (`key` or `key=value`), including
    /// stopped ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    fn list_containers(&self, label: &str) -> Result<Vec<ContainerId>>;
}
