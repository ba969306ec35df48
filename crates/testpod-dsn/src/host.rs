//! The container a provider talks to.

use std::sync::Arc;

use testpod_common::error::{Result, TestpodError};
use testpod_common::types::ContainerId;
use testpod_runtime::backend::{Backend, reachable_host};
use testpod_runtime::exec::ExecOutput;

/// A running database container as seen by a [`crate::DsnProvider`].
pub trait DatabaseHost: Send + Sync {
    /// Container identifier, for diagnostics.
    fn id(&self) -> &ContainerId;

    /// Runs a command inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run, e.g. because the
    /// container is gone.
    fn exec(&self, cmd: &[String]) -> Result<ExecOutput>;

    /// Host and host port reaching container port `port`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the port is not published.
    fn endpoint(&self, port: &str) -> Result<(String, String)>;
}

/// [`DatabaseHost`] backed directly by a backend and container id.
#[derive(Clone)]
pub struct BackendHost {
    backend: Arc<dyn Backend>,
    id: ContainerId,
}

impl BackendHost {
    /// Wraps an existing container.
    #[must_use]
    pub const fn new(backend: Arc<dyn Backend>, id: ContainerId) -> Self {
        Self { backend, id }
    }
}

impl DatabaseHost for BackendHost {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn exec(&self, cmd: &[String]) -> Result<ExecOutput> {
        self.backend.exec_in_container(&self.id, cmd)
    }

    fn endpoint(&self, port: &str) -> Result<(String, String)> {
        let info = self.backend.inspect_container(&self.id)?;
        let binding = info
            .host_binding(port)
            .ok_or_else(|| TestpodError::NotFound {
                kind: "published port",
                id: format!("{}:{port}", self.id.short()),
            })?;
        Ok((
            reachable_host(&binding.host_ip).to_string(),
            binding.host_port.clone(),
        ))
    }
}
