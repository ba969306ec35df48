//! Lifecycle engine that turns a [`ContainerRequest`] into backend calls.
//!
//! Within one container the order is fixed: create, inject files, start,
//! then evaluate wait conditions. Creation failures surface immediately and
//! are never retried. Teardown never fails the caller; problems are logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use testpod_common::constants::{
    DEFAULT_POLL_INTERVAL, KEEP_ALIVE_COMMAND, LIGHTWEIGHT_BASE_IMAGES,
};
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::ContainerId;

use crate::backend::{Backend, ContainerRequest};
use crate::cancel::CancelToken;
use crate::files;
use crate::wait::{self, PollSettings, WaitCondition};

/// Result of a teardown attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The container was stopped and removed.
    Removed,
    /// The container no longer existed.
    AlreadyGone,
    /// Removal failed; the message was logged as a warning.
    Failed(String),
}

/// Drives container lifecycles against one backend.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn Backend>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Engine {
    /// Creates an engine over `backend` polling at the default interval.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the readiness poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The backend this engine drives.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Creates a container, adding the keep-alive command for lightweight
    /// base images that have no command of their own.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Create` if the runtime refuses the request.
    pub fn create(&self, image: &str, request: &ContainerRequest) -> Result<ContainerId> {
        let keep_alive = request.command.is_none() && needs_keep_alive(image);
        let id = if keep_alive {
            let mut request = request.clone();
            request.command = Some(KEEP_ALIVE_COMMAND.iter().map(ToString::to_string).collect());
            self.backend.create_container(image, &request)?
        } else {
            self.backend.create_container(image, request)?
        };
        tracing::info!(
            id = %id.short(),
            image,
            backend = self.backend.name(),
            keep_alive,
            "container created"
        );
        Ok(id)
    }

    /// Copies the request's files into the container, then starts it.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be copied or the start fails.
    pub fn start(&self, id: &ContainerId, request: &ContainerRequest) -> Result<()> {
        if !request.files.is_empty() {
            let archive = files::build_archive(&request.files)?;
            self.backend.copy_archive(id, "/", &archive)?;
            tracing::debug!(id = %id.short(), count = request.files.len(), "files copied");
        }
        self.backend.start_container(id)?;
        tracing::info!(id = %id.short(), "container started");
        Ok(())
    }

    /// Blocks until every condition holds, in order.
    ///
    /// `startup_timeout` bounds the whole sequence while each condition
    /// still owns its own timeout.
    ///
    /// # Errors
    ///
    /// Returns the first `ReadinessTimeout`, `Cancelled` or container error.
    pub fn await_ready(
        &self,
        id: &ContainerId,
        conditions: &[WaitCondition],
        startup_timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let started = Instant::now();
        let mut settings = PollSettings::new(self.poll_interval);
        if let Some(budget) = startup_timeout {
            settings = settings.not_after(started + budget);
        }
        for condition in conditions {
            let report = wait::wait_for_condition(self.backend.as_ref(), id, condition, &settings, cancel)?;
            tracing::debug!(
                id = %id.short(),
                condition = %condition,
                attempts = report.attempts,
                elapsed_ms = report.elapsed.as_millis(),
                "wait condition satisfied"
            );
        }
        if !conditions.is_empty() {
            tracing::info!(
                id = %id.short(),
                elapsed_ms = started.elapsed().as_millis(),
                "container ready"
            );
        }
        Ok(())
    }

    /// Creates, starts and waits for a container, tearing it down again if
    /// any step after creation fails.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step.
    pub fn launch(
        &self,
        image: &str,
        request: &ContainerRequest,
        cancel: &CancelToken,
    ) -> Result<ContainerId> {
        let id = self.create(image, request)?;
        let ready = self
            .start(&id, request)
            .and_then(|()| self.await_ready(&id, &request.wait, request.startup_timeout, cancel));
        match ready {
            Ok(()) => Ok(id),
            Err(e) => {
                let _ = self.teardown(&id);
                Err(e)
            }
        }
    }

    /// Stops and removes a container without ever failing.
    pub fn teardown(&self, id: &ContainerId) -> TeardownOutcome {
        match self.backend.remove_container(id) {
            Ok(()) => {
                tracing::info!(id = %id.short(), "container removed");
                TeardownOutcome::Removed
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(id = %id.short(), "container already gone");
                TeardownOutcome::AlreadyGone
            }
            Err(e) => {
                tracing::warn!(id = %id.short(), error = %e, "failed to remove container");
                TeardownOutcome::Failed(e.to_string())
            }
        }
    }

    /// Inspects the container and reports whether it is running.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn ensure_running(&self, id: &ContainerId) -> Result<()> {
        let info = self.backend.inspect_container(id)?;
        if info.is_running() {
            Ok(())
        } else {
            Err(TestpodError::NotRunning { id: id.to_string() })
        }
    }
}

/// Returns whether `image` is a base image that exits without a command.
#[must_use]
pub fn needs_keep_alive(image: &str) -> bool {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    let repository = last.split(':').next().unwrap_or(last);
    LIGHTWEIGHT_BASE_IMAGES.contains(&repository)
}
