//! Handle to a started container.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use testpod_common::constants::LOOPBACK_HOST;
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::ContainerId;
use testpod_dsn::{DatabaseHost, DsnProvider};
use testpod_runtime::backend::{ContainerInfo, reachable_host};
use testpod_runtime::cancel::CancelToken;
use testpod_runtime::engine::{Engine, TeardownOutcome};
use testpod_runtime::exec::ExecOutput;
use testpod_runtime::logs::{LogRelay, LogSink};
use testpod_runtime::wait::WaitCondition;

use crate::scope::TestScope;

struct Inner {
    id: ContainerId,
    name: String,
    image: String,
    test: String,
    engine: Engine,
    cancel: CancelToken,
    dsn: Option<Arc<dyn DsnProvider>>,
    info: Mutex<Option<ContainerInfo>>,
    relay: Mutex<Option<LogRelay>>,
    own_dsn: Mutex<Option<String>>,
    removed: AtomicBool,
}

/// A container owned by one test.
///
/// Cloning is cheap; every clone refers to the same container. The owning
/// [`TestScope`] removes it at cleanup, and [`Container::remove`] may be
/// called earlier any number of times.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id.short())
            .field("name", &self.inner.name)
            .field("image", &self.inner.image)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        name: String,
        image: String,
        scope: &TestScope,
        engine: Engine,
        dsn: Option<Arc<dyn DsnProvider>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                name,
                image,
                test: scope.name().to_string(),
                engine,
                cancel: scope.cancel_token().clone(),
                dsn,
                info: Mutex::new(None),
                relay: Mutex::new(None),
                own_dsn: Mutex::new(None),
                removed: AtomicBool::new(false),
            }),
        }
    }

    /// Runtime identifier.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Image the container runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.inner.image
    }

    /// Re-reads the container's state from the runtime.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn refresh(&self) -> Result<ContainerInfo> {
        let info = self.inner.engine.backend().inspect_container(&self.inner.id)?;
        *lock(&self.inner.info) = Some(info.clone());
        Ok(info)
    }

    /// Last known state, inspecting once if nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn info(&self) -> Result<ContainerInfo> {
        if let Some(info) = lock(&self.inner.info).clone() {
            return Ok(info);
        }
        self.refresh()
    }

    /// Host address tests connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected.
    pub fn host(&self) -> Result<String> {
        let info = self.info()?;
        let host = info
            .ports
            .values()
            .flatten()
            .find(|b| !b.host_ip.contains(':'))
            .map_or(LOOPBACK_HOST, |b| reachable_host(&b.host_ip));
        Ok(host.to_string())
    }

    /// Host port published for container port `port`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if `port` is not published.
    pub fn port(&self, port: &str) -> Result<String> {
        let info = self.info()?;
        info.host_binding(port)
            .map(|b| b.host_port.clone())
            .ok_or_else(|| TestpodError::NotFound {
                kind: "published port",
                id: format!("{}:{port}", self.inner.name),
            })
    }

    /// `host:port` reaching container port `port`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if `port` is not published.
    pub fn endpoint(&self, port: &str) -> Result<String> {
        Ok(format!("{}:{}", self.host()?, self.port(port)?))
    }

    /// Address on the container network.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container has no address.
    pub fn internal_ip(&self) -> Result<String> {
        self.inner.engine.backend().internal_ip(&self.inner.id)
    }

    /// Runs a command inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run. A non-zero exit code
    /// is reported in the output.
    pub fn exec<S: Into<String>>(&self, cmd: impl IntoIterator<Item = S>) -> Result<ExecOutput> {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        self.inner.engine.backend().exec_in_container(&self.inner.id, &cmd)
    }

    /// Full output of the container so far.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn logs(&self) -> Result<String> {
        self.inner.engine.backend().container_logs(&self.inner.id)
    }

    /// Blocks until `condition` holds.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::ReadinessTimeout` or `TestpodError::Cancelled`.
    pub fn wait_for(&self, condition: WaitCondition) -> Result<()> {
        self.inner
            .engine
            .await_ready(&self.inner.id, &[condition], None, &self.inner.cancel)
    }

    /// Returns whether the container is running.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn is_running(&self) -> Result<bool> {
        match self.inner.engine.ensure_running(&self.inner.id) {
            Ok(()) => Ok(true),
            Err(TestpodError::NotRunning { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Saves the container's filesystem as `image_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot commit.
    pub fn commit(&self, image_name: &str) -> Result<()> {
        self.inner.engine.backend().commit(&self.inner.id, image_name)?;
        tracing::info!(id = %self.inner.id.short(), image = image_name, "container committed");
        Ok(())
    }

    /// Stops the container without removing it.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if the container is gone.
    pub fn stop(&self) -> Result<()> {
        self.inner.engine.backend().stop_container(&self.inner.id)?;
        *lock(&self.inner.info) = None;
        Ok(())
    }

    /// Stops log streaming and removes the container. Only the first call
    /// does anything; later calls report [`TeardownOutcome::AlreadyGone`].
    pub fn remove(&self) -> TeardownOutcome {
        if self.inner.removed.swap(true, Ordering::SeqCst) {
            return TeardownOutcome::AlreadyGone;
        }
        self.stop_logs();
        self.inner.engine.teardown(&self.inner.id)
    }

    /// Relays the container's output to `sink` until removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start the relay.
    pub fn stream_logs(&self, sink: LogSink) -> Result<()> {
        let relay = self
            .inner
            .engine
            .backend()
            .follow_logs(&self.inner.id, sink, CancelToken::new())?;
        if let Some(mut previous) = lock(&self.inner.relay).replace(relay) {
            previous.stop();
        }
        Ok(())
    }

    /// Stops log streaming, if any.
    pub fn stop_logs(&self) {
        let relay = lock(&self.inner.relay).take();
        if let Some(mut relay) = relay {
            relay.stop();
        }
    }

    /// Connection string for a database named after the owning test,
    /// created on first call.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Config` if the container has no DSN provider,
    /// or the provisioning error.
    pub fn dsn(&self) -> Result<String> {
        let provider = self.provider()?;
        let mut cached = lock(&self.inner.own_dsn);
        if let Some(dsn) = cached.as_ref() {
            return Ok(dsn.clone());
        }
        let dsn = provider.create_database(self, &self.inner.test, "")?;
        *cached = Some(dsn.clone());
        Ok(dsn)
    }

    /// Creates a database for `scope`'s test in this (possibly shared)
    /// container and drops it when that scope is cleaned up. An empty
    /// `name` derives the database name from the test name.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Config` if the container has no DSN provider,
    /// or the provisioning error.
    pub fn create_database(&self, scope: &TestScope, name: &str) -> Result<String> {
        let provider = self.provider()?;
        let dsn = provider.create_database(self, scope.name(), name)?;
        let database = if name.is_empty() { scope.name() } else { name }.to_string();
        let host = self.clone();
        scope.defer_resource(format!("drop database {database}"), move || {
            if let Err(e) = provider.drop_database(&host, &database) {
                tracing::warn!(%database, error = %e, "failed to drop database");
            }
        });
        Ok(dsn)
    }

    /// Connection string for an existing database `name`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Config` if the container has no DSN provider.
    pub fn format_dsn(&self, name: &str) -> Result<String> {
        self.provider()?.format_dsn(self, name)
    }

    fn provider(&self) -> Result<Arc<dyn DsnProvider>> {
        self.inner
            .dsn
            .clone()
            .ok_or_else(|| TestpodError::Config {
                message: format!(
                    "container {} ({}) has no DSN provider",
                    self.inner.name, self.inner.image
                ),
            })
    }
}

impl DatabaseHost for Container {
    fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    fn exec(&self, cmd: &[String]) -> Result<ExecOutput> {
        self.inner.engine.backend().exec_in_container(&self.inner.id, cmd)
    }

    fn endpoint(&self, port: &str) -> Result<(String, String)> {
        Ok((self.host()?, self.port(port)?))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
