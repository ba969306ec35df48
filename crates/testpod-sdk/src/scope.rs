//! Test-owned cleanup.
//!
//! A [`TestScope`] stands for one running test. Containers, databases and
//! log relays register their teardown with it, and the scope runs those
//! actions in reverse order exactly once: on an explicit
//! [`TestScope::cleanup`], or when the scope is dropped at the end of the
//! test body, including when the body panics.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use testpod_common::config::TestpodConfig;
use testpod_runtime::backend::Backend;
use testpod_runtime::backend::registry::Registry;
use testpod_runtime::cancel::CancelToken;
use testpod_runtime::logs::{LogSink, tracing_sink};

type Action = Box<dyn FnOnce() + Send>;

struct Deferred {
    label: String,
    /// Skipped when a panicking test keeps its resources for inspection.
    resource: bool,
    action: Action,
}

/// Cleanup context of one test.
pub struct TestScope {
    name: String,
    config: TestpodConfig,
    backend: Option<Arc<dyn Backend>>,
    registry: Option<Registry>,
    cancel: CancelToken,
    sink: LogSink,
    deferred: Mutex<Vec<Deferred>>,
}

impl std::fmt::Debug for TestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestScope")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl TestScope {
    /// Opens a scope for the test called `name` using the process
    /// configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            sink: tracing_sink(name.clone()),
            name,
            config: TestpodConfig::global().clone(),
            backend: None,
            registry: None,
            cancel: CancelToken::new(),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Gives the test a deadline; readiness waits stop when it passes.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.cancel = CancelToken::with_timeout(timeout);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: TestpodConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `backend` for containers that do not pick one explicitly.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Resolves backend names against `registry` before the default one.
    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sends streamed container output to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Test name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &TestpodConfig {
        &self.config
    }

    /// Cancellation signal of the test.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Log sink of the test.
    #[must_use]
    pub fn sink(&self) -> LogSink {
        Arc::clone(&self.sink)
    }

    pub(crate) const fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.backend.as_ref()
    }

    pub(crate) const fn registry(&self) -> Option<&Registry> {
        self.registry.as_ref()
    }

    /// Registers an action to run at cleanup.
    pub fn defer(&self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        self.push(label.into(), false, Box::new(action));
    }

    /// Registers the release of a container or database.
    pub(crate) fn defer_resource(
        &self,
        label: impl Into<String>,
        action: impl FnOnce() + Send + 'static,
    ) {
        self.push(label.into(), true, Box::new(action));
    }

    /// Number of actions not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Cancels outstanding waits and runs every registered action, newest
    /// first. Further calls do nothing.
    pub fn cleanup(&self) {
        self.finish(false);
    }

    fn push(&self, label: String, resource: bool, action: Action) {
        tracing::trace!(test = %self.name, %label, "cleanup registered");
        self.lock().push(Deferred {
            label,
            resource,
            action,
        });
    }

    fn finish(&self, keep_resources: bool) {
        self.cancel.cancel();
        let actions = std::mem::take(&mut *self.lock());
        for deferred in actions.into_iter().rev() {
            if keep_resources && deferred.resource {
                tracing::warn!(
                    test = %self.name,
                    label = %deferred.label,
                    "test failed, keeping resource for inspection"
                );
                continue;
            }
            if catch_unwind(AssertUnwindSafe(deferred.action)).is_err() {
                tracing::warn!(test = %self.name, label = %deferred.label, "cleanup action panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Deferred>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        let keep = std::thread::panicking() && self.config.keep_failed;
        self.finish(keep);
    }
}
