//! Fluent API for configuring and launching containers.

use std::sync::{Arc, Once, OnceLock};

use chrono::Utc;
use testpod_common::config::TestpodConfig;
use testpod_common::error::Result;
use testpod_common::types::ContainerId;
use testpod_runtime::backend::cli::CliBackend;
use testpod_runtime::backend::registry::default_registry;
use testpod_runtime::backend::{Backend, ContainerRequest};
use testpod_runtime::coordination::{StartSlots, StartupGate};
use testpod_runtime::engine::Engine;
use testpod_runtime::logs::filtered_sink;
use testpod_runtime::prune::prune_stale;
use testpod_runtime::wait::WaitCondition;

use crate::container::Container;
use crate::naming::{container_name, identity_labels};
use crate::options::{self, Opt, Settings};
use crate::scope::TestScope;

/// Builder for configuring a container before launch.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    image: String,
    options: Vec<Opt>,
}

impl ContainerBuilder {
    /// Starts a configuration for `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            options: Vec::new(),
        }
    }

    /// Adds an option.
    #[must_use]
    pub fn with(mut self, opt: Opt) -> Self {
        self.options.push(opt);
        self
    }

    /// Adds several options in order.
    #[must_use]
    pub fn with_all(mut self, opts: impl IntoIterator<Item = Opt>) -> Self {
        self.options.extend(opts);
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(options::env(key, value))
    }

    /// Publishes a container port.
    #[must_use]
    pub fn port(self, port: impl Into<String>) -> Self {
        self.with(options::port(port))
    }

    /// Replaces the command.
    #[must_use]
    pub fn command<S: Into<String>>(self, cmd: impl IntoIterator<Item = S>) -> Self {
        self.with(options::command(cmd))
    }

    /// Adds a readiness condition.
    #[must_use]
    pub fn wait(self, condition: WaitCondition) -> Self {
        self.with(Opt::Wait(condition))
    }

    /// Creates, starts and waits for the container, registering its removal
    /// with `scope`.
    ///
    /// # Errors
    ///
    /// Returns the creation error, the start error or the first readiness
    /// failure. Once the container exists, its removal is already registered
    /// when any later step fails.
    pub fn start(self, scope: &TestScope) -> Result<Container> {
        let config = scope.config();
        let settings = Settings::from_options(self.options);
        let backend = resolve_backend(scope, &settings)?;
        prune_once(backend.as_ref(), config);

        let mut request = settings.request;
        let dropped = request.restrict_to(backend.capabilities());
        if !dropped.is_empty() {
            tracing::debug!(backend = backend.name(), ?dropped, "ignoring unsupported options");
        }
        request.labels.extend(identity_labels(
            &config.label_prefix,
            scope.name(),
            &self.image,
            Utc::now(),
        ));
        let name = request
            .name
            .get_or_insert_with(|| container_name(&config.label_prefix, scope.name()))
            .clone();
        if request.startup_timeout.is_none() {
            request.startup_timeout = Some(config.startup_timeout);
        }

        let engine = Engine::new(backend)
            .with_poll_interval(settings.poll_interval.unwrap_or(config.poll_interval));

        let slot = start_slots(config.max_concurrent).acquire();
        let id = create_gated(&engine, &self.image, &request, settings.gate.as_deref())?;
        let container = Container::new(id.clone(), name, self.image, scope, engine.clone(), settings.dsn);
        let handle = container.clone();
        scope.defer_resource(format!("remove container {}", id.short()), move || {
            let _ = handle.remove();
        });
        let started = engine.start(&id, &request);
        drop(slot);
        started?;

        if settings.stream_logs.unwrap_or(config.verbose) {
            let sink = match settings.log_filter {
                Some(filter) => filtered_sink(scope.sink(), filter),
                None => scope.sink(),
            };
            if let Err(e) = container.stream_logs(sink) {
                tracing::warn!(id = %id.short(), error = %e, "log streaming unavailable");
            }
        }

        engine.await_ready(&id, &request.wait, request.startup_timeout, scope.cancel_token())?;
        let _ = container.refresh()?;
        tracing::info!(
            test = scope.name(),
            id = %id.short(),
            name = container.name(),
            image = container.image(),
            "container ready"
        );
        Ok(container)
    }
}

/// Starts `image` configured by `opts` for the test owning `scope`.
///
/// # Errors
///
/// See [`ContainerBuilder::start`].
pub fn run(scope: &TestScope, image: &str, opts: impl IntoIterator<Item = Opt>) -> Result<Container> {
    ContainerBuilder::new(image).with_all(opts).start(scope)
}

/// Picks the backend: a runtime override, then a backend named by option,
/// then the scope's own backend, then the configured backend name.
fn resolve_backend(scope: &TestScope, settings: &Settings) -> Result<Arc<dyn Backend>> {
    if let Some(runtime) = &settings.runtime {
        return Ok(Arc::new(CliBackend::with_runtime(runtime.clone())));
    }
    if let Some(name) = &settings.backend {
        return lookup_backend(scope, name);
    }
    if let Some(backend) = scope.backend() {
        return Ok(Arc::clone(backend));
    }
    lookup_backend(scope, &scope.config().backend)
}

/// Looks `name` up in the scope's registry, falling back to the default one.
fn lookup_backend(scope: &TestScope, name: &str) -> Result<Arc<dyn Backend>> {
    match scope.registry() {
        Some(registry) if registry.contains(name) => registry.get(name),
        _ => default_registry().get(name),
    }
}

/// Creates under `gate`, if any. A failed creation releases the gate at
/// once; a successful one makes the next creator wait out the settle delay.
fn create_gated(
    engine: &Engine,
    image: &str,
    request: &ContainerRequest,
    gate: Option<&StartupGate>,
) -> Result<ContainerId> {
    let Some(gate) = gate else {
        return engine.create(image, request);
    };
    let ticket = gate.lock_startup();
    let id = engine.create(image, request)?;
    ticket.unlock_startup();
    Ok(id)
}

/// Clears containers left behind by earlier runs, once per process, when
/// the configuration asks for it.
fn prune_once(backend: &dyn Backend, config: &TestpodConfig) {
    static PRUNED: Once = Once::new();
    prune_guarded(&PRUNED, backend, config);
}

fn prune_guarded(once: &Once, backend: &dyn Backend, config: &TestpodConfig) {
    if !config.cleanup_old {
        return;
    }
    once.call_once(|| {
        match prune_stale(backend, &config.label_prefix, config.cleanup_age) {
            Ok(report) if !report.removed.is_empty() => {
                tracing::info!(removed = report.removed.len(), "pruned stale containers");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stale container pruning failed"),
        }
    });
}

fn start_slots(capacity: usize) -> &'static StartSlots {
    static SLOTS: OnceLock<StartSlots> = OnceLock::new();
    SLOTS.get_or_init(|| StartSlots::new(capacity))
}

#[cfg(test)]
mod tests {
    use testpod_runtime::backend::memory::MemoryBackend;

    use super::*;

    fn stale_container(backend: &MemoryBackend) -> ContainerId {
        let mut request = ContainerRequest::default();
        let _ = request.labels.insert("testpod".into(), "true".into());
        let id = backend.create_container("redis:7", &request).unwrap();
        backend.set_created(&id, Utc::now() - chrono::Duration::hours(1));
        id
    }

    #[test]
    fn stale_containers_are_kept_by_default() {
        let backend = MemoryBackend::new();
        let id = stale_container(&backend);
        prune_guarded(&Once::new(), &backend, &TestpodConfig::default());
        assert_eq!(backend.container_ids(), vec![id]);
    }

    #[test]
    fn stale_containers_are_removed_when_enabled() {
        let backend = MemoryBackend::new();
        let _ = stale_container(&backend);
        let config = TestpodConfig {
            cleanup_old: true,
            ..TestpodConfig::default()
        };
        prune_guarded(&Once::new(), &backend, &config);
        assert!(backend.container_ids().is_empty());
    }

    #[test]
    fn pruning_runs_once_per_guard() {
        let backend = MemoryBackend::new();
        let config = TestpodConfig {
            cleanup_old: true,
            ..TestpodConfig::default()
        };
        let once = Once::new();
        prune_guarded(&once, &backend, &config);
        let id = stale_container(&backend);
        prune_guarded(&once, &backend, &config);
        assert_eq!(backend.container_ids(), vec![id]);
    }
}
