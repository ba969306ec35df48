//! Named lookup of backends.
//!
//! A [`Registry`] is assembled with a [`RegistryBuilder`] and is immutable
//! afterwards, so it can be shared freely between test threads. Several
//! names may point at the same backend instance.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use testpod_common::error::{Result, TestpodError};

use super::Backend;
use super::cli::CliBackend;
use super::memory::MemoryBackend;

/// Names under which the default registry exposes the CLI backend.
pub const CLI_ALIASES: [&str; 3] = ["cli", "local", "docker"];

/// Name of the in-process backend in the default registry.
pub const MEMORY_BACKEND: &str = "memory";

/// Immutable map from backend names to implementations.
#[derive(Clone, Default)]
pub struct Registry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}

impl Registry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if no backend has that name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| TestpodError::NotFound {
                kind: "backend",
                id: name.to_string(),
            })
    }

    /// Returns whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

/// Accumulates registrations before freezing them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl RegistryBuilder {
    /// Registers `backend` under `name`, replacing any earlier entry.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let name = name.into();
        if self.backends.insert(name.clone(), backend).is_some() {
            tracing::debug!(%name, "backend registration replaced");
        }
        self
    }

    /// Makes `alias` resolve to the backend already registered as `target`.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::NotFound` if `target` is not registered.
    pub fn alias(mut self, alias: impl Into<String>, target: &str) -> Result<Self> {
        let backend = self
            .backends
            .get(target)
            .cloned()
            .ok_or_else(|| TestpodError::NotFound {
                kind: "backend",
                id: target.to_string(),
            })?;
        let _ = self.backends.insert(alias.into(), backend);
        Ok(self)
    }

    /// Freezes the registrations.
    #[must_use]
    pub fn build(self) -> Registry {
        Registry {
            backends: self.backends,
        }
    }
}

/// Process-wide registry with the CLI backend under every [`CLI_ALIASES`]
/// name and one shared in-memory backend under [`MEMORY_BACKEND`].
pub fn default_registry() -> &'static Registry {
    static DEFAULT: OnceLock<Registry> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        let cli: Arc<dyn Backend> = Arc::new(CliBackend::new());
        CLI_ALIASES
            .iter()
            .fold(Registry::builder(), |builder, name| {
                builder.register(*name, Arc::clone(&cli))
            })
            .register(MEMORY_BACKEND, Arc::new(MemoryBackend::new()))
            .build()
    })
}
