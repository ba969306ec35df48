//! Container runtime discovery.
//!
//! The runtime is chosen by, in order: the `TESTPOD_RUNTIME` environment
//! variable, the first of [`RUNTIME_CANDIDATES`] present on `PATH`, and
//! finally `docker`.

use std::sync::OnceLock;

use testpod_common::constants::{DEFAULT_RUNTIME, RUNTIME_CANDIDATES, RUNTIME_ENV};

/// Finds which container runtime executable to invoke.
#[must_use]
pub fn discover_runtime() -> String {
    let env_override = std::env::var(RUNTIME_ENV).ok();
    resolve_runtime(env_override.as_deref(), |name| which::which(name).is_ok())
}

/// Pure resolution step behind [`discover_runtime`].
///
/// `on_path` reports whether an executable can be found on the search path.
#[must_use]
pub fn resolve_runtime(env_override: Option<&str>, on_path: impl Fn(&str) -> bool) -> String {
    if let Some(runtime) = env_override.map(str::trim).filter(|r| !r.is_empty()) {
        return runtime.to_string();
    }
    RUNTIME_CANDIDATES
        .iter()
        .find(|name| on_path(name))
        .map_or_else(|| DEFAULT_RUNTIME.to_string(), |name| (*name).to_string())
}

/// A runtime name discovered once and reused for the life of its owner.
#[derive(Debug, Default)]
pub struct RuntimeCache {
    runtime: OnceLock<String>,
}

impl RuntimeCache {
    /// Creates an empty cache that discovers on first use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runtime: OnceLock::new(),
        }
    }

    /// Creates a cache pinned to a specific executable.
    #[must_use]
    pub fn pinned(runtime: impl Into<String>) -> Self {
        let cache = Self::new();
        let _ = cache.runtime.set(runtime.into());
        cache
    }

    /// Returns the cached runtime, discovering it on first call.
    pub fn get(&self) -> &str {
        self.runtime.get_or_init(|| {
            let runtime = discover_runtime();
            tracing::debug!(%runtime, "container runtime discovered");
            runtime
        })
    }
}
