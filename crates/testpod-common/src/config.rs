//! Process-wide configuration for the testpod engine.
//!
//! Values come from `TESTPOD_*` environment variables and are resolved once
//! per process; see [`TestpodConfig::global`].

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the testpod engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestpodConfig {
    /// Runtime executable forced through `TESTPOD_RUNTIME`.
    pub runtime: Option<String>,
    /// Backend used when a container does not select one.
    pub backend: String,
    /// Stream the logs of every container to its test's sink.
    pub verbose: bool,
    /// Leave containers running when their test panics.
    pub keep_failed: bool,
    /// Prefix for labels and generated container names.
    pub label_prefix: String,
    /// Remove stale labelled containers before the first start in a process.
    pub cleanup_old: bool,
    /// Age after which labelled containers from earlier runs are stale.
    pub cleanup_age: Duration,
    /// Maximum number of containers being created and started at once.
    pub max_concurrent: usize,
    /// Interval between readiness probes.
    pub poll_interval: Duration,
    /// Overall readiness budget for one container.
    pub startup_timeout: Duration,
}

impl Default for TestpodConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            backend: constants::DEFAULT_BACKEND.to_string(),
            verbose: false,
            keep_failed: false,
            label_prefix: constants::DEFAULT_LABEL_PREFIX.to_string(),
            cleanup_old: false,
            cleanup_age: constants::DEFAULT_CLEANUP_AGE,
            max_concurrent: constants::DEFAULT_MAX_CONCURRENT,
            poll_interval: constants::DEFAULT_POLL_INTERVAL,
            startup_timeout: constants::DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

impl TestpodConfig {
    /// Builds a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values keep their default and emit a warning.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        cfg.runtime = get(constants::RUNTIME_ENV);
        if let Some(backend) = get("TESTPOD_BACKEND") {
            cfg.backend = backend;
        }
        if let Some(prefix) = get("TESTPOD_LABEL") {
            cfg.label_prefix = prefix;
        }
        if let Some(v) = get("TESTPOD_VERBOSE") {
            cfg.verbose = parse_flag(&v);
        }
        if let Some(v) = get("TESTPOD_KEEP_FAILED") {
            cfg.keep_failed = parse_flag(&v);
        }
        if let Some(v) = get("TESTPOD_CLEANUP_OLD") {
            cfg.cleanup_old = parse_flag(&v);
        }
        if let Some(v) = get("TESTPOD_MAX_CONCURRENT") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => cfg.max_concurrent = n,
                _ => tracing::warn!(value = %v, "ignoring invalid TESTPOD_MAX_CONCURRENT"),
            }
        }
        override_duration(&get, "TESTPOD_CLEANUP_AGE", &mut cfg.cleanup_age);
        override_duration(&get, "TESTPOD_POLL_INTERVAL", &mut cfg.poll_interval);
        override_duration(&get, "TESTPOD_STARTUP_TIMEOUT", &mut cfg.startup_timeout);
        cfg
    }

    /// Returns the configuration resolved once for this process.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<TestpodConfig> = OnceLock::new();
        GLOBAL.get_or_init(Self::from_env)
    }
}

fn override_duration(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    if let Some(raw) = get(key) {
        match parse_duration(&raw) {
            Some(d) => *slot = d,
            None => tracing::warn!(key, value = %raw, "ignoring invalid duration"),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parses durations like `250ms`, `30s`, `5m` or `1h`. A bare number is seconds.
#[must_use]
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };
    num.trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit_ms))
        .map(Duration::from_millis)
}
