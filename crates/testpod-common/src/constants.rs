//! System-wide constants and defaults.

use std::time::Duration;

/// Environment variable that forces a specific runtime executable.
pub const RUNTIME_ENV: &str = "TESTPOD_RUNTIME";

/// Runtime executables probed on `PATH`, in order of preference.
pub const RUNTIME_CANDIDATES: [&str; 3] = ["docker", "podman", "nerdctl"];

/// Runtime used when no candidate is found on `PATH`.
pub const DEFAULT_RUNTIME: &str = RUNTIME_CANDIDATES[0];

/// Name of the backend used when none is selected.
pub const DEFAULT_BACKEND: &str = "cli";

/// Default prefix for labels and container names.
pub const DEFAULT_LABEL_PREFIX: &str = "testpod";

/// Host address published ports are bound to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Interval between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single wait condition when none is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall readiness budget for one container.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace period given to `stop` before the container is killed.
pub const STOP_GRACE_SECS: u32 = 2;

/// Number of log lines embedded in readiness timeout errors.
pub const LOG_TAIL_LINES: usize = 20;

/// Age after which labelled containers from earlier runs are stale.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(5 * 60);

/// Maximum number of containers in the create-to-start window at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 20;

/// Maximum length of a label value accepted by the runtimes.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Command that keeps lightweight base images alive for exec-driven tests.
pub const KEEP_ALIVE_COMMAND: [&str; 3] = ["sh", "-c", "echo 'Container started' && sleep 3600"];

/// Base images that exit immediately without a long-running command.
pub const LIGHTWEIGHT_BASE_IMAGES: [&str; 4] = ["alpine", "busybox", "debian", "ubuntu"];
