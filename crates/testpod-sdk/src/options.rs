//! Functional options.
//!
//! Every tunable of a container is an [`Opt`] value. Options are applied in
//! order to a [`Settings`] before anything reaches a backend; later options
//! win where two set the same field. Settings a backend cannot honour are
//! dropped silently when the container is created, so one option list can
//! be shared across backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testpod_dsn::DsnProvider;
use testpod_runtime::backend::{BindMount, ContainerRequest};
use testpod_runtime::coordination::StartupGate;
use testpod_runtime::files::FileEntry;
use testpod_runtime::wait::WaitCondition;

use crate::naming::sanitize_label_value;

/// Predicate deciding which streamed log lines reach the sink.
pub type LogFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One container option.
#[derive(Clone)]
pub enum Opt {
    /// Sets an environment variable.
    Env(String, String),
    /// Publishes a container port.
    Port(String),
    /// Mounts a host path.
    Mount(BindMount),
    /// Replaces the command.
    Command(Vec<String>),
    /// Appends arguments to the command.
    Args(Vec<String>),
    /// Attaches to a network.
    Network(String),
    /// Runs as a user.
    User(String),
    /// Sets the working directory.
    WorkingDir(String),
    /// Limits memory, in runtime notation (`512m`).
    Memory(String),
    /// Limits CPUs, in runtime notation (`0.5`).
    Cpus(String),
    /// Runs privileged.
    Privileged,
    /// Adds a label.
    Label(String, String),
    /// Names the container.
    Name(String),
    /// Copies a file in before start.
    File(FileEntry),
    /// Adds a readiness condition.
    Wait(WaitCondition),
    /// Bounds the whole readiness sequence.
    StartupTimeout(Duration),
    /// Overrides the readiness poll interval.
    PollInterval(Duration),
    /// Attaches a DSN provider.
    Dsn(Arc<dyn DsnProvider>),
    /// Serializes creation with other containers sharing the gate.
    StartupGate(Arc<StartupGate>),
    /// Selects a registered backend by name.
    Backend(String),
    /// Drives a specific runtime executable through the CLI backend.
    Runtime(String),
    /// Filters streamed log lines.
    LogFilter(LogFilter),
    /// Streams the container's output to the test's sink.
    StreamLogs(bool),
    /// Several options applied in order.
    Group(Vec<Opt>),
}

impl std::fmt::Debug for Opt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(k, v) => write!(f, "Env({k}={v})"),
            Self::Port(p) => write!(f, "Port({p})"),
            Self::Mount(m) => write!(f, "Mount({})", m.spec()),
            Self::Command(c) => write!(f, "Command({c:?})"),
            Self::Args(a) => write!(f, "Args({a:?})"),
            Self::Network(n) => write!(f, "Network({n})"),
            Self::User(u) => write!(f, "User({u})"),
            Self::WorkingDir(d) => write!(f, "WorkingDir({d})"),
            Self::Memory(m) => write!(f, "Memory({m})"),
            Self::Cpus(c) => write!(f, "Cpus({c})"),
            Self::Privileged => f.write_str("Privileged"),
            Self::Label(k, v) => write!(f, "Label({k}={v})"),
            Self::Name(n) => write!(f, "Name({n})"),
            Self::File(e) => write!(f, "File({})", e.target),
            Self::Wait(w) => write!(f, "Wait({w})"),
            Self::StartupTimeout(d) => write!(f, "StartupTimeout({d:?})"),
            Self::PollInterval(d) => write!(f, "PollInterval({d:?})"),
            Self::Dsn(p) => write!(f, "Dsn({})", p.family()),
            Self::StartupGate(g) => write!(f, "StartupGate({})", g.family()),
            Self::Backend(b) => write!(f, "Backend({b})"),
            Self::Runtime(r) => write!(f, "Runtime({r})"),
            Self::LogFilter(_) => f.write_str("LogFilter(..)"),
            Self::StreamLogs(on) => write!(f, "StreamLogs({on})"),
            Self::Group(g) => f.debug_tuple("Group").field(g).finish(),
        }
    }
}

/// Accumulated result of applying options.
#[derive(Default)]
pub struct Settings {
    /// What the backend will be asked to create.
    pub request: ContainerRequest,
    /// DSN provider for [`crate::Container::dsn`].
    pub dsn: Option<Arc<dyn DsnProvider>>,
    /// Startup gate held around creation.
    pub gate: Option<Arc<StartupGate>>,
    /// Registered backend to use.
    pub backend: Option<String>,
    /// Runtime executable to drive directly.
    pub runtime: Option<String>,
    /// Streamed log filter.
    pub log_filter: Option<LogFilter>,
    /// Explicit log streaming choice; the configuration decides when unset.
    pub stream_logs: Option<bool>,
    /// Poll interval override.
    pub poll_interval: Option<Duration>,
}

impl Settings {
    /// Applies `options` in order to fresh settings.
    #[must_use]
    pub fn from_options(options: impl IntoIterator<Item = Opt>) -> Self {
        let mut settings = Self::default();
        for opt in options {
            settings.apply(opt);
        }
        settings
    }

    /// Applies one option.
    pub fn apply(&mut self, opt: Opt) {
        let req = &mut self.request;
        match opt {
            Opt::Env(k, v) => {
                let _ = req.env.insert(k, v);
            }
            Opt::Port(p) => {
                if !req.ports.contains(&p) {
                    req.ports.push(p);
                }
            }
            Opt::Mount(m) => req.mounts.push(m),
            Opt::Command(c) => req.command = Some(c),
            Opt::Args(a) => req.command.get_or_insert_with(Vec::new).extend(a),
            Opt::Network(n) => req.network = Some(n),
            Opt::User(u) => req.user = Some(u),
            Opt::WorkingDir(d) => req.working_dir = Some(d),
            Opt::Memory(m) => req.limits.memory = Some(m),
            Opt::Cpus(c) => req.limits.cpus = Some(c),
            Opt::Privileged => req.privileged = true,
            Opt::Label(k, v) => {
                let _ = req.labels.insert(k, sanitize_label_value(&v));
            }
            Opt::Name(n) => req.name = Some(n),
            Opt::File(e) => req.files.push(e),
            Opt::Wait(w) => req.wait.push(w),
            Opt::StartupTimeout(d) => req.startup_timeout = Some(d),
            Opt::PollInterval(d) => self.poll_interval = Some(d),
            Opt::Dsn(p) => self.dsn = Some(p),
            Opt::StartupGate(g) => self.gate = Some(g),
            Opt::Backend(b) => self.backend = Some(b),
            Opt::Runtime(r) => self.runtime = Some(r),
            Opt::LogFilter(f) => self.log_filter = Some(f),
            Opt::StreamLogs(on) => self.stream_logs = Some(on),
            Opt::Group(group) => {
                for opt in group {
                    self.apply(opt);
                }
            }
        }
    }
}

/// Sets an environment variable.
#[must_use]
pub fn env(key: impl Into<String>, value: impl Into<String>) -> Opt {
    Opt::Env(key.into(), value.into())
}

/// Publishes `port` (`5432`, `5432/udp` or `host:container`).
#[must_use]
pub fn port(port: impl Into<String>) -> Opt {
    Opt::Port(port.into())
}

/// Mounts a host path read-write.
#[must_use]
pub fn bind_mount(host: impl Into<PathBuf>, container: impl Into<String>) -> Opt {
    Opt::Mount(BindMount {
        host: host.into().display().to_string(),
        container: container.into(),
        read_only: false,
    })
}

/// Mounts a host path read-only.
#[must_use]
pub fn read_only_mount(host: impl Into<PathBuf>, container: impl Into<String>) -> Opt {
    Opt::Mount(BindMount {
        host: host.into().display().to_string(),
        container: container.into(),
        read_only: true,
    })
}

/// Replaces the image's command.
#[must_use]
pub fn command<S: Into<String>>(cmd: impl IntoIterator<Item = S>) -> Opt {
    Opt::Command(cmd.into_iter().map(Into::into).collect())
}

/// Appends arguments to the command.
#[must_use]
pub fn args<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Opt {
    Opt::Args(args.into_iter().map(Into::into).collect())
}

/// Attaches the container to `network`.
#[must_use]
pub fn network(network: impl Into<String>) -> Opt {
    Opt::Network(network.into())
}

/// Runs the container as `user`.
#[must_use]
pub fn user(user: impl Into<String>) -> Opt {
    Opt::User(user.into())
}

/// Sets the working directory.
#[must_use]
pub fn working_dir(dir: impl Into<String>) -> Opt {
    Opt::WorkingDir(dir.into())
}

/// Limits memory.
#[must_use]
pub fn memory(limit: impl Into<String>) -> Opt {
    Opt::Memory(limit.into())
}

/// Limits CPUs.
#[must_use]
pub fn cpus(limit: impl Into<String>) -> Opt {
    Opt::Cpus(limit.into())
}

/// Runs the container privileged.
#[must_use]
pub const fn privileged() -> Opt {
    Opt::Privileged
}

/// Adds a label; the value is sanitized.
#[must_use]
pub fn label(key: impl Into<String>, value: impl Into<String>) -> Opt {
    Opt::Label(key.into(), value.into())
}

/// Names the container instead of generating a unique name.
#[must_use]
pub fn name(name: impl Into<String>) -> Opt {
    Opt::Name(name.into())
}

/// Copies a host file or directory to `target` before start.
#[must_use]
pub fn file(source: impl Into<PathBuf>, target: impl Into<String>, mode: u32) -> Opt {
    Opt::File(FileEntry::from_path(source, target, mode))
}

/// Writes `content` to `target` before start.
#[must_use]
pub fn file_content(content: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> Opt {
    Opt::File(FileEntry::from_bytes(content, target, mode))
}

/// Waits for a log line containing `pattern`.
#[must_use]
pub fn wait_for_log(pattern: impl Into<String>, timeout: Duration) -> Opt {
    Opt::Wait(WaitCondition::log(pattern, timeout))
}

/// Waits for `cmd` to exit with status 0.
#[must_use]
pub fn wait_for_exec<S: Into<String>>(cmd: impl IntoIterator<Item = S>, timeout: Duration) -> Opt {
    Opt::Wait(WaitCondition::exec(cmd, timeout))
}

/// Waits for `GET path` on `port` to answer `expected`.
#[must_use]
pub fn wait_for_http(
    path: impl Into<String>,
    port: impl Into<String>,
    expected: u16,
    timeout: Duration,
) -> Opt {
    Opt::Wait(WaitCondition::http(path, port, expected, timeout))
}

/// Bounds the whole readiness sequence.
#[must_use]
pub const fn startup_timeout(timeout: Duration) -> Opt {
    Opt::StartupTimeout(timeout)
}

/// Overrides the readiness poll interval.
#[must_use]
pub const fn poll_interval(interval: Duration) -> Opt {
    Opt::PollInterval(interval)
}

/// Attaches a DSN provider.
#[must_use]
pub fn dsn(provider: Arc<dyn DsnProvider>) -> Opt {
    Opt::Dsn(provider)
}

/// Holds `gate` around creation.
#[must_use]
pub const fn startup_gate(gate: Arc<StartupGate>) -> Opt {
    Opt::StartupGate(gate)
}

/// Selects a registered backend.
#[must_use]
pub fn backend(name: impl Into<String>) -> Opt {
    Opt::Backend(name.into())
}

/// Drives `runtime` (for example `podman`) through the CLI backend.
#[must_use]
pub fn runtime(runtime: impl Into<String>) -> Opt {
    Opt::Runtime(runtime.into())
}

/// Only streams log lines accepted by `filter`.
#[must_use]
pub fn log_filter(filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Opt {
    Opt::LogFilter(Arc::new(filter))
}

/// Streams the container's output to the test's sink.
#[must_use]
pub const fn stream_logs(enabled: bool) -> Opt {
    Opt::StreamLogs(enabled)
}

/// Bundles options into one.
#[must_use]
pub fn group(options: impl IntoIterator<Item = Opt>) -> Opt {
    Opt::Group(options.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_env_wins() {
        let s = Settings::from_options([env("A", "1"), env("B", "2"), env("A", "3")]);
        assert_eq!(s.request.env.get("A").map(String::as_str), Some("3"));
        assert_eq!(s.request.env.len(), 2);
    }

    #[test]
    fn args_append_to_command() {
        let s = Settings::from_options([args(["-c", "fsync=off"]), args(["-c", "max_connections=100"])]);
        assert_eq!(
            s.request.command.unwrap(),
            vec!["-c", "fsync=off", "-c", "max_connections=100"]
        );
    }

    #[test]
    fn groups_flatten_in_order() {
        let s = Settings::from_options([
            group([port("5432"), wait_for_log("ready", Duration::from_secs(1))]),
            port("5432"),
            wait_for_exec(["true"], Duration::from_secs(1)),
        ]);
        assert_eq!(s.request.ports, vec!["5432"]);
        assert_eq!(s.request.wait.len(), 2);
        assert!(matches!(s.request.wait[0], WaitCondition::LogMatch { .. }));
    }

    #[test]
    fn labels_are_sanitized() {
        let s = Settings::from_options([label("origin", "ghcr.io/acme/app:1.2")]);
        assert_eq!(s.request.labels["origin"], "ghcr.io_acme_app-1.2");
    }

    #[test]
    fn mounts_keep_access_mode() {
        let s = Settings::from_options([read_only_mount("/tmp/data", "/data")]);
        assert_eq!(s.request.mounts[0].spec(), "/tmp/data:/data:ro");
    }

    #[test]
    fn engine_settings_stay_outside_request() {
        let s = Settings::from_options([
            backend("memory"),
            poll_interval(Duration::from_millis(5)),
            stream_logs(true),
        ]);
        assert_eq!(s.backend.as_deref(), Some("memory"));
        assert_eq!(s.poll_interval, Some(Duration::from_millis(5)));
        assert_eq!(s.stream_logs, Some(true));
    }
}
