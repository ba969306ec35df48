//! Readiness waiting.
//!
//! Each [`WaitCondition`] moves through [`WaitState`]: it is probed once
//! immediately, then on a fixed interval until the probe succeeds, its own
//! timeout elapses, or the caller's [`CancelToken`] fires. A timeout error
//! always carries the tail of the container's output.

use std::fmt;
use std::time::{Duration, Instant};

use testpod_common::constants::{DEFAULT_POLL_INTERVAL, LOG_TAIL_LINES};
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::ContainerId;

use crate::backend::{Backend, reachable_host};
use crate::cancel::CancelToken;
use crate::logs::format_tail;

/// A readiness predicate with its own timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// The accumulated output contains `pattern`.
    LogMatch {
        /// Substring to look for.
        pattern: String,
        /// Time allowed for the pattern to appear.
        timeout: Duration,
    },
    /// `command` exits with status zero inside the container.
    ExecSuccess {
        /// Command and arguments.
        command: Vec<String>,
        /// Time allowed for the command to succeed.
        timeout: Duration,
    },
    /// An HTTP GET of `path` on container port `port` answers `expected`.
    HttpStatus {
        /// Request path, starting with `/`.
        path: String,
        /// Container port serving HTTP.
        port: String,
        /// Expected status code.
        expected: u16,
        /// Time allowed for the endpoint to answer.
        timeout: Duration,
    },
}

impl WaitCondition {
    /// Waits for a log line containing `pattern`.
    #[must_use]
    pub fn log(pattern: impl Into<String>, timeout: Duration) -> Self {
        Self::LogMatch {
            pattern: pattern.into(),
            timeout,
        }
    }

    /// Waits for `command` to exit successfully.
    #[must_use]
    pub fn exec<S: Into<String>>(command: impl IntoIterator<Item = S>, timeout: Duration) -> Self {
        Self::ExecSuccess {
            command: command.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// Waits for an HTTP endpoint to answer with `expected`.
    #[must_use]
    pub fn http(
        path: impl Into<String>,
        port: impl Into<String>,
        expected: u16,
        timeout: Duration,
    ) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self::HttpStatus {
            path,
            port: port.into(),
            expected,
            timeout,
        }
    }

    /// The condition's own timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        match self {
            Self::LogMatch { timeout, .. }
            | Self::ExecSuccess { timeout, .. }
            | Self::HttpStatus { timeout, .. } => *timeout,
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogMatch { pattern, .. } => write!(f, "log line containing \"{pattern}\""),
            Self::ExecSuccess { command, .. } => {
                write!(f, "command \"{}\" to succeed", command.join(" "))
            }
            Self::HttpStatus {
                path,
                port,
                expected,
                ..
            } => write!(f, "HTTP {expected} from port {port}{path}"),
        }
    }
}

/// Progress of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Not probed yet.
    Pending,
    /// Probed at least once without success.
    Polling,
    /// The predicate was observed to hold.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

/// Timing knobs shared by every condition of one container.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Interval between probes after the immediate first one.
    pub interval: Duration,
    /// Hard limit that cuts every condition short, e.g. a startup budget.
    pub not_after: Option<Instant>,
}

impl PollSettings {
    /// Settings with the given interval and no overall limit.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            not_after: None,
        }
    }

    /// Adds an overall limit.
    #[must_use]
    pub const fn not_after(mut self, limit: Instant) -> Self {
        self.not_after = Some(limit);
        self
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

/// How a successful wait went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// Number of probes evaluated, including the successful one.
    pub attempts: u32,
    /// Time from the first probe to success.
    pub elapsed: Duration,
}

const MIN_CHECK_BUDGET: Duration = Duration::from_millis(1);

/// Drives one probe function through the wait state machine.
#[derive(Debug)]
pub struct Poller {
    interval: Duration,
    started: Instant,
    deadline: Instant,
    attempts: u32,
    state: WaitState,
}

impl Poller {
    /// Creates a poller that gives up after `timeout`, or at `settings.not_after`
    /// if that comes first.
    #[must_use]
    pub fn new(timeout: Duration, settings: &PollSettings) -> Self {
        let started = Instant::now();
        let mut deadline = started + timeout;
        if let Some(limit) = settings.not_after {
            deadline = deadline.min(limit);
        }
        Self {
            interval: settings.interval.max(Duration::from_millis(1)),
            started,
            deadline,
            attempts: 0,
            state: WaitState::Pending,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WaitState {
        self.state
    }

    /// Probes evaluated so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time since the poller was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Runs `probe` until it reports ready or the deadline passes.
    ///
    /// Each call receives the time left before the deadline or the
    /// cancellation deadline, whichever is sooner, and must not block longer.
    /// Returns the final state, [`WaitState::Ready`] or [`WaitState::TimedOut`].
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Cancelled` if `cancel` fires, or the probe's own
    /// error if it fails fatally.
    pub fn run(
        &mut self,
        cancel: &CancelToken,
        mut probe: impl FnMut(Duration) -> Result<bool>,
    ) -> Result<WaitState> {
        self.state = WaitState::Polling;
        loop {
            self.attempts += 1;
            if probe(self.budget(cancel))? {
                self.state = WaitState::Ready;
                return Ok(self.state);
            }
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            let now = Instant::now();
            if now >= self.deadline {
                self.state = WaitState::TimedOut;
                return Ok(self.state);
            }
            if cancel.sleep(self.interval.min(self.deadline - now)) {
                return Err(self.cancelled());
            }
        }
    }

    /// Time a single probe may take.
    fn budget(&self, cancel: &CancelToken) -> Duration {
        let left = self.deadline.saturating_duration_since(Instant::now());
        cancel
            .remaining()
            .map_or(left, |r| left.min(r))
            .max(MIN_CHECK_BUDGET)
    }

    fn cancelled(&mut self) -> TestpodError {
        self.state = WaitState::Cancelled;
        TestpodError::Cancelled {
            operation: "readiness wait".into(),
        }
    }
}

/// Blocks until `condition` holds for container `id`.
///
/// # Errors
///
/// Returns `TestpodError::ReadinessTimeout` (with the log tail) on timeout,
/// `TestpodError::Cancelled` on cancellation, or `TestpodError::NotFound`
/// if the container disappears while waiting.
pub fn wait_for_condition<B: Backend + ?Sized>(
    backend: &B,
    id: &ContainerId,
    condition: &WaitCondition,
    settings: &PollSettings,
    cancel: &CancelToken,
) -> Result<WaitReport> {
    let mut poller = Poller::new(condition.timeout(), settings);
    let state = match condition {
        WaitCondition::LogMatch { pattern, .. } => {
            poller.run(cancel, |_| log_probe(backend, id, pattern))?
        }
        WaitCondition::ExecSuccess { command, .. } => {
            poller.run(cancel, |limit| exec_probe(backend, id, command, limit))?
        }
        WaitCondition::HttpStatus {
            path,
            port,
            expected,
            ..
        } => {
            let mut probe = HttpProbe::new(path, port, *expected);
            poller.run(cancel, |limit| probe.check(backend, id, limit))?
        }
    };

    if state == WaitState::Ready {
        tracing::debug!(
            id = %id.short(),
            condition = %condition,
            attempts = poller.attempts(),
            "condition met"
        );
        return Ok(WaitReport {
            attempts: poller.attempts(),
            elapsed: poller.elapsed(),
        });
    }
    let log_tail = match backend.container_logs(id) {
        Ok(text) => format_tail(&text, LOG_TAIL_LINES),
        Err(e) => format!("(container output unavailable: {e})"),
    };
    Err(TestpodError::ReadinessTimeout {
        condition: condition.to_string(),
        elapsed: poller.elapsed(),
        attempts: poller.attempts(),
        log_tail,
    })
}

fn log_probe<B: Backend + ?Sized>(backend: &B, id: &ContainerId, pattern: &str) -> Result<bool> {
    match backend.container_logs(id) {
        Ok(logs) => Ok(logs.contains(pattern)),
        Err(e) if e.is_container_gone() => Err(e),
        Err(e) => {
            tracing::trace!(id = %id.short(), error = %e, "log probe failed");
            Ok(false)
        }
    }
}

fn exec_probe<B: Backend + ?Sized>(
    backend: &B,
    id: &ContainerId,
    command: &[String],
    limit: Duration,
) -> Result<bool> {
    match backend.exec_with_limit(id, command, limit) {
        Ok(out) => Ok(out.success()),
        Err(e) if e.is_container_gone() => Err(e),
        Err(e) => {
            tracing::trace!(id = %id.short(), error = %e, "exec probe failed");
            Ok(false)
        }
    }
}

/// Resolves the endpoint once, then probes from the host when the port is
/// published and from inside the container otherwise.
struct HttpProbe<'a> {
    path: &'a str,
    port: &'a str,
    expected: u16,
    target: Option<HttpTarget>,
}

enum HttpTarget {
    Host {
        url: String,
        client: reqwest::blocking::Client,
    },
    InContainer(Vec<String>),
}

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

impl<'a> HttpProbe<'a> {
    const fn new(path: &'a str, port: &'a str, expected: u16) -> Self {
        Self {
            path,
            port,
            expected,
            target: None,
        }
    }

    fn check<B: Backend + ?Sized>(
        &mut self,
        backend: &B,
        id: &ContainerId,
        limit: Duration,
    ) -> Result<bool> {
        if self.target.is_none() {
            self.target = Some(self.resolve(backend, id)?);
        }
        let status = match &self.target {
            Some(HttpTarget::Host { url, client }) => match client
                .get(url)
                .timeout(limit.min(HTTP_PROBE_TIMEOUT))
                .send()
            {
                Ok(resp) => Some(resp.status().as_u16()),
                Err(e) => {
                    tracing::trace!(%url, error = %e, "http probe failed");
                    None
                }
            },
            Some(HttpTarget::InContainer(script)) => {
                let out = match backend.exec_with_limit(id, script, limit) {
                    Ok(out) => out,
                    Err(e) if e.is_container_gone() => return Err(e),
                    Err(_) => return Ok(false),
                };
                out.stdout.trim().parse::<u16>().ok()
            }
            None => None,
        };
        Ok(status == Some(self.expected))
    }

    fn resolve<B: Backend + ?Sized>(&self, backend: &B, id: &ContainerId) -> Result<HttpTarget> {
        let info = backend.inspect_container(id)?;
        if let Some(binding) = info.host_binding(self.port) {
            let client = reqwest::blocking::Client::builder()
                .timeout(HTTP_PROBE_TIMEOUT)
                .build()
                .map_err(|e| TestpodError::Config {
                    message: format!("cannot build HTTP client: {e}"),
                })?;
            let url = format!(
                "http://{}:{}{}",
                reachable_host(&binding.host_ip),
                binding.host_port,
                self.path
            );
            return Ok(HttpTarget::Host { url, client });
        }
        Ok(HttpTarget::InContainer(in_container_script(
            self.port, self.path,
        )))
    }
}

/// Shell script that prints the status code of `localhost:port/path` using
/// whichever of curl or wget the image ships.
#[must_use]
pub fn in_container_script(port: &str, path: &str) -> Vec<String> {
    let url = format!("http://localhost:{port}{path}");
    let script = format!(
        "if command -v curl >/dev/null 2>&1; then \
         curl -s -o /dev/null -w '%{{http_code}}' '{url}'; \
         else wget -q -S -O /dev/null '{url}' 2>&1 | awk '/HTTP\\//{{code=$2}} END{{print code}}'; fi"
    );
    vec!["sh".into(), "-c".into(), script]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::ContainerRequest;
    use crate::backend::memory::MemoryBackend;
    use crate::exec::ExecOutput;

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(10))
    }

    fn running(backend: &MemoryBackend) -> ContainerId {
        let id = backend
            .create_container("redis:7", &ContainerRequest::default())
            .unwrap();
        backend.start_container(&id).unwrap();
        id
    }

    #[test]
    fn ready_container_needs_one_probe() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        backend.append_log(&id, "Ready to accept connections");
        let cond = WaitCondition::log("Ready to accept", Duration::from_secs(1));
        let report =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn pattern_appearing_later_is_found() {
        let backend = Arc::new(MemoryBackend::new());
        let id = running(&backend);
        let writer = Arc::clone(&backend);
        let target = id.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.append_log(&target, "server listening");
        });
        let cond = WaitCondition::log("listening", Duration::from_secs(5));
        let report =
            wait_for_condition(backend.as_ref(), &id, &cond, &fast(), &CancelToken::new())
                .unwrap();
        assert!(report.attempts > 1);
        handle.join().unwrap();
    }

    #[test]
    fn timeout_reports_pattern_and_log_tail() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        for i in 0..30 {
            backend.append_log(&id, &format!("boot step {i}"));
        }
        let cond = WaitCondition::log("never printed", Duration::from_millis(200));
        let start = Instant::now();
        let err =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        let msg = err.to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("never printed"));
        assert!(msg.contains("boot step 29"));
        assert!(msg.contains("boot step 10"));
        assert!(!msg.contains("boot step 9\n"));
    }

    #[test]
    fn transient_log_read_error_keeps_polling() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        backend.append_log(&id, "ready");
        backend.fail_next_logs("error during connect: daemon busy");
        let cond = WaitCondition::log("ready", Duration::from_secs(1));
        let report =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn exec_condition_waits_for_zero_exit() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        backend.set_exec_handler(move |_, _| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < 3 {
                ExecOutput::failed(1, "no response")
            } else {
                ExecOutput::ok("accepting connections")
            }
        });
        let id = running(&backend);
        let cond = WaitCondition::exec(["pg_isready"], Duration::from_secs(5));
        let report =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(report.attempts, 4);
    }

    #[test]
    fn removed_container_fails_fast() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        backend.remove_container(&id).unwrap();
        let cond = WaitCondition::exec(["true"], Duration::from_secs(30));
        let start = Instant::now();
        let err =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap_err();
        assert!(err.is_not_found());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_stops_polling() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let cond = WaitCondition::log("never", Duration::from_secs(30));
        let start = Instant::now();
        let err = wait_for_condition(&backend, &id, &cond, &fast(), &cancel).unwrap_err();
        assert!(matches!(err, TestpodError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn overall_limit_cuts_condition_short() {
        let backend = MemoryBackend::new();
        let id = running(&backend);
        let settings = fast().not_after(Instant::now() + Duration::from_millis(100));
        let cond = WaitCondition::log("never", Duration::from_secs(30));
        let start = Instant::now();
        let err =
            wait_for_condition(&backend, &id, &cond, &settings, &CancelToken::new()).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn http_probe_runs_inside_unpublished_container() {
        let backend = MemoryBackend::new();
        backend.set_exec_handler(|_, cmd| {
            if cmd.join(" ").contains("localhost:8080/health") {
                ExecOutput::ok("200")
            } else {
                ExecOutput::failed(1, "unexpected")
            }
        });
        let id = running(&backend);
        let cond = WaitCondition::http("health", "8080", 200, Duration::from_secs(1));
        let report =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn hung_exec_is_cut_off_at_the_condition_timeout() {
        let backend = MemoryBackend::new();
        backend.set_exec_handler(|_, _| {
            std::thread::sleep(Duration::from_secs(3));
            ExecOutput::ok("")
        });
        let id = running(&backend);
        let cond = WaitCondition::exec(["pg_isready"], Duration::from_millis(200));
        let start = Instant::now();
        let err =
            wait_for_condition(&backend, &id, &cond, &fast(), &CancelToken::new()).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn hung_exec_is_cut_off_at_the_cancel_deadline() {
        let backend = MemoryBackend::new();
        backend.set_exec_handler(|_, _| {
            std::thread::sleep(Duration::from_secs(3));
            ExecOutput::ok("")
        });
        let id = running(&backend);
        let cond = WaitCondition::exec(["pg_isready"], Duration::from_secs(30));
        let cancel = CancelToken::with_timeout(Duration::from_millis(150));
        let start = Instant::now();
        let err = wait_for_condition(&backend, &id, &cond, &fast(), &cancel).unwrap_err();
        assert!(matches!(err, TestpodError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn check_budget_shrinks_toward_deadline() {
        let mut poller = Poller::new(Duration::from_millis(100), &fast());
        let mut budgets = Vec::new();
        let _ = poller
            .run(&CancelToken::new(), |limit| {
                budgets.push(limit);
                Ok(false)
            })
            .unwrap();
        assert!(budgets[0] <= Duration::from_millis(100));
        assert!(budgets.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn poller_tracks_state() {
        let mut poller = Poller::new(Duration::from_millis(30), &fast());
        assert_eq!(poller.state(), WaitState::Pending);
        let state = poller.run(&CancelToken::new(), |_| Ok(false)).unwrap();
        assert_eq!(state, WaitState::TimedOut);
        assert!(poller.attempts() >= 2);
    }

    #[test]
    fn display_names_the_condition() {
        let cond = WaitCondition::exec(["mysqladmin", "ping"], Duration::from_secs(1));
        assert_eq!(cond.to_string(), "command \"mysqladmin ping\" to succeed");
        let cond = WaitCondition::http("/", "80", 204, Duration::from_secs(1));
        assert_eq!(cond.to_string(), "HTTP 204 from port 80/");
    }
}
