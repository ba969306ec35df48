//! Container log relay.
//!
//! A relay copies a container's stdout and stderr to a [`LogSink`] from two
//! reader threads. A supervisor thread waits for both readers and is the
//! only place that decides the relay is finished, either because both
//! streams ended or because its [`CancelToken`] fired.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::classify::{OutputClass, classify};

/// Destination for relayed log lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Prefix added to lines read from the container's stderr.
pub const STDERR_PREFIX: &str = "[stderr] ";

const SUPERVISOR_TICK: Duration = Duration::from_millis(25);

/// Sink that emits each line as a `tracing` event tagged with `test`.
#[must_use]
pub fn tracing_sink(test: impl Into<String>) -> LogSink {
    let test = test.into();
    Arc::new(move |line: &str| tracing::info!(test = %test, "{line}"))
}

/// Wraps a sink so only lines accepted by `filter` reach it.
#[must_use]
pub fn filtered_sink(sink: LogSink, filter: Arc<dyn Fn(&str) -> bool + Send + Sync>) -> LogSink {
    Arc::new(move |line: &str| {
        if filter(line) {
            sink(line);
        }
    })
}

/// Returns the last `n` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip).collect()
}

/// Formats the tail of `text` for inclusion in an error message.
#[must_use]
pub fn format_tail(text: &str, n: usize) -> String {
    let tail = tail_lines(text, n);
    if tail.is_empty() {
        return "(no container output)".to_string();
    }
    format!(
        "Last {} lines of container output:\n{}",
        tail.len(),
        tail.join("\n")
    )
}

/// Handle to a running relay.
///
/// Dropping the handle cancels the relay and waits for its threads.
#[derive(Debug)]
pub struct LogRelay {
    cancel: CancelToken,
    supervisor: Option<JoinHandle<()>>,
}

impl LogRelay {
    /// Wraps an already spawned supervisor thread.
    #[must_use]
    pub const fn new(cancel: CancelToken, supervisor: JoinHandle<()>) -> Self {
        Self {
            cancel,
            supervisor: Some(supervisor),
        }
    }

    /// Returns whether the relay has stopped on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.supervisor.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the relay and waits until every thread has exited.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::warn!("log relay supervisor panicked");
            }
        }
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Relays two byte streams line by line until both end or `cancel` fires.
///
/// `on_finish` runs on the supervisor thread before the readers are joined;
/// it receives `true` when the relay was cancelled and must then unblock the
/// readers, typically by killing the process that feeds them.
#[must_use]
pub fn relay_streams<O, E, F>(
    stdout: O,
    stderr: E,
    sink: LogSink,
    cancel: CancelToken,
    on_finish: F,
) -> LogRelay
where
    O: Read + Send + 'static,
    E: Read + Send + 'static,
    F: FnOnce(bool) + Send + 'static,
{
    let out_reader = spawn_reader(stdout, "", Arc::clone(&sink), cancel.clone());
    let err_reader = spawn_reader(stderr, STDERR_PREFIX, sink, cancel.clone());

    let token = cancel.clone();
    let supervisor = std::thread::spawn(move || {
        let cancelled = loop {
            if out_reader.is_finished() && err_reader.is_finished() {
                break false;
            }
            if token.sleep(SUPERVISOR_TICK) {
                break true;
            }
        };
        on_finish(cancelled);
        for reader in [out_reader, err_reader] {
            if reader.join().is_err() {
                tracing::warn!("log reader panicked");
            }
        }
    });
    LogRelay::new(cancel, supervisor)
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    prefix: &'static str,
    sink: LogSink,
    cancel: CancelToken,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if cancel.is_cancelled() {
                break;
            }
            if !prefix.is_empty()
                && matches!(
                    classify(&line),
                    OutputClass::NotFound | OutputClass::NotRunning
                )
            {
                tracing::debug!(%line, "container already stopped, ending log relay");
                continue;
            }
            sink(&format!("{prefix}{line}"));
        }
    })
}
