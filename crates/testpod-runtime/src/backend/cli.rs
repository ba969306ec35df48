//! Backend that shells out to a Docker-compatible CLI.
//!
//! Works with `docker`, `podman` and `nerdctl`. Inspect output is parsed as
//! JSON; every other status is derived from the command's text output via
//! [`crate::classify`].

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use testpod_common::constants::{LOOPBACK_HOST, STOP_GRACE_SECS};
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::{ContainerId, ContainerState, PortBinding};

use super::{Backend, Capabilities, ContainerInfo, ContainerRequest};
use crate::cancel::CancelToken;
use crate::classify::{OutputClass, classify, command_error};
use crate::discovery::RuntimeCache;
use crate::exec::{ExecOutput, overran};
use crate::logs::{LogRelay, LogSink, relay_streams};

/// Drives containers through a runtime CLI subprocess per operation.
#[derive(Debug, Default)]
pub struct CliBackend {
    runtime: RuntimeCache,
}

impl CliBackend {
    /// Creates a backend that discovers its runtime on first use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runtime: RuntimeCache::new(),
        }
    }

    /// Creates a backend pinned to a specific runtime executable.
    #[must_use]
    pub fn with_runtime(runtime: impl Into<String>) -> Self {
        Self {
            runtime: RuntimeCache::pinned(runtime),
        }
    }

    /// The runtime executable in use.
    pub fn runtime(&self) -> &str {
        self.runtime.get()
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(self.runtime());
        let _ = cmd.args(args.iter().map(AsRef::as_ref));
        cmd
    }

    fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<ExecOutput> {
        let runtime = self.runtime();
        tracing::trace!(
            runtime,
            args = ?args.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
            "running runtime command"
        );
        self.command(args)
            .stdin(Stdio::null())
            .output()
            .map(ExecOutput::from)
            .map_err(|source| TestpodError::Io {
                path: runtime.into(),
                source,
            })
    }

    /// Like [`Self::run`], but kills the runtime client once `limit` has
    /// passed and returns `None`. The process inside the container is left to
    /// the runtime.
    fn run_limited(&self, args: &[String], limit: Duration) -> Result<Option<ExecOutput>> {
        let runtime = self.runtime();
        let io_err = |source| TestpodError::Io {
            path: runtime.into(),
            source,
        };
        tracing::trace!(runtime, ?args, ?limit, "running bounded runtime command");
        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let deadline = Instant::now() + limit;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                break Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(runtime, ?args, ?limit, "runtime command killed after limit");
                break None;
            }
            thread::sleep(CHILD_POLL.min(deadline - now));
        };
        // Readers of a killed client may still be held open by its children.
        let Some(status) = status else {
            return Ok(None);
        };
        Ok(Some(ExecOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            exit_code: status.code().unwrap_or(-1),
        }))
    }

    /// Runs a subcommand against one container, classifying failures.
    fn run_for(&self, subcommand: &str, id: &ContainerId, args: &[String]) -> Result<ExecOutput> {
        let out = self.run(args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(command_error(subcommand, id.as_str(), &out.combined()))
        }
    }
}

const CHILD_POLL: Duration = Duration::from_millis(10);

fn drain<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = reader.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn exec_args(id: &ContainerId, cmd: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), id_arg(id)];
    args.extend(cmd.iter().cloned());
    args
}

/// Turns runtime-level exec failures into errors; the command's own exit
/// status stays in the output.
fn exec_result(id: &ContainerId, out: ExecOutput) -> Result<ExecOutput> {
    if !out.success() && is_runtime_error(&out.stderr) {
        match classify(&out.stderr) {
            OutputClass::NotFound | OutputClass::NotRunning => {
                return Err(command_error("exec", id.as_str(), &out.stderr));
            }
            OutputClass::AlreadyExists | OutputClass::Other => {}
        }
    }
    Ok(out)
}

/// Arguments for `create`, without the runtime executable.
#[must_use]
pub fn create_args(image: &str, request: &ContainerRequest) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    let mut flag = |name: &str, value: &str| {
        args.push(name.to_string());
        args.push(value.to_string());
    };
    if let Some(name) = &request.name {
        flag("--name", name);
    }
    for (key, value) in &request.labels {
        flag("--label", &format!("{key}={value}"));
    }
    for (key, value) in &request.env {
        flag("--env", &format!("{key}={value}"));
    }
    for port in &request.ports {
        if port.contains(':') {
            flag("--publish", port);
        } else {
            flag("--publish", &format!("{LOOPBACK_HOST}::{port}"));
        }
    }
    for mount in &request.mounts {
        flag("--volume", &mount.spec());
    }
    if let Some(network) = &request.network {
        flag("--network", network);
    }
    if let Some(user) = &request.user {
        flag("--user", user);
    }
    if let Some(dir) = &request.working_dir {
        flag("--workdir", dir);
    }
    if let Some(memory) = &request.limits.memory {
        flag("--memory", memory);
    }
    if let Some(cpus) = &request.limits.cpus {
        flag("--cpus", cpus);
    }
    if request.privileged {
        args.push("--privileged".to_string());
    }
    args.push(image.to_string());
    if let Some(command) = &request.command {
        args.extend(command.iter().cloned());
    }
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<InspectPort>>>>,
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPort {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Parses `inspect` JSON output for container `id`.
///
/// # Errors
///
/// Returns `TestpodError::NotFound` for an empty result and
/// `TestpodError::Serialization` for malformed JSON.
pub fn parse_inspect(json: &str, id: &ContainerId) -> Result<ContainerInfo> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| TestpodError::NotFound {
            kind: "container",
            id: id.to_string(),
        })?;

    let network = entry.network_settings;
    let internal_ip = Some(network.ip_address)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            network
                .networks
                .unwrap_or_default()
                .into_values()
                .map(|n| n.ip_address)
                .find(|ip| !ip.is_empty())
        });
    let ports = network
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (port, bindings)
        })
        .collect();
    let state = ContainerState::from_status(&entry.state.status);

    Ok(ContainerInfo {
        id: ContainerId::new(entry.id),
        name: entry.name.trim_start_matches('/').to_string(),
        image: entry.config.image,
        created: DateTime::parse_from_rfc3339(&entry.created)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        exit_code: (state == ContainerState::Stopped).then_some(entry.state.exit_code),
        state,
        internal_ip,
        ports,
        labels: entry.config.labels.unwrap_or_default(),
    })
}

fn id_arg(id: &ContainerId) -> String {
    id.as_str().to_string()
}

impl Backend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn create_container(&self, image: &str, request: &ContainerRequest) -> Result<ContainerId> {
        let out = self.run(&create_args(image, request))?;
        if !out.success() {
            return Err(TestpodError::Create {
                image: image.to_string(),
                message: out.combined().trim().to_string(),
            });
        }
        let last_line = out.stdout.lines().rev().find(|l| !l.trim().is_empty());
        ContainerId::parse(last_line.unwrap_or_default()).map_err(|_| TestpodError::Create {
            image: image.to_string(),
            message: "runtime printed no container id".into(),
        })
    }

    fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.run_for("start", id, &["start".into(), id_arg(id)])
            .map(|_| ())
    }

    fn stop_container(&self, id: &ContainerId) -> Result<()> {
        let stop = self.run_for(
            "stop",
            id,
            &[
                "stop".into(),
                "--time".into(),
                STOP_GRACE_SECS.to_string(),
                id_arg(id),
            ],
        );
        match stop {
            Ok(_) | Err(TestpodError::NotRunning { .. }) => Ok(()),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                tracing::debug!(id = %id.short(), error = %e, "graceful stop failed, killing");
                match self.run_for("kill", id, &["kill".into(), id_arg(id)]) {
                    Ok(_) | Err(TestpodError::NotRunning { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn remove_container(&self, id: &ContainerId) -> Result<()> {
        match self.stop_container(id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => tracing::warn!(id = %id.short(), error = %e, "stop before removal failed"),
        }
        match self.run_for("rm", id, &["rm".into(), "--force".into(), "--volumes".into(), id_arg(id)]) {
            Ok(_) => Ok(()),
            // Removal already in progress elsewhere; the container is on its way out.
            Err(TestpodError::NotRunning { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let out = self.run_for("inspect", id, &["inspect".into(), id_arg(id)])?;
        parse_inspect(&out.stdout, id)
    }

    fn exec_in_container(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput> {
        let out = self.run(&exec_args(id, cmd))?;
        exec_result(id, out)
    }

    fn exec_with_limit(&self, id: &ContainerId, cmd: &[String], limit: Duration) -> Result<ExecOutput> {
        let out = self
            .run_limited(&exec_args(id, cmd), limit)?
            .ok_or_else(|| overran(cmd, limit))?;
        exec_result(id, out)
    }

    fn container_logs(&self, id: &ContainerId) -> Result<String> {
        let out = self.run_for("logs", id, &["logs".into(), id_arg(id)])?;
        Ok(out.combined())
    }

    fn commit(&self, id: &ContainerId, image_name: &str) -> Result<()> {
        self.run_for("commit", id, &["commit".into(), id_arg(id), image_name.to_string()])
            .map(|_| ())
    }

    fn copy_archive(&self, id: &ContainerId, dest: &str, archive: &[u8]) -> Result<()> {
        let runtime = self.runtime();
        let io_err = |source| TestpodError::Io {
            path: runtime.into(),
            source,
        };
        let target = format!("{id}:{dest}");
        let mut child = self
            .command(&["cp", "-", target.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(archive).map_err(io_err)?;
        }
        let out = ExecOutput::from(child.wait_with_output().map_err(io_err)?);
        if out.success() {
            Ok(())
        } else {
            Err(command_error("cp", id.as_str(), &out.combined()))
        }
    }

    fn follow_logs(&self, id: &ContainerId, sink: LogSink, cancel: CancelToken) -> Result<LogRelay> {
        let mut child = self
            .command(&["logs", "--follow", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TestpodError::Io {
                path: self.runtime().into(),
                source,
            })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TestpodError::Command {
                command: "logs --follow".into(),
                message: "output streams unavailable".into(),
            });
        };
        tracing::debug!(id = %id.short(), "following container logs");
        Ok(relay_streams(stdout, stderr, sink, cancel, move |cancelled| {
            if cancelled {
                let _ = child.kill();
            }
            let _ = child.wait();
        }))
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerId>> {
        let filter = format!("label={label}");
        let out = self.run(&[
            "ps",
            "--all",
            "--quiet",
            "--no-trunc",
            "--filter",
            filter.as_str(),
        ])?;
        if !out.success() {
            return Err(TestpodError::Command {
                command: "ps".into(),
                message: out.combined().trim().to_string(),
            });
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ContainerId::new)
            .collect())
    }
}

/// Returns whether stderr came from the runtime itself rather than from the
/// command running inside the container.
fn is_runtime_error(stderr: &str) -> bool {
    let lower = stderr.trim_start().to_ascii_lowercase();
    lower.starts_with("error response from daemon")
        || lower.starts_with("error: ")
        || lower.contains("level=fatal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BindMount;

    fn sample_request() -> ContainerRequest {
        let mut req = ContainerRequest {
            name: Some("testpod-db-1a2b3c4d".into()),
            ports: vec!["5432".into(), "8080:80".into()],
            mounts: vec![BindMount {
                host: "/tmp/data".into(),
                container: "/data".into(),
                read_only: true,
            }],
            command: Some(vec!["postgres".into(), "-c".into(), "fsync=off".into()]),
            network: Some("testnet".into()),
            user: Some("1000".into()),
            working_dir: Some("/work".into()),
            privileged: true,
            ..ContainerRequest::default()
        };
        let _ = req.env.insert("POSTGRES_PASSWORD".into(), "test".into());
        let _ = req.labels.insert("testpod".into(), "true".into());
        req.limits.memory = Some("512m".into());
        req
    }

    fn window<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn create_args_cover_request() {
        let args = create_args("postgres:15-alpine", &sample_request());
        assert_eq!(args[0], "create");
        assert_eq!(window(&args, "--name"), vec!["testpod-db-1a2b3c4d"]);
        assert_eq!(window(&args, "--env"), vec!["POSTGRES_PASSWORD=test"]);
        assert_eq!(window(&args, "--label"), vec!["testpod=true"]);
        assert_eq!(
            window(&args, "--publish"),
            vec!["127.0.0.1::5432", "8080:80"]
        );
        assert_eq!(window(&args, "--volume"), vec!["/tmp/data:/data:ro"]);
        assert_eq!(window(&args, "--network"), vec!["testnet"]);
        assert_eq!(window(&args, "--user"), vec!["1000"]);
        assert_eq!(window(&args, "--workdir"), vec!["/work"]);
        assert_eq!(window(&args, "--memory"), vec!["512m"]);
        assert!(args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn image_precedes_command() {
        let args = create_args("postgres:15-alpine", &sample_request());
        let image_at = args.iter().position(|a| a == "postgres:15-alpine").unwrap();
        assert_eq!(&args[image_at + 1..], ["postgres", "-c", "fsync=off"]);
    }

    #[test]
    fn minimal_request_is_create_and_image() {
        let args = create_args("redis:7", &ContainerRequest::default());
        assert_eq!(args, vec!["create", "redis:7"]);
    }

    const INSPECT: &str = r#"[{
        "Id": "4f1c2a9b8e7d6c5b4a39281706f5e4d3c2b1a09f8e7d6c5b4a3928170615",
        "Created": "2025-03-01T10:15:30.123456789Z",
        "Name": "/testpod-db-1a2b3c4d",
        "State": {"Status": "running", "Running": true, "ExitCode": 0},
        "Config": {"Image": "postgres:15-alpine", "Labels": {"testpod": "true"}},
        "NetworkSettings": {
            "IPAddress": "",
            "Ports": {
                "5432/tcp": [
                    {"HostIp": "127.0.0.1", "HostPort": "49160"}
                ],
                "9000/tcp": null
            },
            "Networks": {"bridge": {"IPAddress": "172.17.0.5"}}
        }
    }]"#;

    #[test]
    fn parse_inspect_reads_fields() {
        let id = ContainerId::new("4f1c2a9b8e7d");
        let info = parse_inspect(INSPECT, &id).unwrap();
        assert_eq!(info.name, "testpod-db-1a2b3c4d");
        assert_eq!(info.image, "postgres:15-alpine");
        assert!(info.is_running());
        assert_eq!(info.exit_code, None);
        assert_eq!(info.internal_ip.as_deref(), Some("172.17.0.5"));
        assert_eq!(info.host_binding("5432").unwrap().host_port, "49160");
        assert!(info.host_binding("9000").is_none());
        assert_eq!(info.labels.get("testpod").map(String::as_str), Some("true"));
        assert!(info.created.is_some());
    }

    #[test]
    fn parse_inspect_empty_array_is_not_found() {
        let err = parse_inspect("[]", &ContainerId::new("abc")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn parse_inspect_stopped_container_has_exit_code() {
        let json = r#"[{"Id": "abc", "State": {"Status": "exited", "ExitCode": 3}}]"#;
        let info = parse_inspect(json, &ContainerId::new("abc")).unwrap();
        assert_eq!(info.state, ContainerState::Stopped);
        assert_eq!(info.exit_code, Some(3));
        assert!(info.internal_ip.is_none());
    }

    #[test]
    fn runtime_errors_are_told_apart_from_command_output() {
        assert!(is_runtime_error(
            "Error response from daemon: container abc is not running"
        ));
        assert!(is_runtime_error("Error: no container with name or ID \"abc\" found"));
        assert!(!is_runtime_error("psql: error: connection refused, server is not running"));
    }

    #[test]
    #[ignore = "requires a container runtime"]
    fn missing_container_is_classified() {
        let backend = CliBackend::new();
        let id = ContainerId::new("testpod-does-not-exist");
        assert!(backend.inspect_container(&id).unwrap_err().is_not_found());
        assert!(backend.remove_container(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn bounded_run_kills_a_hung_client() {
        let backend = CliBackend::with_runtime("sh");
        let start = Instant::now();
        let out = backend
            .run_limited(&["-c".into(), "exec sleep 5".into()], Duration::from_millis(200))
            .unwrap();
        assert!(out.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn bounded_run_returns_output_in_time() {
        let backend = CliBackend::with_runtime("sh");
        let out = backend
            .run_limited(
                &["-c".into(), "echo ready; echo warn >&2; exit 2".into()],
                Duration::from_secs(5),
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.stdout, "ready\n");
        assert_eq!(out.stderr, "warn\n");
        assert_eq!(out.exit_code, 2);
    }
}
