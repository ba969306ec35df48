//! In-memory backend.
//!
//! Implements the full backend contract against a process-local table so
//! engine, wait, provisioning and SDK code can be exercised without a
//! container runtime. Exec results are produced by a scriptable handler.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use testpod_common::constants::LOOPBACK_HOST;
use testpod_common::error::{Result, TestpodError};
use testpod_common::types::{ContainerId, ContainerState, PortBinding, port_key};

use super::{Backend, Capabilities, ContainerInfo, ContainerRequest};
use crate::cancel::CancelToken;
use crate::exec::{ExecOutput, overran};
use crate::logs::{LogRelay, LogSink};

/// Computes the result of an exec call.
pub type ExecHandler = Arc<dyn Fn(&ContainerId, &[String]) -> ExecOutput + Send + Sync>;

const FIRST_HOST_PORT: u16 = 49_152;
const FOLLOW_TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct Record {
    image: String,
    request: ContainerRequest,
    info: ContainerInfo,
    logs: Vec<String>,
    execs: Vec<Vec<String>>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Table {
    containers: HashMap<ContainerId, Record>,
    next_port: u16,
    next_ip: u8,
    committed: Vec<(ContainerId, String)>,
    create_failure: Option<String>,
    logs_failure: Option<String>,
}

/// Backend whose containers live in a process-local table.
pub struct MemoryBackend {
    table: Arc<Mutex<Table>>,
    exec_handler: RwLock<Option<ExecHandler>>,
    boot_logs: Vec<String>,
    capabilities: Capabilities,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend supporting every option family.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_port: FIRST_HOST_PORT,
                next_ip: 2,
                ..Table::default()
            })),
            exec_handler: RwLock::new(None),
            boot_logs: Vec::new(),
            capabilities: Capabilities::all(),
        }
    }

    /// Lines every container prints when it starts.
    #[must_use]
    pub fn with_boot_logs<S: Into<String>>(mut self, lines: impl IntoIterator<Item = S>) -> Self {
        self.boot_logs = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the option families this backend reports.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Replaces the exec handler. Without one every command succeeds silently.
    pub fn set_exec_handler(
        &self,
        handler: impl Fn(&ContainerId, &[String]) -> ExecOutput + Send + Sync + 'static,
    ) {
        let mut slot = self
            .exec_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(handler));
    }

    /// Makes the next create call fail with `message`.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.lock().create_failure = Some(message.into());
    }

    /// Makes the next log read fail with `message`, as a flaky daemon would.
    pub fn fail_next_logs(&self, message: impl Into<String>) {
        self.lock().logs_failure = Some(message.into());
    }

    /// Appends a line to a container's output.
    pub fn append_log(&self, id: &ContainerId, line: &str) {
        if let Some(record) = self.lock().containers.get_mut(id) {
            record.logs.push(line.to_string());
        }
    }

    /// Overrides a container's creation time.
    pub fn set_created(&self, id: &ContainerId, created: DateTime<Utc>) {
        if let Some(record) = self.lock().containers.get_mut(id) {
            record.info.created = Some(created);
        }
    }

    /// Marks a container as exited, as if its main process had stopped.
    pub fn exit(&self, id: &ContainerId, code: i32) {
        if let Some(record) = self.lock().containers.get_mut(id) {
            record.info.state = ContainerState::Stopped;
            record.info.exit_code = Some(code);
        }
    }

    /// Returns the request a container was created with.
    #[must_use]
    pub fn request(&self, id: &ContainerId) -> Option<ContainerRequest> {
        self.lock().containers.get(id).map(|r| r.request.clone())
    }

    /// Returns the image a container was created from.
    #[must_use]
    pub fn image(&self, id: &ContainerId) -> Option<String> {
        self.lock().containers.get(id).map(|r| r.image.clone())
    }

    /// Commands executed in a container, in order.
    #[must_use]
    pub fn exec_history(&self, id: &ContainerId) -> Vec<Vec<String>> {
        self.lock()
            .containers
            .get(id)
            .map(|r| r.execs.clone())
            .unwrap_or_default()
    }

    /// Content of a file copied into a container.
    #[must_use]
    pub fn file(&self, id: &ContainerId, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .containers
            .get(id)
            .and_then(|r| r.files.get(path).cloned())
    }

    /// Images committed so far, with the container they came from.
    #[must_use]
    pub fn committed(&self) -> Vec<(ContainerId, String)> {
        self.lock().committed.clone()
    }

    /// Identifiers of every container currently in the table.
    #[must_use]
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records an exec and returns the handler that computes its result.
    fn begin_exec(&self, id: &ContainerId, cmd: &[String]) -> Result<Option<ExecHandler>> {
        {
            let mut table = self.lock();
            let record = table.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
            if record.info.state != ContainerState::Running {
                return Err(TestpodError::NotRunning { id: id.to_string() });
            }
            record.execs.push(cmd.to_vec());
        }
        Ok(self
            .exec_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn missing(id: &ContainerId) -> TestpodError {
        TestpodError::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_container(&self, image: &str, request: &ContainerRequest) -> Result<ContainerId> {
        let mut table = self.lock();
        if let Some(message) = table.create_failure.take() {
            return Err(TestpodError::Create {
                image: image.to_string(),
                message,
            });
        }
        let id = ContainerId::generate();
        let mut ports = BTreeMap::new();
        for port in request.container_ports() {
            let host_port = table.next_port;
            table.next_port = table.next_port.wrapping_add(1).max(FIRST_HOST_PORT);
            let _ = ports.insert(
                port_key(&port),
                vec![PortBinding {
                    host_ip: LOOPBACK_HOST.to_string(),
                    host_port: host_port.to_string(),
                }],
            );
        }
        let internal_ip = format!("172.17.0.{}", table.next_ip);
        table.next_ip = table.next_ip.wrapping_add(1).max(2);

        let info = ContainerInfo {
            id: id.clone(),
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("memory-{}", id.short())),
            image: image.to_string(),
            created: Some(Utc::now()),
            state: ContainerState::Created,
            exit_code: None,
            internal_ip: Some(internal_ip),
            ports,
            labels: request.labels.clone(),
        };
        let _ = table.containers.insert(
            id.clone(),
            Record {
                image: image.to_string(),
                request: request.clone(),
                info,
                logs: Vec::new(),
                execs: Vec::new(),
                files: BTreeMap::new(),
            },
        );
        drop(table);
        tracing::debug!(id = %id.short(), image, "memory container created");
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<()> {
        let mut table = self.lock();
        let record = table.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        record.info.state = ContainerState::Running;
        record.info.exit_code = None;
        record.logs.extend(self.boot_logs.iter().cloned());
        Ok(())
    }

    fn stop_container(&self, id: &ContainerId) -> Result<()> {
        let mut table = self.lock();
        let record = table.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        if record.info.state == ContainerState::Running {
            record.info.state = ContainerState::Stopped;
            record.info.exit_code = Some(137);
        }
        Ok(())
    }

    fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.lock()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(id))
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        self.lock()
            .containers
            .get(id)
            .map(|r| r.info.clone())
            .ok_or_else(|| Self::missing(id))
    }

    fn exec_in_container(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput> {
        let handler = self.begin_exec(id, cmd)?;
        Ok(handler.map_or_else(ExecOutput::default, |h| h(id, cmd)))
    }

    fn exec_with_limit(&self, id: &ContainerId, cmd: &[String], limit: Duration) -> Result<ExecOutput> {
        let Some(handler) = self.begin_exec(id, cmd)? else {
            return Ok(ExecOutput::default());
        };
        let (tx, rx) = mpsc::channel();
        let (owned_id, owned_cmd) = (id.clone(), cmd.to_vec());
        let _ = thread::spawn(move || {
            let _ = tx.send(handler(&owned_id, &owned_cmd));
        });
        rx.recv_timeout(limit).map_err(|_| overran(cmd, limit))
    }

    fn container_logs(&self, id: &ContainerId) -> Result<String> {
        let mut table = self.lock();
        if let Some(message) = table.logs_failure.take() {
            return Err(TestpodError::Command {
                command: "logs".into(),
                message,
            });
        }
        let record = table.containers.get(id).ok_or_else(|| Self::missing(id))?;
        let mut text = record.logs.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        Ok(text)
    }

    fn commit(&self, id: &ContainerId, image_name: &str) -> Result<()> {
        let mut table = self.lock();
        if !table.containers.contains_key(id) {
            return Err(Self::missing(id));
        }
        table.committed.push((id.clone(), image_name.to_string()));
        Ok(())
    }

    fn copy_archive(&self, id: &ContainerId, dest: &str, archive: &[u8]) -> Result<()> {
        let mut entries = BTreeMap::new();
        let mut reader = tar::Archive::new(archive);
        let io_err = |source| TestpodError::Io {
            path: dest.into(),
            source,
        };
        for entry in reader.entries().map_err(io_err)? {
            let mut entry = entry.map_err(io_err)?;
            let path = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
            let mut data = Vec::new();
            let _ = entry.read_to_end(&mut data).map_err(io_err)?;
            let full = format!("{}/{}", dest.trim_end_matches('/'), path.trim_start_matches("./"));
            let _ = entries.insert(full, data);
        }
        let mut table = self.lock();
        let record = table.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        record.files.extend(entries);
        Ok(())
    }

    fn follow_logs(&self, id: &ContainerId, sink: LogSink, cancel: CancelToken) -> Result<LogRelay> {
        if !self.lock().containers.contains_key(id) {
            return Err(Self::missing(id));
        }
        let table = Arc::clone(&self.table);
        let id = id.clone();
        let token = cancel.clone();
        let supervisor = std::thread::spawn(move || {
            let mut seen = 0;
            loop {
                let fresh: Vec<String> = {
                    let table = table.lock().unwrap_or_else(PoisonError::into_inner);
                    let Some(record) = table.containers.get(&id) else {
                        break;
                    };
                    record.logs.iter().skip(seen).cloned().collect()
                };
                seen += fresh.len();
                for line in &fresh {
                    sink(line);
                }
                if token.sleep(FOLLOW_TICK) {
                    break;
                }
            }
        });
        Ok(LogRelay::new(cancel, supervisor))
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerId>> {
        let (key, value) = match label.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (label, None),
        };
        let mut ids: Vec<ContainerId> = self
            .lock()
            .containers
            .values()
            .filter(|r| match (r.info.labels.get(key), value) {
                (Some(actual), Some(wanted)) => actual == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|r| r.info.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
