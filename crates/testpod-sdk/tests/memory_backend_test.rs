//! SDK behaviour against the in-memory backend.
//!
//! Covers the test-facing contract end to end: option application, labels,
//! readiness, DSN provisioning, startup gating and scope cleanup.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use testpod_common::config::TestpodConfig;
use testpod_common::error::TestpodError;
use testpod_runtime::backend::memory::MemoryBackend;
use testpod_runtime::backend::registry::Registry;
use testpod_runtime::backend::{Backend, Capabilities};
use testpod_runtime::coordination::StartupGate;
use testpod_runtime::engine::TeardownOutcome;
use testpod_runtime::exec::ExecOutput;
use testpod_sdk::options::{self, Opt};
use testpod_sdk::presets::postgres;
use testpod_sdk::{ContainerBuilder, TestScope};

const FAST: Duration = Duration::from_millis(5);

fn memory() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new().with_boot_logs(["booting", "service ready"]))
}

fn scope(name: &str, backend: &Arc<MemoryBackend>) -> TestScope {
    let shared: Arc<dyn Backend> = Arc::clone(backend) as Arc<dyn Backend>;
    TestScope::new(name).with_backend(shared)
}

fn fast() -> Opt {
    options::poll_interval(FAST)
}

#[test]
fn container_is_removed_when_scope_ends() {
    let backend = memory();
    {
        let scope = scope("removed_at_end", &backend);
        let c = ContainerBuilder::new("redis:7")
            .port("6379")
            .with(fast())
            .start(&scope)
            .unwrap();
        assert!(c.is_running().unwrap());
        assert_eq!(backend.container_ids().len(), 1);
    }
    assert!(backend.container_ids().is_empty());
}

#[test]
fn containers_carry_identity_labels_and_unique_names() {
    let backend = memory();
    let scope = scope("labels::works", &backend);
    let a = ContainerBuilder::new("redis:7").with(fast()).start(&scope).unwrap();
    let b = ContainerBuilder::new("redis:7").with(fast()).start(&scope).unwrap();
    assert_ne!(a.name(), b.name());
    assert!(a.name().starts_with("testpod-labels--works-"));

    let labels = backend.request(a.id()).unwrap().labels;
    assert_eq!(labels["testpod"], "true");
    assert_eq!(labels["testpod.test"], "labels--works");
    assert_eq!(labels["testpod.image"], "redis-7");
    assert!(labels.contains_key("testpod.timestamp"));
}

#[test]
fn endpoint_resolves_published_port() {
    let backend = memory();
    let scope = scope("endpoint", &backend);
    let c = ContainerBuilder::new("nginx:alpine")
        .port("80")
        .with(fast())
        .start(&scope)
        .unwrap();
    let port = c.port("80").unwrap();
    assert_eq!(c.host().unwrap(), "127.0.0.1");
    assert_eq!(c.endpoint("80").unwrap(), format!("127.0.0.1:{port}"));
    assert!(c.port("443").unwrap_err().is_not_found());
    assert!(c.internal_ip().unwrap().starts_with("172.17.0."));
}

#[test]
fn unsupported_options_are_ignored() {
    let backend = Arc::new(MemoryBackend::new().with_capabilities(Capabilities {
        mounts: false,
        privileged: false,
        ..Capabilities::all()
    }));
    let scope = scope("unsupported", &backend);
    let c = ContainerBuilder::new("alpine:3.19")
        .with(options::bind_mount("/tmp", "/data"))
        .with(options::privileged())
        .env("MODE", "test")
        .start(&scope)
        .unwrap();
    let request = backend.request(c.id()).unwrap();
    assert!(request.mounts.is_empty());
    assert!(!request.privileged);
    assert_eq!(request.env["MODE"], "test");
}

#[test]
fn lightweight_image_gets_keep_alive_command() {
    let backend = memory();
    let scope = scope("keep_alive", &backend);
    let c = ContainerBuilder::new("alpine:3.19").start(&scope).unwrap();
    let command = backend.request(c.id()).unwrap().command.unwrap();
    assert_eq!(command[0], "sh");
}

#[test]
fn injected_files_land_before_start() {
    let backend = memory();
    let scope = scope("files", &backend);
    let c = ContainerBuilder::new("alpine:3.19")
        .with(options::file_content("listen 80;\n", "/etc/app/app.conf", 0o644))
        .start(&scope)
        .unwrap();
    assert_eq!(
        backend.file(c.id(), "/etc/app/app.conf").unwrap(),
        b"listen 80;\n".to_vec()
    );
}

#[test]
fn never_printed_pattern_reports_timeout_with_tail() {
    let backend = memory();
    let scope = scope("timeout", &backend);
    let start = Instant::now();
    let err = ContainerBuilder::new("redis:7")
        .with(fast())
        .with(options::wait_for_log("never printed", Duration::from_millis(200)))
        .start(&scope)
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(2));
    let message = err.to_string();
    assert!(err.is_timeout());
    assert!(message.contains("timeout"));
    assert!(message.contains("never printed"));
    assert!(message.contains("service ready"));

    assert_eq!(backend.container_ids().len(), 1);
    scope.cleanup();
    assert!(backend.container_ids().is_empty());
}

#[test]
fn test_deadline_cancels_readiness_wait() {
    let backend = memory();
    let shared: Arc<dyn Backend> = Arc::clone(&backend) as Arc<dyn Backend>;
    let scope = TestScope::new("deadline")
        .with_timeout(Duration::from_millis(150))
        .with_backend(shared);
    let start = Instant::now();
    let err = ContainerBuilder::new("redis:7")
        .with(fast())
        .with(options::wait_for_log("never printed", Duration::from_secs(30)))
        .start(&scope)
        .unwrap_err();
    assert!(matches!(err, TestpodError::Cancelled { .. }));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn creation_failure_is_surfaced_and_registers_nothing() {
    let backend = memory();
    backend.fail_next_create("pull access denied for nosuchimage");
    let scope = scope("create_fails", &backend);
    let err = ContainerBuilder::new("nosuchimage").start(&scope).unwrap_err();
    assert!(matches!(err, TestpodError::Create { .. }));
    assert_eq!(scope.pending(), 0);
}

#[test]
fn remove_is_idempotent() {
    let backend = memory();
    let scope = scope("remove_twice", &backend);
    let c = ContainerBuilder::new("redis:7").with(fast()).start(&scope).unwrap();
    assert_eq!(c.remove(), TeardownOutcome::Removed);
    assert_eq!(c.remove(), TeardownOutcome::AlreadyGone);
    scope.cleanup();
    assert!(backend.container_ids().is_empty());
}

#[test]
fn postgres_preset_provisions_test_database() {
    let backend = Arc::new(MemoryBackend::new().with_boot_logs([postgres::READY_LOG]));
    let scope = scope("orders::insert", &backend);
    let pg = postgres::start(&scope, [fast()]).unwrap();

    let dsn = pg.dsn().unwrap();
    let port = pg.port("5432").unwrap();
    assert_eq!(
        dsn,
        format!("postgresql://postgres@127.0.0.1:{port}/orders__insert?sslmode=disable")
    );
    assert_eq!(pg.dsn().unwrap(), dsn);
    assert_eq!(pg.format_dsn("orders__insert").unwrap(), dsn);

    let creates = backend
        .exec_history(pg.id())
        .into_iter()
        .filter(|cmd| cmd[0] == "createdb")
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn shared_container_drops_database_with_each_test() {
    let backend = Arc::new(MemoryBackend::new().with_boot_logs([postgres::READY_LOG]));
    let suite = scope("suite", &backend);
    let pg = postgres::start(&suite, [fast()]).unwrap();

    {
        let test = TestScope::new("first_case");
        let dsn = pg.create_database(&test, "").unwrap();
        assert!(dsn.contains("/first_case?"));
    }
    let history = backend.exec_history(pg.id());
    let last = history.last().unwrap();
    assert_eq!(last[0], "dropdb");
    assert_eq!(last.last().unwrap(), "first_case");
    assert!(pg.is_running().unwrap());
}

#[test]
fn existing_database_from_earlier_run_is_reused() {
    let backend = Arc::new(MemoryBackend::new().with_boot_logs([postgres::READY_LOG]));
    backend.set_exec_handler(|_, cmd| {
        if cmd[0] == "createdb" {
            ExecOutput::failed(1, "createdb: error: database \"testdb\" already exists")
        } else {
            ExecOutput::ok("")
        }
    });
    let scope = scope("residue", &backend);
    let pg = postgres::start(&scope, [fast()]).unwrap();
    let dsn = pg.create_database(&scope, "testdb").unwrap();
    assert!(dsn.ends_with("/testdb?sslmode=disable"));
}

#[test]
fn dsn_without_provider_is_a_config_error() {
    let backend = memory();
    let scope = scope("no_dsn", &backend);
    let c = ContainerBuilder::new("redis:7").with(fast()).start(&scope).unwrap();
    assert!(matches!(c.dsn().unwrap_err(), TestpodError::Config { .. }));
}

#[test]
fn startup_gate_spaces_out_creations() {
    const SETTLE: Duration = Duration::from_millis(200);
    let backend = memory();
    let gate = Arc::new(StartupGate::new("fragile", SETTLE));
    let scope = Arc::new(scope("gated", &backend));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let scope = Arc::clone(&scope);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                ContainerBuilder::new("redis:7")
                    .with(fast())
                    .with(options::startup_gate(gate))
                    .start(&scope)
                    .unwrap()
            })
        })
        .collect();
    let mut created: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().info().unwrap().created.unwrap())
        .collect();
    created.sort();
    let gap = (created[1] - created[0]).to_std().unwrap();
    assert!(gap >= SETTLE, "second creation started after {gap:?}");
}

#[test]
fn streamed_logs_respect_filter() {
    let backend = Arc::new(MemoryBackend::new().with_boot_logs(["keep: one", "noise", "keep: two"]));
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let shared: Arc<dyn Backend> = Arc::clone(&backend) as Arc<dyn Backend>;
    let scope = TestScope::new("streamed")
        .with_backend(shared)
        .with_sink(Arc::new(move |line: &str| {
            sink_lines.lock().unwrap().push(line.to_string());
        }));
    let _c = ContainerBuilder::new("redis:7")
        .with(fast())
        .with(options::stream_logs(true))
        .with(options::log_filter(|line| line.starts_with("keep")))
        .start(&scope)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while lines.lock().unwrap().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    scope.cleanup();
    assert_eq!(*lines.lock().unwrap(), vec!["keep: one", "keep: two"]);
}

#[test]
fn hung_readiness_command_is_bounded_by_test_deadline() {
    let backend = memory();
    backend.set_exec_handler(|_, _| {
        thread::sleep(Duration::from_secs(3));
        ExecOutput::ok("")
    });
    let shared: Arc<dyn Backend> = Arc::clone(&backend) as Arc<dyn Backend>;
    let scope = TestScope::new("hung_readiness")
        .with_timeout(Duration::from_millis(300))
        .with_backend(shared);
    let start = Instant::now();
    let err = ContainerBuilder::new("postgres:15-alpine")
        .with(fast())
        .with(options::wait_for_exec(["pg_isready"], Duration::from_millis(200)))
        .start(&scope)
        .unwrap_err();
    assert!(err.is_timeout() || matches!(err, TestpodError::Cancelled { .. }));
    assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
}

#[test]
fn format_dsn_matches_database_created_under_raw_name() {
    let backend = Arc::new(MemoryBackend::new().with_boot_logs([postgres::READY_LOG]));
    let scope = scope("raw_names", &backend);
    let pg = postgres::start(&scope, [fast()]).unwrap();
    let created = pg.create_database(&scope, "Orders-DB").unwrap();
    assert!(created.contains("/orders_db?"));
    assert_eq!(pg.format_dsn("Orders-DB").unwrap(), created);
}

#[test]
fn backend_is_selected_by_name_from_scope_registry() {
    let backend = memory();
    let registry = Registry::builder()
        .register("fake", Arc::clone(&backend) as Arc<dyn Backend>)
        .build();
    let scope = TestScope::new("by_name").with_registry(registry);
    let c = ContainerBuilder::new("redis:7")
        .with(fast())
        .with(options::backend("fake"))
        .start(&scope)
        .unwrap();
    assert_eq!(backend.container_ids(), vec![c.id().clone()]);
    scope.cleanup();
    assert!(backend.container_ids().is_empty());
}

#[test]
fn default_registry_offers_memory_backend() {
    let scope = TestScope::new("memory_by_option");
    let c = ContainerBuilder::new("redis:7")
        .with(fast())
        .with(options::backend("memory"))
        .start(&scope)
        .unwrap();
    assert!(c.is_running().unwrap());

    let config = TestpodConfig {
        backend: "memory".into(),
        ..TestpodConfig::default()
    };
    let scope = TestScope::new("memory_by_config").with_config(config);
    let c = ContainerBuilder::new("redis:7").with(fast()).start(&scope).unwrap();
    assert!(c.is_running().unwrap());
}

#[test]
fn unknown_backend_name_is_not_found() {
    let scope = TestScope::new("unknown_backend");
    let err = ContainerBuilder::new("redis:7")
        .with(options::backend("kubernetes"))
        .start(&scope)
        .unwrap_err();
    assert!(err.is_not_found());
}

