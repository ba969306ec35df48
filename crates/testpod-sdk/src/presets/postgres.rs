//! PostgreSQL.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use testpod_common::error::Result;
use testpod_dsn::postgres as dialect;
use testpod_runtime::coordination::StartupGate;

use crate::builder::run;
use crate::container::Container;
use crate::options::{self, Opt};
use crate::scope::TestScope;

/// Image started by [`start`].
pub const IMAGE: &str = "postgres:15-alpine";

/// Line the server prints once it accepts connections.
pub const READY_LOG: &str = "database system is ready to accept connections";

/// Delay before the next PostgreSQL container may be created.
pub const SETTLE: Duration = Duration::from_millis(500);

/// Gate shared by every PostgreSQL container of the process.
pub fn startup_gate() -> Arc<StartupGate> {
    static GATE: OnceLock<Arc<StartupGate>> = OnceLock::new();
    Arc::clone(GATE.get_or_init(|| Arc::new(StartupGate::new("postgres", SETTLE))))
}

/// Options for a disposable PostgreSQL server trusting local connections.
#[must_use]
pub fn preset() -> Vec<Opt> {
    vec![
        options::env("POSTGRES_USER", dialect::SUPERUSER),
        options::env("POSTGRES_PASSWORD", "test"),
        options::env("POSTGRES_DB", "test"),
        options::env("POSTGRES_HOST_AUTH_METHOD", "trust"),
        options::args(["-c", "max_connections=100"]),
        options::port(dialect::PORT),
        options::wait_for_log(READY_LOG, Duration::from_secs(20)),
        options::wait_for_exec(
            ["pg_isready", "-U", dialect::SUPERUSER, "-d", "test"],
            Duration::from_secs(15),
        ),
        options::dsn(Arc::new(dialect::provider())),
        options::startup_gate(startup_gate()),
    ]
}

/// Starts a PostgreSQL container; `extra` options apply after the preset.
///
/// # Errors
///
/// Returns the creation or readiness error.
pub fn start(scope: &TestScope, extra: impl IntoIterator<Item = Opt>) -> Result<Container> {
    run(scope, IMAGE, preset().into_iter().chain(extra))
}
