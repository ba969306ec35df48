//! MySQL.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use testpod_common::error::Result;
use testpod_dsn::mysql as dialect;
use testpod_runtime::coordination::StartupGate;

use crate::builder::run;
use crate::container::Container;
use crate::options::{self, Opt};
use crate::scope::TestScope;

/// Image started by [`start`].
pub const IMAGE: &str = "mysql:8.0";

/// Line the server prints once it accepts connections.
pub const READY_LOG: &str = "ready for connections. Version";

/// Delay before the next MySQL container may be created. First boot of
/// MySQL is heavier than PostgreSQL's.
pub const SETTLE: Duration = Duration::from_secs(1);

/// Gate shared by every MySQL container of the process.
pub fn startup_gate() -> Arc<StartupGate> {
    static GATE: OnceLock<Arc<StartupGate>> = OnceLock::new();
    Arc::clone(GATE.get_or_init(|| Arc::new(StartupGate::new("mysql", SETTLE))))
}

/// Options for a disposable MySQL server tuned for tests.
#[must_use]
pub fn preset() -> Vec<Opt> {
    let password = format!("-p{}", dialect::ROOT_PASSWORD);
    vec![
        options::env("MYSQL_ROOT_PASSWORD", dialect::ROOT_PASSWORD),
        options::env("MYSQL_DATABASE", "test"),
        options::env("MYSQL_ROOT_HOST", "%"),
        options::memory("512m"),
        options::args([
            "--character-set-server=utf8mb4",
            "--log-error-verbosity=1",
            "--max-connections=200",
            "--innodb-buffer-pool-size=128M",
            "--innodb-flush-log-at-trx-commit=2",
        ]),
        options::port(dialect::PORT),
        options::wait_for_log(READY_LOG, Duration::from_secs(45)),
        options::wait_for_exec(
            ["mysqladmin".to_string(), "-uroot".to_string(), password, "ping".to_string()],
            Duration::from_secs(15),
        ),
        options::dsn(Arc::new(dialect::provider())),
        options::startup_gate(startup_gate()),
    ]
}

/// Starts a MySQL container; `extra` options apply after the preset.
///
/// # Errors
///
/// Returns the creation or readiness error.
pub fn start(scope: &TestScope, extra: impl IntoIterator<Item = Opt>) -> Result<Container> {
    run(scope, IMAGE, preset().into_iter().chain(extra))
}
