//! MySQL dialect.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::coordinator::{ProvisioningCoordinator, RetryPolicy};
use crate::sql::{Dialect, SqlProvider};

/// Root password set by the mysql preset.
pub const ROOT_PASSWORD: &str = "test";

/// Port the server listens on.
pub const PORT: &str = "3306";

/// MySQL keeps initializing well after it first logs readiness, so it gets
/// more attempts than PostgreSQL.
pub const RETRY: RetryPolicy = RetryPolicy::linear(10, Duration::from_millis(200));

/// MySQL client commands and DSN format.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl MySql {
    fn client(statement: &str, database: Option<&str>) -> Vec<String> {
        let mut cmd = vec![
            "mysql".to_string(),
            "-uroot".to_string(),
            format!("-p{ROOT_PASSWORD}"),
        ];
        if let Some(db) = database {
            cmd.push(format!("--database={db}"));
        }
        cmd.push("-e".to_string());
        cmd.push(statement.to_string());
        cmd
    }
}

impl Dialect for MySql {
    fn family(&self) -> &'static str {
        "mysql"
    }

    fn port(&self) -> &'static str {
        PORT
    }

    fn create_command(&self, database: &str) -> Vec<String> {
        Self::client(&format!("CREATE DATABASE IF NOT EXISTS `{database}`"), None)
    }

    fn verify_command(&self, database: &str) -> Vec<String> {
        Self::client("SELECT 1", Some(database))
    }

    fn drop_command(&self, database: &str) -> Vec<String> {
        Self::client(&format!("DROP DATABASE IF EXISTS `{database}`"), None)
    }

    fn dsn(&self, host: &str, port: &str, database: &str) -> String {
        format!("root:{ROOT_PASSWORD}@tcp({host}:{port})/{database}")
    }
}

/// Coordinator shared by every MySQL provider built with [`provider`].
pub fn shared_coordinator() -> Arc<ProvisioningCoordinator> {
    static SHARED: OnceLock<Arc<ProvisioningCoordinator>> = OnceLock::new();
    Arc::clone(SHARED.get_or_init(|| Arc::new(ProvisioningCoordinator::new(RETRY))))
}

/// MySQL provider using the process-wide coordinator.
#[must_use]
pub fn provider() -> SqlProvider<MySql> {
    SqlProvider::new(MySql, shared_coordinator())
}
