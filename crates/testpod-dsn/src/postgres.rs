//! PostgreSQL dialect.
//!
//! Relies on the server trusting local connections for the `postgres`
//! superuser, which is how the postgres preset configures its containers.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::coordinator::{ProvisioningCoordinator, RetryPolicy};
use crate::sql::{Dialect, SqlProvider};

/// Superuser the client tools connect as.
pub const SUPERUSER: &str = "postgres";

/// Port the server listens on.
pub const PORT: &str = "5432";

/// Retry policy for PostgreSQL database creation.
pub const RETRY: RetryPolicy = RetryPolicy::linear(5, Duration::from_millis(200));

/// PostgreSQL client commands and URL format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn family(&self) -> &'static str {
        "postgres"
    }

    fn port(&self) -> &'static str {
        PORT
    }

    fn create_command(&self, database: &str) -> Vec<String> {
        args(&["createdb", "-U", SUPERUSER, database])
    }

    fn verify_command(&self, database: &str) -> Vec<String> {
        args(&["psql", "-U", SUPERUSER, "-d", database, "-c", "SELECT 1"])
    }

    fn drop_command(&self, database: &str) -> Vec<String> {
        args(&["dropdb", "-U", SUPERUSER, "--if-exists", database])
    }

    fn dsn(&self, host: &str, port: &str, database: &str) -> String {
        format!("postgresql://{SUPERUSER}@{host}:{port}/{database}?sslmode=disable")
    }
}

/// Coordinator shared by every PostgreSQL provider built with [`provider`].
pub fn shared_coordinator() -> Arc<ProvisioningCoordinator> {
    static SHARED: OnceLock<Arc<ProvisioningCoordinator>> = OnceLock::new();
    Arc::clone(SHARED.get_or_init(|| Arc::new(ProvisioningCoordinator::new(RETRY))))
}

/// PostgreSQL provider using the process-wide coordinator.
#[must_use]
pub fn provider() -> SqlProvider<Postgres> {
    SqlProvider::new(Postgres, shared_coordinator())
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_target_database() {
        assert_eq!(
            Postgres.create_command("orders"),
            vec!["createdb", "-U", "postgres", "orders"]
        );
        assert_eq!(
            Postgres.verify_command("orders"),
            vec!["psql", "-U", "postgres", "-d", "orders", "-c", "SELECT 1"]
        );
        assert!(Postgres.drop_command("orders").contains(&"--if-exists".to_string()));
    }

    #[test]
    fn dsn_is_a_postgres_url() {
        assert_eq!(
            Postgres.dsn("127.0.0.1", "49153", "testdb"),
            "postgresql://postgres@127.0.0.1:49153/testdb?sslmode=disable"
        );
    }

    #[test]
    fn providers_share_one_coordinator() {
        assert!(Arc::ptr_eq(&shared_coordinator(), &shared_coordinator()));
    }
}
