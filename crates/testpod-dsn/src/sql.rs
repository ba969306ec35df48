//! Provisioning algorithm shared by the SQL engines.

use std::sync::Arc;

use testpod_common::error::{Result, TestpodError};
use testpod_runtime::classify::{OutputClass, classify};

use crate::coordinator::ProvisioningCoordinator;
use crate::host::DatabaseHost;
use crate::naming::database_name;
use crate::provider::DsnProvider;

/// Engine-specific commands and connection string format.
pub trait Dialect: Send + Sync {
    /// Engine family name.
    fn family(&self) -> &'static str;

    /// Container port the server listens on.
    fn port(&self) -> &'static str;

    /// Command creating `database`.
    fn create_command(&self, database: &str) -> Vec<String>;

    /// Trivial query proving `database` accepts connections.
    fn verify_command(&self, database: &str) -> Vec<String>;

    /// Command dropping `database` if it exists.
    fn drop_command(&self, database: &str) -> Vec<String>;

    /// Connection string for `database` at `host:port`.
    fn dsn(&self, host: &str, port: &str, database: &str) -> String;
}

/// [`DsnProvider`] that runs a [`Dialect`]'s client tools inside the
/// container under a shared [`ProvisioningCoordinator`].
pub struct SqlProvider<D> {
    dialect: D,
    coordinator: Arc<ProvisioningCoordinator>,
}

impl<D: Dialect> SqlProvider<D> {
    /// Creates a provider; providers sharing `coordinator` never create
    /// databases concurrently.
    #[must_use]
    pub const fn new(dialect: D, coordinator: Arc<ProvisioningCoordinator>) -> Self {
        Self {
            dialect,
            coordinator,
        }
    }

    /// The dialect.
    #[must_use]
    pub const fn dialect(&self) -> &D {
        &self.dialect
    }

    fn attempt(&self, host: &dyn DatabaseHost, database: &str) -> Result<()> {
        let created = host.exec(&self.dialect.create_command(database))?;
        if !created.success() {
            let output = created.combined();
            if classify(&output) == OutputClass::AlreadyExists {
                tracing::debug!(database, "database already exists, reusing it");
            } else {
                return Err(TestpodError::Command {
                    command: "create database".into(),
                    message: format!("exit code {}: {}", created.exit_code, output.trim()),
                });
            }
        }
        let verified = host.exec(&self.dialect.verify_command(database))?;
        if verified.success() {
            Ok(())
        } else {
            Err(TestpodError::Command {
                command: "verify database".into(),
                message: format!("exit code {}: {}", verified.exit_code, verified.combined().trim()),
            })
        }
    }
}

impl<D: Dialect> DsnProvider for SqlProvider<D> {
    fn family(&self) -> &str {
        self.dialect.family()
    }

    fn create_database(
        &self,
        host: &dyn DatabaseHost,
        test_name: &str,
        name: &str,
    ) -> Result<String> {
        let database = database_name(if name.is_empty() { test_name } else { name });
        let retry = self.coordinator.retry();
        let attempts = retry.max_attempts();

        let _serialized = self.coordinator.serialize();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.attempt(host, &database) {
                Ok(()) => {
                    tracing::info!(
                        id = %host.id().short(),
                        family = self.dialect.family(),
                        test = test_name,
                        %database,
                        attempt,
                        "database created"
                    );
                    return self.format_dsn(host, &database);
                }
                Err(e) if e.is_container_gone() => return Err(e),
                Err(e) => {
                    tracing::debug!(%database, attempt, error = %e, "database creation attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                std::thread::sleep(retry.delay_after(attempt));
            }
        }
        Err(TestpodError::Provision {
            database,
            attempts,
            message: last_error,
        })
    }

    fn drop_database(&self, host: &dyn DatabaseHost, name: &str) -> Result<()> {
        let database = database_name(name);
        match host.exec(&self.dialect.drop_command(&database)) {
            Ok(out) if out.success() => {
                tracing::debug!(%database, "database dropped");
                Ok(())
            }
            Ok(out) => Err(TestpodError::Command {
                command: "drop database".into(),
                message: out.combined().trim().to_string(),
            }),
            Err(e) if e.is_container_gone() => {
                tracing::debug!(%database, "container gone, nothing to drop");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn format_dsn(&self, host: &dyn DatabaseHost, name: &str) -> Result<String> {
        let (addr, port) = host.endpoint(self.dialect.port())?;
        Ok(self.dialect.dsn(&addr, &port, &database_name(name)))
    }
}
