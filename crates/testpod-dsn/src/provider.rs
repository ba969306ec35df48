//! The provisioning contract.

use testpod_common::error::Result;

use crate::host::DatabaseHost;

/// Creates, formats and drops per-test logical databases in a container.
///
/// The container outlives every database created in it; each database is
/// owned by the test that asked for it.
pub trait DsnProvider: Send + Sync {
    /// Engine family name, for logs.
    fn family(&self) -> &str;

    /// Creates `name` (derived from `test_name` when empty) and returns a
    /// connection string for it.
    ///
    /// # Errors
    ///
    /// Returns `TestpodError::Provision` once the retry budget is spent,
    /// or the container error if the container is gone.
    fn create_database(
        &self,
        host: &dyn DatabaseHost,
        test_name: &str,
        name: &str,
    ) -> Result<String>;

    /// Drops `name`. Succeeds if the container is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the drop command itself fails.
    fn drop_database(&self, host: &dyn DatabaseHost, name: &str) -> Result<()>;

    /// Connection string for `name`, sanitized the same way
    /// [`DsnProvider::create_database`] sanitizes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's port cannot be resolved.
    fn format_dsn(&self, host: &dyn DatabaseHost, name: &str) -> Result<String>;
}
