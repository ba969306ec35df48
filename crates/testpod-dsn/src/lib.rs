//! # testpod-dsn
//!
//! Provisioning of per-test logical databases inside shared database
//! containers, and formatting of the connection strings tests use to reach
//! them.
//!
//! Creation for one engine family is serialized through a
//! [`coordinator::ProvisioningCoordinator`] and retried with linear backoff,
//! because a server that has just passed its readiness checks may still be
//! finishing its own initialization.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod coordinator;
pub mod host;
pub mod mysql;
pub mod naming;
pub mod postgres;
pub mod provider;
pub mod sql;

pub use coordinator::{ProvisioningCoordinator, RetryPolicy};
pub use host::{BackendHost, DatabaseHost};
pub use provider::DsnProvider;
pub use sql::{Dialect, SqlProvider};
