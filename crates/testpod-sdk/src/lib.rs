//! # testpod-sdk
//!
//! Disposable service containers for Rust tests.
//!
//! A test opens a [`TestScope`], starts containers through
//! [`ContainerBuilder`] or a preset, and lets the scope remove everything
//! when it goes out of scope, whether the test passed or panicked.
//!
//! # Example
//!
//! ```rust,no_run
//! use testpod_sdk::{TestScope, presets::postgres};
//!
//! # fn main() -> testpod_common::error::Result<()> {
//! let scope = TestScope::new("orders::insert");
//! let pg = postgres::start(&scope, [])?;
//! let dsn = pg.dsn()?;
//! assert!(dsn.starts_with("postgresql://"));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod container;
pub mod logging;
pub mod naming;
pub mod options;
pub mod presets;
pub mod scope;

pub use builder::{ContainerBuilder, run};
pub use container::Container;
pub use options::Opt;
pub use scope::TestScope;
