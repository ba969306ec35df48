//! Container lifecycle management for the testpod engine.
//!
//! Everything in this crate drives an external container runtime and treats
//! it as the source of truth. Backends are synchronous: each call blocks the
//! calling test thread until the runtime answers. The only background work
//! is the log relay, which is always cancellable.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod cancel;
pub mod classify;
pub mod coordination;
pub mod discovery;
pub mod engine;
pub mod exec;
pub mod files;
pub mod logs;
pub mod prune;
pub mod wait;
