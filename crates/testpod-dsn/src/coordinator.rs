//! Serialization and retry policy for database creation.
//!
//! Concurrent `CREATE DATABASE` statements against one freshly started
//! server are a known source of flakiness, so every creation for an engine
//! family runs under that family's coordinator lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bounded retry with linearly growing delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, at least one.
    pub attempts: u32,
    /// Delay added per failed attempt.
    pub backoff_step: Duration,
}

impl RetryPolicy {
    /// `attempts` tries, waiting `step`, `2 * step`, ... between them.
    #[must_use]
    pub const fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            attempts,
            backoff_step: step,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }

    /// Number of attempts, never zero.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Lock plus retry policy shared by all providers of one engine family.
#[derive(Debug)]
pub struct ProvisioningCoordinator {
    lock: Mutex<()>,
    retry: RetryPolicy,
}

impl ProvisioningCoordinator {
    /// Creates an independent coordinator.
    #[must_use]
    pub const fn new(retry: RetryPolicy) -> Self {
        Self {
            lock: Mutex::new(()),
            retry,
        }
    }

    /// The retry policy.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Blocks until no other creation holds the lock.
    pub fn serialize(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
