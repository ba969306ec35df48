//! Startup coordination between concurrently starting containers.
//!
//! [`StartupGate`] serializes container creation for one fragile service
//! family and holds the next creator back for a settling delay.
//! [`StartSlots`] caps how many containers of any kind are between create
//! and start at the same time.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    not_before: Option<Instant>,
}

/// Startup mutex for one service family.
#[derive(Debug)]
pub struct StartupGate {
    family: String,
    settle: Duration,
    state: Mutex<GateState>,
    released: Condvar,
}

impl StartupGate {
    /// Creates a gate that keeps the next creator waiting for `settle`
    /// after each successful creation.
    #[must_use]
    pub fn new(family: impl Into<String>, settle: Duration) -> Self {
        Self {
            family: family.into(),
            settle,
            state: Mutex::new(GateState::default()),
            released: Condvar::new(),
        }
    }

    /// Service family this gate protects.
    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Settling delay applied after each creation.
    #[must_use]
    pub const fn settle(&self) -> Duration {
        self.settle
    }

    /// Blocks until no other creation of this family is in flight and the
    /// previous settling delay has elapsed.
    pub fn lock_startup(&self) -> StartupTicket<'_> {
        let waited = Instant::now();
        let mut state = self.lock();
        loop {
            if state.held {
                state = self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            match state.not_before {
                Some(at) if Instant::now() < at => {
                    let (guard, _) = self
                        .released
                        .wait_timeout(state, at.saturating_duration_since(Instant::now()))
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
                _ => break,
            }
        }
        state.held = true;
        drop(state);
        tracing::debug!(
            family = %self.family,
            waited_ms = waited.elapsed().as_millis(),
            "startup gate acquired"
        );
        StartupTicket {
            gate: self,
            unlocked: false,
        }
    }

    fn release(&self, settle: Option<Duration>) {
        let mut state = self.lock();
        state.held = false;
        state.not_before = settle.map(|d| Instant::now() + d);
        drop(state);
        self.released.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that the caller holds a [`StartupGate`].
///
/// Dropping the ticket without [`StartupTicket::unlock_startup`] releases the
/// gate immediately, which is what a failed creation should do.
#[derive(Debug)]
#[must_use = "the gate stays held until the ticket is unlocked or dropped"]
pub struct StartupTicket<'a> {
    gate: &'a StartupGate,
    unlocked: bool,
}

impl StartupTicket<'_> {
    /// Releases the gate; the next creator proceeds after the settling delay.
    pub fn unlock_startup(mut self) {
        self.unlocked = true;
        self.gate.release(Some(self.gate.settle));
    }
}

impl Drop for StartupTicket<'_> {
    fn drop(&mut self) {
        if !self.unlocked {
            self.gate.release(None);
        }
    }
}

/// Counting gate over the create-to-start window.
#[derive(Debug)]
pub struct StartSlots {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl StartSlots {
    /// Creates a gate admitting `capacity` holders at once (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Maximum number of concurrent holders.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        let in_use = *self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        self.capacity.saturating_sub(in_use)
    }

    /// Blocks until a slot is free and takes it.
    pub fn acquire(&self) -> StartSlot<'_> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.capacity {
            in_use = self
                .freed
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *in_use += 1;
        StartSlot { slots: self }
    }
}

/// A held start slot, returned on drop.
#[derive(Debug)]
#[must_use = "the slot is released as soon as it is dropped"]
pub struct StartSlot<'a> {
    slots: &'a StartSlots,
}

impl Drop for StartSlot<'_> {
    fn drop(&mut self) {
        let mut in_use = self
            .slots
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.slots.freed.notify_one();
    }
}
