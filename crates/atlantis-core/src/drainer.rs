//! Graceful-shutdown gate for in-flight commands.
//!
//! On SIGINT/SIGTERM the server starts draining: new commands are
//! refused and process exit is held until every in-flight command has
//! finished. Commands register through [`Drainer::try_start`], which
//! hands back a guard whose drop marks the command complete.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct DrainState {
    draining: bool,
    in_flight: usize,
}

/// Tracks in-flight commands and refuses new ones once shutdown begins.
#[derive(Debug, Default)]
pub struct Drainer {
    state: Mutex<DrainState>,
    drained: Condvar,
}

/// Marks one in-flight command; dropping it signals completion.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    drainer: &'a Drainer,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.drainer.lock_state();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.drainer.drained.notify_all();
        }
    }
}

impl Drainer {
    /// Creates a drainer accepting new commands.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DrainState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a new command. Returns `None` once draining has begun.
    #[must_use]
    pub fn try_start(&self) -> Option<DrainGuard<'_>> {
        let mut state = self.lock_state();
        if state.draining {
            return None;
        }
        state.in_flight += 1;
        Some(DrainGuard { drainer: self })
    }

    /// Number of commands currently executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    /// Begins draining and blocks until all in-flight commands finish.
    pub fn shut_down_blocking(&self) {
        let mut state = self.lock_state();
        state.draining = true;
        while state.in_flight > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}
