/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Event
//!
//! A reusable "completion" used to synchronize the suspend/resume state machines with the threads waiting for them.
//! Once signaled with [Event::complete_all] every current and future waiter passes until the [Event] is re-armed
//! with [Event::reinit]. [Event::complete] instead releases exactly one waiter.
//!

use super::{lock, WaitError};
use core::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Marker for the "done" counter once the event has been completed for all waiters
const DONE_ALL: u32 = u32::MAX / 2;

#[derive(Debug)]
struct EventState {
    /// number of waiters that may pass, [DONE_ALL] once completed for everyone
    done: u32,
    /// bumped with each [Event::complete_all], a waiter passes once it has seen a bump after it started waiting even
    /// if the [Event] got re-armed in the meantime
    generation: u64,
    /// set at shutdown of the link, every wait fails from here on
    interrupted: bool,
}

pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    /// Create a new [Event] that is not yet signaled
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                done: 0,
                generation: 0,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Create a new [Event] that is already signaled for all waiters
    pub fn completed() -> Self {
        let event = Self::new();
        event.complete_all();
        event
    }

    /// Re-arm the [Event]. Subsequent waiters will block until it is signaled again.
    pub fn reinit(&self) {
        lock(&self.state).done = 0;
    }

    /// Release a single waiter. If nobody is waiting the next call to wait passes immediately.
    pub fn complete(&self) {
        let mut state = lock(&self.state);
        if state.done != DONE_ALL {
            state.done += 1;
        }
        self.cond.notify_one();
    }

    /// Release all current and future waiters until the [Event] is re-armed
    pub fn complete_all(&self) {
        let mut state = lock(&self.state);
        state.done = DONE_ALL;
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Wake every waiter with [WaitError::Interrupted]. This is final, any later wait fails the same way.
    pub fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        self.cond.notify_all();
    }

    /// Check whether the [Event] is signaled without consuming it
    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        lock(&self.state).done != 0
    }

    /// Non-blocking poll. Consumes one "done" count if the [Event] was signaled with [Event::complete].
    pub fn try_wait(&self) -> bool {
        let mut state = lock(&self.state);
        Self::consume(&mut state)
    }

    /// Block until the [Event] is signaled
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut state = lock(&self.state);
        let generation = state.generation;
        loop {
            if state.interrupted {
                return Err(WaitError::Interrupted);
            }
            if state.generation != generation || Self::consume(&mut state) {
                return Ok(());
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until the [Event] is signaled or the timeout elapsed
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        let generation = state.generation;
        loop {
            if state.interrupted {
                return Err(WaitError::Interrupted);
            }
            if state.generation != generation || Self::consume(&mut state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    fn consume(state: &mut EventState) -> bool {
        match state.done {
            0 => false,
            DONE_ALL => true,
            _ => {
                state.done -= 1;
                true
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Event")
            .field("done", &(state.done != 0))
            .field("interrupted", &state.interrupted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn complete_all_releases_every_waiter_until_reinit() {
        let event = Event::new();
        assert!(!event.try_wait());
        event.complete_all();
        assert!(event.try_wait());
        assert!(event.try_wait());
        assert!(event.wait().is_ok());
        event.reinit();
        assert!(!event.is_done());
        assert_eq!(
            event.wait_timeout(Duration::from_millis(10)),
            Err(WaitError::Timeout)
        );
    }

    #[test]
    fn complete_releases_one_waiter_per_call() {
        let event = Event::new();
        event.complete();
        event.complete();
        assert!(event.try_wait());
        assert!(event.try_wait());
        assert!(!event.try_wait());
    }

    #[test]
    fn waiter_wakes_up_once_signaled() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(20));
        event.complete_all();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn waiter_passes_even_if_rearmed_right_after_signal() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        event.complete_all();
        event.reinit();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn interrupt_fails_pending_and_later_waits() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(20));
        event.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Interrupted));
        assert_eq!(
            event.wait_timeout(Duration::from_millis(1)),
            Err(WaitError::Interrupted)
        );
    }
}
