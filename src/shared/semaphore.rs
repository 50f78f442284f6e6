/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # Counting Semaphore
//!
//! The insert/remove events of the completion and message queues. The count mirrors how often the event was raised,
//! the waiting side always re-checks the queue indices after it passed the semaphore.
//!

use super::{lock, WaitError};
use core::fmt;
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug)]
struct SemaphoreState {
    count: u32,
    /// once closed every waiter fails with [WaitError::Closed]
    closed: bool,
    /// bumped by [Semaphore::interrupt], waiters that entered before the bump fail with [WaitError::Interrupted]
    generation: u64,
}

pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                count,
                closed: false,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Raise the semaphore and wake one waiter
    pub fn up(&self) {
        let mut state = lock(&self.state);
        state.count = state.count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Block until the semaphore could be taken
    pub fn down(&self) -> Result<(), WaitError> {
        let mut state = lock(&self.state);
        let generation = state.generation;
        loop {
            if state.closed {
                return Err(WaitError::Closed);
            }
            if state.generation != generation {
                return Err(WaitError::Interrupted);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Close the semaphore. All current and future waiters fail with [WaitError::Closed].
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }

    /// Kick all threads currently blocked in [Semaphore::down] with [WaitError::Interrupted]
    pub fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn down_waits_for_up() {
        let sema = Arc::new(Semaphore::new(1));
        assert!(sema.down().is_ok());
        let waiter = {
            let sema = Arc::clone(&sema);
            thread::spawn(move || sema.down().and_then(|_| sema.down()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        sema.up();
        sema.up();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_wakes_every_waiter() {
        let sema = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sema = Arc::clone(&sema);
                thread::spawn(move || sema.down())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sema.close();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Err(WaitError::Closed));
        }
        assert_eq!(sema.down(), Err(WaitError::Closed));
    }

    #[test]
    fn interrupt_only_hits_current_waiters() {
        let sema = Arc::new(Semaphore::new(0));
        let waiter = {
            let sema = Arc::clone(&sema);
            thread::spawn(move || sema.down())
        };
        while !waiter.is_finished() {
            sema.interrupt();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Interrupted));
        sema.up();
        assert!(sema.down().is_ok());
    }
}
