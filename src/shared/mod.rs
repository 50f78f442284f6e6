/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Shared Synchronization Primitives
//!

pub mod event;
pub mod semaphore;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// The reason a blocking wait on an [event::Event] or [semaphore::Semaphore] returned without success
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// the wait timed out (or would have blocked in the non-blocking variants)
    Timeout,
    /// the waiter was kicked out of the wait
    Interrupted,
    /// the primitive was closed, nothing will ever be signaled again
    Closed,
}

/// Lock the inner state of a primitive. A panic of another waiter never leaves the counters in an inconsistent state,
/// so a poisoned lock is just taken over.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
