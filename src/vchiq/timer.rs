/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # Suspend Timer
//!
//! Deferred check whether the VideoCore could be suspended. The timer runs on its own thread, the expiry callback is
//! just another caller taking the power state lock.
//!

use crate::error::{VchiqError, VchiqResult};
use crate::shared::lock;
use log::{error, trace};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TimerSlot {
    /// point in time the timer expires, `None` if the timer is not running
    expires: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    slot: Mutex<TimerSlot>,
    cond: Condvar,
}

#[derive(Debug, Default)]
pub(crate) struct SuspendTimer {
    shared: Arc<TimerShared>,
    thread: spin::Mutex<Option<JoinHandle<()>>>,
}

impl SuspendTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the timer thread that calls `callback` each time the timer expires
    pub(crate) fn spawn<F>(&self, name: &str, callback: F) -> VchiqResult<()>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_thread(shared, callback))
            .map_err(|e| {
                error!("unable to spawn suspend timer thread: {}", e);
                VchiqError::ThreadSpawn(name.to_string())
            })?;
        self.thread.lock().replace(handle);
        Ok(())
    }

    /// (Re-)start the timer to expire after `timeout`
    pub(crate) fn start(&self, timeout: Duration) {
        lock(&self.shared.slot).expires = Some(Instant::now() + timeout);
        self.shared.cond.notify_all();
    }

    /// Stop the timer if it is running. Returns whether it was running.
    pub(crate) fn stop(&self) -> bool {
        let running = lock(&self.shared.slot).expires.take().is_some();
        if running {
            self.shared.cond.notify_all();
        }
        running
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.shared.slot).expires.is_some()
    }

    /// Terminate the timer thread. Joins the thread unless called from the timer thread itself.
    pub(crate) fn shutdown(&self) {
        {
            let mut slot = lock(&self.shared.slot);
            slot.shutdown = true;
            slot.expires = None;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SuspendTimer {
    fn drop(&mut self) {
        // the last reference might be dropped on the timer thread, so never join here
        lock(&self.shared.slot).shutdown = true;
        self.shared.cond.notify_all();
    }
}

fn timer_thread<F: Fn()>(shared: Arc<TimerShared>, callback: F) {
    let mut slot = lock(&shared.slot);
    loop {
        if slot.shutdown {
            trace!("suspend timer stopped");
            return;
        }
        match slot.expires {
            None => {
                slot = shared
                    .cond
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner)
            }
            Some(expires) => {
                let now = Instant::now();
                if now >= expires {
                    slot.expires = None;
                    drop(slot);
                    callback();
                    slot = lock(&shared.slot);
                } else {
                    slot = shared
                        .cond
                        .wait_timeout(slot, expires - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}
