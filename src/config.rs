/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Configuration Constants
//!
use core::time::Duration;

/// Number of completion records a client instance is able to hold
pub const MAX_COMPLETIONS: usize = 16;
/// Number of messages a service using the message queue is able to hold
pub const MSG_QUEUE_SIZE: usize = 64;
/// Version of the keep alive service
pub const KEEPALIVE_VER: u16 = 1;
/// Minimal version of the keep alive service
pub const KEEPALIVE_VER_MIN: u16 = KEEPALIVE_VER;

/// Time in ms the VideoCore need to be unused before suspend will be initiated
pub const SUSPEND_TIMER_TIMEOUT_MS: u64 = 100;
/// The time in ms allowed for VideoCore to go idle when force suspend has been requested
pub const FORCE_SUSPEND_TIMEOUT_MS: u64 = 200;
/// The number of times force suspend may time out while the VideoCore is still in use before suspend is initiated
/// regardless of the use count. Caters for clients that never release their use of the VideoCore.
pub const FORCE_SUSPEND_FAIL_MAX: u32 = 1;
/// Number of services dumped with their use count. Exceeding this only services with non-zero use count are dumped.
pub const DUMP_MAX_SERVICES: usize = 64;

/// Runtime configuration of the VCHIQ link
#[derive(Debug, Clone)]
pub struct VchiqConfig {
    /// capacity of the completion queue of each client instance
    pub max_completions: usize,
    /// capacity of the message queue of each service using it
    pub msg_queue_size: usize,
    /// delay between the last release and the suspend of an unused VideoCore
    pub suspend_timer_timeout: Duration,
    /// time allowed for the VideoCore to go idle on a [crate::Vchiq::force_suspend] request
    pub force_suspend_timeout: Duration,
    /// see [FORCE_SUSPEND_FAIL_MAX]
    pub force_suspend_fail_max: u32,
    /// defer suspend with the suspend timer, otherwise suspend immediately once unused
    pub use_suspend_timer: bool,
    /// platform override that keeps the VideoCore running even if nothing uses it
    pub videocore_always_wanted: bool,
}

impl Default for VchiqConfig {
    fn default() -> Self {
        Self {
            max_completions: MAX_COMPLETIONS,
            msg_queue_size: MSG_QUEUE_SIZE,
            suspend_timer_timeout: Duration::from_millis(SUSPEND_TIMER_TIMEOUT_MS),
            force_suspend_timeout: Duration::from_millis(FORCE_SUSPEND_TIMEOUT_MS),
            force_suspend_fail_max: FORCE_SUSPEND_FAIL_MAX,
            use_suspend_timer: true,
            videocore_always_wanted: false,
        }
    }
}
