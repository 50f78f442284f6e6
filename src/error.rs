/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Errors
//!

use crate::shared::WaitError;
use crate::types::{InstanceHandle, ServiceHandle};
use thiserror::Error;

pub type VchiqResult<T> = Result<T, VchiqError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VchiqError {
    /// transient issue, the caller or the remote side should try again
    #[error("VCHIQ-Error: operation needs to be retried")]
    Retry,
    /// the instance or service has been torn down
    #[error("VCHIQ-Error: instance or service is closed")]
    Closed,
    #[error("VCHIQ-Error: operation would block")]
    WouldBlock,
    #[error("VCHIQ-Error: wait has been interrupted")]
    Interrupted,
    #[error("VCHIQ-Error: service {0:?} not found")]
    ServiceNotFound(ServiceHandle),
    #[error("VCHIQ-Error: no service given to use or release")]
    NullService,
    #[error("VCHIQ-Error: service {0:?} used without a use count")]
    ServiceNotInUse(ServiceHandle),
    #[error("VCHIQ-Error: instance {0:?} not found")]
    InstanceNotFound(InstanceHandle),
    #[error("VCHIQ-Error: service {0:?} does not use the message queue")]
    NotMessageService(ServiceHandle),
    #[error("VCHIQ-Error: {0} released without a use count")]
    UseCountUnderflow(String),
    #[error("VCHIQ-Error: VideoCore resume did not complete in time")]
    ResumeTimeout,
    #[error("VCHIQ-Error: VideoCore remains suspended")]
    RemainsSuspended,
    #[error("VCHIQ-Error: remote link failure: {0}")]
    Link(String),
    #[error("VCHIQ-Error: unable to spawn thread {0}")]
    ThreadSpawn(String),
}

impl From<WaitError> for VchiqError {
    fn from(orig: WaitError) -> Self {
        match orig {
            WaitError::Timeout => VchiqError::Retry,
            WaitError::Interrupted => VchiqError::Interrupted,
            WaitError::Closed => VchiqError::Closed,
        }
    }
}

/// The coarse outcome reported back to the remote side or to the power management of the host
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VchiqStatus {
    Success,
    Retry,
    Error,
}

impl<T> From<&VchiqResult<T>> for VchiqStatus {
    fn from(result: &VchiqResult<T>) -> Self {
        match result {
            Ok(_) => VchiqStatus::Success,
            Err(VchiqError::Retry) => VchiqStatus::Retry,
            Err(_) => VchiqStatus::Error,
        }
    }
}
