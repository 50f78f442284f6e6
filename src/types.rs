/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # Types
//!
//! Types and Structures shared between the client side and the link side of the VCHIQ
//!

use crate::error::VchiqResult;
use crate::vchiq::service::Service;
use core::{any::Any, fmt};
use std::sync::Arc;

/// The representation of a service identifier. 4 characters represented as u32 value
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FourCC(u32);

impl FourCC {
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    fn chars(self) -> [char; 4] {
        [
            ((self.0 >> 24) & 0xFF) as u8 as char,
            ((self.0 >> 16) & 0xFF) as u8 as char,
            ((self.0 >> 8) & 0xFF) as u8 as char,
            (self.0 & 0xFF) as u8 as char,
        ]
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(orig: &[u8; 4]) -> Self {
        Self(
            ((orig[0] as u32) << 24)
                | ((orig[1] as u32) << 16)
                | ((orig[2] as u32) << 8)
                | (orig[3] as u32),
        )
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.chars();
        write!(f, "{}{}{}{}", a, b, c, d)
    }
}

/// A service handle that identifies a service
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ServiceHandle(pub usize);

/// A handle that identifies a client instance
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct InstanceHandle(pub usize);

/// Opaque data attached to a service or a bulk transfer and passed back with each completion
pub type UserData = Arc<dyn Any + Send + Sync>;

#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reason {
    SERVICE_OPENED,        /* service, -, -             */
    SERVICE_CLOSED,        /* service, -, -             */
    MESSAGE_AVAILABLE,     /* service, header, -        */
    BULK_TRANSMIT_DONE,    /* service, -, bulk_userdata */
    BULK_RECEIVE_DONE,     /* service, -, bulk_userdata */
    BULK_TRANSMIT_ABORTED, /* service, -, bulk_userdata */
    BULK_RECEIVE_ABORTED,  /* service, -, bulk_userdata */
}

/// The state of the connection to the VideoCore as reported by the link
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectState {
    DISCONNECTED,
    CONNECTING,
    CONNECTED,
    PAUSING,
    PAUSE_SENT,
    PAUSED,
    RESUMING,
    PAUSE_TIMEOUT,
    RESUME_TIMEOUT,
}

/// A message received from the VideoCore. The content is opaque to the completion delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub msgid: u32,
    pub data: Vec<u8>,
}

impl MessageHeader {
    pub fn new(msgid: u32, data: Vec<u8>) -> Self {
        Self { msgid, data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// The type alias for a VCHIQ callback. The link invokes it from any thread whenever something happened on the
/// service. Returning [crate::VchiqError::Retry] asks the link to deliver the same notification again later.
pub type VchiqCallback = dyn Fn(Reason, Option<Arc<MessageHeader>>, ServiceHandle, Option<UserData>) -> VchiqResult<()>
    + Send
    + Sync;

/// Parameters to be used while opening a new service
#[derive(Clone)]
pub struct ServiceParams {
    pub fourcc: FourCC,
    pub client_id: i32,
    pub userdata: Option<UserData>,
    pub version: u16,
    pub version_min: u16,
    /// Messages are kept in a per service queue to be picked up with `dequeue_message` instead of being passed with
    /// the completion record.
    pub vchi: bool,
}

impl ServiceParams {
    pub fn new(fourcc: FourCC) -> Self {
        Self {
            fourcc,
            client_id: 0,
            userdata: None,
            version: 1,
            version_min: 1,
            vchi: false,
        }
    }
}

impl fmt::Debug for ServiceParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceParams")
            .field("fourcc", &self.fourcc)
            .field("client_id", &self.client_id)
            .field(
                "userdata",
                match &self.userdata {
                    Some(_) => &"Some(userdata)",
                    _ => &"None",
                },
            )
            .field("version", &self.version)
            .field("version_min", &self.version_min)
            .field("vchi", &self.vchi)
            .finish()
    }
}

/// One asynchronous event delivered to a client instance
pub struct Completion {
    pub reason: Reason,
    /// The message that caused this completion. Services using the message queue get `None` here and pick up their
    /// messages with `dequeue_message`.
    pub header: Option<Arc<MessageHeader>>,
    pub service: ServiceHandle,
    pub service_userdata: Option<UserData>,
    pub bulk_userdata: Option<UserData>,
    /// extra reference that keeps a closed service alive until its SERVICE_CLOSED was consumed
    pub(crate) service_ref: Option<Arc<Service>>,
}

impl Completion {
    /// The service this SERVICE_CLOSED completion keeps alive
    pub fn closed_service(&self) -> Option<&Arc<Service>> {
        self.service_ref.as_ref()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("reason", &self.reason)
            .field("header", &self.header)
            .field("service", &self.service)
            .field("service_userdata", &self.service_userdata.is_some())
            .field("bulk_userdata", &self.bulk_userdata.is_some())
            .finish()
    }
}
