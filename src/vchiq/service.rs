/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Service
//!

use crate::shared::semaphore::Semaphore;
use crate::types::{FourCC, InstanceHandle, MessageHeader, ServiceHandle, ServiceParams, UserData};
use core::fmt;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The different states a [Service] could be in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceState {
    OPEN,
    /// close has been requested, the final SERVICE_CLOSED is still to be delivered
    CLOSING,
    FREE,
}

/// The message sub-queue of a service using the message queue. The list is initialized with a fixed length and treated
/// as "ring-buffer" indexed by the monotonic insert and remove counters.
pub(crate) struct MsgQueue {
    msgs: Vec<Option<Arc<MessageHeader>>>,
    pub(crate) msg_insert: usize,
    pub(crate) msg_remove: usize,
    /// a consumer is blocked in `dequeue_message`
    pub(crate) dequeue_pending: bool,
    /// position in the completion queue of the last MESSAGE_AVAILABLE for this service
    pub(crate) message_available_pos: Option<usize>,
}

impl MsgQueue {
    fn new(capacity: usize) -> Self {
        let mut msgs = Vec::with_capacity(capacity);
        msgs.resize_with(capacity, Default::default);
        Self {
            msgs,
            msg_insert: 0,
            msg_remove: 0,
            dequeue_pending: false,
            message_available_pos: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.msg_insert - self.msg_remove
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.msgs.len()
    }

    /// Store a message. The caller ensures the queue is not full.
    pub(crate) fn push(&mut self, header: Arc<MessageHeader>) {
        let slot = self.msg_insert % self.msgs.len();
        self.msgs[slot] = Some(header);
        self.msg_insert += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<MessageHeader>> {
        if self.msg_insert == self.msg_remove {
            return None;
        }
        let slot = self.msg_remove % self.msgs.len();
        self.msg_remove += 1;
        self.msgs[slot].take()
    }

    /// Whether a MESSAGE_AVAILABLE for this service sits in the completion queue not yet consumed
    pub(crate) fn notice_outstanding(&self, completion_remove: usize) -> bool {
        matches!(self.message_available_pos, Some(pos) if pos >= completion_remove)
    }
}

/// The client side part of a service
pub(crate) struct ServiceUser {
    pub(crate) userdata: Option<UserData>,
    pub(crate) is_vchi: bool,
    /// a SERVICE_CLOSED has been queued and not yet acknowledged with `close_delivered`
    pub(crate) close_pending: AtomicBool,
    pub(crate) msg_queue: spin::Mutex<MsgQueue>,
    pub(crate) insert_event: Semaphore,
    pub(crate) remove_event: Semaphore,
}

pub struct Service {
    handle: ServiceHandle,
    fourcc: FourCC,
    client_id: i32,
    /// the client instance that opened this service
    instance: InstanceHandle,
    srvstate: spin::RwLock<ServiceState>,
    pub(crate) user: ServiceUser,
}

impl Service {
    pub(crate) fn new(
        handle: ServiceHandle,
        params: &ServiceParams,
        instance: InstanceHandle,
        msg_queue_size: usize,
    ) -> Self {
        Self {
            handle,
            fourcc: params.fourcc,
            client_id: params.client_id,
            instance,
            srvstate: spin::RwLock::new(ServiceState::OPEN),
            user: ServiceUser {
                userdata: params.userdata.clone(),
                is_vchi: params.vchi,
                close_pending: AtomicBool::new(false),
                msg_queue: spin::Mutex::new(MsgQueue::new(msg_queue_size.max(1))),
                insert_event: Semaphore::new(0),
                remove_event: Semaphore::new(0),
            },
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle
    }

    pub fn fourcc(&self) -> FourCC {
        self.fourcc
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    pub fn userdata(&self) -> Option<&UserData> {
        self.user.userdata.as_ref()
    }

    /// Messages of this service are kept in its own queue instead of the completion records
    pub fn is_vchi(&self) -> bool {
        self.user.is_vchi
    }

    pub fn state(&self) -> ServiceState {
        *self.srvstate.read()
    }

    pub fn close_pending(&self) -> bool {
        self.user.close_pending.load(Ordering::Acquire)
    }

    /// Number of messages waiting in the message queue
    pub fn pending_messages(&self) -> usize {
        self.user.msg_queue.lock().len()
    }

    pub(crate) fn set_state(&self, new_state: ServiceState) {
        let mut srvstate = self.srvstate.write();
        info!(
            "service {:?} ({}) state {:?} -> {:?}",
            self.handle, self.fourcc, *srvstate, new_state
        );
        *srvstate = new_state;
    }

    /// Wake everyone blocked on the message queue for good
    pub(crate) fn close_queue(&self) {
        self.user.insert_event.close();
        self.user.remove_event.close();
    }

    pub(crate) fn interrupt_queue(&self) {
        self.user.insert_event.interrupt();
        self.user.remove_event.interrupt();
    }

    /// One line diagnostic of this service
    pub(crate) fn dump(&self) -> String {
        let queue = self.user.msg_queue.lock();
        if self.user.is_vchi {
            format!(
                "  service {:?} '{}' client {} ({:?}): {}/{} messages",
                self.handle,
                self.fourcc,
                self.client_id,
                self.state(),
                queue.len(),
                queue.msgs.len()
            )
        } else {
            format!(
                "  service {:?} '{}' client {} ({:?})",
                self.handle,
                self.fourcc,
                self.client_id,
                self.state()
            )
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("handle", &self.handle)
            .field("fourcc", &self.fourcc)
            .field("client_id", &self.client_id)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .field("is_vchi", &self.user.is_vchi)
            .finish()
    }
}
