/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # Completion
//!
//! The producer side of the completion queue. Notifications from the VideoCore arrive here from any thread and are
//! turned into completion records of the [Instance] that owns the service. A producer is held back while the queue of
//! the instance (or the message queue of the service) is full.
//!

use super::Instance;
use crate::error::{VchiqError, VchiqResult};
use crate::shared::WaitError;
use crate::types::{Completion, MessageHeader, Reason, UserData};
use crate::vchiq::service::{Service, ServiceState};
use log::{info, trace};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The completion records of an [Instance]. The list is initialized with a fixed length and treated as "ring-buffer"
/// indexed by the monotonic insert and remove counters of the instance.
pub(crate) struct CompletionQueue {
    pub(crate) completions: Vec<Option<Completion>>,
}

impl CompletionQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut completions = Vec::with_capacity(capacity);
        completions.resize_with(capacity, Default::default);
        Self { completions }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.completions.len()
    }
}

/// Map a failed wait of a producer to the status reported back to the VideoCore
fn producer_wait_error(e: WaitError) -> VchiqError {
    match e {
        WaitError::Interrupted => {
            info!("service_callback interrupted");
            VchiqError::Retry
        }
        _ => {
            info!("service_callback closing");
            VchiqError::Closed
        }
    }
}

impl Instance {
    /// Deliver a notification of `service` to this instance
    pub(crate) fn service_callback(
        &self,
        service: &Arc<Service>,
        reason: Reason,
        header: Option<Arc<MessageHeader>>,
        bulk_userdata: Option<UserData>,
    ) -> VchiqResult<()> {
        trace!(
            "service_callback - service {:?} ({}), reason {:?}, header {}",
            service.handle(),
            service.fourcc(),
            reason,
            header.is_some()
        );

        if self.is_closing() {
            return Ok(());
        }

        let header = match header {
            Some(header) if service.is_vchi() => {
                let mut queue = loop {
                    let queue = service.user.msg_queue.lock();
                    if !queue.is_full() {
                        break queue;
                    }
                    let outstanding =
                        queue.notice_outstanding(self.completion_remove.load(Ordering::Acquire));
                    drop(queue);

                    trace!("service_callback - msg queue full");
                    // If there is no MESSAGE_AVAILABLE in the completion queue, add one
                    if !outstanding {
                        trace!("service_callback - inserting extra MESSAGE_AVAILABLE");
                        self.add_completion(Reason::MESSAGE_AVAILABLE, None, service, None)?;
                    }

                    service
                        .user
                        .remove_event
                        .down()
                        .map_err(producer_wait_error)?;
                    if self.is_closing() || service.state() == ServiceState::FREE {
                        return Err(VchiqError::Closed);
                    }
                };

                queue.push(header);
                // If there is a thread waiting in dequeue_message, or if there is a MESSAGE_AVAILABLE in the
                // completion queue then bypass the completion queue.
                let skip_completion = queue.dequeue_pending
                    || queue.notice_outstanding(self.completion_remove.load(Ordering::Acquire));
                queue.dequeue_pending = false;
                drop(queue);
                service.user.insert_event.up();

                if skip_completion {
                    return Ok(());
                }
                None
            }
            header => header,
        };

        self.add_completion(reason, header, service, bulk_userdata)
    }

    /// Queue a completion record. Blocks while the completion queue is full.
    pub(crate) fn add_completion(
        &self,
        reason: Reason,
        header: Option<Arc<MessageHeader>>,
        service: &Arc<Service>,
        bulk_userdata: Option<UserData>,
    ) -> VchiqResult<()> {
        let mut queue = loop {
            let queue = self.completions.lock();
            let insert = self.completion_insert.load(Ordering::Relaxed);
            if insert - self.completion_remove.load(Ordering::Acquire) < queue.capacity() {
                break queue;
            }
            drop(queue);

            // out of space, wait for the client to pick up completions
            trace!("add_completion - completion queue full");
            self.remove_event.down().map_err(producer_wait_error)?;
            if self.is_closing() {
                info!("service_callback closing");
                return Err(VchiqError::Closed);
            }
        };

        let insert = self.completion_insert.load(Ordering::Relaxed);
        // the closed service is kept alive until the client has seen this completion
        let service_ref = if reason == Reason::SERVICE_CLOSED {
            service.user.close_pending.store(true, Ordering::Release);
            Some(Arc::clone(service))
        } else {
            None
        };
        let slot = insert % queue.capacity();
        queue.completions[slot] = Some(Completion {
            reason,
            header,
            service: service.handle(),
            service_userdata: service.user.userdata.clone(),
            bulk_userdata,
            service_ref,
        });

        if reason == Reason::MESSAGE_AVAILABLE {
            service.user.msg_queue.lock().message_available_pos = Some(insert);
        }

        // a client reading the insert index sees the completed record
        self.completion_insert.store(insert + 1, Ordering::Release);
        drop(queue);
        self.insert_event.up();
        Ok(())
    }
}
