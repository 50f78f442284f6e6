/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Instance
//!
//! One local client of the VCHIQ. Each instance owns the services it opened and a bounded queue of completion records
//! filled by the service callbacks and drained by the client.
//!

mod completion;

use super::service::Service;
use crate::error::{VchiqError, VchiqResult};
use crate::shared::{lock, semaphore::Semaphore};
use crate::types::{Completion, InstanceHandle, MessageHeader, ServiceHandle};
use completion::CompletionQueue;
use log::{info, trace};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct Instance {
    handle: InstanceHandle,
    completions: spin::Mutex<CompletionQueue>,
    /// monotonic counters into the completion queue, `insert - remove` is the number of records waiting
    completion_insert: AtomicUsize,
    completion_remove: AtomicUsize,
    insert_event: Semaphore,
    remove_event: Semaphore,
    /// serializes clients reading the completion queue
    completion_mutex: Mutex<()>,
    closing: AtomicBool,
    services: spin::RwLock<BTreeMap<ServiceHandle, Arc<Service>>>,
}

impl Instance {
    pub(crate) fn new(handle: InstanceHandle, max_completions: usize) -> Self {
        info!("create VCHIQ instance {:?}", handle);
        Self {
            handle,
            completions: spin::Mutex::new(CompletionQueue::new(max_completions.max(1))),
            completion_insert: AtomicUsize::new(0),
            completion_remove: AtomicUsize::new(0),
            insert_event: Semaphore::new(0),
            remove_event: Semaphore::new(0),
            completion_mutex: Mutex::new(()),
            closing: AtomicBool::new(false),
            services: spin::RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn add_service(&self, service: Arc<Service>) {
        self.services.write().insert(service.handle(), service);
    }

    pub(crate) fn remove_service(&self, handle: ServiceHandle) -> Option<Arc<Service>> {
        self.services.write().remove(&handle)
    }

    pub(crate) fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().values().cloned().collect()
    }

    /// Wait for completion records and return up to `max` of them in the order they were queued
    pub(crate) fn await_completions(
        &self,
        max: usize,
        blocking: bool,
    ) -> VchiqResult<Vec<Completion>> {
        let _guard = lock(&self.completion_mutex);
        loop {
            if self.is_closing() {
                return Err(VchiqError::Closed);
            }
            if self.completion_insert.load(Ordering::Acquire)
                != self.completion_remove.load(Ordering::Relaxed)
            {
                break;
            }
            if !blocking {
                return Err(VchiqError::WouldBlock);
            }
            self.insert_event.down()?;
        }

        let mut result = Vec::new();
        let mut queue = self.completions.lock();
        let insert = self.completion_insert.load(Ordering::Acquire);
        let mut remove = self.completion_remove.load(Ordering::Relaxed);
        while remove != insert && result.len() < max {
            let slot = remove % queue.capacity();
            if let Some(completion) = queue.completions[slot].take() {
                result.push(completion);
            }
            remove += 1;
            self.completion_remove.store(remove, Ordering::Release);
        }
        drop(queue);

        // each freed slot may release a blocked producer
        for _ in 0..result.len() {
            self.remove_event.up();
        }
        trace!("instance {:?} delivered {} completions", self.handle, result.len());
        Ok(result)
    }

    pub(crate) fn dequeue_completion(&self, blocking: bool) -> VchiqResult<Completion> {
        self.await_completions(1, blocking)?
            .pop()
            .ok_or(VchiqError::WouldBlock)
    }

    /// Take the next message from the message queue of `service`
    pub(crate) fn dequeue_message(
        &self,
        service: &Service,
        blocking: bool,
    ) -> VchiqResult<Arc<MessageHeader>> {
        if !service.is_vchi() {
            return Err(VchiqError::NotMessageService(service.handle()));
        }
        loop {
            let mut queue = service.user.msg_queue.lock();
            if let Some(header) = queue.pop() {
                drop(queue);
                service.user.remove_event.up();
                return Ok(header);
            }
            if !blocking {
                return Err(VchiqError::WouldBlock);
            }
            queue.dequeue_pending = true;
            drop(queue);
            service.user.insert_event.down()?;
        }
    }

    /// Tear down the instance. Every producer or client blocked on this instance or its services returns with
    /// [VchiqError::Closed].
    pub(crate) fn close(&self) -> Vec<Arc<Service>> {
        info!("close VCHIQ instance {:?}", self.handle);
        self.closing.store(true, Ordering::Release);
        self.insert_event.close();
        self.remove_event.close();
        let services: Vec<_> = core::mem::take(&mut *self.services.write())
            .into_values()
            .collect();
        for service in services.iter() {
            service.close_queue();
        }
        services
    }

    /// Kick everyone currently blocked on this instance out of the wait
    pub(crate) fn interrupt(&self) {
        self.insert_event.interrupt();
        self.remove_event.interrupt();
        for service in self.services.read().values() {
            service.interrupt_queue();
        }
    }

    pub(crate) fn dump(&self) -> String {
        // both indices only move with the queue locked
        let queue = self.completions.lock();
        let capacity = queue.capacity();
        let waiting = self.completion_insert.load(Ordering::Acquire)
            - self.completion_remove.load(Ordering::Acquire);
        drop(queue);
        let mut out = format!(
            "Instance {:?}:{} completions {}/{}\n",
            self.handle,
            if self.is_closing() { " closing," } else { "" },
            waiting,
            capacity
        );
        for service in self.services.read().values() {
            out.push_str(&service.dump());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FourCC, Reason, ServiceParams};
    use crate::vchiq::service::ServiceState;
    use std::thread;
    use std::time::Duration;

    fn instance(capacity: usize) -> Arc<Instance> {
        Arc::new(Instance::new(InstanceHandle(1), capacity))
    }

    fn service(instance: &Instance, handle: usize, vchi: bool, msg_queue_size: usize) -> Arc<Service> {
        let params = ServiceParams {
            vchi,
            ..ServiceParams::new(FourCC::from(b"TEST"))
        };
        let service = Arc::new(Service::new(
            ServiceHandle(handle),
            &params,
            instance.handle(),
            msg_queue_size,
        ));
        instance.add_service(Arc::clone(&service));
        service
    }

    fn message(msgid: u32) -> Option<Arc<MessageHeader>> {
        Some(Arc::new(MessageHeader::new(msgid, vec![msgid as u8])))
    }

    #[test]
    fn completions_are_delivered_in_order() {
        let instance = instance(4);
        let service = service(&instance, 10, false, 4);
        for msgid in 0..3 {
            instance
                .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(msgid), None)
                .unwrap();
        }
        let completions = instance.await_completions(8, false).unwrap();
        let ids: Vec<u32> = completions
            .iter()
            .map(|c| c.header.as_ref().unwrap().msgid)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(
            instance.dequeue_completion(false).unwrap_err(),
            VchiqError::WouldBlock
        );
    }

    #[test]
    fn producer_blocks_while_queue_is_full() {
        let instance = instance(2);
        let service = service(&instance, 10, false, 4);
        instance
            .service_callback(&service, Reason::BULK_TRANSMIT_DONE, None, None)
            .unwrap();
        instance
            .service_callback(&service, Reason::BULK_RECEIVE_DONE, None, None)
            .unwrap();

        let producer = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                instance.service_callback(&service, Reason::BULK_TRANSMIT_ABORTED, None, None)
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());

        let first = instance.dequeue_completion(true).unwrap();
        assert_eq!(first.reason, Reason::BULK_TRANSMIT_DONE);
        assert_eq!(producer.join().unwrap(), Ok(()));

        let rest = instance.await_completions(4, true).unwrap();
        let reasons: Vec<Reason> = rest.iter().map(|c| c.reason).collect();
        assert_eq!(
            reasons,
            vec![Reason::BULK_RECEIVE_DONE, Reason::BULK_TRANSMIT_ABORTED]
        );
    }

    #[test]
    fn close_releases_blocked_producer() {
        let instance = instance(1);
        let service = service(&instance, 10, false, 4);
        instance
            .service_callback(&service, Reason::BULK_TRANSMIT_DONE, None, None)
            .unwrap();
        let producer = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                instance.service_callback(&service, Reason::BULK_RECEIVE_DONE, None, None)
            })
        };
        thread::sleep(Duration::from_millis(30));
        instance.close();
        assert_eq!(producer.join().unwrap(), Err(VchiqError::Closed));
        assert_eq!(
            instance.dequeue_completion(false).unwrap_err(),
            VchiqError::Closed
        );
        // a closing instance silently drops further notifications
        assert_eq!(
            instance.service_callback(&service, Reason::BULK_RECEIVE_DONE, None, None),
            Ok(())
        );
    }

    #[test]
    fn interrupted_producer_is_asked_to_retry() {
        let instance = instance(1);
        let service = service(&instance, 10, false, 4);
        instance
            .service_callback(&service, Reason::BULK_TRANSMIT_DONE, None, None)
            .unwrap();
        let producer = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                instance.service_callback(&service, Reason::BULK_RECEIVE_DONE, None, None)
            })
        };
        while !producer.is_finished() {
            instance.interrupt();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(producer.join().unwrap(), Err(VchiqError::Retry));
    }

    #[test]
    fn message_service_queues_headers_separately() {
        let instance = instance(4);
        let service = service(&instance, 10, true, 4);
        instance
            .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(7), None)
            .unwrap();
        let completion = instance.dequeue_completion(false).unwrap();
        assert_eq!(completion.reason, Reason::MESSAGE_AVAILABLE);
        assert!(completion.header.is_none());
        assert_eq!(instance.dequeue_message(&service, false).unwrap().msgid, 7);
        assert_eq!(
            instance.dequeue_message(&service, false).unwrap_err(),
            VchiqError::WouldBlock
        );
    }

    #[test]
    fn pending_notice_bypasses_completion_queue() {
        let instance = instance(4);
        let service = service(&instance, 10, true, 4);
        for msgid in 0..3 {
            instance
                .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(msgid), None)
                .unwrap();
        }
        // only the first message produced a notice, the others found it outstanding
        assert_eq!(instance.await_completions(8, false).unwrap().len(), 1);
        assert_eq!(service.pending_messages(), 3);
    }

    #[test]
    fn waiting_reader_bypasses_completion_queue() {
        let instance = instance(4);
        let service = service(&instance, 10, true, 4);
        let reader = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || instance.dequeue_message(&service, true))
        };
        while !service.user.msg_queue.lock().dequeue_pending {
            thread::yield_now();
        }
        instance
            .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(3), None)
            .unwrap();
        assert_eq!(reader.join().unwrap().unwrap().msgid, 3);
        assert_eq!(
            instance.dequeue_completion(false).unwrap_err(),
            VchiqError::WouldBlock
        );
    }

    #[test]
    fn full_message_queue_blocks_producer_until_read() {
        let instance = instance(4);
        let service = service(&instance, 10, true, 2);
        instance
            .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(0), None)
            .unwrap();
        instance
            .service_callback(&service, Reason::MESSAGE_AVAILABLE, message(1), None)
            .unwrap();
        let producer = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                instance.service_callback(&service, Reason::MESSAGE_AVAILABLE, message(2), None)
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());

        assert_eq!(instance.dequeue_message(&service, true).unwrap().msgid, 0);
        assert_eq!(producer.join().unwrap(), Ok(()));
        assert_eq!(instance.dequeue_message(&service, true).unwrap().msgid, 1);
        assert_eq!(instance.dequeue_message(&service, true).unwrap().msgid, 2);
    }

    #[test]
    fn dump_is_consistent_while_queue_is_busy() {
        let instance = instance(2);
        let service = service(&instance, 10, false, 4);
        let rounds = 20_000;
        let producer = {
            let instance = Arc::clone(&instance);
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for _ in 0..rounds {
                    instance
                        .service_callback(&service, Reason::BULK_TRANSMIT_DONE, None, None)
                        .unwrap();
                }
            })
        };
        let consumer = {
            let instance = Arc::clone(&instance);
            thread::spawn(move || {
                for _ in 0..rounds {
                    instance.dequeue_completion(true).unwrap();
                }
            })
        };
        while !consumer.is_finished() {
            let dump = instance.dump();
            assert!(
                dump.contains("completions 0/2")
                    || dump.contains("completions 1/2")
                    || dump.contains("completions 2/2"),
                "{}",
                dump
            );
        }
        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(instance.dump().contains("completions 0/2"));
    }

    #[test]
    fn service_closed_keeps_service_alive() {
        let instance = instance(4);
        let service = service(&instance, 10, false, 4);
        service.set_state(ServiceState::CLOSING);
        instance
            .service_callback(&service, Reason::SERVICE_CLOSED, None, None)
            .unwrap();
        assert!(service.close_pending());
        instance.remove_service(service.handle());
        let weak = Arc::downgrade(&service);
        drop(service);

        let completion = instance.dequeue_completion(false).unwrap();
        assert_eq!(completion.reason, Reason::SERVICE_CLOSED);
        assert!(weak.upgrade().is_some());
        assert_eq!(
            completion.closed_service().map(|s| s.handle()),
            Some(ServiceHandle(10))
        );
        drop(completion);
        assert!(weak.upgrade().is_none());
    }
}
