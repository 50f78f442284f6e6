/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Loopback Link
//!
//! A [RemoteLink] that plays the VideoCore side within the same process. Ringing the doorbell wakes the power
//! handler thread that services pending suspend and resume requests. Each endpoint has its own worker thread that
//! delivers the notifications queued for its service, so a client that stops reading only holds back its own
//! services. Every message queued to a service is echoed back to it.
//!

use crate::error::{VchiqError, VchiqResult, VchiqStatus};
use crate::link::RemoteLink;
use crate::shared::{event::Event, semaphore::Semaphore};
use crate::types::{
    ConnectState, FourCC, MessageHeader, Reason, ServiceHandle, ServiceParams, VchiqCallback,
};
use crate::Vchiq;
use log::{error, info, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause before a notification the service asked to retry is delivered again
const RETRY_DELAY: Duration = Duration::from_millis(1);

/// A notification waiting to be delivered to a service
enum Notification {
    Message(Arc<MessageHeader>),
    Closed,
}

/// The remote side of one service
struct Endpoint {
    handle: ServiceHandle,
    fourcc: FourCC,
    callback: Arc<VchiqCallback>,
    outbox: spin::Mutex<VecDeque<Notification>>,
    /// raised once for each notification put into the outbox
    pending: Semaphore,
}

impl Endpoint {
    fn post(&self, notification: Notification) {
        self.outbox.lock().push_back(notification);
        self.pending.up();
    }

    /// Deliver the notifications of this endpoint until it has been closed. Nothing is delivered while the VideoCore
    /// is suspended.
    fn worker(&self, awake: &Event) {
        trace!("loopback endpoint {:?} running", self.handle);
        while self.pending.down().is_ok() && awake.wait().is_ok() {
            let notification = self.outbox.lock().pop_front();
            let (reason, header) = match notification {
                Some(Notification::Message(ref header)) => {
                    (Reason::MESSAGE_AVAILABLE, Some(Arc::clone(header)))
                }
                Some(Notification::Closed) => (Reason::SERVICE_CLOSED, None),
                None => continue,
            };

            let result = (self.callback)(reason, header, self.handle, None);
            match VchiqStatus::from(&result) {
                VchiqStatus::Success => (),
                VchiqStatus::Retry => {
                    trace!("service {:?} asked to retry {:?}", self.handle, reason);
                    if let Some(notification) = notification {
                        self.outbox.lock().push_front(notification);
                    }
                    thread::sleep(RETRY_DELAY);
                    self.pending.up();
                    continue;
                }
                VchiqStatus::Error => {
                    if let Err(e) = result {
                        warn!("service {:?} dropped {:?}: {}", self.handle, reason, e);
                    }
                }
            }
            if reason == Reason::SERVICE_CLOSED {
                break;
            }
        }
        trace!("loopback endpoint {:?} stopped", self.handle);
    }
}

pub struct LoopbackLink {
    vchiq: spin::Once<Weak<Vchiq>>,
    doorbell: Semaphore,
    /// signaled while the VideoCore is running
    awake: Arc<Event>,
    endpoints: spin::RwLock<BTreeMap<ServiceHandle, Arc<Endpoint>>>,
    use_acks: AtomicUsize,
    wakes: AtomicUsize,
    /// the remote side refuses every suspend request while set
    reject_suspend: AtomicBool,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl LoopbackLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vchiq: spin::Once::new(),
            doorbell: Semaphore::new(0),
            awake: Arc::new(Event::completed()),
            endpoints: spin::RwLock::new(BTreeMap::new()),
            use_acks: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
            reject_suspend: AtomicBool::new(false),
            threads: spin::Mutex::new(Vec::new()),
        })
    }

    /// Connect the link to its [Vchiq] and start the power handler thread. This reports the link as connected, which
    /// starts the keep alive service.
    pub fn attach(self: &Arc<Self>, vchiq: &Arc<Vchiq>) -> VchiqResult<()> {
        let weak = Arc::downgrade(vchiq);
        self.vchiq.call_once(|| weak.clone());

        let link = Arc::clone(self);
        self.spawn(format!("VCHIQlb-{}", vchiq.id()), move || link.handler(weak))?;

        vchiq.platform_conn_state_changed(ConnectState::DISCONNECTED, ConnectState::CONNECTING)?;
        vchiq.platform_conn_state_changed(ConnectState::CONNECTING, ConnectState::CONNECTED)
    }

    /// Stop the power handler and all endpoint workers
    pub fn stop(&self) {
        self.doorbell.close();
        self.awake.interrupt();
        for endpoint in self.endpoints.read().values() {
            endpoint.pending.close();
        }
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Send a message to the remote side of `service`. It comes back as MESSAGE_AVAILABLE.
    pub fn queue_message(&self, service: ServiceHandle, header: MessageHeader) -> VchiqResult<()> {
        let endpoint = self.endpoints.read().get(&service).cloned();
        let endpoint = endpoint.ok_or(VchiqError::ServiceNotFound(service))?;
        endpoint.post(Notification::Message(Arc::new(header)));
        Ok(())
    }

    /// The remote side requests a use of the link through the keep alive service
    pub fn remote_use(&self) {
        if let Some(vchiq) = self.vchiq.get().and_then(Weak::upgrade) {
            vchiq.on_remote_use();
        }
    }

    pub fn remote_release(&self) {
        if let Some(vchiq) = self.vchiq.get().and_then(Weak::upgrade) {
            vchiq.on_remote_release();
        }
    }

    pub fn set_reject_suspend(&self, reject: bool) {
        self.reject_suspend.store(reject, Ordering::Release);
    }

    /// Number of use acknowledgements received
    pub fn use_acks(&self) -> usize {
        self.use_acks.load(Ordering::Acquire)
    }

    /// Number of times the doorbell was rung by the host
    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::Acquire)
    }

    fn spawn<F>(&self, name: String, f: F) -> VchiqResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| {
                error!("unable to spawn loopback thread {}: {}", name, e);
                VchiqError::ThreadSpawn(name)
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    fn handler(&self, vchiq: Weak<Vchiq>) {
        info!("loopback handler running");
        while self.doorbell.down().is_ok() {
            let vchiq = match vchiq.upgrade() {
                Some(vchiq) => vchiq,
                None => break,
            };
            self.handle_power(&vchiq);
        }
        info!("loopback handler stopped");
    }

    /// Act on pending suspend or resume requests of the host
    fn handle_power(&self, vchiq: &Vchiq) {
        if vchiq.platform_check_suspend() {
            if self.reject_suspend.load(Ordering::Acquire) {
                info!("loopback rejects suspend");
                vchiq.platform_suspend_rejected();
            } else {
                info!("loopback suspended");
                // a suspended VideoCore does not talk
                self.awake.reinit();
                vchiq.platform_suspended();
            }
        }
        if vchiq.platform_check_resume() {
            info!("loopback resumed");
            vchiq.platform_resumed();
            self.awake.complete_all();
        }
    }
}

impl RemoteLink for LoopbackLink {
    fn send_wake(&self) -> VchiqResult<()> {
        trace!("loopback doorbell rung");
        self.wakes.fetch_add(1, Ordering::AcqRel);
        self.doorbell.up();
        Ok(())
    }

    fn send_use_ack(&self) -> VchiqResult<()> {
        self.use_acks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn open_endpoint(
        &self,
        service: ServiceHandle,
        params: &ServiceParams,
        callback: Arc<VchiqCallback>,
    ) -> VchiqResult<()> {
        info!("loopback endpoint {:?} for '{}'", service, params.fourcc);
        let endpoint = Arc::new(Endpoint {
            handle: service,
            fourcc: params.fourcc,
            callback,
            outbox: spin::Mutex::new(VecDeque::new()),
            pending: Semaphore::new(0),
        });
        let worker = Arc::clone(&endpoint);
        let awake = Arc::clone(&self.awake);
        self.spawn(format!("VCHIQlb-ep-{}", service.0), move || {
            worker.worker(&awake)
        })?;
        self.endpoints.write().insert(service, endpoint);
        Ok(())
    }

    fn close_endpoint(&self, service: ServiceHandle) -> VchiqResult<()> {
        let endpoint = self.endpoints.write().remove(&service);
        let endpoint = endpoint.ok_or(VchiqError::ServiceNotFound(service))?;
        info!("loopback close '{}' ({:?})", endpoint.fourcc, service);
        endpoint.post(Notification::Closed);
        Ok(())
    }
}
