/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Module
//!
//! The [Vchiq] is the context of one link to the VideoCore. It owns the client instances, the services they opened and
//! the power state of the VideoCore. Clients use the instance and service functions, the link driver reports what
//! happened at the VideoCore through the `service_callback` and `platform_*` functions.
//!

pub mod arm_state;
pub(crate) mod instance;
mod keepalive;
pub mod service;
mod timer;

use crate::config::VchiqConfig;
use crate::error::{VchiqError, VchiqResult};
use crate::link::RemoteLink;
use crate::types::{
    Completion, ConnectState, InstanceHandle, MessageHeader, Reason, ServiceHandle, ServiceParams,
    UserData, VchiqCallback,
};
use arm_state::{ArmState, ArmStateSnapshot, UseType};
use instance::Instance;
use log::{error, info, trace, warn};
use service::{Service, ServiceState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Atomic "counter" to give each link its own id
static NEXT_LINK_ID: AtomicUsize = AtomicUsize::new(0);

pub struct Vchiq {
    config: VchiqConfig,
    arm_state: Arc<ArmState>,
    instances: spin::RwLock<BTreeMap<InstanceHandle, Arc<Instance>>>,
    services: spin::RwLock<BTreeMap<ServiceHandle, Arc<Service>>>,
    next_instance: AtomicUsize,
    /// handed to the service callbacks registered with the link
    this: Weak<Vchiq>,
}

impl Vchiq {
    /// Create the context of a new link to the VideoCore
    pub fn new(link: Arc<dyn RemoteLink>, config: VchiqConfig) -> VchiqResult<Arc<Self>> {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        info!("create VCHIQ link {}", id);
        let arm_state = ArmState::new(id, link, config.clone())?;
        Ok(Arc::new_cyclic(|this| Self {
            config,
            arm_state,
            instances: spin::RwLock::new(BTreeMap::new()),
            services: spin::RwLock::new(BTreeMap::new()),
            next_instance: AtomicUsize::new(1),
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> usize {
        self.arm_state.id()
    }

    fn instance(&self, handle: InstanceHandle) -> VchiqResult<Arc<Instance>> {
        let instance = self.instances.read().get(&handle).cloned();
        instance.ok_or(VchiqError::InstanceNotFound(handle))
    }

    /// Look up a service that belongs to `instance`
    fn instance_service(
        &self,
        instance: &Instance,
        handle: ServiceHandle,
    ) -> VchiqResult<Arc<Service>> {
        let service = self.services.read().get(&handle).cloned();
        match service {
            Some(service) if service.instance() == instance.handle() => Ok(service),
            _ => Err(VchiqError::ServiceNotFound(handle)),
        }
    }

    pub fn service(&self, handle: ServiceHandle) -> Option<Arc<Service>> {
        self.services.read().get(&handle).cloned()
    }

    /// Create a new client instance
    pub fn open_instance(&self) -> InstanceHandle {
        let handle = InstanceHandle(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(Instance::new(handle, self.config.max_completions));
        self.instances.write().insert(handle, instance);
        handle
    }

    /// Close a client instance together with all services it still has open. Uses of the VideoCore the services still
    /// hold are released.
    pub fn close_instance(&self, handle: InstanceHandle) -> VchiqResult<()> {
        let instance = self
            .instances
            .write()
            .remove(&handle)
            .ok_or(VchiqError::InstanceNotFound(handle))?;
        for service in instance.close() {
            self.services.write().remove(&service.handle());
            self.arm_state.unregister_service(service.handle());
            let state = service.state();
            service.set_state(ServiceState::FREE);
            if state == ServiceState::OPEN {
                if let Err(e) = self.arm_state.link.close_endpoint(service.handle()) {
                    warn!("unable to close service {:?}: {}", service.handle(), e);
                }
            }
        }
        Ok(())
    }

    /// Open a service at the VideoCore on behalf of the client `instance`
    pub fn open_service(
        &self,
        instance: InstanceHandle,
        params: ServiceParams,
    ) -> VchiqResult<ServiceHandle> {
        let instance = self.instance(instance)?;
        if instance.is_closing() {
            return Err(VchiqError::Closed);
        }

        let handle = self.arm_state.next_service_handle();
        let service = Arc::new(Service::new(
            handle,
            &params,
            instance.handle(),
            self.config.msg_queue_size,
        ));
        self.arm_state
            .register_service(handle, params.fourcc, params.client_id);
        instance.add_service(Arc::clone(&service));
        self.services.write().insert(handle, Arc::clone(&service));

        let this = self.this.clone();
        let callback: Arc<VchiqCallback> =
            Arc::new(move |reason, header, service, bulk_userdata| match this.upgrade() {
                Some(vchiq) => vchiq.service_callback(reason, header, service, bulk_userdata),
                None => Ok(()),
            });
        if let Err(e) = self.arm_state.link.open_endpoint(handle, &params, callback) {
            error!("unable to open service {:?}: {}", params, e);
            self.services.write().remove(&handle);
            instance.remove_service(handle);
            self.arm_state.unregister_service(handle);
            service.set_state(ServiceState::FREE);
            return Err(e);
        }
        info!("open service {:?} as {:?}", params, handle);
        Ok(handle)
    }

    /// Request the close of a service. The link delivers the final SERVICE_CLOSED, the service is freed once the
    /// client acknowledged it with [Vchiq::close_delivered].
    pub fn close_service(&self, instance: InstanceHandle, service: ServiceHandle) -> VchiqResult<()> {
        let instance = self.instance(instance)?;
        let service = self.instance_service(&instance, service)?;
        if service.state() != ServiceState::OPEN {
            warn!("close called in state {:?}", service.state());
            return Err(VchiqError::Closed);
        }
        service.set_state(ServiceState::CLOSING);
        self.arm_state.unregister_service(service.handle());
        self.arm_state.link.close_endpoint(service.handle())
    }

    /// The client has seen the SERVICE_CLOSED of `service`, so it can be freed
    pub fn close_delivered(&self, instance: InstanceHandle, service: ServiceHandle) -> VchiqResult<()> {
        let instance = self.instance(instance)?;
        let service = self.instance_service(&instance, service)?;
        if !service.user.close_pending.swap(false, Ordering::AcqRel) {
            trace!("no close pending for {:?}", service.handle());
            return Ok(());
        }
        service.set_state(ServiceState::FREE);
        service.close_queue();
        instance.remove_service(service.handle());
        self.services.write().remove(&service.handle());
        Ok(())
    }

    pub fn dequeue_completion(
        &self,
        instance: InstanceHandle,
        blocking: bool,
    ) -> VchiqResult<Completion> {
        self.instance(instance)?.dequeue_completion(blocking)
    }

    /// Block until at least one completion is available and return up to `max` of them
    pub fn await_completions(
        &self,
        instance: InstanceHandle,
        max: usize,
    ) -> VchiqResult<Vec<Completion>> {
        self.instance(instance)?.await_completions(max, true)
    }

    pub fn dequeue_message(
        &self,
        instance: InstanceHandle,
        service: ServiceHandle,
        blocking: bool,
    ) -> VchiqResult<Arc<MessageHeader>> {
        let instance = self.instance(instance)?;
        let service = self.instance_service(&instance, service)?;
        instance.dequeue_message(&service, blocking)
    }

    /// Kick every thread blocked on the instance out of its wait. Blocked clients return
    /// [VchiqError::Interrupted], blocked service callbacks report [VchiqError::Retry] to the link.
    pub fn interrupt_instance(&self, instance: InstanceHandle) -> VchiqResult<()> {
        self.instance(instance)?.interrupt();
        Ok(())
    }

    /// The entry point for every notification of the link. Notifications of unknown services or of closing instances
    /// are dropped.
    pub fn service_callback(
        &self,
        reason: Reason,
        header: Option<Arc<MessageHeader>>,
        service: ServiceHandle,
        bulk_userdata: Option<UserData>,
    ) -> VchiqResult<()> {
        let service = match self.service(service) {
            Some(service) => service,
            None => {
                trace!("service_callback - unknown service {:?}, reason {:?}", service, reason);
                return Ok(());
            }
        };
        let instance = self.instances.read().get(&service.instance()).cloned();
        match instance {
            Some(instance) => instance.service_callback(&service, reason, header, bulk_userdata),
            None => {
                trace!("service_callback - instance gone for {:?}", service.handle());
                Ok(())
            }
        }
    }

    /// Add a use of the VideoCore on behalf of `service`. Returns once the VideoCore is running.
    pub fn use_service(&self, service: ServiceHandle) -> VchiqResult<()> {
        self.arm_state.use_internal(Some(service), UseType::Service)
    }

    /// Add a use of the VideoCore on behalf of `service` without resuming it
    pub fn use_service_no_resume(&self, service: ServiceHandle) -> VchiqResult<()> {
        self.arm_state
            .use_internal(Some(service), UseType::ServiceNoResume)
    }

    pub fn release_service(&self, service: ServiceHandle) -> VchiqResult<()> {
        self.arm_state.release_internal(Some(service))
    }

    /// Add a use of the VideoCore on behalf of the link itself
    pub fn use_link(&self) -> VchiqResult<()> {
        self.arm_state.use_internal(None, UseType::Vchiq)
    }

    pub fn release_link(&self) -> VchiqResult<()> {
        self.arm_state.release_internal(None)
    }

    pub fn config(&self) -> &VchiqConfig {
        &self.config
    }

    /// Try to suspend the VideoCore within `timeout`. On success any resume stays blocked until
    /// [Vchiq::allow_resume].
    pub fn force_suspend(&self, timeout: Duration) -> VchiqResult<()> {
        self.arm_state.force_suspend(timeout)
    }

    pub fn allow_resume(&self) -> VchiqResult<()> {
        self.arm_state.allow_resume()
    }

    /// Verify `service` holds a use of the VideoCore
    pub fn check_service(&self, service: ServiceHandle) -> VchiqResult<()> {
        self.arm_state.check_service(service)
    }

    pub fn dump_service_use_state(&self) {
        self.arm_state.dump_service_use_state();
    }

    /// Human readable state of the link, its instances and services
    pub fn dump_state(&self) -> String {
        let power = self.arm_state.snapshot();
        let mut out = format!(
            "VCHIQ link {}: suspend state {:?}, resume state {:?}, use count {} (peer {})\n",
            self.id(),
            power.suspend_state,
            power.resume_state,
            power.videocore_use_count,
            power.peer_use_count
        );
        let instances: Vec<_> = self.instances.read().values().cloned().collect();
        for instance in instances {
            out.push_str(&instance.dump());
        }
        out
    }

    /// A consistent copy of the current power state
    pub fn power_state(&self) -> ArmStateSnapshot {
        self.arm_state.snapshot()
    }

    /// see [arm_state] for the platform functions, each one is called by the link driver
    pub fn platform_check_suspend(&self) -> bool {
        self.arm_state.platform_check_suspend()
    }

    pub fn platform_suspended(&self) {
        self.arm_state.platform_suspended()
    }

    pub fn platform_suspend_rejected(&self) {
        self.arm_state.platform_suspend_rejected()
    }

    pub fn platform_suspend_failed(&self) {
        self.arm_state.platform_suspend_failed()
    }

    pub fn platform_check_resume(&self) -> bool {
        self.arm_state.platform_check_resume()
    }

    pub fn platform_resumed(&self) {
        self.arm_state.platform_resumed()
    }

    pub fn on_remote_use(&self) {
        self.arm_state.on_remote_use()
    }

    pub fn on_remote_release(&self) {
        self.arm_state.on_remote_release()
    }

    pub fn platform_conn_state_changed(
        &self,
        old_state: ConnectState,
        new_state: ConnectState,
    ) -> VchiqResult<()> {
        self.arm_state
            .platform_conn_state_changed(old_state, new_state)
    }

    /// Close all instances and stop the worker threads of the link
    pub fn shutdown(&self) {
        info!("shutdown VCHIQ link {}", self.id());
        let handles: Vec<_> = self.instances.read().keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.close_instance(handle) {
                error!("unable to close instance {:?}: {}", handle, e);
            }
        }
        self.arm_state.shutdown();
    }
}

impl Drop for Vchiq {
    fn drop(&mut self) {
        self.shutdown();
    }
}
