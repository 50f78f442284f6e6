/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ ARM Power State
//!
//! Keeps track of who is using the VideoCore and drives the suspend and resume of it. Every use of the VideoCore is
//! counted globally and per entity (the link itself or a service). Once nothing is using the VideoCore any more the
//! suspend timer is started and a suspend requested when it expires. A use while the VideoCore is suspended requests
//! the resume and blocks the caller until the VideoCore is running again.
//!
//! All state is kept behind one reader/writer lock. This lock is never held while waiting for one of the events nor
//! while calling into the [RemoteLink].
//!

use super::{keepalive, timer::SuspendTimer};
use crate::config::{VchiqConfig, DUMP_MAX_SERVICES};
use crate::error::{VchiqError, VchiqResult};
use crate::link::RemoteLink;
use crate::shared::{event::Event, WaitError};
use crate::types::{ConnectState, FourCC, ServiceHandle};
use log::{error, info, trace, warn};
use spin::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuspendState {
    FORCE_CANCELED = -3,
    REJECTED = -2,
    FAILED = -1,
    IDLE = 0,
    REQUESTED = 1,
    IN_PROGRESS = 2,
    SUSPENDED = 3,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResumeState {
    FAILED = -1,
    IDLE = 0,
    REQUESTED = 1,
    IN_PROGRESS = 2,
    RESUMED = 3,
}

/// The kind of use requested for the VideoCore
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UseType {
    /// use on behalf of the link itself
    Vchiq,
    /// use on behalf of a service, resumes the VideoCore if required
    Service,
    /// use on behalf of a service that shall not trigger a resume
    ServiceNoResume,
}

/// The entity a use count is accounted to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum UseEntity {
    Peer,
    Service(ServiceHandle),
}

/// The use count bookkeeping of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUse {
    pub fourcc: FourCC,
    pub client_id: i32,
    pub use_count: usize,
}

/// The part of the power state protected by the suspend/resume lock
#[derive(Debug)]
struct SuspResState {
    vc_suspend_state: SuspendState,
    vc_resume_state: ResumeState,
    videocore_use_count: usize,
    peer_use_count: usize,
    services: BTreeMap<ServiceHandle, ServiceUse>,
    resume_blocked: bool,
    blocked_count: usize,
    /// number of times force suspend timed out while the VideoCore was still in use
    autosuspend_override: u32,
    first_connect: bool,
}

impl SuspResState {
    fn entity_name(&self, entity: UseEntity) -> String {
        match entity {
            UseEntity::Peer => "VCHIQ".to_string(),
            UseEntity::Service(handle) => match self.services.get(&handle) {
                Some(service) => format!("{}:{:03}", service.fourcc, service.client_id),
                None => format!("{:?}", handle),
            },
        }
    }

    fn entity_count_mut(&mut self, entity: UseEntity) -> Option<&mut usize> {
        match entity {
            UseEntity::Peer => Some(&mut self.peer_use_count),
            UseEntity::Service(handle) => self.services.get_mut(&handle).map(|service| &mut service.use_count),
        }
    }
}

/// A consistent copy of the power state taken under the lock
#[derive(Debug, Clone)]
pub struct ArmStateSnapshot {
    pub suspend_state: SuspendState,
    pub resume_state: ResumeState,
    pub videocore_use_count: usize,
    pub peer_use_count: usize,
    pub services: Vec<(ServiceHandle, ServiceUse)>,
    pub resume_blocked: bool,
    pub blocked_count: usize,
    pub autosuspend_override: u32,
    pub first_connect: bool,
    pub suspend_timer_running: bool,
}

impl ArmStateSnapshot {
    /// The use count of a single service, `None` if the service is not registered
    pub fn service_use_count(&self, handle: ServiceHandle) -> Option<usize> {
        self.services
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, service)| service.use_count)
    }
}

pub(crate) struct ArmState {
    /// id of the link this state belongs to, used to name the worker threads
    id: usize,
    config: VchiqConfig,
    pub(super) link: Arc<dyn RemoteLink>,
    susp_res_lock: RwLock<SuspResState>,

    vc_suspend_complete: Event,
    vc_resume_complete: Event,
    /// signaled while clients are allowed to resume the VideoCore
    resume_blocker: Event,
    /// signaled once every client blocked by the resume blocker got through
    blocked_blocker: Event,
    /// wakes the keep alive thread whenever the VideoCore used or released the link
    pub(super) ka_evt: Event,

    pub(super) ka_use_count: AtomicUsize,
    pub(super) ka_release_count: AtomicUsize,
    pub(super) ka_use_ack_count: AtomicUsize,

    /// handles of the services opened on this link, assigned before the link sees the service
    next_service: AtomicUsize,
    suspend_timer: SuspendTimer,
    ka_thread: spin::Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ArmState {
    pub(crate) fn new(
        id: usize,
        link: Arc<dyn RemoteLink>,
        config: VchiqConfig,
    ) -> VchiqResult<Arc<Self>> {
        info!("create ARM power state for link {}", id);
        let arm_state = Arc::new(Self {
            id,
            config,
            link,
            susp_res_lock: RwLock::new(SuspResState {
                vc_suspend_state: SuspendState::IDLE,
                vc_resume_state: ResumeState::RESUMED,
                videocore_use_count: 0,
                peer_use_count: 0,
                services: BTreeMap::new(),
                resume_blocked: false,
                blocked_count: 0,
                autosuspend_override: 0,
                first_connect: false,
            }),
            vc_suspend_complete: Event::new(),
            // the VideoCore is running when the link comes up
            vc_resume_complete: Event::completed(),
            resume_blocker: Event::completed(),
            blocked_blocker: Event::completed(),
            ka_evt: Event::new(),
            ka_use_count: AtomicUsize::new(0),
            ka_release_count: AtomicUsize::new(0),
            ka_use_ack_count: AtomicUsize::new(0),
            next_service: AtomicUsize::new(1),
            suspend_timer: SuspendTimer::new(),
            ka_thread: spin::Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        // the timer only holds a weak reference, dropping the last user of the state stops it
        let weak: Weak<ArmState> = Arc::downgrade(&arm_state);
        arm_state
            .suspend_timer
            .spawn(&format!("VCHIQst-{}", id), move || {
                if let Some(arm_state) = weak.upgrade() {
                    arm_state.check_suspend();
                }
            })?;

        Ok(arm_state)
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn next_service_handle(&self) -> ServiceHandle {
        ServiceHandle(self.next_service.fetch_add(1, Ordering::Relaxed))
    }

    fn set_suspend_state(&self, state: &mut SuspResState, new_state: SuspendState) {
        trace!("suspend state {:?} -> {:?}", state.vc_suspend_state, new_state);
        state.vc_suspend_state = new_state;
        match new_state {
            SuspendState::FORCE_CANCELED | SuspendState::REJECTED | SuspendState::SUSPENDED => {
                self.vc_suspend_complete.complete_all();
            }
            SuspendState::FAILED => {
                self.vc_suspend_complete.complete_all();
                // the VideoCore never went down
                state.vc_resume_state = ResumeState::RESUMED;
                self.vc_resume_complete.complete_all();
            }
            SuspendState::IDLE => self.vc_suspend_complete.reinit(),
            SuspendState::REQUESTED => (),
            SuspendState::IN_PROGRESS => self.set_resume_state(state, ResumeState::IDLE),
        }
    }

    fn set_resume_state(&self, state: &mut SuspResState, new_state: ResumeState) {
        trace!("resume state {:?} -> {:?}", state.vc_resume_state, new_state);
        state.vc_resume_state = new_state;
        match new_state {
            ResumeState::FAILED => (),
            ResumeState::IDLE => self.vc_resume_complete.reinit(),
            ResumeState::REQUESTED | ResumeState::IN_PROGRESS => (),
            ResumeState::RESUMED => {
                self.vc_resume_complete.complete_all();
                self.set_suspend_state(state, SuspendState::IDLE);
            }
        }
    }

    fn videocore_wanted(&self, state: &SuspResState) -> bool {
        if state.blocked_count > 0 {
            // clients are waiting to get through the resume blocker
            true
        } else if state.videocore_use_count == 0 {
            if state.resume_blocked {
                false
            } else {
                self.config.videocore_always_wanted
            }
        } else {
            true
        }
    }

    /// The VideoCore is not running (nor about to be) but somebody wants it
    fn need_resume(&self, state: &SuspResState) -> bool {
        state.vc_resume_state < ResumeState::REQUESTED && self.videocore_wanted(state)
    }

    /// Request the VideoCore to suspend. Returns whether the remote side needs to be kicked once the lock is released.
    fn vcsuspend(&self, state: &mut SuspResState) -> bool {
        match state.vc_suspend_state {
            SuspendState::REQUESTED => {
                info!("suspend already requested");
                false
            }
            SuspendState::IN_PROGRESS => {
                info!("suspend already in progress");
                false
            }
            current => {
                if current != SuspendState::IDLE {
                    if current != SuspendState::REJECTED && current != SuspendState::FAILED {
                        error!("unexpected suspend state {:?}", current);
                    }
                    self.set_suspend_state(state, SuspendState::IDLE);
                }
                info!("request VideoCore suspend");
                self.set_suspend_state(state, SuspendState::REQUESTED);
                true
            }
        }
    }

    /// Let the VideoCore know there is a pending request. Never called with the lock held.
    fn kick(&self) {
        if let Err(e) = self.link.send_wake() {
            error!("unable to notify VideoCore: {}", e);
        }
    }

    fn start_suspend_timer(&self) {
        trace!("start suspend timer");
        self.suspend_timer.start(self.config.suspend_timer_timeout);
    }

    fn stop_suspend_timer(&self) {
        if self.suspend_timer.stop() {
            trace!("suspend timer stopped");
        }
    }

    /// Nothing wants the VideoCore any more. Either defer the suspend with the timer or request it right away.
    /// Returns whether the remote side needs to be kicked.
    fn videocore_unused(&self, state: &mut SuspResState) -> bool {
        if self.config.use_suspend_timer && !state.resume_blocked {
            self.start_suspend_timer();
            false
        } else {
            info!("VideoCore unused - suspending");
            self.vcsuspend(state)
        }
    }

    /// Prevent any client from resuming the VideoCore. Waits for clients previously blocked to get through and for a
    /// resume in flight to finish first.
    fn block_resume<'a>(
        &'a self,
        mut state: RwLockWriteGuard<'a, SuspResState>,
        timeout: Duration,
    ) -> (RwLockWriteGuard<'a, SuspResState>, VchiqResult<()>) {
        if state.blocked_count > 0 {
            self.blocked_blocker.reinit();
            drop(state);
            info!("wait for previously blocked clients");
            let result = self.blocked_blocker.wait_timeout(timeout);
            state = self.susp_res_lock.write();
            match result {
                Ok(()) => info!("previously blocked clients resumed"),
                Err(e) => error!("wait for previously blocked clients failed: {:?}", e),
            }
        }

        let mut resume_count = 0;
        while state.vc_resume_state > ResumeState::IDLE
            && state.vc_resume_state != ResumeState::RESUMED
        {
            if resume_count > 1 {
                error!("waited too many times for resume");
                return (state, Err(VchiqError::ResumeTimeout));
            }
            drop(state);
            info!("wait for resume");
            let result = self.vc_resume_complete.wait_timeout(timeout);
            state = self.susp_res_lock.write();
            if let Err(e) = result {
                error!(
                    "wait for resume failed: {:?} (resume state {:?})",
                    e, state.vc_resume_state
                );
                let err = match e {
                    WaitError::Interrupted => VchiqError::Interrupted,
                    _ => VchiqError::ResumeTimeout,
                };
                return (state, Err(err));
            }
            info!("resumed");
            resume_count += 1;
        }

        self.resume_blocker.reinit();
        state.resume_blocked = true;
        (state, Ok(()))
    }

    fn unblock_resume(&self, state: &mut SuspResState) {
        self.resume_blocker.complete_all();
        state.resume_blocked = false;
    }

    /// Increment the use count of the VideoCore on behalf of a service or the link itself. Blocks while resume is
    /// blocked and until the VideoCore is running.
    pub(crate) fn use_internal(
        &self,
        service: Option<ServiceHandle>,
        use_type: UseType,
    ) -> VchiqResult<()> {
        let mut state = self.susp_res_lock.write();
        let entity = match (use_type, service) {
            (UseType::Vchiq, _) => UseEntity::Peer,
            (_, Some(handle)) => {
                if !state.services.contains_key(&handle) {
                    error!("use of unknown service {:?}", handle);
                    return Err(VchiqError::ServiceNotFound(handle));
                }
                UseEntity::Service(handle)
            }
            (_, None) => {
                error!("use without a service");
                return Err(VchiqError::NullService);
            }
        };
        let entity_name = state.entity_name(entity);

        while state.resume_blocked {
            // If we call 'use' while force suspend is waiting for suspend, then we're about to block the thread which
            // the VideoCore needs to be running to complete the suspend. So cancel the force suspend instead.
            if state.vc_suspend_state == SuspendState::IDLE {
                info!("{} cancelling force suspend", entity_name);
                self.set_suspend_state(&mut state, SuspendState::FORCE_CANCELED);
                break;
            }
            if self.resume_blocker.try_wait() {
                continue;
            }
            if state.blocked_count == 0 {
                self.blocked_blocker.reinit();
            }
            state.blocked_count += 1;
            drop(state);
            info!("{} resume blocked - waiting...", entity_name);
            let result = self.resume_blocker.wait();
            state = self.susp_res_lock.write();
            state.blocked_count -= 1;
            if state.blocked_count == 0 {
                self.blocked_blocker.complete_all();
            }
            if let Err(e) = result {
                error!("{} wait for resume blocker failed: {:?}", entity_name, e);
                return Err(e.into());
            }
            info!("{} resume unblocked", entity_name);
        }

        self.stop_suspend_timer();

        // the service might have gone while we were blocked
        let entity_count = match state.entity_count_mut(entity) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                error!("{} vanished while waiting for resume", entity_name);
                return Err(service.map_or(VchiqError::NullService, VchiqError::ServiceNotFound));
            }
        };
        state.videocore_use_count += 1;

        // a suspend that is not yet committed is rolled back
        if state.vc_suspend_state <= SuspendState::REQUESTED {
            self.set_suspend_state(&mut state, SuspendState::IDLE);
        }

        let resume = use_type != UseType::ServiceNoResume && self.need_resume(&state);
        if resume {
            self.set_resume_state(&mut state, ResumeState::REQUESTED);
            info!(
                "{} count {}, state count {} - requesting resume",
                entity_name, entity_count, state.videocore_use_count
            );
        } else {
            trace!(
                "{} count {}, state count {}",
                entity_name,
                entity_count,
                state.videocore_use_count
            );
        }
        drop(state);

        if resume {
            self.kick();
        }

        if !self.vc_resume_complete.try_wait() {
            info!("{} wait for resume", entity_name);
            if let Err(e) = self.vc_resume_complete.wait() {
                error!("{} wait for resume failed: {:?}", entity_name, e);
                return Err(e.into());
            }
            info!("{} resumed", entity_name);
        }

        self.flush_use_acks();
        Ok(())
    }

    /// Acknowledge the uses the VideoCore requested through the keep alive service
    fn flush_use_acks(&self) {
        let mut ack_count = self.ka_use_ack_count.swap(0, Ordering::AcqRel);
        while ack_count > 0 {
            if let Err(e) = self.link.send_use_ack() {
                error!("sending use ack failed: {}", e);
                self.ka_use_ack_count.fetch_add(ack_count, Ordering::AcqRel);
                break;
            }
            ack_count -= 1;
        }
    }

    /// Decrement the use count of the VideoCore on behalf of a service or the link itself (`None`)
    pub(crate) fn release_internal(&self, service: Option<ServiceHandle>) -> VchiqResult<()> {
        let mut state = self.susp_res_lock.write();
        let entity = match service {
            Some(handle) if state.services.contains_key(&handle) => UseEntity::Service(handle),
            Some(handle) => {
                error!("release of unknown service {:?}", handle);
                return Err(VchiqError::ServiceNotFound(handle));
            }
            None => UseEntity::Peer,
        };
        let entity_name = state.entity_name(entity);
        let entity_count = state.entity_count_mut(entity).map_or(0, |count| *count);

        if state.videocore_use_count == 0 || entity_count == 0 {
            warn!(
                "{} released without use - count {}, state count {}",
                entity_name, entity_count, state.videocore_use_count
            );
            return Err(VchiqError::UseCountUnderflow(entity_name));
        }
        state.videocore_use_count -= 1;
        if let Some(count) = state.entity_count_mut(entity) {
            *count -= 1;
        }

        let mut kick = false;
        if !self.videocore_wanted(&state) {
            kick = self.videocore_unused(&mut state);
        }
        trace!(
            "{} count {}, state count {}",
            entity_name,
            entity_count - 1,
            state.videocore_use_count
        );
        drop(state);

        if kick {
            self.kick();
        }
        Ok(())
    }

    /// Called by the suspend timer once it expired
    pub(crate) fn check_suspend(&self) {
        let mut state = self.susp_res_lock.write();
        let kick = if state.vc_suspend_state != SuspendState::SUSPENDED
            && state.first_connect
            && !self.videocore_wanted(&state)
        {
            self.vcsuspend(&mut state)
        } else {
            false
        };
        drop(state);
        if kick {
            self.kick();
        }
    }

    /// Build the message naming who is keeping the VideoCore from going idle
    fn timeout_diagnostic(state: &SuspResState) -> String {
        if state.videocore_use_count == 0 {
            return "VideoCore use count is 0".to_string();
        }
        let more = |count: usize| {
            if count == state.videocore_use_count {
                ""
            } else {
                " (+ more)"
            }
        };
        if let Some(service) = state.services.values().find(|service| service.use_count > 0) {
            format!(
                "{}:{:03} service has use count {}{}",
                service.fourcc,
                service.client_id,
                service.use_count,
                more(service.use_count)
            )
        } else {
            format!(
                "VCHIQ has use count {}{}",
                state.peer_use_count,
                more(state.peer_use_count)
            )
        }
    }

    fn output_timeout_error(&self, state: &SuspResState) {
        error!(
            "timed out waiting for VideoCore suspend ({}). {}",
            state.autosuspend_override,
            Self::timeout_diagnostic(state)
        );
    }

    /// Try to get the VideoCore into suspend within `timeout`. On success resume stays blocked until
    /// [ArmState::allow_resume] is called.
    pub(crate) fn force_suspend(&self, timeout: Duration) -> VchiqResult<()> {
        trace!("force suspend");
        let state = self.susp_res_lock.write();
        let (mut state, blocked) = self.block_resume(state, timeout);
        blocked?;

        let mut kick = false;
        if state.vc_suspend_state == SuspendState::SUSPENDED {
            info!("VideoCore already suspended");
            return Ok(());
        } else if state.vc_suspend_state <= SuspendState::IDLE {
            self.stop_suspend_timer();
            if !self.videocore_wanted(&state) {
                info!("VideoCore idle, initiating suspend");
                kick = self.vcsuspend(&mut state);
            } else if state.autosuspend_override < self.config.force_suspend_fail_max {
                info!("letting VideoCore go idle");
            } else {
                warn!("force suspend failed too many times - attempting suspend");
                kick = self.vcsuspend(&mut state);
            }
        } else {
            info!("VideoCore suspend in progress - wait for completion");
        }

        // wait for the suspend to complete, once more if it is still on its way after the first timeout
        let mut repeated = false;
        loop {
            drop(state);
            if kick {
                self.kick();
                kick = false;
            }
            let result = self.vc_suspend_complete.wait_timeout(timeout);
            state = self.susp_res_lock.write();
            match result {
                Ok(()) => break,
                Err(WaitError::Timeout) => {
                    if state.vc_suspend_state > SuspendState::IDLE && !repeated {
                        repeated = true;
                        continue;
                    }
                    state.autosuspend_override += 1;
                    self.output_timeout_error(&state);
                    self.unblock_resume(&mut state);
                    return Err(VchiqError::Retry);
                }
                Err(e) => {
                    warn!("wait for VideoCore suspend failed: {:?}", e);
                    self.unblock_resume(&mut state);
                    return Err(e.into());
                }
            }
        }

        if state.vc_suspend_state != SuspendState::SUSPENDED {
            error!("VideoCore suspend failed ({:?})", state.vc_suspend_state);
            if state.vc_suspend_state < SuspendState::IDLE {
                self.set_suspend_state(&mut state, SuspendState::IDLE);
            }
            self.unblock_resume(&mut state);
            return Err(VchiqError::Retry);
        }
        info!("VideoCore suspended");
        Ok(())
    }

    /// Request a resume if the VideoCore is not running. Returns whether the remote side needs to be kicked.
    fn check_resume(&self, state: &mut SuspResState) -> bool {
        if state.vc_resume_state < ResumeState::REQUESTED {
            self.set_resume_state(state, ResumeState::REQUESTED);
            true
        } else {
            false
        }
    }

    /// Lift the resume block put in place by [ArmState::force_suspend] and get the VideoCore running again
    pub(crate) fn allow_resume(&self) -> VchiqResult<()> {
        trace!("allow resume");
        let mut state = self.susp_res_lock.write();
        self.unblock_resume(&mut state);
        let resume = self.check_resume(&mut state);
        drop(state);

        if resume {
            self.kick();
            if let Err(e) = self.vc_resume_complete.wait() {
                error!("wait for VideoCore resume failed: {:?}", e);
                return Err(e.into());
            }
        }

        let mut state = self.susp_res_lock.write();
        if state.vc_suspend_state == SuspendState::SUSPENDED {
            info!("VideoCore remains suspended");
            return Err(VchiqError::RemainsSuspended);
        }
        info!("VideoCore resumed");
        if !self.videocore_wanted(&state) && self.config.use_suspend_timer {
            self.start_suspend_timer();
        }
        state.resume_blocked = false;
        Ok(())
    }

    /// The link is about to suspend the VideoCore. Returns `true` if it shall go ahead.
    pub(crate) fn platform_check_suspend(&self) -> bool {
        let mut state = self.susp_res_lock.write();
        if state.vc_suspend_state == SuspendState::REQUESTED
            && state.vc_resume_state == ResumeState::RESUMED
        {
            self.set_suspend_state(&mut state, SuspendState::IN_PROGRESS);
            true
        } else {
            false
        }
    }

    pub(crate) fn platform_suspended(&self) {
        let mut state = self.susp_res_lock.write();
        if state.vc_suspend_state != SuspendState::IN_PROGRESS {
            warn!("suspended in unexpected state {:?}", state.vc_suspend_state);
        }
        self.set_suspend_state(&mut state, SuspendState::SUSPENDED);
    }

    pub(crate) fn platform_suspend_rejected(&self) {
        let mut state = self.susp_res_lock.write();
        info!("VideoCore rejected suspend");
        self.set_suspend_state(&mut state, SuspendState::REJECTED);
    }

    pub(crate) fn platform_suspend_failed(&self) {
        let mut state = self.susp_res_lock.write();
        error!("VideoCore suspend failed");
        self.set_suspend_state(&mut state, SuspendState::FAILED);
    }

    /// The link checks whether the VideoCore shall be resumed. Returns `true` if it shall go ahead.
    pub(crate) fn platform_check_resume(&self) -> bool {
        let mut state = self.susp_res_lock.write();
        match state.vc_resume_state {
            ResumeState::IN_PROGRESS => {
                info!("resume already in progress");
                false
            }
            ResumeState::REQUESTED => {
                self.set_resume_state(&mut state, ResumeState::IN_PROGRESS);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn platform_resumed(&self) {
        let mut state = self.susp_res_lock.write();
        self.set_resume_state(&mut state, ResumeState::RESUMED);
    }

    /// The VideoCore requested a use through the keep alive service
    pub(crate) fn on_remote_use(&self) {
        self.ka_use_count.fetch_add(1, Ordering::AcqRel);
        self.ka_evt.complete();
    }

    /// The VideoCore released a use through the keep alive service
    pub(crate) fn on_remote_release(&self) {
        self.ka_release_count.fetch_add(1, Ordering::AcqRel);
        self.ka_evt.complete();
    }

    pub(crate) fn platform_conn_state_changed(
        self: &Arc<Self>,
        old_state: ConnectState,
        new_state: ConnectState,
    ) -> VchiqResult<()> {
        info!("connection state of link {}: {:?} -> {:?}", self.id, old_state, new_state);
        if new_state != ConnectState::CONNECTED {
            return Ok(());
        }
        let mut state = self.susp_res_lock.write();
        if state.first_connect {
            return Ok(());
        }
        state.first_connect = true;
        drop(state);

        let name = format!("VCHIQka-{}", self.id);
        let arm_state = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || keepalive::keepalive_thread(arm_state))
            .map_err(|e| {
                error!("unable to spawn keep alive thread: {}", e);
                VchiqError::ThreadSpawn(name)
            })?;
        self.ka_thread.lock().replace(handle);
        Ok(())
    }

    /// Start use count bookkeeping for a freshly opened service
    pub(crate) fn register_service(&self, handle: ServiceHandle, fourcc: FourCC, client_id: i32) {
        let mut state = self.susp_res_lock.write();
        state.services.insert(
            handle,
            ServiceUse {
                fourcc,
                client_id,
                use_count: 0,
            },
        );
    }

    /// Stop use count bookkeeping of a service. Uses the service still holds are dropped with it.
    pub(crate) fn unregister_service(&self, handle: ServiceHandle) {
        let mut state = self.susp_res_lock.write();
        let service = match state.services.remove(&handle) {
            Some(service) => service,
            None => return,
        };
        if service.use_count == 0 {
            return;
        }
        warn!(
            "{}:{:03} closed with use count {}",
            service.fourcc, service.client_id, service.use_count
        );
        state.videocore_use_count = state.videocore_use_count.saturating_sub(service.use_count);
        let kick = if !self.videocore_wanted(&state) {
            self.videocore_unused(&mut state)
        } else {
            false
        };
        drop(state);
        if kick {
            self.kick();
        }
    }

    pub(crate) fn snapshot(&self) -> ArmStateSnapshot {
        let state = self.susp_res_lock.read();
        ArmStateSnapshot {
            suspend_state: state.vc_suspend_state,
            resume_state: state.vc_resume_state,
            videocore_use_count: state.videocore_use_count,
            peer_use_count: state.peer_use_count,
            services: state
                .services
                .iter()
                .map(|(handle, service)| (*handle, service.clone()))
                .collect(),
            resume_blocked: state.resume_blocked,
            blocked_count: state.blocked_count,
            autosuspend_override: state.autosuspend_override,
            first_connect: state.first_connect,
            suspend_timer_running: self.suspend_timer.is_running(),
        }
    }

    /// Log the use counts of all services
    pub(crate) fn dump_service_use_state(&self) {
        let snapshot = self.snapshot();
        let only_nonzero = snapshot.services.len() > DUMP_MAX_SERVICES;

        warn!(
            "-- VideoCore suspend state: {:?} --",
            snapshot.suspend_state
        );
        warn!("-- VideoCore resume state: {:?} --", snapshot.resume_state);
        if only_nonzero {
            warn!(
                "Too many active services ({}). Only dumping up to first {} services with non-zero use-count",
                snapshot.services.len(),
                DUMP_MAX_SERVICES
            );
        }
        snapshot
            .services
            .iter()
            .filter(|(_, service)| !only_nonzero || service.use_count > 0)
            .take(DUMP_MAX_SERVICES)
            .for_each(|(_, service)| {
                warn!(
                    "----- {}:{} service count {} {}",
                    service.fourcc,
                    service.client_id,
                    service.use_count,
                    if service.use_count > 0 { "<-- preventing suspend" } else { "" }
                )
            });
        warn!(
            "----- VCHIQ use count {}",
            snapshot.peer_use_count
        );
        warn!(
            "--- Overall vchiq instance use count {}",
            snapshot.videocore_use_count
        );
    }

    /// Verify the service holds a use of the VideoCore
    pub(crate) fn check_service(&self, handle: ServiceHandle) -> VchiqResult<()> {
        let state = self.susp_res_lock.read();
        let in_use = state
            .services
            .get(&handle)
            .map(|service| service.use_count > 0);
        match in_use {
            Some(true) => Ok(()),
            Some(false) => {
                error!(
                    "{} has use count 0, state {:?}/{:?}",
                    state.entity_name(UseEntity::Service(handle)),
                    state.vc_suspend_state,
                    state.vc_resume_state
                );
                drop(state);
                self.dump_service_use_state();
                Err(VchiqError::ServiceNotInUse(handle))
            }
            None => Err(VchiqError::ServiceNotFound(handle)),
        }
    }

    /// Stop the timer and the keep alive thread. Any thread still waiting on one of the events gets interrupted.
    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutdown ARM power state of link {}", self.id);
        self.suspend_timer.shutdown();
        self.ka_evt.interrupt();
        self.resume_blocker.interrupt();
        self.blocked_blocker.interrupt();
        self.vc_suspend_complete.interrupt();
        self.vc_resume_complete.interrupt();
        if let Some(handle) = self.ka_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
