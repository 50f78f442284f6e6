/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! Delivery of service notifications to the client instances

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vchiq_arm::{
    link::RemoteLink,
    loopback::LoopbackLink,
    types::{
        FourCC, InstanceHandle, MessageHeader, Reason, ServiceHandle, ServiceParams, UserData,
        VchiqCallback,
    },
    vchiq::{arm_state::SuspendState, service::ServiceState},
    Vchiq, VchiqConfig, VchiqError, VchiqResult,
};

/// A link whose notifications are injected by the test through [Vchiq::service_callback]
#[derive(Default)]
struct ManualLink {
    closed: AtomicUsize,
}

impl RemoteLink for ManualLink {
    fn send_wake(&self) -> VchiqResult<()> {
        Ok(())
    }

    fn send_use_ack(&self) -> VchiqResult<()> {
        Ok(())
    }

    fn open_endpoint(
        &self,
        _service: ServiceHandle,
        _params: &ServiceParams,
        _callback: Arc<VchiqCallback>,
    ) -> VchiqResult<()> {
        Ok(())
    }

    fn close_endpoint(&self, _service: ServiceHandle) -> VchiqResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A link that confirms each service as open from within `open_endpoint`
struct EagerLink;

impl RemoteLink for EagerLink {
    fn send_wake(&self) -> VchiqResult<()> {
        Ok(())
    }

    fn send_use_ack(&self) -> VchiqResult<()> {
        Ok(())
    }

    fn open_endpoint(
        &self,
        service: ServiceHandle,
        _params: &ServiceParams,
        callback: Arc<VchiqCallback>,
    ) -> VchiqResult<()> {
        callback(Reason::SERVICE_OPENED, None, service, None)?;
        callback(Reason::MESSAGE_AVAILABLE, message(1), service, None)
    }

    fn close_endpoint(&self, _service: ServiceHandle) -> VchiqResult<()> {
        Ok(())
    }
}

fn manual(max_completions: usize) -> (Arc<ManualLink>, Arc<Vchiq>) {
    let link = Arc::new(ManualLink::default());
    let config = VchiqConfig {
        max_completions,
        msg_queue_size: 4,
        ..VchiqConfig::default()
    };
    let vchiq = Vchiq::new(link.clone(), config).unwrap();
    (link, vchiq)
}

fn open(vchiq: &Vchiq, instance: InstanceHandle, fourcc: &[u8; 4], vchi: bool) -> ServiceHandle {
    let params = ServiceParams {
        vchi,
        ..ServiceParams::new(FourCC::from(fourcc))
    };
    vchiq.open_service(instance, params).unwrap()
}

fn message(msgid: u32) -> Option<Arc<MessageHeader>> {
    Some(Arc::new(MessageHeader::new(msgid, msgid.to_le_bytes().to_vec())))
}

fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Deliver a notification from a separate thread, as the link would
fn deliver_async(
    vchiq: &Arc<Vchiq>,
    reason: Reason,
    msgid: u32,
    service: ServiceHandle,
) -> thread::JoinHandle<VchiqResult<()>> {
    let vchiq = Arc::clone(vchiq);
    thread::spawn(move || vchiq.service_callback(reason, message(msgid), service, None))
}

#[test]
fn full_queue_holds_back_producer_and_keeps_order() {
    let (_, vchiq) = manual(2);
    let instance = vchiq.open_instance();
    let service = open(&vchiq, instance, b"FIFO", false);

    for msgid in 0..2 {
        vchiq
            .service_callback(Reason::MESSAGE_AVAILABLE, message(msgid), service, None)
            .unwrap();
    }
    let producer = deliver_async(&vchiq, Reason::MESSAGE_AVAILABLE, 2, service);
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());

    let first = vchiq.dequeue_completion(instance, true).unwrap();
    assert_eq!(first.header.unwrap().msgid, 0);
    assert_eq!(producer.join().unwrap(), Ok(()));

    let rest = vchiq.await_completions(instance, 8).unwrap();
    let ids: Vec<u32> = rest.iter().map(|c| c.header.as_ref().unwrap().msgid).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(
        vchiq.dequeue_completion(instance, false).unwrap_err(),
        VchiqError::WouldBlock
    );
    vchiq.shutdown();
}

#[test]
fn closing_instance_releases_blocked_threads() {
    let (_, vchiq) = manual(1);
    let busy = vchiq.open_instance();
    let service = open(&vchiq, busy, b"BUSY", false);
    vchiq
        .service_callback(Reason::BULK_TRANSMIT_DONE, None, service, None)
        .unwrap();
    let producer = deliver_async(&vchiq, Reason::MESSAGE_AVAILABLE, 1, service);

    let idle = vchiq.open_instance();
    let consumer = {
        let vchiq = Arc::clone(&vchiq);
        thread::spawn(move || vchiq.dequeue_completion(idle, true))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());
    assert!(!consumer.is_finished());

    vchiq.close_instance(busy).unwrap();
    assert_eq!(producer.join().unwrap(), Err(VchiqError::Closed));
    vchiq.close_instance(idle).unwrap();
    assert_eq!(consumer.join().unwrap().unwrap_err(), VchiqError::Closed);

    // notifications for the closed services go nowhere
    assert_eq!(
        vchiq.service_callback(Reason::BULK_RECEIVE_DONE, None, service, None),
        Ok(())
    );
    vchiq.shutdown();
}

#[test]
fn interrupt_kicks_out_blocked_threads() {
    let (_, vchiq) = manual(1);
    let instance = vchiq.open_instance();
    let service = open(&vchiq, instance, b"INTR", false);
    let consumer = {
        let vchiq = Arc::clone(&vchiq);
        thread::spawn(move || vchiq.dequeue_completion(instance, true))
    };
    while !consumer.is_finished() {
        vchiq.interrupt_instance(instance).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(consumer.join().unwrap().unwrap_err(), VchiqError::Interrupted);

    vchiq
        .service_callback(Reason::BULK_TRANSMIT_DONE, None, service, None)
        .unwrap();
    let producer = deliver_async(&vchiq, Reason::MESSAGE_AVAILABLE, 1, service);
    while !producer.is_finished() {
        vchiq.interrupt_instance(instance).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    // the link is expected to deliver the notification again later
    assert_eq!(producer.join().unwrap(), Err(VchiqError::Retry));
    vchiq.shutdown();
}

#[test]
fn message_queue_services_get_headers_through_dequeue_message() {
    let (_, vchiq) = manual(4);
    let instance = vchiq.open_instance();
    let queued = open(&vchiq, instance, b"VCHI", true);
    let plain = open(&vchiq, instance, b"PLAN", false);

    vchiq
        .service_callback(Reason::MESSAGE_AVAILABLE, message(5), queued, None)
        .unwrap();
    vchiq
        .service_callback(Reason::MESSAGE_AVAILABLE, message(6), queued, None)
        .unwrap();

    // a single notice covers both messages
    let completions = vchiq.await_completions(instance, 4).unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].reason, Reason::MESSAGE_AVAILABLE);
    assert!(completions[0].header.is_none());
    assert_eq!(vchiq.dequeue_message(instance, queued, false).unwrap().msgid, 5);
    assert_eq!(vchiq.dequeue_message(instance, queued, false).unwrap().msgid, 6);
    assert_eq!(
        vchiq.dequeue_message(instance, queued, false).unwrap_err(),
        VchiqError::WouldBlock
    );
    assert_eq!(
        vchiq.dequeue_message(instance, plain, false).unwrap_err(),
        VchiqError::NotMessageService(plain)
    );
    vchiq.shutdown();
}

#[test]
fn service_close_is_acknowledged_by_the_client() {
    let (link, vchiq) = manual(4);
    let instance = vchiq.open_instance();
    let service = open(&vchiq, instance, b"CLSE", false);

    vchiq.close_service(instance, service).unwrap();
    assert_eq!(link.closed.load(Ordering::SeqCst), 1);
    assert_eq!(vchiq.service(service).unwrap().state(), ServiceState::CLOSING);
    assert_eq!(
        vchiq.close_service(instance, service),
        Err(VchiqError::Closed)
    );

    vchiq
        .service_callback(Reason::SERVICE_CLOSED, None, service, None)
        .unwrap();
    let completion = vchiq.dequeue_completion(instance, true).unwrap();
    assert_eq!(completion.reason, Reason::SERVICE_CLOSED);
    let closed = completion.closed_service().cloned().unwrap();
    assert!(closed.close_pending());

    vchiq.close_delivered(instance, service).unwrap();
    assert!(vchiq.service(service).is_none());
    assert_eq!(closed.state(), ServiceState::FREE);
    assert!(!closed.close_pending());
    vchiq.shutdown();
}

#[test]
fn completions_carry_the_userdata() {
    let (_, vchiq) = manual(4);
    let instance = vchiq.open_instance();
    let userdata: UserData = Arc::new(42u32);
    let service = vchiq
        .open_service(
            instance,
            ServiceParams {
                userdata: Some(userdata),
                ..ServiceParams::new(FourCC::from(b"USER"))
            },
        )
        .unwrap();
    let bulk: UserData = Arc::new("bulk");
    vchiq
        .service_callback(Reason::BULK_RECEIVE_DONE, None, service, Some(bulk))
        .unwrap();

    let completion = vchiq.dequeue_completion(instance, false).unwrap();
    assert_eq!(completion.service, service);
    let service_userdata = completion.service_userdata.unwrap();
    assert_eq!(service_userdata.downcast_ref::<u32>(), Some(&42));
    let bulk_userdata = completion.bulk_userdata.unwrap();
    assert_eq!(bulk_userdata.downcast_ref::<&str>(), Some(&"bulk"));
    vchiq.shutdown();
}

#[test]
fn unknown_services_are_ignored() {
    let (_, vchiq) = manual(4);
    assert_eq!(
        vchiq.service_callback(Reason::MESSAGE_AVAILABLE, message(1), ServiceHandle(999), None),
        Ok(())
    );
    assert_eq!(
        vchiq.dequeue_completion(InstanceHandle(999), false).unwrap_err(),
        VchiqError::InstanceNotFound(InstanceHandle(999))
    );
    vchiq.shutdown();
}

#[test]
fn loopback_echoes_messages() {
    let link = LoopbackLink::new();
    let config = VchiqConfig {
        videocore_always_wanted: true,
        ..VchiqConfig::default()
    };
    let vchiq = Vchiq::new(link.clone(), config).unwrap();
    link.attach(&vchiq).unwrap();

    let instance = vchiq.open_instance();
    let service = open(&vchiq, instance, b"ECHO", false);
    vchiq.use_service(service).unwrap();
    for msgid in 0..3 {
        link.queue_message(service, MessageHeader::new(msgid, vec![msgid as u8]))
            .unwrap();
    }

    let mut ids = Vec::new();
    while ids.len() < 3 {
        for completion in vchiq.await_completions(instance, 3).unwrap() {
            assert_eq!(completion.reason, Reason::MESSAGE_AVAILABLE);
            ids.push(completion.header.unwrap().msgid);
        }
    }
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(vchiq.dump_state().contains("ECHO"));

    vchiq.close_service(instance, service).unwrap();
    let closed = vchiq.dequeue_completion(instance, true).unwrap();
    assert_eq!(closed.reason, Reason::SERVICE_CLOSED);
    vchiq.close_delivered(instance, service).unwrap();

    // closing dropped the use the service still held
    assert_eq!(
        vchiq.release_service(service),
        Err(VchiqError::ServiceNotFound(service))
    );
    assert_eq!(vchiq.power_state().videocore_use_count, 0);
    vchiq.shutdown();
    link.stop();
}

#[test]
fn link_may_notify_while_opening_the_service() {
    let vchiq = Vchiq::new(Arc::new(EagerLink), VchiqConfig::default()).unwrap();
    let instance = vchiq.open_instance();
    let service = open(&vchiq, instance, b"EAGR", false);

    let completions = vchiq.await_completions(instance, 4).unwrap();
    let reasons: Vec<Reason> = completions.iter().map(|c| c.reason).collect();
    assert_eq!(reasons, vec![Reason::SERVICE_OPENED, Reason::MESSAGE_AVAILABLE]);
    assert!(completions.iter().all(|c| c.service == service));
    assert_eq!(vchiq.power_state().service_use_count(service), Some(0));
    vchiq.shutdown();
}

#[test]
fn full_instance_does_not_hold_back_others() {
    let link = LoopbackLink::new();
    let config = VchiqConfig {
        max_completions: 1,
        suspend_timer_timeout: Duration::from_millis(20),
        ..VchiqConfig::default()
    };
    let vchiq = Vchiq::new(link.clone(), config).unwrap();
    link.attach(&vchiq).unwrap();

    let stalled = vchiq.open_instance();
    let stalled_service = open(&vchiq, stalled, b"STLL", false);
    let reader = vchiq.open_instance();
    let reader_service = open(&vchiq, reader, b"READ", false);
    vchiq.use_service(stalled_service).unwrap();
    vchiq.use_service(reader_service).unwrap();

    // the stalled instance never reads, its second message has nowhere to go
    for msgid in 0..2 {
        link.queue_message(stalled_service, MessageHeader::new(msgid, vec![]))
            .unwrap();
    }
    wait_for("stalled instance full", || {
        vchiq.dump_state().contains("completions 1/1")
    });

    link.queue_message(reader_service, MessageHeader::new(7, vec![]))
        .unwrap();
    let mut received = None;
    wait_for("reader message", || {
        if let Ok(completion) = vchiq.dequeue_completion(reader, false) {
            received = completion.header.map(|header| header.msgid);
        }
        received.is_some()
    });
    assert_eq!(received, Some(7));

    // suspend and resume are still served
    vchiq.release_service(stalled_service).unwrap();
    vchiq.release_service(reader_service).unwrap();
    wait_for("suspend", || {
        vchiq.power_state().suspend_state == SuspendState::SUSPENDED
    });
    vchiq.use_service(reader_service).unwrap();
    assert_eq!(vchiq.power_state().suspend_state, SuspendState::IDLE);

    vchiq.shutdown();
    link.stop();
}
