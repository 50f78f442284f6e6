/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Loopback Demo
//!
//! Run a VCHIQ link against the loopback VideoCore: open a service, exchange some messages, let the VideoCore go to
//! suspend and wake it up again.
//!

use log::{info, Level, LevelFilter, Metadata, Record};
use std::time::Duration;
use vchiq_arm::{
    loopback::LoopbackLink,
    types::{FourCC, MessageHeader, Reason, ServiceParams},
    Vchiq, VchiqConfig, VchiqResult,
};

/// Simple console logger
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn main() -> VchiqResult<()> {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }

    let link = LoopbackLink::new();
    let config = VchiqConfig {
        suspend_timer_timeout: Duration::from_millis(50),
        ..VchiqConfig::default()
    };
    let vchiq = Vchiq::new(link.clone(), config)?;
    link.attach(&vchiq)?;

    let instance = vchiq.open_instance();
    let echo = vchiq.open_service(
        instance,
        ServiceParams {
            client_id: 1,
            ..ServiceParams::new(FourCC::from(b"ECHO"))
        },
    )?;
    let queued = vchiq.open_service(
        instance,
        ServiceParams {
            vchi: true,
            ..ServiceParams::new(FourCC::from(b"VCHI"))
        },
    )?;

    vchiq.use_service(echo)?;
    for msgid in 0..3 {
        link.queue_message(echo, MessageHeader::new(msgid, format!("ping {}", msgid).into_bytes()))?;
    }
    let mut received = 0;
    while received < 3 {
        for completion in vchiq.await_completions(instance, 3 - received)? {
            info!("completion {:?}", completion);
            received += 1;
        }
    }
    vchiq.release_service(echo)?;

    vchiq.use_service(queued)?;
    link.queue_message(queued, MessageHeader::new(42, b"queued".to_vec()))?;
    let completion = vchiq.dequeue_completion(instance, true)?;
    if completion.reason == Reason::MESSAGE_AVAILABLE {
        let message = vchiq.dequeue_message(instance, queued, true)?;
        info!("message {} of {} bytes", message.msgid, message.size());
    }
    vchiq.release_service(queued)?;

    // nothing uses the VideoCore any more
    std::thread::sleep(Duration::from_millis(200));
    info!("{}", vchiq.dump_state());

    match vchiq.force_suspend(vchiq.config().force_suspend_timeout) {
        Ok(()) => info!("VideoCore suspended on request"),
        Err(e) => info!("force suspend: {}", e),
    }
    vchiq.allow_resume()?;
    vchiq.dump_service_use_state();

    // keep the VideoCore awake until the close went through
    vchiq.use_link()?;
    vchiq.close_service(instance, echo)?;
    let closed = vchiq.dequeue_completion(instance, true)?;
    info!("completion {:?}", closed);
    vchiq.close_delivered(instance, echo)?;
    vchiq.release_link()?;

    vchiq.close_instance(instance)?;
    vchiq.shutdown();
    link.stop();
    Ok(())
}
