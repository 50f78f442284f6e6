/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Keep Alive
//!
//! The VideoCore requests and releases uses of the link through the keep alive service. Those requests arrive in
//! interrupt like context where blocking is not allowed, so they are only counted there and applied by this thread.
//!

use super::arm_state::{ArmState, UseType};
use crate::config::{KEEPALIVE_VER, KEEPALIVE_VER_MIN};
use crate::types::{FourCC, Reason, ServiceParams, VchiqCallback};
use log::{error, info, trace};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(super) fn keepalive_thread(arm_state: Arc<ArmState>) {
    let callback: Arc<VchiqCallback> = Arc::new(|reason, _, _, _| {
        match reason {
            Reason::SERVICE_OPENED | Reason::SERVICE_CLOSED => {
                trace!("keep alive service {:?}", reason)
            }
            _ => error!("unexpected keep alive callback with reason {:?}", reason),
        }
        Ok(())
    });
    let params = ServiceParams {
        version: KEEPALIVE_VER,
        version_min: KEEPALIVE_VER_MIN,
        ..ServiceParams::new(FourCC::from(b"KEEP"))
    };
    let ka_handle = arm_state.next_service_handle();
    arm_state.register_service(ka_handle, params.fourcc, params.client_id);
    if let Err(e) = arm_state.link.open_endpoint(ka_handle, &params, callback) {
        error!("unable to open keep alive service: {}", e);
        arm_state.unregister_service(ka_handle);
        return;
    }
    info!("keep alive service of link {} running", arm_state.id());

    while arm_state.ka_evt.wait().is_ok() {
        // take the releases first, so we never see more releases than uses
        let rc = arm_state.ka_release_count.swap(0, Ordering::AcqRel);
        let uc = arm_state.ka_use_count.swap(0, Ordering::AcqRel);
        trace!("keep alive uses {}, releases {}", uc, rc);

        for _ in 0..uc {
            arm_state.ka_use_ack_count.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = arm_state.use_internal(Some(ka_handle), UseType::Service) {
                error!("keep alive use failed: {}", e);
            }
        }
        for _ in 0..rc {
            if let Err(e) = arm_state.release_internal(Some(ka_handle)) {
                error!("keep alive release failed: {}", e);
            }
        }
    }

    info!("keep alive service of link {} stopped", arm_state.id());
    arm_state.unregister_service(ka_handle);
    if let Err(e) = arm_state.link.close_endpoint(ka_handle) {
        error!("unable to close keep alive service: {}", e);
    }
}
