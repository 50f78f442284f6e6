/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ Remote Link
//!
//! The physical link to the VideoCore as seen from the power state and completion handling. The link is never called
//! while the power state lock is held, so an implementation is free to call back into the [crate::Vchiq] from within
//! any of these functions.
//!

use crate::error::VchiqResult;
use crate::types::{ServiceHandle, ServiceParams, VchiqCallback};
use std::sync::Arc;

pub trait RemoteLink: Send + Sync {
    /// Ring the VideoCore to let it know there is a pending suspend or resume request that needs attention. The link
    /// reports the progress back through the `platform_*` functions of the [crate::Vchiq].
    fn send_wake(&self) -> VchiqResult<()>;

    /// Let the VideoCore know that a use it requested through the keep alive service is now active
    fn send_use_ack(&self) -> VchiqResult<()>;

    /// Open the endpoint of `service` at the VideoCore. The handle is assigned by the host and the service is known
    /// before this is called, so the `callback` may be invoked right away, from any thread and concurrently for
    /// different services.
    fn open_endpoint(
        &self,
        service: ServiceHandle,
        params: &ServiceParams,
        callback: Arc<VchiqCallback>,
    ) -> VchiqResult<()>;

    /// Close a service endpoint. The link is expected to deliver a final SERVICE_CLOSED through the callback.
    fn close_endpoint(&self, service: ServiceHandle) -> VchiqResult<()>;
}
