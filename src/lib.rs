/***********************************************************************************************************************
 * Copyright (c) 2019 by the authors
 *
 * Author: André Borrmann
 * License: Apache License 2.0
 **********************************************************************************************************************/

//! # VCHIQ ARM
//!
//! Host side of the VideoCore Host Interface (Q stands for Kernel?). This crate keeps track of the use of the VideoCore
//! to suspend it while nobody needs it and to resume it on demand, and it delivers the notifications of the VideoCore
//! services to the client instances that opened them.
//!
//! The physical link to the VideoCore is abstracted by the [link::RemoteLink] trait. The [loopback::LoopbackLink]
//! plays the VideoCore side within the same process.
//!
//! # Usage
//!
//! ```no_run
//! use vchiq_arm::{loopback::LoopbackLink, types::*, Vchiq, VchiqConfig};
//!
//! let link = LoopbackLink::new();
//! let vchiq = Vchiq::new(link.clone(), VchiqConfig::default()).unwrap();
//! link.attach(&vchiq).unwrap();
//!
//! let instance = vchiq.open_instance();
//! let service = vchiq
//!     .open_service(instance, ServiceParams::new(FourCC::from(b"ECHO")))
//!     .unwrap();
//! vchiq.use_service(service).unwrap();
//! link.queue_message(service, MessageHeader::new(1, b"ping".to_vec())).unwrap();
//! let completion = vchiq.dequeue_completion(instance, true).unwrap();
//! assert_eq!(completion.reason, Reason::MESSAGE_AVAILABLE);
//! vchiq.release_service(service).unwrap();
//! ```
//!

pub mod config;
pub mod error;
pub mod link;
pub mod loopback;
pub mod shared;
pub mod types;
pub mod vchiq;

pub use config::VchiqConfig;
pub use error::{VchiqError, VchiqResult, VchiqStatus};
pub use vchiq::Vchiq;
