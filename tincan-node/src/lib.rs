//! A CANopen node stack for microcontrollers
//!
//! Tincan-node implements the communication side of a CANopen device. It is no_std, performs no
//! heap allocation, and keeps all of its state in statically allocated protocol objects which the
//! application owns. It provides:
//!
//! * A receive/transmit dispatch core, [`CanModule`], which the CAN driver feeds from its
//!   interrupts through the [`CanLink`] trait.
//! * The *NMT* slave state machine and heartbeat producer, plus a heartbeat consumer.
//! * An *EMCY* producer with an error register and pre-defined error history.
//! * *SYNC* consumer and producer, with a synchronous window.
//! * Receive and transmit *PDOs*, with mapping and communication parameters writable over SDO.
//! * An *SDO server* supporting expedited, segmented and block transfers, and a small non-blocking
//!   SDO client.
//! * Store and restore commands, backed by an application supplied [`StorageBackend`].
//!
//! # Getting Started
//!
//! ## Building the object dictionary
//!
//! The object dictionary is a sorted slice of [`object_dict::ODEntry`]. Application objects are
//! built from the field types in [`object_dict`]; communication objects come from the protocol
//! modules, for example [`pdo::PdoCommObject`] for 0x1400 or [`sync::SyncObject`] for 0x1005.
//!
//! ```ignore
//! static EMCY: Emergency = Emergency::new();
//! static NMT: NmtService = NmtService::new();
//! static WINDOW: SyncWindow = SyncWindow::new();
//! static SYNC: SyncService = SyncService::new(&WINDOW, &EMCY);
//! static RPDOS: [Rpdo; 1] = [Rpdo::new(0, &EMCY, &WINDOW)];
//!
//! static OD: [ODEntry; 3] = [
//!     ODEntry { index: 0x1005, data: &SyncObject::cob_id(&SYNC) },
//!     ODEntry { index: 0x1017, data: &NmtObject::heartbeat_producer(&NMT) },
//!     ODEntry { index: 0x1400, data: &PdoCommObject::new(RPDOS[0].config()) },
//! ];
//! ```
//!
//! Before creating the node is the time to load stored object values, using
//! [`restore_stored_objects`] with the bytes the storage backend saved earlier.
//!
//! ## Running the node
//!
//! Received frames go to [`CanModule::on_frame_received`], which can be called from the receive
//! interrupt. The transmit complete interrupt calls [`CanModule::on_transmit_complete`]. The main
//! loop calls [`Node::process_tick`] with the time passed since the previous call:
//!
//! ```ignore
//! let mut node = Node::new(node_id, StackConfig::new(), resources, &mut link)?;
//! loop {
//!     let elapsed_us = timer.lap_us();
//!     match node.process_tick(elapsed_us, &mut link) {
//!         NmtResetRequest::Node => reset_device(),
//!         NmtResetRequest::Communication => node.reset_communication(&mut link)?,
//!         NmtResetRequest::None => (),
//!     }
//! }
//! ```
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::comparison_chain)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod can_module;
pub mod emergency;
pub mod hb_consumer;
pub mod nmt;
mod node;
pub mod object_dict;
pub mod pdo;
mod persist;
pub mod sdo_client;
pub mod sdo_server;
pub mod storage;
pub mod sync;

// Re-export types used by applications building an object dictionary
pub use critical_section;
pub use tincan_common as common;

pub use can_module::{CanError, CanLink, CanModule, CanRxHandler, RxSlot, TxBuffer};
pub use emergency::Emergency;
pub use nmt::{NmtResetRequest, NmtService};
pub use node::{Node, NodeResources};
pub use persist::{
    restore_stored_objects, serialize, serialized_size, StoredRecord, StoredRecords,
};
pub use sdo_client::{SdoClient, SdoClientReceiver, SdoClientStatus};
pub use sdo_server::SDO_BUFFER_SIZE;
pub use storage::{StorageBackend, StorageControl, StorageError, StorageRegion};
