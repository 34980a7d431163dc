//! Common functionality shared by the tincan crates.
//!
//! This holds everything which is independent of a running node: the canonical CAN frame type,
//! the NMT/heartbeat/SYNC/EMCY message codecs, the SDO wire protocol, object metadata, and the
//! stack configuration. Most users get at it through the `tincan_node::common` re-export.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod config;
pub mod constants;
pub mod emcy;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;

pub use config::StackConfig;
pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
