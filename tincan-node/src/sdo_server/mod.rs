//! SDO server
//!
//! [`SdoReceiver`] is registered as the receive handler for the server's request CAN-ID and runs in
//! interrupt context. [`SdoServer`] runs in the main loop, takes requests out of the receiver, and
//! executes them against the object dictionary.
mod sdo_receiver;
#[allow(clippy::module_inception)]
mod sdo_server;

pub use sdo_receiver::SdoReceiver;
pub use sdo_server::{SdoServer, SdoServerFrame};

/// Enough for 127 segments of 7 bytes
pub const SDO_BUFFER_SIZE: usize = 889;
