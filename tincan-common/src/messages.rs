//! The canonical CAN frame and the fixed-layout CANopen messages built on top of it

use snafu::Snafu;

use crate::{
    emcy::EmcyMessage,
    sdo::{SdoRequest, SdoResponse},
};

/// A CAN identifier
///
/// The node stack only ever allocates standard identifiers. Extended identifiers can be carried
/// through a link, but are never matched by a receive filter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    /// A 29-bit identifier
    Extended(u32),
    /// An 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id & 0x1FFF_FFFF)
    }

    /// Create a standard ID, masking it to 11 bits
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id & 0x7FF)
    }

    /// Get the ID as a u32, regardless of type
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// True for extended identifiers
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

/// Maximum number of data bytes in a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// A single CAN frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanMessage {
    /// Frame payload. Bytes beyond `dlc` are zero.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Data length code, always in 0..=8
    pub dlc: u8,
    /// Remote transmission request flag
    pub rtr: bool,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            rtr: false,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a data frame
    ///
    /// Bytes beyond the eighth are dropped; the DLC is clamped to 8.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let len = data.len().min(MAX_DATA_LENGTH);
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            dlc: len as u8,
            rtr: false,
            data: buf,
        }
    }

    /// Create a remote frame requesting `dlc` bytes
    pub fn new_rtr(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            dlc: dlc.min(MAX_DATA_LENGTH as u8),
            rtr: true,
            data: [0; MAX_DATA_LENGTH],
        }
    }

    /// Get the frame ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc.min(MAX_DATA_LENGTH as u8) as usize]
    }

    /// Returns true if this is a remote frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// NMT command specifier, the first byte of an NMT frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Enter operational
    Start = 1,
    /// Enter stopped
    Stop = 2,
    /// Enter pre-operational
    EnterPreOp = 128,
    /// Reset the application
    ResetNode = 129,
    /// Reset communications
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Decode a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetNode),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// NMT command frame ID
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// Default SYNC frame ID
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// Emergency base ID (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// TIME stamp frame ID
pub const TIME_ID: CanId = CanId::Std(0x100);
/// Base ID of the first TPDO (node ID is added, subsequent TPDOs are spaced by 0x100)
pub const TPDO_BASE: u16 = 0x180;
/// Base ID of the first RPDO (node ID is added, subsequent RPDOs are spaced by 0x100)
pub const RPDO_BASE: u16 = 0x200;
/// The default base ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// The default base ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Heartbeat base ID (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;

/// An NMT command addressed to one node, or broadcast when `node` is 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmtCommand {
    /// The requested command
    pub cmd: NmtCommandSpecifier,
    /// The addressed node ID
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != NMT_CMD_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            });
        }
        let payload = msg.data();
        if payload.len() != 2 {
            return Err(MessageError::WrongLength {
                expected: 2,
                actual: payload.len() as u8,
            });
        }
        let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
        Ok(NmtCommand {
            cmd,
            node: payload[1],
        })
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cmd as u8, cmd.node])
    }
}

/// The NMT state of a node, as reported in its heartbeat
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Initializing, before the boot-up frame is sent. The boot-up heartbeat carries this value.
    Initializing = 0,
    /// Stopped
    Stopped = 4,
    /// Operational
    Operational = 5,
    /// Pre-operational
    PreOperational = 127,
}

impl NmtState {
    /// True in the states where SDO, SYNC and EMCY are active
    pub fn is_pre_or_operational(&self) -> bool {
        matches!(self, NmtState::Operational | NmtState::PreOperational)
    }
}

/// Error returned when converting an invalid byte into an [`NmtState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initializing as u8 => Ok(Initializing),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Heartbeat {
    /// The producing node
    pub node: u8,
    /// Toggle bit (only used by node guarding)
    pub toggle: bool,
    /// The producer's NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut byte = value.state as u8;
        if value.toggle {
            byte |= 1 << 7;
        }
        CanMessage::new(CanId::std(HEARTBEAT_BASE | value.node as u16), &[byte])
    }
}

/// A SYNC frame
///
/// When the producer is configured with a counter overflow value, the frame carries a one byte
/// counter which starts at 1 and wraps back to 1 after reaching the overflow value. Otherwise the
/// frame is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncObject {
    /// The counter value, if the frame carries one
    pub counter: Option<u8>,
}

impl SyncObject {
    /// Create a SYNC object
    pub fn new(counter: Option<u8>) -> Self {
        Self { counter }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        match value.counter {
            Some(c) => CanMessage::new(SYNC_ID, &[c]),
            None => CanMessage::new(SYNC_ID, &[]),
        }
    }
}

/// A decoded CANopen frame
///
/// This is a convenience for tooling and logging. The node stack dispatches frames through its
/// receive filter table instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TincanMessage {
    /// NMT command
    NmtCommand(NmtCommand),
    /// SYNC
    Sync(SyncObject),
    /// Emergency from the given node
    Emergency(u8, EmcyMessage),
    /// Heartbeat or boot-up
    Heartbeat(Heartbeat),
    /// SDO request (client to server)
    SdoRequest(SdoRequest),
    /// SDO response (server to client)
    SdoResponse(SdoResponse),
}

impl TryFrom<CanMessage> for TincanMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = match msg.id() {
            CanId::Std(id) => id,
            id @ CanId::Extended(_) => return Err(MessageError::UnrecognizedId { cob_id: id }),
        };
        let node = (cob_id & 0x7F) as u8;
        let function = cob_id & !0x7F;

        if msg.id() == NMT_CMD_ID {
            Ok(TincanMessage::NmtCommand(msg.try_into()?))
        } else if msg.id() == SYNC_ID {
            match msg.data() {
                [] => Ok(TincanMessage::Sync(SyncObject::new(None))),
                [c] => Ok(TincanMessage::Sync(SyncObject::new(Some(*c)))),
                _ => Err(MessageError::MalformedMsg { cob_id: msg.id() }),
            }
        } else if function == EMCY_BASE && node != 0 {
            let emcy = EmcyMessage::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id: msg.id() })?;
            Ok(TincanMessage::Emergency(node, emcy))
        } else if function == HEARTBEAT_BASE {
            let byte = *msg.data().first().ok_or(MessageError::MessageTooShort)?;
            let state = NmtState::try_from(byte & 0x7F)
                .map_err(|e| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(TincanMessage::Heartbeat(Heartbeat {
                node,
                toggle: byte & 0x80 != 0,
                state,
            }))
        } else if function == SDO_RESP_BASE {
            let resp = SdoResponse::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id: msg.id() })?;
            Ok(TincanMessage::SdoResponse(resp))
        } else if function == SDO_REQ_BASE {
            let req = SdoRequest::try_from(msg.data())
                .map_err(|_| MessageError::MalformedMsg { cob_id: msg.id() })?;
            Ok(TincanMessage::SdoRequest(req))
        } else {
            Err(MessageError::UnrecognizedId { cob_id: msg.id() })
        }
    }
}

/// Errors which can occur while decoding a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// The payload is too short for the message type
    MessageTooShort,
    /// The payload length is not allowed for the message type
    #[snafu(display("Wrong payload length {actual}, expected {expected}"))]
    WrongLength {
        /// The required length
        expected: u8,
        /// The received length
        actual: u8,
    },
    /// The payload could not be decoded
    #[snafu(display("Malformed message with ID {cob_id:?}"))]
    MalformedMsg {
        /// The ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The received ID
        cob_id: CanId,
        /// The required ID
        expected: CanId,
    },
    /// A field held a value outside its allowed set
    InvalidField,
    /// The ID does not belong to any known message
    #[snafu(display("Unrecognized message ID {cob_id:?}"))]
    UnrecognizedId {
        /// The received ID
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    #[snafu(display("Invalid NMT state {value}"))]
    InvalidNmtState {
        /// The received value
        value: u8,
    },
}
