//! Emergency messages, error codes and error status bits
//!
//! An emergency frame is 8 bytes:
//!
//! | byte | content |
//! |---|---|
//! | 0..2 | error code, little endian |
//! | 2 | error register (object 0x1001) |
//! | 3 | the error status bit that produced the message |
//! | 4..8 | additional info, little endian |
//!
//! The error status bits identify individual error conditions. The stack owns bits 0x00..=0x2F;
//! bits from 0x30 upwards are free for the application and count as manufacturer errors.

use crate::messages::MessageError;

/// Number of error status bits tracked by a node
pub const ERROR_STATUS_BITS: usize = 80;

/// Error status bit numbers used by the stack
pub mod error_bits {
    /// CAN bus warning limit reached
    pub const CAN_BUS_WARNING: u8 = 0x01;
    /// Wrong data length of a received CAN message
    pub const RXMSG_WRONG_LENGTH: u8 = 0x02;
    /// A received CAN message was overwritten before it was processed
    pub const RXMSG_OVERFLOW: u8 = 0x03;
    /// Wrong data length of a received PDO
    pub const RPDO_WRONG_LENGTH: u8 = 0x04;
    /// A received PDO was overwritten before it was processed
    pub const RPDO_OVERFLOW: u8 = 0x05;
    /// CAN receive bus is passive
    pub const CAN_RX_BUS_PASSIVE: u8 = 0x06;
    /// CAN transmit bus is passive
    pub const CAN_TX_BUS_PASSIVE: u8 = 0x07;
    /// Wrong NMT command received
    pub const NMT_WRONG_COMMAND: u8 = 0x08;
    /// CAN transmit bus is off
    pub const CAN_TX_BUS_OFF: u8 = 0x12;
    /// CAN receive buffer has overflowed
    pub const CAN_RXB_OVERFLOW: u8 = 0x13;
    /// CAN transmit buffer has overflowed
    pub const CAN_TX_OVERFLOW: u8 = 0x14;
    /// A synchronous TPDO missed the SYNC window
    pub const TPDO_OUTSIDE_WINDOW: u8 = 0x15;
    /// SYNC message timeout
    pub const SYNC_TIME_OUT: u8 = 0x18;
    /// Unexpected SYNC data length
    pub const SYNC_LENGTH: u8 = 0x19;
    /// Error with PDO mapping
    pub const PDO_WRONG_MAPPING: u8 = 0x1A;
    /// Heartbeat consumer timeout
    pub const HEARTBEAT_CONSUMER: u8 = 0x1B;
    /// Heartbeat consumer detected a remote node reset
    pub const HEARTBEAT_CONSUMER_REMOTE_RESET: u8 = 0x1C;
    /// The emergency queue was full and messages were lost
    pub const EMERGENCY_BUFFER_FULL: u8 = 0x20;
    /// The microcontroller has just started
    pub const MICROCONTROLLER_RESET: u8 = 0x22;
    /// An error was reported with an invalid status bit
    pub const WRONG_ERROR_REPORT: u8 = 0x28;
    /// Timer task overflow
    pub const ISR_TIMER_OVERFLOW: u8 = 0x29;
    /// Unable to allocate memory for objects
    pub const MEMORY_ALLOCATION_ERROR: u8 = 0x2A;
    /// Generic error
    pub const GENERIC_ERROR: u8 = 0x2B;
    /// Mainline function exceeded its maximum execution time
    pub const MAIN_TIMER_OVERFLOW: u8 = 0x2C;
    /// The object dictionary does not match the software
    pub const INCONSISTENT_OBJECT_DICTIONARY: u8 = 0x2D;
    /// Error calculating device parameters
    pub const CALCULATION_OF_PARAMETERS: u8 = 0x2E;
    /// Error accessing non-volatile memory
    pub const NON_VOLATILE_MEMORY: u8 = 0x2F;
    /// The first status bit available to the application
    pub const MANUFACTURER_START: u8 = 0x30;
}

/// Standard emergency error codes
pub mod error_codes {
    /// Error reset or no error
    pub const NO_ERROR: u16 = 0x0000;
    /// Generic error
    pub const GENERIC: u16 = 0x1000;
    /// Current
    pub const CURRENT: u16 = 0x2000;
    /// Voltage
    pub const VOLTAGE: u16 = 0x3000;
    /// Temperature
    pub const TEMPERATURE: u16 = 0x4000;
    /// Device hardware
    pub const HARDWARE: u16 = 0x5000;
    /// Device software
    pub const SOFTWARE_DEVICE: u16 = 0x6000;
    /// Internal software
    pub const SOFTWARE_INTERNAL: u16 = 0x6100;
    /// User software
    pub const SOFTWARE_USER: u16 = 0x6200;
    /// Data set
    pub const DATA_SET: u16 = 0x6300;
    /// Monitoring
    pub const MONITORING: u16 = 0x8000;
    /// Communication
    pub const COMMUNICATION: u16 = 0x8100;
    /// CAN overrun, objects lost
    pub const CAN_OVERRUN: u16 = 0x8110;
    /// CAN in error passive mode
    pub const CAN_PASSIVE: u16 = 0x8120;
    /// Life guard or heartbeat error
    pub const HEARTBEAT: u16 = 0x8130;
    /// Recovered from bus off
    pub const BUS_OFF_RECOVERED: u16 = 0x8140;
    /// CAN-ID collision
    pub const CAN_ID_COLLISION: u16 = 0x8150;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 0x8200;
    /// PDO not processed due to length error
    pub const PDO_LENGTH: u16 = 0x8210;
    /// PDO length exceeded
    pub const PDO_LENGTH_EXC: u16 = 0x8220;
    /// Unexpected SYNC data length
    pub const SYNC_DATA_LENGTH: u16 = 0x8240;
    /// RPDO timeout
    pub const RPDO_TIMEOUT: u16 = 0x8250;
    /// External error
    pub const EXTERNAL_ERROR: u16 = 0x9000;
    /// Additional functions
    pub const ADDITIONAL_FUNC: u16 = 0xF000;
    /// Device specific
    pub const DEVICE_SPECIFIC: u16 = 0xFF00;
}

/// Error register (0x1001) bits
pub mod error_register {
    /// Set while any error is active
    pub const GENERIC: u8 = 0x01;
    /// Current
    pub const CURRENT: u8 = 0x02;
    /// Voltage
    pub const VOLTAGE: u8 = 0x04;
    /// Temperature
    pub const TEMPERATURE: u8 = 0x08;
    /// Communication error (overrun, error state)
    pub const COMMUNICATION: u8 = 0x10;
    /// Device profile specific
    pub const DEVICE_PROFILE: u8 = 0x20;
    /// Manufacturer specific
    pub const MANUFACTURER: u8 = 0x80;
}

/// The error register class bit an error status bit belongs to
pub const fn register_class(bit: u8) -> u8 {
    match bit {
        0x00..=0x1F => error_register::COMMUNICATION,
        0x20..=0x2F => error_register::GENERIC,
        _ => error_register::MANUFACTURER,
    }
}

/// Returns true for status bits which prevent a node from entering Operational
pub const fn is_critical(bit: u8) -> bool {
    matches!(bit, 0x10..=0x1F | 0x28..=0x2F)
}

/// An emergency message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmcyMessage {
    /// The emergency error code
    pub code: u16,
    /// The error register at the time of the event
    pub register: u8,
    /// The status bit which raised or cleared the error
    pub bit: u8,
    /// Additional application info
    pub info: u32,
}

impl EmcyMessage {
    /// Encode the payload
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0..2].copy_from_slice(&self.code.to_le_bytes());
        bytes[2] = self.register;
        bytes[3] = self.bit;
        bytes[4..8].copy_from_slice(&self.info.to_le_bytes());
        bytes
    }

    /// The value stored in the pre-defined error field for this message
    pub fn history_entry(&self) -> u32 {
        self.code as u32 | ((self.register as u32) << 16)
    }
}

impl TryFrom<&[u8]> for EmcyMessage {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 {
            return Err(MessageError::WrongLength {
                expected: 8,
                actual: value.len() as u8,
            });
        }
        Ok(EmcyMessage {
            code: u16::from_le_bytes([value[0], value[1]]),
            register: value[2],
            bit: value[3],
            info: u32::from_le_bytes([value[4], value[5], value[6], value[7]]),
        })
    }
}
