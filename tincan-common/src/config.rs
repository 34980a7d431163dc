//! Stack configuration
//!
//! Values here are fixed for the lifetime of a node. Communication parameters that CANopen makes
//! configurable over the network (heartbeat period, SYNC, PDOs) live in the object dictionary
//! instead.

/// Timing and sizing parameters for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "std", serde(default))]
pub struct StackConfig {
    /// Time the SDO server waits for the next client frame before aborting, in microseconds
    pub sdo_timeout_us: u32,
    /// Number of segments per block the SDO server accepts, 1..=127
    pub sdo_block_size: u8,
    /// Time the SDO client waits for a server response before aborting, in microseconds
    pub sdo_client_timeout_us: u32,
    /// Delay between the boot-up frame and the first periodic heartbeat, in milliseconds
    pub first_heartbeat_ms: u16,
    /// When set, emergency messages are recorded in the pre-defined error field (0x1003)
    pub emcy_record_history: bool,
    /// Minimum time between two storage flushes, in milliseconds
    pub storage_flush_ms: u32,
}

impl StackConfig {
    /// The default configuration
    pub const fn new() -> Self {
        Self {
            sdo_timeout_us: 25_000,
            sdo_block_size: 127,
            sdo_client_timeout_us: 500_000,
            first_heartbeat_ms: 0,
            emcy_record_history: true,
            storage_flush_ms: 1000,
        }
    }

    /// Set the SDO server timeout
    pub const fn with_sdo_timeout_us(mut self, value: u32) -> Self {
        self.sdo_timeout_us = value;
        self
    }

    /// Set the SDO server block size. Values outside 1..=127 are clamped.
    pub const fn with_sdo_block_size(mut self, value: u8) -> Self {
        self.sdo_block_size = if value == 0 {
            1
        } else if value > 127 {
            127
        } else {
            value
        };
        self
    }

    /// Set the SDO client timeout
    pub const fn with_sdo_client_timeout_us(mut self, value: u32) -> Self {
        self.sdo_client_timeout_us = value;
        self
    }

    /// Set the first heartbeat delay
    pub const fn with_first_heartbeat_ms(mut self, value: u16) -> Self {
        self.first_heartbeat_ms = value;
        self
    }

    /// Set the minimum storage flush interval
    pub const fn with_storage_flush_ms(mut self, value: u32) -> Self {
        self.storage_flush_ms = value;
        self
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_le;

    #[test]
    fn test_block_size_clamped() {
        assert_eq!(1, StackConfig::new().with_sdo_block_size(0).sdo_block_size);
        assert_eq!(127, StackConfig::new().with_sdo_block_size(200).sdo_block_size);
        assert_eq!(32, StackConfig::new().with_sdo_block_size(32).sdo_block_size);
        assert_le!(StackConfig::default().sdo_block_size, 127);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StackConfig = toml::from_str(
            r#"
            sdo_timeout_us = 100000
            storage_flush_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(100_000, config.sdo_timeout_us);
        assert_eq!(50, config.storage_flush_ms);
        assert_eq!(StackConfig::new().sdo_block_size, config.sdo_block_size);
    }
}
