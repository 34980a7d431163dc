//! Constants defining standard object and special values

/// Object indices for standard objects
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// Pre-defined error field (error history)
    pub const ERROR_HISTORY: u16 = 0x1003;
    /// COB-ID SYNC message
    pub const SYNC_COB_ID: u16 = 0x1005;
    /// Communication cycle period
    pub const SYNC_PERIOD: u16 = 0x1006;
    /// Synchronous window length
    pub const SYNC_WINDOW: u16 = 0x1007;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Store parameters command object
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// COB-ID EMCY
    pub const EMCY_COB_ID: u16 = 0x1014;
    /// Inhibit time EMCY
    pub const EMCY_INHIBIT_TIME: u16 = 0x1015;
    /// Consumer heartbeat time
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// Synchronous counter overflow value
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
    /// Error behavior
    pub const ERROR_BEHAVIOR: u16 = 0x1029;
    /// SDO server parameter
    pub const SDO_SERVER_PARAMETER: u16 = 0x1200;
    /// SDO client parameter
    pub const SDO_CLIENT_PARAMETER: u16 = 0x1280;
    /// First RPDO communication parameter
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
    /// NMT startup behavior
    pub const NMT_STARTUP: u16 = 0x1F80;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value written to 0x1010 to store parameters. ASCII "save" in little-endian.
    pub const SAVE_CMD: u32 = 0x6576_6173;
    /// Magic value written to 0x1011 to restore default parameters. ASCII "load" in little-endian.
    pub const LOAD_CMD: u32 = 0x6461_6F6C;
    /// COB-ID bit marking a PDO, or a producer, as invalid
    pub const COB_ID_INVALID: u32 = 1 << 31;
    /// COB-ID bit for the SYNC producer role, or for "no RTR" on TPDOs
    pub const COB_ID_BIT30: u32 = 1 << 30;
    /// COB-ID bit selecting a 29-bit frame
    pub const COB_ID_EXTENDED: u32 = 1 << 29;
    /// NMT startup bit: when clear, the node goes operational by itself after boot-up
    pub const NMT_STARTUP_NO_AUTOSTART: u32 = 1 << 2;
}
