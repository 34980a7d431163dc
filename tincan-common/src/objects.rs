//! Object metadata
//!
//! Types describing the shape of object dictionary entries: object codes, data types, access and
//! PDO mapping rules, and the storage class which decides whether a sub object is saved.

/// A container for the address of a sub object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

/// Object Code value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ObjectCode {
    /// An empty object
    Null = 0,
    /// A large chunk of data
    Domain = 2,
    /// Unused
    DefType = 5,
    /// Unused
    DefStruct = 6,
    /// An object which has a single sub object
    #[default]
    Var = 7,
    /// An array of sub-objects all with the same data type
    Array = 8,
    /// A collection of sub-objects with varying types
    Record = 9,
}

/// Access type enum
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and never changed even internally by the device
    Const,
}

impl AccessType {
    /// Returns true if an object with this access type can be read
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if an object with this access type can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Rw | AccessType::Wo)
    }
}

/// Possible PDO mapping values for an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoMapping {
    /// Object cannot be mapped to PDOs
    #[default]
    None,
    /// Object can be mapped to RPDOs only
    Rpdo,
    /// Object can be mapped to TPDOs only
    Tpdo,
    /// Object can be mapped to both RPDOs and TPDOs
    Both,
}

impl PdoMapping {
    /// Returns true if the object may be mapped into an RPDO
    pub fn supports_rpdo(&self) -> bool {
        matches!(self, PdoMapping::Rpdo | PdoMapping::Both)
    }

    /// Returns true if the object may be mapped into a TPDO
    pub fn supports_tpdo(&self) -> bool {
        matches!(self, PdoMapping::Tpdo | PdoMapping::Both)
    }
}

/// Where the value of a sub object lives across resets
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageClass {
    /// Volatile. Lost on reset and never saved.
    #[default]
    Ram,
    /// Saved to the storage backend when a save command is written to 0x1010
    Rom,
    /// Saved automatically whenever the value is written through SDO
    Retentive,
}

impl StorageClass {
    /// Returns true if sub objects of this class are written to storage
    pub fn is_persisted(&self) -> bool {
        !matches!(self, StorageClass::Ram)
    }
}

/// Indicate the type of data stored in an object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
#[allow(missing_docs)]
pub enum DataType {
    Boolean = 1,
    #[default]
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    Real32 = 8,
    VisibleString = 9,
    OctetString = 0xa,
    UnicodeString = 0xb,
    TimeOfDay = 0xc,
    TimeDifference = 0xd,
    Domain = 0xf,
    Other(u16),
}

impl From<u16> for DataType {
    fn from(value: u16) -> Self {
        use DataType::*;
        match value {
            1 => Boolean,
            2 => Int8,
            3 => Int16,
            4 => Int32,
            5 => UInt8,
            6 => UInt16,
            7 => UInt32,
            8 => Real32,
            9 => VisibleString,
            0xa => OctetString,
            0xb => UnicodeString,
            0xc => TimeOfDay,
            0xd => TimeDifference,
            0xf => Domain,
            _ => Other(value),
        }
    }
}

impl DataType {
    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }

    /// The size of a dummy mapping entry for this type, in bits
    ///
    /// Only indices 1..=7 may appear as dummy entries in a PDO mapping.
    pub fn dummy_bits(index: u16) -> Option<u8> {
        match index {
            1 => Some(1),
            2 | 5 => Some(8),
            3 | 6 => Some(16),
            4 | 7 => Some(32),
            _ => None,
        }
    }
}

/// Information about a sub object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubInfo {
    /// The size (or max size) of this sub object, in bytes
    pub size: usize,
    /// The data type of this sub object
    pub data_type: DataType,
    /// Indicates what accesses (i.e. read/write) are allowed on this sub object
    pub access_type: AccessType,
    /// Indicates whether this sub may be mapped to PDOs
    pub pdo_mapping: PdoMapping,
    /// Whether and when this sub object is saved
    pub storage: StorageClass,
}

impl SubInfo {
    /// A shorthand value for sub0 on record and array objects
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        pdo_mapping: PdoMapping::None,
        storage: StorageClass::Ram,
    };

    const fn new_scalar(size: usize, data_type: DataType) -> Self {
        Self {
            size,
            data_type,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            storage: StorageClass::Ram,
        }
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_bool() -> Self {
        Self::new_scalar(1, DataType::Boolean)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u32() -> Self {
        Self::new_scalar(4, DataType::UInt32)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u16() -> Self {
        Self::new_scalar(2, DataType::UInt16)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_u8() -> Self {
        Self::new_scalar(1, DataType::UInt8)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i32() -> Self {
        Self::new_scalar(4, DataType::Int32)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i16() -> Self {
        Self::new_scalar(2, DataType::Int16)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_i8() -> Self {
        Self::new_scalar(1, DataType::Int8)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_f32() -> Self {
        Self::new_scalar(4, DataType::Real32)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_visible_str(size: usize) -> Self {
        Self::new_scalar(size, DataType::VisibleString)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_octet_str(size: usize) -> Self {
        Self::new_scalar(size, DataType::OctetString)
    }

    /// Convenience function for creating a new sub-info by type
    pub const fn new_domain(size: usize) -> Self {
        Self::new_scalar(size, DataType::Domain)
    }

    /// Convenience function to set the access_type to read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }

    /// Convenience function to set the access_type to read-write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }

    /// Convenience function to set the access_type to const
    pub const fn const_access(mut self) -> Self {
        self.access_type = AccessType::Const;
        self
    }

    /// Convenience function to set the access_type to write-only
    pub const fn wo_access(mut self) -> Self {
        self.access_type = AccessType::Wo;
        self
    }

    /// Convenience function to set the PDO mapping
    pub const fn mapping(mut self, value: PdoMapping) -> Self {
        self.pdo_mapping = value;
        self
    }

    /// Convenience function to set the storage class
    pub const fn storage(mut self, value: StorageClass) -> Self {
        self.storage = value;
        self
    }

    /// The size of the sub object in bits, for PDO mapping length checks
    pub const fn bit_size(&self) -> usize {
        match self.data_type {
            DataType::Boolean => 1,
            _ => self.size * 8,
        }
    }
}
