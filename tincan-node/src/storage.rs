//! Store and restore commands, 0x1010 and 0x1011
//!
//! Writing the "save" signature to 0x1010 only marks a region dirty. The node writes dirty regions
//! to the [`StorageBackend`] from its main loop, at most once per
//! [`StackConfig::storage_flush_ms`](tincan_common::StackConfig), so an SDO transfer never waits
//! on flash. Writing "load" to 0x1011 asks the backend to restore defaults, which take effect
//! after the next reset.

use core::convert::Infallible;

use defmt_or_log::{debug, warn};
use snafu::Snafu;
use tincan_common::{
    constants::values::{LOAD_CMD, SAVE_CMD},
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::object_dict::{copy_from_offset, decode_u32, AccessHook, ObjectAccess};

/// A group of objects which are stored together
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StorageRegion {
    /// Every persisted object
    All = 1,
    /// Communication objects, 0x1000..=0x1FFF
    Communication = 2,
    /// Application objects, 0x2000 and up
    Application = 3,
}

impl StorageRegion {
    /// The region selected by a sub index of 0x1010 or 0x1011
    pub fn from_sub(sub: u8) -> Option<Self> {
        match sub {
            1 => Some(Self::All),
            2 => Some(Self::Communication),
            3 => Some(Self::Application),
            _ => None,
        }
    }

    /// Returns true if the object at `index` belongs to this region
    pub fn contains(&self, index: u16) -> bool {
        match self {
            Self::All => true,
            Self::Communication => (0x1000..=0x1FFF).contains(&index),
            Self::Application => index >= 0x2000,
        }
    }

    /// The region holding the object at `index`
    pub fn of_index(index: u16) -> Self {
        if index < 0x2000 {
            Self::Communication
        } else {
            Self::Application
        }
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Errors reported by a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// The data could not be written
    #[snafu(display("Failed to write the {region:?} region"))]
    WriteFailed {
        /// The region being written
        region: StorageRegion,
    },
    /// The backend has no room for the data
    #[snafu(display("{size} bytes do not fit in storage"))]
    NoSpace {
        /// The size of the serialized objects
        size: usize,
    },
    /// The stored data does not match what was written
    VerifyFailed,
}

/// Non-volatile storage provided by the application
pub trait StorageBackend {
    /// Store the serialized objects of `region`
    ///
    /// `size` is the total number of bytes `reader` will return.
    fn store(
        &mut self,
        region: StorageRegion,
        reader: &mut dyn embedded_io::Read<Error = Infallible>,
        size: usize,
    ) -> Result<(), StorageError>;

    /// Erase the stored objects of `region`, so that defaults are used after the next reset
    fn restore_defaults(&mut self, region: StorageRegion) -> Result<(), StorageError>;

    /// Check the stored data
    fn verify(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Tracks pending store and restore requests
#[derive(Debug)]
pub struct StorageControl {
    backend_present: AtomicCell<bool>,
    dirty: AtomicCell<u8>,
    restore: AtomicCell<u8>,
    since_flush_us: AtomicCell<u32>,
}

impl Default for StorageControl {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageControl {
    /// Create a control block with nothing pending
    pub const fn new() -> Self {
        Self {
            backend_present: AtomicCell::new(false),
            dirty: AtomicCell::new(0),
            restore: AtomicCell::new(0),
            since_flush_us: AtomicCell::new(0),
        }
    }

    /// Record whether a backend is available
    pub fn set_backend_present(&self, present: bool) {
        self.backend_present.store(present);
    }

    /// Returns true when a backend is available
    pub fn has_backend(&self) -> bool {
        self.backend_present.load()
    }

    /// Request a store of `region`
    pub fn mark_dirty(&self, region: StorageRegion) {
        let _ = self.dirty.fetch_update(|d| Some(d | region.bit()));
    }

    /// Forget pending store requests
    pub fn clear_dirty(&self) {
        self.dirty.store(0);
    }

    /// Request a restore of the defaults of `region`
    pub fn request_restore(&self, region: StorageRegion) {
        let _ = self.restore.fetch_update(|d| Some(d | region.bit()));
    }

    /// Returns true if `region` is waiting to be stored
    pub fn is_dirty(&self, region: StorageRegion) -> bool {
        self.dirty.load() & region.bit() != 0
    }

    /// Take the pending restore requests
    pub fn take_restore(&self) -> RegionSet {
        RegionSet(self.restore.swap(0))
    }

    /// Take the regions due for storing
    ///
    /// Regions are returned once `flush_ms` have passed since the previous flush.
    pub fn take_due(&self, elapsed_us: u32, flush_ms: u32) -> RegionSet {
        let mut since = 0;
        let _ = self.since_flush_us.fetch_update(|t| {
            since = t.saturating_add(elapsed_us);
            Some(since)
        });
        if since < flush_ms.saturating_mul(1000) || self.dirty.load() == 0 {
            return RegionSet(0);
        }
        self.since_flush_us.store(0);
        RegionSet(self.dirty.swap(0))
    }
}

/// A set of storage regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSet(u8);

impl RegionSet {
    /// Returns true if no region is in the set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The regions to act on
    ///
    /// `All` covers the other two, so they are skipped when it is present.
    pub fn iter(&self) -> impl Iterator<Item = StorageRegion> + '_ {
        let all = self.0 & StorageRegion::All.bit() != 0;
        [
            StorageRegion::All,
            StorageRegion::Communication,
            StorageRegion::Application,
        ]
        .into_iter()
        .filter(move |r| self.0 & r.bit() != 0 && (!all || *r == StorageRegion::All))
    }
}

/// An [`AccessHook`] which schedules a store of its region after every write
///
/// Wrap retentive objects in a [`HookedObject`](crate::object_dict::HookedObject) with this hook
/// to have them saved without a 0x1010 command.
#[derive(Debug, Clone, Copy)]
pub struct StoreOnWrite<'a> {
    control: &'a StorageControl,
    region: StorageRegion,
}

impl<'a> StoreOnWrite<'a> {
    /// Store `region` whenever the hooked object changes
    pub const fn new(control: &'a StorageControl, region: StorageRegion) -> Self {
        Self { control, region }
    }
}

impl AccessHook for StoreOnWrite<'_> {
    fn before_write(&self, _sub: u8, _data: &[u8]) -> Result<(), AbortCode> {
        Ok(())
    }

    fn after_write(&self, sub: u8) {
        debug!("Write to hooked sub {} marks {:?} dirty", sub, self.region);
        self.control.mark_dirty(self.region);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StorageCommand {
    Save,
    Restore,
}

/// The 0x1010 store parameters and 0x1011 restore defaults objects
#[derive(Debug)]
pub struct StorageObject<'a> {
    control: &'a StorageControl,
    command: StorageCommand,
}

impl<'a> StorageObject<'a> {
    /// Create the 0x1010 object
    pub const fn save(control: &'a StorageControl) -> Self {
        Self {
            control,
            command: StorageCommand::Save,
        }
    }

    /// Create the 0x1011 object
    pub const fn restore(control: &'a StorageControl) -> Self {
        Self {
            control,
            command: StorageCommand::Restore,
        }
    }
}

impl ObjectAccess for StorageObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        if sub == 0 {
            return Ok(copy_from_offset(&[3], offset, buf));
        }
        // Bit 0: the command is supported
        let value = self.control.has_backend() as u32;
        Ok(copy_from_offset(&value.to_le_bytes(), offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.sub_info(sub)?.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let region = StorageRegion::from_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        let value = decode_u32(data)?;
        let expected = match self.command {
            StorageCommand::Save => SAVE_CMD,
            StorageCommand::Restore => LOAD_CMD,
        };
        if value != expected {
            warn!("Bad storage command signature 0x{:x}", value);
            return Err(AbortCode::CantStore);
        }
        if !self.control.has_backend() {
            return Err(AbortCode::CantStore);
        }
        debug!("Storage command for region {}", region as u8);
        match self.command {
            StorageCommand::Save => self.control.mark_dirty(region),
            StorageCommand::Restore => self.control.request_restore(region),
        }
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1..=3 => Ok(SubInfo::new_u32().rw_access()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}
