use core::cell::Cell;

use critical_section::Mutex;
use tincan_common::AtomicCell;

/// Shared bank selector for the event flags of every object
///
/// Each [`ObjectFlags`] holds two banks. The application sets flags in the active bank while the
/// TPDO engine reads the other one. [`ObjectFlagSync::toggle`] swaps the banks once per process
/// tick, so reads never race a half finished update.
#[derive(Debug)]
pub struct ObjectFlagSync {
    inner: Mutex<Cell<FlagBank>>,
}

#[derive(Clone, Copy, Debug, Default)]
struct FlagBank {
    toggle: bool,
    any_set: bool,
}

impl Default for ObjectFlagSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectFlagSync {
    /// Create a new ObjectFlagSync
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(FlagBank {
                toggle: false,
                any_set: false,
            })),
        }
    }

    /// Swap banks. Returns true if any flag was set since the previous toggle.
    pub fn toggle(&self) -> bool {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let bank = cell.get();
            cell.set(FlagBank {
                toggle: !bank.toggle,
                any_set: false,
            });
            bank.any_set
        })
    }

    /// Get the bank selector, optionally recording that a flag is being set
    pub fn get_flag(&self, setting: bool) -> bool {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            let mut bank = cell.get();
            bank.any_set |= setting;
            cell.set(bank);
            bank.toggle
        })
    }
}

/// Access to the per sub object event flags of an object
pub trait ObjectFlagAccess: Sync + Send {
    /// Set the flag of `sub` in the active bank
    fn set_flag(&self, sub: u8);
    /// Read the flag of `sub` from the bank which was active before the last toggle
    fn get_flag(&self, sub: u8) -> bool;
    /// Clear the readable bank
    fn clear(&self);
}

/// Event flags for up to `N * 8` sub objects
#[allow(missing_debug_implementations)]
pub struct ObjectFlags<const N: usize> {
    sync: &'static ObjectFlagSync,
    banks: [AtomicCell<[u8; N]>; 2],
}

impl<const N: usize> ObjectFlags<N> {
    /// Create a new ObjectFlags
    pub const fn new(sync: &'static ObjectFlagSync) -> Self {
        Self {
            sync,
            banks: [AtomicCell::new([0; N]), AtomicCell::new([0; N])],
        }
    }

    fn bank(&self, write: bool) -> &AtomicCell<[u8; N]> {
        let toggle = self.sync.get_flag(write);
        // Writers use the bank selected by the toggle, readers the other one
        &self.banks[(toggle ^ !write) as usize]
    }
}

impl<const N: usize> ObjectFlagAccess for ObjectFlags<N> {
    fn set_flag(&self, sub: u8) {
        if sub as usize >= N * 8 {
            return;
        }
        // The closure always returns Some, so the update cannot fail
        let _ = self.bank(true).fetch_update(|mut flags| {
            flags[sub as usize / 8] |= 1 << (sub & 7);
            Some(flags)
        });
    }

    fn get_flag(&self, sub: u8) -> bool {
        if sub as usize >= N * 8 {
            return false;
        }
        self.bank(false).load()[sub as usize / 8] & (1 << (sub & 7)) != 0
    }

    fn clear(&self) {
        self.bank(false).store([0; N]);
    }
}
