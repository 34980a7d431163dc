//! Error status tracking and emergency message production
//!
//! Errors are identified by status bit numbers (see
//! [`error_bits`](tincan_common::emcy::error_bits)). Reporting a bit that was clear queues an
//! emergency frame, and resetting a bit that was set queues a recovery frame with error code 0.
//! Repeated reports of an active error only update its additional info.
//!
//! The queue is drained by [`Emergency::process`], which respects the 0x1015 inhibit time and only
//! sends while the node is Pre-Operational or Operational.

use core::{cell::RefCell, ops::RangeInclusive};

use critical_section::Mutex;
use defmt_or_log::debug;
use heapless::Deque;
use tincan_common::{
    emcy::{
        error_bits, error_codes, error_register, is_critical, register_class, EmcyMessage,
        ERROR_STATUS_BITS,
    },
    messages::NmtState,
    objects::{ObjectCode, StorageClass, SubInfo},
    sdo::AbortCode,
};

use crate::{
    can_module::{CanLink, CanModule, TxHandle},
    object_dict::{copy_from_offset, decode_u16, decode_u8, ObjectAccess},
};

/// Number of messages waiting for transmission before new ones are lost
pub const EMCY_QUEUE_SIZE: usize = 10;
/// Number of entries kept in the pre-defined error field (0x1003)
pub const ERROR_HISTORY_SIZE: usize = 8;

const STATUS_BYTES: usize = ERROR_STATUS_BITS / 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueOverflow {
    None,
    /// Messages were dropped, the overflow error has not been raised yet
    Lost,
    /// The overflow error is active and will be reset once the queue drains
    Reported,
}

struct EmcyState {
    status: [u8; STATUS_BYTES],
    info: [u32; ERROR_STATUS_BITS],
    queue: Deque<EmcyMessage, EMCY_QUEUE_SIZE>,
    overflow: QueueOverflow,
    history: Deque<u32, ERROR_HISTORY_SIZE>,
    record_history: bool,
    node_id: u8,
    inhibit_100us: u16,
    inhibit_timer_us: u32,
}

impl EmcyState {
    const fn new() -> Self {
        Self {
            status: [0; STATUS_BYTES],
            info: [0; ERROR_STATUS_BITS],
            queue: Deque::new(),
            overflow: QueueOverflow::None,
            history: Deque::new(),
            record_history: true,
            node_id: 0,
            inhibit_100us: 0,
            inhibit_timer_us: u32::MAX,
        }
    }

    fn is_set(&self, bit: u8) -> bool {
        self.status[bit as usize / 8] & (1 << (bit % 8)) != 0
    }

    fn set_bit(&mut self, bit: u8, value: bool) {
        let mask = 1 << (bit % 8);
        if value {
            self.status[bit as usize / 8] |= mask;
        } else {
            self.status[bit as usize / 8] &= !mask;
        }
    }

    fn active_bits(&self) -> impl Iterator<Item = u8> + '_ {
        (0..ERROR_STATUS_BITS as u8).filter(|bit| self.is_set(*bit))
    }

    fn register(&self) -> u8 {
        let mut register = 0;
        for bit in self.active_bits() {
            register |= register_class(bit) | error_register::GENERIC;
        }
        register
    }

    fn enqueue(&mut self, msg: EmcyMessage) {
        if msg.code != error_codes::NO_ERROR && self.record_history {
            if self.history.is_full() {
                self.history.pop_back();
            }
            // Cannot fail, a slot was freed above
            let _ = self.history.push_front(msg.history_entry());
        }
        if self.queue.push_back(msg).is_err() {
            self.overflow = QueueOverflow::Lost;
        }
    }
}

/// The error registry and emergency producer of a node
#[allow(missing_debug_implementations)]
pub struct Emergency {
    state: Mutex<RefCell<EmcyState>>,
}

impl Default for Emergency {
    fn default() -> Self {
        Self::new()
    }
}

impl Emergency {
    /// Create an emergency producer with no active errors
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(EmcyState::new())),
        }
    }

    /// Set the node ID used for the EMCY COB-ID, and whether messages are recorded in 0x1003
    pub fn configure(&self, node_id: u8, record_history: bool) {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.node_id = node_id;
            state.record_history = record_history;
        });
    }

    /// Report an error condition
    ///
    /// On the first report of `bit` an emergency message with `code` is queued. Later reports
    /// while the bit is active only store `info`. A bit outside the status bitmap raises
    /// `WRONG_ERROR_REPORT` instead.
    pub fn report(&self, bit: u8, code: u16, info: u32) {
        let (bit, code, info) = if (bit as usize) < ERROR_STATUS_BITS {
            (bit, code, info)
        } else {
            (
                error_bits::WRONG_ERROR_REPORT,
                error_codes::SOFTWARE_INTERNAL,
                bit as u32,
            )
        };

        let raised = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.info[bit as usize] = info;
            if state.is_set(bit) {
                return false;
            }
            state.set_bit(bit, true);
            let register = state.register();
            state.enqueue(EmcyMessage {
                code,
                register,
                bit,
                info,
            });
            true
        });
        if raised {
            debug!("EMCY bit 0x{:x} raised, code 0x{:x}", bit, code);
        }
    }

    /// Clear an error condition
    ///
    /// Returns true if the bit was active. A recovery message is queued unless another active
    /// error belongs to the same error register class.
    pub fn reset(&self, bit: u8, info: u32) -> bool {
        if bit as usize >= ERROR_STATUS_BITS {
            return false;
        }
        let cleared = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if !state.is_set(bit) {
                return false;
            }
            state.set_bit(bit, false);
            state.info[bit as usize] = info;
            let class = register_class(bit);
            if !state.active_bits().any(|b| register_class(b) == class) {
                let register = state.register();
                state.enqueue(EmcyMessage {
                    code: error_codes::NO_ERROR,
                    register,
                    bit,
                    info,
                });
            }
            true
        });
        if cleared {
            debug!("EMCY bit 0x{:x} cleared", bit);
        }
        cleared
    }

    /// Returns true while `bit` is active
    pub fn is_error(&self, bit: u8) -> bool {
        if bit as usize >= ERROR_STATUS_BITS {
            return false;
        }
        critical_section::with(|cs| self.state.borrow_ref(cs).is_set(bit))
    }

    /// The additional info stored with the last report or reset of `bit`
    pub fn info(&self, bit: u8) -> Option<u32> {
        self.state_with(|state| state.info.get(bit as usize).copied())
    }

    /// The current value of the error register (0x1001)
    pub fn error_register(&self) -> u8 {
        self.state_with(|state| state.register())
    }

    /// Returns true if any active error prevents entering Operational
    pub fn has_critical_error(&self) -> bool {
        self.state_with(|state| state.active_bits().any(is_critical))
    }

    /// Returns true if any bit in `bits` is active
    pub fn any_active(&self, bits: RangeInclusive<u8>) -> bool {
        self.state_with(|state| state.active_bits().any(|b| bits.contains(&b)))
    }

    /// Drop every active bit in `bits` without queueing recovery messages
    ///
    /// Used when the objects which raised them are re-initialized.
    pub fn clear_bits(&self, bits: RangeInclusive<u8>) {
        self.state_with(|state| {
            for bit in bits.filter(|b| (*b as usize) < ERROR_STATUS_BITS) {
                state.set_bit(bit, false);
            }
        })
    }

    /// Number of entries in the pre-defined error field
    pub fn history_len(&self) -> usize {
        self.state_with(|state| state.history.len())
    }

    /// Read a pre-defined error field entry. Entry 0 is the newest.
    pub fn history_entry(&self, n: usize) -> Option<u32> {
        self.state_with(|state| state.history.iter().nth(n).copied())
    }

    /// Empty the pre-defined error field
    pub fn clear_history(&self) {
        self.state_with(|state| state.history.clear())
    }

    /// The 0x1015 inhibit time, in 100µs units
    pub fn inhibit_time(&self) -> u16 {
        self.state_with(|state| state.inhibit_100us)
    }

    /// Set the 0x1015 inhibit time, in 100µs units
    pub fn set_inhibit_time(&self, value: u16) {
        self.state_with(|state| state.inhibit_100us = value)
    }

    /// The COB-ID emergency messages are sent with
    pub fn cob_id(&self) -> u16 {
        self.state_with(|state| 0x80 + state.node_id as u16)
    }

    /// Number of messages waiting in the queue
    pub fn queued(&self) -> usize {
        self.state_with(|state| state.queue.len())
    }

    fn state_with<R>(&self, f: impl FnOnce(&mut EmcyState) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Send the next queued message if allowed
    ///
    /// Messages go out only in Pre-Operational or Operational, only once the inhibit time has
    /// passed since the previous message, and only when the EMCY transmit buffer is empty.
    pub fn process(
        &self,
        nmt_state: NmtState,
        elapsed_us: u32,
        can: &CanModule<'_>,
        tx: TxHandle,
        link: &mut dyn CanLink,
    ) {
        let msg = self.state_with(|state| {
            state.inhibit_timer_us = state.inhibit_timer_us.saturating_add(elapsed_us);
            if !nmt_state.is_pre_or_operational()
                || state.inhibit_timer_us < state.inhibit_100us as u32 * 100
                || can.is_full(tx)
            {
                return None;
            }
            let msg = state.queue.pop_front()?;
            state.inhibit_timer_us = 0;
            Some(msg)
        });
        if let Some(msg) = msg {
            // An overflow here is reported by the dispatch core itself
            let _ = can.send(tx, &msg.to_bytes(), link);
        }

        let overflow = self.state_with(|state| {
            if !state.queue.is_empty() {
                return None;
            }
            match state.overflow {
                QueueOverflow::None => None,
                QueueOverflow::Lost => {
                    state.overflow = QueueOverflow::Reported;
                    Some(true)
                }
                QueueOverflow::Reported => {
                    state.overflow = QueueOverflow::None;
                    Some(false)
                }
            }
        });
        match overflow {
            Some(true) => self.report(error_bits::EMERGENCY_BUFFER_FULL, error_codes::GENERIC, 0),
            Some(false) => {
                self.reset(error_bits::EMERGENCY_BUFFER_FULL, 0);
            }
            None => (),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EmcyObjectKind {
    ErrorRegister,
    History,
    CobId,
    InhibitTime,
}

/// Object dictionary access to the emergency objects
///
/// - 0x1001 error register
/// - 0x1003 pre-defined error field
/// - 0x1014 COB-ID EMCY
/// - 0x1015 inhibit time EMCY
#[allow(missing_debug_implementations)]
pub struct EmcyObject<'a> {
    emcy: &'a Emergency,
    kind: EmcyObjectKind,
}

impl<'a> EmcyObject<'a> {
    /// The 0x1001 error register object
    pub const fn error_register(emcy: &'a Emergency) -> Self {
        Self {
            emcy,
            kind: EmcyObjectKind::ErrorRegister,
        }
    }

    /// The 0x1003 pre-defined error field object
    pub const fn history(emcy: &'a Emergency) -> Self {
        Self {
            emcy,
            kind: EmcyObjectKind::History,
        }
    }

    /// The 0x1014 COB-ID object
    pub const fn cob_id(emcy: &'a Emergency) -> Self {
        Self {
            emcy,
            kind: EmcyObjectKind::CobId,
        }
    }

    /// The 0x1015 inhibit time object
    pub const fn inhibit_time(emcy: &'a Emergency) -> Self {
        Self {
            emcy,
            kind: EmcyObjectKind::InhibitTime,
        }
    }
}

impl ObjectAccess for EmcyObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        let mut bytes = [0u8; 4];
        let len = match self.kind {
            EmcyObjectKind::ErrorRegister => {
                bytes[0] = self.emcy.error_register();
                1
            }
            EmcyObjectKind::History if sub == 0 => {
                bytes[0] = self.emcy.history_len() as u8;
                1
            }
            EmcyObjectKind::History => {
                let entry = self
                    .emcy
                    .history_entry(sub as usize - 1)
                    .ok_or(AbortCode::NoData)?;
                bytes = entry.to_le_bytes();
                4
            }
            EmcyObjectKind::CobId => {
                bytes = (self.emcy.cob_id() as u32).to_le_bytes();
                4
            }
            EmcyObjectKind::InhibitTime => {
                bytes[..2].copy_from_slice(&self.emcy.inhibit_time().to_le_bytes());
                2
            }
        };
        Ok(copy_from_offset(&bytes[..len], offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.sub_info(sub)?.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        match self.kind {
            EmcyObjectKind::History => {
                if decode_u8(data)? != 0 {
                    return Err(AbortCode::InvalidValue);
                }
                self.emcy.clear_history();
            }
            EmcyObjectKind::InhibitTime => self.emcy.set_inhibit_time(decode_u16(data)?),
            _ => return Err(AbortCode::ReadOnly),
        }
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        match self.kind {
            EmcyObjectKind::History => ObjectCode::Array,
            _ => ObjectCode::Var,
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match (self.kind, sub) {
            (EmcyObjectKind::ErrorRegister, 0) => Ok(SubInfo::new_u8().ro_access()),
            (EmcyObjectKind::History, 0) => Ok(SubInfo::new_u8().rw_access()),
            (EmcyObjectKind::History, 1..=8) => Ok(SubInfo::new_u32().ro_access()),
            (EmcyObjectKind::CobId, 0) => Ok(SubInfo::new_u32().ro_access()),
            (EmcyObjectKind::InhibitTime, 0) => Ok(SubInfo::new_u16()
                .rw_access()
                .storage(StorageClass::Rom)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn max_sub_number(&self) -> u8 {
        match self.kind {
            EmcyObjectKind::History => ERROR_HISTORY_SIZE as u8,
            _ => 0,
        }
    }
}
