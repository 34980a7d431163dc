//! SYNC producer and consumer
//!
//! The SYNC service tracks the time since the last SYNC frame and derives the synchronous window
//! from it. The window flag lives in a [`SyncWindow`] shared with the dispatch core, which refuses
//! synchronous frames while it is closed, and with the RPDOs, which use its toggle to pick the
//! buffer to apply.

use core::cell::RefCell;

use critical_section::Mutex;
use defmt_or_log::warn;
use tincan_common::{
    constants::values::{COB_ID_BIT30, COB_ID_EXTENDED},
    emcy::{error_bits, error_codes},
    messages::NmtState,
    objects::{ObjectCode, StorageClass, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanId, CanMessage,
};

use crate::{
    can_module::{CanLink, CanModule, CanRxHandler, TxHandle},
    emergency::Emergency,
    object_dict::{copy_from_offset, decode_u32, decode_u8, ObjectAccess},
};

/// The synchronous window flag and the RPDO buffer selector
///
/// The window is open while the time since the last SYNC is within the 0x1007 window length.
#[derive(Debug)]
pub struct SyncWindow {
    open: AtomicCell<bool>,
    rpdo_toggle: AtomicCell<bool>,
}

impl Default for SyncWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncWindow {
    /// Create an open window
    pub const fn new() -> Self {
        Self {
            open: AtomicCell::new(true),
            rpdo_toggle: AtomicCell::new(false),
        }
    }

    /// Returns true while synchronous frames may be sent
    pub fn is_open(&self) -> bool {
        self.open.load()
    }

    /// Open or close the window
    pub fn set_open(&self, open: bool) {
        self.open.store(open);
    }

    /// The receive buffer RPDOs currently write into
    pub fn rpdo_toggle(&self) -> bool {
        self.rpdo_toggle.load()
    }

    pub(crate) fn flip_rpdo_toggle(&self) {
        // The closure always returns Some
        let _ = self.rpdo_toggle.fetch_update(|t| Some(!t));
    }
}

/// The result of one SYNC process step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncEvent {
    /// Nothing happened
    None,
    /// A SYNC was received or produced
    Sync,
    /// The synchronous window just closed
    WindowClosed,
}

#[derive(Clone, Copy, Debug)]
struct SyncTiming {
    timer_us: u32,
    counter: u8,
    timeout_reported: bool,
}

/// The SYNC service of a node
#[allow(missing_debug_implementations)]
pub struct SyncService<'a> {
    window: &'a SyncWindow,
    emcy: &'a Emergency,
    cob_id: AtomicCell<u32>,
    period_us: AtomicCell<u32>,
    window_us: AtomicCell<u32>,
    overflow: AtomicCell<u8>,
    /// Counter value of a received SYNC waiting for `process`
    received: AtomicCell<Option<u8>>,
    config_changed: AtomicCell<bool>,
    timing: Mutex<RefCell<SyncTiming>>,
}

impl<'a> SyncService<'a> {
    /// Create a SYNC consumer on the default COB-ID 0x80
    pub const fn new(window: &'a SyncWindow, emcy: &'a Emergency) -> Self {
        Self {
            window,
            emcy,
            cob_id: AtomicCell::new(0x80),
            period_us: AtomicCell::new(0),
            window_us: AtomicCell::new(0),
            overflow: AtomicCell::new(0),
            received: AtomicCell::new(None),
            config_changed: AtomicCell::new(false),
            timing: Mutex::new(RefCell::new(SyncTiming {
                timer_us: 0,
                counter: 0,
                timeout_reported: false,
            })),
        }
    }

    /// The shared window flag
    pub fn window(&self) -> &'a SyncWindow {
        self.window
    }

    /// The 11-bit identifier SYNC frames use
    pub fn can_id(&self) -> u16 {
        (self.cob_id.load() & 0x7FF) as u16
    }

    /// Returns true when this node produces SYNC
    pub fn is_producer(&self) -> bool {
        self.cob_id.load() & COB_ID_BIT30 != 0
    }

    /// The payload length of SYNC frames: 1 with a counter, otherwise 0
    pub fn frame_len(&self) -> u8 {
        (self.overflow.load() != 0) as u8
    }

    /// The counter carried by the most recent SYNC, or 0 without a counter
    pub fn counter(&self) -> u8 {
        critical_section::with(|cs| self.timing.borrow_ref(cs).counter)
    }

    /// The communication cycle period in µs
    pub fn period_us(&self) -> u32 {
        self.period_us.load()
    }

    /// Returns true once after a configuration change which affects filters or buffers
    pub fn take_config_changed(&self) -> bool {
        self.config_changed.swap(false)
    }

    /// Set the 0x1005 COB-ID, bypassing validation
    pub fn set_cob_id(&self, value: u32) {
        self.cob_id.store(value);
        self.config_changed.store(true);
    }

    /// Set the 0x1006 period
    pub fn set_period_us(&self, value: u32) {
        self.period_us.store(value);
    }

    /// Set the 0x1007 window length
    pub fn set_window_us(&self, value: u32) {
        self.window_us.store(value);
    }

    /// Reset the timer and counter, as on a communication reset
    pub fn reset(&self) {
        self.received.store(None);
        self.window.set_open(true);
        critical_section::with(|cs| {
            *self.timing.borrow_ref_mut(cs) = SyncTiming {
                timer_us: 0,
                counter: 0,
                timeout_reported: false,
            }
        });
    }

    /// Advance the SYNC timers
    ///
    /// A producer sends a SYNC through `tx` whenever the period expires. Returns
    /// [`SyncEvent::Sync`] on every received or produced SYNC, and [`SyncEvent::WindowClosed`]
    /// when the synchronous window closes.
    pub fn process(
        &self,
        nmt_state: NmtState,
        elapsed_us: u32,
        can: &CanModule<'_>,
        tx: Option<TxHandle>,
        link: &mut dyn CanLink,
    ) -> SyncEvent {
        if !nmt_state.is_pre_or_operational() {
            self.reset();
            return SyncEvent::None;
        }

        let period = self.period_us.load();
        let window = self.window_us.load();
        let overflow = self.overflow.load();
        let producer = self.is_producer();
        let received = self.received.take();

        let mut produced = None;
        let (event, timed_out, recovered) = critical_section::with(|cs| {
            let mut timing = self.timing.borrow_ref_mut(cs);
            timing.timer_us = timing.timer_us.saturating_add(elapsed_us);
            let mut event = SyncEvent::None;

            if producer && period != 0 && timing.timer_us >= period {
                timing.timer_us -= period;
                if overflow != 0 {
                    timing.counter = if timing.counter >= overflow {
                        1
                    } else {
                        timing.counter + 1
                    };
                }
                produced = Some(timing.counter);
                event = SyncEvent::Sync;
            }

            if let Some(counter) = received {
                timing.timer_us = 0;
                timing.counter = counter;
                event = SyncEvent::Sync;
            }

            let mut recovered = false;
            if event == SyncEvent::Sync {
                self.window.flip_rpdo_toggle();
                self.window.set_open(true);
                recovered = core::mem::take(&mut timing.timeout_reported);
            } else if window != 0 && timing.timer_us > window && self.window.is_open() {
                self.window.set_open(false);
                event = SyncEvent::WindowClosed;
            }

            let limit = period.saturating_add(period / 2);
            let timed_out = period != 0
                && !producer
                && nmt_state == NmtState::Operational
                && timing.timer_us > limit
                && !timing.timeout_reported;
            if timed_out {
                timing.timeout_reported = true;
            }
            (event, timed_out, recovered)
        });

        if let (Some(counter), Some(tx)) = (produced, tx) {
            let data = [counter];
            let _ = can.send(tx, &data[..self.frame_len() as usize], link);
        }
        if timed_out {
            warn!("SYNC timeout");
            self.emcy
                .report(error_bits::SYNC_TIME_OUT, error_codes::COMMUNICATION, 0);
        }
        if recovered {
            self.emcy.reset(error_bits::SYNC_TIME_OUT, 0);
        }
        if received.is_some() {
            self.emcy.reset(error_bits::SYNC_LENGTH, 0);
        }
        event
    }

    fn write_cob_id(&self, value: u32) -> Result<(), AbortCode> {
        if value & COB_ID_EXTENDED != 0 {
            return Err(AbortCode::InvalidValue);
        }
        let current = self.cob_id.load();
        if value & COB_ID_BIT30 != 0
            && current & COB_ID_BIT30 != 0
            && (value & 0x7FF) != (current & 0x7FF)
        {
            return Err(AbortCode::CantStoreDeviceState);
        }
        self.set_cob_id(value);
        Ok(())
    }

    fn write_overflow(&self, value: u8) -> Result<(), AbortCode> {
        if value == 1 || value > 240 {
            return Err(AbortCode::InvalidValue);
        }
        if self.period_us.load() != 0 {
            return Err(AbortCode::CantStoreDeviceState);
        }
        self.overflow.store(value);
        self.config_changed.store(true);
        Ok(())
    }
}

impl CanRxHandler for SyncService<'_> {
    fn handle_frame(&self, msg: &CanMessage) {
        if msg.dlc != self.frame_len() {
            self.emcy.report(
                error_bits::SYNC_LENGTH,
                error_codes::SYNC_DATA_LENGTH,
                msg.dlc as u32,
            );
            return;
        }
        self.received
            .store(Some(msg.data().first().copied().unwrap_or(0)));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncObjectKind {
    CobId,
    Period,
    Window,
    CounterOverflow,
}

/// Object dictionary access to the SYNC parameters
///
/// - 0x1005 COB-ID SYNC. Bit 30 makes this node the producer.
/// - 0x1006 communication cycle period, µs
/// - 0x1007 synchronous window length, µs
/// - 0x1019 synchronous counter overflow value
#[allow(missing_debug_implementations)]
pub struct SyncObject<'a> {
    sync: &'a SyncService<'a>,
    kind: SyncObjectKind,
}

impl<'a> SyncObject<'a> {
    /// The 0x1005 COB-ID object
    pub const fn cob_id(sync: &'a SyncService<'a>) -> Self {
        Self {
            sync,
            kind: SyncObjectKind::CobId,
        }
    }

    /// The 0x1006 period object
    pub const fn period(sync: &'a SyncService<'a>) -> Self {
        Self {
            sync,
            kind: SyncObjectKind::Period,
        }
    }

    /// The 0x1007 window length object
    pub const fn window(sync: &'a SyncService<'a>) -> Self {
        Self {
            sync,
            kind: SyncObjectKind::Window,
        }
    }

    /// The 0x1019 counter overflow object
    pub const fn counter_overflow(sync: &'a SyncService<'a>) -> Self {
        Self {
            sync,
            kind: SyncObjectKind::CounterOverflow,
        }
    }
}

impl ObjectAccess for SyncObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        let sync = self.sync;
        match self.kind {
            SyncObjectKind::CobId => {
                Ok(copy_from_offset(&sync.cob_id.load().to_le_bytes(), offset, buf))
            }
            SyncObjectKind::Period => {
                Ok(copy_from_offset(&sync.period_us.load().to_le_bytes(), offset, buf))
            }
            SyncObjectKind::Window => {
                Ok(copy_from_offset(&sync.window_us.load().to_le_bytes(), offset, buf))
            }
            SyncObjectKind::CounterOverflow => {
                Ok(copy_from_offset(&[sync.overflow.load()], offset, buf))
            }
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        let result = match self.kind {
            SyncObjectKind::CobId => self.sync.write_cob_id(decode_u32(data)?),
            SyncObjectKind::Period => {
                self.sync.set_period_us(decode_u32(data)?);
                Ok(())
            }
            SyncObjectKind::Window => {
                self.sync.set_window_us(decode_u32(data)?);
                Ok(())
            }
            SyncObjectKind::CounterOverflow => self.sync.write_overflow(decode_u8(data)?),
        };
        if let Err(abort) = result {
            warn!("Rejected SYNC parameter write: {:?}", abort);
        }
        result
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        let info = match self.kind {
            SyncObjectKind::CounterOverflow => SubInfo::new_u8(),
            _ => SubInfo::new_u32(),
        };
        Ok(info.rw_access().storage(StorageClass::Rom))
    }
}

/// Build a SYNC frame for `cob_id`
pub fn sync_frame(cob_id: u16, counter: Option<u8>) -> CanMessage {
    match counter {
        Some(c) => CanMessage::new(CanId::std(cob_id), &[c]),
        None => CanMessage::new(CanId::std(cob_id), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_module::{tests::TestLink, TxBuffer};

    struct Fixture {
        sync: &'static SyncService<'static>,
        can: &'static CanModule<'static>,
        emcy: &'static Emergency,
    }

    fn fixture() -> Fixture {
        let window: &'static SyncWindow = Box::leak(Box::new(SyncWindow::new()));
        let emcy: &'static Emergency = Box::leak(Box::new(Emergency::new()));
        let tx: &'static [TxBuffer] = Box::leak(Box::new([TxBuffer::new()]));
        let can = Box::leak(Box::new(CanModule::new(&[], tx, window, emcy)));
        let sync = Box::leak(Box::new(SyncService::new(window, emcy)));
        Fixture { sync, can, emcy }
    }

    #[test]
    fn test_producer_counter_wraps() {
        let f = fixture();
        let obj = SyncObject::counter_overflow(f.sync);
        obj.write(0, &[3]).unwrap();
        SyncObject::cob_id(f.sync)
            .write(0, &(0x80 | COB_ID_BIT30).to_le_bytes())
            .unwrap();
        SyncObject::period(f.sync)
            .write(0, &1000u32.to_le_bytes())
            .unwrap();
        // Overflow cannot change while a period is set
        assert_eq!(Err(AbortCode::CantStoreDeviceState), obj.write(0, &[4]));

        let mut link = TestLink::default();
        let tx = f.can.prepare_transmit(0, 0x80, false, 1, false).unwrap();
        let mut counters = std::vec::Vec::new();
        for _ in 0..5 {
            assert_eq!(
                SyncEvent::Sync,
                f.sync
                    .process(NmtState::Operational, 1000, f.can, Some(tx), &mut link)
            );
            counters.push(link.sent.last().unwrap().data()[0]);
        }
        assert_eq!(vec![1, 2, 3, 1, 2], counters);
    }

    #[test]
    fn test_window_closes() {
        let f = fixture();
        f.sync.set_window_us(500);
        let mut link = TestLink::default();
        f.can.enter_normal_mode(&mut link);

        f.sync.handle_frame(&sync_frame(0x80, None));
        assert_eq!(
            SyncEvent::Sync,
            f.sync
                .process(NmtState::Operational, 100, f.can, None, &mut link)
        );
        assert!(f.sync.window().is_open());
        assert_eq!(
            SyncEvent::None,
            f.sync
                .process(NmtState::Operational, 300, f.can, None, &mut link)
        );
        assert_eq!(
            SyncEvent::WindowClosed,
            f.sync
                .process(NmtState::Operational, 300, f.can, None, &mut link)
        );
        assert!(!f.sync.window().is_open());
        assert_eq!(
            SyncEvent::None,
            f.sync
                .process(NmtState::Operational, 300, f.can, None, &mut link)
        );
    }

    #[test]
    fn test_wrong_length_and_timeout() {
        let f = fixture();
        let mut link = TestLink::default();
        f.sync.handle_frame(&sync_frame(0x80, Some(1)));
        assert!(f.emcy.is_error(error_bits::SYNC_LENGTH));
        assert_eq!(
            SyncEvent::None,
            f.sync
                .process(NmtState::Operational, 0, f.can, None, &mut link)
        );

        f.sync.set_period_us(1000);
        f.sync
            .process(NmtState::Operational, 1400, f.can, None, &mut link);
        assert!(!f.emcy.is_error(error_bits::SYNC_TIME_OUT));
        f.sync
            .process(NmtState::Operational, 200, f.can, None, &mut link);
        assert!(f.emcy.is_error(error_bits::SYNC_TIME_OUT));

        assert!(f.emcy.is_error(error_bits::SYNC_LENGTH));

        f.sync.handle_frame(&sync_frame(0x80, None));
        f.sync
            .process(NmtState::Operational, 0, f.can, None, &mut link);
        assert!(!f.emcy.is_error(error_bits::SYNC_TIME_OUT));
        // A correctly sized SYNC clears the length error
        assert!(!f.emcy.is_error(error_bits::SYNC_LENGTH));
        assert!(!f.emcy.has_critical_error());
    }

    #[test]
    fn test_cob_id_validation() {
        let f = fixture();
        let obj = SyncObject::cob_id(f.sync);
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(0, &(0x80 | COB_ID_EXTENDED).to_le_bytes())
        );
        obj.write(0, &(0x80 | COB_ID_BIT30).to_le_bytes()).unwrap();
        assert!(f.sync.is_producer());
        assert!(f.sync.take_config_changed());
        assert_eq!(
            Err(AbortCode::CantStoreDeviceState),
            obj.write(0, &(0x81 | COB_ID_BIT30).to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::InvalidValue),
            SyncObject::counter_overflow(f.sync).write(0, &[1])
        );
        assert_eq!(0x80 | COB_ID_BIT30, obj.read_u32(0).unwrap());
    }
}
