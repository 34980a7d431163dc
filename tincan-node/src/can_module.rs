//! Receive filter table and transmit buffer queue
//!
//! [`CanModule`] sits between the CAN driver and the protocol objects. The driver hands every
//! received frame to [`CanModule::on_frame_received`], usually straight from its receive
//! interrupt, and calls [`CanModule::on_transmit_complete`] from its transmit interrupt. Protocol
//! objects own slots in the two tables:
//!
//! - receive slots hold an identifier, a mask and a [`CanRxHandler`]. The first slot matching a
//!   frame gets it.
//! - transmit slots hold one frame each. A lower slot index is sent first.
//!
//! Frames marked synchronous (SYNC driven TPDOs) are only sent while the SYNC window is open.

use core::cell::RefCell;

use critical_section::Mutex;
use snafu::Snafu;
use tincan_common::{
    emcy::{error_bits, error_codes},
    messages::MAX_DATA_LENGTH,
    AtomicCell, CanId, CanMessage,
};

use crate::{emergency::Emergency, sync::SyncWindow};

const RTR_BIT: u16 = 1 << 11;

/// Errors returned by the dispatch core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanError {
    /// The slot index is outside the table
    #[snafu(display("Slot {index} is out of range"))]
    InvalidSlot {
        /// The requested slot
        index: usize,
    },
    /// All receive slots are taken
    RxTableFull,
    /// The transmit buffer still holds an unsent frame
    TxOverflow,
    /// A synchronous frame was submitted while the SYNC window is closed
    SyncWindowViolation,
}

/// Error counters of a CAN controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Receive error counter
    pub rx: u16,
    /// Transmit error counter. Values of 256 and above mean bus off.
    pub tx: u16,
    /// Set when the controller dropped a received frame
    pub rx_overflow: bool,
}

/// The interface to a CAN controller driver
pub trait CanLink {
    /// Hand a frame to the controller
    ///
    /// Returns the frame back if the controller has no free transmit mailbox.
    fn send_frame(&mut self, msg: CanMessage) -> Result<(), CanMessage>;

    /// Program a hardware acceptance filter
    ///
    /// The default accepts everything, leaving filtering to the receive table.
    fn set_filter(&mut self, _slot: usize, _ident: u16, _mask: u16) {}

    /// Read the controller error counters
    fn error_counters(&self) -> ErrorCounters {
        ErrorCounters::default()
    }

    /// Abort the frame currently being transmitted. Returns true if one was aborted.
    fn abort_transmission(&mut self) -> bool {
        false
    }

    /// Stop the controller so it can be configured
    fn enter_configuration_mode(&mut self) {}

    /// Start normal operation
    fn enter_normal_mode(&mut self) {}
}

/// A receiver of frames matching a receive slot
///
/// Called from interrupt context, so implementations should copy what they need and return.
pub trait CanRxHandler: Sync {
    /// Handle a frame which matched the slot
    fn handle_frame(&self, msg: &CanMessage);
}

#[derive(Clone, Copy)]
struct RxFilter<'a> {
    ident: u16,
    mask: u16,
    handler: &'a dyn CanRxHandler,
}

/// One entry in the receive table
#[allow(missing_debug_implementations)]
pub struct RxSlot<'a>(AtomicCell<Option<RxFilter<'a>>>);

impl RxSlot<'_> {
    /// Create an empty slot
    pub const fn new() -> Self {
        Self(AtomicCell::new(None))
    }
}

impl Default for RxSlot<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TxEntry {
    id: u16,
    rtr: bool,
    dlc: u8,
    data: [u8; MAX_DATA_LENGTH],
    full: bool,
    sync: bool,
    configured: bool,
}

impl TxEntry {
    fn frame(&self) -> CanMessage {
        if self.rtr {
            CanMessage::new_rtr(CanId::std(self.id), self.dlc)
        } else {
            CanMessage::new(CanId::std(self.id), &self.data[..self.dlc as usize])
        }
    }
}

/// One entry in the transmit table
#[allow(missing_debug_implementations)]
pub struct TxBuffer(Mutex<RefCell<TxEntry>>);

impl TxBuffer {
    /// Create an unconfigured buffer
    pub const fn new() -> Self {
        Self(Mutex::new(RefCell::new(TxEntry {
            id: 0,
            rtr: false,
            dlc: 0,
            data: [0; MAX_DATA_LENGTH],
            full: false,
            sync: false,
            configured: false,
        })))
    }
}

impl Default for TxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Refers to a configured transmit slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxHandle(usize);

impl TxHandle {
    /// The slot index
    pub fn slot(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug)]
struct CoreState {
    /// No frame has completed transmission since the module was configured
    first_tx: bool,
    /// Number of full transmit buffers
    pending: usize,
    /// The frame in the controller is synchronous
    in_flight_sync: bool,
    normal_mode: bool,
    last_errors: Option<ErrorCounters>,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            first_tx: true,
            pending: 0,
            in_flight_sync: false,
            normal_mode: false,
            last_errors: None,
        }
    }
}

/// The message dispatch core
#[allow(missing_debug_implementations)]
pub struct CanModule<'a> {
    rx: &'a [RxSlot<'a>],
    tx: &'a [TxBuffer],
    window: &'a SyncWindow,
    emcy: &'a Emergency,
    core: Mutex<RefCell<CoreState>>,
}

impl<'a> CanModule<'a> {
    /// Create a dispatch core over caller supplied tables
    pub const fn new(
        rx: &'a [RxSlot<'a>],
        tx: &'a [TxBuffer],
        window: &'a SyncWindow,
        emcy: &'a Emergency,
    ) -> Self {
        Self {
            rx,
            tx,
            window,
            emcy,
            core: Mutex::new(RefCell::new(CoreState::new())),
        }
    }

    /// Number of receive slots
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Number of transmit slots
    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    /// Stop dispatching and put the link into configuration mode
    ///
    /// All transmit buffers are emptied and the boot-up suppression of overflow reports is
    /// re-armed.
    pub fn enter_configuration_mode(&self, link: &mut dyn CanLink) {
        link.enter_configuration_mode();
        critical_section::with(|cs| {
            *self.core.borrow_ref_mut(cs) = CoreState::new();
            for buf in self.tx {
                let mut entry = buf.0.borrow_ref_mut(cs);
                entry.full = false;
            }
        });
    }

    /// Start dispatching received frames
    pub fn enter_normal_mode(&self, link: &mut dyn CanLink) {
        link.enter_normal_mode();
        critical_section::with(|cs| self.core.borrow_ref_mut(cs).normal_mode = true);
    }

    /// Install a receive filter in slot `index`
    ///
    /// A frame matches when `(frame_id ^ ident) & mask == 0`. With `rtr` set only remote frames
    /// match, otherwise only data frames do.
    pub fn register_receiver(
        &self,
        index: usize,
        ident: u16,
        mask: u16,
        rtr: bool,
        handler: &'a dyn CanRxHandler,
    ) -> Result<(), CanError> {
        let slot = self.rx.get(index).ok_or(CanError::InvalidSlot { index })?;
        let ident = (ident & 0x7FF) | if rtr { RTR_BIT } else { 0 };
        let mask = (mask & 0x7FF) | RTR_BIT;
        slot.0.store(Some(RxFilter {
            ident,
            mask,
            handler,
        }));
        Ok(())
    }

    /// Install a receive filter in the first free slot, returning its index
    pub fn add_receiver(
        &self,
        ident: u16,
        mask: u16,
        rtr: bool,
        handler: &'a dyn CanRxHandler,
    ) -> Result<usize, CanError> {
        let index = critical_section::with(|_| {
            let index = self.rx.iter().position(|slot| slot.0.load().is_none())?;
            // Claim the slot before leaving the critical section
            self.register_receiver(index, ident, mask, rtr, handler).ok()?;
            Some(index)
        });
        index.ok_or(CanError::RxTableFull)
    }

    /// Remove the filter in slot `index`
    pub fn clear_receiver(&self, index: usize) -> Result<(), CanError> {
        let slot = self.rx.get(index).ok_or(CanError::InvalidSlot { index })?;
        slot.0.store(None);
        Ok(())
    }

    /// Program the hardware filters from the receive table
    pub fn sync_filters(&self, link: &mut dyn CanLink) {
        for (i, slot) in self.rx.iter().enumerate() {
            match slot.0.load() {
                Some(filter) => link.set_filter(i, filter.ident, filter.mask),
                None => link.set_filter(i, 0, 0xFFFF),
            }
        }
    }

    /// Configure transmit slot `slot`
    ///
    /// Any frame still waiting in the slot is discarded.
    pub fn prepare_transmit(
        &self,
        slot: usize,
        ident: u16,
        rtr: bool,
        len: u8,
        synchronous: bool,
    ) -> Option<TxHandle> {
        let buf = self.tx.get(slot)?;
        critical_section::with(|cs| {
            let mut entry = buf.0.borrow_ref_mut(cs);
            if entry.full {
                let mut core = self.core.borrow_ref_mut(cs);
                core.pending = core.pending.saturating_sub(1);
            }
            *entry = TxEntry {
                id: ident & 0x7FF,
                rtr,
                dlc: len.min(MAX_DATA_LENGTH as u8),
                data: [0; MAX_DATA_LENGTH],
                full: false,
                sync: synchronous,
                configured: true,
            };
        });
        Some(TxHandle(slot))
    }

    /// The handle of a transmit slot which has been prepared
    pub fn tx_handle(&self, slot: usize) -> Option<TxHandle> {
        let buf = self.tx.get(slot)?;
        critical_section::with(|cs| buf.0.borrow_ref(cs).configured).then_some(TxHandle(slot))
    }

    /// Returns true while the slot holds a frame waiting for transmission
    pub fn is_full(&self, handle: TxHandle) -> bool {
        self.tx
            .get(handle.0)
            .map(|buf| critical_section::with(|cs| buf.0.borrow_ref(cs).full))
            .unwrap_or(false)
    }

    /// The frame waiting in a transmit slot, if any
    pub fn pending_frame(&self, handle: TxHandle) -> Option<CanMessage> {
        let buf = self.tx.get(handle.0)?;
        critical_section::with(|cs| {
            let entry = buf.0.borrow_ref(cs);
            entry.full.then(|| entry.frame())
        })
    }

    /// Number of frames waiting for transmission
    pub fn pending_count(&self) -> usize {
        critical_section::with(|cs| self.core.borrow_ref(cs).pending)
    }

    /// Submit a frame for transmission
    ///
    /// `data` is copied into the slot, up to the length it was prepared with. The frame goes to
    /// the link right away when nothing else is waiting, otherwise it is queued and sent by
    /// [`CanModule::on_transmit_complete`] or [`CanModule::poll_transmit`].
    pub fn send(
        &self,
        handle: TxHandle,
        data: &[u8],
        link: &mut dyn CanLink,
    ) -> Result<(), CanError> {
        let buf = self
            .tx
            .get(handle.0)
            .ok_or(CanError::InvalidSlot { index: handle.0 })?;

        let result = critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            let mut entry = buf.0.borrow_ref_mut(cs);
            if entry.full {
                return Err((CanError::TxOverflow, !core.first_tx, entry.id));
            }
            if entry.sync && !self.window.is_open() {
                return Err((CanError::SyncWindowViolation, true, entry.id));
            }
            let n = data.len().min(entry.dlc as usize);
            entry.data[..n].copy_from_slice(&data[..n]);
            entry.data[n..].fill(0);

            if core.pending == 0 {
                if link.send_frame(entry.frame()).is_err() {
                    entry.full = true;
                    core.pending += 1;
                } else {
                    core.in_flight_sync = entry.sync;
                }
            } else {
                entry.full = true;
                core.pending += 1;
            }
            Ok(entry.sync)
        });

        let sync = result.map_err(|(err, report, id)| {
            if report {
                match err {
                    CanError::TxOverflow => {
                        self.emcy
                            .report(error_bits::CAN_TX_OVERFLOW, error_codes::CAN_OVERRUN, id as u32)
                    }
                    _ => self.emcy.report(
                        error_bits::TPDO_OUTSIDE_WINDOW,
                        error_codes::COMMUNICATION,
                        id as u32,
                    ),
                }
            }
            err
        })?;
        if sync {
            // Accepted inside the window
            self.emcy.reset(error_bits::TPDO_OUTSIDE_WINDOW, 0);
        }
        Ok(())
    }

    /// Dispatch a received frame to the first matching receive slot
    ///
    /// Extended frames and frames arriving outside normal mode are ignored.
    pub fn on_frame_received(&self, msg: &CanMessage) {
        let id = match msg.id() {
            CanId::Std(id) => id,
            CanId::Extended(_) => return,
        };
        if !critical_section::with(|cs| self.core.borrow_ref(cs).normal_mode) {
            return;
        }
        let key = id | if msg.is_rtr() { RTR_BIT } else { 0 };
        for slot in self.rx {
            if let Some(filter) = slot.0.load() {
                if (key ^ filter.ident) & filter.mask == 0 {
                    filter.handler.handle_frame(msg);
                    return;
                }
            }
        }
    }

    /// Called by the driver when the controller finished sending a frame
    pub fn on_transmit_complete(&self, link: &mut dyn CanLink) {
        critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            core.first_tx = false;
            core.in_flight_sync = false;
        });
        self.poll_transmit(link);
    }

    /// Move queued frames to the link, lowest slot first, until the link is busy
    ///
    /// Synchronous frames found while the SYNC window is closed are dropped and reported.
    pub fn poll_transmit(&self, link: &mut dyn CanLink) {
        let mut dropped = None;
        let mut sent_sync = false;
        critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            for buf in self.tx {
                if core.pending == 0 {
                    break;
                }
                let mut entry = buf.0.borrow_ref_mut(cs);
                if !entry.full {
                    continue;
                }
                if entry.sync && !self.window.is_open() {
                    entry.full = false;
                    core.pending -= 1;
                    dropped = Some(entry.id);
                    continue;
                }
                if link.send_frame(entry.frame()).is_err() {
                    break;
                }
                entry.full = false;
                core.pending -= 1;
                core.in_flight_sync = entry.sync;
                sent_sync |= entry.sync;
            }
        });
        if let Some(id) = dropped {
            self.emcy.report(
                error_bits::TPDO_OUTSIDE_WINDOW,
                error_codes::COMMUNICATION,
                id as u32,
            );
        } else if sent_sync {
            self.emcy.reset(error_bits::TPDO_OUTSIDE_WINDOW, 0);
        }
    }

    /// Drop every synchronous frame which has not been sent yet
    ///
    /// Called when the SYNC window closes. A synchronous frame already handed to the controller is
    /// aborted if the link supports it. The number of deleted frames is reported as the
    /// additional info of `TPDO_OUTSIDE_WINDOW`, and a window closing with nothing to delete
    /// resets it.
    pub fn clear_pending_synchronous(&self, link: &mut dyn CanLink) {
        let cleared = critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            let mut cleared = 0u32;
            if core.in_flight_sync && link.abort_transmission() {
                core.in_flight_sync = false;
                cleared += 1;
            }
            for buf in self.tx {
                let mut entry = buf.0.borrow_ref_mut(cs);
                if entry.full && entry.sync {
                    entry.full = false;
                    core.pending -= 1;
                    cleared += 1;
                }
            }
            cleared
        });
        if cleared != 0 {
            self.emcy.report(
                error_bits::TPDO_OUTSIDE_WINDOW,
                error_codes::COMMUNICATION,
                cleared,
            );
        } else {
            self.emcy.reset(error_bits::TPDO_OUTSIDE_WINDOW, 0);
        }
    }

    /// Translate the link error counters into emergency reports
    ///
    /// Only acts when the counters changed since the previous call.
    pub fn verify_errors(&self, link: &mut dyn CanLink) {
        let errors = link.error_counters();
        let first_tx = critical_section::with(|cs| {
            let mut core = self.core.borrow_ref_mut(cs);
            if core.last_errors == Some(errors) {
                None
            } else {
                core.last_errors = Some(errors);
                Some(core.first_tx)
            }
        });
        let Some(first_tx) = first_tx else {
            return;
        };
        let info = (errors.tx as u32) << 16 | errors.rx as u32;
        let emcy = self.emcy;

        if errors.rx >= 96 || errors.tx >= 96 {
            emcy.report(error_bits::CAN_BUS_WARNING, error_codes::NO_ERROR, info);
        } else {
            emcy.reset(error_bits::CAN_BUS_WARNING, info);
        }

        if errors.rx >= 128 {
            emcy.report(error_bits::CAN_RX_BUS_PASSIVE, error_codes::CAN_PASSIVE, info);
        } else {
            emcy.reset(error_bits::CAN_RX_BUS_PASSIVE, info);
        }

        if errors.tx >= 256 {
            emcy.report(error_bits::CAN_TX_BUS_OFF, error_codes::BUS_OFF_RECOVERED, info);
        } else {
            emcy.reset(error_bits::CAN_TX_BUS_OFF, info);
            if errors.tx >= 128 && !first_tx {
                emcy.report(error_bits::CAN_TX_BUS_PASSIVE, error_codes::CAN_PASSIVE, info);
            } else if emcy.reset(error_bits::CAN_TX_BUS_PASSIVE, info) {
                emcy.reset(error_bits::CAN_TX_OVERFLOW, info);
            }
        }

        if errors.rx_overflow {
            emcy.report(error_bits::CAN_RXB_OVERFLOW, error_codes::CAN_OVERRUN, info);
        } else {
            emcy.reset(error_bits::CAN_RXB_OVERFLOW, info);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::vec::Vec;

    use super::*;

    /// A link recording frames, which can be made busy
    #[derive(Default)]
    pub(crate) struct TestLink {
        pub sent: Vec<CanMessage>,
        pub busy: bool,
        pub errors: ErrorCounters,
        pub abort_ok: bool,
    }

    impl CanLink for TestLink {
        fn send_frame(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
            if self.busy {
                Err(msg)
            } else {
                self.sent.push(msg);
                Ok(())
            }
        }

        fn error_counters(&self) -> ErrorCounters {
            self.errors
        }

        fn abort_transmission(&mut self) -> bool {
            self.abort_ok
        }
    }

    struct Recorder {
        name: u8,
        last: AtomicCell<Option<(u8, u16)>>,
    }

    impl CanRxHandler for Recorder {
        fn handle_frame(&self, msg: &CanMessage) {
            self.last.store(Some((self.name, msg.id().raw() as u16)));
        }
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn module(rx: usize, tx: usize) -> &'static CanModule<'static> {
        let rx: &'static [RxSlot<'static>] =
            Box::leak((0..rx).map(|_| RxSlot::new()).collect::<Vec<_>>().into_boxed_slice());
        let tx: &'static [TxBuffer] =
            Box::leak((0..tx).map(|_| TxBuffer::new()).collect::<Vec<_>>().into_boxed_slice());
        let window = leak(SyncWindow::new());
        let emcy = leak(Emergency::new());
        leak(CanModule::new(rx, tx, window, emcy))
    }

    #[test]
    fn test_first_match_wins() {
        let can = module(3, 1);
        let mut link = TestLink::default();
        can.enter_normal_mode(&mut link);
        let a = leak(Recorder {
            name: 1,
            last: AtomicCell::new(None),
        });
        let b = leak(Recorder {
            name: 2,
            last: AtomicCell::new(None),
        });
        // Slot 0 accepts 0x180..=0x1FF, slot 1 only 0x181
        can.register_receiver(0, 0x180, 0x780, false, a).unwrap();
        can.register_receiver(1, 0x181, 0x7FF, false, b).unwrap();
        assert_eq!(
            Err(CanError::InvalidSlot { index: 3 }),
            can.register_receiver(3, 0x181, 0x7FF, false, b)
        );

        can.on_frame_received(&CanMessage::new(CanId::std(0x181), &[]));
        assert_eq!(Some((1, 0x181)), a.last.take());
        assert_eq!(None, b.last.take());

        // Remote frames do not match data frame filters
        can.on_frame_received(&CanMessage::new_rtr(CanId::std(0x181), 0));
        assert_eq!(None, a.last.take());

        // Extended frames are never dispatched
        can.on_frame_received(&CanMessage::new(CanId::extended(0x181), &[]));
        assert_eq!(None, a.last.take());

        assert_eq!(Ok(2), can.add_receiver(0x700, 0x7FF, false, b));
        assert_eq!(Err(CanError::RxTableFull), can.add_receiver(0x701, 0x7FF, false, b));
    }

    #[test]
    fn test_no_dispatch_in_configuration_mode() {
        let can = module(1, 1);
        let rec = leak(Recorder {
            name: 1,
            last: AtomicCell::new(None),
        });
        can.register_receiver(0, 0x100, 0x7FF, false, rec).unwrap();
        can.on_frame_received(&CanMessage::new(CanId::std(0x100), &[]));
        assert_eq!(None, rec.last.take());
    }

    #[test]
    fn test_overflow_keeps_payload_and_is_suppressed_at_boot() {
        let can = module(0, 2);
        let mut link = TestLink {
            busy: true,
            ..Default::default()
        };
        let h = can.prepare_transmit(1, 0x181, false, 2, false).unwrap();
        assert_eq!(None, can.prepare_transmit(2, 0x182, false, 2, false));

        can.send(h, &[1, 2], &mut link).unwrap();
        assert_eq!(Err(CanError::TxOverflow), can.send(h, &[3, 4], &mut link));
        assert_eq!(&[1, 2], can.pending_frame(h).unwrap().data());
        assert!(!can.emcy.is_error(error_bits::CAN_TX_OVERFLOW));

        link.busy = false;
        can.on_transmit_complete(&mut link);
        assert_eq!(1, link.sent.len());
        assert_eq!(&[1, 2], link.sent[0].data());

        // After the first completed transmission overflows are reported
        link.busy = true;
        can.send(h, &[5, 6], &mut link).unwrap();
        assert_eq!(Err(CanError::TxOverflow), can.send(h, &[7, 8], &mut link));
        assert!(can.emcy.is_error(error_bits::CAN_TX_OVERFLOW));
        assert_eq!(&[5, 6], can.pending_frame(h).unwrap().data());
    }

    #[test]
    fn test_lowest_slot_sent_first() {
        let can = module(0, 3);
        let mut link = TestLink {
            busy: true,
            ..Default::default()
        };
        let h2 = can.prepare_transmit(2, 0x300, false, 1, false).unwrap();
        let h0 = can.prepare_transmit(0, 0x100, false, 1, false).unwrap();
        can.send(h2, &[2], &mut link).unwrap();
        can.send(h0, &[0], &mut link).unwrap();
        assert_eq!(2, can.pending_count());
        link.busy = false;
        can.on_transmit_complete(&mut link);
        let ids: Vec<u32> = link.sent.iter().map(|m| m.id().raw()).collect();
        assert_eq!(vec![0x100, 0x300], ids);
        assert_eq!(0, can.pending_count());
    }

    #[test]
    fn test_sync_window_gating() {
        let can = module(0, 3);
        let mut link = TestLink::default();
        let h = can.prepare_transmit(0, 0x181, false, 1, true).unwrap();
        let h2 = can.prepare_transmit(1, 0x182, false, 1, true).unwrap();
        let h3 = can.prepare_transmit(2, 0x183, false, 1, true).unwrap();

        can.window.set_open(false);
        assert_eq!(
            Err(CanError::SyncWindowViolation),
            can.send(h, &[1], &mut link)
        );
        assert!(can.emcy.is_error(error_bits::TPDO_OUTSIDE_WINDOW));
        assert_eq!(Some(0x181), can.emcy.info(error_bits::TPDO_OUTSIDE_WINDOW));
        assert!(link.sent.is_empty());

        // The next synchronous frame inside the window clears the error
        can.window.set_open(true);
        can.send(h, &[1], &mut link).unwrap();
        assert_eq!(1, link.sent.len());
        assert!(!can.emcy.is_error(error_bits::TPDO_OUTSIDE_WINDOW));

        // One frame in flight and two queued when the window closes
        link.busy = true;
        link.abort_ok = true;
        can.send(h2, &[2], &mut link).unwrap();
        can.send(h3, &[3], &mut link).unwrap();
        assert_eq!(2, can.pending_count());
        can.window.set_open(false);
        can.clear_pending_synchronous(&mut link);
        assert_eq!(None, can.pending_frame(h2));
        assert_eq!(0, can.pending_count());
        assert_eq!(Some(3), can.emcy.info(error_bits::TPDO_OUTSIDE_WINDOW));

        // The next window closes with nothing to delete
        can.window.set_open(true);
        can.window.set_open(false);
        can.clear_pending_synchronous(&mut link);
        assert!(!can.emcy.is_error(error_bits::TPDO_OUTSIDE_WINDOW));
        assert_eq!(1, link.sent.len());
    }

    #[test]
    fn test_verify_errors_edges() {
        let can = module(0, 1);
        let mut link = TestLink::default();
        link.errors.rx = 130;
        can.verify_errors(&mut link);
        assert!(can.emcy.is_error(error_bits::CAN_BUS_WARNING));
        assert!(can.emcy.is_error(error_bits::CAN_RX_BUS_PASSIVE));

        // tx passive is held back until something was transmitted
        link.errors.tx = 130;
        can.verify_errors(&mut link);
        assert!(!can.emcy.is_error(error_bits::CAN_TX_BUS_PASSIVE));

        link.errors.tx = 300;
        can.verify_errors(&mut link);
        assert!(can.emcy.is_error(error_bits::CAN_TX_BUS_OFF));

        link.errors = ErrorCounters::default();
        can.verify_errors(&mut link);
        assert!(!can.emcy.is_error(error_bits::CAN_TX_BUS_OFF));
        assert!(!can.emcy.is_error(error_bits::CAN_BUS_WARNING));
        assert!(!can.emcy.is_error(error_bits::CAN_RX_BUS_PASSIVE));
    }
}
