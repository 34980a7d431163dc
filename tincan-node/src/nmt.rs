//! NMT slave state machine and heartbeat producer

use core::cell::RefCell;

use critical_section::Mutex;
use defmt_or_log::{info, warn};
use tincan_common::{
    constants::values::NMT_STARTUP_NO_AUTOSTART,
    emcy::{error_bits, error_codes},
    messages::{NmtCommandSpecifier, NmtState},
    objects::{ObjectCode, StorageClass, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanMessage,
};

use crate::{
    can_module::{CanLink, CanModule, CanRxHandler, TxHandle},
    emergency::Emergency,
    object_dict::{copy_from_offset, decode_u16, decode_u32, decode_u8, ObjectAccess},
};

/// Communication errors which trigger the 0x1029 sub1 behavior
const COMM_CRITICAL_BITS: core::ops::RangeInclusive<u8> = 0x10..=0x1F;
/// Generic errors which trigger the 0x1029 sub2 behavior
const GENERIC_CRITICAL_BITS: core::ops::RangeInclusive<u8> = 0x28..=0x2F;

/// A reset requested over the network
///
/// Resets are carried out by the application: on `Communication` it calls
/// [`Node::reset_communication`](crate::Node::reset_communication), on `Node` it restarts the
/// device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NmtResetRequest {
    /// No reset requested
    None,
    /// Reset the communication layer
    Communication,
    /// Reset the whole device
    Node,
}

/// Reaction to a critical error while Operational, as set in 0x1029
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorBehavior {
    /// Change to Pre-Operational
    PreOperational,
    /// Keep the current state
    NoChange,
    /// Change to Stopped
    Stopped,
}

impl ErrorBehavior {
    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PreOperational),
            1 => Some(Self::NoChange),
            2 => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct HeartbeatTiming {
    timer_us: u32,
    threshold_us: u32,
}

/// The NMT slave of a node
///
/// NMT commands are captured by the receive handler and applied by [`NmtService::process`], which
/// also produces the boot-up frame and the periodic heartbeat.
#[allow(missing_debug_implementations)]
pub struct NmtService {
    state: AtomicCell<NmtState>,
    node_id: AtomicCell<u8>,
    command: AtomicCell<Option<u8>>,
    heartbeat_ms: AtomicCell<u16>,
    startup: AtomicCell<u32>,
    error_behavior: [AtomicCell<u8>; 2],
    first_heartbeat_ms: AtomicCell<u16>,
    timing: Mutex<RefCell<HeartbeatTiming>>,
}

impl Default for NmtService {
    fn default() -> Self {
        Self::new()
    }
}

impl NmtService {
    /// Create an NMT slave in the Initializing state
    pub const fn new() -> Self {
        Self {
            state: AtomicCell::new(NmtState::Initializing),
            node_id: AtomicCell::new(0),
            command: AtomicCell::new(None),
            heartbeat_ms: AtomicCell::new(0),
            startup: AtomicCell::new(0),
            error_behavior: [AtomicCell::new(0), AtomicCell::new(0)],
            first_heartbeat_ms: AtomicCell::new(0),
            timing: Mutex::new(RefCell::new(HeartbeatTiming {
                timer_us: 0,
                threshold_us: 0,
            })),
        }
    }

    /// Set the node ID commands are matched against, and the first heartbeat delay
    pub fn configure(&self, node_id: u8, first_heartbeat_ms: u16) {
        self.node_id.store(node_id);
        self.first_heartbeat_ms.store(first_heartbeat_ms);
    }

    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.state.load()
    }

    /// Return to Initializing, so the next process call sends a boot-up frame
    pub fn reset(&self) {
        self.command.store(None);
        self.state.store(NmtState::Initializing);
    }

    /// Apply a command as if it had been received from the network
    pub fn queue_command(&self, cmd: NmtCommandSpecifier) {
        self.command.store(Some(cmd as u8));
    }

    /// The 0x1017 heartbeat producer time in ms
    pub fn heartbeat_ms(&self) -> u16 {
        self.heartbeat_ms.load()
    }

    /// Set the 0x1017 heartbeat producer time
    pub fn set_heartbeat_ms(&self, value: u16) {
        self.heartbeat_ms.store(value);
    }

    /// Set the 0x1F80 NMT startup value
    pub fn set_startup(&self, value: u32) {
        self.startup.store(value);
    }

    /// Set the 0x1029 reaction to communication errors
    pub fn set_comm_error_behavior(&self, value: ErrorBehavior) {
        self.error_behavior[0].store(value as u8);
    }

    fn behavior(&self, n: usize) -> ErrorBehavior {
        ErrorBehavior::from_byte(self.error_behavior[n].load()).unwrap_or(ErrorBehavior::NoChange)
    }

    fn restart_heartbeat_timer(&self, threshold_us: u32) {
        critical_section::with(|cs| {
            *self.timing.borrow_ref_mut(cs) = HeartbeatTiming {
                timer_us: 0,
                threshold_us,
            }
        });
    }

    fn send_heartbeat(&self, can: &CanModule<'_>, tx: Option<TxHandle>, link: &mut dyn CanLink) {
        if let Some(tx) = tx {
            let _ = can.send(tx, &[self.state.load() as u8], link);
        }
    }

    /// Apply pending commands, run the error behavior and produce heartbeats
    pub fn process(
        &self,
        elapsed_us: u32,
        emcy: &Emergency,
        can: &CanModule<'_>,
        tx: Option<TxHandle>,
        link: &mut dyn CanLink,
    ) -> NmtResetRequest {
        let prev = self.state.load();
        let period_us = self.heartbeat_ms.load() as u32 * 1000;

        if prev == NmtState::Initializing {
            // Boot-up carries the Initializing state
            self.send_heartbeat(can, tx, link);
            let autostart = self.startup.load() & NMT_STARTUP_NO_AUTOSTART == 0;
            let next = if autostart && !emcy.has_critical_error() {
                NmtState::Operational
            } else {
                NmtState::PreOperational
            };
            self.state.store(next);
            info!("NMT state {:?} -> {:?}", prev, next);
            let first = self.first_heartbeat_ms.load() as u32 * 1000;
            self.restart_heartbeat_timer(if first != 0 { first } else { period_us });
            return NmtResetRequest::None;
        }

        let mut next = prev;
        let mut reset = NmtResetRequest::None;
        if let Some(cmd) = self.command.take() {
            match NmtCommandSpecifier::from_byte(cmd) {
                Ok(NmtCommandSpecifier::Start) => {
                    if emcy.has_critical_error() {
                        warn!("Refusing to start with a critical error active");
                    } else {
                        next = NmtState::Operational;
                    }
                }
                Ok(NmtCommandSpecifier::Stop) => next = NmtState::Stopped,
                Ok(NmtCommandSpecifier::EnterPreOp) => next = NmtState::PreOperational,
                Ok(NmtCommandSpecifier::ResetNode) => reset = NmtResetRequest::Node,
                Ok(NmtCommandSpecifier::ResetComm) => reset = NmtResetRequest::Communication,
                Err(_) => emcy.report(
                    error_bits::NMT_WRONG_COMMAND,
                    error_codes::PROTOCOL_ERROR,
                    cmd as u32,
                ),
            }
        }

        if next == NmtState::Operational {
            let mut behaviors = [None, None];
            if emcy.any_active(COMM_CRITICAL_BITS) {
                behaviors[0] = Some(self.behavior(0));
            }
            if emcy.any_active(GENERIC_CRITICAL_BITS) {
                behaviors[1] = Some(self.behavior(1));
            }
            for behavior in behaviors.into_iter().flatten() {
                match behavior {
                    ErrorBehavior::PreOperational if next == NmtState::Operational => {
                        next = NmtState::PreOperational
                    }
                    ErrorBehavior::Stopped => next = NmtState::Stopped,
                    _ => (),
                }
            }
        }

        if next != prev {
            info!("NMT state {:?} -> {:?}", prev, next);
            self.state.store(next);
            if period_us != 0 {
                self.send_heartbeat(can, tx, link);
                self.restart_heartbeat_timer(period_us);
            }
            return reset;
        }

        if period_us != 0 {
            let due = critical_section::with(|cs| {
                let mut timing = self.timing.borrow_ref_mut(cs);
                timing.timer_us = timing.timer_us.saturating_add(elapsed_us);
                if timing.threshold_us == 0 {
                    timing.threshold_us = period_us;
                }
                if timing.timer_us >= timing.threshold_us {
                    timing.timer_us = 0;
                    timing.threshold_us = period_us;
                    true
                } else {
                    false
                }
            });
            if due {
                self.send_heartbeat(can, tx, link);
            }
        }
        reset
    }
}

impl CanRxHandler for NmtService {
    fn handle_frame(&self, msg: &CanMessage) {
        let [cmd, node] = match msg.data() {
            [cmd, node] => [*cmd, *node],
            _ => return,
        };
        if node == 0 || node == self.node_id.load() {
            self.command.store(Some(cmd));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NmtObjectKind {
    HeartbeatProducer,
    Startup,
    ErrorBehavior,
}

/// Object dictionary access to the NMT parameters
///
/// - 0x1017 producer heartbeat time, ms
/// - 0x1029 error behavior (record: sub1 communication errors, sub2 generic errors)
/// - 0x1F80 NMT startup
#[allow(missing_debug_implementations)]
pub struct NmtObject<'a> {
    nmt: &'a NmtService,
    kind: NmtObjectKind,
}

impl<'a> NmtObject<'a> {
    /// The 0x1017 heartbeat producer time object
    pub const fn heartbeat_producer(nmt: &'a NmtService) -> Self {
        Self {
            nmt,
            kind: NmtObjectKind::HeartbeatProducer,
        }
    }

    /// The 0x1F80 NMT startup object
    pub const fn startup(nmt: &'a NmtService) -> Self {
        Self {
            nmt,
            kind: NmtObjectKind::Startup,
        }
    }

    /// The 0x1029 error behavior object
    pub const fn error_behavior(nmt: &'a NmtService) -> Self {
        Self {
            nmt,
            kind: NmtObjectKind::ErrorBehavior,
        }
    }
}

impl ObjectAccess for NmtObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        let nmt = self.nmt;
        let n = match (self.kind, sub) {
            (NmtObjectKind::HeartbeatProducer, _) => {
                copy_from_offset(&nmt.heartbeat_ms.load().to_le_bytes(), offset, buf)
            }
            (NmtObjectKind::Startup, _) => {
                copy_from_offset(&nmt.startup.load().to_le_bytes(), offset, buf)
            }
            (NmtObjectKind::ErrorBehavior, 0) => copy_from_offset(&[2], offset, buf),
            (NmtObjectKind::ErrorBehavior, sub) => copy_from_offset(
                &[nmt.error_behavior[sub as usize - 1].load()],
                offset,
                buf,
            ),
        };
        Ok(n)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.sub_info(sub)?.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        match self.kind {
            NmtObjectKind::HeartbeatProducer => self.nmt.set_heartbeat_ms(decode_u16(data)?),
            NmtObjectKind::Startup => self.nmt.set_startup(decode_u32(data)?),
            NmtObjectKind::ErrorBehavior => {
                let value = decode_u8(data)?;
                if ErrorBehavior::from_byte(value).is_none() {
                    warn!("Invalid error behavior {}", value);
                    return Err(AbortCode::InvalidValue);
                }
                self.nmt.error_behavior[sub as usize - 1].store(value);
            }
        }
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        match self.kind {
            NmtObjectKind::ErrorBehavior => ObjectCode::Record,
            _ => ObjectCode::Var,
        }
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match (self.kind, sub) {
            (NmtObjectKind::HeartbeatProducer, 0) => {
                Ok(SubInfo::new_u16().rw_access().storage(StorageClass::Rom))
            }
            (NmtObjectKind::Startup, 0) => {
                Ok(SubInfo::new_u32().rw_access().storage(StorageClass::Rom))
            }
            (NmtObjectKind::ErrorBehavior, 0) => Ok(SubInfo::MAX_SUB_NUMBER),
            (NmtObjectKind::ErrorBehavior, 1 | 2) => {
                Ok(SubInfo::new_u8().rw_access().storage(StorageClass::Rom))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

#[cfg(test)]
mod tests {
    use tincan_common::CanId;

    use super::*;
    use crate::{
        can_module::{tests::TestLink, TxBuffer},
        sync::SyncWindow,
    };

    struct Fixture {
        nmt: NmtService,
        emcy: &'static Emergency,
        can: &'static CanModule<'static>,
        tx: TxHandle,
        link: TestLink,
    }

    impl Fixture {
        fn new() -> Self {
            let window: &'static SyncWindow = Box::leak(Box::new(SyncWindow::new()));
            let emcy: &'static Emergency = Box::leak(Box::new(Emergency::new()));
            let buffers: &'static [TxBuffer] = Box::leak(Box::new([TxBuffer::new()]));
            let can: &'static CanModule =
                Box::leak(Box::new(CanModule::new(&[], buffers, window, emcy)));
            let tx = can.prepare_transmit(0, 0x705, false, 1, false).unwrap();
            let nmt = NmtService::new();
            nmt.configure(5, 0);
            Self {
                nmt,
                emcy,
                can,
                tx,
                link: TestLink::default(),
            }
        }

        fn tick(&mut self, elapsed_us: u32) -> NmtResetRequest {
            self.nmt
                .process(elapsed_us, self.emcy, self.can, Some(self.tx), &mut self.link)
        }

        fn command(&self, cmd: u8, node: u8) {
            self.nmt
                .handle_frame(&CanMessage::new(CanId::std(0), &[cmd, node]));
        }

        fn sent_states(&mut self) -> std::vec::Vec<u8> {
            self.link.sent.drain(..).map(|m| m.data()[0]).collect()
        }
    }

    #[test]
    fn test_boot_up_and_heartbeat() {
        let mut f = Fixture::new();
        NmtObject::startup(&f.nmt)
            .write(0, &NMT_STARTUP_NO_AUTOSTART.to_le_bytes())
            .unwrap();
        NmtObject::heartbeat_producer(&f.nmt)
            .write(0, &100u16.to_le_bytes())
            .unwrap();
        f.tick(0);
        assert_eq!(NmtState::PreOperational, f.nmt.state());
        assert_eq!(vec![0], f.sent_states());

        f.tick(50_000);
        assert!(f.sent_states().is_empty());
        f.tick(50_000);
        assert_eq!(vec![127], f.sent_states());

        // A state change produces a heartbeat right away
        f.command(1, 0);
        f.tick(0);
        assert_eq!(NmtState::Operational, f.nmt.state());
        assert_eq!(vec![5], f.sent_states());
    }

    #[test]
    fn test_autostart_and_addressing() {
        let mut f = Fixture::new();
        f.tick(0);
        assert_eq!(NmtState::Operational, f.nmt.state());

        f.command(2, 6);
        f.tick(0);
        assert_eq!(NmtState::Operational, f.nmt.state());
        f.command(2, 5);
        f.tick(0);
        assert_eq!(NmtState::Stopped, f.nmt.state());

        // Wrong length frames are ignored
        f.nmt
            .handle_frame(&CanMessage::new(CanId::std(0), &[1, 5, 0]));
        f.tick(0);
        assert_eq!(NmtState::Stopped, f.nmt.state());

        f.command(130, 0);
        assert_eq!(NmtResetRequest::Communication, f.tick(0));
        f.command(129, 5);
        assert_eq!(NmtResetRequest::Node, f.tick(0));

        f.command(0x55, 0);
        f.tick(0);
        assert!(f.emcy.is_error(error_bits::NMT_WRONG_COMMAND));
    }

    #[test]
    fn test_start_refused_on_critical_error() {
        let mut f = Fixture::new();
        f.nmt.set_startup(NMT_STARTUP_NO_AUTOSTART);
        f.tick(0);
        f.emcy
            .report(error_bits::CAN_TX_BUS_OFF, error_codes::BUS_OFF_RECOVERED, 0);
        f.command(1, 0);
        f.tick(0);
        assert_eq!(NmtState::PreOperational, f.nmt.state());

        f.emcy.reset(error_bits::CAN_TX_BUS_OFF, 0);
        f.command(1, 0);
        f.tick(0);
        assert_eq!(NmtState::Operational, f.nmt.state());
    }

    #[test]
    fn test_error_behavior() {
        let mut f = Fixture::new();
        let obj = NmtObject::error_behavior(&f.nmt);
        assert_eq!(2, obj.read_u8(0).unwrap());
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(1, &[3]));
        obj.write(1, &[2]).unwrap();
        f.nmt.set_heartbeat_ms(1000);
        f.tick(0);
        assert_eq!(NmtState::Operational, f.nmt.state());
        f.sent_states();

        f.emcy
            .report(error_bits::CAN_TX_OVERFLOW, error_codes::CAN_OVERRUN, 0);
        f.tick(0);
        assert_eq!(NmtState::Stopped, f.nmt.state());
        assert_eq!(vec![4], f.sent_states());
    }
}
