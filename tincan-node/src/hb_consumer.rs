//! Heartbeat consumer
//!
//! Monitors the heartbeats of other nodes, as configured in object 0x1016. Each sub object holds
//! `node_id << 16 | time_ms`; a zero node ID or time disables the entry. Monitoring of a node begins
//! with its first heartbeat, after which a gap longer than the configured time raises
//! `HEARTBEAT_CONSUMER`. A boot-up from a node which was already seen raises
//! `HEARTBEAT_CONSUMER_REMOTE_RESET`. Both are reset by the next heartbeat of every node which
//! raised them, or when monitoring stops.

use core::cell::RefCell;

use critical_section::Mutex;
use defmt_or_log::warn;
use tincan_common::{
    emcy::{error_bits, error_codes},
    messages::NmtState,
    objects::{ObjectCode, StorageClass, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanMessage,
};

use crate::{
    can_module::CanRxHandler,
    emergency::Emergency,
    object_dict::{copy_from_offset, decode_u32, ObjectAccess},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MonitorState {
    /// Waiting for the first heartbeat
    Unknown,
    /// Heartbeats are arriving in time
    Active,
    /// The last heartbeat is older than the consumer time
    Timeout,
}

#[derive(Clone, Copy, Debug)]
struct Monitor {
    state: MonitorState,
    timer_us: u32,
    remote: Option<NmtState>,
    /// This node raised `HEARTBEAT_CONSUMER`
    timed_out: bool,
    /// This node raised `HEARTBEAT_CONSUMER_REMOTE_RESET`
    rebooted: bool,
}

impl Monitor {
    const fn new() -> Self {
        Self {
            state: MonitorState::Unknown,
            timer_us: 0,
            remote: None,
            timed_out: false,
            rebooted: false,
        }
    }
}

/// One monitored node
#[allow(missing_debug_implementations)]
pub struct HbConsumerEntry {
    config: AtomicCell<u32>,
    received: AtomicCell<Option<u8>>,
    monitor: Mutex<RefCell<Monitor>>,
}

impl Default for HbConsumerEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl HbConsumerEntry {
    /// Create a disabled entry
    pub const fn new() -> Self {
        Self {
            config: AtomicCell::new(0),
            received: AtomicCell::new(None),
            monitor: Mutex::new(RefCell::new(Monitor::new())),
        }
    }

    /// The monitored node ID, 0 when disabled
    pub fn node_id(&self) -> u8 {
        (self.config.load() >> 16) as u8
    }

    /// The consumer time in ms
    pub fn time_ms(&self) -> u16 {
        self.config.load() as u16
    }

    /// Returns true when the entry monitors a node
    pub fn is_enabled(&self) -> bool {
        self.node_id() != 0 && self.time_ms() != 0
    }

    fn clear(&self) {
        self.received.store(None);
        critical_section::with(|cs| *self.monitor.borrow_ref_mut(cs) = Monitor::new());
    }
}

impl CanRxHandler for HbConsumerEntry {
    fn handle_frame(&self, msg: &CanMessage) {
        if let [state] = msg.data() {
            self.received.store(Some(*state));
        }
    }
}

/// The heartbeat consumer of a node
#[allow(missing_debug_implementations)]
pub struct HeartbeatConsumer<'a> {
    entries: &'a [HbConsumerEntry],
    emcy: &'a Emergency,
    config_changed: AtomicCell<bool>,
}

impl<'a> HeartbeatConsumer<'a> {
    /// Create a consumer over a table of entries
    pub const fn new(entries: &'a [HbConsumerEntry], emcy: &'a Emergency) -> Self {
        Self {
            entries,
            emcy,
            config_changed: AtomicCell::new(false),
        }
    }

    /// The entry table
    pub fn entries(&self) -> &'a [HbConsumerEntry] {
        self.entries
    }

    /// Returns true once after the 0x1016 configuration changed
    pub fn take_config_changed(&self) -> bool {
        self.config_changed.swap(false)
    }

    /// Configure entry `n` (0 based)
    ///
    /// # Errors
    ///
    /// - [`AbortCode::NoSuchSubIndex`] if there is no such entry
    /// - [`AbortCode::IncompatibleParameter`] if bits 23..31 are set, or another enabled entry
    ///   already monitors the same node
    pub fn configure(&self, n: usize, value: u32) -> Result<(), AbortCode> {
        let entry = self.entries.get(n).ok_or(AbortCode::NoSuchSubIndex)?;
        if value & 0xFF80_0000 != 0 {
            return Err(AbortCode::IncompatibleParameter);
        }
        let node = (value >> 16) as u8;
        let time = value as u16;
        if node != 0 && time != 0 {
            let duplicate = self
                .entries
                .iter()
                .enumerate()
                .any(|(i, e)| i != n && e.is_enabled() && e.node_id() == node);
            if duplicate {
                return Err(AbortCode::IncompatibleParameter);
            }
        }
        entry.config.store(value);
        entry.clear();
        self.release_errors(node);
        self.config_changed.store(true);
        Ok(())
    }

    /// The last reported NMT state of a monitored node
    pub fn remote_state(&self, node: u8) -> Option<NmtState> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.is_enabled() && e.node_id() == node)?;
        critical_section::with(|cs| entry.monitor.borrow_ref(cs).remote)
    }

    /// Returns true when every monitored node is alive and Operational
    pub fn all_monitored_operational(&self) -> bool {
        self.entries.iter().filter(|e| e.is_enabled()).all(|e| {
            critical_section::with(|cs| {
                let monitor = e.monitor.borrow_ref(cs);
                monitor.state == MonitorState::Active
                    && monitor.remote == Some(NmtState::Operational)
            })
        })
    }

    /// Advance the consumer timers and handle received heartbeats
    pub fn process(&self, nmt_state: NmtState, elapsed_us: u32) {
        if !nmt_state.is_pre_or_operational() {
            for entry in self.entries {
                entry.clear();
            }
            self.release_errors(0);
            return;
        }

        for entry in self.entries.iter().filter(|e| e.is_enabled()) {
            let node = entry.node_id();
            let timeout_us = entry.time_ms() as u32 * 1000;
            let received = entry.received.take();

            let event = critical_section::with(|cs| {
                let mut monitor = entry.monitor.borrow_ref_mut(cs);
                match received {
                    Some(0) => {
                        let seen = monitor.state != MonitorState::Unknown;
                        monitor.state = MonitorState::Unknown;
                        monitor.remote = Some(NmtState::Initializing);
                        monitor.rebooted |= seen;
                        seen.then_some(HbEvent::Rebooted)
                    }
                    Some(state) => {
                        monitor.state = MonitorState::Active;
                        monitor.timer_us = 0;
                        monitor.remote = NmtState::try_from(state & 0x7F).ok();
                        let recovered = core::mem::take(&mut monitor.timed_out)
                            | core::mem::take(&mut monitor.rebooted);
                        recovered.then_some(HbEvent::Recovered)
                    }
                    None if monitor.state == MonitorState::Active => {
                        monitor.timer_us = monitor.timer_us.saturating_add(elapsed_us);
                        if monitor.timer_us >= timeout_us {
                            monitor.state = MonitorState::Timeout;
                            monitor.timed_out = true;
                            Some(HbEvent::TimedOut)
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            });

            match event {
                Some(HbEvent::Rebooted) => self.emcy.report(
                    error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET,
                    error_codes::HEARTBEAT,
                    node as u32,
                ),
                Some(HbEvent::TimedOut) => {
                    warn!("Heartbeat from node {} timed out", node);
                    self.emcy.report(
                        error_bits::HEARTBEAT_CONSUMER,
                        error_codes::HEARTBEAT,
                        node as u32,
                    );
                }
                Some(HbEvent::Recovered) => self.release_errors(node),
                None => (),
            }
        }
    }

    /// Reset the consumer errors no monitored node still holds
    fn release_errors(&self, node: u8) {
        if !self.any_monitor(|m| m.timed_out) {
            self.emcy.reset(error_bits::HEARTBEAT_CONSUMER, node as u32);
        }
        if !self.any_monitor(|m| m.rebooted) {
            self.emcy
                .reset(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET, node as u32);
        }
    }

    fn any_monitor(&self, f: impl Fn(&Monitor) -> bool) -> bool {
        self.entries
            .iter()
            .any(|e| critical_section::with(|cs| f(&e.monitor.borrow_ref(cs))))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HbEvent {
    Rebooted,
    TimedOut,
    Recovered,
}

/// Object dictionary access to 0x1016, consumer heartbeat time
#[allow(missing_debug_implementations)]
pub struct HbConsumerObject<'a> {
    consumer: &'a HeartbeatConsumer<'a>,
}

impl<'a> HbConsumerObject<'a> {
    /// Create the 0x1016 object
    pub const fn new(consumer: &'a HeartbeatConsumer<'a>) -> Self {
        Self { consumer }
    }
}

impl ObjectAccess for HbConsumerObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        if sub == 0 {
            return Ok(copy_from_offset(
                &[self.consumer.entries.len() as u8],
                offset,
                buf,
            ));
        }
        let value = self.consumer.entries[sub as usize - 1].config.load();
        Ok(copy_from_offset(&value.to_le_bytes(), offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.sub_info(sub)?.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let value = decode_u32(data)?;
        self.consumer.configure(sub as usize - 1, value).inspect_err(|_| {
            warn!("Rejected heartbeat consumer entry 0x{:x}", value);
        })
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            n if (n as usize) <= self.consumer.entries.len() => {
                Ok(SubInfo::new_u32().rw_access().storage(StorageClass::Rom))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

#[cfg(test)]
mod tests {
    use tincan_common::CanId;

    use super::*;

    fn hb(node: u8, state: NmtState) -> CanMessage {
        CanMessage::new(CanId::std(0x700 + node as u16), &[state as u8])
    }

    fn fixture() -> (&'static HeartbeatConsumer<'static>, &'static Emergency) {
        let entries: &'static [HbConsumerEntry] =
            Box::leak(Box::new([HbConsumerEntry::new(), HbConsumerEntry::new()]));
        let emcy: &'static Emergency = Box::leak(Box::new(Emergency::new()));
        (Box::leak(Box::new(HeartbeatConsumer::new(entries, emcy))), emcy)
    }

    #[test]
    fn test_timeout_raised_once_and_cleared_once() {
        let (consumer, emcy) = fixture();
        let obj = HbConsumerObject::new(consumer);
        obj.write(1, &(3u32 << 16 | 100).to_le_bytes()).unwrap();
        let entry = &consumer.entries()[0];

        // No timeout before the first heartbeat
        consumer.process(NmtState::Operational, 500_000);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));

        entry.handle_frame(&hb(3, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        assert!(consumer.all_monitored_operational());
        consumer.process(NmtState::Operational, 60_000);
        consumer.process(NmtState::Operational, 60_000);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert_eq!(Some(3), emcy.info(error_bits::HEARTBEAT_CONSUMER));
        assert_eq!(1, emcy.queued());
        consumer.process(NmtState::Operational, 60_000);
        assert_eq!(1, emcy.queued());
        assert!(!consumer.all_monitored_operational());

        entry.handle_frame(&hb(3, NmtState::PreOperational));
        consumer.process(NmtState::Operational, 0);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert_eq!(2, emcy.queued());
        assert_eq!(Some(NmtState::PreOperational), consumer.remote_state(3));
    }

    #[test]
    fn test_remote_reset_detected() {
        let (consumer, emcy) = fixture();
        consumer.configure(0, 7 << 16 | 50).unwrap();
        let entry = &consumer.entries()[0];
        entry.handle_frame(&hb(7, NmtState::Initializing));
        consumer.process(NmtState::PreOperational, 0);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));

        entry.handle_frame(&hb(7, NmtState::Operational));
        consumer.process(NmtState::PreOperational, 0);
        entry.handle_frame(&hb(7, NmtState::Initializing));
        consumer.process(NmtState::PreOperational, 0);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));
    }

    #[test]
    fn test_boot_up_after_timeout_then_heartbeat_clears_both() {
        let (consumer, emcy) = fixture();
        consumer.configure(0, 4 << 16 | 100).unwrap();
        let entry = &consumer.entries()[0];
        entry.handle_frame(&hb(4, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        consumer.process(NmtState::Operational, 150_000);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));

        entry.handle_frame(&hb(4, NmtState::Initializing));
        consumer.process(NmtState::PreOperational, 1000);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));
        assert_eq!(Some(NmtState::Initializing), consumer.remote_state(4));

        entry.handle_frame(&hb(4, NmtState::PreOperational));
        consumer.process(NmtState::PreOperational, 1000);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));
        assert!(!emcy.has_critical_error());
    }

    #[test]
    fn test_errors_held_until_every_node_recovers() {
        let (consumer, emcy) = fixture();
        consumer.configure(0, 4 << 16 | 100).unwrap();
        consumer.configure(1, 5 << 16 | 100).unwrap();
        let [a, b] = consumer.entries() else {
            panic!("two entries expected");
        };
        a.handle_frame(&hb(4, NmtState::Operational));
        b.handle_frame(&hb(5, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        consumer.process(NmtState::Operational, 150_000);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));

        a.handle_frame(&hb(4, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        b.handle_frame(&hb(5, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
    }

    #[test]
    fn test_errors_released_when_monitoring_stops() {
        let (consumer, emcy) = fixture();
        consumer.configure(0, 4 << 16 | 100).unwrap();
        let entry = &consumer.entries()[0];
        entry.handle_frame(&hb(4, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        consumer.process(NmtState::Operational, 150_000);
        entry.handle_frame(&hb(4, NmtState::Initializing));
        consumer.process(NmtState::Operational, 0);
        assert!(emcy.has_critical_error());

        // Rewriting the entry starts over
        consumer.configure(0, 4 << 16 | 200).unwrap();
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));

        entry.handle_frame(&hb(4, NmtState::Operational));
        consumer.process(NmtState::Operational, 0);
        consumer.process(NmtState::Operational, 250_000);
        assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));

        // So does leaving Pre-Operational and Operational
        consumer.process(NmtState::Stopped, 0);
        assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
        assert_eq!(None, consumer.remote_state(4));
    }

    #[test]
    fn test_configuration_rules() {
        let (consumer, _) = fixture();
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            consumer.configure(0, 0x0080_0064)
        );
        consumer.configure(0, 5 << 16 | 100).unwrap();
        assert!(consumer.take_config_changed());
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            consumer.configure(1, 5 << 16 | 200)
        );
        // A disabled entry may name the same node
        consumer.configure(1, 5 << 16).unwrap();
        assert_eq!(Err(AbortCode::NoSuchSubIndex), consumer.configure(2, 0));

        let obj = HbConsumerObject::new(consumer);
        assert_eq!(2, obj.read_u8(0).unwrap());
        assert_eq!(5 << 16 | 100, obj.read_u32(1).unwrap());
    }
}
