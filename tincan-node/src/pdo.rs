//! Process data objects
//!
//! Every PDO owns a [`PdoConfig`], which holds the communication parameters (0x1400+n / 0x1800+n)
//! and the mapping (0x1600+n / 0x1A00+n). [`Rpdo`] is registered as a receive filter and copies
//! incoming frames into the mapped objects; [`Tpdo`] packs mapped objects into frames according to
//! its transmission type.
//!
//! Mappings are bit granular. Each mapping entry is `index << 16 | sub << 8 | bits`, and the
//! entries are packed little endian, starting at bit 0 of the frame.

use core::cell::RefCell;

use critical_section::Mutex;
use defmt_or_log::{debug, warn};
use tincan_common::{
    constants::values::{COB_ID_BIT30, COB_ID_EXTENDED, COB_ID_INVALID},
    emcy::{error_bits, error_codes},
    messages::{NmtState, RPDO_BASE, TPDO_BASE},
    objects::{DataType, ObjectCode, StorageClass, SubInfo},
    sdo::AbortCode,
    AtomicCell, CanMessage,
};

use crate::{
    can_module::{CanLink, CanModule, CanRxHandler, TxHandle},
    emergency::Emergency,
    object_dict::{
        copy_from_offset, decode_u16, decode_u32, decode_u8, find_object, ODEntry, ObjectAccess,
    },
    sync::SyncWindow,
};

/// The number of mapping entries per PDO
pub const N_MAPPING_PARAMS: usize = 8;

/// Transmission type 254, manufacturer specific event
pub const TRANSMISSION_EVENT_MANUFACTURER: u8 = 254;
/// Transmission type 255, device profile event
pub const TRANSMISSION_EVENT_PROFILE: u8 = 255;

/// Direction of a PDO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoKind {
    /// Receive PDO
    Rpdo,
    /// Transmit PDO
    Tpdo,
}

/// A decoded mapping entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MapEntry {
    index: u16,
    sub: u8,
    bits: u8,
}

impl MapEntry {
    fn from_raw(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub: (raw >> 8) as u8,
            bits: raw as u8,
        }
    }

    fn is_dummy(&self) -> bool {
        self.sub == 0 && DataType::dummy_bits(self.index).is_some()
    }
}

fn bit_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Communication and mapping parameters of one PDO
#[allow(missing_debug_implementations)]
pub struct PdoConfig<'a> {
    kind: PdoKind,
    n: u8,
    node_id: AtomicCell<u8>,
    od: AtomicCell<Option<&'a [ODEntry<'a>]>>,
    /// The COB-ID as stored, without the node ID on the default CAN-ID
    cob_id: AtomicCell<u32>,
    transmission_type: AtomicCell<u8>,
    inhibit_time: AtomicCell<u16>,
    event_timer: AtomicCell<u16>,
    sync_start: AtomicCell<u8>,
    valid_maps: AtomicCell<u8>,
    mapping_params: [AtomicCell<u32>; N_MAPPING_PARAMS],
    data_len: AtomicCell<u8>,
    config_changed: AtomicCell<bool>,
}

impl<'a> PdoConfig<'a> {
    /// Create the parameters for PDO `n` (0 based)
    ///
    /// The PDO starts disabled, on its default CAN-ID if it has one, with event driven
    /// transmission and an empty mapping.
    pub const fn new(kind: PdoKind, n: u8) -> Self {
        let cob_id = COB_ID_INVALID | Self::default_can_id_for(kind, n) as u32;
        Self {
            kind,
            n,
            node_id: AtomicCell::new(0),
            od: AtomicCell::new(None),
            cob_id: AtomicCell::new(cob_id),
            transmission_type: AtomicCell::new(TRANSMISSION_EVENT_PROFILE),
            inhibit_time: AtomicCell::new(0),
            event_timer: AtomicCell::new(0),
            sync_start: AtomicCell::new(0),
            valid_maps: AtomicCell::new(0),
            mapping_params: [const { AtomicCell::new(0) }; N_MAPPING_PARAMS],
            data_len: AtomicCell::new(0),
            config_changed: AtomicCell::new(false),
        }
    }

    const fn default_can_id_for(kind: PdoKind, n: u8) -> u16 {
        if n >= 4 {
            return 0;
        }
        let base = match kind {
            PdoKind::Rpdo => RPDO_BASE,
            PdoKind::Tpdo => TPDO_BASE,
        };
        base + n as u16 * 0x100
    }

    /// Attach the PDO to a node
    ///
    /// Mapped objects are looked up in `od`.
    pub fn configure(&self, node_id: u8, od: &'a [ODEntry<'a>]) {
        self.node_id.store(node_id);
        self.od.store(Some(od));
        self.config_changed.store(true);
    }

    /// Direction of the PDO
    pub fn kind(&self) -> PdoKind {
        self.kind
    }

    /// The PDO number, 0 based
    pub fn number(&self) -> u8 {
        self.n
    }

    /// Returns true once after the COB-ID or transmission type changed
    pub fn take_config_changed(&self) -> bool {
        self.config_changed.swap(false)
    }

    fn default_can_id(&self) -> u16 {
        Self::default_can_id_for(self.kind, self.n)
    }

    /// The COB-ID as seen through the object dictionary
    ///
    /// A stored default CAN-ID has the node ID added.
    pub fn cob_id(&self) -> u32 {
        let raw = self.cob_id.load();
        let default = self.default_can_id();
        if default != 0 && (raw & 0x7FF) as u16 == default {
            raw + self.node_id.load() as u32
        } else {
            raw
        }
    }

    /// The 11-bit CAN-ID
    pub fn can_id(&self) -> u16 {
        (self.cob_id() & 0x7FF) as u16
    }

    /// Returns true when the PDO takes part in communication
    pub fn is_enabled(&self) -> bool {
        self.cob_id() & COB_ID_INVALID == 0 && self.can_id() != 0
    }

    /// The transmission type
    pub fn transmission_type(&self) -> u8 {
        self.transmission_type.load()
    }

    /// Returns true for the SYNC driven transmission types 0..=240
    pub fn is_synchronous(&self) -> bool {
        self.transmission_type() <= 240
    }

    /// Inhibit time in 100 µs units
    pub fn inhibit_time(&self) -> u16 {
        self.inhibit_time.load()
    }

    /// Event timer in ms
    pub fn event_timer(&self) -> u16 {
        self.event_timer.load()
    }

    /// SYNC counter value which starts transmission
    pub fn sync_start(&self) -> u8 {
        self.sync_start.load()
    }

    /// The number of data bytes of a frame
    pub fn data_len(&self) -> u8 {
        self.data_len.load()
    }

    fn mappings(&self) -> impl Iterator<Item = MapEntry> + '_ {
        let count = (self.valid_maps.load() as usize).min(N_MAPPING_PARAMS);
        self.mapping_params[..count]
            .iter()
            .map(|param| MapEntry::from_raw(param.load()))
    }

    fn od(&self) -> Result<&'a [ODEntry<'a>], AbortCode> {
        self.od.load().ok_or(AbortCode::NoObjectDict)
    }

    fn write_cob_id(&self, value: u32) -> Result<(), AbortCode> {
        if value & COB_ID_EXTENDED != 0 {
            return Err(AbortCode::InvalidValue);
        }
        let mut can_id = (value & 0x7FF) as u16;
        let default = self.default_can_id();
        if default != 0 && can_id == default + self.node_id.load() as u16 {
            can_id = default;
        }
        let enable = value & COB_ID_INVALID == 0;
        if enable && self.is_enabled() && (value & 0x7FF) as u16 != self.can_id() {
            return Err(AbortCode::InvalidValue);
        }
        if enable && can_id == 0 {
            return Err(AbortCode::InvalidValue);
        }
        let mut stored = (value & !0x7FF) | can_id as u32;
        if self.kind == PdoKind::Rpdo {
            stored &= !COB_ID_BIT30;
        }
        self.cob_id.store(stored);
        self.config_changed.store(true);
        Ok(())
    }

    fn write_transmission_type(&self, value: u8) -> Result<(), AbortCode> {
        if (241..=253).contains(&value) {
            return Err(AbortCode::InvalidValue);
        }
        self.transmission_type.store(value);
        self.config_changed.store(true);
        Ok(())
    }

    fn write_inhibit_time(&self, value: u16) -> Result<(), AbortCode> {
        if self.is_enabled() {
            return Err(AbortCode::InvalidValue);
        }
        self.inhibit_time.store(value);
        Ok(())
    }

    fn write_sync_start(&self, value: u8) -> Result<(), AbortCode> {
        if value > 240 || self.is_enabled() {
            return Err(AbortCode::InvalidValue);
        }
        self.sync_start.store(value);
        Ok(())
    }

    /// Check a mapping entry against the object dictionary, returning its length in bits
    fn validate_mapping(&self, raw: u32) -> Result<u8, AbortCode> {
        let entry = MapEntry::from_raw(raw);
        if entry.is_dummy() {
            let max = DataType::dummy_bits(entry.index).unwrap_or(0);
            return if entry.bits > max {
                Err(AbortCode::PdoTooLong)
            } else {
                Ok(entry.bits)
            };
        }
        let obj = find_object(self.od()?, entry.index).ok_or(AbortCode::NoSuchObject)?;
        let info = obj.sub_info(entry.sub)?;
        let allowed = match self.kind {
            PdoKind::Rpdo => info.pdo_mapping.supports_rpdo() && info.access_type.is_writable(),
            PdoKind::Tpdo => info.pdo_mapping.supports_tpdo() && info.access_type.is_readable(),
        };
        if !allowed || info.size > 8 {
            return Err(AbortCode::UnallowedPdo);
        }
        if entry.bits as usize > info.bit_size() {
            return Err(AbortCode::PdoTooLong);
        }
        Ok(entry.bits)
    }

    fn write_mapping(&self, sub: u8, value: u32) -> Result<(), AbortCode> {
        if self.is_enabled() || self.valid_maps.load() != 0 {
            return Err(AbortCode::InvalidValue);
        }
        self.validate_mapping(value)?;
        self.mapping_params[sub as usize - 1].store(value);
        Ok(())
    }

    fn write_valid_maps(&self, count: u8) -> Result<(), AbortCode> {
        if count as usize > N_MAPPING_PARAMS {
            return Err(AbortCode::ValueTooHigh);
        }
        if self.is_enabled() {
            return Err(AbortCode::InvalidValue);
        }
        let mut total_bits = 0usize;
        for param in &self.mapping_params[..count as usize] {
            total_bits += self.validate_mapping(param.load())? as usize;
        }
        if total_bits > 64 {
            return Err(AbortCode::PdoTooLong);
        }
        self.valid_maps.store(count);
        self.data_len.store(total_bits.div_ceil(8) as u8);
        Ok(())
    }

    /// Pack the mapped objects into a frame payload
    fn pack(&self) -> Result<[u8; 8], AbortCode> {
        let od = self.od()?;
        let mut packed = 0u64;
        let mut pos = 0u32;
        for entry in self.mappings() {
            if entry.bits == 0 {
                continue;
            }
            if !entry.is_dummy() {
                let obj = find_object(od, entry.index).ok_or(AbortCode::NoSuchObject)?;
                let size = obj.size(entry.sub)?.min(8);
                let mut buf = [0u8; 8];
                obj.read(entry.sub, 0, &mut buf[..size])?;
                packed |= (u64::from_le_bytes(buf) & bit_mask(entry.bits)) << pos;
            }
            pos += entry.bits as u32;
        }
        Ok(packed.to_le_bytes())
    }

    /// Copy a received payload into the mapped objects
    fn unpack(&self, data: &[u8; 8]) -> Result<(), AbortCode> {
        let od = self.od()?;
        let packed = u64::from_le_bytes(*data);
        let mut pos = 0u32;
        for entry in self.mappings() {
            if entry.bits == 0 {
                continue;
            }
            if !entry.is_dummy() {
                let obj = find_object(od, entry.index).ok_or(AbortCode::NoSuchObject)?;
                let size = obj.size(entry.sub)?.min(8);
                let mask = bit_mask(entry.bits);
                let mut buf = [0u8; 8];
                if (entry.bits as usize) < size * 8 {
                    obj.read(entry.sub, 0, &mut buf[..size])?;
                }
                let current = u64::from_le_bytes(buf);
                let value = (current & !mask) | ((packed >> pos) & mask);
                obj.write(entry.sub, &value.to_le_bytes()[..size])?;
            }
            pos += entry.bits as u32;
        }
        Ok(())
    }

    /// Check the event flags of every mapped object
    fn read_events(&self) -> bool {
        let Ok(od) = self.od() else {
            return false;
        };
        self.mappings()
            .filter(|e| !e.is_dummy())
            .any(|e| find_object(od, e.index).is_some_and(|obj| obj.read_event_flag(e.sub)))
    }
}

/// Whether a PDO raised `PDO_WRONG_MAPPING`
#[derive(Debug)]
struct MappingFault(AtomicCell<bool>);

impl MappingFault {
    const fn new() -> Self {
        Self(AtomicCell::new(false))
    }

    fn raise(&self, emcy: &Emergency, abort: AbortCode) {
        self.0.store(true);
        emcy.report(
            error_bits::PDO_WRONG_MAPPING,
            error_codes::PROTOCOL_ERROR,
            abort as u32,
        );
    }

    /// Reset the error if this PDO raised it
    fn clear(&self, emcy: &Emergency) {
        if self.0.swap(false) {
            emcy.reset(error_bits::PDO_WRONG_MAPPING, 0);
        }
    }
}

/// A receive PDO
#[allow(missing_debug_implementations)]
pub struct Rpdo<'a> {
    config: PdoConfig<'a>,
    emcy: &'a Emergency,
    window: &'a SyncWindow,
    /// Received payloads; synchronous RPDOs alternate between the two on every SYNC
    buffers: [AtomicCell<Option<[u8; 8]>>; 2],
    overflow: AtomicCell<bool>,
    wrong_length: AtomicCell<Option<u8>>,
    fault: MappingFault,
}

impl<'a> Rpdo<'a> {
    /// Create receive PDO `n`
    pub const fn new(n: u8, emcy: &'a Emergency, window: &'a SyncWindow) -> Self {
        Self {
            config: PdoConfig::new(PdoKind::Rpdo, n),
            emcy,
            window,
            buffers: [AtomicCell::new(None), AtomicCell::new(None)],
            overflow: AtomicCell::new(false),
            wrong_length: AtomicCell::new(None),
            fault: MappingFault::new(),
        }
    }

    /// The parameters of this PDO
    pub fn config(&self) -> &PdoConfig<'a> {
        &self.config
    }

    fn clear(&self) {
        for buf in &self.buffers {
            buf.store(None);
        }
    }

    /// Apply received data to the object dictionary
    ///
    /// Asynchronous RPDOs apply data as it arrives. Synchronous RPDOs apply the data received
    /// before the last SYNC, when `sync` is set.
    pub fn process(&self, nmt_state: NmtState, sync: bool) {
        if !self.config.is_enabled() {
            // The mapping can only change while disabled
            self.fault.clear(self.emcy);
        }
        if nmt_state != NmtState::Operational || !self.config.is_enabled() {
            self.clear();
            return;
        }

        if let Some(dlc) = self.wrong_length.take() {
            let code = if dlc < self.config.data_len() {
                error_codes::PDO_LENGTH
            } else {
                error_codes::PDO_LENGTH_EXC
            };
            self.emcy.report(error_bits::RPDO_WRONG_LENGTH, code, dlc as u32);
        }
        if self.overflow.take() {
            self.emcy.report(
                error_bits::RPDO_OVERFLOW,
                error_codes::PDO_LENGTH_EXC,
                self.config.can_id() as u32,
            );
        }

        let data = if self.config.is_synchronous() {
            if !sync {
                return;
            }
            let idx = (!self.window.rpdo_toggle()) as usize;
            self.buffers[idx].take()
        } else {
            self.buffers[0].take()
        };

        if let Some(data) = data {
            match self.config.unpack(&data) {
                Ok(()) => {
                    self.emcy.reset(error_bits::RPDO_WRONG_LENGTH, 0);
                    self.fault.clear(self.emcy);
                }
                Err(abort) => {
                    debug!("RPDO{} write failed: {:?}", self.config.n, abort);
                    self.fault.raise(self.emcy, abort);
                }
            }
        }
    }
}

impl CanRxHandler for Rpdo<'_> {
    fn handle_frame(&self, msg: &CanMessage) {
        if msg.is_rtr() {
            return;
        }
        if msg.dlc != self.config.data_len() {
            self.wrong_length.store(Some(msg.dlc));
            return;
        }
        let idx = if self.config.is_synchronous() {
            self.window.rpdo_toggle() as usize
        } else {
            0
        };
        let mut data = [0u8; 8];
        data[..msg.data().len()].copy_from_slice(msg.data());
        if self.buffers[idx].swap(Some(data)).is_some() {
            self.overflow.store(true);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TpdoState {
    last_sent: Option<[u8; 8]>,
    inhibit_us: u32,
    event_us: u32,
    sync_count: u8,
    waiting_sync_start: bool,
    /// A transmission was triggered but is held back by the inhibit time or the next SYNC
    pending: bool,
}

impl TpdoState {
    const fn new() -> Self {
        Self {
            last_sent: None,
            inhibit_us: 0,
            event_us: 0,
            sync_count: 0,
            waiting_sync_start: true,
            pending: false,
        }
    }
}

/// A transmit PDO
#[allow(missing_debug_implementations)]
pub struct Tpdo<'a> {
    config: PdoConfig<'a>,
    emcy: &'a Emergency,
    requested: AtomicCell<bool>,
    state: Mutex<RefCell<TpdoState>>,
    fault: MappingFault,
}

impl<'a> Tpdo<'a> {
    /// Create transmit PDO `n`
    pub const fn new(n: u8, emcy: &'a Emergency) -> Self {
        Self {
            config: PdoConfig::new(PdoKind::Tpdo, n),
            emcy,
            requested: AtomicCell::new(false),
            state: Mutex::new(RefCell::new(TpdoState::new())),
            fault: MappingFault::new(),
        }
    }

    /// The parameters of this PDO
    pub fn config(&self) -> &PdoConfig<'a> {
        &self.config
    }

    /// Ask for a transmission
    ///
    /// Event driven PDOs send as soon as the inhibit time allows, acyclic synchronous PDOs send on
    /// the next SYNC. Cyclic synchronous PDOs ignore requests.
    pub fn request(&self) {
        self.requested.store(true);
    }

    /// Forget all transmission state, as on leaving Operational
    pub fn reset(&self) {
        self.requested.store(false);
        critical_section::with(|cs| *self.state.borrow_ref_mut(cs) = TpdoState::new());
    }

    /// Advance the timers and send the PDO through `tx` when it is due
    ///
    /// `sync` holds the SYNC counter (0 when the SYNC carries none) if a SYNC happened during
    /// this step.
    pub fn process(
        &self,
        nmt_state: NmtState,
        sync: Option<u8>,
        elapsed_us: u32,
        can: &CanModule<'_>,
        tx: TxHandle,
        link: &mut dyn CanLink,
    ) {
        if !self.config.is_enabled() {
            self.fault.clear(self.emcy);
        }
        if nmt_state != NmtState::Operational || !self.config.is_enabled() {
            self.reset();
            return;
        }

        let ttype = self.config.transmission_type();
        let inhibit_us = self.config.inhibit_time() as u32 * 100;
        let event_us = self.config.event_timer() as u32 * 1000;
        let sync_start = self.config.sync_start();
        let requested = self.requested.take() || self.config.read_events();

        let payload = match self.config.pack() {
            Ok(payload) => {
                self.fault.clear(self.emcy);
                payload
            }
            Err(abort) => {
                self.fault.raise(self.emcy, abort);
                return;
            }
        };

        let send = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.inhibit_us = state.inhibit_us.saturating_sub(elapsed_us);
            match ttype {
                0 => {
                    state.pending |= requested || state.last_sent != Some(payload);
                    sync.is_some() && core::mem::take(&mut state.pending)
                }
                1..=240 => {
                    let Some(counter) = sync else {
                        return false;
                    };
                    if state.waiting_sync_start && sync_start != 0 {
                        if counter != sync_start {
                            return false;
                        }
                        state.waiting_sync_start = false;
                        state.sync_count = 0;
                        return true;
                    }
                    state.sync_count += 1;
                    if state.sync_count >= ttype {
                        state.sync_count = 0;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    if event_us != 0 {
                        state.event_us = state.event_us.saturating_add(elapsed_us);
                        if state.event_us >= event_us {
                            state.pending = true;
                        }
                    }
                    state.pending |= requested || state.last_sent != Some(payload);
                    state.pending && state.inhibit_us == 0
                }
            }
        });

        if !send {
            return;
        }
        let len = self.config.data_len() as usize;
        if can.send(tx, &payload[..len], link).is_ok() {
            critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                state.last_sent = Some(payload);
                state.pending = false;
                state.event_us = 0;
                state.inhibit_us = inhibit_us;
            });
        }
    }
}

/// Object dictionary access to the PDO communication parameters
///
/// RPDOs implement subs 1 (COB-ID) and 2 (transmission type). TPDOs add 3 (inhibit time),
/// 5 (event timer) and 6 (SYNC start value).
#[allow(missing_debug_implementations)]
pub struct PdoCommObject<'a> {
    pdo: &'a PdoConfig<'a>,
}

impl<'a> PdoCommObject<'a> {
    /// Create the communication object for a PDO
    pub const fn new(pdo: &'a PdoConfig<'a>) -> Self {
        Self { pdo }
    }
}

impl ObjectAccess for PdoCommObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        let pdo = self.pdo;
        match sub {
            0 => {
                let max = match pdo.kind {
                    PdoKind::Rpdo => 2,
                    PdoKind::Tpdo => 6,
                };
                Ok(copy_from_offset(&[max], offset, buf))
            }
            1 => Ok(copy_from_offset(&pdo.cob_id().to_le_bytes(), offset, buf)),
            2 => Ok(copy_from_offset(&[pdo.transmission_type()], offset, buf)),
            3 => Ok(copy_from_offset(&pdo.inhibit_time().to_le_bytes(), offset, buf)),
            5 => Ok(copy_from_offset(&pdo.event_timer().to_le_bytes(), offset, buf)),
            6 => Ok(copy_from_offset(&[pdo.sync_start()], offset, buf)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let info = self.sub_info(sub)?;
        if !info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let pdo = self.pdo;
        let result = match sub {
            1 => pdo.write_cob_id(decode_u32(data)?),
            2 => pdo.write_transmission_type(decode_u8(data)?),
            3 => pdo.write_inhibit_time(decode_u16(data)?),
            5 => {
                pdo.event_timer.store(decode_u16(data)?);
                Ok(())
            }
            6 => pdo.write_sync_start(decode_u8(data)?),
            _ => Err(AbortCode::NoSuchSubIndex),
        };
        if let Err(abort) = result {
            warn!(
                "Rejected write to PDO{} communication sub {}: {:?}",
                pdo.n, sub, abort
            );
        }
        result
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        let tpdo = self.pdo.kind == PdoKind::Tpdo;
        let info = match sub {
            0 => return Ok(SubInfo::MAX_SUB_NUMBER),
            1 => SubInfo::new_u32(),
            2 => SubInfo::new_u8(),
            3 if tpdo => SubInfo::new_u16(),
            5 if tpdo => SubInfo::new_u16(),
            6 if tpdo => SubInfo::new_u8(),
            _ => return Err(AbortCode::NoSuchSubIndex),
        };
        Ok(info.rw_access().storage(StorageClass::Rom))
    }
}

/// Object dictionary access to the PDO mapping parameters
///
/// The mapping can only change while the PDO is disabled and sub 0 is 0. Writing sub 0 validates
/// the entries and computes the frame length.
#[allow(missing_debug_implementations)]
pub struct PdoMappingObject<'a> {
    pdo: &'a PdoConfig<'a>,
}

impl<'a> PdoMappingObject<'a> {
    /// Create the mapping object for a PDO
    pub const fn new(pdo: &'a PdoConfig<'a>) -> Self {
        Self { pdo }
    }
}

impl ObjectAccess for PdoMappingObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.sub_info(sub)?;
        if sub == 0 {
            return Ok(copy_from_offset(&[self.pdo.valid_maps.load()], offset, buf));
        }
        let value = self.pdo.mapping_params[sub as usize - 1].load();
        Ok(copy_from_offset(&value.to_le_bytes(), offset, buf))
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.sub_info(sub)?;
        let result = if sub == 0 {
            self.pdo.write_valid_maps(decode_u8(data)?)
        } else {
            self.pdo.write_mapping(sub, decode_u32(data)?)
        };
        if let Err(abort) = result {
            warn!(
                "Rejected write to PDO{} mapping sub {}: {:?}",
                self.pdo.n, sub, abort
            );
        }
        result
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn max_sub_number(&self) -> u8 {
        N_MAPPING_PARAMS as u8
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::new_u8().rw_access().storage(StorageClass::Rom)),
            n if n as usize <= N_MAPPING_PARAMS => {
                Ok(SubInfo::new_u32().rw_access().storage(StorageClass::Rom))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

#[cfg(test)]
mod tests {
    use tincan_common::{objects::PdoMapping, CanId};

    use super::*;
    use crate::{
        can_module::{tests::TestLink, TxBuffer},
        object_dict::{AccessHook, HookedObject, ScalarField, VarObject},
    };

    fn od() -> &'static [ODEntry<'static>] {
        let a: &'static VarObject<ScalarField<u16>> = Box::leak(Box::new(VarObject::new(
            SubInfo::new_u16().rw_access().mapping(PdoMapping::Both),
            ScalarField::<u16>::new(0),
        )));
        let b: &'static VarObject<ScalarField<u16>> = Box::leak(Box::new(VarObject::new(
            SubInfo::new_u16().rw_access().mapping(PdoMapping::Both),
            ScalarField::<u16>::new(0),
        )));
        let c: &'static VarObject<ScalarField<u32>> = Box::leak(Box::new(VarObject::new(
            SubInfo::new_u32().rw_access(),
            ScalarField::<u32>::new(0),
        )));
        Box::leak(Box::new([
            ODEntry { index: 0x2000, data: a },
            ODEntry { index: 0x2001, data: b },
            ODEntry { index: 0x2002, data: c },
        ]))
    }

    fn map_two_u16(config: &'static PdoConfig<'static>) {
        let mapping = PdoMappingObject::new(config);
        mapping.write(1, &0x2000_0010u32.to_le_bytes()).unwrap();
        mapping.write(2, &0x2001_0010u32.to_le_bytes()).unwrap();
        mapping.write(0, &[2]).unwrap();
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_rpdo_splits_frame() {
        let od = od();
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let rpdo = leak(Rpdo::new(0, emcy, window));
        rpdo.config().configure(5, od);
        map_two_u16(rpdo.config());
        PdoCommObject::new(rpdo.config())
            .write(1, &0x205u32.to_le_bytes())
            .unwrap();
        assert_eq!(0x205, rpdo.config().can_id());
        assert_eq!(4, rpdo.config().data_len());

        rpdo.handle_frame(&CanMessage::new(CanId::std(0x205), &[0x34, 0x12, 0x78, 0x56]));
        rpdo.process(NmtState::Operational, false);
        assert_eq!(0x1234, find_object(od, 0x2000).unwrap().read_u16(0).unwrap());
        assert_eq!(0x5678, find_object(od, 0x2001).unwrap().read_u16(0).unwrap());

        // Wrong length is dropped and reported
        rpdo.handle_frame(&CanMessage::new(CanId::std(0x205), &[1, 2, 3]));
        rpdo.process(NmtState::Operational, false);
        assert_eq!(0x1234, find_object(od, 0x2000).unwrap().read_u16(0).unwrap());
        assert!(emcy.is_error(error_bits::RPDO_WRONG_LENGTH));
        assert_eq!(Some(3), emcy.info(error_bits::RPDO_WRONG_LENGTH));
    }

    struct AtMost(u8);

    impl AccessHook for AtMost {
        fn before_write(&self, _sub: u8, data: &[u8]) -> Result<(), AbortCode> {
            match data.first() {
                Some(v) if *v > self.0 => Err(AbortCode::ValueTooHigh),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_rpdo_write_failure_raises_and_clears_mapping_error() {
        let limited: &'static VarObject<ScalarField<u8>> = leak(VarObject::new(
            SubInfo::new_u8().rw_access().mapping(PdoMapping::Rpdo),
            ScalarField::<u8>::new(0),
        ));
        let od: &'static [ODEntry<'static>] = Box::leak(Box::new([ODEntry {
            index: 0x2100,
            data: leak(HookedObject::new(limited, leak(AtMost(100)))),
        }]));
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let rpdo = leak(Rpdo::new(0, emcy, window));
        rpdo.config().configure(5, od);
        let mapping = PdoMappingObject::new(rpdo.config());
        mapping.write(1, &0x2100_0008u32.to_le_bytes()).unwrap();
        mapping.write(0, &[1]).unwrap();
        let comm = PdoCommObject::new(rpdo.config());
        comm.write(1, &0x205u32.to_le_bytes()).unwrap();

        rpdo.handle_frame(&CanMessage::new(CanId::std(0x205), &[200]));
        rpdo.process(NmtState::Operational, false);
        assert_eq!(0, limited.field().load());
        assert!(emcy.is_error(error_bits::PDO_WRONG_MAPPING));
        assert_eq!(
            Some(AbortCode::ValueTooHigh as u32),
            emcy.info(error_bits::PDO_WRONG_MAPPING)
        );
        assert!(emcy.has_critical_error());

        // A frame which can be applied clears it
        rpdo.handle_frame(&CanMessage::new(CanId::std(0x205), &[50]));
        rpdo.process(NmtState::Operational, false);
        assert_eq!(50, limited.field().load());
        assert!(!emcy.is_error(error_bits::PDO_WRONG_MAPPING));
        assert!(!emcy.has_critical_error());

        // So does disabling the PDO to remap it
        rpdo.handle_frame(&CanMessage::new(CanId::std(0x205), &[101]));
        rpdo.process(NmtState::Operational, false);
        assert!(emcy.is_error(error_bits::PDO_WRONG_MAPPING));
        comm.write(1, &(0x205 | COB_ID_INVALID).to_le_bytes()).unwrap();
        rpdo.process(NmtState::PreOperational, false);
        assert!(!emcy.is_error(error_bits::PDO_WRONG_MAPPING));
    }

    #[test]
    fn test_tpdo_read_failure_raises_and_clears_mapping_error() {
        let od = od();
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let tx: &'static [TxBuffer] = Box::leak(Box::new([TxBuffer::new()]));
        let can = leak(CanModule::new(&[], tx, window, emcy));
        let tpdo = leak(Tpdo::new(0, emcy));
        tpdo.config().configure(5, od);
        map_two_u16(tpdo.config());
        PdoCommObject::new(tpdo.config())
            .write(1, &0x185u32.to_le_bytes())
            .unwrap();
        let mut link = TestLink::default();
        can.enter_normal_mode(&mut link);
        let handle = can.prepare_transmit(0, 0x185, false, 4, false).unwrap();

        // A dictionary without the mapped objects
        tpdo.config().configure(5, &od[2..]);
        tpdo.process(NmtState::Operational, None, 1000, can, handle, &mut link);
        assert!(link.sent.is_empty());
        assert!(emcy.is_error(error_bits::PDO_WRONG_MAPPING));
        assert_eq!(
            Some(AbortCode::NoSuchObject as u32),
            emcy.info(error_bits::PDO_WRONG_MAPPING)
        );

        tpdo.config().configure(5, od);
        tpdo.process(NmtState::Operational, None, 1000, can, handle, &mut link);
        assert_eq!(1, link.sent.len());
        assert!(!emcy.is_error(error_bits::PDO_WRONG_MAPPING));
    }

    #[test]
    fn test_synchronous_rpdo_waits_for_sync() {
        let od = od();
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let rpdo = leak(Rpdo::new(1, emcy, window));
        rpdo.config().configure(5, od);
        map_two_u16(rpdo.config());
        let comm = PdoCommObject::new(rpdo.config());
        comm.write(2, &[1]).unwrap();
        comm.write(1, &0x306u32.to_le_bytes()).unwrap();

        rpdo.handle_frame(&CanMessage::new(CanId::std(0x306), &[1, 0, 2, 0]));
        rpdo.process(NmtState::Operational, false);
        assert_eq!(0, find_object(od, 0x2000).unwrap().read_u16(0).unwrap());

        window.flip_rpdo_toggle();
        rpdo.process(NmtState::Operational, true);
        assert_eq!(1, find_object(od, 0x2000).unwrap().read_u16(0).unwrap());
        assert_eq!(2, find_object(od, 0x2001).unwrap().read_u16(0).unwrap());
    }

    #[test]
    fn test_tpdo_cos_inhibit_defers() {
        let od = od();
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let tx: &'static [TxBuffer] = Box::leak(Box::new([TxBuffer::new()]));
        let can = leak(CanModule::new(&[], tx, window, emcy));
        let tpdo = leak(Tpdo::new(0, emcy));
        tpdo.config().configure(5, od);
        let mapping = PdoMappingObject::new(tpdo.config());
        mapping.write(1, &0x2000_0010u32.to_le_bytes()).unwrap();
        mapping.write(0, &[1]).unwrap();
        let comm = PdoCommObject::new(tpdo.config());
        comm.write(3, &500u16.to_le_bytes()).unwrap();
        comm.write(1, &0x185u32.to_le_bytes()).unwrap();

        let mut link = TestLink::default();
        can.enter_normal_mode(&mut link);
        let handle = can.prepare_transmit(0, 0x185, false, 2, false).unwrap();
        let value = find_object(od, 0x2000).unwrap();

        // Initial transmission at t=0 starts the inhibit time
        tpdo.process(NmtState::Operational, None, 0, can, handle, &mut link);
        assert_eq!(1, link.sent.len());

        value.write(0, &1u16.to_le_bytes()).unwrap();
        tpdo.process(NmtState::Operational, None, 10_000, can, handle, &mut link);
        value.write(0, &2u16.to_le_bytes()).unwrap();
        for _ in 0..3 {
            tpdo.process(NmtState::Operational, None, 10_000, can, handle, &mut link);
        }
        assert_eq!(1, link.sent.len());
        tpdo.process(NmtState::Operational, None, 10_000, can, handle, &mut link);
        assert_eq!(2, link.sent.len());
        assert_eq!(&[2, 0], link.sent[1].data());

        tpdo.process(NmtState::Operational, None, 100_000, can, handle, &mut link);
        assert_eq!(2, link.sent.len());
    }

    #[test]
    fn test_tpdo_sync_every_second() {
        let od = od();
        let emcy = leak(Emergency::new());
        let window = leak(SyncWindow::new());
        let tx: &'static [TxBuffer] = Box::leak(Box::new([TxBuffer::new()]));
        let can = leak(CanModule::new(&[], tx, window, emcy));
        let tpdo = leak(Tpdo::new(1, emcy));
        tpdo.config().configure(5, od);
        map_two_u16(tpdo.config());
        let comm = PdoCommObject::new(tpdo.config());
        comm.write(2, &[2]).unwrap();
        comm.write(1, &0x285u32.to_le_bytes()).unwrap();

        let mut link = TestLink::default();
        can.enter_normal_mode(&mut link);
        let handle = can.prepare_transmit(0, 0x285, false, 4, true).unwrap();
        for _ in 0..4 {
            tpdo.process(NmtState::Operational, None, 1000, can, handle, &mut link);
            tpdo.process(NmtState::Operational, Some(0), 0, can, handle, &mut link);
        }
        assert_eq!(2, link.sent.len());
    }

    #[test]
    fn test_config_validation() {
        let od = od();
        let emcy = leak(Emergency::new());
        let tpdo = leak(Tpdo::new(0, emcy));
        tpdo.config().configure(5, od);
        let comm = PdoCommObject::new(tpdo.config());
        let mapping = PdoMappingObject::new(tpdo.config());

        // Default CAN-ID includes the node ID
        assert_eq!(0x8000_0185, comm.read_u32(1).unwrap());
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(2, &[245]));
        assert_eq!(
            Err(AbortCode::InvalidValue),
            comm.write(1, &(0x185 | COB_ID_EXTENDED).to_le_bytes())
        );
        assert_eq!(Err(AbortCode::NoSuchSubIndex), comm.write(4, &[0]));
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(6, &[241]));

        assert_eq!(
            Err(AbortCode::NoSuchObject),
            mapping.write(1, &0x3000_0010u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::UnallowedPdo),
            mapping.write(1, &0x2002_0020u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::PdoTooLong),
            mapping.write(1, &0x2000_0020u32.to_le_bytes())
        );
        assert_eq!(Err(AbortCode::ValueTooHigh), mapping.write(0, &[9]));

        // Dummy entries take space
        mapping.write(1, &0x0007_0020u32.to_le_bytes()).unwrap();
        mapping.write(2, &0x2000_0010u32.to_le_bytes()).unwrap();
        mapping.write(0, &[2]).unwrap();
        assert_eq!(6, tpdo.config().data_len());

        // Mapping is locked while sub 0 is set
        assert_eq!(
            Err(AbortCode::InvalidValue),
            mapping.write(1, &0x2001_0010u32.to_le_bytes())
        );

        comm.write(1, &0x185u32.to_le_bytes()).unwrap();
        assert!(tpdo.config().is_enabled());
        assert_eq!(
            Err(AbortCode::InvalidValue),
            comm.write(1, &0x186u32.to_le_bytes())
        );
        assert_eq!(Err(AbortCode::InvalidValue), comm.write(3, &[1, 0]));
        assert_eq!(Err(AbortCode::InvalidValue), mapping.write(0, &[0]));
    }
}
