//! The node context which owns and runs all the protocol objects
//!
//! An application creates the protocol objects (usually as statics), builds its object dictionary
//! out of them, hands everything to [`Node::new`] and then calls [`Node::process_tick`] from its
//! main loop. The CAN driver talks to the [`CanModule`] directly from its interrupts.
//!
//! Slots in the dispatch tables are assigned in a fixed order. Lower transmit slots go out first.
//!
//! | receive slot | user |
//! |---|---|
//! | 0 | NMT commands |
//! | 1 | SYNC |
//! | 2.. | RPDOs |
//! | next | SDO server |
//! | next | SDO client, if present |
//! | rest | heartbeat consumer entries |
//!
//! | transmit slot | user |
//! |---|---|
//! | 0 | NMT master commands |
//! | 1 | SYNC producer |
//! | 2 | EMCY |
//! | 3.. | TPDOs |
//! | next | SDO server |
//! | next | SDO client, if present |
//! | next | heartbeat producer |

use defmt_or_log::{debug, info, warn};
use tincan_common::{
    emcy::{error_bits, error_codes},
    messages::{
        NmtCommandSpecifier, NmtState, HEARTBEAT_BASE, SDO_REQ_BASE, SDO_RESP_BASE,
    },
    node_id::ConfiguredId,
    CanId, StackConfig,
};

use crate::{
    can_module::{CanError, CanLink, CanModule, TxHandle},
    emergency::Emergency,
    hb_consumer::HeartbeatConsumer,
    nmt::{NmtResetRequest, NmtService},
    object_dict::{ODEntry, ObjectFlagSync},
    pdo::{Rpdo, Tpdo, TRANSMISSION_EVENT_MANUFACTURER},
    persist,
    sdo_client::{SdoClient, SdoClientStatus},
    sdo_server::{SdoReceiver, SdoServer},
    storage::{StorageBackend, StorageControl},
    sync::{SyncEvent, SyncService},
};

/// Everything a [`Node`] runs
///
/// The object dictionary usually refers to the same objects, through [`crate::pdo::PdoCommObject`],
/// [`crate::sync::SyncObject`] and friends.
#[allow(missing_debug_implementations)]
pub struct NodeResources<'a> {
    /// The object dictionary
    pub od: &'a [ODEntry<'a>],
    /// The dispatch core the CAN driver feeds
    pub can: &'a CanModule<'a>,
    /// Emergency producer, shared with the dispatch core
    pub emcy: &'a Emergency,
    /// NMT slave and heartbeat producer
    pub nmt: &'a NmtService,
    /// SYNC consumer and producer
    pub sync: &'a SyncService<'a>,
    /// Receive PDOs
    pub rpdos: &'a [Rpdo<'a>],
    /// Transmit PDOs
    pub tpdos: &'a [Tpdo<'a>],
    /// Heartbeat consumer
    pub hb_consumer: &'a HeartbeatConsumer<'a>,
    /// Request receiver of the SDO server
    pub sdo_receiver: &'a SdoReceiver<'a>,
    /// An optional SDO client
    pub sdo_client: Option<SdoClient<'a>>,
    /// State of the store and restore commands
    pub storage: &'a StorageControl,
    /// Non-volatile storage, if the device has any
    pub storage_backend: Option<&'a mut dyn StorageBackend>,
    /// Bank selector of the object event flags, if the dictionary uses them
    pub flag_sync: Option<&'a ObjectFlagSync>,
}

#[derive(Clone, Copy, Debug)]
struct RxSlots {
    nmt: usize,
    sync: usize,
    rpdo: usize,
    sdo_server: usize,
    sdo_client: Option<usize>,
    hb_consumer: usize,
    count: usize,
}

impl RxSlots {
    fn new(n_rpdo: usize, client: bool, n_hb: usize) -> Self {
        let sdo_server = 2 + n_rpdo;
        let sdo_client = client.then_some(sdo_server + 1);
        let hb_consumer = sdo_server + 1 + client as usize;
        Self {
            nmt: 0,
            sync: 1,
            rpdo: 2,
            sdo_server,
            sdo_client,
            hb_consumer,
            count: hb_consumer + n_hb,
        }
    }
}

const NMT_ID: u16 = 0;
/// Error bits owned by the communication objects, dropped when they are re-initialized
const COMMUNICATION_ERRORS: core::ops::RangeInclusive<u8> = 0x00..=0x1F;

#[derive(Clone, Copy, Debug)]
struct TxSlots {
    nmt: usize,
    sync: usize,
    emcy: usize,
    tpdo: usize,
    sdo_server: usize,
    sdo_client: Option<usize>,
    heartbeat: usize,
}

impl TxSlots {
    fn new(n_tpdo: usize, client: bool) -> Self {
        let sdo_server = 3 + n_tpdo;
        let sdo_client = client.then_some(sdo_server + 1);
        Self {
            nmt: 0,
            sync: 1,
            emcy: 2,
            tpdo: 3,
            sdo_server,
            sdo_client,
            heartbeat: sdo_server + 1 + client as usize,
        }
    }

    fn count(&self) -> usize {
        self.heartbeat + 1
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TxHandles {
    sync: Option<TxHandle>,
    emcy: Option<TxHandle>,
    sdo_server: Option<TxHandle>,
    heartbeat: Option<TxHandle>,
}

/// A CANopen node
#[allow(missing_debug_implementations)]
pub struct Node<'a> {
    node_id: ConfiguredId,
    config: StackConfig,
    res: NodeResources<'a>,
    sdo_server: SdoServer<'a>,
    rx_slots: RxSlots,
    tx_slots: TxSlots,
    tx: TxHandles,
    last_nmt_state: NmtState,
}

impl<'a> Node<'a> {
    /// Create a node and bring up communication
    ///
    /// All receive filters and transmit slots are configured, and the boot-up message is sent.
    ///
    /// # Errors
    ///
    /// Returns [`CanError::InvalidSlot`] if the tables of the [`CanModule`] are too small for the
    /// given resources.
    pub fn new(
        node_id: ConfiguredId,
        config: StackConfig,
        resources: NodeResources<'a>,
        link: &mut dyn CanLink,
    ) -> Result<Self, CanError> {
        let client = resources.sdo_client.is_some();
        let rx_slots = RxSlots::new(
            resources.rpdos.len(),
            client,
            resources.hb_consumer.entries().len(),
        );
        let tx_slots = TxSlots::new(resources.tpdos.len(), client);
        if rx_slots.count > resources.can.rx_len() {
            return Err(CanError::InvalidSlot {
                index: rx_slots.count - 1,
            });
        }
        if tx_slots.count() > resources.can.tx_len() {
            return Err(CanError::InvalidSlot {
                index: tx_slots.count() - 1,
            });
        }
        resources
            .storage
            .set_backend_present(resources.storage_backend.is_some());
        // Restoring stored values before start goes through the same write hooks
        resources.storage.clear_dirty();

        let mut node = Self {
            node_id,
            config,
            sdo_server: SdoServer::new(&config),
            res: resources,
            rx_slots,
            tx_slots,
            tx: TxHandles::default(),
            last_nmt_state: NmtState::Initializing,
        };
        node.reset_communication(link)?;
        Ok(node)
    }

    /// The node ID
    pub fn node_id(&self) -> u8 {
        self.node_id.raw()
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.res.nmt.state()
    }

    /// The object dictionary
    pub fn od(&self) -> &'a [ODEntry<'a>] {
        self.res.od
    }

    /// The dispatch core
    pub fn can(&self) -> &'a CanModule<'a> {
        self.res.can
    }

    /// The emergency producer
    pub fn emcy(&self) -> &'a Emergency {
        self.res.emcy
    }

    /// The SDO client, if the node has one
    pub fn sdo_client(&mut self) -> Option<&mut SdoClient<'a>> {
        self.res.sdo_client.as_mut()
    }

    /// Status of the SDO client transfer
    pub fn sdo_client_status(&self) -> SdoClientStatus {
        self.res
            .sdo_client
            .as_ref()
            .map(|c| c.status())
            .unwrap_or(SdoClientStatus::Idle)
    }

    /// Restart the communication layer
    ///
    /// Clears all transmit buffers, re-reads the communication parameters from the protocol
    /// objects, re-registers every filter, and sends the boot-up message.
    pub fn reset_communication(&mut self, link: &mut dyn CanLink) -> Result<(), CanError> {
        let res = &self.res;
        let can = res.can;
        let node_id = self.node_id.raw();
        can.enter_configuration_mode(link);

        res.emcy.configure(node_id, self.config.emcy_record_history);
        res.emcy.clear_bits(COMMUNICATION_ERRORS);
        res.nmt.reset();
        res.nmt.configure(node_id, self.config.first_heartbeat_ms);
        res.sync.reset();
        res.sdo_receiver.reset();
        self.sdo_server = SdoServer::new(&self.config);
        for rpdo in res.rpdos {
            rpdo.config().configure(node_id, res.od);
        }
        for tpdo in res.tpdos {
            tpdo.config().configure(node_id, res.od);
            tpdo.reset();
        }

        let rx = self.rx_slots;
        can.register_receiver(rx.nmt, NMT_ID, 0x7FF, false, res.nmt)?;
        can.register_receiver(
            rx.sdo_server,
            SDO_REQ_BASE + node_id as u16,
            0x7FF,
            false,
            res.sdo_receiver,
        )?;
        if let (Some(slot), Some(client)) = (rx.sdo_client, res.sdo_client.as_ref()) {
            can.register_receiver(slot, SDO_RESP_BASE, 0x780, false, client.receiver())?;
        }

        let tx = self.tx_slots;
        self.tx.emcy = can.prepare_transmit(tx.emcy, res.emcy.cob_id(), false, 8, false);
        self.tx.sdo_server =
            can.prepare_transmit(tx.sdo_server, SDO_RESP_BASE + node_id as u16, false, 8, false);
        self.tx.heartbeat =
            can.prepare_transmit(tx.heartbeat, HEARTBEAT_BASE + node_id as u16, false, 1, false);

        let n_rpdos = res.rpdos.len();
        let n_tpdos = res.tpdos.len();
        self.configure_sync()?;
        for n in 0..n_rpdos {
            self.configure_rpdo(n)?;
        }
        for n in 0..n_tpdos {
            self.configure_tpdo(n);
        }
        self.configure_hb_consumers()?;

        let res = &self.res;
        can.sync_filters(link);
        can.enter_normal_mode(link);
        info!("Communication reset, node {}", node_id);

        // Boot-up
        res.nmt.process(0, res.emcy, can, self.tx.heartbeat, link);
        self.last_nmt_state = NmtState::Initializing;
        Ok(())
    }

    fn configure_sync(&mut self) -> Result<(), CanError> {
        let sync = self.res.sync;
        let can = self.res.can;
        sync.take_config_changed();
        can.register_receiver(self.rx_slots.sync, sync.can_id(), 0x7FF, false, sync)?;
        self.tx.sync = if sync.is_producer() {
            can.prepare_transmit(
                self.tx_slots.sync,
                sync.can_id(),
                false,
                sync.frame_len(),
                false,
            )
        } else {
            None
        };
        Ok(())
    }

    fn configure_rpdo(&mut self, n: usize) -> Result<(), CanError> {
        let rpdos = self.res.rpdos;
        let rpdo = &rpdos[n];
        let config = rpdo.config();
        config.take_config_changed();
        let slot = self.rx_slots.rpdo + n;
        if config.is_enabled() {
            self.res
                .can
                .register_receiver(slot, config.can_id(), 0x7FF, false, rpdo)
        } else {
            self.res.can.clear_receiver(slot)
        }
    }

    fn configure_tpdo(&mut self, n: usize) {
        let config = self.res.tpdos[n].config();
        config.take_config_changed();
        if config.is_enabled() {
            self.res.can.prepare_transmit(
                self.tx_slots.tpdo + n,
                config.can_id(),
                false,
                config.data_len(),
                config.is_synchronous(),
            );
        }
    }

    fn configure_hb_consumers(&mut self) -> Result<(), CanError> {
        let consumer = self.res.hb_consumer;
        consumer.take_config_changed();
        for (n, entry) in consumer.entries().iter().enumerate() {
            let slot = self.rx_slots.hb_consumer + n;
            if entry.is_enabled() {
                self.res.can.register_receiver(
                    slot,
                    HEARTBEAT_BASE + entry.node_id() as u16,
                    0x7FF,
                    false,
                    entry,
                )?;
            } else {
                self.res.can.clear_receiver(slot)?;
            }
        }
        Ok(())
    }

    /// Pick up configuration changes made through the object dictionary
    fn apply_config_changes(&mut self, link: &mut dyn CanLink) -> Result<(), CanError> {
        let mut filters_changed = false;
        if self.res.sync.take_config_changed() {
            self.configure_sync()?;
            filters_changed = true;
        }
        for n in 0..self.res.rpdos.len() {
            if self.res.rpdos[n].config().take_config_changed() {
                self.configure_rpdo(n)?;
                filters_changed = true;
            }
        }
        for n in 0..self.res.tpdos.len() {
            if self.res.tpdos[n].config().take_config_changed() {
                self.configure_tpdo(n);
            }
        }
        if self.res.hb_consumer.take_config_changed() {
            self.configure_hb_consumers()?;
            filters_changed = true;
        }
        if filters_changed {
            self.res.can.sync_filters(link);
        }
        Ok(())
    }

    /// Send an NMT command to `node`, or to every node when `node` is 0
    ///
    /// A command addressed to this node, or broadcast, is applied locally too.
    pub fn send_nmt_command(
        &mut self,
        cmd: NmtCommandSpecifier,
        node: u8,
        link: &mut dyn CanLink,
    ) -> Result<(), CanError> {
        let can = self.res.can;
        let handle = can
            .prepare_transmit(self.tx_slots.nmt, NMT_ID, false, 2, false)
            .ok_or(CanError::InvalidSlot {
                index: self.tx_slots.nmt,
            })?;
        can.send(handle, &[cmd as u8, node], link)?;
        if node == 0 || node == self.node_id.raw() {
            self.res.nmt.queue_command(cmd);
        }
        Ok(())
    }

    /// Run all protocol objects
    ///
    /// Call this regularly from the main loop with the time elapsed since the previous call. The
    /// returned reset request must be carried out by the application.
    pub fn process_tick(&mut self, elapsed_us: u32, link: &mut dyn CanLink) -> NmtResetRequest {
        if let Err(e) = self.apply_config_changes(link) {
            warn!("Failed applying configuration: {:?}", e);
        }

        let can = self.res.can;
        let emcy = self.res.emcy;
        let nmt_state = self.res.nmt.state();

        self.process_sdo_server(nmt_state, elapsed_us, link);
        self.process_sdo_client(elapsed_us, link);

        if let Some(tx) = self.tx.emcy {
            emcy.process(nmt_state, elapsed_us, can, tx, link);
        }

        let reset = self
            .res
            .nmt
            .process(elapsed_us, emcy, can, self.tx.heartbeat, link);
        let nmt_state = self.res.nmt.state();
        if nmt_state == NmtState::Operational && self.last_nmt_state != NmtState::Operational {
            // Event driven TPDOs go out once on entering Operational
            for tpdo in self.res.tpdos {
                if tpdo.config().transmission_type() >= TRANSMISSION_EVENT_MANUFACTURER {
                    tpdo.request();
                }
            }
        }
        self.last_nmt_state = nmt_state;

        self.res.hb_consumer.process(nmt_state, elapsed_us);

        let sync_event = self
            .res
            .sync
            .process(nmt_state, elapsed_us, can, self.tx.sync, link);
        if sync_event == SyncEvent::WindowClosed {
            can.clear_pending_synchronous(link);
        }
        let sync = sync_event == SyncEvent::Sync;

        for rpdo in self.res.rpdos {
            rpdo.process(nmt_state, sync);
        }

        let events = self.res.flag_sync.map(|f| f.toggle()).unwrap_or(false);
        let sync_counter = sync.then(|| self.res.sync.counter());
        for (n, tpdo) in self.res.tpdos.iter().enumerate() {
            match can.tx_handle(self.tx_slots.tpdo + n) {
                Some(tx) => tpdo.process(nmt_state, sync_counter, elapsed_us, can, tx, link),
                None => tpdo.reset(),
            }
        }
        if events {
            for entry in self.res.od {
                entry.data.clear_events();
            }
        }

        self.process_storage(elapsed_us);

        can.verify_errors(link);
        can.poll_transmit(link);
        reset
    }

    fn process_sdo_server(&mut self, nmt_state: NmtState, elapsed_us: u32, link: &mut dyn CanLink) {
        let Some(tx) = self.tx.sdo_server else {
            return;
        };
        let can = self.res.can;
        let (frame, updated) = self.sdo_server.process(
            self.res.sdo_receiver,
            self.res.od,
            nmt_state,
            elapsed_us,
            !can.is_full(tx),
        );
        if let Some(frame) = frame {
            let _ = can.send(tx, &frame.to_bytes(), link);
        }
        if let Some(id) = updated {
            debug!("SDO download to 0x{:x}sub{} complete", id.index, id.sub);
        }
    }

    fn process_sdo_client(&mut self, elapsed_us: u32, link: &mut dyn CanLink) {
        let (Some(client), Some(slot)) = (self.res.sdo_client.as_mut(), self.tx_slots.sdo_client)
        else {
            return;
        };
        client.process(elapsed_us);
        let can = self.res.can;
        if can.tx_handle(slot).is_some_and(|h| can.is_full(h)) {
            return;
        }
        let Some(msg) = client.take_frame() else {
            return;
        };
        let CanId::Std(id) = msg.id() else {
            return;
        };
        if let Some(handle) = can.prepare_transmit(slot, id, false, 8, false) {
            let _ = can.send(handle, msg.data(), link);
        }
    }

    fn process_storage(&mut self, elapsed_us: u32) {
        let storage = self.res.storage;
        let emcy = self.res.emcy;
        let od = self.res.od;
        let flush_ms = self.config.storage_flush_ms;
        let Some(backend) = self.res.storage_backend.as_deref_mut() else {
            return;
        };

        for region in storage.take_restore().iter() {
            if let Err(e) = backend.restore_defaults(region) {
                warn!("Restoring defaults failed: {:?}", e);
                emcy.report(error_bits::NON_VOLATILE_MEMORY, error_codes::HARDWARE, 0);
            }
        }

        for region in storage.take_due(elapsed_us, flush_ms).iter() {
            let result = persist::serialize(od, region, |reader, size| {
                backend.store(region, reader, size)
            })
            .and_then(|_| backend.verify());
            match result {
                Ok(()) => {
                    info!("Stored region {}", region as u8);
                    emcy.reset(error_bits::NON_VOLATILE_MEMORY, 0);
                }
                Err(e) => {
                    warn!("Storing objects failed: {:?}", e);
                    emcy.report(
                        error_bits::NON_VOLATILE_MEMORY,
                        error_codes::HARDWARE,
                        region as u32,
                    );
                }
            }
        }
    }
}
