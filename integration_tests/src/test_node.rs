//! A node with a hand-built object dictionary
//!
//! Every object is leaked, so each test gets a fresh node with `'static` references, the way an
//! application would declare them as statics.
use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
};

use tincan_node::{
    common::{
        node_id::ConfiguredId,
        objects::{ObjectCode, PdoMapping, StorageClass, SubInfo},
        StackConfig,
    },
    emergency::EmcyObject,
    hb_consumer::{HbConsumerEntry, HbConsumerObject, HeartbeatConsumer},
    nmt::NmtObject,
    object_dict::{
        ConstField, HookedObject, NullTermByteField, ODEntry, ObjectFlagAccess, ObjectFlagSync,
        ObjectFlags, ProvidesSubObjects, ScalarField, SubObjectAccess, VarObject,
    },
    pdo::{PdoCommObject, PdoMappingObject, Rpdo, Tpdo},
    sdo_server::{SdoReceiver, SDO_BUFFER_SIZE},
    storage::{StorageObject, StoreOnWrite},
    sync::{SyncObject, SyncService, SyncWindow},
    CanModule, Emergency, NmtResetRequest, NmtService, Node, NodeResources, RxSlot, SdoClient,
    SdoClientReceiver, StorageBackend, StorageControl, StorageError, StorageRegion, TxBuffer,
};

use crate::sim_bus::{SimBus, SimLink};

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Application object 0x2000
pub struct AppObject {
    pub value: ScalarField<u32>,
    pub left: ScalarField<u16>,
    pub right: ScalarField<u16>,
    pub name: NullTermByteField<20>,
    pub flags: ObjectFlags<1>,
}

impl ProvidesSubObjects for AppObject {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((SubInfo::MAX_SUB_NUMBER, const { &ConstField::new([4]) })),
            1 => Some((
                SubInfo::new_u32()
                    .rw_access()
                    .mapping(PdoMapping::Both)
                    .storage(StorageClass::Rom),
                &self.value,
            )),
            2 => Some((
                SubInfo::new_u16().rw_access().mapping(PdoMapping::Both),
                &self.left,
            )),
            3 => Some((
                SubInfo::new_u16().rw_access().mapping(PdoMapping::Both),
                &self.right,
            )),
            4 => Some((SubInfo::new_visible_str(20).rw_access(), &self.name)),
            _ => None,
        }
    }

    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        Some(&self.flags)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }
}

/// Records what the node asked its storage backend to do
#[derive(Clone, Default)]
pub struct StorageLog {
    pub stored: Arc<Mutex<Vec<(StorageRegion, Vec<u8>)>>>,
    pub restored: Arc<Mutex<Vec<StorageRegion>>>,
}

struct TestBackend {
    log: StorageLog,
}

impl StorageBackend for TestBackend {
    fn store(
        &mut self,
        region: StorageRegion,
        reader: &mut dyn embedded_io::Read<Error = Infallible>,
        size: usize,
    ) -> Result<(), StorageError> {
        let mut data = vec![0; size];
        let mut pos = 0;
        while pos < size {
            let n = reader.read(&mut data[pos..]).unwrap();
            if n == 0 {
                break;
            }
            pos += n;
        }
        if pos != size {
            return Err(StorageError::WriteFailed { region });
        }
        self.log.stored.lock().unwrap().push((region, data));
        Ok(())
    }

    fn restore_defaults(&mut self, region: StorageRegion) -> Result<(), StorageError> {
        self.log.restored.lock().unwrap().push(region);
        Ok(())
    }
}

/// The protocol objects and dictionary of a test node
#[derive(Clone)]
pub struct TestObjects {
    pub od: &'static [ODEntry<'static>],
    pub can: &'static CanModule<'static>,
    pub emcy: &'static Emergency,
    pub nmt: &'static NmtService,
    pub sync: &'static SyncService<'static>,
    pub hb_consumer: &'static HeartbeatConsumer<'static>,
    pub rpdos: &'static [Rpdo<'static>],
    pub tpdos: &'static [Tpdo<'static>],
    pub sdo_receiver: &'static SdoReceiver<'static>,
    pub app: &'static AppObject,
    pub flag_sync: &'static ObjectFlagSync,
    pub retained: &'static VarObject<ScalarField<u32>>,
    pub storage: &'static StorageControl,
    pub storage_log: StorageLog,
}

impl Default for TestObjects {
    fn default() -> Self {
        Self::new()
    }
}

impl TestObjects {
    pub fn new() -> Self {
        let emcy = leak(Emergency::new());
        let nmt = leak(NmtService::new());
        let window = leak(SyncWindow::new());
        let sync = leak(SyncService::new(window, emcy));
        let hb_entries: &'static [HbConsumerEntry] =
            Box::leak(vec![HbConsumerEntry::new(), HbConsumerEntry::new()].into_boxed_slice());
        let hb_consumer = leak(HeartbeatConsumer::new(hb_entries, emcy));
        let rpdos: &'static [Rpdo<'static>] =
            Box::leak(vec![Rpdo::new(0, emcy, window)].into_boxed_slice());
        let tpdos: &'static [Tpdo<'static>] =
            Box::leak(vec![Tpdo::new(0, emcy)].into_boxed_slice());
        let storage = leak(StorageControl::new());
        let flag_sync = leak(ObjectFlagSync::new());

        let rx: &'static [RxSlot<'static>] =
            Box::leak((0..8).map(|_| RxSlot::new()).collect::<Vec<_>>().into_boxed_slice());
        let tx: &'static [TxBuffer] =
            Box::leak((0..8).map(|_| TxBuffer::new()).collect::<Vec<_>>().into_boxed_slice());
        let can = leak(CanModule::new(rx, tx, window, emcy));

        let sdo_buffer: &'static mut [u8] =
            Box::leak(vec![0u8; SDO_BUFFER_SIZE].into_boxed_slice());
        let sdo_receiver = leak(SdoReceiver::new(sdo_buffer));

        let app = leak(AppObject {
            value: ScalarField::<u32>::new(0),
            left: ScalarField::<u16>::new(0),
            right: ScalarField::<u16>::new(0),
            name: NullTermByteField::new([0; 20]),
            flags: ObjectFlags::new(flag_sync),
        });
        let retained = leak(VarObject::new(
            SubInfo::new_u32()
                .rw_access()
                .storage(StorageClass::Retentive),
            ScalarField::<u32>::new(0),
        ));

        let od: &'static [ODEntry<'static>] = Box::leak(
            vec![
                ODEntry {
                    index: 0x1000,
                    data: leak(VarObject::new(
                        SubInfo::new_u32().const_access(),
                        ConstField::new(0x0001_0191u32.to_le_bytes()),
                    )),
                },
                ODEntry {
                    index: 0x1001,
                    data: leak(EmcyObject::error_register(emcy)),
                },
                ODEntry {
                    index: 0x1003,
                    data: leak(EmcyObject::history(emcy)),
                },
                ODEntry {
                    index: 0x1005,
                    data: leak(SyncObject::cob_id(sync)),
                },
                ODEntry {
                    index: 0x1006,
                    data: leak(SyncObject::period(sync)),
                },
                ODEntry {
                    index: 0x1007,
                    data: leak(SyncObject::window(sync)),
                },
                ODEntry {
                    index: 0x1010,
                    data: leak(StorageObject::save(storage)),
                },
                ODEntry {
                    index: 0x1011,
                    data: leak(StorageObject::restore(storage)),
                },
                ODEntry {
                    index: 0x1014,
                    data: leak(EmcyObject::cob_id(emcy)),
                },
                ODEntry {
                    index: 0x1015,
                    data: leak(EmcyObject::inhibit_time(emcy)),
                },
                ODEntry {
                    index: 0x1016,
                    data: leak(HbConsumerObject::new(hb_consumer)),
                },
                ODEntry {
                    index: 0x1017,
                    data: leak(NmtObject::heartbeat_producer(nmt)),
                },
                ODEntry {
                    index: 0x1019,
                    data: leak(SyncObject::counter_overflow(sync)),
                },
                ODEntry {
                    index: 0x1029,
                    data: leak(NmtObject::error_behavior(nmt)),
                },
                ODEntry {
                    index: 0x1400,
                    data: leak(PdoCommObject::new(rpdos[0].config())),
                },
                ODEntry {
                    index: 0x1600,
                    data: leak(PdoMappingObject::new(rpdos[0].config())),
                },
                ODEntry {
                    index: 0x1800,
                    data: leak(PdoCommObject::new(tpdos[0].config())),
                },
                ODEntry {
                    index: 0x1A00,
                    data: leak(PdoMappingObject::new(tpdos[0].config())),
                },
                ODEntry {
                    index: 0x1F80,
                    data: leak(NmtObject::startup(nmt)),
                },
                ODEntry {
                    index: 0x2000,
                    data: app,
                },
                ODEntry {
                    index: 0x2001,
                    data: leak(HookedObject::new(
                        retained,
                        leak(StoreOnWrite::new(storage, StorageRegion::Application)),
                    )),
                },
            ]
            .into_boxed_slice(),
        );

        Self {
            od,
            can,
            emcy,
            nmt,
            sync,
            hb_consumer,
            rpdos,
            tpdos,
            sdo_receiver,
            app,
            flag_sync,
            retained,
            storage,
            storage_log: StorageLog::default(),
        }
    }

    /// Attach the objects to the bus and create the node
    pub fn start(self, bus: &mut SimBus<'static>, node_id: u8, config: StackConfig) -> TestNode {
        let mut link = bus.add_node(self.can);
        let client_rx = leak(SdoClientReceiver::new());
        let client_buffer: &'static mut [u8] = Box::leak(vec![0u8; 64].into_boxed_slice());
        let backend: &'static mut dyn StorageBackend = Box::leak(Box::new(TestBackend {
            log: self.storage_log.clone(),
        }));

        let resources = NodeResources {
            od: self.od,
            can: self.can,
            emcy: self.emcy,
            nmt: self.nmt,
            sync: self.sync,
            rpdos: self.rpdos,
            tpdos: self.tpdos,
            hb_consumer: self.hb_consumer,
            sdo_receiver: self.sdo_receiver,
            sdo_client: Some(SdoClient::new(
                client_rx,
                client_buffer,
                config.sdo_client_timeout_us,
            )),
            storage: self.storage,
            storage_backend: Some(backend),
            flag_sync: Some(self.flag_sync),
        };
        let node = Node::new(
            ConfiguredId::new(node_id).unwrap(),
            config,
            resources,
            &mut link,
        )
        .unwrap();
        TestNode {
            node,
            link,
            objects: self,
        }
    }
}

/// A running node on the simulated bus
pub struct TestNode {
    pub node: Node<'static>,
    pub link: SimLink<'static>,
    pub objects: TestObjects,
}

impl TestNode {
    /// Create a node with default objects and configuration
    pub fn new(bus: &mut SimBus<'static>, node_id: u8) -> Self {
        TestObjects::new().start(bus, node_id, StackConfig::new())
    }

    /// Run one main loop iteration
    pub fn tick(&mut self, elapsed_us: u32) -> NmtResetRequest {
        self.node.process_tick(elapsed_us, &mut self.link)
    }

    /// Run `count` iterations of `elapsed_us` each, applying communication resets
    pub fn run(&mut self, count: usize, elapsed_us: u32) {
        for _ in 0..count {
            if self.tick(elapsed_us) == NmtResetRequest::Communication {
                self.node.reset_communication(&mut self.link).unwrap();
            }
        }
    }
}
