use assertables::assert_contains;
use integration_tests::{
    sim_bus::SimBus,
    test_node::{TestNode, TestObjects},
    utils::{payloads, BusLogger, RawSdoClient, TICK_US},
};
use serial_test::serial;
use tincan_node::{
    common::{
        constants::values::{LOAD_CMD, SAVE_CMD},
        messages::NmtState,
        StackConfig,
    },
    restore_stored_objects, serialized_size, StorageRegion, StoredRecord, StoredRecords,
};

#[serial]
#[tokio::test]
async fn test_boot_up() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let node = TestNode::new(&mut bus, 12);

    assert_eq!(vec![vec![0u8]], payloads(&rx.take_with_id(0x70C)));
    assert_eq!(NmtState::Operational, node.node.nmt_state());
    assert_eq!(12, node.node.node_id());

    // The controller filters pass the node's own SDO requests and NMT commands
    let idents: Vec<u16> = node.link.filters().iter().map(|f| f.1).collect();
    assert_contains!(idents, &0x60C);
    assert!(node
        .link
        .filters()
        .iter()
        .any(|&(slot, ident, mask)| slot == 0 && ident == 0 && mask != 0xFFFF));
}

#[serial]
#[tokio::test]
async fn test_heartbeat_producer() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let mut node = TestNode::new(&mut bus, 3);

    // No heartbeat while the period is 0
    node.run(300, TICK_US);
    assert_eq!(vec![vec![0u8]], payloads(&rx.take_with_id(0x703)));

    client.download(&mut node, 0x1017, 0, &100u16.to_le_bytes()).unwrap();
    assert_eq!(Ok(100), client.upload_u32(&mut node, 0x1017, 0));
    rx.flush();
    node.run(250, TICK_US);
    let heartbeats = payloads(&rx.take_with_id(0x703));
    assert_eq!(vec![vec![5u8]; 2], heartbeats);
}

#[serial]
#[tokio::test]
async fn test_first_heartbeat_delay() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let objects = TestObjects::new();
    objects.nmt.set_heartbeat_ms(100);
    let config = StackConfig::new().with_first_heartbeat_ms(10);
    let mut node = objects.start(&mut bus, 3, config);

    node.run(250, TICK_US);
    // Boot-up, then heartbeats at 10, 110 and 210ms
    let frames = payloads(&rx.take_with_id(0x703));
    assert_eq!(vec![vec![0u8], vec![5], vec![5], vec![5]], frames);
}

#[serial]
#[tokio::test]
async fn test_store_and_restore() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let config = StackConfig::new().with_storage_flush_ms(10);
    let mut node = TestObjects::new().start(&mut bus, 5, config);
    let log = node.objects.storage_log.clone();

    // Bit 0 of the save object shows the command is available
    assert_eq!(Ok(1), client.upload_u32(&mut node, 0x1010, 3));

    client.download_u32(&mut node, 0x2000, 1, 900).unwrap();
    client.download(&mut node, 0x2000, 2, &[7, 0]).unwrap();
    assert!(log.stored.lock().unwrap().is_empty());

    client.download_u32(&mut node, 0x1010, 3, SAVE_CMD).unwrap();
    node.run(20, TICK_US);

    let (region, data) = {
        let stored = log.stored.lock().unwrap();
        assert_eq!(1, stored.len());
        stored[0].clone()
    };
    assert_eq!(StorageRegion::Application, region);
    assert_eq!(serialized_size(node.objects.od, region), data.len());

    let saved: Vec<(u16, u8)> = StoredRecords::new(&data)
        .filter_map(|r| match r {
            StoredRecord::ObjectValue { index, sub, .. } => Some((index, sub)),
            StoredRecord::Unknown(_) => None,
        })
        .collect();
    assert_contains!(saved, &(0x2000, 1));
    assert_contains!(saved, &(0x2001, 0));
    // Volatile sub objects are not stored
    assert!(!saved.contains(&(0x2000, 2)));

    // Load the saved values into a fresh node
    let fresh = TestObjects::new();
    assert_eq!(2, restore_stored_objects(fresh.od, &data));
    assert_eq!(900, fresh.app.value.load());
    assert_eq!(0, fresh.app.left.load());

    // Restoring defaults is left to the backend
    client.download_u32(&mut node, 0x1011, 1, LOAD_CMD).unwrap();
    node.run(1, TICK_US);
    assert_eq!(vec![StorageRegion::All], *log.restored.lock().unwrap());

    // A wrong signature is refused
    assert!(client.download_u32(&mut node, 0x1010, 1, LOAD_CMD).is_err());
}

#[serial]
#[tokio::test]
async fn test_retentive_objects_stored_on_write() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let config = StackConfig::new().with_storage_flush_ms(10);
    let mut node = TestObjects::new().start(&mut bus, 5, config);
    let log = node.objects.storage_log.clone();

    client.download_u32(&mut node, 0x2001, 0, 55).unwrap();
    node.run(20, TICK_US);

    let stored = log.stored.lock().unwrap();
    assert_eq!(1, stored.len());
    assert_eq!(StorageRegion::Application, stored[0].0);

    let fresh = TestObjects::new();
    restore_stored_objects(fresh.od, &stored[0].1);
    assert_eq!(55, fresh.retained.field().load());
}
