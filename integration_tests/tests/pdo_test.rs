use integration_tests::{
    sim_bus::SimBus,
    test_node::TestNode,
    utils::{payloads, BusLogger, RawSdoClient, TICK_US},
};
use serial_test::serial;
use tincan_node::{
    common::{
        emcy::{error_bits, error_codes, EmcyMessage},
        sdo::AbortCode,
    },
    object_dict::{find_object, ObjectAccess},
};

const NODE_ID: u8 = 3;
const RPDO_ID: u16 = 0x200 + NODE_ID as u16;
const TPDO_ID: u16 = 0x180 + NODE_ID as u16;

fn setup() -> (SimBus<'static>, RawSdoClient, TestNode) {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let node = TestNode::new(&mut bus, NODE_ID);
    (bus, client, node)
}

/// Map 0x2000sub2 and 0x2000sub3 to RPDO 0 and enable it
fn configure_rpdo(client: &mut RawSdoClient, node: &mut TestNode) {
    client.download(node, 0x1600, 0, &[0]).unwrap();
    client.download_u32(node, 0x1600, 1, 0x2000_0210).unwrap();
    client.download_u32(node, 0x1600, 2, 0x2000_0310).unwrap();
    client.download(node, 0x1600, 0, &[2]).unwrap();
    client.download_u32(node, 0x1400, 1, RPDO_ID as u32).unwrap();
    // Configuration changes are picked up on the next tick
    node.run(1, TICK_US);
}

#[serial]
#[tokio::test]
async fn test_rpdo_writes_mapped_objects() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut sender = bus.new_sender();

    configure_rpdo(&mut client, &mut node);
    assert_eq!(Ok(RPDO_ID as u32), client.upload_u32(&mut node, 0x1400, 1));
    assert_eq!(Ok(2), client.upload_u32(&mut node, 0x1600, 0));

    sender.send_std(RPDO_ID, &[0x34, 0x12, 0x78, 0x56]);
    node.run(1, TICK_US);
    assert_eq!(0x1234, node.objects.app.left.load());
    assert_eq!(0x5678, node.objects.app.right.load());
}

#[serial]
#[tokio::test]
async fn test_rpdo_wrong_length() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut sender = bus.new_sender();
    let mut rx = bus.new_receiver();

    configure_rpdo(&mut client, &mut node);
    rx.flush();

    sender.send_std(RPDO_ID, &[1, 2, 3]);
    node.run(3, TICK_US);
    assert_eq!(0, node.objects.app.left.load());
    assert_eq!(0, node.objects.app.right.load());

    let frames = rx.take_with_id(0x80 + NODE_ID as u16);
    assert_eq!(1, frames.len());
    let emcy = EmcyMessage::try_from(frames[0].data()).unwrap();
    assert_eq!(error_codes::PDO_LENGTH, emcy.code);
    assert_eq!(error_bits::RPDO_WRONG_LENGTH, emcy.bit);
    assert_eq!(3, emcy.info);

    // A correct frame is applied and clears the error
    sender.send_std(RPDO_ID, &[1, 0, 2, 0]);
    node.run(3, TICK_US);
    assert_eq!(1, node.objects.app.left.load());
    assert_eq!(2, node.objects.app.right.load());
    assert!(!node.objects.emcy.is_error(error_bits::RPDO_WRONG_LENGTH));
}

#[serial]
#[tokio::test]
async fn test_tpdo_change_of_state_with_inhibit() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();

    client.download(&mut node, 0x1A00, 0, &[0]).unwrap();
    client
        .download_u32(&mut node, 0x1A00, 1, 0x2000_0120)
        .unwrap();
    client.download(&mut node, 0x1A00, 0, &[1]).unwrap();
    client.download(&mut node, 0x1800, 2, &[254]).unwrap();
    // 50ms, in 100µs units
    client
        .download(&mut node, 0x1800, 3, &500u16.to_le_bytes())
        .unwrap();
    client
        .download_u32(&mut node, 0x1800, 1, TPDO_ID as u32)
        .unwrap();

    node.run(5, TICK_US);
    assert_eq!(vec![vec![0u8, 0, 0, 0]], payloads(&rx.take_with_id(TPDO_ID)));

    // Inhibit time holds back the change
    node.objects.app.value.store(7);
    node.run(10, TICK_US);
    assert!(rx.take_with_id(TPDO_ID).is_empty());

    node.run(50, TICK_US);
    assert_eq!(vec![vec![7u8, 0, 0, 0]], payloads(&rx.take_with_id(TPDO_ID)));

    // Inhibit time can not change while the PDO is enabled
    assert_eq!(
        Err(AbortCode::InvalidValue as u32),
        client.download(&mut node, 0x1800, 3, &100u16.to_le_bytes())
    );
}

#[serial]
#[tokio::test]
async fn test_synchronous_tpdo_with_producer() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut sync_rx = bus.new_receiver();
    let mut tpdo_rx = bus.new_receiver();

    node.objects.app.left.store(0xABCD);
    client.download(&mut node, 0x1A00, 0, &[0]).unwrap();
    client
        .download_u32(&mut node, 0x1A00, 1, 0x2000_0210)
        .unwrap();
    client.download(&mut node, 0x1A00, 0, &[1]).unwrap();
    // Every second SYNC
    client.download(&mut node, 0x1800, 2, &[2]).unwrap();
    client
        .download_u32(&mut node, 0x1800, 1, TPDO_ID as u32)
        .unwrap();

    // Overflow can only change while the period is 0
    client.download(&mut node, 0x1019, 0, &[4]).unwrap();
    client
        .download_u32(&mut node, 0x1005, 0, 0x4000_0080)
        .unwrap();
    client.download_u32(&mut node, 0x1006, 0, 10_000).unwrap();
    assert_eq!(
        Err(AbortCode::CantStoreDeviceState as u32),
        client.download(&mut node, 0x1019, 0, &[8])
    );

    node.run(100, TICK_US);

    let counters: Vec<u8> = sync_rx
        .take_with_id(0x80)
        .iter()
        .map(|f| {
            assert_eq!(1, f.data().len());
            f.data()[0]
        })
        .collect();
    assert!(counters.len() >= 10);
    let expected: Vec<u8> = (0..counters.len()).map(|i| (i % 4) as u8 + 1).collect();
    assert_eq!(expected, counters);

    let tpdos = payloads(&tpdo_rx.take_with_id(TPDO_ID));
    assert_eq!(counters.len() / 2, tpdos.len());
    assert!(tpdos.iter().all(|p| p[..] == [0xCDu8, 0xAB]));
}

#[serial]
#[tokio::test]
async fn test_pdo_configuration_checks() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    configure_rpdo(&mut client, &mut node);

    // Mapping is locked while the PDO is enabled
    assert_eq!(
        Err(AbortCode::InvalidValue as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x2000_0120)
    );
    // So is the CAN-ID
    assert_eq!(
        Err(AbortCode::InvalidValue as u32),
        client.download_u32(&mut node, 0x1400, 1, 0x301)
    );

    client
        .download_u32(&mut node, 0x1400, 1, 0x8000_0000 | RPDO_ID as u32)
        .unwrap();
    // Entries are locked until sub 0 is cleared
    assert_eq!(
        Err(AbortCode::InvalidValue as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x2000_0120)
    );
    client.download(&mut node, 0x1600, 0, &[0]).unwrap();

    // Not mappable
    assert_eq!(
        Err(AbortCode::UnallowedPdo as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x2001_0020)
    );
    assert_eq!(
        Err(AbortCode::UnallowedPdo as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x2000_0408)
    );
    assert_eq!(
        Err(AbortCode::NoSuchObject as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x3000_0108)
    );
    // Longer than the object
    assert_eq!(
        Err(AbortCode::PdoTooLong as u32),
        client.download_u32(&mut node, 0x1600, 1, 0x2000_0140)
    );
    // Reserved transmission types
    assert_eq!(
        Err(AbortCode::InvalidValue as u32),
        client.download(&mut node, 0x1400, 2, &[245])
    );

    // More than 64 bits in total
    for sub in 1..=3 {
        client
            .download_u32(&mut node, 0x1A00, sub, 0x2000_0120)
            .unwrap();
    }
    assert_eq!(
        Err(AbortCode::PdoTooLong as u32),
        client.download(&mut node, 0x1A00, 0, &[3])
    );
    client.download(&mut node, 0x1A00, 0, &[2]).unwrap();
    assert_eq!(Ok(2), client.upload_u32(&mut node, 0x1A00, 0));
}

#[serial]
#[tokio::test]
async fn test_tpdo_sent_on_event_flag() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();

    client.download(&mut node, 0x1A00, 0, &[0]).unwrap();
    client
        .download_u32(&mut node, 0x1A00, 1, 0x2000_0120)
        .unwrap();
    client.download(&mut node, 0x1A00, 0, &[1]).unwrap();
    client.download(&mut node, 0x1800, 2, &[254]).unwrap();
    client
        .download_u32(&mut node, 0x1800, 1, TPDO_ID as u32)
        .unwrap();
    node.run(5, TICK_US);
    assert_eq!(1, rx.take_with_id(TPDO_ID).len());

    // Nothing changed, nothing is sent
    node.run(5, TICK_US);
    assert!(rx.take_with_id(TPDO_ID).is_empty());

    // The application flags the value without changing it
    find_object(node.objects.od, 0x2000)
        .unwrap()
        .set_event_flag(1)
        .unwrap();
    node.run(2, TICK_US);
    assert_eq!(vec![vec![0u8, 0, 0, 0]], payloads(&rx.take_with_id(TPDO_ID)));

    // The flag is consumed
    node.run(5, TICK_US);
    assert!(rx.take_with_id(TPDO_ID).is_empty());

    // Flags on unmapped sub objects do not trigger the PDO
    find_object(node.objects.od, 0x2000)
        .unwrap()
        .set_event_flag(2)
        .unwrap();
    node.run(2, TICK_US);
    assert!(rx.take_with_id(TPDO_ID).is_empty());
}
