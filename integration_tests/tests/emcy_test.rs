use assertables::assert_contains;
use integration_tests::{
    sim_bus::SimBus,
    test_node::{TestNode, TestObjects},
    utils::{tick_all, BusLogger, RawSdoClient, TICK_US},
};
use serial_test::serial;
use tincan_node::common::{
    emcy::{error_bits, error_codes, EmcyMessage},
    messages::{NmtCommandSpecifier, NmtState},
    StackConfig,
};

const CONSUMER_ID: u8 = 1;
const PRODUCER_ID: u8 = 2;

fn emcy_messages(frames: &[tincan_node::common::CanMessage]) -> Vec<EmcyMessage> {
    frames
        .iter()
        .map(|f| EmcyMessage::try_from(f.data()).unwrap())
        .collect()
}

#[serial]
#[tokio::test]
async fn test_heartbeat_timeout_and_recovery() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());

    let objects = TestObjects::new();
    // Monitor node 2 with a 100ms timeout
    objects
        .hb_consumer
        .configure(0, (PRODUCER_ID as u32) << 16 | 100)
        .unwrap();
    let mut consumer = objects.start(&mut bus, CONSUMER_ID, StackConfig::new());

    let objects = TestObjects::new();
    objects.nmt.set_heartbeat_ms(50);
    let mut producer = objects.start(&mut bus, PRODUCER_ID, StackConfig::new());

    for _ in 0..200 {
        tick_all(&mut [&mut consumer, &mut producer], TICK_US);
    }
    assert_eq!(
        Some(NmtState::Operational),
        consumer.objects.hb_consumer.remote_state(PRODUCER_ID)
    );
    assert!(consumer.objects.hb_consumer.all_monitored_operational());
    let emcy_id = 0x80 + CONSUMER_ID as u16;
    assert!(rx.take_with_id(emcy_id).is_empty());

    // The producer goes quiet
    consumer.run(150, TICK_US);
    let messages = emcy_messages(&rx.take_with_id(emcy_id));
    assert_eq!(1, messages.len());
    assert_eq!(error_codes::HEARTBEAT, messages[0].code);
    assert_eq!(error_bits::HEARTBEAT_CONSUMER, messages[0].bit);
    assert_eq!(PRODUCER_ID as u32, messages[0].info);
    assert_ne!(0, messages[0].register);

    // A communication error drops the node to Pre-Operational
    assert_eq!(NmtState::PreOperational, consumer.node.nmt_state());

    // The error is in the error register and the history
    assert_eq!(
        Ok(messages[0].register as u32),
        client.upload_u32(&mut consumer, 0x1001, 0)
    );
    assert_eq!(Ok(1), client.upload_u32(&mut consumer, 0x1003, 0));
    assert_eq!(
        Ok(messages[0].history_entry()),
        client.upload_u32(&mut consumer, 0x1003, 1)
    );

    // Writing 0 to sub 0 clears the history
    client.download(&mut consumer, 0x1003, 0, &[0]).unwrap();
    assert_eq!(Ok(0), client.upload_u32(&mut consumer, 0x1003, 0));

    // The producer comes back
    for _ in 0..100 {
        tick_all(&mut [&mut consumer, &mut producer], TICK_US);
    }
    let messages = emcy_messages(&rx.take_with_id(emcy_id));
    let codes: Vec<u16> = messages.iter().map(|m| m.code).collect();
    assert_contains!(codes, &error_codes::NO_ERROR);
    assert!(!consumer.objects.emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
}

#[serial]
#[tokio::test]
async fn test_remote_reset_reported() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();

    let objects = TestObjects::new();
    objects
        .hb_consumer
        .configure(0, (PRODUCER_ID as u32) << 16 | 500)
        .unwrap();
    let mut consumer = objects.start(&mut bus, CONSUMER_ID, StackConfig::new());

    let objects = TestObjects::new();
    objects.nmt.set_heartbeat_ms(20);
    let mut producer = objects.start(&mut bus, PRODUCER_ID, StackConfig::new());

    for _ in 0..50 {
        tick_all(&mut [&mut consumer, &mut producer], TICK_US);
    }
    rx.flush();

    // A boot-up from a node that was already seen
    producer
        .node
        .reset_communication(&mut producer.link)
        .unwrap();
    consumer.run(3, TICK_US);

    let messages = emcy_messages(&rx.take_with_id(0x80 + CONSUMER_ID as u16));
    assert_eq!(1, messages.len());
    assert_eq!(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET, messages[0].bit);
    assert_eq!(PRODUCER_ID as u32, messages[0].info);
}

#[serial]
#[tokio::test]
async fn test_application_errors() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let mut rx = bus.new_receiver();
    let mut node = TestNode::new(&mut bus, 9);
    let emcy = node.objects.emcy;

    emcy.report(error_bits::MANUFACTURER_START, error_codes::TEMPERATURE, 42);
    // Repeated reports only update the info
    emcy.report(error_bits::MANUFACTURER_START, error_codes::TEMPERATURE, 43);
    node.run(2, TICK_US);
    assert_eq!(Some(43), emcy.info(error_bits::MANUFACTURER_START));

    emcy.reset(error_bits::MANUFACTURER_START, 0);
    node.run(2, TICK_US);

    let messages = emcy_messages(&rx.take_with_id(0x89));
    let codes: Vec<u16> = messages.iter().map(|m| m.code).collect();
    assert_eq!(vec![error_codes::TEMPERATURE, error_codes::NO_ERROR], codes);
    assert_eq!(42, messages[0].info);
    assert_eq!(0, messages[1].register);

    // Manufacturer errors do not stop the node
    assert_eq!(NmtState::Operational, node.node.nmt_state());
}

#[serial]
#[tokio::test]
async fn test_start_after_remote_reboot_following_timeout() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut sender = bus.new_sender();

    let objects = TestObjects::new();
    objects
        .hb_consumer
        .configure(0, (PRODUCER_ID as u32) << 16 | 100)
        .unwrap();
    let mut consumer = objects.start(&mut bus, CONSUMER_ID, StackConfig::new());

    let objects = TestObjects::new();
    objects.nmt.set_heartbeat_ms(50);
    let mut producer = objects.start(&mut bus, PRODUCER_ID, StackConfig::new());

    for _ in 0..200 {
        tick_all(&mut [&mut consumer, &mut producer], TICK_US);
    }
    consumer.run(150, TICK_US);
    let emcy = consumer.objects.emcy;
    assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
    assert_eq!(NmtState::PreOperational, consumer.node.nmt_state());

    // The producer reboots while it is timed out
    producer
        .node
        .reset_communication(&mut producer.link)
        .unwrap();
    consumer.run(2, TICK_US);
    assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
    assert!(emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, CONSUMER_ID]);
    consumer.run(1, TICK_US);
    assert_eq!(NmtState::PreOperational, consumer.node.nmt_state());

    // The first heartbeat after the boot-up clears both errors
    rx.flush();
    for _ in 0..100 {
        tick_all(&mut [&mut consumer, &mut producer], TICK_US);
    }
    assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER));
    assert!(!emcy.is_error(error_bits::HEARTBEAT_CONSUMER_REMOTE_RESET));
    assert!(!emcy.has_critical_error());
    let messages = emcy_messages(&rx.take_with_id(0x80 + CONSUMER_ID as u16));
    let codes: Vec<u16> = messages.iter().map(|m| m.code).collect();
    assert_eq!(vec![error_codes::NO_ERROR], codes);

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, CONSUMER_ID]);
    consumer.run(1, TICK_US);
    assert_eq!(NmtState::Operational, consumer.node.nmt_state());
}

#[serial]
#[tokio::test]
async fn test_start_after_sync_window_violation() {
    const NODE_ID: u8 = 6;
    const TPDO_ID: u16 = 0x180 + NODE_ID as u16;
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut sender = bus.new_sender();
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let mut node = TestNode::new(&mut bus, NODE_ID);
    let emcy = node.objects.emcy;

    client.download(&mut node, 0x1A00, 0, &[0]).unwrap();
    client
        .download_u32(&mut node, 0x1A00, 1, 0x2000_0210)
        .unwrap();
    client.download(&mut node, 0x1A00, 0, &[1]).unwrap();
    client.download(&mut node, 0x1800, 2, &[1]).unwrap();
    client
        .download_u32(&mut node, 0x1800, 1, TPDO_ID as u32)
        .unwrap();
    // 2ms window
    client.download_u32(&mut node, 0x1007, 0, 2000).unwrap();

    sender.send_std(0x80, &[]);
    node.run(5, TICK_US);
    assert_eq!(1, rx.take_with_id(TPDO_ID).len());

    // The controller holds the PDO past the end of the window
    node.link.set_busy(true);
    sender.send_std(0x80, &[]);
    node.run(5, TICK_US);
    assert!(emcy.is_error(error_bits::TPDO_OUTSIDE_WINDOW));
    assert_eq!(Some(1), emcy.info(error_bits::TPDO_OUTSIDE_WINDOW));
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    node.link.set_busy(false);
    node.run(2, TICK_US);
    assert!(rx.take_with_id(TPDO_ID).is_empty());
    let messages = emcy_messages(&rx.take_with_id(0x80 + NODE_ID as u16));
    assert_eq!(error_codes::COMMUNICATION, messages[0].code);
    assert_eq!(error_bits::TPDO_OUTSIDE_WINDOW, messages[0].bit);

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, NODE_ID]);
    node.run(1, TICK_US);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    // A window closing with nothing left over clears the error
    sender.send_std(0x80, &[]);
    node.run(5, TICK_US);
    assert!(!emcy.is_error(error_bits::TPDO_OUTSIDE_WINDOW));

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, NODE_ID]);
    node.run(1, TICK_US);
    assert_eq!(NmtState::Operational, node.node.nmt_state());

    sender.send_std(0x80, &[]);
    node.run(5, TICK_US);
    assert_eq!(1, rx.take_with_id(TPDO_ID).len());
}

#[serial]
#[tokio::test]
async fn test_start_after_sync_length_error() {
    const NODE_ID: u8 = 7;
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut sender = bus.new_sender();
    let mut node = TestNode::new(&mut bus, NODE_ID);
    let emcy = node.objects.emcy;
    node.run(2, TICK_US);
    assert_eq!(NmtState::Operational, node.node.nmt_state());

    // The configured SYNC has no counter
    sender.send_std(0x80, &[1]);
    node.run(2, TICK_US);
    assert!(emcy.is_error(error_bits::SYNC_LENGTH));
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, NODE_ID]);
    node.run(1, TICK_US);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());

    sender.send_std(0x80, &[]);
    node.run(1, TICK_US);
    assert!(!emcy.is_error(error_bits::SYNC_LENGTH));

    sender.send_std(0, &[NmtCommandSpecifier::Start as u8, NODE_ID]);
    node.run(1, TICK_US);
    assert_eq!(NmtState::Operational, node.node.nmt_state());

    let messages = emcy_messages(&rx.take_with_id(0x80 + NODE_ID as u16));
    let codes: Vec<u16> = messages.iter().map(|m| m.code).collect();
    assert_eq!(
        vec![error_codes::SYNC_DATA_LENGTH, error_codes::NO_ERROR],
        codes
    );
    assert_eq!(1, messages[0].info);
}

#[serial]
#[tokio::test]
async fn test_reset_communication_clears_communication_errors() {
    const NODE_ID: u8 = 8;
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut rx = bus.new_receiver();
    let mut sender = bus.new_sender();
    let mut node = TestNode::new(&mut bus, NODE_ID);
    let emcy = node.objects.emcy;

    sender.send_std(0x80, &[1, 2]);
    emcy.report(error_bits::MANUFACTURER_START, error_codes::TEMPERATURE, 0);
    node.run(3, TICK_US);
    assert_eq!(NmtState::PreOperational, node.node.nmt_state());
    rx.flush();

    sender.send_std(0, &[NmtCommandSpecifier::ResetComm as u8, NODE_ID]);
    node.run(3, TICK_US);
    assert!(!emcy.is_error(error_bits::SYNC_LENGTH));
    assert!(!emcy.has_critical_error());
    // Application errors survive the reset
    assert!(emcy.is_error(error_bits::MANUFACTURER_START));
    assert_eq!(NmtState::Operational, node.node.nmt_state());
    // No EMCY message for the cleared bit
    assert!(rx.take_with_id(0x80 + NODE_ID as u16).is_empty());
}
