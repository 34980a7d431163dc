use integration_tests::{
    sim_bus::SimBus,
    test_node::{TestNode, TestObjects},
    utils::{run_client, BusLogger, RawSdoClient, TICK_US},
};
use serial_test::serial;
use tincan_node::{
    common::{
        sdo::{AbortCode, SdoRequest, SdoResponse},
        StackConfig,
    },
    SdoClientStatus,
};

const NODE_ID: u8 = 3;

fn setup() -> (SimBus<'static>, RawSdoClient, TestNode) {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let node = TestNode::new(&mut bus, NODE_ID);
    (bus, client, node)
}

#[serial]
#[tokio::test]
async fn test_expedited_transfer() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    client
        .download_u32(&mut node, 0x2000, 1, 0xDEAD_BEEF)
        .unwrap();
    assert_eq!(0xDEAD_BEEF, node.objects.app.value.load());
    assert_eq!(Ok(0xDEAD_BEEF), client.upload_u32(&mut node, 0x2000, 1));

    client.download(&mut node, 0x2000, 2, &[0x34, 0x12]).unwrap();
    assert_eq!(0x1234, node.objects.app.left.load());
    assert_eq!(Ok(vec![0x34, 0x12]), client.upload(&mut node, 0x2000, 2));

    // Sub 0 of a record reports the highest sub index
    assert_eq!(Ok(vec![4]), client.upload(&mut node, 0x2000, 0));
}

#[serial]
#[tokio::test]
async fn test_segmented_transfer() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    client
        .download(&mut node, 0x2000, 4, b"tincan-node-1234")
        .unwrap();
    assert_eq!(
        Ok(b"tincan-node-1234".to_vec()),
        client.upload(&mut node, 0x2000, 4)
    );

    // A shorter string replaces the longer one
    client.download(&mut node, 0x2000, 4, b"second").unwrap();
    assert_eq!(Ok(b"second".to_vec()), client.upload(&mut node, 0x2000, 4));
}

#[serial]
#[tokio::test]
async fn test_toggle_error_aborts_download() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    let init = SdoRequest::initiate_download(0x2000, 4, Some(20));
    assert!(matches!(
        client.exchange(&mut node, init),
        Some(SdoResponse::ConfirmDownload { .. })
    ));
    let first = SdoRequest::download_segment(false, false, b"abcdefg");
    assert_eq!(
        Some(SdoResponse::ConfirmDownloadSegment { t: false }),
        client.exchange(&mut node, first)
    );
    // The toggle bit must alternate
    let repeated = SdoRequest::download_segment(false, false, b"hijklmn");
    match client.exchange(&mut node, repeated) {
        Some(SdoResponse::Abort { abort_code, .. }) => {
            assert_eq!(AbortCode::ToggleNotAlternated as u32, abort_code)
        }
        other => panic!("Expected abort, got {other:?}"),
    }

    assert_eq!([0; 20], node.objects.app.name.load());

    // The server is ready for the next transfer
    client.download_u32(&mut node, 0x2000, 1, 7).unwrap();
    assert_eq!(7, node.objects.app.value.load());
}

#[serial]
#[tokio::test]
async fn test_access_errors() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    assert_eq!(
        Err(AbortCode::NoSuchObject as u32),
        client.upload(&mut node, 0x3000, 0)
    );
    assert_eq!(
        Err(AbortCode::NoSuchSubIndex as u32),
        client.upload(&mut node, 0x2000, 9)
    );
    assert_eq!(
        Err(AbortCode::ReadOnly as u32),
        client.download_u32(&mut node, 0x1000, 0, 1)
    );
    // A u16 sub object refuses four bytes
    assert_eq!(
        Err(AbortCode::DataTypeMismatchLengthHigh as u32),
        client.download_u32(&mut node, 0x2000, 2, 1)
    );
}

#[serial]
#[tokio::test]
async fn test_segment_timeout() {
    let (mut bus, mut client, mut node) = setup();
    let mut rx = bus.new_receiver();

    let init = SdoRequest::initiate_download(0x2000, 4, Some(10));
    assert!(matches!(
        client.exchange(&mut node, init),
        Some(SdoResponse::ConfirmDownload { .. })
    ));
    rx.flush();

    // The default server timeout is 25ms
    node.run(30, TICK_US);
    let frames = rx.take_with_id(0x580 + NODE_ID as u16);
    assert_eq!(1, frames.len());
    assert_eq!(
        SdoResponse::Abort {
            index: 0x2000,
            sub: 4,
            abort_code: AbortCode::SdoTimeout as u32
        },
        SdoResponse::try_from(frames[0]).unwrap()
    );
}

#[serial]
#[tokio::test]
async fn test_client_against_server() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let _logger = BusLogger::new(bus.new_receiver());
    let mut master = TestNode::new(&mut bus, 1);
    let mut slave = TestNode::new(&mut bus, 2);

    let client = master.node.sdo_client().unwrap();
    client
        .start_download(2, 0x2000, 1, &1234u32.to_le_bytes())
        .unwrap();
    assert_eq!(
        SdoClientStatus::Done(4),
        run_client(&mut master, &mut [&mut slave])
    );
    assert_eq!(1234, slave.objects.app.value.load());

    let client = master.node.sdo_client().unwrap();
    client
        .start_download(2, 0x2000, 4, b"segmented value")
        .unwrap();
    assert_eq!(
        SdoClientStatus::Done(15),
        run_client(&mut master, &mut [&mut slave])
    );

    let client = master.node.sdo_client().unwrap();
    client.start_upload(2, 0x2000, 4).unwrap();
    assert_eq!(
        SdoClientStatus::Done(15),
        run_client(&mut master, &mut [&mut slave])
    );
    assert_eq!(
        b"segmented value",
        master.node.sdo_client().unwrap().upload_data()
    );

    let client = master.node.sdo_client().unwrap();
    client.start_upload(2, 0x3000, 0).unwrap();
    assert_eq!(
        SdoClientStatus::Aborted(AbortCode::NoSuchObject as u32),
        run_client(&mut master, &mut [&mut slave])
    );
}

#[serial]
#[tokio::test]
async fn test_client_timeout() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let config = StackConfig::new().with_sdo_client_timeout_us(20_000);
    let mut master = TestObjects::new().start(&mut bus, 1, config);

    let client = master.node.sdo_client().unwrap();
    client.start_upload(9, 0x1000, 0).unwrap();
    assert_eq!(
        SdoClientStatus::Aborted(AbortCode::SdoTimeout as u32),
        run_client(&mut master, &mut [])
    );

    // A second transfer can start once the first is finished
    let client = master.node.sdo_client().unwrap();
    client.start_upload(9, 0x1000, 0).unwrap();
    assert_eq!(SdoClientStatus::Waiting, master.node.sdo_client_status());
}

#[serial]
#[tokio::test]
async fn test_block_transfer() {
    let (mut bus, mut client, mut node) = setup();
    let _logger = BusLogger::new(bus.new_receiver());

    client
        .block_download(&mut node, 0x2000, 4, b"tincan-block-upload!")
        .unwrap();
    assert_eq!(*b"tincan-block-upload!", node.objects.app.name.load());
    assert_eq!(
        Ok(b"tincan-block-upload!".to_vec()),
        client.block_upload(&mut node, 0x2000, 4, 127)
    );

    // Several blocks in each direction
    client
        .block_download(&mut node, 0x2000, 4, b"several blocks")
        .unwrap();
    assert_eq!(
        Ok(b"several blocks".to_vec()),
        client.block_upload(&mut node, 0x2000, 4, 1)
    );

    assert_eq!(
        Err(AbortCode::NoSuchObject as u32),
        client.block_upload(&mut node, 0x2400, 0, 127)
    );
}

#[serial]
#[tokio::test]
async fn test_block_download_in_several_blocks() {
    let _ = env_logger::try_init();
    let mut bus = SimBus::new();
    let mut client = RawSdoClient::new(bus.new_sender(), bus.new_receiver());
    let config = StackConfig::new().with_sdo_block_size(2);
    let mut node = TestObjects::new().start(&mut bus, NODE_ID, config);

    client
        .block_download(&mut node, 0x2000, 4, b"three segments long!")
        .unwrap();
    assert_eq!(
        Ok(b"three segments long!".to_vec()),
        client.upload(&mut node, 0x2000, 4)
    );

    // Too long for the string
    assert_eq!(
        Err(AbortCode::DataTypeMismatchLengthHigh as u32),
        client.block_download(&mut node, 0x2000, 4, &[b'x'; 24])
    );
    assert_eq!(
        Ok(b"three segments long!".to_vec()),
        client.upload(&mut node, 0x2000, 4)
    );
}
