#![allow(dead_code)]
use tincan_node::{
    common::{
        messages::{TincanMessage, SDO_REQ_BASE, SDO_RESP_BASE},
        sdo::{BlockSegment, SdoRequest, SdoResponse},
        CanId, CanMessage,
    },
    object_dict::{find_object, ODEntry, ObjectAccess},
    SdoClientStatus,
};

use crate::{
    sim_bus::{SimBusReceiver, SimBusSender},
    test_node::TestNode,
};

/// Tick length used by the helpers, 1ms
pub const TICK_US: u32 = 1000;

/// Run one tick on every node, in order
pub fn tick_all(nodes: &mut [&mut TestNode], elapsed_us: u32) {
    for node in nodes.iter_mut() {
        node.run(1, elapsed_us);
    }
}

/// Write an object directly, bypassing SDO
pub fn od_write(od: &[ODEntry<'_>], index: u16, sub: u8, data: &[u8]) {
    find_object(od, index)
        .unwrap_or_else(|| panic!("No object 0x{index:x}"))
        .write(sub, data)
        .unwrap_or_else(|e| panic!("Writing 0x{index:x}sub{sub} failed: {e:?}"));
}

/// Drives the SDO server of a node with raw requests from outside the node
pub struct RawSdoClient {
    sender: SimBusSender<'static>,
    rx: SimBusReceiver,
}

impl RawSdoClient {
    pub fn new(sender: SimBusSender<'static>, rx: SimBusReceiver) -> Self {
        Self { sender, rx }
    }

    /// Send one request to `node` and tick it until it answers
    pub fn exchange(&mut self, node: &mut TestNode, req: SdoRequest) -> Option<SdoResponse> {
        self.rx.flush();
        self.send_raw(node, req.to_bytes());
        self.next_frame(node, 5)
            .map(|msg| SdoResponse::try_from(msg).expect("Malformed SDO response"))
    }

    /// Put a raw SDO request frame on the bus without ticking the node
    fn send_raw(&mut self, node: &TestNode, payload: [u8; 8]) {
        let node_id = node.node.node_id() as u16;
        self.sender
            .send(CanMessage::new(CanId::std(SDO_REQ_BASE + node_id), &payload));
    }

    /// Tick `node` until it sends an SDO frame, at most `ticks` times
    fn next_frame(&mut self, node: &mut TestNode, ticks: usize) -> Option<CanMessage> {
        let resp_id = CanId::std(SDO_RESP_BASE + node.node.node_id() as u16);
        for _ in 0..ticks {
            node.run(1, TICK_US);
            while let Some(msg) = self.rx.try_recv() {
                if msg.id() == resp_id {
                    return Some(msg);
                }
            }
        }
        None
    }

    /// Write `data` with a block download, in blocks as large as the server allows
    pub fn block_download(
        &mut self,
        node: &mut TestNode,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<(), u32> {
        let init = SdoRequest::initiate_block_download(index, sub, true, data.len() as u32);
        let mut blksize = match self.exchange(node, init) {
            Some(SdoResponse::ConfirmBlockDownload { blksize, .. }) => blksize as usize,
            Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
            other => panic!("Unexpected response {other:?}"),
        };

        let segments: Vec<&[u8]> = data.chunks(7).collect();
        let mut pos = 0;
        while pos < segments.len() {
            let block = &segments[pos..(pos + blksize).min(segments.len())];
            self.rx.flush();
            for (i, chunk) in block.iter().enumerate() {
                let mut seg = [0; 7];
                seg[..chunk.len()].copy_from_slice(chunk);
                let segment = BlockSegment {
                    c: pos + i + 1 == segments.len(),
                    seqnum: i as u8 + 1,
                    data: seg,
                };
                self.send_raw(node, segment.to_bytes());
            }
            let msg = self.next_frame(node, 5).expect("No block confirmation");
            match SdoResponse::try_from(msg) {
                Ok(SdoResponse::ConfirmBlock { ackseq, blksize: next }) => {
                    assert_eq!(block.len(), ackseq as usize);
                    blksize = next as usize;
                }
                Ok(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
                other => panic!("Unexpected response {other:?}"),
            }
            pos += block.len();
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let crc = crc16::State::<crc16::XMODEM>::calculate(data);
        match self.exchange(node, SdoRequest::end_block_download(n, crc)) {
            Some(SdoResponse::ConfirmBlockDownloadEnd) => Ok(()),
            Some(SdoResponse::Abort { abort_code, .. }) => Err(abort_code),
            other => panic!("Unexpected response {other:?}"),
        }
    }

    /// Read `index`:`sub` with a block upload of `blksize` segments per block
    pub fn block_upload(
        &mut self,
        node: &mut TestNode,
        index: u16,
        sub: u8,
        blksize: u8,
    ) -> Result<Vec<u8>, u32> {
        let init = SdoRequest::initiate_block_upload(index, sub, true, blksize);
        let size = match self.exchange(node, init) {
            Some(SdoResponse::ConfirmBlockUpload { size, .. }) => size as usize,
            Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
            other => panic!("Unexpected response {other:?}"),
        };

        self.rx.flush();
        self.send_raw(node, SdoRequest::StartBlockUpload.to_bytes());
        let mut out = Vec::new();
        let mut ackseq = 0;
        let mut complete = false;
        while let Some(msg) = self.next_frame(node, 5) {
            if complete {
                let (n, crc) = match SdoResponse::try_from(msg) {
                    Ok(SdoResponse::EndBlockUpload { n, crc }) => (n, crc),
                    other => panic!("Expected the end of the upload, got {other:?}"),
                };
                out.truncate(out.len() - n as usize);
                assert_eq!(crc16::State::<crc16::XMODEM>::calculate(&out), crc);
                self.send_raw(node, SdoRequest::EndBlockUpload.to_bytes());
                assert_eq!(size, out.len());
                return Ok(out);
            }
            let segment = BlockSegment::try_from(msg.data()).expect("Short block segment");
            if segment.seqnum == 0 {
                // Only an abort has this shape
                return match SdoResponse::try_from(msg) {
                    Ok(SdoResponse::Abort { abort_code, .. }) => Err(abort_code),
                    other => panic!("Unexpected response {other:?}"),
                };
            }
            assert_eq!(ackseq + 1, segment.seqnum);
            out.extend_from_slice(&segment.data);
            ackseq = segment.seqnum;
            if segment.c || ackseq == blksize {
                complete = segment.c;
                self.send_raw(node, SdoRequest::ConfirmBlock { ackseq, blksize }.to_bytes());
                ackseq = 0;
            }
        }
        panic!("Block upload of 0x{index:x}sub{sub} stalled");
    }

    /// Write `data` to `index`:`sub`, returning the abort code on failure
    pub fn download(
        &mut self,
        node: &mut TestNode,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<(), u32> {
        if data.len() <= 4 {
            return match self.exchange(node, SdoRequest::expedited_download(index, sub, data)) {
                Some(SdoResponse::ConfirmDownload { .. }) => Ok(()),
                Some(SdoResponse::Abort { abort_code, .. }) => Err(abort_code),
                other => panic!("Unexpected response {other:?}"),
            };
        }

        let init = SdoRequest::initiate_download(index, sub, Some(data.len() as u32));
        match self.exchange(node, init) {
            Some(SdoResponse::ConfirmDownload { .. }) => (),
            Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
            other => panic!("Unexpected response {other:?}"),
        }
        let mut toggle = false;
        let chunks: Vec<&[u8]> = data.chunks(7).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i == chunks.len() - 1;
            let req = SdoRequest::download_segment(toggle, last, chunk);
            match self.exchange(node, req) {
                Some(SdoResponse::ConfirmDownloadSegment { t }) => assert_eq!(toggle, t),
                Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
                other => panic!("Unexpected response {other:?}"),
            }
            toggle = !toggle;
        }
        Ok(())
    }

    /// Read `index`:`sub`, returning the abort code on failure
    pub fn upload(&mut self, node: &mut TestNode, index: u16, sub: u8) -> Result<Vec<u8>, u32> {
        let size = match self.exchange(node, SdoRequest::initiate_upload(index, sub)) {
            Some(SdoResponse::ConfirmUpload {
                n, e: true, s, data, ..
            }) => {
                let len = if s { 4 - n as usize } else { 4 };
                return Ok(data[..len].to_vec());
            }
            Some(SdoResponse::ConfirmUpload { e: false, data, .. }) => {
                u32::from_le_bytes(data) as usize
            }
            Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
            other => panic!("Unexpected response {other:?}"),
        };

        let mut out = Vec::new();
        let mut toggle = false;
        loop {
            match self.exchange(node, SdoRequest::upload_segment_request(toggle)) {
                Some(SdoResponse::UploadSegment { t, n, c, data }) => {
                    assert_eq!(toggle, t);
                    out.extend_from_slice(&data[..7 - n as usize]);
                    if c {
                        break;
                    }
                }
                Some(SdoResponse::Abort { abort_code, .. }) => return Err(abort_code),
                other => panic!("Unexpected response {other:?}"),
            }
            toggle = !toggle;
        }
        assert_eq!(size, out.len());
        Ok(out)
    }

    pub fn download_u32(
        &mut self,
        node: &mut TestNode,
        index: u16,
        sub: u8,
        value: u32,
    ) -> Result<(), u32> {
        self.download(node, index, sub, &value.to_le_bytes())
    }

    pub fn upload_u32(&mut self, node: &mut TestNode, index: u16, sub: u8) -> Result<u32, u32> {
        let data = self.upload(node, index, sub)?;
        let mut bytes = [0; 4];
        bytes[..data.len().min(4)].copy_from_slice(&data[..data.len().min(4)]);
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Tick the master, then the other nodes, until the master's SDO client finishes
pub fn run_client(master: &mut TestNode, others: &mut [&mut TestNode]) -> SdoClientStatus {
    for _ in 0..1000 {
        master.run(1, TICK_US);
        let status = master.node.sdo_client_status();
        if status != SdoClientStatus::Waiting {
            return status;
        }
        tick_all(others, TICK_US);
    }
    master.node.sdo_client_status()
}

/// Prints every frame seen on the bus when dropped
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        while let Some(msg) = self.rx.try_recv() {
            match TincanMessage::try_from(msg) {
                Ok(parsed) => println!("{parsed:?}"),
                Err(_) => println!("{msg:?}"),
            }
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}

/// The data of every frame in `frames`
pub fn payloads(frames: &[CanMessage]) -> Vec<Vec<u8>> {
    frames.iter().map(|f| f.data().to_vec()).collect()
}
