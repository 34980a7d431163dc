//! A non-blocking SDO client
//!
//! The client lets a node read and write the object dictionary of another node on the bus, for
//! example to configure it from a master. It never waits: a transfer is started with
//! [`SdoClient::start_download`] or [`SdoClient::start_upload`] and then advanced by
//! [`SdoClient::process`] until it reports [`SdoClientStatus::Done`] or
//! [`SdoClientStatus::Aborted`].
//!
//! Expedited and segmented transfers are supported in both directions.
use defmt_or_log::debug;
use snafu::Snafu;
use tincan_common::{
    messages::{SDO_REQ_BASE, SDO_RESP_BASE},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    AtomicCell, CanId, CanMessage,
};

use crate::can_module::CanRxHandler;

/// Errors when starting a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SdoClientError {
    /// Another transfer is in progress
    Busy,
    /// The node id is not in 1..=127
    #[snafu(display("Invalid server node id {node}"))]
    InvalidNode {
        /// The requested node id
        node: u8,
    },
    /// The data does not fit in the client buffer
    #[snafu(display("{len} bytes do not fit in the {capacity} byte buffer"))]
    BufferTooSmall {
        /// Length of the data
        len: usize,
        /// Size of the buffer
        capacity: usize,
    },
}

/// Progress of the current transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoClientStatus {
    /// No transfer was started
    Idle,
    /// Waiting for the server
    Waiting,
    /// The transfer finished. Holds the number of bytes transferred.
    Done(usize),
    /// The transfer was aborted, by the server or by the client. Holds the abort code.
    Aborted(u32),
}

/// Receives SDO responses for the client
///
/// Register it for `0x580` with mask `0x780`. Frames from nodes other than the current server
/// are dropped.
#[derive(Debug)]
pub struct SdoClientReceiver {
    server: AtomicCell<u8>,
    response: AtomicCell<Option<SdoResponse>>,
    malformed: AtomicCell<bool>,
}

impl Default for SdoClientReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClientReceiver {
    /// Create a receiver
    pub const fn new() -> Self {
        Self {
            server: AtomicCell::new(0),
            response: AtomicCell::new(None),
            malformed: AtomicCell::new(false),
        }
    }

    fn listen(&self, server: u8) {
        critical_section::with(|_| {
            self.server.store(server);
            self.response.store(None);
            self.malformed.store(false);
        });
    }
}

impl CanRxHandler for SdoClientReceiver {
    fn handle_frame(&self, msg: &CanMessage) {
        let server = self.server.load();
        if server == 0 || msg.is_rtr() || msg.id() != CanId::std(SDO_RESP_BASE + server as u16) {
            return;
        }
        match SdoResponse::try_from(msg.data()) {
            Ok(resp) => self.response.store(Some(resp)),
            Err(_) => self.malformed.store(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    InitiateDownload,
    DownloadSegment { toggle: bool, offset: usize, len: usize },
    InitiateUpload,
    UploadSegment { toggle: bool },
}

/// An SDO client with a caller supplied transfer buffer
#[allow(missing_debug_implementations)]
pub struct SdoClient<'a> {
    rx: &'a SdoClientReceiver,
    buffer: &'a mut [u8],
    timeout_us: u32,
    timer_us: u32,
    server: u8,
    index: u16,
    sub: u8,
    /// Download length, or the number of bytes uploaded so far
    len: usize,
    state: ClientState,
    status: SdoClientStatus,
    outgoing: Option<SdoRequest>,
}

impl<'a> SdoClient<'a> {
    /// Create a client
    ///
    /// Transfers are limited to the size of `buffer`.
    pub fn new(rx: &'a SdoClientReceiver, buffer: &'a mut [u8], timeout_us: u32) -> Self {
        Self {
            rx,
            buffer,
            timeout_us,
            timer_us: 0,
            server: 0,
            index: 0,
            sub: 0,
            len: 0,
            state: ClientState::Idle,
            status: SdoClientStatus::Idle,
            outgoing: None,
        }
    }

    /// The handler to register for SDO responses
    pub fn receiver(&self) -> &'a SdoClientReceiver {
        self.rx
    }

    /// The status of the last transfer
    pub fn status(&self) -> SdoClientStatus {
        self.status
    }

    /// Returns true while a transfer is in progress
    pub fn is_busy(&self) -> bool {
        self.state != ClientState::Idle
    }

    /// The data read by the last upload
    pub fn upload_data(&self) -> &[u8] {
        match self.status {
            SdoClientStatus::Done(len) if self.state == ClientState::Idle => &self.buffer[..len],
            _ => &[],
        }
    }

    fn begin(&mut self, node: u8, index: u16, sub: u8) -> Result<(), SdoClientError> {
        if self.is_busy() {
            return BusySnafu.fail();
        }
        if !(1..=127).contains(&node) {
            return InvalidNodeSnafu { node }.fail();
        }
        self.rx.listen(node);
        self.server = node;
        self.index = index;
        self.sub = sub;
        self.timer_us = 0;
        self.status = SdoClientStatus::Waiting;
        Ok(())
    }

    /// Start writing `data` to `index`:`sub` on node `node`
    pub fn start_download(
        &mut self,
        node: u8,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<(), SdoClientError> {
        if data.len() > self.buffer.len() {
            return BufferTooSmallSnafu {
                len: data.len(),
                capacity: self.buffer.len(),
            }
            .fail();
        }
        self.begin(node, index, sub)?;
        self.len = data.len();
        if data.len() <= 4 {
            self.outgoing = Some(SdoRequest::expedited_download(index, sub, data));
        } else {
            self.buffer[..data.len()].copy_from_slice(data);
            self.outgoing = Some(SdoRequest::initiate_download(
                index,
                sub,
                Some(data.len() as u32),
            ));
        }
        self.state = ClientState::InitiateDownload;
        Ok(())
    }

    /// Start reading `index`:`sub` from node `node`
    pub fn start_upload(&mut self, node: u8, index: u16, sub: u8) -> Result<(), SdoClientError> {
        self.begin(node, index, sub)?;
        self.len = 0;
        self.outgoing = Some(SdoRequest::initiate_upload(index, sub));
        self.state = ClientState::InitiateUpload;
        Ok(())
    }

    /// Give up on the current transfer, notifying the server
    pub fn abort(&mut self) {
        if self.is_busy() {
            self.fail(AbortCode::GeneralError);
        }
    }

    /// The identifier requests are sent with
    pub fn request_id(&self) -> CanId {
        CanId::std(SDO_REQ_BASE + self.server as u16)
    }

    /// Take the next request to send
    ///
    /// The response timeout starts when the request is taken.
    pub fn take_request(&mut self) -> Option<SdoRequest> {
        let req = self.outgoing.take();
        if req.is_some() {
            self.timer_us = 0;
        }
        req
    }

    /// Build the frame for the next request, if there is one
    pub fn take_frame(&mut self) -> Option<CanMessage> {
        let id = self.request_id();
        self.take_request().map(|req| req.to_can_message(id))
    }

    fn fail(&mut self, abort_code: AbortCode) {
        debug!(
            "SDO client abort 0x{:x}sub{} code 0x{:x}",
            self.index, self.sub, abort_code as u32
        );
        self.outgoing = Some(SdoRequest::abort(self.index, self.sub, abort_code));
        self.finish(SdoClientStatus::Aborted(abort_code as u32));
    }

    fn finish(&mut self, status: SdoClientStatus) {
        self.state = ClientState::Idle;
        self.status = status;
    }

    /// Handle a received response and advance the timeout
    pub fn process(&mut self, elapsed_us: u32) -> SdoClientStatus {
        if self.state == ClientState::Idle {
            return self.status;
        }
        if self.rx.malformed.swap(false) {
            self.fail(AbortCode::InvalidCommandSpecifier);
            return self.status;
        }
        let Some(resp) = self.rx.response.take() else {
            // The timeout runs from the moment the request left
            if self.outgoing.is_none() {
                self.timer_us = self.timer_us.saturating_add(elapsed_us);
                if self.timer_us > self.timeout_us {
                    self.fail(AbortCode::SdoTimeout);
                }
            }
            return self.status;
        };

        if let SdoResponse::Abort { abort_code, .. } = resp {
            debug!("SDO server aborted with 0x{:x}", abort_code);
            self.finish(SdoClientStatus::Aborted(abort_code));
            return self.status;
        }

        match self.state {
            ClientState::Idle => (),
            ClientState::InitiateDownload => self.initiate_download_response(resp),
            ClientState::DownloadSegment { toggle, offset, len } => {
                self.download_segment_response(resp, toggle, offset, len)
            }
            ClientState::InitiateUpload => self.initiate_upload_response(resp),
            ClientState::UploadSegment { toggle } => self.upload_segment_response(resp, toggle),
        }
        self.status
    }

    fn is_target(&self, index: u16, sub: u8) -> bool {
        index == self.index && sub == self.sub
    }

    fn send_next_segment(&mut self, toggle: bool, offset: usize) {
        let len = (self.len - offset).min(7);
        let last = offset + len == self.len;
        self.outgoing = Some(SdoRequest::download_segment(
            toggle,
            last,
            &self.buffer[offset..offset + len],
        ));
        self.state = ClientState::DownloadSegment { toggle, offset, len };
    }

    fn initiate_download_response(&mut self, resp: SdoResponse) {
        match resp {
            SdoResponse::ConfirmDownload { index, sub } if self.is_target(index, sub) => {
                if self.len <= 4 {
                    self.finish(SdoClientStatus::Done(self.len));
                } else {
                    self.send_next_segment(false, 0);
                }
            }
            SdoResponse::ConfirmDownload { .. } => self.fail(AbortCode::GeneralError),
            _ => self.fail(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn download_segment_response(
        &mut self,
        resp: SdoResponse,
        toggle: bool,
        offset: usize,
        len: usize,
    ) {
        match resp {
            SdoResponse::ConfirmDownloadSegment { t } if t == toggle => {
                let offset = offset + len;
                if offset == self.len {
                    self.finish(SdoClientStatus::Done(self.len));
                } else {
                    self.send_next_segment(!toggle, offset);
                }
            }
            SdoResponse::ConfirmDownloadSegment { .. } => {
                self.fail(AbortCode::ToggleNotAlternated)
            }
            _ => self.fail(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn initiate_upload_response(&mut self, resp: SdoResponse) {
        match resp {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                if !self.is_target(index, sub) {
                    self.fail(AbortCode::GeneralError);
                    return;
                }
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    if len > self.buffer.len() {
                        self.fail(AbortCode::OutOfMemory);
                        return;
                    }
                    self.buffer[..len].copy_from_slice(&data[..len]);
                    self.finish(SdoClientStatus::Done(len));
                    return;
                }
                if s && u32::from_le_bytes(data) as usize > self.buffer.len() {
                    self.fail(AbortCode::OutOfMemory);
                    return;
                }
                self.outgoing = Some(SdoRequest::upload_segment_request(false));
                self.state = ClientState::UploadSegment { toggle: false };
            }
            _ => self.fail(AbortCode::InvalidCommandSpecifier),
        }
    }

    fn upload_segment_response(&mut self, resp: SdoResponse, toggle: bool) {
        match resp {
            SdoResponse::UploadSegment { t, n, c, data } => {
                if t != toggle {
                    self.fail(AbortCode::ToggleNotAlternated);
                    return;
                }
                let seg_len = 7 - n as usize;
                if self.len + seg_len > self.buffer.len() {
                    self.fail(AbortCode::OutOfMemory);
                    return;
                }
                self.buffer[self.len..self.len + seg_len].copy_from_slice(&data[..seg_len]);
                self.len += seg_len;
                if c {
                    self.finish(SdoClientStatus::Done(self.len));
                } else {
                    self.outgoing = Some(SdoRequest::upload_segment_request(!toggle));
                    self.state = ClientState::UploadSegment { toggle: !toggle };
                }
            }
            _ => self.fail(AbortCode::InvalidCommandSpecifier),
        }
    }
}
