use core::cell::UnsafeCell;

use tincan_common::{
    sdo::{BlockSegment, SdoRequest},
    AtomicCell, CanMessage,
};

use crate::can_module::CanRxHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReceiverState {
    Normal,
    BlockReceive,
    BlockCompleted {
        ackseq: u8,
        last_segment: u8,
        complete: bool,
    },
}

/// Hands SDO requests from the receive interrupt to the SDO server
///
/// Regular requests are stored one at a time. During a block download the segments carry no
/// command byte and arrive back to back without acknowledgement, so they are copied straight into
/// the transfer buffer here, and the server is only involved once a block is complete.
///
/// The timer is reset on every accepted frame and advanced by the server, which aborts the
/// transfer when it exceeds the SDO timeout.
#[allow(missing_debug_implementations)]
pub struct SdoReceiver<'a> {
    request: AtomicCell<Option<SdoRequest>>,
    invalid: AtomicCell<bool>,
    state: AtomicCell<ReceiverState>,
    buffer: UnsafeCell<&'a mut [u8]>,
    timer: AtomicCell<u32>,
    last_seqnum: AtomicCell<u8>,
    blksize: AtomicCell<u8>,
}

// The buffer is only written by `handle_frame` in BlockReceive state, and only accessed by the
// server in every other state. Only the server changes the state into BlockReceive.
unsafe impl Sync for SdoReceiver<'_> {}

impl<'a> SdoReceiver<'a> {
    /// Create a receiver using `buffer` for transfers
    ///
    /// Block downloads need `7 * block size` bytes of buffer, see
    /// [`SDO_BUFFER_SIZE`](crate::sdo_server::SDO_BUFFER_SIZE). Segmented transfers larger than the
    /// buffer fall back to partial object writes.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            request: AtomicCell::new(None),
            invalid: AtomicCell::new(false),
            state: AtomicCell::new(ReceiverState::Normal),
            buffer: UnsafeCell::new(buffer),
            timer: AtomicCell::new(0),
            last_seqnum: AtomicCell::new(0),
            blksize: AtomicCell::new(0),
        }
    }

    /// Handle the payload of a request frame
    ///
    /// Returns true when the server has something to process.
    pub fn handle_req(&self, msg_data: &[u8]) -> bool {
        if msg_data.len() != 8 {
            return false;
        }
        match self.state() {
            ReceiverState::Normal => {
                match SdoRequest::try_from(msg_data) {
                    Ok(req) => self.request.store(Some(req)),
                    Err(_) => self.invalid.store(true),
                }
                self.timer.store(0);
                true
            }
            ReceiverState::BlockReceive => {
                // Sequence number 0 is not used by segments, so 0x80 in the first byte is an
                // abort
                if msg_data[0] == 0x80 {
                    if let Ok(req) = SdoRequest::try_from(msg_data) {
                        self.request.store(Some(req));
                        self.set_state(ReceiverState::Normal);
                        return true;
                    }
                }
                let Ok(segment) = BlockSegment::try_from(msg_data) else {
                    return false;
                };
                if segment.seqnum == 0 {
                    return false;
                }

                critical_section::with(|_| {
                    self.timer.store(0);
                    let pos = (segment.seqnum - 1) as usize * 7;
                    // SAFETY: in BlockReceive state the server does not touch the buffer
                    let buffer = unsafe { &mut **self.buffer.get() };
                    if pos + 7 <= buffer.len() {
                        buffer[pos..pos + 7].copy_from_slice(&segment.data);
                    }

                    let last = self.last_seqnum.load();
                    if segment.seqnum == last + 1 {
                        self.last_seqnum.store(segment.seqnum);
                    }

                    if segment.seqnum == self.blksize.load() || segment.c {
                        self.state.store(ReceiverState::BlockCompleted {
                            ackseq: self.last_seqnum.load(),
                            last_segment: segment.seqnum,
                            complete: segment.c,
                        });
                        true
                    } else {
                        false
                    }
                })
            }
            ReceiverState::BlockCompleted { .. } => true,
        }
    }

    pub(crate) fn set_state(&self, state: ReceiverState) {
        self.state.store(state);
    }

    pub(crate) fn state(&self) -> ReceiverState {
        self.state.load()
    }

    pub(crate) fn take_request(&self) -> Option<SdoRequest> {
        self.request.take()
    }

    /// Returns true once after a frame with an unknown command specifier
    pub(crate) fn take_invalid(&self) -> bool {
        self.invalid.swap(false)
    }

    /// Forget any pending request and leave block mode
    pub(crate) fn reset(&self) {
        self.request.store(None);
        self.invalid.store(false);
        self.set_state(ReceiverState::Normal);
    }

    /// Run `f` on the transfer buffer
    ///
    /// Must not be called in BlockReceive state.
    pub(crate) fn with_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(self.state() != ReceiverState::BlockReceive);
        // SAFETY: outside of BlockReceive state the receive handler does not touch the buffer
        let buffer = unsafe { &mut **self.buffer.get() };
        f(buffer)
    }

    pub(crate) fn buffer_len(&self) -> usize {
        self.with_buffer(|buf| buf.len())
    }

    pub(crate) fn begin_block_download(&self, blksize: u8) {
        critical_section::with(|_| {
            self.last_seqnum.store(0);
            self.timer.store(0);
            self.blksize.store(blksize);
            self.set_state(ReceiverState::BlockReceive);
        });
    }

    pub(crate) fn restart_block_download(&self, ackseq: u8) {
        critical_section::with(|_| {
            self.last_seqnum.store(ackseq);
            self.timer.store(0);
            self.set_state(ReceiverState::BlockReceive);
        });
    }

    pub(crate) fn reset_timer(&self) {
        self.timer.store(0);
    }

    pub(crate) fn increment_timer(&self, elapsed_us: u32) -> u32 {
        let mut timer = 0;
        // The closure always returns Some
        let _ = self.timer.fetch_update(|t| {
            timer = t.saturating_add(elapsed_us);
            Some(timer)
        });
        timer
    }
}

impl CanRxHandler for SdoReceiver<'_> {
    fn handle_frame(&self, msg: &CanMessage) {
        if !msg.is_rtr() {
            self.handle_req(msg.data());
        }
    }
}
