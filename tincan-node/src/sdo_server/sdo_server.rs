use crc16::CrcType as _;
use defmt_or_log::debug;
use tincan_common::{
    messages::NmtState,
    objects::{DataType, ObjectId, SubInfo},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    StackConfig,
};

use crate::object_dict::{find_object_entry, ODEntry, ObjectAccess};

use super::sdo_receiver::{ReceiverState, SdoReceiver};

fn validate_download_size(dl_size: usize, subobj: &SubInfo) -> Result<(), AbortCode> {
    if subobj.size == 0 {
        // Domains without a known size report 0, the write itself decides
        return Ok(());
    }
    if subobj.data_type.is_str() || matches!(subobj.data_type, DataType::Domain) {
        if dl_size > subobj.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else if dl_size < subobj.size {
        return Err(AbortCode::DataTypeMismatchLengthLow);
    } else if dl_size > subobj.size {
        return Err(AbortCode::DataTypeMismatchLengthHigh);
    }
    Ok(())
}

/// A frame produced by the SDO server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoServerFrame {
    /// A response to a client request
    Response(SdoResponse),
    /// A block upload segment
    Segment(BlockSegment),
}

impl SdoServerFrame {
    /// Encode the frame payload
    pub fn to_bytes(self) -> [u8; 8] {
        match self {
            SdoServerFrame::Response(resp) => resp.to_bytes(),
            SdoServerFrame::Segment(seg) => seg.to_bytes(),
        }
    }
}

impl From<SdoResponse> for SdoServerFrame {
    fn from(value: SdoResponse) -> Self {
        SdoServerFrame::Response(value)
    }
}

/// The object a transfer operates on
#[derive(Clone, Copy)]
struct Target<'a> {
    index: u16,
    sub: u8,
    object: &'a dyn ObjectAccess,
}

#[derive(Clone, Copy)]
struct Segmented<'a> {
    target: Target<'a>,
    toggle_state: bool,
    segment_counter: u32,
    bytes_in_buffer: Option<u32>,
}

#[derive(Clone, Copy)]
struct DownloadBlock<'a> {
    target: Target<'a>,
    last_segment: u8,
    client_supports_crc: bool,
    crc: u16,
    block_counter: usize,
}

#[derive(Clone, Copy)]
struct UploadBlock<'a> {
    target: Target<'a>,
    size: usize,
    blksize: u8,
    /// Offset of the first byte of the current block
    block_start: usize,
    /// Sequence number of the last segment sent in the current block
    seqnum: u8,
}

#[derive(Clone, Copy)]
enum SdoState<'a> {
    Idle,
    DownloadSegmented(Segmented<'a>),
    UploadSegmented(Segmented<'a>),
    DownloadBlock(DownloadBlock<'a>),
    EndDownloadBlock(DownloadBlock<'a>),
    UploadBlockInitiated(UploadBlock<'a>),
    UploadBlockSending(UploadBlock<'a>),
    UploadBlockAwaitAck(UploadBlock<'a>),
    UploadBlockEnd(Target<'a>),
}

struct SdoResult<'a> {
    frame: Option<SdoServerFrame>,
    updated_object: Option<ObjectId>,
    new_state: SdoState<'a>,
}

impl<'a> SdoResult<'a> {
    fn no_response(new_state: SdoState<'a>) -> Self {
        Self {
            frame: None,
            updated_object: None,
            new_state,
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        Self {
            frame: Some(SdoResponse::abort(index, sub, abort_code).into()),
            updated_object: None,
            new_state: SdoState::Idle,
        }
    }

    fn abort_target(target: &Target<'_>, abort_code: AbortCode) -> Self {
        Self::abort(target.index, target.sub, abort_code)
    }

    fn response(response: SdoResponse, new_state: SdoState<'a>) -> Self {
        Self {
            frame: Some(response.into()),
            updated_object: None,
            new_state,
        }
    }

    fn segment(segment: BlockSegment, new_state: SdoState<'a>) -> Self {
        Self {
            frame: Some(SdoServerFrame::Segment(segment)),
            updated_object: None,
            new_state,
        }
    }

    fn response_with_update(response: SdoResponse, target: &Target<'_>) -> Self {
        Self {
            frame: Some(response.into()),
            updated_object: Some(ObjectId {
                index: target.index,
                sub: target.sub,
            }),
            new_state: SdoState::Idle,
        }
    }
}

enum Incoming {
    Request(SdoRequest),
    Waiting,
    TimedOut,
}

struct Ctx<'r, 'b> {
    rx: &'r SdoReceiver<'b>,
    elapsed_us: u32,
    timeout_us: u32,
    blksize: u8,
}

impl Ctx<'_, '_> {
    fn incoming(&self) -> Incoming {
        match self.rx.take_request() {
            Some(req) => Incoming::Request(req),
            None if self.rx.increment_timer(self.elapsed_us) > self.timeout_us => {
                Incoming::TimedOut
            }
            None => Incoming::Waiting,
        }
    }
}

fn lookup<'a>(od: &'a [ODEntry<'a>], index: u16, sub: u8) -> Result<(Target<'a>, SubInfo), AbortCode> {
    let entry = find_object_entry(od, index).ok_or(AbortCode::NoSuchObject)?;
    let info = entry.data.sub_info(sub)?;
    Ok((
        Target {
            index,
            sub,
            object: entry.data,
        },
        info,
    ))
}

/// Handle a request which does not belong to the current transfer
fn unexpected<'a>(req: SdoRequest, target: &Target<'_>) -> SdoResult<'a> {
    match req {
        SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
        _ => SdoResult::abort_target(target, AbortCode::InvalidCommandSpecifier),
    }
}

impl<'a> SdoState<'a> {
    fn target(&self) -> Option<Target<'a>> {
        match self {
            SdoState::Idle => None,
            SdoState::DownloadSegmented(s) | SdoState::UploadSegmented(s) => Some(s.target),
            SdoState::DownloadBlock(s) | SdoState::EndDownloadBlock(s) => Some(s.target),
            SdoState::UploadBlockInitiated(s)
            | SdoState::UploadBlockSending(s)
            | SdoState::UploadBlockAwaitAck(s) => Some(s.target),
            SdoState::UploadBlockEnd(t) => Some(*t),
        }
    }

    fn update(self, ctx: &Ctx<'_, '_>, od: &'a [ODEntry<'a>]) -> SdoResult<'a> {
        if ctx.rx.take_invalid() {
            let (index, sub) = self.target().map(|t| (t.index, t.sub)).unwrap_or((0, 0));
            ctx.rx.reset();
            return SdoResult::abort(index, sub, AbortCode::InvalidCommandSpecifier);
        }
        match self {
            SdoState::Idle => Self::idle(ctx, od),
            SdoState::DownloadSegmented(state) => Self::download_segmented(state, ctx),
            SdoState::UploadSegmented(state) => Self::upload_segmented(state, ctx),
            SdoState::DownloadBlock(state) => Self::download_block(state, ctx),
            SdoState::EndDownloadBlock(state) => Self::end_download_block(state, ctx),
            SdoState::UploadBlockInitiated(state) => Self::upload_block_initiated(state, ctx),
            SdoState::UploadBlockSending(state) => Self::upload_block_sending(state, ctx),
            SdoState::UploadBlockAwaitAck(state) => Self::upload_block_await_ack(state, ctx),
            SdoState::UploadBlockEnd(target) => Self::upload_block_end(target, ctx),
        }
    }

    fn idle(ctx: &Ctx<'_, '_>, od: &'a [ODEntry<'a>]) -> SdoResult<'a> {
        let Some(req) = ctx.rx.take_request() else {
            return SdoResult::no_response(SdoState::Idle);
        };

        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let (target, info) = match lookup(od, index, sub) {
                    Ok(x) => x,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                if !info.access_type.is_writable() {
                    return SdoResult::abort(index, sub, AbortCode::ReadOnly);
                }

                if e {
                    let dl_size = if s {
                        4 - n as usize
                    } else {
                        info.size.clamp(1, 4)
                    };
                    if let Err(abort_code) = validate_download_size(dl_size, &info) {
                        return SdoResult::abort(index, sub, abort_code);
                    }
                    if let Err(abort_code) = target.object.write(sub, &data[..dl_size]) {
                        return SdoResult::abort(index, sub, abort_code);
                    }
                    SdoResult::response_with_update(
                        SdoResponse::download_acknowledge(index, sub),
                        &target,
                    )
                } else {
                    if s {
                        let dl_size = u32::from_le_bytes(data) as usize;
                        if let Err(abort_code) = validate_download_size(dl_size, &info) {
                            return SdoResult::abort(index, sub, abort_code);
                        }
                    }
                    SdoResult::response(
                        SdoResponse::download_acknowledge(index, sub),
                        SdoState::DownloadSegmented(Segmented {
                            target,
                            toggle_state: false,
                            segment_counter: 0,
                            bytes_in_buffer: Some(0),
                        }),
                    )
                }
            }
            SdoRequest::InitiateUpload { index, sub } => match lookup(od, index, sub) {
                Ok((target, _)) => Self::start_upload(target, ctx),
                Err(abort_code) => SdoResult::abort(index, sub, abort_code),
            },
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let (target, info) = match lookup(od, index, sub) {
                    Ok(x) => x,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                if !info.access_type.is_writable() {
                    return SdoResult::abort(index, sub, AbortCode::ReadOnly);
                }
                if s {
                    if let Err(abort_code) = validate_download_size(size as usize, &info) {
                        return SdoResult::abort(index, sub, abort_code);
                    }
                }

                ctx.rx.begin_block_download(ctx.blksize);
                SdoResult::response(
                    SdoResponse::block_download_acknowledge(true, index, sub, ctx.blksize),
                    SdoState::DownloadBlock(DownloadBlock {
                        target,
                        client_supports_crc: cc,
                        block_counter: 0,
                        last_segment: 0,
                        crc: crc16::XMODEM::init(),
                    }),
                )
            }
            SdoRequest::InitiateBlockUpload {
                cc: _,
                index,
                sub,
                blksize,
                pst,
            } => {
                if blksize == 0 || blksize > 127 {
                    return SdoResult::abort(index, sub, AbortCode::InvalidBlockSize);
                }
                let (target, _) = match lookup(od, index, sub) {
                    Ok(x) => x,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                let size = match ctx.rx.with_buffer(|buf| target.object.read(sub, 0, buf)) {
                    Ok(size) => size,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                if size == ctx.rx.buffer_len()
                    && target.object.read_size(sub).unwrap_or(0) > size
                {
                    return SdoResult::abort(index, sub, AbortCode::OutOfMemory);
                }
                if pst != 0 && size <= pst as usize {
                    // Small enough to switch to a regular upload
                    return Self::start_upload(target, ctx);
                }
                SdoResult::response(
                    SdoResponse::ConfirmBlockUpload {
                        sc: true,
                        s: true,
                        index,
                        sub,
                        size: size as u32,
                    },
                    SdoState::UploadBlockInitiated(UploadBlock {
                        target,
                        size,
                        blksize,
                        block_start: 0,
                        seqnum: 0,
                    }),
                )
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    fn start_upload(target: Target<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let (index, sub) = (target.index, target.sub);
        ctx.rx.with_buffer(|full_buf| {
            let len = full_buf.len();
            // Keep the buffer a whole number of segments
            let buf = &mut full_buf[..len - (len % 7)];
            let read_size = match target.object.read(sub, 0, buf) {
                Ok(s) => s,
                Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
            };

            if read_size <= 4 {
                return SdoResult::response(
                    SdoResponse::expedited_upload(index, sub, &buf[..read_size]),
                    SdoState::Idle,
                );
            }
            // A read which fills the buffer may be followed by more data, so no size is announced.
            // Such objects are read in several pieces, which is not atomic.
            let ack_size = if read_size == buf.len() {
                None
            } else {
                Some(read_size as u32)
            };
            SdoResult::response(
                SdoResponse::upload_acknowledge(index, sub, ack_size),
                SdoState::UploadSegmented(Segmented {
                    target,
                    toggle_state: false,
                    segment_counter: 0,
                    bytes_in_buffer: ack_size,
                }),
            )
        })
    }

    fn download_segmented(state: Segmented<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let target = state.target;
        let req = match ctx.incoming() {
            Incoming::Request(req) => req,
            Incoming::Waiting => return SdoResult::no_response(SdoState::DownloadSegmented(state)),
            Incoming::TimedOut => return SdoResult::abort_target(&target, AbortCode::SdoTimeout),
        };
        let SdoRequest::DownloadSegment { t, n, c, data } = req else {
            return unexpected(req, &target);
        };
        if t != state.toggle_state {
            return SdoResult::abort_target(&target, AbortCode::ToggleNotAlternated);
        }

        let obj = target.object;
        let sub = target.sub;
        let result = ctx.rx.with_buffer(|buf| -> Result<(), AbortCode> {
            let len = buf.len();
            let total_offset = state.segment_counter as usize * 7;
            let offset = total_offset % len;
            let on_first_buffer = total_offset < len;
            let segment_size = 7 - n as usize;

            let copy_len = segment_size.min(len - offset);
            buf[offset..offset + copy_len].copy_from_slice(&data[..copy_len]);
            let spill = segment_size - copy_len;
            let buffer_full = offset + copy_len == len;

            // A full buffer is handed to the object as a partial write, unless it holds the
            // complete value
            let flushed = buffer_full && (!c || spill > 0);
            if flushed {
                if on_first_buffer {
                    obj.begin_partial(sub)?;
                }
                obj.write_partial(sub, buf)?;
                buf[..spill].copy_from_slice(&data[copy_len..segment_size]);
            }

            if c {
                if flushed || !on_first_buffer {
                    let remaining = if flushed { spill } else { offset + copy_len };
                    if remaining > 0 {
                        obj.write_partial(sub, &buf[..remaining])?;
                    }
                    obj.end_partial(sub)?;
                } else {
                    obj.write(sub, &buf[..offset + copy_len])?;
                }
            }
            Ok(())
        });

        match result {
            Err(abort_code) => SdoResult::abort_target(&target, abort_code),
            Ok(()) if c => SdoResult::response_with_update(
                SdoResponse::download_segment_acknowledge(state.toggle_state),
                &target,
            ),
            Ok(()) => SdoResult::response(
                SdoResponse::download_segment_acknowledge(state.toggle_state),
                SdoState::DownloadSegmented(Segmented {
                    toggle_state: !state.toggle_state,
                    segment_counter: state.segment_counter + 1,
                    ..state
                }),
            ),
        }
    }

    fn upload_segmented(state: Segmented<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let target = state.target;
        let req = match ctx.incoming() {
            Incoming::Request(req) => req,
            Incoming::Waiting => return SdoResult::no_response(SdoState::UploadSegmented(state)),
            Incoming::TimedOut => return SdoResult::abort_target(&target, AbortCode::SdoTimeout),
        };
        let SdoRequest::ReqUploadSegment { t } = req else {
            return unexpected(req, &target);
        };
        if t != state.toggle_state {
            return SdoResult::abort_target(&target, AbortCode::ToggleNotAlternated);
        }

        ctx.rx.with_buffer(|full_buf| {
            let len = full_buf.len();
            let buf = &mut full_buf[..len - (len % 7)];

            let total_read_offset = state.segment_counter as usize * 7;
            let buf_read_offset = total_read_offset % buf.len();
            let available = match state.bytes_in_buffer {
                Some(bytes) => bytes as usize,
                None => buf.len(),
            };
            let segment_size = (available - buf_read_offset).min(7);
            let mut msg_buf = [0; 7];
            msg_buf[..segment_size]
                .copy_from_slice(&buf[buf_read_offset..buf_read_offset + segment_size]);

            let mut c = false;
            let mut bytes_in_buffer = state.bytes_in_buffer;
            match state.bytes_in_buffer {
                None if buf_read_offset + segment_size == buf.len() => {
                    // The buffer is used up, read the next piece of the object
                    let read_size = match target.object.read(
                        target.sub,
                        total_read_offset + segment_size,
                        buf,
                    ) {
                        Ok(s) => s,
                        Err(abort_code) => return SdoResult::abort_target(&target, abort_code),
                    };
                    if read_size == 0 {
                        c = true;
                    } else if read_size != buf.len() {
                        bytes_in_buffer = Some(read_size as u32);
                    }
                }
                None => (),
                Some(bytes) => c = buf_read_offset + segment_size == bytes as usize,
            }

            let response =
                SdoResponse::upload_segment(state.toggle_state, c, &msg_buf[..segment_size]);
            if c {
                SdoResult::response(response, SdoState::Idle)
            } else {
                SdoResult::response(
                    response,
                    SdoState::UploadSegmented(Segmented {
                        target,
                        toggle_state: !state.toggle_state,
                        segment_counter: state.segment_counter + 1,
                        bytes_in_buffer,
                    }),
                )
            }
        })
    }

    fn download_block(state: DownloadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let target = state.target;
        // Segments are collected by the receiver, this only runs once a block is complete
        match ctx.rx.state() {
            ReceiverState::Normal => {
                // The receiver drops back to Normal when it sees an abort
                let _ = ctx.rx.take_request();
                SdoResult::no_response(SdoState::Idle)
            }
            ReceiverState::BlockReceive => {
                if ctx.rx.increment_timer(ctx.elapsed_us) > ctx.timeout_us {
                    ctx.rx.set_state(ReceiverState::Normal);
                    SdoResult::abort_target(&target, AbortCode::SdoTimeout)
                } else {
                    SdoResult::no_response(SdoState::DownloadBlock(state))
                }
            }
            ReceiverState::BlockCompleted {
                ackseq,
                last_segment,
                complete,
            } => {
                let confirm = SdoResponse::ConfirmBlock {
                    ackseq,
                    blksize: ctx.blksize,
                };
                if ackseq != last_segment {
                    // A segment went missing, the client repeats everything after ackseq
                    ctx.rx.restart_block_download(ackseq);
                    return SdoResult::response(confirm, SdoState::DownloadBlock(state));
                }

                if complete {
                    // The last block is written once the end request says how many bytes of the
                    // final segment are valid
                    ctx.rx.set_state(ReceiverState::Normal);
                    return SdoResult::response(
                        confirm,
                        SdoState::EndDownloadBlock(DownloadBlock {
                            block_counter: state.block_counter + 1,
                            last_segment,
                            ..state
                        }),
                    );
                }

                // A full block of a multi block transfer
                ctx.rx.set_state(ReceiverState::Normal);
                let write_length = last_segment as usize * 7;
                let result = ctx.rx.with_buffer(|buf| {
                    let valid_data = &buf[..write_length];
                    if state.block_counter == 0 {
                        target.object.begin_partial(target.sub)?;
                    }
                    target.object.write_partial(target.sub, valid_data)?;
                    Ok(crc16::XMODEM::update(state.crc, valid_data))
                });
                match result {
                    Ok(crc) => {
                        ctx.rx.begin_block_download(ctx.blksize);
                        SdoResult::response(
                            confirm,
                            SdoState::DownloadBlock(DownloadBlock {
                                block_counter: state.block_counter + 1,
                                crc,
                                ..state
                            }),
                        )
                    }
                    Err(abort_code) => SdoResult::abort_target(&target, abort_code),
                }
            }
        }
    }

    fn end_download_block(state: DownloadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let target = state.target;
        let req = match ctx.incoming() {
            Incoming::Request(req) => req,
            Incoming::Waiting => return SdoResult::no_response(SdoState::EndDownloadBlock(state)),
            Incoming::TimedOut => return SdoResult::abort_target(&target, AbortCode::SdoTimeout),
        };
        let SdoRequest::EndBlockDownload { n, crc } = req else {
            return unexpected(req, &target);
        };

        let Some(write_len) = (state.last_segment as usize * 7).checked_sub(n as usize) else {
            return SdoResult::abort_target(&target, AbortCode::InvalidValue);
        };
        let result = ctx.rx.with_buffer(|buf| {
            let valid_data = &buf[..write_len.min(buf.len())];
            let crc_calc = crc16::XMODEM::get(crc16::XMODEM::update(state.crc, valid_data));
            if state.client_supports_crc && crc_calc != crc {
                return Err(AbortCode::CrcError);
            }
            let obj = target.object;
            if state.block_counter == 1 {
                obj.write(target.sub, valid_data)
            } else {
                obj.write_partial(target.sub, valid_data)?;
                obj.end_partial(target.sub)
            }
        });

        match result {
            Ok(()) => {
                SdoResult::response_with_update(SdoResponse::ConfirmBlockDownloadEnd, &target)
            }
            Err(abort_code) => SdoResult::abort_target(&target, abort_code),
        }
    }

    fn upload_block_initiated(state: UploadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let req = match ctx.incoming() {
            Incoming::Request(req) => req,
            Incoming::Waiting => {
                return SdoResult::no_response(SdoState::UploadBlockInitiated(state))
            }
            Incoming::TimedOut => {
                return SdoResult::abort_target(&state.target, AbortCode::SdoTimeout)
            }
        };
        match req {
            SdoRequest::StartBlockUpload => Self::send_upload_segment(state, ctx),
            _ => unexpected(req, &state.target),
        }
    }

    fn upload_block_sending(state: UploadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        match ctx.rx.take_request() {
            Some(SdoRequest::Abort { .. }) => SdoResult::no_response(SdoState::Idle),
            _ => Self::send_upload_segment(state, ctx),
        }
    }

    fn send_upload_segment(state: UploadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let offset = state.block_start + state.seqnum as usize * 7;
        let len = state.size.saturating_sub(offset).min(7);
        let mut data = [0; 7];
        ctx.rx
            .with_buffer(|buf| data[..len].copy_from_slice(&buf[offset..offset + len]));
        let c = offset + len >= state.size;
        let seqnum = state.seqnum + 1;
        let next = UploadBlock { seqnum, ..state };
        let new_state = if c || seqnum >= state.blksize {
            ctx.rx.reset_timer();
            SdoState::UploadBlockAwaitAck(next)
        } else {
            SdoState::UploadBlockSending(next)
        };
        SdoResult::segment(BlockSegment { c, seqnum, data }, new_state)
    }

    fn upload_block_await_ack(state: UploadBlock<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        let target = state.target;
        let req = match ctx.incoming() {
            Incoming::Request(req) => req,
            Incoming::Waiting => {
                return SdoResult::no_response(SdoState::UploadBlockAwaitAck(state))
            }
            Incoming::TimedOut => return SdoResult::abort_target(&target, AbortCode::SdoTimeout),
        };
        let SdoRequest::ConfirmBlock { ackseq, blksize } = req else {
            return unexpected(req, &target);
        };
        if ackseq > state.seqnum {
            return SdoResult::abort_target(&target, AbortCode::InvalidSequenceNumber);
        }
        if blksize == 0 || blksize > 127 {
            return SdoResult::abort_target(&target, AbortCode::InvalidBlockSize);
        }

        let block_start = state.block_start + ackseq as usize * 7;
        if ackseq == state.seqnum && block_start >= state.size {
            let n = if state.size == 0 {
                7
            } else {
                ((7 - state.size % 7) % 7) as u8
            };
            let crc = ctx
                .rx
                .with_buffer(|buf| crc16::State::<crc16::XMODEM>::calculate(&buf[..state.size]));
            return SdoResult::response(
                SdoResponse::EndBlockUpload { n, crc },
                SdoState::UploadBlockEnd(target),
            );
        }

        // Continue with the next block, or repeat everything after ackseq
        Self::send_upload_segment(
            UploadBlock {
                block_start,
                blksize,
                seqnum: 0,
                ..state
            },
            ctx,
        )
    }

    fn upload_block_end(target: Target<'a>, ctx: &Ctx<'_, '_>) -> SdoResult<'a> {
        match ctx.incoming() {
            Incoming::Request(SdoRequest::EndBlockUpload) => {
                SdoResult::no_response(SdoState::Idle)
            }
            Incoming::Request(req) => unexpected(req, &target),
            Incoming::Waiting => SdoResult::no_response(SdoState::UploadBlockEnd(target)),
            Incoming::TimedOut => SdoResult::abort_target(&target, AbortCode::SdoTimeout),
        }
    }
}

/// An SDO server
///
/// One server serves one client at a time. The server executes requests taken from its
/// [`SdoReceiver`] and produces at most one frame per call to [`SdoServer::process`].
#[allow(missing_debug_implementations)]
pub struct SdoServer<'a> {
    state: SdoState<'a>,
    timeout_us: u32,
    blksize: u8,
}

impl<'a> SdoServer<'a> {
    /// Create a server using the SDO timeout and block size of `config`
    pub fn new(config: &StackConfig) -> Self {
        Self {
            state: SdoState::Idle,
            timeout_us: config.sdo_timeout_us,
            blksize: config.sdo_block_size.clamp(1, 127),
        }
    }

    /// Returns true when no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SdoState::Idle)
    }

    /// Handle pending requests and advance the transfer timeout
    ///
    /// `tx_ready` tells whether the response slot is free; nothing is processed while it is not.
    /// Returns the frame to send, and the object which was written when a download completes.
    /// Requests are only served in Pre-Operational and Operational.
    pub fn process(
        &mut self,
        rx: &SdoReceiver<'_>,
        od: &'a [ODEntry<'a>],
        nmt_state: NmtState,
        elapsed_us: u32,
        tx_ready: bool,
    ) -> (Option<SdoServerFrame>, Option<ObjectId>) {
        if !nmt_state.is_pre_or_operational() {
            rx.reset();
            self.state = SdoState::Idle;
            return (None, None);
        }
        if !tx_ready {
            return (None, None);
        }

        let ctx = Ctx {
            rx,
            elapsed_us,
            timeout_us: self.timeout_us,
            blksize: self.blksize,
        };
        let result = self.state.update(&ctx, od);
        self.state = result.new_state;
        if let Some(SdoServerFrame::Response(SdoResponse::Abort {
            index,
            sub,
            abort_code,
        })) = result.frame
        {
            if rx.state() != ReceiverState::Normal {
                rx.set_state(ReceiverState::Normal);
            }
            debug!("SDO abort 0x{:x}sub{} code 0x{:x}", index, sub, abort_code);
        }
        (result.frame, result.updated_object)
    }
}
