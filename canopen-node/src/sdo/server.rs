//! SDO server
//!
//! A single session server: one transfer is handled at a time per
//! device. The served channels come from the SDO server parameter
//! records (0x1200..=0x127F) and are refreshed whenever those records
//! change, so a configurator can move the server to other COB-IDs
//! without a restart.
//!
//! Writes are committed to the object dictionary only when a transfer
//! completes; an abort in the middle of a segmented or block download
//! discards the staging buffer.

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::{
    abort_payload, crc16_ccitt, read_index_sub, ClientCommandSpecifier, SdoAbortCode,
    SdoPayloadData, MAX_BLOCK_SIZE,
};
use crate::frame::CanFrame;
use crate::node::Bus;
use crate::od::{ObjectDictionary, SdoServerChannel};

enum BlockUploadPhase {
    AwaitStart,
    AwaitAck,
    AwaitEndResponse,
}

enum SessionState {
    SegmentedDownload {
        buffer: Vec<u8>,
        announced: Option<u32>,
        toggle: bool,
    },
    SegmentedUpload {
        data: Vec<u8>,
        position: usize,
        toggle: bool,
    },
    BlockDownload {
        buffer: Vec<u8>,
        block: Vec<u8>,
        sequence: u8,
        block_size: u8,
        crc: bool,
        await_end: bool,
    },
    BlockUpload {
        data: Vec<u8>,
        position: usize,
        block_size: u8,
        crc: bool,
        phase: BlockUploadPhase,
    },
}

struct Session {
    tx: u16,
    rx: u16,
    index: u16,
    sub_index: u8,
    deadline: Instant,
    state: SessionState,
}

pub struct SdoServer {
    channels: Vec<SdoServerChannel>,
    timeout: Duration,
    session: Option<Session>,
}

impl SdoServer {
    pub fn new(timeout: Duration) -> SdoServer {
        SdoServer {
            channels: Vec::new(),
            timeout,
            session: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Re-read the served channels from the parameter records.
    pub(crate) fn reconfigure(&mut self, od: &ObjectDictionary, node_id: u8) {
        self.channels = od.sdo_server_channels(node_id);
    }

    pub(crate) fn owns(&self, cob_id: u16) -> bool {
        self.channels.iter().any(|channel| channel.rx == cob_id)
    }

    /// Abort whatever is in flight; used by device stop.
    pub(crate) fn stop(&mut self, bus: &mut Bus) {
        if let Some(session) = self.session.take() {
            respond(
                bus,
                session.tx,
                abort_payload(session.index, session.sub_index, SdoAbortCode::GeneralError),
            );
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|session| session.deadline)
    }

    /// Expire the session when the client went quiet.
    pub(crate) fn poll(&mut self, bus: &mut Bus, now: Instant) {
        let expired = self
            .session
            .as_ref()
            .map(|session| session.deadline <= now)
            .unwrap_or(false);
        if expired {
            if let Some(session) = self.session.take() {
                warn!(
                    "sdo server: transfer of 0x{:04X},0x{:02X} timed out",
                    session.index, session.sub_index
                );
                respond(
                    bus,
                    session.tx,
                    abort_payload(
                        session.index,
                        session.sub_index,
                        SdoAbortCode::SdoProtocolTimedOut,
                    ),
                );
            }
        }
    }

    pub(crate) fn handle_frame(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        if frame.is_rtr() {
            return;
        }
        let rx = frame.id();
        let tx = match self.channels.iter().find(|channel| channel.rx == rx) {
            Some(channel) => channel.tx,
            None => return,
        };
        let payload = frame.padded();

        // during the data phase of a block download every frame is a
        // sequenced segment, not a command frame
        let in_segment_phase = matches!(
            &self.session,
            Some(Session {
                rx: session_rx,
                state: SessionState::BlockDownload { await_end: false, .. },
                ..
            }) if *session_rx == rx
        );
        if in_segment_phase {
            if payload[0] == 0x80 {
                // a well formed abort is still recognized
                self.session = None;
            } else {
                self.handle_block_segment(&payload, bus, now);
            }
            return;
        }

        match ClientCommandSpecifier::from(payload[0]) {
            ClientCommandSpecifier::InitiateDownload => {
                self.initiate_download(tx, rx, &payload, od, bus, now)
            }
            ClientCommandSpecifier::DownloadSegment => self.download_segment(&payload, od, bus, now),
            ClientCommandSpecifier::InitiateUpload => {
                self.initiate_upload(tx, rx, &payload, od, bus, now)
            }
            ClientCommandSpecifier::UploadSegment => self.upload_segment(&payload, bus, now),
            ClientCommandSpecifier::BlockDownload => {
                self.block_download_command(tx, rx, &payload, od, bus, now)
            }
            ClientCommandSpecifier::BlockUpload => {
                self.block_upload_command(tx, rx, &payload, od, bus, now)
            }
            ClientCommandSpecifier::Abort => {
                let (index, sub_index) = read_index_sub(&payload);
                debug!(
                    "sdo server: client aborted 0x{:04X},0x{:02X}: {}",
                    index,
                    sub_index,
                    super::read_abort_code(&payload)
                );
                self.session = None;
            }
            ClientCommandSpecifier::Unspecified => {
                let (index, sub_index) = read_index_sub(&payload);
                respond(
                    bus,
                    tx,
                    abort_payload(index, sub_index, SdoAbortCode::CommandSpecifierError),
                );
            }
        }
    }

    fn initiate_download(
        &mut self,
        tx: u16,
        rx: u16,
        payload: &SdoPayloadData,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let (index, sub_index) = read_index_sub(payload);
        let expedited = payload[0] & 0x02 != 0;
        let size_set = payload[0] & 0x01 != 0;
        self.session = None;
        if expedited {
            let length = if size_set {
                4 - ((payload[0] >> 2) & 0x03) as usize
            } else {
                4
            };
            match od.sdo_write(index, sub_index, &payload[4..4 + length]) {
                Ok(()) => {
                    let mut response = [0_u8; 8];
                    response[0] = 0x60;
                    response[1..4].clone_from_slice(&payload[1..4]);
                    respond(bus, tx, response);
                }
                Err(code) => respond(bus, tx, abort_payload(index, sub_index, code)),
            }
            return;
        }
        // segmented transfer announced
        let announced = if size_set {
            Some(u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]))
        } else {
            None
        };
        let mut response = [0_u8; 8];
        response[0] = 0x60;
        response[1..4].clone_from_slice(&payload[1..4]);
        respond(bus, tx, response);
        self.session = Some(Session {
            tx,
            rx,
            index,
            sub_index,
            deadline: now + self.timeout,
            state: SessionState::SegmentedDownload {
                buffer: Vec::with_capacity(announced.unwrap_or(0) as usize),
                announced,
                toggle: false,
            },
        });
    }

    fn download_segment(
        &mut self,
        payload: &SdoPayloadData,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let (tx, index, sub_index) = (session.tx, session.index, session.sub_index);
        let (buffer, announced, toggle) = match &mut session.state {
            SessionState::SegmentedDownload {
                buffer,
                announced,
                toggle,
            } => (buffer, *announced, toggle),
            _ => return,
        };
        let frame_toggle = payload[0] & 0x10 != 0;
        if frame_toggle != *toggle {
            self.session = None;
            respond(
                bus,
                tx,
                abort_payload(index, sub_index, SdoAbortCode::ToggleBitNotAlternated),
            );
            return;
        }
        let unused = ((payload[0] >> 1) & 0x07) as usize;
        let last = payload[0] & 0x01 != 0;
        buffer.extend_from_slice(&payload[1..8 - unused]);
        let mut response = [0_u8; 8];
        response[0] = 0x20 | ((*toggle as u8) << 4);
        *toggle = !*toggle;
        session.deadline = now + self.timeout;
        if !last {
            respond(bus, tx, response);
            return;
        }
        // final segment: commit the staging buffer in one step
        let buffer = match self.session.take() {
            Some(Session {
                state: SessionState::SegmentedDownload { buffer, .. },
                ..
            }) => buffer,
            _ => return,
        };
        if let Some(size) = announced {
            if buffer.len() as u32 != size {
                respond(
                    bus,
                    tx,
                    abort_payload(index, sub_index, SdoAbortCode::WrongLength),
                );
                return;
            }
        }
        match od.sdo_write(index, sub_index, &buffer) {
            Ok(()) => respond(bus, tx, response),
            Err(code) => respond(bus, tx, abort_payload(index, sub_index, code)),
        }
    }

    fn initiate_upload(
        &mut self,
        tx: u16,
        rx: u16,
        payload: &SdoPayloadData,
        od: &ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let (index, sub_index) = read_index_sub(payload);
        self.session = None;
        let data = match od.sdo_read(index, sub_index) {
            Ok(data) => data,
            Err(code) => {
                respond(bus, tx, abort_payload(index, sub_index, code));
                return;
            }
        };
        let mut response = [0_u8; 8];
        response[1..4].clone_from_slice(&payload[1..4]);
        if data.len() <= 4 {
            response[0] = if data.is_empty() {
                0x42
            } else {
                0x40 | ((4 - data.len() as u8) << 2) | 0x03
            };
            response[4..4 + data.len()].clone_from_slice(&data);
            respond(bus, tx, response);
            return;
        }
        response[0] = 0x41;
        response[4..8].clone_from_slice(&(data.len() as u32).to_le_bytes());
        respond(bus, tx, response);
        self.session = Some(Session {
            tx,
            rx,
            index,
            sub_index,
            deadline: now + self.timeout,
            state: SessionState::SegmentedUpload {
                data,
                position: 0,
                toggle: false,
            },
        });
    }

    fn upload_segment(&mut self, payload: &SdoPayloadData, bus: &mut Bus, now: Instant) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let (tx, index, sub_index) = (session.tx, session.index, session.sub_index);
        let (data, position, toggle) = match &mut session.state {
            SessionState::SegmentedUpload {
                data,
                position,
                toggle,
            } => (data, position, toggle),
            _ => return,
        };
        let frame_toggle = payload[0] & 0x10 != 0;
        if frame_toggle != *toggle {
            self.session = None;
            respond(
                bus,
                tx,
                abort_payload(index, sub_index, SdoAbortCode::ToggleBitNotAlternated),
            );
            return;
        }
        let remaining = data.len() - *position;
        let length = remaining.min(7);
        let last = length == remaining;
        let mut response = [0_u8; 8];
        response[0] = ((*toggle as u8) << 4) | ((7 - length as u8) << 1) | last as u8;
        response[1..1 + length].clone_from_slice(&data[*position..*position + length]);
        *position += length;
        *toggle = !*toggle;
        session.deadline = now + self.timeout;
        respond(bus, tx, response);
        if last {
            self.session = None;
        }
    }

    fn block_download_command(
        &mut self,
        tx: u16,
        rx: u16,
        payload: &SdoPayloadData,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let end_request = payload[0] & 0x01 != 0;
        if !end_request {
            // initiate: client CRC capability in bit 2, size in bit 1
            let (index, sub_index) = read_index_sub(payload);
            let crc = payload[0] & 0x04 != 0;
            let announced = if payload[0] & 0x02 != 0 {
                Some(u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]))
            } else {
                None
            };
            let mut response = [0_u8; 8];
            response[0] = 0xA0 | 0x04; // we support CRC
            response[1..4].clone_from_slice(&payload[1..4]);
            response[4] = MAX_BLOCK_SIZE;
            respond(bus, tx, response);
            self.session = Some(Session {
                tx,
                rx,
                index,
                sub_index,
                deadline: now + self.timeout,
                state: SessionState::BlockDownload {
                    buffer: Vec::with_capacity(announced.unwrap_or(0) as usize),
                    block: Vec::new(),
                    sequence: 0,
                    block_size: MAX_BLOCK_SIZE,
                    crc,
                    await_end: false,
                },
            });
            return;
        }
        // end request: the command byte carries the count of unused
        // bytes in the last segment, bytes 1..=2 the CRC
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        let (index, sub_index) = (session.index, session.sub_index);
        let (mut buffer, crc_negotiated) = match session.state {
            SessionState::BlockDownload {
                buffer,
                crc,
                await_end: true,
                ..
            } => (buffer, crc),
            _ => {
                respond(
                    bus,
                    tx,
                    abort_payload(index, sub_index, SdoAbortCode::CommandSpecifierError),
                );
                return;
            }
        };
        let unused = ((payload[0] >> 2) & 0x07) as usize;
        buffer.truncate(buffer.len().saturating_sub(unused));
        if crc_negotiated {
            let expected = u16::from_le_bytes([payload[1], payload[2]]);
            let actual = crc16_ccitt(&buffer);
            if expected != actual {
                respond(bus, tx, abort_payload(index, sub_index, SdoAbortCode::CrcError));
                return;
            }
        }
        match od.sdo_write(index, sub_index, &buffer) {
            Ok(()) => {
                let mut response = [0_u8; 8];
                response[0] = 0xA1;
                respond(bus, tx, response);
            }
            Err(code) => respond(bus, tx, abort_payload(index, sub_index, code)),
        }
    }

    fn handle_block_segment(&mut self, payload: &SdoPayloadData, bus: &mut Bus, now: Instant) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let tx = session.tx;
        let (buffer, block, sequence, block_size, await_end) = match &mut session.state {
            SessionState::BlockDownload {
                buffer,
                block,
                sequence,
                block_size,
                await_end,
                ..
            } => (buffer, block, sequence, block_size, await_end),
            _ => return,
        };
        let seqno = payload[0] & 0x7F;
        let last_of_transfer = payload[0] & 0x80 != 0;
        if seqno == *sequence + 1 {
            block.extend_from_slice(&payload[1..8]);
            *sequence = seqno;
        }
        session.deadline = now + self.timeout;
        if seqno == *block_size || last_of_transfer {
            // close the block: keep the contiguous prefix, request a
            // retransmission of the rest through the ack sequence number
            let mut response = [0_u8; 8];
            response[0] = 0xA2;
            response[1] = *sequence;
            response[2] = *block_size;
            buffer.append(block);
            let complete = last_of_transfer && seqno == *sequence;
            *sequence = 0;
            if complete {
                *await_end = true;
            }
            respond(bus, tx, response);
        }
    }

    fn block_upload_command(
        &mut self,
        tx: u16,
        rx: u16,
        payload: &SdoPayloadData,
        od: &ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        match payload[0] & 0x03 {
            0 => {
                // initiate: blksize in byte 4, protocol switch threshold
                // in byte 5 is ignored (no fallback to segmented mode)
                let (index, sub_index) = read_index_sub(payload);
                let crc = payload[0] & 0x04 != 0;
                let block_size = payload[4];
                if block_size == 0 || block_size > MAX_BLOCK_SIZE {
                    respond(
                        bus,
                        tx,
                        abort_payload(index, sub_index, SdoAbortCode::InvalidBlockSize),
                    );
                    return;
                }
                let data = match od.sdo_read(index, sub_index) {
                    Ok(data) => data,
                    Err(code) => {
                        respond(bus, tx, abort_payload(index, sub_index, code));
                        return;
                    }
                };
                let mut response = [0_u8; 8];
                response[0] = 0xC0 | 0x04 | 0x02; // CRC supported, size indicated
                response[1..4].clone_from_slice(&payload[1..4]);
                response[4..8].clone_from_slice(&(data.len() as u32).to_le_bytes());
                respond(bus, tx, response);
                self.session = Some(Session {
                    tx,
                    rx,
                    index,
                    sub_index,
                    deadline: now + self.timeout,
                    state: SessionState::BlockUpload {
                        data,
                        position: 0,
                        block_size,
                        crc,
                        phase: BlockUploadPhase::AwaitStart,
                    },
                });
            }
            3 => {
                // start upload
                if let Some(session) = self.session.as_mut() {
                    if let SessionState::BlockUpload { phase, .. } = &mut session.state {
                        *phase = BlockUploadPhase::AwaitAck;
                    }
                    session.deadline = now + self.timeout;
                }
                self.send_upload_block(bus);
            }
            2 => {
                // ack: bytes 1..=2 carry ackseq and the next block size
                let finished = {
                    let session = match self.session.as_mut() {
                        Some(session) => session,
                        None => return,
                    };
                    let (data, position, block_size) = match &mut session.state {
                        SessionState::BlockUpload {
                            data,
                            position,
                            block_size,
                            ..
                        } => (data, position, block_size),
                        _ => return,
                    };
                    let ackseq = payload[1] as usize;
                    if payload[2] == 0 || payload[2] > MAX_BLOCK_SIZE {
                        let (index, sub_index) = (session.index, session.sub_index);
                        self.session = None;
                        respond(
                            bus,
                            tx,
                            abort_payload(index, sub_index, SdoAbortCode::InvalidBlockSize),
                        );
                        return;
                    }
                    *block_size = payload[2];
                    let remaining = data.len() - *position;
                    *position += (ackseq * 7).min(remaining);
                    session.deadline = now + self.timeout;
                    *position >= data.len()
                };
                if finished {
                    self.send_upload_end(bus, now);
                } else {
                    self.send_upload_block(bus);
                }
            }
            1 => {
                // end response, transfer complete
                if let Some(Session {
                    state: SessionState::BlockUpload { .. },
                    ..
                }) = &self.session
                {
                    self.session = None;
                }
            }
            _ => unreachable!(),
        }
    }

    fn send_upload_block(&mut self, bus: &mut Bus) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let tx = session.tx;
        let (data, position, block_size) = match &session.state {
            SessionState::BlockUpload {
                data,
                position,
                block_size,
                ..
            } => (data, *position, *block_size),
            _ => return,
        };
        let remaining = data.len() - position;
        let total_segments = (remaining + 6) / 7;
        let count = total_segments.min(block_size as usize);
        if count == 0 {
            // zero length object: one empty segment closes the transfer
            let mut payload = [0_u8; 8];
            payload[0] = 0x81;
            respond(bus, tx, payload);
            return;
        }
        for segment in 0..count {
            let start = position + segment * 7;
            let end = (start + 7).min(data.len());
            let mut payload = [0_u8; 8];
            payload[0] = segment as u8 + 1;
            if end == data.len() {
                payload[0] |= 0x80;
            }
            payload[1..1 + (end - start)].clone_from_slice(&data[start..end]);
            respond(bus, tx, payload);
        }
    }

    fn send_upload_end(&mut self, bus: &mut Bus, now: Instant) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        let tx = session.tx;
        let (data, crc, phase) = match &mut session.state {
            SessionState::BlockUpload {
                data, crc, phase, ..
            } => (data, *crc, phase),
            _ => return,
        };
        let unused = if data.is_empty() {
            7
        } else {
            (7 - data.len() % 7) % 7
        };
        let mut payload = [0_u8; 8];
        payload[0] = 0xC0 | ((unused as u8) << 2) | 0x01;
        if crc {
            payload[1..3].clone_from_slice(&crc16_ccitt(data).to_le_bytes());
        }
        *phase = BlockUploadPhase::AwaitEndResponse;
        session.deadline = now + self.timeout;
        respond(bus, tx, payload);
    }
}

fn respond(bus: &mut Bus, tx: u16, payload: SdoPayloadData) {
    if let Ok(frame) = CanFrame::new(tx, &payload, false) {
        bus.send(frame);
    }
}
