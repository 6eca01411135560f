//! SDO Client
//!
//! Drives expedited, segmented and block transfers against a remote
//! SDO server. A client always addresses the one server its parameter
//! record (0x1280..=0x12FF) points to; obtain one through
//! [`crate::Device::sdo`].
//!
//! Every awaited response carries a timeout. When the server stays
//! quiet the client sends an abort frame with code 0x05040000 and the
//! call resolves with an [`SdoError`]; stopping the device resolves an
//! in-flight call with the general error code 0x08000000.
//!
//! # Example
//!
//! ```no_run
//! use cano::{Device, DeviceOptions};
//!
//! let my_future = async {
//!     let device = Device::new(DeviceOptions {
//!         id: 0x20,
//!         ..DeviceOptions::default()
//!     })
//!     .unwrap();
//!     device.od_mut(|od| od.add_sdo_client_parameters(0, 0x30)).unwrap();
//!     let mut client = device.sdo(0x30).unwrap();
//!     match client.upload(0x2000, 0x01).await {
//!         Ok(data) => println!("Object 0x2000,0x01@0x30 value {:?}", data),
//!         Err(error) => println!("Error {}", error),
//!     }
//! };
//! ```

use std::time::Duration;

use futures_timer::Delay;
use futures_util::{pin_mut, select, FutureExt};
use log::debug;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{
    abort_payload, crc16_ccitt, read_abort_code, read_index_sub, SdoAbortCode, SdoPayloadData,
    MAX_BLOCK_SIZE,
};
use crate::device::Device;
use crate::error::SdoError;
use crate::frame::CanFrame;
use crate::od::SdoClientChannel;

/// Why a response did not arrive.
enum WaitError {
    TimedOut,
    Cancelled,
}

pub struct SdoClient<'d> {
    device: &'d Device,
    channel: SdoClientChannel,
    timeout: Duration,
    block_size: u8,
}

impl<'d> SdoClient<'d> {
    pub(crate) fn new(device: &'d Device, channel: SdoClientChannel, timeout: Duration) -> Self {
        SdoClient {
            device,
            channel,
            timeout,
            block_size: MAX_BLOCK_SIZE,
        }
    }

    pub fn server_id(&self) -> u8 {
        self.channel.server_id
    }

    /// Per response step timeout of subsequent transfers.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Block size proposed when uploading in block mode, 1..=127.
    pub fn set_block_size(&mut self, block_size: u8) {
        self.block_size = block_size.clamp(1, MAX_BLOCK_SIZE);
    }

    /// Read a data object from the SDO server a.k.a. upload.
    ///
    /// Expedited and segmented mode are selected by the server based on
    /// the object size.
    pub async fn upload(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoError> {
        let mut session = self.begin(index, sub_index);
        let mut request = [0_u8; 8];
        request[0] = 0x40;
        put_index_sub(&mut request, index, sub_index);
        let response = session.request(request).await?;
        if response[0] >> 5 != 0x02 {
            return Err(session.protocol_error());
        }
        if response[0] & 0x02 != 0 {
            // expedited response
            let length = if response[0] & 0x01 != 0 {
                4 - ((response[0] >> 2) & 0x03) as usize
            } else {
                4
            };
            return Ok(response[4..4 + length].to_vec());
        }
        // segmented response, byte 4..=7 announce the size
        let announced =
            u32::from_le_bytes([response[4], response[5], response[6], response[7]]) as usize;
        debug!("sdo client: segmented upload of {} bytes", announced);
        let mut data = Vec::with_capacity(announced);
        let mut toggle = false;
        loop {
            let mut request = [0_u8; 8];
            request[0] = 0x60 | ((toggle as u8) << 4);
            let response = session.request(request).await?;
            if response[0] >> 5 != 0x00 {
                return Err(session.protocol_error());
            }
            if (response[0] & 0x10 != 0) != toggle {
                return Err(session.abort(SdoAbortCode::ToggleBitNotAlternated));
            }
            let unused = ((response[0] >> 1) & 0x07) as usize;
            data.extend_from_slice(&response[1..8 - unused]);
            toggle = !toggle;
            if response[0] & 0x01 != 0 {
                break;
            }
        }
        Ok(data)
    }

    /// Write a data object to the SDO server a.k.a. download.
    ///
    /// Up to four bytes go out expedited, anything larger is segmented.
    pub async fn download(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), SdoError> {
        let mut session = self.begin(index, sub_index);
        if data.len() <= 4 {
            let mut request = [0_u8; 8];
            request[0] = if data.is_empty() {
                0x22
            } else {
                0x20 | ((4 - data.len() as u8) << 2) | 0x03
            };
            put_index_sub(&mut request, index, sub_index);
            request[4..4 + data.len()].clone_from_slice(data);
            let response = session.request(request).await?;
            if response[0] >> 5 != 0x03 {
                return Err(session.protocol_error());
            }
            return Ok(());
        }
        let mut request = [0_u8; 8];
        request[0] = 0x21;
        put_index_sub(&mut request, index, sub_index);
        request[4..8].clone_from_slice(&(data.len() as u32).to_le_bytes());
        let response = session.request(request).await?;
        if response[0] >> 5 != 0x03 {
            return Err(session.protocol_error());
        }
        let mut toggle = false;
        let mut chunks = data.chunks(7).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let mut request = [0_u8; 8];
            request[0] = ((toggle as u8) << 4) | ((7 - chunk.len() as u8) << 1) | last as u8;
            request[1..1 + chunk.len()].clone_from_slice(chunk);
            let response = session.request(request).await?;
            if response[0] >> 5 != 0x01 {
                return Err(session.protocol_error());
            }
            if (response[0] & 0x10 != 0) != toggle {
                return Err(session.abort(SdoAbortCode::ToggleBitNotAlternated));
            }
            toggle = !toggle;
        }
        Ok(())
    }

    /// Block mode download with CRC when the server supports it.
    pub async fn download_block(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), SdoError> {
        if data.is_empty() {
            // a zero length payload has no segments to window
            return self.download(index, sub_index, data).await;
        }
        let mut session = self.begin(index, sub_index);
        let mut request = [0_u8; 8];
        request[0] = 0xC6; // client supports CRC, size is indicated
        put_index_sub(&mut request, index, sub_index);
        request[4..8].clone_from_slice(&(data.len() as u32).to_le_bytes());
        let response = session.request(request).await?;
        if response[0] >> 5 != 0x05 {
            return Err(session.protocol_error());
        }
        let crc_negotiated = response[0] & 0x04 != 0;
        let mut block_size = response[4];
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(session.abort(SdoAbortCode::InvalidBlockSize));
        }
        let mut position = 0_usize;
        while position < data.len() {
            let remaining = data.len() - position;
            let segments = ((remaining + 6) / 7).min(block_size as usize);
            for segment in 0..segments {
                let start = position + segment * 7;
                let end = (start + 7).min(data.len());
                let mut payload = [0_u8; 8];
                payload[0] = segment as u8 + 1;
                if end == data.len() {
                    payload[0] |= 0x80;
                }
                payload[1..1 + (end - start)].clone_from_slice(&data[start..end]);
                session.send(payload);
            }
            let response = session.next_response().await?;
            if response[0] != 0xA2 {
                return Err(session.protocol_error());
            }
            let ackseq = response[1] as usize;
            if ackseq > segments {
                return Err(session.abort(SdoAbortCode::InvalidSequenceNumber));
            }
            // re-transmission resumes after the last acknowledged segment
            position += (ackseq * 7).min(remaining);
            block_size = response[2];
            if block_size == 0 || block_size > MAX_BLOCK_SIZE {
                return Err(session.abort(SdoAbortCode::InvalidBlockSize));
            }
            if position >= data.len() {
                break;
            }
        }
        let unused = (7 - data.len() % 7) % 7;
        let mut request = [0_u8; 8];
        request[0] = 0xC0 | ((unused as u8) << 2) | 0x01;
        if crc_negotiated {
            request[1..3].clone_from_slice(&crc16_ccitt(data).to_le_bytes());
        }
        let response = session.request(request).await?;
        if response[0] != 0xA1 {
            return Err(session.protocol_error());
        }
        Ok(())
    }

    /// Block mode upload; the whole payload is checked against the
    /// server CRC when negotiated.
    pub async fn upload_block(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoError> {
        let block_size = self.block_size;
        let mut session = self.begin(index, sub_index);
        let mut request = [0_u8; 8];
        request[0] = 0xA4; // initiate, client supports CRC
        put_index_sub(&mut request, index, sub_index);
        request[4] = block_size;
        request[5] = 0; // no protocol switch threshold
        let response = session.request(request).await?;
        if response[0] >> 5 != 0x06 {
            return Err(session.protocol_error());
        }
        let crc_negotiated = response[0] & 0x04 != 0;
        let announced = if response[0] & 0x02 != 0 {
            Some(u32::from_le_bytes([response[4], response[5], response[6], response[7]]) as usize)
        } else {
            None
        };
        let mut data: Vec<u8> = Vec::with_capacity(announced.unwrap_or(0));
        let mut start = [0_u8; 8];
        start[0] = 0xA3;
        session.send(start);
        'blocks: loop {
            let mut block: Vec<u8> = Vec::new();
            let mut sequence = 0_u8;
            let last_in_sequence = loop {
                let payload = session.next_response().await?;
                if payload[0] == 0x80 {
                    let code = read_abort_code(&payload);
                    return Err(SdoError::new(index, sub_index, code));
                }
                let seqno = payload[0] & 0x7F;
                let last = payload[0] & 0x80 != 0;
                if seqno == sequence + 1 {
                    block.extend_from_slice(&payload[1..8]);
                    sequence = seqno;
                }
                if seqno == block_size || last {
                    break last && seqno == sequence;
                }
            };
            data.extend_from_slice(&block);
            let mut ack = [0_u8; 8];
            ack[0] = 0xA2;
            ack[1] = sequence;
            ack[2] = block_size;
            if last_in_sequence {
                session.send(ack);
                break 'blocks;
            }
            session.send(ack);
        }
        // end handshake: trim the padding of the last segment, check CRC
        let response = session.next_response().await?;
        if response[0] & 0xE3 != 0xC1 {
            return Err(session.protocol_error());
        }
        let unused = ((response[0] >> 2) & 0x07) as usize;
        data.truncate(data.len().saturating_sub(unused));
        if crc_negotiated {
            let expected = u16::from_le_bytes([response[1], response[2]]);
            if crc16_ccitt(&data) != expected {
                return Err(session.abort(SdoAbortCode::CrcError));
            }
        }
        let mut end_response = [0_u8; 8];
        end_response[0] = 0xA1;
        session.send(end_response);
        Ok(data)
    }

    fn begin(&mut self, index: u16, sub_index: u8) -> Session<'_> {
        let responses = self.device.register_sdo_listener(self.channel.rx);
        Session {
            device: self.device,
            tx: self.channel.tx,
            index,
            sub_index,
            timeout: self.timeout,
            responses,
        }
    }
}

/// One transfer: a registered response listener plus the addressing
/// context for aborts. Dropping it unhooks the listener.
struct Session<'d> {
    device: &'d Device,
    tx: u16,
    index: u16,
    sub_index: u8,
    timeout: Duration,
    responses: UnboundedReceiver<SdoPayloadData>,
}

impl Session<'_> {
    fn send(&self, payload: SdoPayloadData) {
        if let Ok(frame) = CanFrame::new(self.tx, &payload, false) {
            self.device.transmit_frame(frame);
        }
    }

    /// Send one request frame and await the matching response.
    async fn request(&mut self, payload: SdoPayloadData) -> Result<SdoPayloadData, SdoError> {
        self.send(payload);
        self.next_response().await
    }

    /// Await the next frame from the server, translating aborts,
    /// timeouts and device stop into [`SdoError`].
    async fn next_response(&mut self) -> Result<SdoPayloadData, SdoError> {
        let outcome: Result<SdoPayloadData, WaitError> = {
            let worker = self.responses.recv().fuse();
            let timeout = Delay::new(self.timeout).fuse();
            pin_mut!(worker, timeout);
            select! {
                frame = worker => frame.ok_or(WaitError::Cancelled),
                () = timeout => {
                    debug!("sdo client: response timeout reached");
                    Err(WaitError::TimedOut)
                }
            }
        };
        match outcome {
            Ok(payload) => {
                if payload[0] == 0x80 {
                    let (index, sub_index) = read_index_sub(&payload);
                    return Err(SdoError::new(index, sub_index, read_abort_code(&payload)));
                }
                Ok(payload)
            }
            Err(WaitError::TimedOut) => Err(self.abort(SdoAbortCode::SdoProtocolTimedOut)),
            Err(WaitError::Cancelled) => Err(SdoError::new(
                self.index,
                self.sub_index,
                SdoAbortCode::GeneralError,
            )),
        }
    }

    /// Send an abort frame for this transfer and build the error value.
    fn abort(&self, code: SdoAbortCode) -> SdoError {
        self.send(abort_payload(self.index, self.sub_index, code));
        SdoError::new(self.index, self.sub_index, code)
    }

    fn protocol_error(&self) -> SdoError {
        self.abort(SdoAbortCode::CommandSpecifierError)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.device.clear_sdo_listener();
    }
}

fn put_index_sub(payload: &mut SdoPayloadData, index: u16, sub_index: u8) {
    payload[1] = index as u8;
    payload[2] = (index >> 8) as u8;
    payload[3] = sub_index;
}
