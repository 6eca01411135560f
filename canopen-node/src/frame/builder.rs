//! Builders for the fixed layout communication objects.
//!
//! SDO payloads are built by the SDO state machines themselves; this
//! module covers the simple broadcast and point to point frames.

use super::*;

/// Builds PDO frames after validating that the COB-ID lies inside the
/// PDO function code range 0x180..=0x57F.
#[derive(Clone, Copy)]
pub struct PdoFrameBuilder {
    cob_id: u16,
    rtr: bool,
    length: usize,
    data: [u8; 8],
}

impl PdoFrameBuilder {
    pub fn new(cob_id: u16) -> Result<PdoFrameBuilder, EdsError> {
        let (frame_type, _) = extract_frame_type_and_node_id(cob_id)?;
        if !frame_type.is_pdo() {
            return Err(EdsError::InvalidCobId {
                cob_id: cob_id as u32,
            });
        }
        Ok(PdoFrameBuilder {
            cob_id,
            rtr: false,
            length: 0,
            data: [0; 8],
        })
    }

    pub fn set_rtr(mut self, rtr_flag: bool) -> Self {
        self.rtr = rtr_flag;
        self
    }

    /// Set the payload.
    ///
    /// Any size of the slice equal or less than 8 bytes is accepted,
    /// larger sizes lead to an error return.
    pub fn payload(mut self, data: &[u8]) -> Result<Self, EdsError> {
        if data.len() > 8 {
            return Err(EdsError::InvalidDataLength { length: data.len() });
        }
        self.length = data.len();
        self.data[..data.len()].clone_from_slice(data);
        Ok(self)
    }

    pub fn build(&self) -> CanFrame {
        // cob id and length are validated before they reach this point
        let frame = if self.rtr {
            CanFrame::new_rtr(self.cob_id, self.length)
        } else {
            CanFrame::new(self.cob_id, &self.data[..self.length], false)
        };
        frame.unwrap_or_else(|_| unreachable!())
    }
}

/// NMT command on COB-ID 0x000: `[command, target]`, target 0 = all.
pub fn nmt_command_frame(command: u8, target: u8) -> CanFrame {
    CanFrame::new(COB_NMT, &[command, target], false).unwrap_or_else(|_| unreachable!())
}

/// Heartbeat (NMT error control) on 0x700 + node id, one state byte.
pub fn heartbeat_frame(node_id: u8, state: u8) -> CanFrame {
    CanFrame::new(COB_HEARTBEAT + node_id as u16, &[state], false)
        .unwrap_or_else(|_| unreachable!())
}

/// SYNC frame, optionally carrying the counter byte.
pub fn sync_frame(cob_id: u16, counter: Option<u8>) -> Result<CanFrame, EdsError> {
    match counter {
        Some(count) => CanFrame::new(cob_id, &[count], false),
        None => CanFrame::new(cob_id, &[], false),
    }
}

/// EMCY frame: error code (LE16), error register, five info bytes.
pub fn emergency_frame(cob_id: u16, code: u16, register: u8, info: &[u8; 5]) -> Result<CanFrame, EdsError> {
    let mut data = [0_u8; 8];
    data[0] = code as u8;
    data[1] = (code >> 8) as u8;
    data[2] = register;
    data[3..8].clone_from_slice(info);
    CanFrame::new(cob_id, &data, false)
}

/// TIME frame carrying an encoded TIME_OF_DAY (6 bytes).
pub fn time_frame(cob_id: u16, stamp: &[u8]) -> Result<CanFrame, EdsError> {
    CanFrame::new(cob_id, stamp, false)
}
