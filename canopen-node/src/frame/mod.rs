//! The frame module
//!
//! A [`CanFrame`] is the transport unit exchanged with the CAN driver:
//! an 11 bit identifier, an RTR flag and up to 8 data bytes. The driver
//! itself stays outside of this crate; inbound frames are handed to
//! `Device::receive` and outbound frames are read from the device's
//! frame channel.
//!
//! The 11 bit identifier splits into a 4 bit function code and a 7 bit
//! node id. [`FrameType`] names the function codes and is the range
//! table the device dispatches on.
//!
//! # Examples
//!
//! Create a PDO frame
//!
//! ```
//! use cano::frame::PdoFrameBuilder;
//!
//! let frame = PdoFrameBuilder::new(0x1EF)
//!     .unwrap()
//!     .payload(&[0x01, 0x02, 0x03])
//!     .unwrap()
//!     .build();
//! println!("{}", frame);
//! ```

mod builder;
pub use builder::*;

use crate::error::EdsError;

use core::convert::TryFrom;
use num_enum::TryFromPrimitive;

/// Fixed broadcast identifiers.
pub const COB_NMT: u16 = 0x000;
pub const COB_SYNC: u16 = 0x080;
pub const COB_TIME: u16 = 0x100;
/// Base identifiers that carry the node id in their low 7 bits.
pub const COB_EMCY: u16 = 0x080;
pub const COB_SDO_TX: u16 = 0x580;
pub const COB_SDO_RX: u16 = 0x600;
pub const COB_HEARTBEAT: u16 = 0x700;
/// LSS request (master to slave) and response (slave to master).
pub const COB_LSS_REQUEST: u16 = 0x7E4;
pub const COB_LSS_RESPONSE: u16 = 0x7E5;

/// Function code in bits 7..=10 of the COB-ID.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Nmt = 0b0000,           // Broadcast only
    SyncEmergency = 0b0001, // Sync = broadcast, Emergency = point to point
    Time = 0b0010,
    Tpdo1 = 0b0011,
    Rpdo1 = 0b0100,
    Tpdo2 = 0b0101,
    Rpdo2 = 0b0110,
    Tpdo3 = 0b0111,
    Rpdo3 = 0b1000,
    Tpdo4 = 0b1001,
    Rpdo4 = 0b1010,
    SdoTx = 0b1011, // 0x580 >> 7
    SdoRx = 0b1100, // 0x600 >> 7
    NmtErrorControl = 0b1110,
    Lss = 0b1111, // 0x7E4 / 0x7E5
}

impl FrameType {
    /// All four TPDO and RPDO function codes.
    pub fn is_pdo(&self) -> bool {
        matches!(
            self,
            FrameType::Tpdo1
                | FrameType::Tpdo2
                | FrameType::Tpdo3
                | FrameType::Tpdo4
                | FrameType::Rpdo1
                | FrameType::Rpdo2
                | FrameType::Rpdo3
                | FrameType::Rpdo4
        )
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            FrameType::Nmt => write!(f, "NMT  (000)")?,
            FrameType::SyncEmergency => write!(f, "SYEM (080)")?,
            FrameType::Time => write!(f, "TIME (100)")?,
            FrameType::Tpdo1 => write!(f, "TPDO (180)")?,
            FrameType::Rpdo1 => write!(f, "RPDO (200)")?,
            FrameType::Tpdo2 => write!(f, "TPDO (280)")?,
            FrameType::Rpdo2 => write!(f, "RPDO (300)")?,
            FrameType::Tpdo3 => write!(f, "TPDO (380)")?,
            FrameType::Rpdo3 => write!(f, "RPDO (400)")?,
            FrameType::Tpdo4 => write!(f, "TPDO (480)")?,
            FrameType::Rpdo4 => write!(f, "RPDO (500)")?,
            FrameType::SdoTx => write!(f, "TSDO (580)")?,
            FrameType::SdoRx => write!(f, "RSDO (600)")?,
            FrameType::NmtErrorControl => write!(f, "HBER (700)")?,
            FrameType::Lss => write!(f, "LSS  (7E4)")?,
        }
        Ok(())
    }
}

/// A raw CAN frame: 11 bit identifier plus up to 8 data bytes.
///
/// Extended (29 bit) identifiers do not occur in CANopen and are
/// rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    rtr: bool,
    length: usize,
    data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u16, data: &[u8], rtr: bool) -> Result<CanFrame, EdsError> {
        if id > 0x7FF {
            return Err(EdsError::InvalidCobId { cob_id: id as u32 });
        }
        if data.len() > 8 {
            return Err(EdsError::InvalidDataLength { length: data.len() });
        }
        let mut buffer = [0_u8; 8];
        buffer[..data.len()].clone_from_slice(data);
        Ok(CanFrame {
            id,
            rtr,
            length: data.len(),
            data: buffer,
        })
    }

    /// Remote transmission request with the given data length code.
    pub fn new_rtr(id: u16, length: usize) -> Result<CanFrame, EdsError> {
        if length > 8 {
            return Err(EdsError::InvalidDataLength { length });
        }
        let mut frame = CanFrame::new(id, &[], true)?;
        frame.length = length;
        Ok(frame)
    }

    #[inline(always)]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.length]
    }

    #[inline(always)]
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    /// The low 7 bits of the identifier, a node id for the point to
    /// point function codes.
    #[inline(always)]
    pub fn node_id(&self) -> u8 {
        (self.id & 0x7F) as u8
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        extract_frame_type_and_node_id(self.id).ok().map(|(t, _)| t)
    }

    /// Payload as a fixed 8 byte buffer, zero padded. The SDO and LSS
    /// protocols always operate on full 8 byte frames.
    pub fn padded(&self) -> [u8; 8] {
        self.data
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self.frame_type() {
            Some(frame_type) => write!(f, "{}: 0x{:02X} \t", frame_type, self.node_id())?,
            None => write!(f, "???: 0x{:03X} \t", self.id)?,
        }
        if self.rtr {
            write!(f, "RTR({})", self.length)?;
        } else {
            for byte in self.data() {
                write!(f, "{:02X} ", byte)?;
            }
        }
        Ok(())
    }
}

pub fn extract_frame_type_and_node_id(cob_id: u16) -> Result<(FrameType, u8), EdsError> {
    if cob_id > 0x7FF {
        // 0x7FF is equivalent 11 bit
        return Err(EdsError::InvalidCobId {
            cob_id: cob_id as u32,
        });
    }
    const TYPE_START_BIT: u8 = 7;
    const TYPE_MASK: u16 = 0b1111 << TYPE_START_BIT; // 4 bit length
    const NODE_MASK: u16 = 0b111_1111; // 7 bit length
    let node_id = (cob_id & NODE_MASK) as u8;
    let frame_type = FrameType::try_from(((cob_id & TYPE_MASK) >> TYPE_START_BIT) as u8).map_err(
        |_| EdsError::InvalidCobId {
            cob_id: cob_id as u32,
        },
    )?;
    Ok((frame_type, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_frame_type_and_node_id_ok_return() {
        assert_eq!(
            (FrameType::SdoRx, 0x01),
            extract_frame_type_and_node_id(0x601).unwrap()
        );
        assert_eq!(
            (FrameType::SdoTx, 0x01),
            extract_frame_type_and_node_id(0x581).unwrap()
        );
        assert_eq!(
            (FrameType::Lss, 0x64),
            extract_frame_type_and_node_id(0x7E4).unwrap()
        );
        assert_eq!(
            (FrameType::Nmt, 0x00),
            extract_frame_type_and_node_id(0x000).unwrap()
        );
    }

    #[test]
    fn extract_frame_type_and_node_id_error_return() {
        let e = extract_frame_type_and_node_id(0xFFF).unwrap_err();
        if let EdsError::InvalidCobId { cob_id } = e {
            assert_eq!(cob_id, 0xFFF);
        } else {
            panic!("Not expected Error");
        }
        // 0b1101 is an unassigned function code
        assert!(extract_frame_type_and_node_id(0b1101 << 7).is_err());
    }

    #[test]
    fn frame_construction_limits() {
        assert!(CanFrame::new(0x800, &[], false).is_err());
        assert!(CanFrame::new(0x7FF, &[0; 9], false).is_err());
        let frame = CanFrame::new(0x1EF, &[1, 2, 3], true).unwrap();
        assert_eq!(frame.frame_type(), Some(FrameType::Tpdo1));
        assert_eq!(frame.node_id(), 0x6F);
        assert!(frame.is_rtr());
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.padded(), [1, 2, 3, 0, 0, 0, 0, 0]);
    }
}
