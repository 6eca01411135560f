//! Error taxonomy of the protocol engine.
//!
//! Three families cover all failure surfaces:
//!
//! - [`EdsError`] - misuse of the object dictionary or of a module that
//!   is not configured for the requested operation
//! - [`ValueError`] - a byte buffer does not decode against its declared
//!   data type
//! - [`SdoError`] - a failed SDO transfer, carrying the abort code that
//!   went over the wire

use crate::sdo::SdoAbortCode;
use thiserror::Error;

/// Dictionary and configuration misuse.
///
/// Raised synchronously by the object dictionary API and by module entry
/// points that require prior configuration (for example an EMCY write
/// without a valid COB-ID at 0x1014).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EdsError {
    #[error("object 0x{index:04X} does not exist in the object dictionary")]
    ObjectDoesNotExist { index: u16 },

    #[error("sub-index 0x{sub_index:02X} of object 0x{index:04X} does not exist")]
    SubObjectDoesNotExist { index: u16, sub_index: u8 },

    #[error("object 0x{index:04X} is already registered")]
    ObjectAlreadyExists { index: u16 },

    #[error("sub-index 0x{sub_index:02X} of object 0x{index:04X} is already registered")]
    SubObjectAlreadyExists { index: u16, sub_index: u8 },

    #[error("illegal entry description for object 0x{index:04X}: {reason}")]
    InvalidEntry { index: u16, reason: &'static str },

    #[error("object 0x{index:04X},0x{sub_index:02X} does not permit this access")]
    AccessViolation { index: u16, sub_index: u8 },

    #[error("value does not match the data type of object 0x{index:04X},0x{sub_index:02X}")]
    ValueMismatch { index: u16, sub_index: u8 },

    #[error("sub-index 0 of object 0x{index:04X} cannot be removed")]
    SubIndexZeroImmutable { index: u16 },

    #[error("listener {key:?} is already subscribed to object 0x{index:04X}")]
    DuplicateSubscription { index: u16, key: String },

    #[error("COB-ID 0x{cob_id:03X} already backs a PDO of the same direction")]
    DuplicatePdo { cob_id: u16 },

    #[error("node id 0x{node_id:02X} is out of the allowed range [0x01..0x7F]")]
    InvalidNodeId { node_id: u8 },

    #[error("COB-ID 0x{cob_id:X} is not a valid 11 bit CAN identifier")]
    InvalidCobId { cob_id: u32 },

    #[error("a CAN frame carries at most 8 data bytes, got {length}")]
    InvalidDataLength { length: usize },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("LSS service failed: {0}")]
    LssFailure(&'static str),
}

/// Decoding failure of a byte buffer against its declared data type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("{data_type} expects {expected} bytes, got {actual}")]
    WrongLength {
        data_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("BOOLEAN must encode as 0 or 1, got 0x{0:02X}")]
    InvalidBoolean(u8),

    #[error("VISIBLE_STRING is limited to ASCII up to 0x7E")]
    NotVisibleCharacters,

    #[error("UNICODE_STRING must have an even byte length")]
    OddUnicodeLength,

    #[error("date is not representable relative to the 1984-01-01 epoch")]
    DateOutOfRange,

    #[error("string is not encodable as {data_type}")]
    Unencodable { data_type: &'static str },
}

/// A failed SDO transfer.
///
/// Both the client and the server surface protocol failures through this
/// type; `code` is exactly the abort code that was sent or received on
/// the bus.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("SDO transfer of 0x{index:04X},0x{sub_index:02X} aborted: {code}")]
pub struct SdoError {
    pub index: u16,
    pub sub_index: u8,
    pub code: SdoAbortCode,
}

impl SdoError {
    pub fn new(index: u16, sub_index: u8, code: SdoAbortCode) -> Self {
        SdoError {
            index,
            sub_index,
            code,
        }
    }
}
