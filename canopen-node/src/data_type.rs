//! Codec layer: typed values and their little endian wire form.
//!
//! Every CANopen data type from CiA-301 is represented by a [`DataType`]
//! code and a [`Value`] variant. [`Value::encode`] and [`Value::decode`]
//! convert between typed values and the byte buffers that travel in SDO
//! and PDO payloads. All multi byte scalars are little endian; the odd
//! sized integers (24/40/48/56 bit) are sign extended over 3/5/6/7
//! bytes.
//!
//! Dates are measured against the CANopen epoch 1984-01-01T00:00:00Z and
//! encode to 6 bytes: a 28 bit milliseconds-since-midnight field and a
//! 16 bit days-since-epoch field.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use encoding::all::{ASCII, UTF_16LE};
use encoding::{DecoderTrap, EncoderTrap, Encoding};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ValueError;

/// Unix timestamp of the CANopen epoch, 1984-01-01T00:00:00Z.
const EPOCH_UNIX_MS: i64 = 441_763_200_000;
const MS_PER_DAY: i64 = 86_400_000;

/// CiA-301 data type codes as found in object 0x0001..0x001B and in EDS
/// `DataType` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum DataType {
    Boolean = 0x0001,
    Integer8 = 0x0002,
    Integer16 = 0x0003,
    Integer32 = 0x0004,
    Unsigned8 = 0x0005,
    Unsigned16 = 0x0006,
    Unsigned32 = 0x0007,
    Real32 = 0x0008,
    VisibleString = 0x0009,
    OctetString = 0x000A,
    UnicodeString = 0x000B,
    TimeOfDay = 0x000C,
    TimeDifference = 0x000D,
    Domain = 0x000F,
    Integer24 = 0x0010,
    Real64 = 0x0011,
    Integer40 = 0x0012,
    Integer48 = 0x0013,
    Integer56 = 0x0014,
    Integer64 = 0x0015,
    Unsigned24 = 0x0016,
    Unsigned40 = 0x0018,
    Unsigned48 = 0x0019,
    Unsigned56 = 0x001A,
    Unsigned64 = 0x001B,
}

impl DataType {
    /// Encoded size in bytes, `None` for the variable length types.
    pub fn size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Integer8 | Unsigned8 => Some(1),
            Integer16 | Unsigned16 => Some(2),
            Integer24 | Unsigned24 => Some(3),
            Integer32 | Unsigned32 | Real32 => Some(4),
            Integer40 | Unsigned40 => Some(5),
            Integer48 | Unsigned48 | TimeOfDay | TimeDifference => Some(6),
            Integer56 | Unsigned56 => Some(7),
            Integer64 | Unsigned64 | Real64 => Some(8),
            VisibleString | OctetString | UnicodeString | Domain => None,
        }
    }

    /// Numeric types take part in limit checks and scale factors.
    pub fn is_numeric(&self) -> bool {
        use DataType::*;
        !matches!(
            self,
            VisibleString | OctetString | UnicodeString | TimeOfDay | TimeDifference | Domain
        )
    }

    pub fn name(&self) -> &'static str {
        use DataType::*;
        match self {
            Boolean => "BOOLEAN",
            Integer8 => "INTEGER8",
            Integer16 => "INTEGER16",
            Integer24 => "INTEGER24",
            Integer32 => "INTEGER32",
            Integer40 => "INTEGER40",
            Integer48 => "INTEGER48",
            Integer56 => "INTEGER56",
            Integer64 => "INTEGER64",
            Unsigned8 => "UNSIGNED8",
            Unsigned16 => "UNSIGNED16",
            Unsigned24 => "UNSIGNED24",
            Unsigned32 => "UNSIGNED32",
            Unsigned40 => "UNSIGNED40",
            Unsigned48 => "UNSIGNED48",
            Unsigned56 => "UNSIGNED56",
            Unsigned64 => "UNSIGNED64",
            Real32 => "REAL32",
            Real64 => "REAL64",
            VisibleString => "VISIBLE_STRING",
            OctetString => "OCTET_STRING",
            UnicodeString => "UNICODE_STRING",
            TimeOfDay => "TIME_OF_DAY",
            TimeDifference => "TIME_DIFFERENCE",
            Domain => "DOMAIN",
        }
    }
}

/// A typed object dictionary value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer8(i8),
    Integer16(i16),
    Integer24(i32),
    Integer32(i32),
    Integer40(i64),
    Integer48(i64),
    Integer56(i64),
    Integer64(i64),
    Unsigned8(u8),
    Unsigned16(u16),
    Unsigned24(u32),
    Unsigned32(u32),
    Unsigned40(u64),
    Unsigned48(u64),
    Unsigned56(u64),
    Unsigned64(u64),
    Real32(f32),
    Real64(f64),
    VisibleString(String),
    OctetString(Vec<u8>),
    UnicodeString(String),
    TimeOfDay(DateTime<Utc>),
    TimeDifference(TimeDelta),
    Domain(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer8(_) => DataType::Integer8,
            Value::Integer16(_) => DataType::Integer16,
            Value::Integer24(_) => DataType::Integer24,
            Value::Integer32(_) => DataType::Integer32,
            Value::Integer40(_) => DataType::Integer40,
            Value::Integer48(_) => DataType::Integer48,
            Value::Integer56(_) => DataType::Integer56,
            Value::Integer64(_) => DataType::Integer64,
            Value::Unsigned8(_) => DataType::Unsigned8,
            Value::Unsigned16(_) => DataType::Unsigned16,
            Value::Unsigned24(_) => DataType::Unsigned24,
            Value::Unsigned32(_) => DataType::Unsigned32,
            Value::Unsigned40(_) => DataType::Unsigned40,
            Value::Unsigned48(_) => DataType::Unsigned48,
            Value::Unsigned56(_) => DataType::Unsigned56,
            Value::Unsigned64(_) => DataType::Unsigned64,
            Value::Real32(_) => DataType::Real32,
            Value::Real64(_) => DataType::Real64,
            Value::VisibleString(_) => DataType::VisibleString,
            Value::OctetString(_) => DataType::OctetString,
            Value::UnicodeString(_) => DataType::UnicodeString,
            Value::TimeOfDay(_) => DataType::TimeOfDay,
            Value::TimeDifference(_) => DataType::TimeDifference,
            Value::Domain(_) => DataType::Domain,
        }
    }

    /// Encode into the little endian wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, ValueError> {
        let mut buf = [0_u8; 8];
        let bytes = match self {
            Value::Boolean(b) => {
                buf[0] = *b as u8;
                buf[0..1].to_vec()
            }
            Value::Integer8(n) => {
                buf[0] = *n as u8;
                buf[0..1].to_vec()
            }
            Value::Unsigned8(n) => {
                buf[0] = *n;
                buf[0..1].to_vec()
            }
            Value::Integer16(n) => {
                LittleEndian::write_i16(&mut buf, *n);
                buf[0..2].to_vec()
            }
            Value::Unsigned16(n) => {
                LittleEndian::write_u16(&mut buf, *n);
                buf[0..2].to_vec()
            }
            Value::Integer24(n) => {
                LittleEndian::write_int(&mut buf, *n as i64, 3);
                buf[0..3].to_vec()
            }
            Value::Unsigned24(n) => {
                LittleEndian::write_uint(&mut buf, *n as u64, 3);
                buf[0..3].to_vec()
            }
            Value::Integer32(n) => {
                LittleEndian::write_i32(&mut buf, *n);
                buf[0..4].to_vec()
            }
            Value::Unsigned32(n) => {
                LittleEndian::write_u32(&mut buf, *n);
                buf[0..4].to_vec()
            }
            Value::Integer40(n) => {
                LittleEndian::write_int(&mut buf, *n, 5);
                buf[0..5].to_vec()
            }
            Value::Unsigned40(n) => {
                LittleEndian::write_uint(&mut buf, *n, 5);
                buf[0..5].to_vec()
            }
            Value::Integer48(n) => {
                LittleEndian::write_int(&mut buf, *n, 6);
                buf[0..6].to_vec()
            }
            Value::Unsigned48(n) => {
                LittleEndian::write_uint(&mut buf, *n, 6);
                buf[0..6].to_vec()
            }
            Value::Integer56(n) => {
                LittleEndian::write_int(&mut buf, *n, 7);
                buf[0..7].to_vec()
            }
            Value::Unsigned56(n) => {
                LittleEndian::write_uint(&mut buf, *n, 7);
                buf[0..7].to_vec()
            }
            Value::Integer64(n) => {
                LittleEndian::write_i64(&mut buf, *n);
                buf.to_vec()
            }
            Value::Unsigned64(n) => {
                LittleEndian::write_u64(&mut buf, *n);
                buf.to_vec()
            }
            Value::Real32(n) => {
                LittleEndian::write_f32(&mut buf, *n);
                buf[0..4].to_vec()
            }
            Value::Real64(n) => {
                LittleEndian::write_f64(&mut buf, *n);
                buf.to_vec()
            }
            Value::VisibleString(s) => {
                let bytes = ASCII
                    .encode(s, EncoderTrap::Strict)
                    .map_err(|_| ValueError::Unencodable {
                        data_type: "VISIBLE_STRING",
                    })?;
                if bytes.iter().any(|b| *b > 0x7E) {
                    return Err(ValueError::NotVisibleCharacters);
                }
                bytes
            }
            Value::OctetString(bytes) | Value::Domain(bytes) => bytes.clone(),
            Value::UnicodeString(s) => {
                UTF_16LE
                    .encode(s, EncoderTrap::Strict)
                    .map_err(|_| ValueError::Unencodable {
                        data_type: "UNICODE_STRING",
                    })?
            }
            Value::TimeOfDay(date) => {
                let rel = date.timestamp_millis() - EPOCH_UNIX_MS;
                encode_date_pair(rel)?
            }
            Value::TimeDifference(delta) => encode_date_pair(delta.num_milliseconds())?,
        };
        Ok(bytes)
    }

    /// Decode a little endian buffer against a declared data type.
    pub fn decode(bytes: &[u8], data_type: DataType) -> Result<Value, ValueError> {
        if let Some(expected) = data_type.size() {
            if bytes.len() != expected {
                return Err(ValueError::WrongLength {
                    data_type: data_type.name(),
                    expected,
                    actual: bytes.len(),
                });
            }
        }
        let value = match data_type {
            DataType::Boolean => match bytes[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(ValueError::InvalidBoolean(other)),
            },
            DataType::Integer8 => Value::Integer8(bytes[0] as i8),
            DataType::Unsigned8 => Value::Unsigned8(bytes[0]),
            DataType::Integer16 => Value::Integer16(LittleEndian::read_i16(bytes)),
            DataType::Unsigned16 => Value::Unsigned16(LittleEndian::read_u16(bytes)),
            DataType::Integer24 => Value::Integer24(LittleEndian::read_int(bytes, 3) as i32),
            DataType::Unsigned24 => Value::Unsigned24(LittleEndian::read_uint(bytes, 3) as u32),
            DataType::Integer32 => Value::Integer32(LittleEndian::read_i32(bytes)),
            DataType::Unsigned32 => Value::Unsigned32(LittleEndian::read_u32(bytes)),
            DataType::Integer40 => Value::Integer40(LittleEndian::read_int(bytes, 5)),
            DataType::Unsigned40 => Value::Unsigned40(LittleEndian::read_uint(bytes, 5)),
            DataType::Integer48 => Value::Integer48(LittleEndian::read_int(bytes, 6)),
            DataType::Unsigned48 => Value::Unsigned48(LittleEndian::read_uint(bytes, 6)),
            DataType::Integer56 => Value::Integer56(LittleEndian::read_int(bytes, 7)),
            DataType::Unsigned56 => Value::Unsigned56(LittleEndian::read_uint(bytes, 7)),
            DataType::Integer64 => Value::Integer64(LittleEndian::read_i64(bytes)),
            DataType::Unsigned64 => Value::Unsigned64(LittleEndian::read_u64(bytes)),
            DataType::Real32 => Value::Real32(LittleEndian::read_f32(bytes)),
            DataType::Real64 => Value::Real64(LittleEndian::read_f64(bytes)),
            DataType::VisibleString => {
                if bytes.iter().any(|b| *b > 0x7E) {
                    return Err(ValueError::NotVisibleCharacters);
                }
                let s = ASCII
                    .decode(bytes, DecoderTrap::Strict)
                    .map_err(|_| ValueError::NotVisibleCharacters)?;
                Value::VisibleString(s)
            }
            DataType::OctetString => Value::OctetString(bytes.to_vec()),
            DataType::Domain => Value::Domain(bytes.to_vec()),
            DataType::UnicodeString => {
                if bytes.len() % 2 != 0 {
                    return Err(ValueError::OddUnicodeLength);
                }
                let s = UTF_16LE
                    .decode(bytes, DecoderTrap::Strict)
                    .map_err(|_| ValueError::Unencodable {
                        data_type: "UNICODE_STRING",
                    })?;
                Value::UnicodeString(s)
            }
            DataType::TimeOfDay => {
                let rel = decode_date_pair(bytes);
                let date = Utc
                    .timestamp_millis_opt(EPOCH_UNIX_MS + rel)
                    .single()
                    .ok_or(ValueError::DateOutOfRange)?;
                Value::TimeOfDay(date)
            }
            DataType::TimeDifference => {
                Value::TimeDifference(TimeDelta::milliseconds(decode_date_pair(bytes)))
            }
        };
        Ok(value)
    }

    /// Numeric view used by limit checks and scale factors.
    pub fn as_f64(&self) -> Option<f64> {
        let n = match self {
            Value::Boolean(b) => *b as u8 as f64,
            Value::Integer8(n) => *n as f64,
            Value::Integer16(n) => *n as f64,
            Value::Integer24(n) | Value::Integer32(n) => *n as f64,
            Value::Integer40(n) | Value::Integer48(n) | Value::Integer56(n)
            | Value::Integer64(n) => *n as f64,
            Value::Unsigned8(n) => *n as f64,
            Value::Unsigned16(n) => *n as f64,
            Value::Unsigned24(n) | Value::Unsigned32(n) => *n as f64,
            Value::Unsigned40(n) | Value::Unsigned48(n) | Value::Unsigned56(n)
            | Value::Unsigned64(n) => *n as f64,
            Value::Real32(n) => *n as f64,
            Value::Real64(n) => *n,
            _ => return None,
        };
        Some(n)
    }

    /// Build a numeric value of the given type, truncating toward zero
    /// for the integer types. Used when a scale factor divides an
    /// assigned value back into its stored form.
    pub fn from_f64(n: f64, data_type: DataType) -> Option<Value> {
        let value = match data_type {
            DataType::Boolean => Value::Boolean(n != 0.0),
            DataType::Integer8 => Value::Integer8(n.trunc() as i8),
            DataType::Integer16 => Value::Integer16(n.trunc() as i16),
            DataType::Integer24 | DataType::Integer32 => Value::Integer32(n.trunc() as i32),
            DataType::Integer40 | DataType::Integer48 | DataType::Integer56
            | DataType::Integer64 => Value::Integer64(n.trunc() as i64),
            DataType::Unsigned8 => Value::Unsigned8(n.trunc() as u8),
            DataType::Unsigned16 => Value::Unsigned16(n.trunc() as u16),
            DataType::Unsigned24 | DataType::Unsigned32 => Value::Unsigned32(n.trunc() as u32),
            DataType::Unsigned40 | DataType::Unsigned48 | DataType::Unsigned56
            | DataType::Unsigned64 => Value::Unsigned64(n.trunc() as u64),
            DataType::Real32 => Value::Real32(n as f32),
            DataType::Real64 => Value::Real64(n),
            _ => return None,
        };
        // `from_f64` may widen 24/40/48/56 bit requests to the next
        // variant; re-narrow so the declared type is preserved.
        Some(match (value, data_type) {
            (Value::Integer32(v), DataType::Integer24) => Value::Integer24(v),
            (Value::Unsigned32(v), DataType::Unsigned24) => Value::Unsigned24(v),
            (Value::Integer64(v), DataType::Integer40) => Value::Integer40(v),
            (Value::Integer64(v), DataType::Integer48) => Value::Integer48(v),
            (Value::Integer64(v), DataType::Integer56) => Value::Integer56(v),
            (Value::Unsigned64(v), DataType::Unsigned40) => Value::Unsigned40(v),
            (Value::Unsigned64(v), DataType::Unsigned48) => Value::Unsigned48(v),
            (Value::Unsigned64(v), DataType::Unsigned56) => Value::Unsigned56(v),
            (other, _) => other,
        })
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Unsigned8(n) => Some(*n as u32),
            Value::Unsigned16(n) => Some(*n as u32),
            Value::Unsigned24(n) | Value::Unsigned32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Unsigned8(n) => Some(*n as u16),
            Value::Unsigned16(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Unsigned8(n) => Some(*n),
            _ => None,
        }
    }
}

/// Split relative milliseconds into the 6 byte (ms-of-day, days) pair.
fn encode_date_pair(rel_ms: i64) -> Result<Vec<u8>, ValueError> {
    if rel_ms < 0 {
        return Err(ValueError::DateOutOfRange);
    }
    let days = rel_ms / MS_PER_DAY;
    let ms = rel_ms % MS_PER_DAY;
    if days > u16::MAX as i64 {
        return Err(ValueError::DateOutOfRange);
    }
    let mut buf = [0_u8; 6];
    // 28 bit milliseconds field; a day has fewer than 2^28 milliseconds
    LittleEndian::write_u32(&mut buf[0..4], ms as u32 & 0x0FFF_FFFF);
    LittleEndian::write_u16(&mut buf[4..6], days as u16);
    Ok(buf.to_vec())
}

fn decode_date_pair(bytes: &[u8]) -> i64 {
    let ms = (LittleEndian::read_u32(&bytes[0..4]) & 0x0FFF_FFFF) as i64;
    let days = LittleEndian::read_u16(&bytes[4..6]) as i64;
    days * MS_PER_DAY + ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let encoded = value.encode().unwrap();
        let decoded = Value::decode(&encoded, value.data_type()).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(Value::Boolean(true));
        round_trip(Value::Boolean(false));
        round_trip(Value::Integer8(-1));
        round_trip(Value::Integer16(-256));
        round_trip(Value::Integer24(-0x123456));
        round_trip(Value::Integer32(-1_020_304));
        round_trip(Value::Integer40(-0x12_3456_7890));
        round_trip(Value::Integer48(-0x1234_5678_9012));
        round_trip(Value::Integer56(-0x12_3456_7890_1234));
        round_trip(Value::Integer64(i64::MIN));
        round_trip(Value::Unsigned8(0xFF));
        round_trip(Value::Unsigned16(0x0102));
        round_trip(Value::Unsigned24(0xFFFFFF));
        round_trip(Value::Unsigned32(0x01020304));
        round_trip(Value::Unsigned40(0xFF_FFFF_FFFF));
        round_trip(Value::Unsigned48(0xFFFF_FFFF_FFFF));
        round_trip(Value::Unsigned56(0xFF_FFFF_FFFF_FFFF));
        round_trip(Value::Unsigned64(u64::MAX));
        round_trip(Value::Real32(-0.123e-2));
        round_trip(Value::Real64(1.0e100));
    }

    #[test]
    fn known_little_endian_buffers() {
        assert_eq!(
            Value::Integer32(-1).encode().unwrap(),
            vec![0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            Value::Unsigned32(0x01020304).encode().unwrap(),
            vec![0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Value::Integer16(-256).encode().unwrap(), vec![0x00, 0xFF]);
        assert_eq!(
            Value::Real32(1.0).encode().unwrap(),
            vec![0x00, 0x00, 0x80, 0x3F]
        );
    }

    #[test]
    fn sign_extension_of_odd_sized_integers() {
        assert_eq!(Value::Integer24(-1).encode().unwrap(), vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(
            Value::decode(&[0xFF, 0xFF, 0xFF], DataType::Integer24).unwrap(),
            Value::Integer24(-1)
        );
        assert_eq!(
            Value::decode(&[0x00, 0x00, 0x80], DataType::Integer24).unwrap(),
            Value::Integer24(-0x80_0000)
        );
        assert_eq!(
            Value::decode(&[0, 0, 0, 0, 0x80], DataType::Integer40).unwrap(),
            Value::Integer40(-0x80_0000_0000)
        );
    }

    #[test]
    fn strings_round_trip() {
        round_trip(Value::VisibleString("I am a visible string".to_string()));
        round_trip(Value::UnicodeString("unicode \u{2713}".to_string()));
        round_trip(Value::OctetString(vec![0x00, 0xFF, 0x7F, 0x80]));
        round_trip(Value::Domain((0..=255).collect()));
    }

    #[test]
    fn visible_string_rejects_high_bytes() {
        assert_eq!(
            Value::decode(&[0x41, 0x7F], DataType::VisibleString),
            Err(ValueError::NotVisibleCharacters)
        );
        assert!(Value::VisibleString("\u{00FC}".to_string()).encode().is_err());
    }

    #[test]
    fn unicode_encoding_is_utf16le() {
        let encoded = Value::UnicodeString("A\u{2713}".to_string()).encode().unwrap();
        assert_eq!(encoded, vec![0x41, 0x00, 0x13, 0x27]);
        assert_eq!(encoded.len() % 2, 0);
    }

    #[test]
    fn epoch_encodes_to_all_zero() {
        let epoch = Utc.timestamp_millis_opt(EPOCH_UNIX_MS).single().unwrap();
        assert_eq!(
            Value::TimeOfDay(epoch).encode().unwrap(),
            vec![0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn dates_round_trip_with_millisecond_precision() {
        let date = Utc
            .timestamp_millis_opt(EPOCH_UNIX_MS + 123 * MS_PER_DAY + 43_200_123)
            .single()
            .unwrap();
        round_trip(Value::TimeOfDay(date));
        round_trip(Value::TimeDifference(TimeDelta::milliseconds(
            5 * MS_PER_DAY + 999,
        )));
        // six bytes, always
        assert_eq!(Value::TimeOfDay(date).encode().unwrap().len(), 6);
    }

    #[test]
    fn pre_epoch_dates_are_rejected() {
        let date = Utc.timestamp_millis_opt(0).single().unwrap(); // 1970
        assert_eq!(
            Value::TimeOfDay(date).encode(),
            Err(ValueError::DateOutOfRange)
        );
    }

    #[test]
    fn boolean_rejects_other_bytes() {
        assert_eq!(
            Value::decode(&[2], DataType::Boolean),
            Err(ValueError::InvalidBoolean(2))
        );
    }

    #[test]
    fn length_is_checked_for_fixed_types() {
        assert_eq!(
            Value::decode(&[0x01, 0x02], DataType::Unsigned32),
            Err(ValueError::WrongLength {
                data_type: "UNSIGNED32",
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn scaled_truncation_respects_declared_type() {
        let stored = Value::from_f64(7.9, DataType::Integer16).unwrap();
        assert_eq!(stored, Value::Integer16(7));
        let stored = Value::from_f64(300.0, DataType::Unsigned24).unwrap();
        assert_eq!(stored, Value::Unsigned24(300));
    }
}
