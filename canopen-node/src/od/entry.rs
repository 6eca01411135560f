//! Object dictionary rows.
//!
//! An [`Entry`] is one row of the dictionary, keyed by a 16 bit index.
//! Scalar object types (VAR, DEFTYPE, DOMAIN) store their value
//! directly; composite types (ARRAY, RECORD, DEFSTRUCT) hold a map of
//! sub-index to [`SubEntry`] where sub-index 0 carries the highest
//! occupied sub-index number.
//!
//! [`EntrySpec`] mirrors the attribute set an EDS description would
//! carry; `Entry::new` enforces the legality matrix of attributes per
//! object type.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::data_type::{DataType, Value};
use crate::error::EdsError;

/// CiA-301 object type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Domain = 0x02,
    DefType = 0x05,
    DefStruct = 0x06,
    Var = 0x07,
    Array = 0x08,
    Record = 0x09,
}

impl ObjectType {
    pub fn is_scalar(&self) -> bool {
        matches!(self, ObjectType::Var | ObjectType::DefType | ObjectType::Domain)
    }
}

/// Access rights of a stored scalar, from the network's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Const,
}

impl AccessType {
    pub fn readable(&self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    pub fn writable(&self) -> bool {
        matches!(self, AccessType::WriteOnly | AccessType::ReadWrite)
    }

    /// The EDS vocabulary for this access type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "ro",
            AccessType::WriteOnly => "wo",
            AccessType::ReadWrite => "rw",
            AccessType::Const => "const",
        }
    }
}

/// Attribute set describing an entry or sub-entry to be created.
///
/// The same shape is used for `add_entry` and `add_sub_entry`; which
/// fields are required or forbidden depends on the object type, see
/// `Entry::new`.
#[derive(Debug, Clone, Default)]
pub struct EntrySpec {
    pub parameter_name: String,
    pub object_type: Option<ObjectType>,
    pub data_type: Option<DataType>,
    pub access_type: Option<AccessType>,
    pub default_value: Option<Value>,
    pub low_limit: Option<Value>,
    pub high_limit: Option<Value>,
    pub pdo_mapping: bool,
    pub scale_factor: Option<f64>,
    pub compact_sub_obj: bool,
}

impl EntrySpec {
    /// Shorthand for a plain VAR entry.
    pub fn var(name: &str, data_type: DataType, access_type: AccessType) -> EntrySpec {
        EntrySpec {
            parameter_name: name.to_string(),
            object_type: Some(ObjectType::Var),
            data_type: Some(data_type),
            access_type: Some(access_type),
            ..EntrySpec::default()
        }
    }

    /// Shorthand for an ARRAY or RECORD head without sub entries yet.
    pub fn composite(name: &str, object_type: ObjectType) -> EntrySpec {
        EntrySpec {
            parameter_name: name.to_string(),
            object_type: Some(object_type),
            ..EntrySpec::default()
        }
    }

    pub fn with_default(mut self, value: Value) -> EntrySpec {
        self.default_value = Some(value);
        self
    }

    pub fn with_limits(mut self, low: Option<Value>, high: Option<Value>) -> EntrySpec {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    pub fn with_pdo_mapping(mut self) -> EntrySpec {
        self.pdo_mapping = true;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> EntrySpec {
        self.scale_factor = Some(scale);
        self
    }
}

/// One stored scalar cell together with its schema.
#[derive(Debug, Clone)]
pub struct SubEntry {
    pub parameter_name: String,
    pub data_type: DataType,
    pub access_type: AccessType,
    pub default_value: Option<Value>,
    pub low_limit: Option<Value>,
    pub high_limit: Option<Value>,
    pub pdo_mapping: bool,
    pub scale_factor: f64,
    value: Value,
}

impl SubEntry {
    fn from_spec(index: u16, spec: &EntrySpec) -> Result<SubEntry, EdsError> {
        let data_type = spec.data_type.ok_or(EdsError::InvalidEntry {
            index,
            reason: "dataType is required",
        })?;
        let access_type = spec.access_type.ok_or(EdsError::InvalidEntry {
            index,
            reason: "accessType is required",
        })?;
        if spec.scale_factor.is_some() && !data_type.is_numeric() {
            return Err(EdsError::InvalidEntry {
                index,
                reason: "scale factor on a non numeric entry",
            });
        }
        let value = match &spec.default_value {
            Some(default) => {
                if default.data_type() != data_type {
                    return Err(EdsError::InvalidEntry {
                        index,
                        reason: "default value does not match dataType",
                    });
                }
                default.clone()
            }
            None => zero_value(data_type),
        };
        Ok(SubEntry {
            parameter_name: spec.parameter_name.clone(),
            data_type,
            access_type,
            default_value: spec.default_value.clone(),
            low_limit: spec.low_limit.clone(),
            high_limit: spec.high_limit.clone(),
            pdo_mapping: spec.pdo_mapping,
            scale_factor: spec.scale_factor.unwrap_or(1.0),
            value,
        })
    }

    /// The raw stored value, before any scale factor is applied.
    pub fn raw(&self) -> &Value {
        &self.value
    }

    /// The exposed value: `stored * scale` for numeric entries with a
    /// scale factor, the stored value otherwise.
    pub fn scaled(&self) -> Value {
        if self.scale_factor == 1.0 {
            return self.value.clone();
        }
        match self.value.as_f64() {
            Some(n) => Value::Real64(n * self.scale_factor),
            None => self.value.clone(),
        }
    }

    /// Store a new value, dividing by the scale factor first and
    /// coercing numerics to the declared type.
    ///
    /// Returns whether the stored value actually changed.
    pub(crate) fn assign(&mut self, index: u16, sub_index: u8, value: Value) -> Result<bool, EdsError> {
        let raw = if self.scale_factor != 1.0 {
            let n = value
                .as_f64()
                .ok_or(EdsError::ValueMismatch { index, sub_index })?;
            let mut quotient = n / self.scale_factor;
            // the division reintroduces binary float noise around whole
            // numbers; absorb it before the type truncates
            if (quotient - quotient.round()).abs() < 1e-9 {
                quotient = quotient.round();
            }
            Value::from_f64(quotient, self.data_type)
                .ok_or(EdsError::ValueMismatch { index, sub_index })?
        } else if value.data_type() == self.data_type {
            value
        } else {
            // tolerate numeric widening/narrowing between numeric types
            match (value.as_f64(), self.data_type.is_numeric()) {
                (Some(n), true) => Value::from_f64(n, self.data_type)
                    .ok_or(EdsError::ValueMismatch { index, sub_index })?,
                _ => return Err(EdsError::ValueMismatch { index, sub_index }),
            }
        };
        if raw == self.value {
            return Ok(false);
        }
        self.value = raw;
        Ok(true)
    }
}

/// Storage of an entry: one scalar or a map of sub entries.
#[derive(Debug, Clone)]
pub enum EntryData {
    Scalar(SubEntry),
    Composite(BTreeMap<u8, SubEntry>),
}

/// An object dictionary row.
#[derive(Debug, Clone)]
pub struct Entry {
    pub index: u16,
    pub parameter_name: String,
    pub object_type: ObjectType,
    pub compact_sub_obj: bool,
    /// Schema applied to lazily created sub entries of compact objects.
    compact_template: Option<EntrySpec>,
    data: EntryData,
}

impl Entry {
    pub fn new(index: u16, spec: EntrySpec) -> Result<Entry, EdsError> {
        let object_type = spec.object_type.unwrap_or(ObjectType::Var);
        match object_type {
            ObjectType::Var | ObjectType::DefType => {
                let scalar = SubEntry::from_spec(index, &spec)?;
                Ok(Entry {
                    index,
                    parameter_name: spec.parameter_name,
                    object_type,
                    compact_sub_obj: false,
                    compact_template: None,
                    data: EntryData::Scalar(scalar),
                })
            }
            ObjectType::Domain => {
                if spec.low_limit.is_some() || spec.high_limit.is_some() {
                    return Err(EdsError::InvalidEntry {
                        index,
                        reason: "DOMAIN does not take limits",
                    });
                }
                if spec.pdo_mapping {
                    return Err(EdsError::InvalidEntry {
                        index,
                        reason: "DOMAIN is not PDO mappable",
                    });
                }
                let mut spec = spec;
                match spec.data_type {
                    None => spec.data_type = Some(DataType::Domain),
                    Some(DataType::Domain) => {}
                    Some(_) => {
                        return Err(EdsError::InvalidEntry {
                            index,
                            reason: "DOMAIN entries use the DOMAIN data type",
                        })
                    }
                }
                if spec.access_type.is_none() {
                    spec.access_type = Some(AccessType::ReadWrite);
                }
                let scalar = SubEntry::from_spec(index, &spec)?;
                Ok(Entry {
                    index,
                    parameter_name: spec.parameter_name,
                    object_type,
                    compact_sub_obj: false,
                    compact_template: None,
                    data: EntryData::Scalar(scalar),
                })
            }
            ObjectType::Array | ObjectType::Record | ObjectType::DefStruct => {
                if spec.compact_sub_obj {
                    if object_type == ObjectType::DefStruct {
                        return Err(EdsError::InvalidEntry {
                            index,
                            reason: "DEFSTRUCT does not support compact sub objects",
                        });
                    }
                    // compact objects carry the cell schema at top level
                    SubEntry::from_spec(index, &spec)?;
                    let mut sub = BTreeMap::new();
                    sub.insert(0, count_sub_entry(0));
                    return Ok(Entry {
                        index,
                        parameter_name: spec.parameter_name.clone(),
                        object_type,
                        compact_sub_obj: true,
                        compact_template: Some(spec),
                        data: EntryData::Composite(sub),
                    });
                }
                if spec.data_type.is_some()
                    || spec.access_type.is_some()
                    || spec.default_value.is_some()
                    || spec.low_limit.is_some()
                    || spec.high_limit.is_some()
                    || spec.pdo_mapping
                {
                    return Err(EdsError::InvalidEntry {
                        index,
                        reason: "composite entries carry attributes on their sub entries only",
                    });
                }
                let mut sub = BTreeMap::new();
                sub.insert(0, count_sub_entry(0));
                Ok(Entry {
                    index,
                    parameter_name: spec.parameter_name,
                    object_type,
                    compact_sub_obj: false,
                    compact_template: None,
                    data: EntryData::Composite(sub),
                })
            }
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.data, EntryData::Scalar(_))
    }

    /// Highest occupied sub-index, 0 for scalars and empty composites.
    pub fn highest_sub_index(&self) -> u8 {
        match &self.data {
            EntryData::Scalar(_) => 0,
            EntryData::Composite(sub) => sub.keys().next_back().copied().unwrap_or(0),
        }
    }

    pub fn sub_entry(&self, sub_index: u8) -> Option<&SubEntry> {
        match &self.data {
            EntryData::Scalar(cell) if sub_index == 0 => Some(cell),
            EntryData::Scalar(_) => None,
            EntryData::Composite(sub) => sub.get(&sub_index),
        }
    }

    pub(crate) fn sub_entry_mut(&mut self, sub_index: u8) -> Option<&mut SubEntry> {
        match &mut self.data {
            EntryData::Scalar(cell) if sub_index == 0 => Some(cell),
            EntryData::Scalar(_) => None,
            EntryData::Composite(sub) => sub.get_mut(&sub_index),
        }
    }

    pub fn sub_indices(&self) -> Vec<u8> {
        match &self.data {
            EntryData::Scalar(_) => vec![0],
            EntryData::Composite(sub) => sub.keys().copied().collect(),
        }
    }

    pub(crate) fn insert_sub_entry(
        &mut self,
        sub_index: u8,
        spec: EntrySpec,
    ) -> Result<(), EdsError> {
        let index = self.index;
        if self.compact_sub_obj {
            return Err(EdsError::InvalidEntry {
                index,
                reason: "compact objects define sub entries implicitly",
            });
        }
        let sub = match &mut self.data {
            EntryData::Scalar(_) => {
                return Err(EdsError::InvalidEntry {
                    index,
                    reason: "scalar object types take no sub entries",
                })
            }
            EntryData::Composite(sub) => sub,
        };
        if sub.contains_key(&sub_index) {
            return Err(EdsError::SubObjectAlreadyExists { index, sub_index });
        }
        let cell = SubEntry::from_spec(index, &spec)?;
        sub.insert(sub_index, cell);
        self.refresh_count();
        Ok(())
    }

    /// Create the sub entry of a compact object on first write.
    pub(crate) fn materialize_compact(&mut self, sub_index: u8) -> Result<(), EdsError> {
        let index = self.index;
        let template = self
            .compact_template
            .clone()
            .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        match &mut self.data {
            EntryData::Composite(sub) if !sub.contains_key(&sub_index) => {
                let mut spec = template;
                spec.parameter_name = format!("{}{}", spec.parameter_name, sub_index);
                let cell = SubEntry::from_spec(index, &spec)?;
                sub.insert(sub_index, cell);
            }
            _ => {}
        }
        self.refresh_count();
        Ok(())
    }

    pub(crate) fn remove_sub(&mut self, sub_index: u8) -> Result<SubEntry, EdsError> {
        let index = self.index;
        if sub_index == 0 {
            return Err(EdsError::SubIndexZeroImmutable { index });
        }
        let removed = match &mut self.data {
            EntryData::Scalar(_) => None,
            EntryData::Composite(sub) => sub.remove(&sub_index),
        }
        .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        self.refresh_count();
        Ok(removed)
    }

    /// Keep sub-index 0 equal to the highest occupied sub-index.
    fn refresh_count(&mut self) {
        if let EntryData::Composite(sub) = &mut self.data {
            let highest = sub.keys().next_back().copied().unwrap_or(0);
            if let Some(counter) = sub.get_mut(&0) {
                counter.value = Value::Unsigned8(highest);
            }
        }
    }

    /// Overwrite the stored count cell; the error history at 0x1003
    /// tracks valid entries rather than structure through this.
    pub(crate) fn set_count(&mut self, count: u8) {
        if let EntryData::Composite(sub) = &mut self.data {
            if let Some(counter) = sub.get_mut(&0) {
                counter.value = Value::Unsigned8(count);
            }
        }
    }
}

fn count_sub_entry(count: u8) -> SubEntry {
    SubEntry {
        parameter_name: "Highest sub-index supported".to_string(),
        data_type: DataType::Unsigned8,
        access_type: AccessType::ReadOnly,
        default_value: None,
        low_limit: None,
        high_limit: None,
        pdo_mapping: false,
        scale_factor: 1.0,
        value: Value::Unsigned8(count),
    }
}

/// The neutral initial value of a data type.
pub fn zero_value(data_type: DataType) -> Value {
    match data_type {
        DataType::Boolean => Value::Boolean(false),
        DataType::Integer8 => Value::Integer8(0),
        DataType::Integer16 => Value::Integer16(0),
        DataType::Integer24 => Value::Integer24(0),
        DataType::Integer32 => Value::Integer32(0),
        DataType::Integer40 => Value::Integer40(0),
        DataType::Integer48 => Value::Integer48(0),
        DataType::Integer56 => Value::Integer56(0),
        DataType::Integer64 => Value::Integer64(0),
        DataType::Unsigned8 => Value::Unsigned8(0),
        DataType::Unsigned16 => Value::Unsigned16(0),
        DataType::Unsigned24 => Value::Unsigned24(0),
        DataType::Unsigned32 => Value::Unsigned32(0),
        DataType::Unsigned40 => Value::Unsigned40(0),
        DataType::Unsigned48 => Value::Unsigned48(0),
        DataType::Unsigned56 => Value::Unsigned56(0),
        DataType::Unsigned64 => Value::Unsigned64(0),
        DataType::Real32 => Value::Real32(0.0),
        DataType::Real64 => Value::Real64(0.0),
        DataType::VisibleString => Value::VisibleString(String::new()),
        DataType::OctetString => Value::OctetString(Vec::new()),
        DataType::UnicodeString => Value::UnicodeString(String::new()),
        // 1984-01-01T00:00:00Z, always representable
        DataType::TimeOfDay => Value::TimeOfDay(
            Utc.timestamp_millis_opt(441_763_200_000)
                .single()
                .unwrap_or_else(|| unreachable!()),
        ),
        DataType::TimeDifference => Value::TimeDifference(chrono::Duration::milliseconds(0)),
        DataType::Domain => Value::Domain(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_requires_data_and_access_type() {
        let spec = EntrySpec {
            parameter_name: "incomplete".to_string(),
            object_type: Some(ObjectType::Var),
            data_type: Some(DataType::Unsigned8),
            ..EntrySpec::default()
        };
        assert!(matches!(
            Entry::new(0x2000, spec),
            Err(EdsError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn composite_rejects_top_level_attributes() {
        let mut spec = EntrySpec::composite("array", ObjectType::Array);
        spec.data_type = Some(DataType::Unsigned8);
        assert!(matches!(
            Entry::new(0x2000, spec),
            Err(EdsError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn compact_requires_top_level_attributes() {
        let mut spec = EntrySpec::composite("array", ObjectType::Array);
        spec.compact_sub_obj = true;
        assert!(Entry::new(0x2000, spec.clone()).is_err());
        spec.data_type = Some(DataType::Unsigned16);
        spec.access_type = Some(AccessType::ReadWrite);
        let mut entry = Entry::new(0x2000, spec).unwrap();
        assert!(matches!(
            entry.insert_sub_entry(1, EntrySpec::default()),
            Err(EdsError::InvalidEntry { .. })
        ));
        entry.materialize_compact(2).unwrap();
        assert_eq!(entry.highest_sub_index(), 2);
        assert_eq!(entry.sub_entry(2).unwrap().data_type, DataType::Unsigned16);
    }

    #[test]
    fn domain_rejects_limits_and_mapping() {
        let mut spec = EntrySpec {
            parameter_name: "blob".to_string(),
            object_type: Some(ObjectType::Domain),
            ..EntrySpec::default()
        };
        spec.pdo_mapping = true;
        assert!(Entry::new(0x2000, spec.clone()).is_err());
        spec.pdo_mapping = false;
        let entry = Entry::new(0x2000, spec).unwrap();
        assert_eq!(entry.sub_entry(0).unwrap().data_type, DataType::Domain);
        assert_eq!(entry.sub_entry(0).unwrap().access_type, AccessType::ReadWrite);
    }

    #[test]
    fn sub_index_zero_tracks_highest_sub_index() {
        let mut entry = Entry::new(
            0x2000,
            EntrySpec::composite("record", ObjectType::Record),
        )
        .unwrap();
        entry
            .insert_sub_entry(
                3,
                EntrySpec::var("three", DataType::Unsigned8, AccessType::ReadWrite),
            )
            .unwrap();
        assert_eq!(entry.sub_entry(0).unwrap().raw(), &Value::Unsigned8(3));
        entry
            .insert_sub_entry(
                1,
                EntrySpec::var("one", DataType::Unsigned8, AccessType::ReadWrite),
            )
            .unwrap();
        assert_eq!(entry.sub_entry(0).unwrap().raw(), &Value::Unsigned8(3));
        entry.remove_sub(3).unwrap();
        assert_eq!(entry.sub_entry(0).unwrap().raw(), &Value::Unsigned8(1));
        assert!(matches!(
            entry.remove_sub(0),
            Err(EdsError::SubIndexZeroImmutable { .. })
        ));
    }

    #[test]
    fn scale_factor_views() {
        let spec = EntrySpec::var("scaled", DataType::Integer16, AccessType::ReadWrite)
            .with_scale(0.1);
        let mut entry = Entry::new(0x2000, spec).unwrap();
        let cell = entry.sub_entry_mut(0).unwrap();
        cell.assign(0x2000, 0, Value::Real64(5.0)).unwrap();
        assert_eq!(cell.raw(), &Value::Integer16(50));
        assert_eq!(cell.scaled(), Value::Real64(5.0));
    }

    #[test]
    fn assign_reports_changes_only() {
        let spec = EntrySpec::var("value", DataType::Unsigned8, AccessType::ReadWrite);
        let mut entry = Entry::new(0x2000, spec).unwrap();
        let cell = entry.sub_entry_mut(0).unwrap();
        assert!(cell.assign(0x2000, 0, Value::Unsigned8(7)).unwrap());
        assert!(!cell.assign(0x2000, 0, Value::Unsigned8(7)).unwrap());
        assert!(cell
            .assign(0x2000, 0, Value::VisibleString("no".into()))
            .is_err());
    }
}
