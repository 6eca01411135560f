//! Object dictionary module
//!
//! The dictionary is the indexed store every protocol module observes:
//! entries keyed by a 16 bit index, scalar cells addressed by an 8 bit
//! sub-index. Mutations queue change notifications which the device
//! core routes to the modules and to subscribed listeners before any
//! frame caused by the change is emitted, so modules always reconfigure
//! from a consistent view.
//!
//! # Example
//!
//! ```
//! use cano::od::{EntrySpec, ObjectDictionary};
//! use cano::{AccessType, DataType, Value};
//!
//! let mut od = ObjectDictionary::new();
//! od.add_entry(
//!     0x2000,
//!     EntrySpec::var("Setpoint", DataType::Unsigned32, AccessType::ReadWrite),
//! )
//! .unwrap();
//! od.set_value(0x2000, Value::Unsigned32(0x12345678)).unwrap();
//! assert_eq!(od.get_value(0x2000).unwrap(), Value::Unsigned32(0x12345678));
//! ```

mod entry;
mod helpers;

pub use entry::{zero_value, AccessType, Entry, EntryData, EntrySpec, ObjectType, SubEntry};
pub use helpers::{
    ErrorRegisterBit, Identity, PdoCommParams, SdoClientChannel, SdoServerChannel,
    COB_ID_ADD_NODE_ID, COB_ID_INVALID,
};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::collections::BTreeMap;

use log::debug;

use crate::data_type::Value;
use crate::error::EdsError;
use crate::sdo::SdoAbortCode;

/// Queued change notification.
///
/// `Updated` carries the new raw stored value; the encoded little
/// endian bytes are recoverable through [`Value::encode`].
#[derive(Debug, Clone, PartialEq)]
pub enum OdNotification {
    NewEntry { index: u16 },
    RemovedEntry { index: u16 },
    Updated { index: u16, sub_index: u8, value: Value },
}

/// The per device object dictionary.
#[derive(Debug, Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<u16, Entry>,
    names: HashMap<String, Vec<u16>>,
    subscriptions: HashMap<u16, BTreeSet<String>>,
    notifications: VecDeque<OdNotification>,
}

impl ObjectDictionary {
    pub fn new() -> ObjectDictionary {
        ObjectDictionary::default()
    }

    /// Register a new entry.
    ///
    /// The attribute combination is validated against the object type;
    /// registering an occupied index fails.
    pub fn add_entry(&mut self, index: u16, spec: EntrySpec) -> Result<(), EdsError> {
        if self.entries.contains_key(&index) {
            return Err(EdsError::ObjectAlreadyExists { index });
        }
        let entry = Entry::new(index, spec)?;
        self.names
            .entry(entry.parameter_name.clone())
            .or_default()
            .push(index);
        debug!("od: new entry 0x{:04X} ({})", index, entry.parameter_name);
        self.entries.insert(index, entry);
        self.notifications
            .push_back(OdNotification::NewEntry { index });
        Ok(())
    }

    /// Register a sub entry of a composite entry. Sub-index 0 is
    /// maintained by the dictionary and cannot be added explicitly.
    pub fn add_sub_entry(
        &mut self,
        index: u16,
        sub_index: u8,
        spec: EntrySpec,
    ) -> Result<(), EdsError> {
        if sub_index == 0 {
            return Err(EdsError::SubObjectAlreadyExists { index, sub_index });
        }
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        entry.insert_sub_entry(sub_index, spec)?;
        let value = entry
            .sub_entry(sub_index)
            .map(|cell| cell.raw().clone())
            .unwrap_or(Value::Unsigned8(0));
        self.notifications.push_back(OdNotification::Updated {
            index,
            sub_index,
            value,
        });
        Ok(())
    }

    /// Remove an entry. Exactly one occurrence of its name is dropped
    /// from the name lookup, remaining entries keep their order.
    pub fn remove_entry(&mut self, index: u16) -> Result<Entry, EdsError> {
        let entry = self
            .entries
            .remove(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        if let Some(indices) = self.names.get_mut(&entry.parameter_name) {
            if let Some(position) = indices.iter().position(|i| *i == index) {
                indices.remove(position);
            }
            if indices.is_empty() {
                self.names.remove(&entry.parameter_name);
            }
        }
        self.subscriptions.remove(&index);
        self.notifications
            .push_back(OdNotification::RemovedEntry { index });
        Ok(entry)
    }

    /// Remove a sub entry; sub-index 0 is immutable.
    pub fn remove_sub_entry(&mut self, index: u16, sub_index: u8) -> Result<(), EdsError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        entry.remove_sub(sub_index)?;
        let count = entry.highest_sub_index();
        self.notifications.push_back(OdNotification::Updated {
            index,
            sub_index: 0,
            value: Value::Unsigned8(count),
        });
        Ok(())
    }

    pub fn get_entry(&self, index: u16) -> Option<&Entry> {
        self.entries.get(&index)
    }

    /// First entry carrying the given parameter name.
    pub fn get_entry_named(&self, name: &str) -> Option<&Entry> {
        self.names
            .get(name)
            .and_then(|indices| indices.first())
            .and_then(|index| self.entries.get(index))
    }

    /// All entries carrying the given parameter name, in registration
    /// order.
    pub fn find_entries(&self, name: &str) -> Vec<&Entry> {
        self.names
            .get(name)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|index| self.entries.get(index))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn contains(&self, index: u16) -> bool {
        self.entries.contains_key(&index)
    }

    /// Assign a scalar entry (sub-index 0), presenting the scaled view.
    ///
    /// Writes into read-only or constant entries fail; protocol modules
    /// use the internal raw path instead.
    pub fn set_value(&mut self, index: u16, value: Value) -> Result<(), EdsError> {
        self.set_value_array(index, 0, value)
    }

    /// Assign a cell of a composite entry; for compact objects the cell
    /// is created on first assignment.
    pub fn set_value_array(
        &mut self,
        index: u16,
        sub_index: u8,
        value: Value,
    ) -> Result<(), EdsError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        if entry.compact_sub_obj && sub_index != 0 && entry.sub_entry(sub_index).is_none() {
            entry.materialize_compact(sub_index)?;
        }
        let cell = entry
            .sub_entry_mut(sub_index)
            .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        if !cell.access_type.writable() {
            return Err(EdsError::AccessViolation { index, sub_index });
        }
        let changed = cell.assign(index, sub_index, value)?;
        if changed {
            let value = cell.raw().clone();
            self.notifications.push_back(OdNotification::Updated {
                index,
                sub_index,
                value,
            });
        }
        Ok(())
    }

    /// Read a scalar entry, presenting the scaled view.
    pub fn get_value(&self, index: u16) -> Result<Value, EdsError> {
        self.get_value_array(index, 0)
    }

    pub fn get_value_array(&self, index: u16, sub_index: u8) -> Result<Value, EdsError> {
        let entry = self
            .entries
            .get(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        let cell = entry
            .sub_entry(sub_index)
            .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        Ok(cell.scaled())
    }

    /// The little endian wire form of a stored cell.
    pub fn get_raw(&self, index: u16, sub_index: u8) -> Result<Vec<u8>, EdsError> {
        let entry = self
            .entries
            .get(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        let cell = entry
            .sub_entry(sub_index)
            .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        cell.raw()
            .encode()
            .map_err(|_| EdsError::ValueMismatch { index, sub_index })
    }

    /// Subscribe a listener key to updates of one entry. A key can be
    /// registered at most once per entry so that repeated module
    /// initialization cannot double-wire callbacks.
    pub fn subscribe(&mut self, index: u16, key: &str) -> Result<(), EdsError> {
        if !self.entries.contains_key(&index) {
            return Err(EdsError::ObjectDoesNotExist { index });
        }
        let keys = self.subscriptions.entry(index).or_default();
        if !keys.insert(key.to_string()) {
            return Err(EdsError::DuplicateSubscription {
                index,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, index: u16, key: &str) {
        if let Some(keys) = self.subscriptions.get_mut(&index) {
            keys.remove(key);
        }
    }

    pub fn is_subscribed(&self, index: u16) -> bool {
        self.subscriptions
            .get(&index)
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// Module-facing write path: no access check, change detection and
    /// notification as usual.
    pub(crate) fn set_raw_value(
        &mut self,
        index: u16,
        sub_index: u8,
        value: Value,
    ) -> Result<(), EdsError> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(EdsError::ObjectDoesNotExist { index })?;
        if entry.compact_sub_obj && sub_index != 0 && entry.sub_entry(sub_index).is_none() {
            entry.materialize_compact(sub_index)?;
        }
        let cell = entry
            .sub_entry_mut(sub_index)
            .ok_or(EdsError::SubObjectDoesNotExist { index, sub_index })?;
        let changed = cell.assign(index, sub_index, value)?;
        if changed {
            let value = cell.raw().clone();
            self.notifications.push_back(OdNotification::Updated {
                index,
                sub_index,
                value,
            });
        }
        Ok(())
    }

    pub(crate) fn entry_mut(&mut self, index: u16) -> Option<&mut Entry> {
        self.entries.get_mut(&index)
    }

    pub(crate) fn raw_value(&self, index: u16, sub_index: u8) -> Option<&Value> {
        self.entries
            .get(&index)
            .and_then(|entry| entry.sub_entry(sub_index))
            .map(|cell| cell.raw())
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<OdNotification> {
        self.notifications.drain(..).collect()
    }

    /// Read access on behalf of the SDO server.
    pub(crate) fn sdo_read(&self, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoAbortCode> {
        let entry = self
            .entries
            .get(&index)
            .ok_or(SdoAbortCode::ObjectDoesNotExist)?;
        let cell = entry
            .sub_entry(sub_index)
            .ok_or(SdoAbortCode::SubindexDoesNotExist)?;
        if !cell.access_type.readable() {
            return Err(SdoAbortCode::ReadWriteOnlyError);
        }
        cell.raw().encode().map_err(|_| SdoAbortCode::GeneralError)
    }

    /// Write access on behalf of the SDO server: decodes against the
    /// declared type, enforces access rights and limits, commits in one
    /// step.
    pub(crate) fn sdo_write(
        &mut self,
        index: u16,
        sub_index: u8,
        bytes: &[u8],
    ) -> Result<(), SdoAbortCode> {
        // writing 0 to 0x1003,0 clears the pre-defined error field
        if index == 0x1003 && sub_index == 0 {
            if bytes.iter().all(|b| *b == 0) {
                self.clear_error_history();
                return Ok(());
            }
            return Err(SdoAbortCode::WrongValue);
        }
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(SdoAbortCode::ObjectDoesNotExist)?;
        // the count cell of a PDO mapping record is writable so that a
        // configurator can deactivate and re-enable the mapping remotely
        let is_pdo_mapping =
            (0x1600..=0x17FF).contains(&index) || (0x1A00..=0x1BFF).contains(&index);
        if is_pdo_mapping && sub_index == 0 {
            if bytes.len() != 1 {
                return Err(SdoAbortCode::WrongLength);
            }
            let count = bytes[0];
            if count as usize > entry.sub_indices().len().saturating_sub(1) {
                return Err(SdoAbortCode::PdoOverflow);
            }
            entry.set_count(count);
            self.notifications.push_back(OdNotification::Updated {
                index,
                sub_index: 0,
                value: Value::Unsigned8(count),
            });
            return Ok(());
        }
        let cell = entry
            .sub_entry(sub_index)
            .ok_or(SdoAbortCode::SubindexDoesNotExist)?;
        if !entry.is_scalar() && sub_index == 0 {
            return Err(SdoAbortCode::WriteReadOnlyError);
        }
        if !cell.access_type.writable() {
            return Err(SdoAbortCode::WriteReadOnlyError);
        }
        let value = Value::decode(bytes, cell.data_type).map_err(|_| SdoAbortCode::WrongLength)?;
        if let (Some(n), Some(low)) = (value.as_f64(), cell.low_limit.as_ref()) {
            if let Some(limit) = low.as_f64() {
                if n < limit {
                    return Err(SdoAbortCode::ValueTooLow);
                }
            }
        }
        if let (Some(n), Some(high)) = (value.as_f64(), cell.high_limit.as_ref()) {
            if let Some(limit) = high.as_f64() {
                if n > limit {
                    return Err(SdoAbortCode::ValueTooHigh);
                }
            }
        }
        let cell = entry
            .sub_entry_mut(sub_index)
            .ok_or(SdoAbortCode::SubindexDoesNotExist)?;
        let changed = cell
            .assign(index, sub_index, value)
            .map_err(|_| SdoAbortCode::WrongLength)?;
        if changed {
            let value = cell.raw().clone();
            self.notifications.push_back(OdNotification::Updated {
                index,
                sub_index,
                value,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;

    fn dictionary_with_var() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntrySpec::var("Value", DataType::Unsigned32, AccessType::ReadWrite),
        )
        .unwrap();
        od
    }

    #[test]
    fn add_and_read_back() {
        let mut od = dictionary_with_var();
        od.set_value(0x2000, Value::Unsigned32(42)).unwrap();
        assert_eq!(od.get_value(0x2000).unwrap(), Value::Unsigned32(42));
        assert_eq!(od.get_raw(0x2000, 0).unwrap(), vec![42, 0, 0, 0]);
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut od = dictionary_with_var();
        assert_eq!(
            od.add_entry(
                0x2000,
                EntrySpec::var("Value", DataType::Unsigned8, AccessType::ReadWrite)
            ),
            Err(EdsError::ObjectAlreadyExists { index: 0x2000 })
        );
    }

    #[test]
    fn name_lookup_is_multi_valued() {
        let mut od = dictionary_with_var();
        od.add_entry(
            0x2001,
            EntrySpec::var("Value", DataType::Unsigned8, AccessType::ReadWrite),
        )
        .unwrap();
        od.add_entry(
            0x2002,
            EntrySpec::var("Other", DataType::Unsigned8, AccessType::ReadWrite),
        )
        .unwrap();
        let found: Vec<u16> = od.find_entries("Value").iter().map(|e| e.index).collect();
        assert_eq!(found, vec![0x2000, 0x2001]);

        od.remove_entry(0x2000).unwrap();
        let found: Vec<u16> = od.find_entries("Value").iter().map(|e| e.index).collect();
        assert_eq!(found, vec![0x2001]);
        assert_eq!(od.get_entry_named("Value").unwrap().index, 0x2001);
    }

    #[test]
    fn read_only_writes_fail() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x1000,
            EntrySpec::var("Device type", DataType::Unsigned32, AccessType::ReadOnly),
        )
        .unwrap();
        assert_eq!(
            od.set_value(0x1000, Value::Unsigned32(1)),
            Err(EdsError::AccessViolation {
                index: 0x1000,
                sub_index: 0
            })
        );
        // module path is not access checked
        od.set_raw_value(0x1000, 0, Value::Unsigned32(1)).unwrap();
        assert_eq!(od.get_value(0x1000).unwrap(), Value::Unsigned32(1));
    }

    #[test]
    fn update_notifications_fire_on_change_only() {
        let mut od = dictionary_with_var();
        od.take_notifications();
        od.set_value(0x2000, Value::Unsigned32(7)).unwrap();
        od.set_value(0x2000, Value::Unsigned32(7)).unwrap();
        let notes = od.take_notifications();
        assert_eq!(
            notes,
            vec![OdNotification::Updated {
                index: 0x2000,
                sub_index: 0,
                value: Value::Unsigned32(7)
            }]
        );
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let mut od = dictionary_with_var();
        od.subscribe(0x2000, "pdo").unwrap();
        assert_eq!(
            od.subscribe(0x2000, "pdo"),
            Err(EdsError::DuplicateSubscription {
                index: 0x2000,
                key: "pdo".to_string()
            })
        );
        od.unsubscribe(0x2000, "pdo");
        od.subscribe(0x2000, "pdo").unwrap();
        assert!(od.is_subscribed(0x2000));
    }

    #[test]
    fn sdo_access_honors_access_type() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntrySpec::var("ro", DataType::Unsigned8, AccessType::ReadOnly),
        )
        .unwrap();
        od.add_entry(
            0x2001,
            EntrySpec::var("wo", DataType::Unsigned8, AccessType::WriteOnly),
        )
        .unwrap();
        assert_eq!(
            od.sdo_write(0x2000, 0, &[1]),
            Err(SdoAbortCode::WriteReadOnlyError)
        );
        assert_eq!(od.sdo_read(0x2001, 0), Err(SdoAbortCode::ReadWriteOnlyError));
        assert_eq!(
            od.sdo_read(0x3000, 0),
            Err(SdoAbortCode::ObjectDoesNotExist)
        );
        assert_eq!(
            od.sdo_read(0x2000, 9),
            Err(SdoAbortCode::SubindexDoesNotExist)
        );
    }

    #[test]
    fn sdo_write_checks_length_and_limits() {
        let mut od = ObjectDictionary::new();
        od.add_entry(
            0x2000,
            EntrySpec::var("limited", DataType::Unsigned16, AccessType::ReadWrite)
                .with_limits(Some(Value::Unsigned16(10)), Some(Value::Unsigned16(100))),
        )
        .unwrap();
        assert_eq!(
            od.sdo_write(0x2000, 0, &[1, 2, 3]),
            Err(SdoAbortCode::WrongLength)
        );
        assert_eq!(od.sdo_write(0x2000, 0, &[5, 0]), Err(SdoAbortCode::ValueTooLow));
        assert_eq!(
            od.sdo_write(0x2000, 0, &[0xFF, 0xFF]),
            Err(SdoAbortCode::ValueTooHigh)
        );
        od.sdo_write(0x2000, 0, &[50, 0]).unwrap();
        assert_eq!(od.get_value(0x2000).unwrap(), Value::Unsigned16(50));
    }

    #[test]
    fn composite_sub_index_zero_is_protected() {
        let mut od = ObjectDictionary::new();
        od.add_entry(0x2100, EntrySpec::composite("rec", ObjectType::Record))
            .unwrap();
        od.add_sub_entry(
            0x2100,
            1,
            EntrySpec::var("cell", DataType::Unsigned8, AccessType::ReadWrite),
        )
        .unwrap();
        assert_eq!(
            od.sdo_write(0x2100, 0, &[9]),
            Err(SdoAbortCode::WriteReadOnlyError)
        );
        assert_eq!(od.sdo_read(0x2100, 0).unwrap(), vec![1]);
        assert_eq!(
            od.remove_sub_entry(0x2100, 0),
            Err(EdsError::SubIndexZeroImmutable { index: 0x2100 })
        );
    }
}
