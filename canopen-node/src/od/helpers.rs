//! Helpers for the well-known communication profile area
//! (0x1000..=0x1BFF).
//!
//! Each setter lazily creates its entry with the fixed schema of
//! CiA-301, so a device works from an empty dictionary. The getters
//! return `None`/empty when the entry was never configured.

use log::debug;

use super::entry::{AccessType, EntrySpec, ObjectType};
use super::ObjectDictionary;
use crate::data_type::{DataType, Value};
use crate::error::EdsError;

/// `+nodeId` marker in stored SDO COB-ID values: the low 7 bits are
/// OR-ed with the peer's node id before use.
pub const COB_ID_ADD_NODE_ID: u32 = 1 << 30;
/// A set bit 31 marks a stored COB-ID as invalid.
pub const COB_ID_INVALID: u32 = 1 << 31;

/// Bits of the error register at 0x1001.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorRegisterBit {
    Generic = 0x01,
    Current = 0x02,
    Voltage = 0x04,
    Temperature = 0x08,
    Communication = 0x10,
    Device = 0x20,
    Reserved = 0x40,
    Manufacturer = 0x80,
}

/// The identity record at 0x1018.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,
}

/// An SDO server channel resolved against the own node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoServerChannel {
    /// COB-ID the server listens on (client to server).
    pub rx: u16,
    /// COB-ID the server answers on (server to client).
    pub tx: u16,
}

/// An SDO client channel resolved against the addressed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoClientChannel {
    /// COB-ID the client transmits on (client to server).
    pub tx: u16,
    /// COB-ID the client listens on (server to client).
    pub rx: u16,
    pub server_id: u8,
}

/// Decoded PDO communication parameter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoCommParams {
    pub cob_id: u16,
    pub valid: bool,
    pub rtr_allowed: bool,
    pub transmission_type: u8,
    pub inhibit_time_100us: u16,
    pub event_timer_ms: u16,
    pub sync_start: u8,
}

fn resolve_cob(raw: u32, node_id: u8) -> Option<u16> {
    if raw & COB_ID_INVALID != 0 {
        return None;
    }
    let mut cob = (raw & 0x7FF) as u16;
    if raw & COB_ID_ADD_NODE_ID != 0 {
        cob |= node_id as u16;
    }
    if cob == 0 {
        None
    } else {
        Some(cob)
    }
}

impl ObjectDictionary {
    fn ensure_var(
        &mut self,
        index: u16,
        name: &str,
        data_type: DataType,
        access_type: AccessType,
    ) {
        if !self.contains(index) {
            // freshly created, the spec is valid by construction
            let _ = self.add_entry(index, EntrySpec::var(name, data_type, access_type));
        }
    }

    fn ensure_composite(&mut self, index: u16, name: &str, object_type: ObjectType) {
        if !self.contains(index) {
            let _ = self.add_entry(index, EntrySpec::composite(name, object_type));
        }
    }

    fn u32_at(&self, index: u16, sub_index: u8) -> Option<u32> {
        self.raw_value(index, sub_index).and_then(|v| v.as_u32())
    }

    fn u16_at(&self, index: u16, sub_index: u8) -> Option<u16> {
        self.raw_value(index, sub_index).and_then(|v| v.as_u16())
    }

    fn u8_at(&self, index: u16, sub_index: u8) -> Option<u8> {
        self.raw_value(index, sub_index).and_then(|v| v.as_u8())
    }

    // --- 0x1000 device type -------------------------------------------------

    pub fn set_device_type(&mut self, device_type: u32) {
        self.ensure_var(0x1000, "Device type", DataType::Unsigned32, AccessType::ReadOnly);
        let _ = self.set_raw_value(0x1000, 0, Value::Unsigned32(device_type));
    }

    pub fn device_type(&self) -> Option<u32> {
        self.u32_at(0x1000, 0)
    }

    // --- 0x1001 error register ----------------------------------------------

    pub fn set_error_register(&mut self, register: u8) {
        self.ensure_var(0x1001, "Error register", DataType::Unsigned8, AccessType::ReadOnly);
        let _ = self.set_raw_value(0x1001, 0, Value::Unsigned8(register));
    }

    pub fn set_error_bit(&mut self, bit: ErrorRegisterBit, on: bool) {
        let mut register = self.error_register();
        if on {
            register |= bit as u8;
        } else {
            register &= !(bit as u8);
        }
        self.set_error_register(register);
    }

    pub fn error_register(&self) -> u8 {
        self.u8_at(0x1001, 0).unwrap_or(0)
    }

    // --- 0x1002 status register ---------------------------------------------

    pub fn set_status_register(&mut self, status: u32) {
        self.ensure_var(
            0x1002,
            "Manufacturer status register",
            DataType::Unsigned32,
            AccessType::ReadOnly,
        );
        let _ = self.set_raw_value(0x1002, 0, Value::Unsigned32(status));
    }

    pub fn status_register(&self) -> Option<u32> {
        self.u32_at(0x1002, 0)
    }

    // --- 0x1003 pre-defined error field -------------------------------------

    /// Create the error history with room for `length` entries. Sub 0
    /// tracks the number of valid entries, not the capacity.
    pub fn configure_error_history(&mut self, length: u8) -> Result<(), EdsError> {
        if length == 0 {
            return Err(EdsError::InvalidEntry {
                index: 0x1003,
                reason: "error history needs at least one slot",
            });
        }
        self.ensure_composite(0x1003, "Pre-defined error field", ObjectType::Array);
        for sub in 1..=length {
            if self.raw_value(0x1003, sub).is_none() {
                self.add_sub_entry(
                    0x1003,
                    sub,
                    EntrySpec::var("Standard error field", DataType::Unsigned32, AccessType::ReadOnly),
                )?;
            }
        }
        if let Some(entry) = self.entry_mut(0x1003) {
            entry.set_count(0);
        }
        Ok(())
    }

    /// Ring-push a new error code to the front of the history.
    pub fn push_error_history(&mut self, code: u16, additional: u16) {
        let capacity = match self.get_entry(0x1003) {
            Some(entry) => entry.sub_indices().len().saturating_sub(1) as u8,
            None => return,
        };
        if capacity == 0 {
            return;
        }
        let count = self.error_history_count().min(capacity);
        // shift older entries towards higher sub-indices
        for sub in (1..=count.min(capacity - 1)).rev() {
            if let Some(value) = self.u32_at(0x1003, sub) {
                let _ = self.set_raw_value(0x1003, sub + 1, Value::Unsigned32(value));
            }
        }
        let word = (additional as u32) << 16 | code as u32;
        let _ = self.set_raw_value(0x1003, 1, Value::Unsigned32(word));
        let new_count = (count + 1).min(capacity);
        if let Some(entry) = self.entry_mut(0x1003) {
            entry.set_count(new_count);
        }
        debug!("od: error history push 0x{:04X} ({} valid)", code, new_count);
    }

    pub fn error_history_count(&self) -> u8 {
        self.u8_at(0x1003, 0).unwrap_or(0)
    }

    /// Valid history entries, newest first.
    pub fn error_history(&self) -> Vec<u32> {
        let count = self.error_history_count();
        (1..=count)
            .filter_map(|sub| self.u32_at(0x1003, sub))
            .collect()
    }

    pub fn clear_error_history(&mut self) {
        let capacity = match self.get_entry(0x1003) {
            Some(entry) => entry.sub_indices().len().saturating_sub(1) as u8,
            None => return,
        };
        for sub in 1..=capacity {
            let _ = self.set_raw_value(0x1003, sub, Value::Unsigned32(0));
        }
        if let Some(entry) = self.entry_mut(0x1003) {
            entry.set_count(0);
        }
    }

    // --- 0x1005 / 0x1006 / 0x1019 SYNC --------------------------------------

    pub fn set_sync_cob_id(&mut self, cob_id: u16, generate: bool) {
        self.ensure_var(
            0x1005,
            "COB-ID SYNC message",
            DataType::Unsigned32,
            AccessType::ReadWrite,
        );
        let mut raw = cob_id as u32;
        if generate {
            raw |= COB_ID_ADD_NODE_ID; // bit 30 is the generate flag here
        }
        let _ = self.set_raw_value(0x1005, 0, Value::Unsigned32(raw));
    }

    pub fn sync_cob_id(&self) -> Option<u16> {
        let raw = self.u32_at(0x1005, 0)?;
        let cob = (raw & 0x7FF) as u16;
        if cob == 0 {
            None
        } else {
            Some(cob)
        }
    }

    pub fn sync_generate(&self) -> bool {
        self.u32_at(0x1005, 0)
            .map(|raw| raw & (1 << 30) != 0)
            .unwrap_or(false)
    }

    /// SYNC cycle period in microseconds; 0 disables the producer.
    pub fn set_sync_cycle_period(&mut self, period_us: u32) {
        self.ensure_var(
            0x1006,
            "Communication cycle period",
            DataType::Unsigned32,
            AccessType::ReadWrite,
        );
        let _ = self.set_raw_value(0x1006, 0, Value::Unsigned32(period_us));
    }

    pub fn sync_cycle_period(&self) -> u32 {
        self.u32_at(0x1006, 0).unwrap_or(0)
    }

    pub fn set_sync_overflow(&mut self, overflow: u8) -> Result<(), EdsError> {
        if overflow == 1 || overflow > 240 {
            return Err(EdsError::InvalidEntry {
                index: 0x1019,
                reason: "sync counter overflow must be 0 or 2..240",
            });
        }
        self.ensure_var(
            0x1019,
            "Synchronous counter overflow value",
            DataType::Unsigned8,
            AccessType::ReadWrite,
        );
        let _ = self.set_raw_value(0x1019, 0, Value::Unsigned8(overflow));
        Ok(())
    }

    pub fn sync_overflow(&self) -> u8 {
        self.u8_at(0x1019, 0).unwrap_or(0)
    }

    // --- 0x1008..0x100A version strings -------------------------------------

    pub fn set_device_name(&mut self, name: &str) {
        self.ensure_var(
            0x1008,
            "Manufacturer device name",
            DataType::VisibleString,
            AccessType::Const,
        );
        let _ = self.set_raw_value(0x1008, 0, Value::VisibleString(name.to_string()));
    }

    pub fn device_name(&self) -> Option<String> {
        match self.raw_value(0x1008, 0) {
            Some(Value::VisibleString(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn set_hardware_version(&mut self, version: &str) {
        self.ensure_var(
            0x1009,
            "Manufacturer hardware version",
            DataType::VisibleString,
            AccessType::Const,
        );
        let _ = self.set_raw_value(0x1009, 0, Value::VisibleString(version.to_string()));
    }

    pub fn hardware_version(&self) -> Option<String> {
        match self.raw_value(0x1009, 0) {
            Some(Value::VisibleString(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn set_software_version(&mut self, version: &str) {
        self.ensure_var(
            0x100A,
            "Manufacturer software version",
            DataType::VisibleString,
            AccessType::Const,
        );
        let _ = self.set_raw_value(0x100A, 0, Value::VisibleString(version.to_string()));
    }

    pub fn software_version(&self) -> Option<String> {
        match self.raw_value(0x100A, 0) {
            Some(Value::VisibleString(s)) => Some(s.clone()),
            _ => None,
        }
    }

    // --- 0x1012 TIME --------------------------------------------------------

    pub fn set_time_cob_id(&mut self, cob_id: u16, produce: bool, consume: bool) {
        self.ensure_var(
            0x1012,
            "COB-ID time stamp object",
            DataType::Unsigned32,
            AccessType::ReadWrite,
        );
        let mut raw = cob_id as u32;
        if produce {
            raw |= 1 << 30;
        }
        if consume {
            raw |= 1 << 31;
        }
        let _ = self.set_raw_value(0x1012, 0, Value::Unsigned32(raw));
    }

    pub fn time_cob_id(&self) -> Option<u16> {
        let raw = self.u32_at(0x1012, 0)?;
        let cob = (raw & 0x7FF) as u16;
        if cob == 0 {
            None
        } else {
            Some(cob)
        }
    }

    pub fn time_produce(&self) -> bool {
        self.u32_at(0x1012, 0)
            .map(|raw| raw & (1 << 30) != 0)
            .unwrap_or(false)
    }

    pub fn time_consume(&self) -> bool {
        self.u32_at(0x1012, 0)
            .map(|raw| raw & (1 << 31) != 0)
            .unwrap_or(false)
    }

    // --- 0x1014 / 0x1015 EMCY producer --------------------------------------

    pub fn set_emcy_cob_id(&mut self, cob_id: u16) {
        self.ensure_var(0x1014, "COB-ID EMCY", DataType::Unsigned32, AccessType::ReadWrite);
        let _ = self.set_raw_value(0x1014, 0, Value::Unsigned32(cob_id as u32));
    }

    /// The EMCY COB-ID, `None` while unconfigured or marked invalid
    /// (bit 31 set).
    pub fn emcy_cob_id(&self) -> Option<u16> {
        let raw = self.u32_at(0x1014, 0)?;
        if raw & COB_ID_INVALID != 0 {
            return None;
        }
        let cob = (raw & 0x7FF) as u16;
        if cob == 0 {
            None
        } else {
            Some(cob)
        }
    }

    /// Inhibit time in multiples of 100 microseconds.
    pub fn set_emcy_inhibit_time(&mut self, inhibit_100us: u16) {
        self.ensure_var(
            0x1015,
            "Inhibit time EMCY",
            DataType::Unsigned16,
            AccessType::ReadWrite,
        );
        let _ = self.set_raw_value(0x1015, 0, Value::Unsigned16(inhibit_100us));
    }

    pub fn emcy_inhibit_time(&self) -> u16 {
        self.u16_at(0x1015, 0).unwrap_or(0)
    }

    // --- 0x1016 / 0x1017 heartbeat ------------------------------------------

    /// Watch the heartbeat of `node_id` with the given timeout.
    pub fn add_heartbeat_consumer(&mut self, node_id: u8, time_ms: u16) -> Result<(), EdsError> {
        if node_id == 0 || node_id > 0x7F {
            return Err(EdsError::InvalidNodeId { node_id });
        }
        self.ensure_composite(0x1016, "Consumer heartbeat time", ObjectType::Array);
        let word = (node_id as u32) << 16 | time_ms as u32;
        // reuse a disabled slot when there is one
        let entry = self
            .get_entry(0x1016)
            .ok_or(EdsError::ObjectDoesNotExist { index: 0x1016 })?;
        let mut target = None;
        for sub in entry.sub_indices() {
            if sub == 0 {
                continue;
            }
            if self.u32_at(0x1016, sub).unwrap_or(0) & 0xFFFF == 0 {
                target = Some(sub);
                break;
            }
        }
        match target {
            Some(sub) => {
                self.set_raw_value(0x1016, sub, Value::Unsigned32(word))?;
            }
            None => {
                let sub = self
                    .get_entry(0x1016)
                    .map(|e| e.highest_sub_index() + 1)
                    .unwrap_or(1);
                self.add_sub_entry(
                    0x1016,
                    sub,
                    EntrySpec::var("Consumer heartbeat time", DataType::Unsigned32, AccessType::ReadWrite),
                )?;
                self.set_raw_value(0x1016, sub, Value::Unsigned32(word))?;
            }
        }
        Ok(())
    }

    /// All `(node id, heartbeat time ms)` pairs with a non zero time.
    pub fn heartbeat_consumers(&self) -> Vec<(u8, u16)> {
        let entry = match self.get_entry(0x1016) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        entry
            .sub_indices()
            .into_iter()
            .filter(|sub| *sub != 0)
            .filter_map(|sub| self.u32_at(0x1016, sub))
            .filter_map(|word| {
                let node_id = ((word >> 16) & 0x7F) as u8;
                let time_ms = (word & 0xFFFF) as u16;
                if node_id != 0 && time_ms != 0 {
                    Some((node_id, time_ms))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Producer heartbeat period in milliseconds; 0 disables.
    pub fn set_heartbeat_producer_time(&mut self, time_ms: u16) {
        self.ensure_var(
            0x1017,
            "Producer heartbeat time",
            DataType::Unsigned16,
            AccessType::ReadWrite,
        );
        let _ = self.set_raw_value(0x1017, 0, Value::Unsigned16(time_ms));
    }

    pub fn heartbeat_producer_time(&self) -> u16 {
        self.u16_at(0x1017, 0).unwrap_or(0)
    }

    // --- 0x1018 identity -----------------------------------------------------

    pub fn set_identity(&mut self, identity: Identity) {
        self.ensure_composite(0x1018, "Identity object", ObjectType::Record);
        let fields = [
            (1_u8, "Vendor-ID", identity.vendor_id),
            (2, "Product code", identity.product_code),
            (3, "Revision number", identity.revision_number),
            (4, "Serial number", identity.serial_number),
        ];
        for (sub, name, value) in fields {
            if self.raw_value(0x1018, sub).is_none() {
                let _ = self.add_sub_entry(
                    0x1018,
                    sub,
                    EntrySpec::var(name, DataType::Unsigned32, AccessType::ReadOnly),
                );
            }
            let _ = self.set_raw_value(0x1018, sub, Value::Unsigned32(value));
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        Some(Identity {
            vendor_id: self.u32_at(0x1018, 1)?,
            product_code: self.u32_at(0x1018, 2)?,
            revision_number: self.u32_at(0x1018, 3)?,
            serial_number: self.u32_at(0x1018, 4)?,
        })
    }

    // --- 0x1028 EMCY consumer ------------------------------------------------

    pub fn add_emcy_consumer(&mut self, cob_id: u16) -> Result<(), EdsError> {
        self.ensure_composite(0x1028, "Emergency consumer object", ObjectType::Array);
        let sub = self
            .get_entry(0x1028)
            .map(|e| e.highest_sub_index() + 1)
            .unwrap_or(1);
        self.add_sub_entry(
            0x1028,
            sub,
            EntrySpec::var("Emergency consumer", DataType::Unsigned32, AccessType::ReadWrite),
        )?;
        self.set_raw_value(0x1028, sub, Value::Unsigned32(cob_id as u32))?;
        Ok(())
    }

    pub fn emcy_consumer_cob_ids(&self) -> Vec<u16> {
        let entry = match self.get_entry(0x1028) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        entry
            .sub_indices()
            .into_iter()
            .filter(|sub| *sub != 0)
            .filter_map(|sub| self.u32_at(0x1028, sub))
            .filter(|raw| raw & COB_ID_INVALID == 0 && raw & 0x7FF != 0)
            .map(|raw| (raw & 0x7FF) as u16)
            .collect()
    }

    // --- 0x1200..0x12FF SDO parameters --------------------------------------

    /// Create the server parameter record `0x1200 + channel`. The
    /// default channel 0 serves 0x600/0x580 + own node id.
    pub fn add_sdo_server_parameters(&mut self, channel: u8) -> Result<(), EdsError> {
        let index = 0x1200_u16 + channel as u16;
        if self.contains(index) {
            return Err(EdsError::ObjectAlreadyExists { index });
        }
        self.add_entry(
            index,
            EntrySpec::composite("SDO server parameter", ObjectType::Record),
        )?;
        self.add_sub_entry(
            index,
            1,
            EntrySpec::var(
                "COB-ID client to server",
                DataType::Unsigned32,
                AccessType::ReadWrite,
            ),
        )?;
        self.add_sub_entry(
            index,
            2,
            EntrySpec::var(
                "COB-ID server to client",
                DataType::Unsigned32,
                AccessType::ReadWrite,
            ),
        )?;
        self.set_raw_value(index, 1, Value::Unsigned32(0x600 | COB_ID_ADD_NODE_ID))?;
        self.set_raw_value(index, 2, Value::Unsigned32(0x580 | COB_ID_ADD_NODE_ID))?;
        Ok(())
    }

    /// All served SDO channels, the `+nodeId` convention resolved
    /// against the own node id.
    pub fn sdo_server_channels(&self, node_id: u8) -> Vec<SdoServerChannel> {
        let mut channels = Vec::new();
        for index in 0x1200..=0x127F_u16 {
            if !self.contains(index) {
                continue;
            }
            let rx = self.u32_at(index, 1).and_then(|raw| resolve_cob(raw, node_id));
            let tx = self.u32_at(index, 2).and_then(|raw| resolve_cob(raw, node_id));
            if let (Some(rx), Some(tx)) = (rx, tx) {
                channels.push(SdoServerChannel { rx, tx });
            }
        }
        channels
    }

    /// Create the client parameter record `0x1280 + channel` addressing
    /// `server_id`.
    pub fn add_sdo_client_parameters(&mut self, channel: u8, server_id: u8) -> Result<(), EdsError> {
        if server_id == 0 || server_id > 0x7F {
            return Err(EdsError::InvalidNodeId { node_id: server_id });
        }
        let index = 0x1280_u16 + channel as u16;
        if self.contains(index) {
            return Err(EdsError::ObjectAlreadyExists { index });
        }
        self.add_entry(
            index,
            EntrySpec::composite("SDO client parameter", ObjectType::Record),
        )?;
        self.add_sub_entry(
            index,
            1,
            EntrySpec::var(
                "COB-ID client to server",
                DataType::Unsigned32,
                AccessType::ReadWrite,
            ),
        )?;
        self.add_sub_entry(
            index,
            2,
            EntrySpec::var(
                "COB-ID server to client",
                DataType::Unsigned32,
                AccessType::ReadWrite,
            ),
        )?;
        self.add_sub_entry(
            index,
            3,
            EntrySpec::var(
                "Node-ID of the SDO server",
                DataType::Unsigned8,
                AccessType::ReadWrite,
            ),
        )?;
        self.set_raw_value(index, 1, Value::Unsigned32(0x600 | COB_ID_ADD_NODE_ID))?;
        self.set_raw_value(index, 2, Value::Unsigned32(0x580 | COB_ID_ADD_NODE_ID))?;
        self.set_raw_value(index, 3, Value::Unsigned8(server_id))?;
        Ok(())
    }

    /// The client channel configured for `server_id`, if any.
    pub fn sdo_client_channel(&self, server_id: u8) -> Option<SdoClientChannel> {
        for index in 0x1280..=0x12FF_u16 {
            if !self.contains(index) {
                continue;
            }
            if self.u8_at(index, 3) != Some(server_id) {
                continue;
            }
            let tx = self
                .u32_at(index, 1)
                .and_then(|raw| resolve_cob(raw, server_id));
            let rx = self
                .u32_at(index, 2)
                .and_then(|raw| resolve_cob(raw, server_id));
            if let (Some(tx), Some(rx)) = (tx, rx) {
                return Some(SdoClientChannel { tx, rx, server_id });
            }
        }
        None
    }

    // --- 0x1400..0x1BFF PDO records -----------------------------------------

    fn pdo_slot(&self, comm_base: u16) -> Option<u16> {
        (comm_base..comm_base + 0x200).find(|index| !self.contains(*index))
    }

    fn pdo_cob_in_use(&self, comm_base: u16, cob_id: u16) -> bool {
        (comm_base..comm_base + 0x200)
            .filter(|index| self.contains(*index))
            .filter_map(|index| self.u32_at(index, 1))
            .any(|raw| (raw & 0x7FF) as u16 == cob_id)
    }

    fn add_pdo_records(
        &mut self,
        comm_base: u16,
        map_base: u16,
        cob_id: u16,
        transmission_type: u8,
        inhibit_time_100us: u16,
        event_timer_ms: u16,
        sync_start: u8,
        mapped: &[(u16, u8, u8)],
    ) -> Result<u16, EdsError> {
        if cob_id > 0x7FF {
            return Err(EdsError::InvalidCobId {
                cob_id: cob_id as u32,
            });
        }
        if self.pdo_cob_in_use(comm_base, cob_id) {
            return Err(EdsError::DuplicatePdo { cob_id });
        }
        let total_bits: u32 = mapped.iter().map(|(_, _, bits)| *bits as u32).sum();
        if total_bits > 64 {
            return Err(EdsError::InvalidEntry {
                index: map_base,
                reason: "a PDO maps at most 64 bits",
            });
        }
        let comm_index = self.pdo_slot(comm_base).ok_or(EdsError::InvalidEntry {
            index: comm_base,
            reason: "no free PDO slot",
        })?;
        let map_index = map_base + (comm_index - comm_base);

        self.add_entry(
            comm_index,
            EntrySpec::composite("PDO communication parameter", ObjectType::Record),
        )?;
        let comm_cells: [(u8, &str, Value); 5] = [
            (1, "COB-ID", Value::Unsigned32(cob_id as u32)),
            (2, "Transmission type", Value::Unsigned8(transmission_type)),
            (3, "Inhibit time", Value::Unsigned16(inhibit_time_100us)),
            (5, "Event timer", Value::Unsigned16(event_timer_ms)),
            (6, "SYNC start value", Value::Unsigned8(sync_start)),
        ];
        for (sub, name, value) in comm_cells {
            self.add_sub_entry(
                comm_index,
                sub,
                EntrySpec::var(name, value.data_type(), AccessType::ReadWrite),
            )?;
            self.set_raw_value(comm_index, sub, value)?;
        }

        self.add_entry(
            map_index,
            EntrySpec::composite("PDO mapping parameter", ObjectType::Record),
        )?;
        for (slot, (index, sub_index, bits)) in mapped.iter().enumerate() {
            let word = (*index as u32) << 16 | (*sub_index as u32) << 8 | *bits as u32;
            let sub = slot as u8 + 1;
            self.add_sub_entry(
                map_index,
                sub,
                EntrySpec::var("Mapped object", DataType::Unsigned32, AccessType::ReadWrite),
            )?;
            self.set_raw_value(map_index, sub, Value::Unsigned32(word))?;
        }
        Ok(comm_index)
    }

    /// Create an RPDO (communication record at 0x1400+n, mapping at
    /// 0x1600+n). `mapped` lists `(index, sub index, bit length)`.
    pub fn add_receive_pdo(
        &mut self,
        cob_id: u16,
        transmission_type: u8,
        mapped: &[(u16, u8, u8)],
    ) -> Result<u16, EdsError> {
        self.add_pdo_records(0x1400, 0x1600, cob_id, transmission_type, 0, 0, 0, mapped)
    }

    /// Create a TPDO (communication record at 0x1800+n, mapping at
    /// 0x1A00+n).
    #[allow(clippy::too_many_arguments)]
    pub fn add_transmit_pdo(
        &mut self,
        cob_id: u16,
        transmission_type: u8,
        inhibit_time_100us: u16,
        event_timer_ms: u16,
        sync_start: u8,
        mapped: &[(u16, u8, u8)],
    ) -> Result<u16, EdsError> {
        self.add_pdo_records(
            0x1800,
            0x1A00,
            cob_id,
            transmission_type,
            inhibit_time_100us,
            event_timer_ms,
            sync_start,
            mapped,
        )
    }

    /// Decode a PDO communication record.
    pub fn pdo_comm_params(&self, comm_index: u16) -> Option<PdoCommParams> {
        let raw_cob = self.u32_at(comm_index, 1)?;
        Some(PdoCommParams {
            cob_id: (raw_cob & 0x7FF) as u16,
            valid: raw_cob & COB_ID_INVALID == 0 && raw_cob & 0x7FF != 0,
            rtr_allowed: raw_cob & (1 << 30) != 0,
            transmission_type: self.u8_at(comm_index, 2).unwrap_or(254),
            inhibit_time_100us: self.u16_at(comm_index, 3).unwrap_or(0),
            event_timer_ms: self.u16_at(comm_index, 5).unwrap_or(0),
            sync_start: self.u8_at(comm_index, 6).unwrap_or(0),
        })
    }

    /// The active mapping words of a mapping record, per its count
    /// cell.
    pub fn pdo_mapping_words(&self, map_index: u16) -> Vec<u32> {
        let count = self.u8_at(map_index, 0).unwrap_or(0);
        (1..=count)
            .filter_map(|sub| self.u32_at(map_index, sub))
            .collect()
    }
}
