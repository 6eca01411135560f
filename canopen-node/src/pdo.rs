//! PDO engine
//!
//! A PDO broadcasts up to 8 bytes whose layout a mapping parameter
//! record defines: each mapped object contributes `bit_length` bits,
//! packed little endian starting at bit 0 of byte 0. Communication
//! records (0x1400+n receive, 0x1800+n transmit) select COB-ID,
//! transmission type, inhibit time, event timer and SYNC start value.
//!
//! The engine listens to dictionary changes of those records and
//! reconfigures itself live; registering through the dictionary helpers
//! or writing the records directly is equivalent.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::data_type::Value;
use crate::frame::CanFrame;
use crate::node::{Bus, DeviceEvent};
use crate::od::{ObjectDictionary, PdoCommParams};

/// One mapped slice: `(index << 16) | (sub << 8) | bit_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapEntry {
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
}

impl PdoMapEntry {
    pub fn from_word(word: u32) -> PdoMapEntry {
        PdoMapEntry {
            index: (word >> 16) as u16,
            sub_index: (word >> 8) as u8,
            bit_length: word as u8,
        }
    }

    pub fn to_word(&self) -> u32 {
        (self.index as u32) << 16 | (self.sub_index as u32) << 8 | self.bit_length as u32
    }
}

/// Pack the mapped values into a payload, little endian bit order.
pub fn pack(od: &ObjectDictionary, mapping: &[PdoMapEntry]) -> Option<Vec<u8>> {
    let total_bits: u32 = mapping.iter().map(|m| m.bit_length as u32).sum();
    if total_bits > 64 {
        return None;
    }
    let mut accumulator: u128 = 0;
    let mut offset = 0_u32;
    for entry in mapping {
        let raw = od.get_raw(entry.index, entry.sub_index).ok()?;
        let mut bytes = [0_u8; 16];
        let take = raw.len().min(8);
        bytes[..take].clone_from_slice(&raw[..take]);
        let value = u128::from_le_bytes(bytes);
        let mask = if entry.bit_length >= 64 {
            u64::MAX as u128
        } else {
            (1_u128 << entry.bit_length) - 1
        };
        accumulator |= (value & mask) << offset;
        offset += entry.bit_length as u32;
    }
    let length = ((total_bits + 7) / 8) as usize;
    Some(accumulator.to_le_bytes()[..length].to_vec())
}

/// Unpack a payload into the dictionary; returns the touched cells.
pub fn unpack(
    od: &mut ObjectDictionary,
    mapping: &[PdoMapEntry],
    payload: &[u8],
) -> Vec<(u16, u8)> {
    let mut bytes = [0_u8; 16];
    let take = payload.len().min(8);
    bytes[..take].clone_from_slice(&payload[..take]);
    let accumulator = u128::from_le_bytes(bytes);
    let mut offset = 0_u32;
    let mut updated = Vec::new();
    for entry in mapping {
        let mask = if entry.bit_length >= 64 {
            u64::MAX as u128
        } else {
            (1_u128 << entry.bit_length) - 1
        };
        let bits = (accumulator >> offset) & mask;
        offset += entry.bit_length as u32;
        let data_type = match od
            .get_entry(entry.index)
            .and_then(|e| e.sub_entry(entry.sub_index))
            .map(|cell| cell.data_type)
        {
            Some(data_type) => data_type,
            None => continue,
        };
        let size = match data_type.size() {
            Some(size) => size,
            None => {
                warn!(
                    "pdo: mapped object 0x{:04X},0x{:02X} has no fixed size",
                    entry.index, entry.sub_index
                );
                continue;
            }
        };
        let raw = bits.to_le_bytes();
        match Value::decode(&raw[..size], data_type) {
            Ok(value) => {
                if od.set_raw_value(entry.index, entry.sub_index, value).is_ok() {
                    updated.push((entry.index, entry.sub_index));
                }
            }
            Err(error) => warn!(
                "pdo: cannot store 0x{:04X},0x{:02X}: {}",
                entry.index, entry.sub_index, error
            ),
        }
    }
    updated
}

struct TransmitPdo {
    comm_index: u16,
    params: PdoCommParams,
    mapping: Vec<PdoMapEntry>,
    last_transmission: Option<Instant>,
    event_deadline: Option<Instant>,
    inhibit_release: Option<Instant>,
    pending_change: bool,
    sync_counter: u32,
    sync_armed: bool,
    snapshot: Option<Vec<u8>>,
}

impl TransmitPdo {
    fn inhibit(&self) -> Duration {
        // inhibit time unit is 100 microseconds
        Duration::from_micros(self.params.inhibit_time_100us as u64 * 100)
    }

    fn inhibited_until(&self) -> Option<Instant> {
        if self.params.inhibit_time_100us == 0 {
            return None;
        }
        self.last_transmission.map(|last| last + self.inhibit())
    }
}

struct ReceivePdo {
    comm_index: u16,
    params: PdoCommParams,
    mapping: Vec<PdoMapEntry>,
}

/// The PDO engine of one device.
pub struct PdoEngine {
    tpdos: Vec<TransmitPdo>,
    rpdos: Vec<ReceivePdo>,
    started: bool,
}

impl PdoEngine {
    pub fn new() -> PdoEngine {
        PdoEngine {
            tpdos: Vec::new(),
            rpdos: Vec::new(),
            started: false,
        }
    }

    pub(crate) fn start(&mut self, od: &ObjectDictionary, now: Instant) {
        self.started = true;
        self.reconfigure(od);
        for tpdo in &mut self.tpdos {
            arm_event_timer(tpdo, now);
        }
    }

    pub(crate) fn stop(&mut self) {
        self.started = false;
        for tpdo in &mut self.tpdos {
            tpdo.event_deadline = None;
            tpdo.inhibit_release = None;
            tpdo.pending_change = false;
        }
    }

    /// Rebuild the PDO set from the communication and mapping records,
    /// keeping runtime state of records that stay in place.
    pub(crate) fn reconfigure(&mut self, od: &ObjectDictionary) {
        let mut tpdos: Vec<TransmitPdo> = Vec::new();
        for comm_index in 0x1800..=0x19FF_u16 {
            let params = match od.pdo_comm_params(comm_index) {
                Some(params) => params,
                None => continue,
            };
            if tpdos.iter().any(|t| t.params.cob_id == params.cob_id) {
                warn!(
                    "pdo: COB-ID 0x{:03X} already backs a transmit PDO, record 0x{:04X} ignored",
                    params.cob_id, comm_index
                );
                continue;
            }
            let mapping: Vec<PdoMapEntry> = od
                .pdo_mapping_words(comm_index + 0x200)
                .into_iter()
                .map(PdoMapEntry::from_word)
                .collect();
            let mut tpdo = TransmitPdo {
                comm_index,
                params,
                mapping,
                last_transmission: None,
                event_deadline: None,
                inhibit_release: None,
                pending_change: false,
                sync_counter: 0,
                sync_armed: false,
                snapshot: None,
            };
            if let Some(old) = self.tpdos.iter().find(|t| t.comm_index == comm_index) {
                tpdo.last_transmission = old.last_transmission;
                tpdo.event_deadline = old.event_deadline;
                tpdo.inhibit_release = old.inhibit_release;
                tpdo.pending_change = old.pending_change;
                tpdo.sync_counter = old.sync_counter;
                tpdo.sync_armed = old.sync_armed;
                tpdo.snapshot = old.snapshot.clone();
            }
            tpdos.push(tpdo);
        }
        let mut rpdos: Vec<ReceivePdo> = Vec::new();
        for comm_index in 0x1400..=0x15FF_u16 {
            let params = match od.pdo_comm_params(comm_index) {
                Some(params) => params,
                None => continue,
            };
            if rpdos.iter().any(|r| r.params.cob_id == params.cob_id) {
                warn!(
                    "pdo: COB-ID 0x{:03X} already backs a receive PDO, record 0x{:04X} ignored",
                    params.cob_id, comm_index
                );
                continue;
            }
            let mapping = od
                .pdo_mapping_words(comm_index + 0x200)
                .into_iter()
                .map(PdoMapEntry::from_word)
                .collect();
            rpdos.push(ReceivePdo {
                comm_index,
                params,
                mapping,
            });
        }
        self.tpdos = tpdos;
        self.rpdos = rpdos;
    }

    /// A dictionary cell changed: reconfigure when it is one of our
    /// records, otherwise check for event driven transmissions.
    pub(crate) fn on_od_update(
        &mut self,
        index: u16,
        sub_index: u8,
        od: &ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let is_pdo_record = (0x1400..=0x17FF).contains(&index) || (0x1800..=0x1BFF).contains(&index);
        if is_pdo_record {
            self.reconfigure(od);
            return;
        }
        if !self.started {
            return;
        }
        for slot in 0..self.tpdos.len() {
            let tpdo = &self.tpdos[slot];
            if !tpdo.params.valid
                || !tpdo
                    .mapping
                    .iter()
                    .any(|m| m.index == index && m.sub_index == sub_index)
            {
                continue;
            }
            match tpdo.params.transmission_type {
                // acyclic synchronous: remembered until the next SYNC
                0 => self.tpdos[slot].pending_change = true,
                254 | 255 => self.event_transmit(slot, od, bus, now),
                _ => {}
            }
        }
    }

    /// SYNC consumer hook driving the synchronous transmission types.
    pub(crate) fn on_sync(
        &mut self,
        count: Option<u8>,
        od: &ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        if !self.started {
            return;
        }
        for slot in 0..self.tpdos.len() {
            let tpdo = &mut self.tpdos[slot];
            if !tpdo.params.valid {
                continue;
            }
            match tpdo.params.transmission_type {
                0 => {
                    if tpdo.pending_change {
                        tpdo.pending_change = false;
                        self.transmit(slot, od, bus, now);
                    }
                }
                divisor @ 1..=240 => {
                    if !tpdo.sync_armed {
                        let start = tpdo.params.sync_start;
                        if start == 0 || count == Some(start) {
                            tpdo.sync_armed = true;
                            tpdo.sync_counter = 0;
                        } else {
                            continue;
                        }
                    }
                    tpdo.sync_counter += 1;
                    if tpdo.sync_counter >= divisor as u32 {
                        tpdo.sync_counter = 0;
                        self.transmit(slot, od, bus, now);
                    }
                }
                // RTR only synchronous: sample on SYNC, send on request
                252 => {
                    self.tpdos[slot].snapshot = pack(od, &self.tpdos[slot].mapping);
                }
                _ => {}
            }
        }
    }

    /// Inbound PDO traffic: remote requests for transmit PDOs and data
    /// frames for receive PDOs.
    pub(crate) fn handle_frame(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        if !self.started {
            return;
        }
        if frame.is_rtr() {
            for slot in 0..self.tpdos.len() {
                let tpdo = &self.tpdos[slot];
                if tpdo.params.cob_id != frame.id() || !tpdo.params.valid {
                    continue;
                }
                match tpdo.params.transmission_type {
                    252 => {
                        if let Some(snapshot) = self.tpdos[slot].snapshot.clone() {
                            self.send_payload(slot, snapshot, bus, now);
                        }
                    }
                    253 => self.transmit(slot, od, bus, now),
                    _ => {}
                }
            }
            return;
        }
        for slot in 0..self.rpdos.len() {
            let rpdo = &self.rpdos[slot];
            if rpdo.params.cob_id != frame.id() || !rpdo.params.valid {
                continue;
            }
            let mapping = rpdo.mapping.clone();
            let cob_id = rpdo.params.cob_id;
            debug!("pdo: reception on 0x{:03X} ({} objects)", cob_id, mapping.len());
            let updated = unpack(od, &mapping, frame.data());
            bus.event(DeviceEvent::Pdo {
                cob_id,
                entries: updated,
            });
        }
    }

    pub(crate) fn poll(&mut self, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        if !self.started {
            return;
        }
        for slot in 0..self.tpdos.len() {
            let event_due = self.tpdos[slot]
                .event_deadline
                .map(|deadline| deadline <= now)
                .unwrap_or(false);
            if event_due {
                self.event_transmit(slot, od, bus, now);
            }
            let release_due = self.tpdos[slot]
                .inhibit_release
                .map(|release| release <= now)
                .unwrap_or(false);
            if release_due && self.tpdos[slot].pending_change {
                self.tpdos[slot].pending_change = false;
                self.tpdos[slot].inhibit_release = None;
                self.transmit(slot, od, bus, now);
            } else if release_due {
                self.tpdos[slot].inhibit_release = None;
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.tpdos
            .iter()
            .flat_map(|tpdo| [tpdo.event_deadline, tpdo.inhibit_release])
            .flatten()
            .min()
    }

    /// Event driven transmission honoring the inhibit time: when the
    /// window is still closed the change is held back and flushed by
    /// `poll` as soon as the window opens.
    fn event_transmit(&mut self, slot: usize, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        if let Some(release) = self.tpdos[slot].inhibited_until() {
            if release > now {
                self.tpdos[slot].pending_change = true;
                self.tpdos[slot].inhibit_release = Some(release);
                return;
            }
        }
        self.tpdos[slot].pending_change = false;
        self.transmit(slot, od, bus, now);
    }

    fn transmit(&mut self, slot: usize, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        let payload = match pack(od, &self.tpdos[slot].mapping) {
            Some(payload) => payload,
            None => {
                warn!(
                    "pdo: record 0x{:04X} has an unpackable mapping",
                    self.tpdos[slot].comm_index
                );
                return;
            }
        };
        self.send_payload(slot, payload, bus, now);
    }

    fn send_payload(&mut self, slot: usize, payload: Vec<u8>, bus: &mut Bus, now: Instant) {
        let tpdo = &mut self.tpdos[slot];
        match CanFrame::new(tpdo.params.cob_id, &payload, false) {
            Ok(frame) => {
                bus.send(frame);
                tpdo.last_transmission = Some(now);
                arm_event_timer(tpdo, now);
            }
            Err(error) => warn!("pdo: cannot build frame: {}", error),
        }
    }
}

impl Default for PdoEngine {
    fn default() -> Self {
        PdoEngine::new()
    }
}

/// The event timer restarts on every transmission.
fn arm_event_timer(tpdo: &mut TransmitPdo, now: Instant) {
    let event_driven = matches!(tpdo.params.transmission_type, 254 | 255);
    if event_driven && tpdo.params.valid && tpdo.params.event_timer_ms > 0 {
        tpdo.event_deadline = Some(now + Duration::from_millis(tpdo.params.event_timer_ms as u64));
    } else {
        tpdo.event_deadline = None;
    }
}
