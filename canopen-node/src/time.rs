//! TIME stamp producer and consumer.
//!
//! The 6 byte TIME_OF_DAY payload travels on the COB-ID configured at
//! 0x1012; bit 30 enables production, bit 31 consumption.

use chrono::{DateTime, Utc};
use log::warn;

use crate::data_type::{DataType, Value};
use crate::error::EdsError;
use crate::frame::{time_frame, CanFrame};
use crate::node::{Bus, DeviceEvent};
use crate::od::ObjectDictionary;

pub struct TimeStamp {
    started: bool,
}

impl TimeStamp {
    pub fn new() -> TimeStamp {
        TimeStamp { started: false }
    }

    pub(crate) fn start(&mut self) {
        self.started = true;
    }

    pub(crate) fn stop(&mut self) {
        self.started = false;
    }

    /// Broadcast a time stamp; requires the produce flag in 0x1012.
    pub(crate) fn write(
        &mut self,
        od: &ObjectDictionary,
        bus: &mut Bus,
        date: DateTime<Utc>,
    ) -> Result<(), EdsError> {
        if !od.time_produce() {
            return Err(EdsError::NotConfigured("TIME production (bit 30 of 0x1012)"));
        }
        let cob_id = od
            .time_cob_id()
            .ok_or(EdsError::NotConfigured("TIME COB-ID at 0x1012"))?;
        let stamp = Value::TimeOfDay(date)
            .encode()
            .map_err(|_| EdsError::ValueMismatch {
                index: 0x1012,
                sub_index: 0,
            })?;
        let frame = time_frame(cob_id, &stamp)?;
        bus.send(frame);
        Ok(())
    }

    pub(crate) fn handle_frame(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &mut Bus) {
        if !self.started || frame.is_rtr() || !od.time_consume() {
            return;
        }
        if od.time_cob_id() != Some(frame.id()) {
            return;
        }
        match Value::decode(frame.data(), DataType::TimeOfDay) {
            Ok(Value::TimeOfDay(date)) => bus.event(DeviceEvent::Time { date }),
            _ => warn!("time: malformed stamp on 0x{:03X}", frame.id()),
        }
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        TimeStamp::new()
    }
}
