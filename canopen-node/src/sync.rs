//! SYNC producer and consumer.
//!
//! The producer broadcasts on the COB-ID of 0x1005 (bit 30 set =
//! generate) every 0x1006 microseconds. With a counter overflow of
//! N >= 2 at 0x1019 the frame carries one counter byte cycling
//! 1..=N, otherwise the payload is empty.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::EdsError;
use crate::frame::{sync_frame, CanFrame};
use crate::node::{Bus, DeviceEvent};
use crate::od::ObjectDictionary;

pub struct Sync {
    started: bool,
    counter: u8,
    next_emit: Option<Instant>,
}

impl Sync {
    pub fn new() -> Sync {
        Sync {
            started: false,
            counter: 1,
            next_emit: None,
        }
    }

    pub(crate) fn start(&mut self, od: &ObjectDictionary, now: Instant) {
        self.started = true;
        self.counter = 1;
        self.reschedule(od, now);
    }

    pub(crate) fn stop(&mut self) {
        self.started = false;
        self.next_emit = None;
    }

    fn reschedule(&mut self, od: &ObjectDictionary, now: Instant) {
        let period_us = od.sync_cycle_period();
        if self.started && od.sync_generate() && period_us > 0 {
            self.next_emit = Some(now + Duration::from_micros(period_us as u64));
        } else {
            self.next_emit = None;
        }
    }

    pub(crate) fn on_od_update(&mut self, index: u16, od: &ObjectDictionary, now: Instant) {
        if matches!(index, 0x1005 | 0x1006 | 0x1019) {
            self.reschedule(od, now);
        }
    }

    /// Emit one SYNC immediately; requires the generate flag in 0x1005.
    pub(crate) fn write(
        &mut self,
        od: &ObjectDictionary,
        bus: &mut Bus,
    ) -> Result<(), EdsError> {
        if !od.sync_generate() {
            return Err(EdsError::NotConfigured("SYNC generation (bit 30 of 0x1005)"));
        }
        self.emit(od, bus);
        Ok(())
    }

    fn emit(&mut self, od: &ObjectDictionary, bus: &mut Bus) {
        let cob_id = match od.sync_cob_id() {
            Some(cob_id) => cob_id,
            None => {
                warn!("sync: no COB-ID configured at 0x1005");
                return;
            }
        };
        let overflow = od.sync_overflow();
        let counter = if overflow >= 2 {
            let value = self.counter;
            self.counter = if value >= overflow { 1 } else { value + 1 };
            Some(value)
        } else {
            None
        };
        match sync_frame(cob_id, counter) {
            Ok(frame) => {
                debug!("sync: emit counter {:?}", counter);
                bus.send(frame);
            }
            Err(error) => warn!("sync: cannot build frame: {}", error),
        }
    }

    pub(crate) fn poll(&mut self, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        if let Some(next) = self.next_emit {
            if next <= now {
                self.emit(od, bus);
                let period_us = od.sync_cycle_period();
                if period_us > 0 {
                    self.next_emit = Some(next + Duration::from_micros(period_us as u64));
                } else {
                    self.next_emit = None;
                }
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.next_emit
    }

    /// A SYNC frame arrived. Returns the carried counter when the
    /// frame was consumed so the device can drive the PDO engine's
    /// synchronous transmission types.
    pub(crate) fn handle_frame(&mut self, frame: &CanFrame, bus: &mut Bus) -> Option<Option<u8>> {
        if !self.started || frame.is_rtr() {
            return None;
        }
        let count = frame.data().first().copied();
        bus.event(DeviceEvent::Sync { count });
        Some(count)
    }
}

impl Default for Sync {
    fn default() -> Self {
        Sync::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generating_od(overflow: u8) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.set_sync_cob_id(0x080, true);
        od.set_sync_cycle_period(1_000); // 1 ms
        od.set_sync_overflow(overflow).unwrap();
        od
    }

    #[test]
    fn write_needs_the_generate_flag() {
        let mut od = ObjectDictionary::new();
        od.set_sync_cob_id(0x080, false);
        let mut sync = Sync::new();
        let mut bus = Bus::new();
        assert!(matches!(
            sync.write(&od, &mut bus),
            Err(EdsError::NotConfigured(_))
        ));
    }

    #[test]
    fn counter_cycles_one_to_overflow() {
        let od = generating_od(3);
        let mut sync = Sync::new();
        let mut bus = Bus::new();
        for _ in 0..7 {
            sync.write(&od, &mut bus).unwrap();
        }
        let payloads: Vec<u8> = bus
            .take_frames()
            .iter()
            .map(|frame| frame.data()[0])
            .collect();
        assert_eq!(payloads, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn empty_payload_without_overflow() {
        let od = generating_od(0);
        let mut sync = Sync::new();
        let mut bus = Bus::new();
        sync.write(&od, &mut bus).unwrap();
        assert_eq!(bus.take_frames()[0].data(), &[] as &[u8]);
    }

    #[test]
    fn producer_period() {
        let od = generating_od(0);
        let mut sync = Sync::new();
        let mut bus = Bus::new();
        let t0 = Instant::now();
        sync.start(&od, t0);
        sync.poll(&od, &mut bus, t0 + Duration::from_micros(500));
        assert!(bus.take_frames().is_empty());
        sync.poll(&od, &mut bus, t0 + Duration::from_micros(1_100));
        assert_eq!(bus.take_frames().len(), 1);
    }
}
