//! Emergency object producer and consumer.
//!
//! The producer broadcasts `[error code LE16, error register, 5 info
//! bytes]` on the COB-ID configured at 0x1014 and records every sent
//! code in the pre-defined error field at 0x1003. The inhibit time at
//! 0x1015 (units of 100 microseconds) bounds the emission rate: writes
//! inside the window are queued in submission order and flushed as the
//! window opens, the configured gap is never violated.
//!
//! The consumer decodes emergency frames of every COB-ID listed in
//! 0x1028.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::EdsError;
use crate::frame::{emergency_frame, CanFrame};
use crate::node::{Bus, DeviceEvent};
use crate::od::{ErrorRegisterBit, ObjectDictionary};

pub struct Emcy {
    started: bool,
    queue: VecDeque<(u16, [u8; 5])>,
    next_allowed: Option<Instant>,
    active_errors: Vec<u16>,
    consumer_cobs: Vec<u16>,
}

impl Emcy {
    pub fn new() -> Emcy {
        Emcy {
            started: false,
            queue: VecDeque::new(),
            next_allowed: None,
            active_errors: Vec::new(),
            consumer_cobs: Vec::new(),
        }
    }

    pub(crate) fn start(&mut self, od: &ObjectDictionary) {
        self.started = true;
        self.reconfigure(od);
    }

    pub(crate) fn stop(&mut self) {
        self.started = false;
        self.queue.clear();
        self.next_allowed = None;
    }

    pub(crate) fn reconfigure(&mut self, od: &ObjectDictionary) {
        self.consumer_cobs = od.emcy_consumer_cob_ids();
    }

    pub(crate) fn on_od_update(&mut self, index: u16, od: &ObjectDictionary) {
        if index == 0x1028 {
            self.reconfigure(od);
        }
    }

    /// Emit an emergency with up to five bytes of manufacturer specific
    /// information.
    ///
    /// Requires a valid producer COB-ID at 0x1014. Inside the inhibit
    /// window the write is queued, the emitted order is the submission
    /// order.
    pub(crate) fn write(
        &mut self,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
        code: u16,
        info: Option<&[u8]>,
    ) -> Result<(), EdsError> {
        if !self.started {
            return Err(EdsError::NotConfigured("EMCY producer (device not started)"));
        }
        od.emcy_cob_id()
            .ok_or(EdsError::NotConfigured("EMCY COB-ID at 0x1014"))?;
        let mut padded = [0_u8; 5];
        if let Some(info) = info {
            let take = info.len().min(5);
            padded[..take].clone_from_slice(&info[..take]);
        }
        if self
            .next_allowed
            .map(|release| now < release)
            .unwrap_or(false)
        {
            debug!("emcy: 0x{:04X} queued behind the inhibit window", code);
            self.queue.push_back((code, padded));
            return Ok(());
        }
        self.send(od, bus, now, code, padded);
        Ok(())
    }

    fn send(
        &mut self,
        od: &mut ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
        code: u16,
        info: [u8; 5],
    ) {
        let cob_id = match od.emcy_cob_id() {
            Some(cob_id) => cob_id,
            None => {
                warn!("emcy: producer COB-ID vanished, dropping 0x{:04X}", code);
                return;
            }
        };
        // error code 0x0000 is the "error reset / no error" message
        if code == 0x0000 {
            self.active_errors.clear();
            od.set_error_bit(ErrorRegisterBit::Generic, false);
        } else {
            self.active_errors.push(code);
            od.set_error_bit(ErrorRegisterBit::Generic, true);
        }
        let register = od.error_register();
        match emergency_frame(cob_id, code, register, &info) {
            Ok(frame) => bus.send(frame),
            Err(error) => {
                warn!("emcy: cannot build frame: {}", error);
                return;
            }
        }
        od.push_error_history(code, 0);
        let inhibit = od.emcy_inhibit_time();
        if inhibit > 0 {
            self.next_allowed = Some(now + Duration::from_micros(inhibit as u64 * 100));
        } else {
            self.next_allowed = None;
        }
    }

    /// Flush queued writes once the inhibit window opens.
    pub(crate) fn poll(&mut self, od: &mut ObjectDictionary, bus: &mut Bus, now: Instant) {
        while !self.queue.is_empty() {
            if self
                .next_allowed
                .map(|release| now < release)
                .unwrap_or(false)
            {
                break;
            }
            if let Some((code, info)) = self.queue.pop_front() {
                self.send(od, bus, now, code, info);
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if self.queue.is_empty() {
            None
        } else {
            self.next_allowed
        }
    }

    /// A frame on one of the consumed emergency COB-IDs.
    pub(crate) fn handle_frame(&mut self, frame: &CanFrame, bus: &mut Bus) {
        if !self.started || frame.is_rtr() {
            return;
        }
        if !self.consumer_cobs.contains(&frame.id()) {
            return;
        }
        let data = frame.padded();
        if frame.data().len() < 8 {
            warn!("emcy: malformed emergency frame on 0x{:03X}", frame.id());
            return;
        }
        let code = u16::from_le_bytes([data[0], data[1]]);
        let mut info = [0_u8; 5];
        info.clone_from_slice(&data[3..8]);
        bus.event(DeviceEvent::Emergency {
            cob_id: frame.id(),
            node_id: frame.node_id(),
            code,
            register: data[2],
            info,
        });
    }

    /// Error codes considered active since the last error reset.
    pub fn active_errors(&self) -> &[u16] {
        &self.active_errors
    }
}

impl Default for Emcy {
    fn default() -> Self {
        Emcy::new()
    }
}
