//! Network management: node state machine, heartbeat producer and
//! heartbeat consumer.
//!
//! A starting node sends a single BOOT_UP frame and settles in
//! PRE_OPERATIONAL. NMT commands on COB-ID 0x000 move it between
//! OPERATIONAL, STOPPED and PRE_OPERATIONAL; the two reset commands
//! replay the boot sequence. The heartbeat producer broadcasts the
//! current state on `0x700 + node id` every 0x1017 milliseconds, the
//! consumer tracks every node listed in 0x1016 and reports a timeout
//! when one goes quiet.

use std::fmt::Display;
use std::time::{Duration, Instant};

use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::{heartbeat_frame, nmt_command_frame, CanFrame};
use crate::node::{Bus, DeviceEvent};
use crate::od::ObjectDictionary;

/// The NMT slave states of CiA-301.
#[derive(Display)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NmtState {
    BootUp = 0x00,
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7F,
}

/// NMT module control commands, byte 0 of a frame on COB-ID 0x000.
#[derive(Display)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NmtCommand {
    StartNode = 0x01,
    StopNode = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

struct HeartbeatConsumer {
    node_id: u8,
    time: Duration,
    deadline: Option<Instant>,
    last_state: Option<NmtState>,
}

pub struct Nmt {
    node_id: u8,
    state: NmtState,
    started: bool,
    producer_period: Option<Duration>,
    next_heartbeat: Option<Instant>,
    consumers: Vec<HeartbeatConsumer>,
}

impl Nmt {
    pub fn new(node_id: u8) -> Nmt {
        Nmt {
            node_id,
            state: NmtState::BootUp,
            started: false,
            producer_period: None,
            next_heartbeat: None,
            consumers: Vec::new(),
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub(crate) fn start(&mut self, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        self.reload_consumers(od);
        self.boot(od, bus, now);
    }

    pub(crate) fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.next_heartbeat = None;
        for consumer in &mut self.consumers {
            consumer.deadline = None;
            consumer.last_state = None;
        }
    }

    /// The boot sequence: one BOOT_UP frame, then PRE_OPERATIONAL.
    fn boot(&mut self, od: &ObjectDictionary, bus: &mut Bus, now: Instant) {
        bus.send(heartbeat_frame(self.node_id, NmtState::BootUp.into()));
        self.state = NmtState::BootUp;
        self.set_state(NmtState::PreOperational, bus);
        self.reload_producer(od, now);
    }

    fn set_state(&mut self, state: NmtState, bus: &mut Bus) {
        if self.state != state {
            debug!("nmt: node 0x{:02X} enters {}", self.node_id, state);
            self.state = state;
            bus.event(DeviceEvent::NmtChangeState { state });
        }
    }

    fn reload_producer(&mut self, od: &ObjectDictionary, now: Instant) {
        let time_ms = od.heartbeat_producer_time();
        if time_ms == 0 {
            self.producer_period = None;
            self.next_heartbeat = None;
        } else {
            let period = Duration::from_millis(time_ms as u64);
            self.producer_period = Some(period);
            self.next_heartbeat = Some(now + period);
        }
    }

    fn reload_consumers(&mut self, od: &ObjectDictionary) {
        let mut consumers = Vec::new();
        for (node_id, time_ms) in od.heartbeat_consumers() {
            let mut consumer = HeartbeatConsumer {
                node_id,
                time: Duration::from_millis(time_ms as u64),
                deadline: None,
                last_state: None,
            };
            if let Some(old) = self.consumers.iter().find(|c| c.node_id == node_id) {
                consumer.deadline = old.deadline;
                consumer.last_state = old.last_state;
            }
            consumers.push(consumer);
        }
        self.consumers = consumers;
    }

    /// Broadcast or address an NMT command; the frame passes through
    /// the regular outbox so a loopback device applies it to itself.
    pub(crate) fn send_command(&self, command: NmtCommand, target: u8, bus: &mut Bus) {
        bus.send(nmt_command_frame(command.into(), target));
    }

    /// A command frame on COB-ID 0x000: `[command, target]`.
    pub(crate) fn handle_command(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        bus: &mut Bus,
        now: Instant,
    ) {
        let data = frame.data();
        if data.len() < 2 {
            return;
        }
        let command = match NmtCommand::try_from(data[0]) {
            Ok(command) => command,
            Err(_) => {
                warn!("nmt: unknown command 0x{:02X}", data[0]);
                return;
            }
        };
        let target = data[1];
        if target != 0 && target != self.node_id {
            return;
        }
        debug!("nmt: received {} for node 0x{:02X}", command, target);
        match command {
            NmtCommand::StartNode => self.set_state(NmtState::Operational, bus),
            NmtCommand::StopNode => self.set_state(NmtState::Stopped, bus),
            NmtCommand::EnterPreOperational => self.set_state(NmtState::PreOperational, bus),
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                self.boot(od, bus, now);
            }
        }
    }

    /// A heartbeat (or boot-up) frame on 0x700 + remote id.
    pub(crate) fn handle_heartbeat(&mut self, frame: &CanFrame, bus: &mut Bus, now: Instant) {
        if frame.is_rtr() || frame.data().is_empty() {
            return;
        }
        let remote = frame.node_id();
        let state = match NmtState::try_from(frame.data()[0] & 0x7F) {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    "nmt: node 0x{:02X} reports unknown state 0x{:02X}",
                    remote,
                    frame.data()[0]
                );
                return;
            }
        };
        let consumer = match self.consumers.iter_mut().find(|c| c.node_id == remote) {
            Some(consumer) => consumer,
            None => return,
        };
        consumer.deadline = Some(now + consumer.time);
        if consumer.last_state != Some(state) {
            consumer.last_state = Some(state);
            bus.event(DeviceEvent::HeartbeatStateChange {
                node_id: remote,
                state,
            });
        }
        bus.event(DeviceEvent::Heartbeat {
            node_id: remote,
            state,
        });
    }

    pub(crate) fn poll(&mut self, bus: &mut Bus, now: Instant) {
        if !self.started {
            return;
        }
        if let (Some(period), Some(next)) = (self.producer_period, self.next_heartbeat) {
            if next <= now {
                bus.send(heartbeat_frame(self.node_id, self.state.into()));
                self.next_heartbeat = Some(now + period);
            }
        }
        for consumer in &mut self.consumers {
            if let Some(deadline) = consumer.deadline {
                if deadline <= now {
                    warn!("nmt: heartbeat of node 0x{:02X} timed out", consumer.node_id);
                    consumer.deadline = None;
                    bus.event(DeviceEvent::HeartbeatTimeout {
                        node_id: consumer.node_id,
                    });
                }
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let consumer_deadlines = self.consumers.iter().filter_map(|c| c.deadline);
        self.next_heartbeat
            .into_iter()
            .chain(consumer_deadlines)
            .min()
    }

    pub(crate) fn on_od_update(&mut self, index: u16, od: &ObjectDictionary, now: Instant) {
        match index {
            0x1016 => self.reload_consumers(od),
            0x1017 => {
                if self.started {
                    self.reload_producer(od, now);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Bus;

    fn bus() -> Bus {
        Bus::new()
    }

    #[test]
    fn boot_sequence_sends_boot_up_and_enters_pre_operational() {
        let mut od = ObjectDictionary::new();
        od.set_heartbeat_producer_time(100);
        let mut nmt = Nmt::new(0x0A);
        let mut bus = bus();
        let t0 = Instant::now();
        nmt.start(&od, &mut bus, t0);
        let frames = bus.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x70A);
        assert_eq!(frames[0].data(), &[0x00]);
        assert_eq!(nmt.state(), NmtState::PreOperational);
        let events = bus.take_events();
        assert!(matches!(
            events[0],
            DeviceEvent::NmtChangeState {
                state: NmtState::PreOperational
            }
        ));
    }

    #[test]
    fn heartbeat_producer_period() {
        let mut od = ObjectDictionary::new();
        od.set_heartbeat_producer_time(100);
        let mut nmt = Nmt::new(0x0A);
        let mut bus = bus();
        let t0 = Instant::now();
        nmt.start(&od, &mut bus, t0);
        bus.take_frames();
        nmt.poll(&mut bus, t0 + Duration::from_millis(50));
        assert!(bus.take_frames().is_empty());
        nmt.poll(&mut bus, t0 + Duration::from_millis(101));
        let frames = bus.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), &[0x7F]);
    }

    #[test]
    fn commands_move_the_state_machine() {
        let od = ObjectDictionary::new();
        let mut nmt = Nmt::new(0x0A);
        let mut bus = bus();
        let t0 = Instant::now();
        nmt.start(&od, &mut bus, t0);
        bus.take_frames();
        bus.take_events();

        let start = nmt_command_frame(NmtCommand::StartNode.into(), 0x0A);
        nmt.handle_command(&start, &od, &mut bus, t0);
        assert_eq!(nmt.state(), NmtState::Operational);

        // addressed elsewhere: ignored
        let stop_other = nmt_command_frame(NmtCommand::StopNode.into(), 0x0B);
        nmt.handle_command(&stop_other, &od, &mut bus, t0);
        assert_eq!(nmt.state(), NmtState::Operational);

        // broadcast applies
        let stop_all = nmt_command_frame(NmtCommand::StopNode.into(), 0);
        nmt.handle_command(&stop_all, &od, &mut bus, t0);
        assert_eq!(nmt.state(), NmtState::Stopped);

        let reset = nmt_command_frame(NmtCommand::ResetCommunication.into(), 0x0A);
        nmt.handle_command(&reset, &od, &mut bus, t0);
        assert_eq!(nmt.state(), NmtState::PreOperational);
        let frames = bus.take_frames();
        assert_eq!(frames.last().unwrap().data(), &[0x00]); // fresh boot-up
    }

    #[test]
    fn consumer_times_out_after_quiet_period() {
        let mut od = ObjectDictionary::new();
        od.add_heartbeat_consumer(0x0B, 100).unwrap();
        let mut nmt = Nmt::new(0x0A);
        let mut bus = bus();
        let t0 = Instant::now();
        nmt.start(&od, &mut bus, t0);
        bus.take_frames();
        bus.take_events();

        let beat = heartbeat_frame(0x0B, NmtState::Operational.into());
        nmt.handle_heartbeat(&beat, &mut bus, t0);
        let events = bus.take_events();
        assert!(matches!(
            events[0],
            DeviceEvent::HeartbeatStateChange {
                node_id: 0x0B,
                state: NmtState::Operational
            }
        ));
        assert!(matches!(
            events[1],
            DeviceEvent::Heartbeat {
                node_id: 0x0B,
                state: NmtState::Operational
            }
        ));

        // within 1.5 * time the silence is reported
        nmt.poll(&mut bus, t0 + Duration::from_millis(150));
        let events = bus.take_events();
        assert!(matches!(
            events[0],
            DeviceEvent::HeartbeatTimeout { node_id: 0x0B }
        ));
        // and only once per silence
        nmt.poll(&mut bus, t0 + Duration::from_millis(300));
        assert!(bus.take_events().is_empty());
    }

    #[test]
    fn unmonitored_nodes_are_ignored() {
        let od = ObjectDictionary::new();
        let mut nmt = Nmt::new(0x0A);
        let mut bus = bus();
        nmt.start(&od, &mut bus, Instant::now());
        bus.take_frames();
        bus.take_events();
        let beat = heartbeat_frame(0x55, NmtState::Operational.into());
        nmt.handle_heartbeat(&beat, &mut bus, Instant::now());
        assert!(bus.take_events().is_empty());
    }
}
