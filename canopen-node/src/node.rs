//! The protocol core.
//!
//! [`Node`] owns the object dictionary and every protocol module and
//! performs the synchronous work: classify an inbound frame by its
//! COB-ID function code and hand it to the owning module, fire elapsed
//! timers, and route dictionary change notifications to the modules
//! before any frame caused by the change leaves the outbox. The
//! surrounding [`crate::Device`] drains outbox and event queue and adds
//! the asynchronous client surface.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;

use crate::data_type::Value;
use crate::emcy::Emcy;
use crate::frame::{
    extract_frame_type_and_node_id, CanFrame, FrameType, COB_LSS_REQUEST, COB_LSS_RESPONSE,
    COB_SYNC,
};
use crate::lss::{Lss, LssMode};
use crate::nmt::{Nmt, NmtState};
use crate::od::ObjectDictionary;
use crate::pdo::PdoEngine;
use crate::sdo::server::SdoServer;
use crate::sync::Sync;
use crate::time::TimeStamp;

/// Everything a device reports to its embedder.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Every received frame.
    Message { frame: CanFrame },
    /// A subscribed dictionary entry changed; `value` is the new raw
    /// stored value.
    ObjectUpdated {
        index: u16,
        sub_index: u8,
        value: Value,
    },
    /// A receive PDO wrote the listed cells.
    Pdo {
        cob_id: u16,
        entries: Vec<(u16, u8)>,
    },
    Emergency {
        cob_id: u16,
        node_id: u8,
        code: u16,
        register: u8,
        info: [u8; 5],
    },
    Sync { count: Option<u8> },
    Time { date: DateTime<Utc> },
    NmtChangeState { state: NmtState },
    Heartbeat { node_id: u8, state: NmtState },
    HeartbeatStateChange { node_id: u8, state: NmtState },
    HeartbeatTimeout { node_id: u8 },
    LssChangeMode { mode: LssMode },
    LssChangeDeviceId { node_id: u8 },
}

/// Outbound side shared by all modules: frames towards the transport
/// and events towards the embedder, both drained by the device.
pub struct Bus {
    frames: VecDeque<CanFrame>,
    events: VecDeque<DeviceEvent>,
}

impl Bus {
    pub(crate) fn new() -> Bus {
        Bus {
            frames: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn send(&mut self, frame: CanFrame) {
        self.frames.push_back(frame);
    }

    pub(crate) fn event(&mut self, event: DeviceEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn take_frames(&mut self) -> Vec<CanFrame> {
        self.frames.drain(..).collect()
    }

    pub(crate) fn take_events(&mut self) -> Vec<DeviceEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty()
    }
}

pub(crate) struct Node {
    pub(crate) node_id: u8,
    pub(crate) od: ObjectDictionary,
    pub(crate) bus: Bus,
    pub(crate) nmt: Nmt,
    pub(crate) emcy: Emcy,
    pub(crate) sync: Sync,
    pub(crate) time: TimeStamp,
    pub(crate) pdo: PdoEngine,
    pub(crate) sdo_server: SdoServer,
    pub(crate) lss: Lss,
    started: bool,
    sdo_listener: Option<(u16, mpsc::UnboundedSender<[u8; 8]>)>,
    lss_listener: Option<mpsc::UnboundedSender<[u8; 8]>>,
}

impl Node {
    pub(crate) fn new(
        node_id: u8,
        od: ObjectDictionary,
        enable_lss: bool,
        sdo_timeout: std::time::Duration,
    ) -> Node {
        Node {
            node_id,
            od,
            bus: Bus::new(),
            nmt: Nmt::new(node_id),
            emcy: Emcy::new(),
            sync: Sync::new(),
            time: TimeStamp::new(),
            pdo: PdoEngine::new(),
            sdo_server: SdoServer::new(sdo_timeout),
            lss: Lss::new(enable_lss),
            started: false,
            sdo_listener: None,
            lss_listener: None,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    /// Bring all modules up. Idempotent; the second call is a no-op.
    pub(crate) fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        // a served default SDO channel always exists
        if self.od.sdo_server_channels(self.node_id).is_empty() {
            let _ = self.od.add_sdo_server_parameters(0);
        }
        self.sdo_server.reconfigure(&self.od, self.node_id);
        self.nmt.start(&self.od, &mut self.bus, now);
        self.emcy.start(&self.od);
        self.sync.start(&self.od, now);
        self.time.start();
        self.pdo.start(&self.od, now);
        self.process_notifications(now);
    }

    /// Stop the modules in reverse start order. Idempotent. An SDO
    /// client transfer in flight resolves with the general error abort.
    pub(crate) fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.pdo.stop();
        self.time.stop();
        self.sync.stop();
        self.emcy.stop();
        self.nmt.stop();
        self.sdo_server.stop(&mut self.bus);
        self.sdo_listener = None;
        self.lss_listener = None;
    }

    /// Dispatch one inbound frame by COB-ID range.
    pub(crate) fn handle_frame(&mut self, frame: CanFrame, now: Instant) {
        self.bus.event(DeviceEvent::Message { frame });
        let frame_type = match extract_frame_type_and_node_id(frame.id()) {
            Ok((frame_type, _)) => frame_type,
            Err(_) => return,
        };
        match frame_type {
            FrameType::Nmt => {
                self.nmt.handle_command(&frame, &self.od, &mut self.bus, now);
            }
            FrameType::SyncEmergency => {
                let sync_cob = self.od.sync_cob_id().unwrap_or(COB_SYNC);
                if frame.id() == sync_cob {
                    if let Some(count) = self.sync.handle_frame(&frame, &mut self.bus) {
                        self.pdo.on_sync(count, &self.od, &mut self.bus, now);
                    }
                } else {
                    self.emcy.handle_frame(&frame, &mut self.bus);
                }
            }
            FrameType::Time => {
                self.time.handle_frame(&frame, &self.od, &mut self.bus);
            }
            frame_type if frame_type.is_pdo() => {
                if self.started {
                    self.pdo
                        .handle_frame(&frame, &mut self.od, &mut self.bus, now);
                }
            }
            FrameType::SdoRx => {
                if self.started {
                    self.sdo_server
                        .handle_frame(&frame, &mut self.od, &mut self.bus, now);
                }
            }
            FrameType::SdoTx => {
                // responses of remote servers travel here; nonstandard
                // server records may also place our own rx in this range
                if self.started && self.sdo_server.owns(frame.id()) {
                    self.sdo_server
                        .handle_frame(&frame, &mut self.od, &mut self.bus, now);
                }
                self.forward_to_sdo_listener(&frame);
            }
            FrameType::NmtErrorControl => {
                self.nmt.handle_heartbeat(&frame, &mut self.bus, now);
            }
            FrameType::Lss => match frame.id() {
                COB_LSS_REQUEST => self.lss.handle_request(&frame, &self.od, &mut self.bus),
                COB_LSS_RESPONSE => self.forward_to_lss_listener(&frame),
                _ => debug!("lss: frame on unexpected COB-ID 0x{:03X}", frame.id()),
            },
            _ => {}
        }
        self.process_notifications(now);
    }

    /// Fire every elapsed timer.
    pub(crate) fn poll(&mut self, now: Instant) {
        self.nmt.poll(&mut self.bus, now);
        self.emcy.poll(&mut self.od, &mut self.bus, now);
        self.sync.poll(&self.od, &mut self.bus, now);
        self.pdo.poll(&self.od, &mut self.bus, now);
        self.sdo_server.poll(&mut self.bus, now);
        self.process_notifications(now);
    }

    /// The earliest pending timer across all modules.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.nmt.next_deadline(),
            self.emcy.next_deadline(),
            self.sync.next_deadline(),
            self.pdo.next_deadline(),
            self.sdo_server.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Route queued dictionary notifications to the modules and to the
    /// subscribed listeners. Runs until the queue is drained so that a
    /// frame caused by a change is always emitted after every module
    /// saw that change.
    pub(crate) fn process_notifications(&mut self, now: Instant) {
        loop {
            let notifications = self.od.take_notifications();
            if notifications.is_empty() {
                break;
            }
            for notification in notifications {
                use crate::od::OdNotification::*;
                let (index, sub_index, value) = match notification {
                    Updated {
                        index,
                        sub_index,
                        value,
                    } => (index, sub_index, Some(value)),
                    NewEntry { index } | RemovedEntry { index } => (index, 0, None),
                };
                self.pdo
                    .on_od_update(index, sub_index, &self.od, &mut self.bus, now);
                self.nmt.on_od_update(index, &self.od, now);
                self.emcy.on_od_update(index, &self.od);
                self.sync.on_od_update(index, &self.od, now);
                if (0x1200..=0x12FF).contains(&index) {
                    self.sdo_server.reconfigure(&self.od, self.node_id);
                }
                if let Some(value) = value {
                    if self.od.is_subscribed(index) {
                        self.bus.event(DeviceEvent::ObjectUpdated {
                            index,
                            sub_index,
                            value,
                        });
                    }
                }
            }
        }
    }

    fn forward_to_sdo_listener(&mut self, frame: &CanFrame) {
        if frame.is_rtr() {
            return;
        }
        if let Some((cob_id, sender)) = &self.sdo_listener {
            if frame.id() == *cob_id && sender.send(frame.padded()).is_err() {
                self.sdo_listener = None;
            }
        }
    }

    fn forward_to_lss_listener(&mut self, frame: &CanFrame) {
        if frame.is_rtr() {
            return;
        }
        if let Some(sender) = &self.lss_listener {
            if sender.send(frame.padded()).is_err() {
                self.lss_listener = None;
            }
        }
    }

    pub(crate) fn register_sdo_listener(
        &mut self,
        cob_id: u16,
    ) -> mpsc::UnboundedReceiver<[u8; 8]> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sdo_listener = Some((cob_id, sender));
        receiver
    }

    pub(crate) fn clear_sdo_listener(&mut self) {
        self.sdo_listener = None;
    }

    pub(crate) fn register_lss_listener(&mut self) -> mpsc::UnboundedReceiver<[u8; 8]> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lss_listener = Some(sender);
        receiver
    }

    pub(crate) fn clear_lss_listener(&mut self) {
        self.lss_listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::EntrySpec;
    use crate::{AccessType, DataType};
    use std::time::Duration;

    fn node() -> Node {
        Node::new(
            0x0A,
            ObjectDictionary::new(),
            false,
            Duration::from_millis(30),
        )
    }

    #[test]
    fn start_is_idempotent_and_boots_once() {
        let mut node = node();
        let now = Instant::now();
        node.start(now);
        let first = node.bus.take_frames();
        assert_eq!(first.len(), 1); // boot-up
        node.start(now);
        assert!(node.bus.take_frames().is_empty());
        assert!(node.is_started());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut node = node();
        node.start(Instant::now());
        node.bus.take_frames();
        node.stop();
        node.stop();
        assert!(!node.is_started());
    }

    #[test]
    fn default_sdo_channel_is_created_on_start() {
        let mut node = node();
        node.start(Instant::now());
        let channels = node.od.sdo_server_channels(0x0A);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].rx, 0x60A);
        assert_eq!(channels[0].tx, 0x58A);
    }

    #[test]
    fn every_frame_raises_a_message_event() {
        let mut node = node();
        node.start(Instant::now());
        node.bus.take_events();
        let frame = CanFrame::new(0x70B, &[0x05], false).unwrap();
        node.handle_frame(frame, Instant::now());
        let events = node.bus.take_events();
        assert!(matches!(events[0], DeviceEvent::Message { .. }));
    }

    #[test]
    fn subscribed_updates_become_events() {
        let mut node = node();
        node.od
            .add_entry(
                0x2000,
                EntrySpec::var("Value", DataType::Unsigned8, AccessType::ReadWrite),
            )
            .unwrap();
        node.od.subscribe(0x2000, "test").unwrap();
        node.start(Instant::now());
        node.bus.take_events();
        node.od.set_value(0x2000, Value::Unsigned8(9)).unwrap();
        node.process_notifications(Instant::now());
        let events = node.bus.take_events();
        assert!(events.iter().any(|event| matches!(
            event,
            DeviceEvent::ObjectUpdated {
                index: 0x2000,
                sub_index: 0,
                value: Value::Unsigned8(9)
            }
        )));
    }
}
