//! The device facade.
//!
//! A [`Device`] owns one protocol core behind `Rc<RefCell<..>>` and
//! adds the boundary towards the embedder:
//!
//! - inbound frames enter through [`Device::receive`]
//! - outbound frames leave through the channel of [`Device::frames`]
//! - protocol events arrive on the channel of [`Device::events`]
//! - timers are driven by [`Device::poll`]; [`Device::next_deadline`]
//!   tells the embedder how long it may sleep
//!
//! With the `loopback` option the outbox feeds straight back into
//! dispatch through a breadth first queue, which keeps arbitrarily long
//! SDO transfers from recursing and lets a single device exercise both
//! ends of every protocol in tests.
//!
//! The device is single threaded by design; a multi threaded transport
//! marshals frames onto the thread that owns the device.
//!
//! # Example
//!
//! ```
//! use cano::{AccessType, DataType, Device, DeviceOptions, Value};
//! use cano::od::EntrySpec;
//!
//! let device = Device::new(DeviceOptions {
//!     id: 0x0A,
//!     loopback: true,
//!     ..DeviceOptions::default()
//! })
//! .unwrap();
//! device
//!     .od_mut(|od| {
//!         od.add_entry(
//!             0x2000,
//!             EntrySpec::var("Setpoint", DataType::Unsigned8, AccessType::ReadWrite),
//!         )
//!     })
//!     .unwrap();
//! device.start();
//! device.set_value(0x2000, Value::Unsigned8(1)).unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;

use crate::data_type::Value;
use crate::error::EdsError;
use crate::frame::CanFrame;
use crate::lss::{LssMaster, LssMode};
use crate::nmt::{NmtCommand, NmtState};
use crate::node::Node;
use crate::od::ObjectDictionary;
use crate::sdo::client::SdoClient;
use crate::sdo::DEFAULT_SDO_TIMEOUT;

pub use crate::node::DeviceEvent;

/// Construction options of a [`Device`].
#[derive(Debug)]
pub struct DeviceOptions {
    /// Node id, 1..=127.
    pub id: u8,
    /// Wire the outbox back into dispatch, for tests and self talk.
    pub loopback: bool,
    /// Answer LSS services; requires an identity at 0x1018, created
    /// zeroed when missing.
    pub enable_lss: bool,
    /// Adopt a prepared object dictionary instead of an empty one.
    pub od: Option<ObjectDictionary>,
    /// Per response step timeout of SDO transfers.
    pub sdo_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            id: 1,
            loopback: false,
            enable_lss: false,
            od: None,
            sdo_timeout: DEFAULT_SDO_TIMEOUT,
        }
    }
}

/// A CANopen device: object dictionary plus the protocol modules of
/// CiA-301, multiplexed over one CAN link.
pub struct Device {
    node: Rc<RefCell<Node>>,
    loopback: bool,
    sdo_timeout: Duration,
    frames_tx: mpsc::UnboundedSender<CanFrame>,
    frames_rx: RefCell<Option<mpsc::UnboundedReceiver<CanFrame>>>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
    rx_queue: RefCell<VecDeque<CanFrame>>,
    pumping: Cell<bool>,
}

impl Device {
    pub fn new(options: DeviceOptions) -> Result<Device, EdsError> {
        if options.id == 0 || options.id > 0x7F {
            return Err(EdsError::InvalidNodeId { node_id: options.id });
        }
        let mut od = options.od.unwrap_or_default();
        if options.enable_lss && od.identity().is_none() {
            od.set_identity(Default::default());
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Node::new(options.id, od, options.enable_lss, options.sdo_timeout);
        Ok(Device {
            node: Rc::new(RefCell::new(node)),
            loopback: options.loopback,
            sdo_timeout: options.sdo_timeout,
            frames_tx,
            frames_rx: RefCell::new(Some(frames_rx)),
            events_tx,
            events_rx: RefCell::new(Some(events_rx)),
            rx_queue: RefCell::new(VecDeque::new()),
            pumping: Cell::new(false),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node.borrow().node_id
    }

    /// The outbound frame channel towards the CAN driver. Can be taken
    /// once.
    pub fn frames(&self) -> Option<mpsc::UnboundedReceiver<CanFrame>> {
        self.frames_rx.borrow_mut().take()
    }

    /// The protocol event channel. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events_rx.borrow_mut().take()
    }

    /// Bring the device up: boot-up frame, PRE_OPERATIONAL, timers
    /// armed. Idempotent.
    pub fn start(&self) {
        self.with_node(|node, now| node.start(now));
    }

    /// Stop all modules in reverse start order, cancel timers, abort an
    /// in-flight SDO client transfer with the general error code.
    /// Idempotent.
    pub fn stop(&self) {
        self.with_node(|node, _| node.stop());
    }

    pub fn is_started(&self) -> bool {
        self.node.borrow().is_started()
    }

    /// Feed one frame received from the CAN link.
    pub fn receive(&self, frame: CanFrame) {
        self.rx_queue.borrow_mut().push_back(frame);
        self.pump();
    }

    /// Fire every timer that elapsed up to `now`.
    pub fn poll(&self, now: Instant) {
        self.with_node(|node, _| node.poll(now));
    }

    /// The earliest pending timer; the embedder sleeps until then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.node.borrow().next_deadline()
    }

    /// Read access to the object dictionary.
    pub fn od<R>(&self, f: impl FnOnce(&ObjectDictionary) -> R) -> R {
        f(&self.node.borrow().od)
    }

    /// Mutate the object dictionary; change notifications are routed to
    /// the modules before this returns.
    pub fn od_mut<R>(&self, f: impl FnOnce(&mut ObjectDictionary) -> R) -> R {
        self.with_node(|node, _| f(&mut node.od))
    }

    pub fn set_value(&self, index: u16, value: Value) -> Result<(), EdsError> {
        self.od_mut(|od| od.set_value(index, value))
    }

    pub fn set_value_array(&self, index: u16, sub_index: u8, value: Value) -> Result<(), EdsError> {
        self.od_mut(|od| od.set_value_array(index, sub_index, value))
    }

    pub fn get_value(&self, index: u16) -> Result<Value, EdsError> {
        self.od(|od| od.get_value(index))
    }

    pub fn get_value_array(&self, index: u16, sub_index: u8) -> Result<Value, EdsError> {
        self.od(|od| od.get_value_array(index, sub_index))
    }

    /// Subscribe a listener key to updates of one entry; updates then
    /// surface as [`DeviceEvent::ObjectUpdated`].
    pub fn subscribe(&self, index: u16, key: &str) -> Result<(), EdsError> {
        self.od_mut(|od| od.subscribe(index, key))
    }

    pub fn unsubscribe(&self, index: u16, key: &str) {
        self.od_mut(|od| od.unsubscribe(index, key));
    }

    /// An SDO client towards `server_id`, resolved from the client
    /// parameter records (0x1280..=0x12FF).
    pub fn sdo(&self, server_id: u8) -> Result<SdoClient<'_>, EdsError> {
        let channel = self
            .od(|od| od.sdo_client_channel(server_id))
            .ok_or(EdsError::NotConfigured("SDO client parameters for this server"))?;
        Ok(SdoClient::new(self, channel, self.sdo_timeout))
    }

    /// The LSS master side services.
    pub fn lss(&self) -> LssMaster<'_> {
        LssMaster::new(self)
    }

    pub fn nmt_state(&self) -> NmtState {
        self.node.borrow().nmt.state()
    }

    pub fn lss_mode(&self) -> LssMode {
        self.node.borrow().lss.mode()
    }

    pub fn lss_pending_node_id(&self) -> Option<u8> {
        self.node.borrow().lss.pending_node_id()
    }

    /// Broadcast or address an NMT command; with loopback it applies
    /// to this device as well.
    pub fn nmt_command(&self, command: NmtCommand, target: u8) {
        self.with_node(|node, _| {
            let Node { nmt, bus, .. } = node;
            nmt.send_command(command, target, bus);
        });
    }

    /// Emit an emergency frame, see [`crate::emcy::Emcy::write`]
    /// semantics: inhibit time is honored, the code lands in the error
    /// history at 0x1003.
    pub fn emcy_write(&self, code: u16, info: Option<&[u8]>) -> Result<(), EdsError> {
        self.with_node(|node, now| {
            let Node { emcy, od, bus, .. } = node;
            emcy.write(od, bus, now, code, info)
        })
    }

    /// Emit one SYNC frame; requires the generate flag in 0x1005.
    pub fn sync_write(&self) -> Result<(), EdsError> {
        self.with_node(|node, _| {
            let Node { sync, od, bus, .. } = node;
            sync.write(od, bus)
        })
    }

    /// Broadcast a TIME stamp; requires the produce flag in 0x1012.
    pub fn time_write(&self, date: DateTime<Utc>) -> Result<(), EdsError> {
        self.with_node(|node, _| {
            let Node { time, od, bus, .. } = node;
            time.write(od, bus, date)
        })
    }

    /// Run a closure on the core, route dictionary notifications, then
    /// drain outbox and events.
    fn with_node<R>(&self, f: impl FnOnce(&mut Node, Instant) -> R) -> R {
        let now = Instant::now();
        let result = {
            let mut node = self.node.borrow_mut();
            let result = f(&mut node, now);
            node.process_notifications(now);
            result
        };
        self.pump();
        result
    }

    /// Outbound path of the client helpers; loopback feeds the frame
    /// back into dispatch.
    pub(crate) fn transmit_frame(&self, frame: CanFrame) {
        let _ = self.frames_tx.send(frame);
        if self.loopback {
            self.rx_queue.borrow_mut().push_back(frame);
        }
        self.pump();
    }

    pub(crate) fn register_sdo_listener(&self, cob_id: u16) -> mpsc::UnboundedReceiver<[u8; 8]> {
        self.node.borrow_mut().register_sdo_listener(cob_id)
    }

    pub(crate) fn clear_sdo_listener(&self) {
        self.node.borrow_mut().clear_sdo_listener();
    }

    pub(crate) fn register_lss_listener(&self) -> mpsc::UnboundedReceiver<[u8; 8]> {
        self.node.borrow_mut().register_lss_listener()
    }

    pub(crate) fn clear_lss_listener(&self) {
        self.node.borrow_mut().clear_lss_listener();
    }

    /// Breadth first delivery loop: flush the outbox into the frame
    /// channel (and, with loopback, into the receive queue), then
    /// dispatch queued inbound frames until both sides run dry.
    fn pump(&self) {
        if self.pumping.get() {
            return;
        }
        self.pumping.set(true);
        loop {
            let (frames, events) = {
                let mut node = self.node.borrow_mut();
                (node.bus.take_frames(), node.bus.take_events())
            };
            for event in events {
                let _ = self.events_tx.send(event);
            }
            for frame in frames {
                debug!("device 0x{:02X} tx {}", self.node_id(), frame);
                let _ = self.frames_tx.send(frame);
                if self.loopback {
                    self.rx_queue.borrow_mut().push_back(frame);
                }
            }
            let next = self.rx_queue.borrow_mut().pop_front();
            match next {
                Some(frame) => {
                    let now = Instant::now();
                    let mut node = self.node.borrow_mut();
                    node.handle_frame(frame, now);
                }
                None => {
                    let done = self.node.borrow().bus.is_empty();
                    if done {
                        break;
                    }
                }
            }
        }
        self.pumping.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_range_is_enforced() {
        assert!(matches!(
            Device::new(DeviceOptions {
                id: 0,
                ..DeviceOptions::default()
            }),
            Err(EdsError::InvalidNodeId { node_id: 0 })
        ));
        assert!(matches!(
            Device::new(DeviceOptions {
                id: 0x80,
                ..DeviceOptions::default()
            }),
            Err(EdsError::InvalidNodeId { node_id: 0x80 })
        ));
        assert!(Device::new(DeviceOptions {
            id: 0x7F,
            ..DeviceOptions::default()
        })
        .is_ok());
    }

    #[test]
    fn start_emits_boot_up_and_pre_operational() {
        let device = Device::new(DeviceOptions {
            id: 0x0A,
            ..DeviceOptions::default()
        })
        .unwrap();
        let mut frames = device.frames().unwrap();
        let mut events = device.events().unwrap();
        device.start();
        let boot = frames.try_recv().unwrap();
        assert_eq!(boot.id(), 0x70A);
        assert_eq!(boot.data(), &[0x00]);
        assert!(matches!(
            events.try_recv().unwrap(),
            DeviceEvent::NmtChangeState {
                state: NmtState::PreOperational
            }
        ));
        // idempotent: no second boot-up
        device.start();
        assert!(frames.try_recv().is_err());
        assert_eq!(device.nmt_state(), NmtState::PreOperational);
    }

    #[test]
    fn loopback_nmt_command_applies_to_self() {
        let device = Device::new(DeviceOptions {
            id: 0x0A,
            loopback: true,
            ..DeviceOptions::default()
        })
        .unwrap();
        device.start();
        device.nmt_command(NmtCommand::StartNode, 0);
        assert_eq!(device.nmt_state(), NmtState::Operational);
        device.nmt_command(NmtCommand::StopNode, 0x0A);
        assert_eq!(device.nmt_state(), NmtState::Stopped);
        // addressed at someone else: no effect
        device.nmt_command(NmtCommand::StartNode, 0x0B);
        assert_eq!(device.nmt_state(), NmtState::Stopped);
    }

    #[test]
    fn enable_lss_seeds_an_identity() {
        let device = Device::new(DeviceOptions {
            id: 0x0A,
            enable_lss: true,
            ..DeviceOptions::default()
        })
        .unwrap();
        assert!(device.od(|od| od.identity()).is_some());
    }
}
