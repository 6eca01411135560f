//! Layer setting services.
//!
//! LSS runs over the fixed COB-ID pair 0x7E4 (master to slave) and
//! 0x7E5 (slave to master) with a command specifier in byte 0. The
//! slave side answers switch mode global/selective, identity and
//! node-id inquiry, node-id configuration and fastscan probes out of
//! the identity record at 0x1018. The [`LssMaster`] drives the same
//! services from the configuration side; its fastscan recovers a full
//! 128 bit identity with one binary search per field.

use std::fmt::Display;
use std::time::Duration;

use futures_timer::Delay;
use futures_util::{pin_mut, select, FutureExt};
use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::device::Device;
use crate::error::EdsError;
use crate::frame::{CanFrame, COB_LSS_REQUEST, COB_LSS_RESPONSE};
use crate::node::{Bus, DeviceEvent};
use crate::od::{Identity, ObjectDictionary};

/// Default per probe timeout of the master services.
pub const DEFAULT_LSS_TIMEOUT: Duration = Duration::from_millis(100);

/// Command specifiers used by the implemented services.
mod cs {
    pub const SWITCH_GLOBAL: u8 = 0x04;
    pub const CONFIGURE_NODE_ID: u8 = 0x11;
    pub const SWITCH_SELECTIVE_VENDOR: u8 = 0x40;
    pub const SWITCH_SELECTIVE_PRODUCT: u8 = 0x41;
    pub const SWITCH_SELECTIVE_REVISION: u8 = 0x42;
    pub const SWITCH_SELECTIVE_SERIAL: u8 = 0x43;
    pub const SWITCH_SELECTIVE_RESPONSE: u8 = 0x44;
    pub const FASTSCAN: u8 = 0x51;
    pub const FASTSCAN_RESPONSE: u8 = 0x4F;
    pub const INQUIRE_VENDOR: u8 = 0x5A;
    pub const INQUIRE_PRODUCT: u8 = 0x5B;
    pub const INQUIRE_REVISION: u8 = 0x5C;
    pub const INQUIRE_SERIAL: u8 = 0x5D;
    pub const INQUIRE_NODE_ID: u8 = 0x5E;
}

#[derive(Display)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LssMode {
    Operation = 0x00,
    Configuration = 0x01,
}

fn identity_field(identity: &Identity, which: u8) -> u32 {
    match which & 0x03 {
        0 => identity.vendor_id,
        1 => identity.product_code,
        2 => identity.revision_number,
        _ => identity.serial_number,
    }
}

/// The slave side state machine.
pub struct Lss {
    enabled: bool,
    mode: LssMode,
    pending_node_id: Option<u8>,
    /// how many switch-selective fields matched in sequence
    select_progress: u8,
    /// the identity field fastscan currently pins down
    fastscan_sub: u8,
}

impl Lss {
    pub fn new(enabled: bool) -> Lss {
        Lss {
            enabled,
            mode: LssMode::Operation,
            pending_node_id: None,
            select_progress: 0,
            fastscan_sub: 0,
        }
    }

    pub fn mode(&self) -> LssMode {
        self.mode
    }

    /// Node id assigned through LSS, to be applied by the application
    /// on the next communication reset.
    pub fn pending_node_id(&self) -> Option<u8> {
        self.pending_node_id
    }

    fn set_mode(&mut self, mode: LssMode, bus: &mut Bus) {
        if self.mode != mode {
            debug!("lss: switch to {} mode", mode);
            self.mode = mode;
            self.select_progress = 0;
            bus.event(DeviceEvent::LssChangeMode { mode });
        }
    }

    fn respond(&self, bus: &mut Bus, payload: [u8; 8]) {
        if let Ok(frame) = CanFrame::new(COB_LSS_RESPONSE, &payload, false) {
            bus.send(frame);
        }
    }

    /// A request frame on 0x7E4.
    pub(crate) fn handle_request(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &mut Bus) {
        if !self.enabled || frame.is_rtr() {
            return;
        }
        let data = frame.padded();
        match data[0] {
            cs::SWITCH_GLOBAL => match LssMode::try_from(data[1]) {
                Ok(mode) => self.set_mode(mode, bus),
                Err(_) => warn!("lss: unknown mode byte 0x{:02X} ignored", data[1]),
            },
            cs::SWITCH_SELECTIVE_VENDOR..=cs::SWITCH_SELECTIVE_SERIAL => {
                let identity = match od.identity() {
                    Some(identity) => identity,
                    None => return,
                };
                let field = data[0] - cs::SWITCH_SELECTIVE_VENDOR;
                let value = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                if self.select_progress == field && value == identity_field(&identity, field) {
                    self.select_progress += 1;
                } else {
                    self.select_progress = 0;
                }
                if self.select_progress == 4 {
                    self.select_progress = 0;
                    self.set_mode(LssMode::Configuration, bus);
                    let mut response = [0_u8; 8];
                    response[0] = cs::SWITCH_SELECTIVE_RESPONSE;
                    self.respond(bus, response);
                }
            }
            cs::CONFIGURE_NODE_ID => {
                if self.mode != LssMode::Configuration {
                    return;
                }
                let node_id = data[1];
                let mut response = [0_u8; 8];
                response[0] = cs::CONFIGURE_NODE_ID;
                if (1..=0x7F).contains(&node_id) {
                    self.pending_node_id = Some(node_id);
                    bus.event(DeviceEvent::LssChangeDeviceId { node_id });
                } else {
                    response[1] = 0x01; // node id out of range
                }
                self.respond(bus, response);
            }
            cs::INQUIRE_VENDOR..=cs::INQUIRE_SERIAL => {
                if self.mode != LssMode::Configuration {
                    return;
                }
                let identity = match od.identity() {
                    Some(identity) => identity,
                    None => return,
                };
                let field = data[0] - cs::INQUIRE_VENDOR;
                let mut response = [0_u8; 8];
                response[0] = data[0];
                response[1..5]
                    .clone_from_slice(&identity_field(&identity, field).to_le_bytes());
                self.respond(bus, response);
            }
            cs::INQUIRE_NODE_ID => {
                if self.mode != LssMode::Configuration {
                    return;
                }
                let mut response = [0_u8; 8];
                response[0] = cs::INQUIRE_NODE_ID;
                response[1] = self.pending_node_id.unwrap_or(0);
                self.respond(bus, response);
            }
            cs::FASTSCAN => self.handle_fastscan(&data, od, bus),
            other => debug!("lss: command specifier 0x{:02X} not supported", other),
        }
    }

    /// One fastscan probe: `(id field, bit checked, sub index, next
    /// sub index)`. The slave confirms when the already pinned fields
    /// and the probed bit prefix match its identity.
    fn handle_fastscan(&mut self, data: &[u8; 8], od: &ObjectDictionary, bus: &mut Bus) {
        if self.mode == LssMode::Configuration {
            return;
        }
        let identity = match od.identity() {
            Some(identity) => identity,
            None => return,
        };
        let id_field = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let bit_check = data[5];
        let sub = data[6];
        let next = data[7];
        let confirm = [cs::FASTSCAN_RESPONSE, 0, 0, 0, 0, 0, 0, 0];
        if bit_check == 0x80 {
            // presence probe, restarts the scan
            self.fastscan_sub = 0;
            self.respond(bus, confirm);
            return;
        }
        if bit_check > 31 || sub != self.fastscan_sub {
            return;
        }
        let own = identity_field(&identity, sub);
        if own >> bit_check != id_field >> bit_check {
            return;
        }
        self.respond(bus, confirm);
        if bit_check == 0 {
            self.fastscan_sub = next & 0x03;
            if sub == 3 {
                // all four fields pinned, the scan singled us out
                self.set_mode(LssMode::Configuration, bus);
            }
        }
    }
}

/// The master side of the services, driving a slave through the
/// request/response pair with a per probe timeout.
pub struct LssMaster<'d> {
    device: &'d Device,
    timeout: Duration,
}

impl<'d> LssMaster<'d> {
    pub(crate) fn new(device: &'d Device) -> LssMaster<'d> {
        LssMaster {
            device,
            timeout: DEFAULT_LSS_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn begin(&self) -> MasterSession<'d> {
        MasterSession {
            device: self.device,
            responses: self.device.register_lss_listener(),
            timeout: self.timeout,
        }
    }

    /// Switch every slave to the given mode. No response is defined
    /// for this service.
    pub fn switch_mode_global(&mut self, mode: LssMode) {
        let mut request = [0_u8; 8];
        request[0] = cs::SWITCH_GLOBAL;
        request[1] = mode.into();
        let session = self.begin();
        session.send(request);
    }

    /// Switch exactly the slave with this identity to CONFIGURATION.
    pub async fn switch_mode_selective(&mut self, identity: Identity) -> Result<(), EdsError> {
        let mut session = self.begin();
        for (field, value) in [
            (cs::SWITCH_SELECTIVE_VENDOR, identity.vendor_id),
            (cs::SWITCH_SELECTIVE_PRODUCT, identity.product_code),
            (cs::SWITCH_SELECTIVE_REVISION, identity.revision_number),
            (cs::SWITCH_SELECTIVE_SERIAL, identity.serial_number),
        ] {
            let mut request = [0_u8; 8];
            request[0] = field;
            request[1..5].clone_from_slice(&value.to_le_bytes());
            session.send(request);
        }
        let response = session
            .next_response()
            .await
            .ok_or(EdsError::LssFailure("no switch mode selective response"))?;
        if response[0] == cs::SWITCH_SELECTIVE_RESPONSE {
            Ok(())
        } else {
            Err(EdsError::LssFailure("unexpected switch mode selective response"))
        }
    }

    /// Read the four identity fields of the slave in CONFIGURATION
    /// mode.
    pub async fn inquire_identity(&mut self) -> Result<Identity, EdsError> {
        let mut fields = [0_u32; 4];
        for (slot, command) in (cs::INQUIRE_VENDOR..=cs::INQUIRE_SERIAL).enumerate() {
            let mut session = self.begin();
            let mut request = [0_u8; 8];
            request[0] = command;
            session.send(request);
            let response = session
                .next_response()
                .await
                .ok_or(EdsError::LssFailure("no identity inquiry response"))?;
            if response[0] != command {
                return Err(EdsError::LssFailure("unexpected identity inquiry response"));
            }
            fields[slot] = u32::from_le_bytes([response[1], response[2], response[3], response[4]]);
        }
        Ok(Identity {
            vendor_id: fields[0],
            product_code: fields[1],
            revision_number: fields[2],
            serial_number: fields[3],
        })
    }

    /// Assign a node id to the slave in CONFIGURATION mode.
    pub async fn configure_node_id(&mut self, node_id: u8) -> Result<(), EdsError> {
        let mut session = self.begin();
        let mut request = [0_u8; 8];
        request[0] = cs::CONFIGURE_NODE_ID;
        request[1] = node_id;
        session.send(request);
        let response = session
            .next_response()
            .await
            .ok_or(EdsError::LssFailure("no configure node-id response"))?;
        match (response[0], response[1]) {
            (cs::CONFIGURE_NODE_ID, 0x00) => Ok(()),
            (cs::CONFIGURE_NODE_ID, 0x01) => Err(EdsError::InvalidNodeId { node_id }),
            _ => Err(EdsError::LssFailure("configure node-id refused")),
        }
    }

    /// Binary search the complete identity of a single unconfigured
    /// slave, leaving it in CONFIGURATION mode.
    pub async fn fastscan(&mut self) -> Result<Identity, EdsError> {
        let mut session = self.begin();
        // presence probe
        if session.probe(0, 0x80, 0, 0).await.is_none() {
            return Err(EdsError::LssFailure("no fastscan slave present"));
        }
        let mut fields = [0_u32; 4];
        for sub in 0..4_u8 {
            let next = (sub + 1) & 0x03;
            let mut id_field = 0_u32;
            for bit_check in (1..=31_u8).rev() {
                if session.probe(id_field, bit_check, sub, sub).await.is_none() {
                    id_field |= 1 << bit_check;
                }
            }
            // final bit plus confirmation advancing the slave
            if session.probe(id_field, 0, sub, next).await.is_none() {
                id_field |= 1;
                if session.probe(id_field, 0, sub, next).await.is_none() {
                    return Err(EdsError::LssFailure("fastscan slave stopped responding"));
                }
            }
            debug!("lss: fastscan pinned field {} to 0x{:08X}", sub, id_field);
            fields[sub as usize] = id_field;
        }
        Ok(Identity {
            vendor_id: fields[0],
            product_code: fields[1],
            revision_number: fields[2],
            serial_number: fields[3],
        })
    }
}

struct MasterSession<'d> {
    device: &'d Device,
    responses: UnboundedReceiver<[u8; 8]>,
    timeout: Duration,
}

impl MasterSession<'_> {
    fn send(&self, payload: [u8; 8]) {
        if let Ok(frame) = CanFrame::new(COB_LSS_REQUEST, &payload, false) {
            self.device.transmit_frame(frame);
        }
    }

    async fn next_response(&mut self) -> Option<[u8; 8]> {
        let worker = self.responses.recv().fuse();
        let timeout = Delay::new(self.timeout).fuse();
        pin_mut!(worker, timeout);
        select! {
            frame = worker => frame,
            () = timeout => None,
        }
    }

    /// Send one fastscan probe and await the confirmation.
    async fn probe(&mut self, id_field: u32, bit_check: u8, sub: u8, next: u8) -> Option<()> {
        let mut request = [0_u8; 8];
        request[0] = cs::FASTSCAN;
        request[1..5].clone_from_slice(&id_field.to_le_bytes());
        request[5] = bit_check;
        request[6] = sub;
        request[7] = next;
        self.send(request);
        loop {
            let response = self.next_response().await?;
            if response[0] == cs::FASTSCAN_RESPONSE {
                return Some(());
            }
        }
    }
}

impl Drop for MasterSession<'_> {
    fn drop(&mut self) {
        self.device.clear_lss_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave_with_identity() -> (Lss, ObjectDictionary) {
        let mut od = ObjectDictionary::new();
        od.set_identity(Identity {
            vendor_id: 0xDEAD_BEEF,
            product_code: 0x0000_0001,
            revision_number: 0x1234_5678,
            serial_number: 0xCAFE_0042,
        });
        (Lss::new(true), od)
    }

    fn request(payload: [u8; 8]) -> CanFrame {
        CanFrame::new(COB_LSS_REQUEST, &payload, false).unwrap()
    }

    #[test]
    fn switch_mode_global() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();
        lss.handle_request(&request([0x04, 0x01, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        assert_eq!(lss.mode(), LssMode::Configuration);
        assert!(matches!(
            bus.take_events()[0],
            DeviceEvent::LssChangeMode {
                mode: LssMode::Configuration
            }
        ));
        // unknown mode bytes are ignored
        lss.handle_request(&request([0x04, 0x07, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        assert_eq!(lss.mode(), LssMode::Configuration);
    }

    #[test]
    fn switch_mode_selective_needs_all_four_fields() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();
        let identity = od.identity().unwrap();
        let fields = [
            identity.vendor_id,
            identity.product_code,
            identity.revision_number,
            identity.serial_number,
        ];
        for (slot, value) in fields.iter().enumerate() {
            let mut payload = [0_u8; 8];
            payload[0] = 0x40 + slot as u8;
            payload[1..5].clone_from_slice(&value.to_le_bytes());
            lss.handle_request(&request(payload), &od, &mut bus);
        }
        assert_eq!(lss.mode(), LssMode::Configuration);
        let frames = bus.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), COB_LSS_RESPONSE);
        assert_eq!(frames[0].data()[0], 0x44);
    }

    #[test]
    fn selective_with_wrong_serial_stays_in_operation() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();
        let identity = od.identity().unwrap();
        let fields = [
            identity.vendor_id,
            identity.product_code,
            identity.revision_number,
            identity.serial_number ^ 1,
        ];
        for (slot, value) in fields.iter().enumerate() {
            let mut payload = [0_u8; 8];
            payload[0] = 0x40 + slot as u8;
            payload[1..5].clone_from_slice(&value.to_le_bytes());
            lss.handle_request(&request(payload), &od, &mut bus);
        }
        assert_eq!(lss.mode(), LssMode::Operation);
        assert!(bus.take_frames().is_empty());
    }

    #[test]
    fn inquiry_only_in_configuration_mode() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();
        lss.handle_request(&request([0x5A, 0, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        assert!(bus.take_frames().is_empty());

        lss.handle_request(&request([0x04, 0x01, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        lss.handle_request(&request([0x5A, 0, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        let frames = bus.take_frames();
        assert_eq!(frames[0].data()[0], 0x5A);
        assert_eq!(&frames[0].data()[1..5], &0xDEAD_BEEF_u32.to_le_bytes());
    }

    #[test]
    fn configure_node_id_validates_the_range() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();
        lss.handle_request(&request([0x04, 0x01, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        bus.take_events();

        lss.handle_request(&request([0x11, 0x20, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        assert_eq!(lss.pending_node_id(), Some(0x20));
        let frames = bus.take_frames();
        assert_eq!(&frames[0].data()[..2], &[0x11, 0x00]);
        assert!(matches!(
            bus.take_events()[0],
            DeviceEvent::LssChangeDeviceId { node_id: 0x20 }
        ));

        lss.handle_request(&request([0x11, 0x90, 0, 0, 0, 0, 0, 0]), &od, &mut bus);
        let frames = bus.take_frames();
        assert_eq!(&frames[0].data()[..2], &[0x11, 0x01]);
        assert_eq!(lss.pending_node_id(), Some(0x20));
    }

    #[test]
    fn fastscan_probe_matching() {
        let (mut lss, od) = slave_with_identity();
        let mut bus = Bus::new();

        // presence probe
        lss.handle_request(
            &request([0x51, 0, 0, 0, 0, 0x80, 0, 0]),
            &od,
            &mut bus,
        );
        assert_eq!(bus.take_frames().len(), 1);

        // vendor id 0xDEADBEEF has its top bit set: a probe with the
        // top bit clear stays unanswered
        lss.handle_request(
            &request([0x51, 0, 0, 0, 0, 31, 0, 0]),
            &od,
            &mut bus,
        );
        assert!(bus.take_frames().is_empty());

        let mut payload = [0_u8; 8];
        payload[0] = 0x51;
        payload[1..5].clone_from_slice(&0x8000_0000_u32.to_le_bytes());
        payload[5] = 31;
        lss.handle_request(&request(payload), &od, &mut bus);
        assert_eq!(bus.take_frames().len(), 1);

        // a probe for the wrong sub index is ignored
        let mut payload = [0_u8; 8];
        payload[0] = 0x51;
        payload[6] = 2;
        lss.handle_request(&request(payload), &od, &mut bus);
        assert!(bus.take_frames().is_empty());
    }
}
