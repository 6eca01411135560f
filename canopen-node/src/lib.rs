//! # cano - a CANopen protocol engine
//!
//! Device side implementation of the CiA-301 communication objects,
//! multiplexing a single CAN link:
//!
//! - an [`od::ObjectDictionary`] with typed value codecs and change
//!   notifications driving live reconfiguration
//! - SDO server and client with expedited, segmented and block
//!   transfers ([`sdo`])
//! - the PDO mapping and packing engine with all four transmission
//!   types ([`pdo`])
//! - NMT state machine with heartbeat producer and consumer ([`nmt`])
//! - EMCY producer with inhibit timing and history, and consumer
//!   ([`emcy`])
//! - SYNC and TIME producers/consumers ([`sync`], [`time`])
//! - LSS slave and master including fastscan ([`lss`])
//!
//! The physical CAN driver stays outside: feed inbound frames to
//! [`Device::receive`], ship outbound frames from the channel returned
//! by [`Device::frames`], and drive timers with [`Device::poll`]. The
//! engine is single threaded and cooperative; the asynchronous client
//! calls (SDO transfers, LSS services) carry explicit timeouts and run
//! on any current-thread executor.
//!
//! # Example
//!
//! A loopback device answering its own SDO request:
//!
//! ```
//! use cano::od::EntrySpec;
//! use cano::{AccessType, DataType, Device, DeviceOptions, Value};
//!
//! let my_future = async {
//!     let device = Device::new(DeviceOptions {
//!         id: 0x0A,
//!         loopback: true,
//!         ..DeviceOptions::default()
//!     })
//!     .unwrap();
//!     device
//!         .od_mut(|od| {
//!             od.add_entry(
//!                 0x2000,
//!                 EntrySpec::var("Setpoint", DataType::Unsigned32, AccessType::ReadWrite),
//!             )?;
//!             od.add_sdo_client_parameters(0, 0x0A)
//!         })
//!         .unwrap();
//!     device.start();
//!
//!     let mut client = device.sdo(0x0A).unwrap();
//!     client
//!         .download(0x2000, 0, &0x12345678_u32.to_le_bytes())
//!         .await
//!         .unwrap();
//!     assert_eq!(
//!         device.get_value(0x2000).unwrap(),
//!         Value::Unsigned32(0x12345678)
//!     );
//! };
//! # futures::executor::block_on(my_future);
//! ```

#[macro_use]
extern crate enum_display_derive;

pub mod data_type;
pub mod device;
pub mod emcy;
pub mod error;
pub mod frame;
pub mod lss;
pub mod nmt;
mod node;
pub mod od;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod time;

pub use data_type::{DataType, Value};
pub use device::{Device, DeviceEvent, DeviceOptions};
pub use error::{EdsError, SdoError, ValueError};
pub use frame::{CanFrame, FrameType};
pub use lss::LssMode;
pub use nmt::{NmtCommand, NmtState};
pub use od::{AccessType, EntrySpec, Identity, ObjectDictionary, ObjectType};
pub use sdo::SdoAbortCode;
