//! Device level scenarios: PDO round trips, EMCY history and inhibit
//! timing, heartbeat consumption, SYNC counter sequence.

use std::time::{Duration, Instant};

use cano::frame::CanFrame;
use cano::od::EntrySpec;
use cano::{
    AccessType, DataType, Device, DeviceEvent, DeviceOptions, NmtState, Value,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn loopback_device() -> Device {
    let device = Device::new(DeviceOptions {
        id: 0x0A,
        loopback: true,
        ..DeviceOptions::default()
    })
    .unwrap();
    device
}

fn drain_events(events: &mut UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn drain_frames(frames: &mut UnboundedReceiver<CanFrame>) -> Vec<CanFrame> {
    let mut drained = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        drained.push(frame);
    }
    drained
}

#[test]
fn event_driven_pdo_round_trip() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("Mapped", DataType::Unsigned8, AccessType::ReadWrite)
                    .with_pdo_mapping(),
            )?;
            od.add_transmit_pdo(0x180, 254, 0, 0, 0, &[(0x2000, 0, 8)])?;
            od.add_receive_pdo(0x180, 255, &[(0x2000, 0, 8)])
        })
        .unwrap();
    let mut events = device.events().unwrap();
    let mut frames = device.frames().unwrap();
    device.start();
    drain_events(&mut events);
    drain_frames(&mut frames);

    device.set_value(0x2000, Value::Unsigned8(1)).unwrap();

    let sent: Vec<CanFrame> = drain_frames(&mut frames)
        .into_iter()
        .filter(|frame| frame.id() == 0x180)
        .collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data(), &[1]);

    let pdo_events: Vec<DeviceEvent> = drain_events(&mut events)
        .into_iter()
        .filter(|event| matches!(event, DeviceEvent::Pdo { .. }))
        .collect();
    assert_eq!(pdo_events.len(), 1);
    match &pdo_events[0] {
        DeviceEvent::Pdo { cob_id, entries } => {
            assert_eq!(*cob_id, 0x180);
            assert_eq!(entries, &vec![(0x2000, 0)]);
        }
        _ => unreachable!(),
    }
    assert_eq!(device.get_value(0x2000).unwrap(), Value::Unsigned8(1));
}

#[test]
fn pdo_reception_updates_the_dictionary() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("A", DataType::Unsigned8, AccessType::ReadWrite)
                    .with_pdo_mapping(),
            )?;
            od.add_entry(
                0x2001,
                EntrySpec::var("B", DataType::Unsigned16, AccessType::ReadWrite)
                    .with_pdo_mapping(),
            )?;
            od.add_receive_pdo(0x20A, 255, &[(0x2000, 0, 8), (0x2001, 0, 16)])
        })
        .unwrap();
    device.start();

    let frame = CanFrame::new(0x20A, &[0xAB, 0x34, 0x12], false).unwrap();
    device.receive(frame);
    assert_eq!(device.get_value(0x2000).unwrap(), Value::Unsigned8(0xAB));
    assert_eq!(device.get_value(0x2001).unwrap(), Value::Unsigned16(0x1234));
}

#[test]
fn emcy_history_keeps_the_latest_two() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.configure_error_history(2)?;
            od.set_emcy_cob_id(0x08A);
            Ok::<(), cano::EdsError>(())
        })
        .unwrap();
    device.start();

    device.emcy_write(0x1000, None).unwrap();
    device.emcy_write(0x2000, None).unwrap();
    device.emcy_write(0x3000, None).unwrap();

    assert_eq!(
        device.get_value_array(0x1003, 1).unwrap(),
        Value::Unsigned32(0x3000)
    );
    assert_eq!(
        device.get_value_array(0x1003, 2).unwrap(),
        Value::Unsigned32(0x2000)
    );
    assert_eq!(
        device.get_value_array(0x1003, 0).unwrap(),
        Value::Unsigned8(2)
    );
}

#[test]
fn emcy_inhibit_time_paces_the_bus() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.configure_error_history(8)?;
            od.set_emcy_cob_id(0x08A);
            od.set_emcy_inhibit_time(10); // 1 ms
            Ok::<(), cano::EdsError>(())
        })
        .unwrap();
    let mut frames = device.frames().unwrap();
    device.start();
    drain_frames(&mut frames);

    let t0 = Instant::now();
    device.emcy_write(0x1000, None).unwrap();
    device.emcy_write(0x2000, None).unwrap();

    let emcy_frames = |frames: &mut UnboundedReceiver<CanFrame>| {
        drain_frames(frames)
            .into_iter()
            .filter(|frame| frame.id() == 0x08A)
            .count()
    };
    // only the first passes immediately
    assert_eq!(emcy_frames(&mut frames), 1);

    device.poll(t0 + Duration::from_micros(200));
    assert_eq!(emcy_frames(&mut frames), 0);

    device.poll(t0 + Duration::from_millis(2));
    assert_eq!(emcy_frames(&mut frames), 1);
}

#[test]
fn heartbeat_consumer_reports_the_silence() {
    let device = loopback_device();
    device
        .od_mut(|od| od.add_heartbeat_consumer(0x0B, 100))
        .unwrap();
    let mut events = device.events().unwrap();
    device.start();
    drain_events(&mut events);

    let t0 = Instant::now();
    let beat = CanFrame::new(0x70B, &[0x05], false).unwrap();
    device.receive(beat);
    let received = drain_events(&mut events);
    assert!(received.iter().any(|event| matches!(
        event,
        DeviceEvent::Heartbeat {
            node_id: 0x0B,
            state: NmtState::Operational
        }
    )));

    // silence must be reported within 1.5 * consumer time
    device.poll(t0 + Duration::from_millis(150));
    let received = drain_events(&mut events);
    assert!(received
        .iter()
        .any(|event| matches!(event, DeviceEvent::HeartbeatTimeout { node_id: 0x0B })));
}

#[test]
fn heartbeat_producer_broadcasts_the_state() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.set_heartbeat_producer_time(50);
            Ok::<(), cano::EdsError>(())
        })
        .unwrap();
    let mut frames = device.frames().unwrap();
    device.start();
    let boot = drain_frames(&mut frames);
    assert_eq!(boot[0].id(), 0x70A);
    assert_eq!(boot[0].data(), &[0x00]);

    let t0 = Instant::now();
    device.poll(t0 + Duration::from_millis(51));
    let beats = drain_frames(&mut frames);
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].data(), &[u8::from(NmtState::PreOperational)]);
}

#[test]
fn sync_counter_wraps_at_the_overflow() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.set_sync_cob_id(0x080, true);
            od.set_sync_overflow(3)
        })
        .unwrap();
    let mut frames = device.frames().unwrap();
    let mut events = device.events().unwrap();
    device.start();
    drain_frames(&mut frames);

    for _ in 0..5 {
        device.sync_write().unwrap();
    }
    let counters: Vec<u8> = drain_frames(&mut frames)
        .into_iter()
        .filter(|frame| frame.id() == 0x080)
        .map(|frame| frame.data()[0])
        .collect();
    assert_eq!(counters, vec![1, 2, 3, 1, 2]);

    // the loopback consumer raises one sync event per frame
    let sync_counts: Vec<Option<u8>> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DeviceEvent::Sync { count } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(
        sync_counts,
        vec![Some(1), Some(2), Some(3), Some(1), Some(2)]
    );
}

#[test]
fn synchronous_pdo_transmits_on_the_divisor() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.set_sync_cob_id(0x080, true);
            od.add_entry(
                0x2000,
                EntrySpec::var("Mapped", DataType::Unsigned8, AccessType::ReadWrite)
                    .with_pdo_mapping(),
            )?;
            // every second SYNC
            od.add_transmit_pdo(0x18A, 2, 0, 0, 0, &[(0x2000, 0, 8)])
        })
        .unwrap();
    let mut frames = device.frames().unwrap();
    device.start();
    drain_frames(&mut frames);

    for _ in 0..4 {
        device.sync_write().unwrap();
    }
    let pdo_count = drain_frames(&mut frames)
        .into_iter()
        .filter(|frame| frame.id() == 0x18A)
        .count();
    assert_eq!(pdo_count, 2);
}

#[test]
fn scale_factor_presents_the_scaled_view() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("Scaled", DataType::Integer16, AccessType::ReadWrite)
                    .with_scale(0.1),
            )
        })
        .unwrap();
    device.set_value(0x2000, Value::Real64(5.0)).unwrap();
    // the API presents the scaled view, storage is the raw value
    assert_eq!(device.get_value(0x2000).unwrap(), Value::Real64(5.0));
    assert_eq!(
        device.od(|od| od.get_raw(0x2000, 0)).unwrap(),
        vec![50, 0]
    );
}

#[test]
fn stop_is_idempotent_and_silences_the_producers() {
    let device = loopback_device();
    device
        .od_mut(|od| {
            od.set_heartbeat_producer_time(10);
            Ok::<(), cano::EdsError>(())
        })
        .unwrap();
    let mut frames = device.frames().unwrap();
    device.start();
    drain_frames(&mut frames);
    device.stop();
    device.stop();
    device.poll(Instant::now() + Duration::from_millis(100));
    assert!(drain_frames(&mut frames).is_empty());
    assert!(device.next_deadline().is_none());
}
