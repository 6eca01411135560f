//! SDO end to end scenarios on a loopback device: the node carries
//! both the server and the client parameter records pointing at
//! itself, so every transfer exercises both state machines.

use std::time::Duration;

use cano::od::EntrySpec;
use cano::{AccessType, DataType, Device, DeviceOptions, ObjectType, SdoAbortCode, Value};

fn self_talking_device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Device::new(DeviceOptions {
        id: 0x0A,
        loopback: true,
        ..DeviceOptions::default()
    })
    .unwrap();
    device
        .od_mut(|od| od.add_sdo_client_parameters(0, 0x0A))
        .unwrap();
    device.start();
    device
}

fn pseudo_random_bytes(len: usize) -> Vec<u8> {
    // deterministic xorshift, no RNG dependency needed
    let mut state = 0x1234_5678_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[tokio::test]
async fn expedited_round_trip() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("Setpoint", DataType::Unsigned32, AccessType::ReadWrite),
            )
        })
        .unwrap();

    let mut client = device.sdo(0x0A).unwrap();
    client
        .download(0x2000, 0, &0x12345678_u32.to_le_bytes())
        .await
        .unwrap();
    let uploaded = client.upload(0x2000, 0).await.unwrap();
    assert_eq!(uploaded, 0x12345678_u32.to_le_bytes());
    assert_eq!(
        device.get_value(0x2000).unwrap(),
        Value::Unsigned32(0x12345678)
    );
}

#[tokio::test]
async fn segmented_string_round_trip() {
    let text = "I am a long string that will take multiple messages to transfer";
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x1234,
                EntrySpec::var("Long string", DataType::VisibleString, AccessType::ReadWrite)
                    .with_default(Value::VisibleString(text.to_string())),
            )
        })
        .unwrap();

    let mut client = device.sdo(0x0A).unwrap();
    let uploaded = client.upload(0x1234, 0).await.unwrap();
    assert_eq!(uploaded, text.as_bytes());

    // and back down again
    client.download(0x1234, 0, text.as_bytes()).await.unwrap();
    assert_eq!(
        device.get_value(0x1234).unwrap(),
        Value::VisibleString(text.to_string())
    );
}

#[tokio::test]
async fn segmented_transfer_moves_large_payloads() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x1234,
                EntrySpec {
                    parameter_name: "Blob".to_string(),
                    object_type: Some(ObjectType::Domain),
                    ..EntrySpec::default()
                },
            )
        })
        .unwrap();

    let payload = pseudo_random_bytes(64 * 1024);
    let mut client = device.sdo(0x0A).unwrap();
    client.download(0x1234, 0, &payload).await.unwrap();
    let uploaded = client.upload(0x1234, 0).await.unwrap();
    assert_eq!(uploaded, payload);
}

#[tokio::test]
async fn block_transfer_round_trip() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x1234,
                EntrySpec {
                    parameter_name: "Blob".to_string(),
                    object_type: Some(ObjectType::Domain),
                    ..EntrySpec::default()
                },
            )
        })
        .unwrap();

    let payload = pseudo_random_bytes(65 * 1024);
    let mut client = device.sdo(0x0A).unwrap();
    client.set_block_size(127);
    client.download_block(0x1234, 0, &payload).await.unwrap();
    let uploaded = client.upload_block(0x1234, 0).await.unwrap();
    assert_eq!(uploaded.len(), payload.len());
    assert_eq!(uploaded, payload);
}

#[tokio::test]
async fn block_transfer_small_payload() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("Word", DataType::Unsigned32, AccessType::ReadWrite),
            )
        })
        .unwrap();
    let mut client = device.sdo(0x0A).unwrap();
    client
        .download_block(0x2000, 0, &0xCAFEBABE_u32.to_le_bytes())
        .await
        .unwrap();
    let uploaded = client.upload_block(0x2000, 0).await.unwrap();
    assert_eq!(uploaded, 0xCAFEBABE_u32.to_le_bytes());
}

#[tokio::test]
async fn aborts_surface_the_registry_codes() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2000,
                EntrySpec::var("Fixed", DataType::Unsigned8, AccessType::ReadOnly)
                    .with_default(Value::Unsigned8(7)),
            )
        })
        .unwrap();
    let mut client = device.sdo(0x0A).unwrap();

    let missing = client.upload(0x6000, 0).await.unwrap_err();
    assert_eq!(missing.code, SdoAbortCode::ObjectDoesNotExist);
    assert_eq!(missing.index, 0x6000);

    let missing_sub = client.upload(0x2000, 5).await.unwrap_err();
    assert_eq!(missing_sub.code, SdoAbortCode::SubindexDoesNotExist);

    let read_only = client.download(0x2000, 0, &[1]).await.unwrap_err();
    assert_eq!(read_only.code, SdoAbortCode::WriteReadOnlyError);

    // nothing was committed
    assert_eq!(device.get_value(0x2000).unwrap(), Value::Unsigned8(7));
}

#[tokio::test]
async fn quiet_server_times_out_with_the_protocol_code() {
    let device = self_talking_device();
    // a second client channel towards a node that does not exist
    device
        .od_mut(|od| od.add_sdo_client_parameters(1, 0x0B))
        .unwrap();
    let mut client = device.sdo(0x0B).unwrap();
    client.set_timeout(Duration::from_millis(5));
    let error = client.upload(0x2000, 0).await.unwrap_err();
    assert_eq!(error.code, SdoAbortCode::SdoProtocolTimedOut);
}

#[tokio::test]
async fn failed_download_leaves_no_partial_data() {
    let device = self_talking_device();
    device
        .od_mut(|od| {
            od.add_entry(
                0x2001,
                EntrySpec::var("Short", DataType::Unsigned16, AccessType::ReadWrite)
                    .with_default(Value::Unsigned16(0xAA55)),
            )
        })
        .unwrap();
    let mut client = device.sdo(0x0A).unwrap();
    // a segmented transfer of 100 bytes cannot fit an UNSIGNED16
    let error = client.download(0x2001, 0, &[0x11; 100]).await.unwrap_err();
    assert_eq!(error.code, SdoAbortCode::WrongLength);
    assert_eq!(device.get_value(0x2001).unwrap(), Value::Unsigned16(0xAA55));
}
