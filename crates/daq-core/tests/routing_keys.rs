//! Keys, dtypes and error codes as seen from the decoder crates.

use daq_core::telemetry::{self, TelemetryError};
use daq_core::{BufferKey, ChannelKey, DType, PacketError, Scalar, StorageError};
use std::collections::BTreeMap;

#[test]
fn test_channel_keys_sort_by_stream_then_card() {
    let keys = [
        ChannelKey::new(2, 0x10, 0),
        ChannelKey::new(1, 0x11, 1),
        ChannelKey::new(1, 0x10, 3),
    ];
    let mut packed: Vec<u64> = keys.iter().map(|k| k.pack()).collect();
    packed.sort_unstable();
    let unpacked: Vec<ChannelKey> = packed.into_iter().map(ChannelKey::unpack).collect();

    let mut sorted = keys.to_vec();
    sorted.sort();
    assert_eq!(unpacked, sorted);
    assert_eq!(sorted[0].to_string(), "1:0x0010:3");
}

#[test]
fn test_buffer_keys_index_a_map() {
    let mut rows: BTreeMap<BufferKey, usize> = BTreeMap::new();
    for key in [
        BufferKey::from(ChannelKey::new(1, 0x10, 0)),
        BufferKey::Summary(1),
        BufferKey::Any,
        BufferKey::from(ChannelKey::new(1, 0x10, 0)),
    ] {
        *rows.entry(key).or_default() += 1;
    }
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[&BufferKey::Id(0x0001_0010_0000)], 2);
    assert_eq!(rows.keys().next(), Some(&BufferKey::Any));
}

#[test]
fn test_dtype_serde_names_match_display() {
    for dtype in DType::ALL {
        let json = serde_json::to_string(&dtype).unwrap();
        assert_eq!(json, format!("\"{}\"", dtype));
        assert_eq!(serde_json::from_str::<DType>(&json).unwrap(), dtype);
    }
    assert_eq!(DType::F32.size_of(), 4);
}

#[test]
fn test_scalar_casts() {
    assert_eq!(Scalar::Int(-1).as_u64(), u64::MAX);
    assert_eq!(Scalar::Float(2.75).as_i64(), 2);
    assert_eq!(Scalar::Bool(true).as_f64(), 1.0);
    assert!(!Scalar::UInt(0).as_bool());
}

#[test]
fn test_storage_errors_become_packet_errors() {
    let err: PacketError = StorageError::RowOutOfRange { row: 9, capacity: 8 }.into();
    assert_eq!(err.code(), 13);
    assert!(err.to_string().contains("row 9 is out of range"));
}

#[test]
fn test_telemetry_rejects_unknown_level() {
    let err = telemetry::init("verbose").unwrap_err();
    assert!(matches!(err, TelemetryError::InvalidLevel(_)));
    assert!(err.to_string().contains("verbose"));
    assert_eq!(telemetry::parse_log_level("WARN").unwrap(), tracing::Level::WARN);
}
