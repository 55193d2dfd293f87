//! Tests for time/length primitives and raw insert framing.

use std::collections::BTreeMap;

use crate::bytemap::{ByteMap, Value};
use crate::encoding::*;

// ------------------------------------------------------------------------------------------------
// Time
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_time() {
    let mut buf = [0u8; TIME_SIZE];
    encode_time(&mut buf, 1_700_000_000_123_456_789);
    assert_eq!(time_from_bytes(&buf).unwrap(), 1_700_000_000_123_456_789);
}

#[test]
fn roundtrip_negative_time() {
    // Pre-epoch timestamps are legal i64 nanos.
    let mut buf = [0u8; TIME_SIZE];
    encode_time(&mut buf, -42);
    assert_eq!(time_from_bytes(&buf).unwrap(), -42);
}

#[test]
fn time_is_big_endian() {
    let mut buf = [0u8; TIME_SIZE];
    encode_time(&mut buf, 1);
    assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 1]);
}

#[test]
fn time_from_short_buffer_fails() {
    let err = time_from_bytes(&[0u8; 4]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}

// ------------------------------------------------------------------------------------------------
// Length prefixes and split
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_u32() {
    let mut buf = [0u8; LEN_SIZE];
    write_u32(&mut buf, 0xDEAD_BEEF);
    assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]); // big-endian
    assert_eq!(read_u32(&buf).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn split_is_non_copying() {
    let buf = [1u8, 2, 3, 4, 5];
    let (head, tail) = split(&buf, 2).unwrap();
    assert_eq!(head, &[1, 2]);
    assert_eq!(tail, &[3, 4, 5]);
    assert_eq!(head.as_ptr(), buf.as_ptr());
}

#[test]
fn split_past_end_fails() {
    let err = split(&[1u8, 2], 3).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEof {
            needed: 3,
            available: 2
        }
    ));
}

// ------------------------------------------------------------------------------------------------
// Bucketing
// ------------------------------------------------------------------------------------------------

#[test]
fn bucket_start_truncates_down() {
    assert_eq!(bucket_start(1_500, 1_000), 1_000);
    assert_eq!(bucket_start(1_000, 1_000), 1_000);
    assert_eq!(bucket_start(999, 1_000), 0);
    // Negative times bucket toward negative infinity, not zero.
    assert_eq!(bucket_start(-1, 1_000), -1_000);
}

// ------------------------------------------------------------------------------------------------
// Raw insert framing
// ------------------------------------------------------------------------------------------------

fn dims_fixture() -> ByteMap {
    let mut m = BTreeMap::new();
    m.insert("host".to_string(), Value::Str("web-1".into()));
    m.insert("region".to_string(), Value::Str("eu".into()));
    ByteMap::new(&m).unwrap()
}

#[test]
fn frame_roundtrip_preserves_everything() {
    let dims = dims_fixture();
    let vals = ByteMap::singleton("x", Value::Float(2.5)).unwrap();

    let framed = frame_insert(1_000, dims.as_bytes(), vals.as_bytes());
    let raw = unframe_insert(&framed).unwrap().unwrap();

    assert_eq!(raw.ts, 1_000);
    assert_eq!(raw.dims, dims.as_bytes());
    assert_eq!(raw.vals, vals.as_bytes());
}

#[test]
fn empty_record_is_a_no_op() {
    assert!(unframe_insert(&[]).unwrap().is_none());
}

#[test]
fn frame_with_empty_maps_roundtrips() {
    let framed = frame_insert(7, &[], &[]);
    let raw = unframe_insert(&framed).unwrap().unwrap();
    assert_eq!(raw.ts, 7);
    assert!(raw.dims.is_empty());
    assert!(raw.vals.is_empty());
}

#[test]
fn truncated_frame_fails() {
    let dims = dims_fixture();
    let framed = frame_insert(1_000, dims.as_bytes(), &[]);
    let err = unframe_insert(&framed[..framed.len() - 5]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
}
