//! Malformed buffers, ordering violations, and empty maps.

use crate::bytemap::{ByteMap, ByteMapError, Value};

#[test]
fn empty_map_has_no_entries() {
    let m = ByteMap::empty();
    assert!(m.is_empty());
    assert_eq!(m.iter().count(), 0);
    assert_eq!(m.get("anything"), None);
    assert_eq!(m.as_bytes().len(), 0);
}

#[test]
fn from_sorted_rejects_out_of_order_names() {
    let err = ByteMap::from_sorted_keys_and_values(
        &["b", "a"],
        &[Value::Int(1), Value::Int(2)],
    )
    .unwrap_err();
    assert!(matches!(err, ByteMapError::OutOfOrder { .. }));
}

#[test]
fn from_sorted_rejects_duplicate_names() {
    let err = ByteMap::from_sorted_keys_and_values(
        &["a", "a"],
        &[Value::Int(1), Value::Int(2)],
    )
    .unwrap_err();
    assert!(matches!(err, ByteMapError::OutOfOrder { .. }));
}

#[test]
fn from_bytes_rejects_truncated_entry() {
    let m = ByteMap::singleton("key", Value::Int(42)).unwrap();
    let bytes = m.as_bytes();
    let err = ByteMap::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
    assert!(matches!(err, ByteMapError::Truncated(_)));
}

#[test]
fn from_bytes_rejects_unknown_tag() {
    let m = ByteMap::singleton("k", Value::Bool(true)).unwrap();
    let mut bytes = m.as_bytes().to_vec();
    // The tag byte sits right after the 2-byte length and 1-byte key.
    bytes[3] = 0xEE;
    let err = ByteMap::from_bytes(&bytes).unwrap_err();
    assert!(matches!(err, ByteMapError::InvalidTag { tag: 0xEE, .. }));
}

#[test]
fn from_bytes_rejects_unsorted_entries() {
    let a = ByteMap::singleton("a", Value::Int(1)).unwrap();
    let b = ByteMap::singleton("b", Value::Int(2)).unwrap();
    let mut swapped = b.as_bytes().to_vec();
    swapped.extend_from_slice(a.as_bytes());
    let err = ByteMap::from_bytes(&swapped).unwrap_err();
    assert!(matches!(err, ByteMapError::OutOfOrder { .. }));
}

#[test]
fn oversized_item_is_rejected() {
    let huge = "x".repeat(70_000);
    let err = ByteMap::singleton(&huge, Value::Int(1)).unwrap_err();
    assert!(matches!(err, ByteMapError::ItemTooLarge(_)));

    let err = ByteMap::singleton("k", Value::Str(huge)).unwrap_err();
    assert!(matches!(err, ByteMapError::ItemTooLarge(_)));
}

#[test]
fn non_numeric_values_do_not_coerce() {
    let m = ByteMap::singleton("s", Value::Str("not a number".into())).unwrap();
    assert_eq!(m.get_float("s"), None);
    assert_eq!(m.get("s").unwrap().as_f64(), None);
}

#[test]
fn slice_with_no_matches_is_empty() {
    let m = ByteMap::singleton("a", Value::Int(1)).unwrap();
    assert!(m.slice(&["zzz".to_string()]).is_empty());
}
