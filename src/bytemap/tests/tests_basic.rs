//! Construction, lookup, slicing, and the byte-determinism contract.

use std::collections::BTreeMap;

use crate::bytemap::{ByteMap, Value};

fn map(entries: &[(&str, Value)]) -> ByteMap {
    let tree: BTreeMap<String, Value> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    ByteMap::new(&tree).unwrap()
}

// ------------------------------------------------------------------------------------------------
// Construction and lookup
// ------------------------------------------------------------------------------------------------

#[test]
fn get_returns_stored_values() {
    let m = map(&[
        ("host", Value::Str("web-1".into())),
        ("port", Value::Int(443)),
        ("rate", Value::Float(0.5)),
        ("up", Value::Bool(true)),
    ]);

    assert_eq!(m.get("host"), Some(Value::Str("web-1".into())));
    assert_eq!(m.get("port"), Some(Value::Int(443)));
    assert_eq!(m.get("rate"), Some(Value::Float(0.5)));
    assert_eq!(m.get("up"), Some(Value::Bool(true)));
    assert_eq!(m.get("missing"), None);
}

#[test]
fn get_float_coerces_ints() {
    let m = map(&[("a", Value::Int(7)), ("b", Value::Float(2.5))]);
    assert_eq!(m.get_float("a"), Some(7.0));
    assert_eq!(m.get_float("b"), Some(2.5));
    assert_eq!(m.get_float("missing"), None);
}

#[test]
fn iteration_is_key_ordered() {
    let m = map(&[
        ("zeta", Value::Int(1)),
        ("alpha", Value::Int(2)),
        ("mid", Value::Int(3)),
    ]);
    let keys: Vec<&str> = m.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
}

// ------------------------------------------------------------------------------------------------
// Byte determinism — the wire contract
// ------------------------------------------------------------------------------------------------

#[test]
fn equal_logical_maps_are_byte_equal() {
    // Two maps built from differently ordered inputs.
    let mut a = BTreeMap::new();
    a.insert("x".to_string(), Value::Int(1));
    a.insert("y".to_string(), Value::Str("s".into()));

    let mut b = BTreeMap::new();
    b.insert("y".to_string(), Value::Str("s".into()));
    b.insert("x".to_string(), Value::Int(1));

    let ma = ByteMap::new(&a).unwrap();
    let mb = ByteMap::new(&b).unwrap();
    assert_eq!(ma.as_bytes(), mb.as_bytes());
    assert_eq!(ma, mb);
}

#[test]
fn from_sorted_keys_and_values_matches_btree_construction() {
    let via_tree = map(&[("a", Value::Int(1)), ("b", Value::Str("v".into()))]);
    let via_sorted = ByteMap::from_sorted_keys_and_values(
        &["a", "b"],
        &[Value::Int(1), Value::Str("v".into())],
    )
    .unwrap();
    assert_eq!(via_tree.as_bytes(), via_sorted.as_bytes());
}

#[test]
fn wire_roundtrip() {
    let m = map(&[
        ("bytes", Value::Bytes(vec![0, 1, 2])),
        ("fv", Value::FloatVec(vec![1.0, 2.0])),
        ("iv", Value::IntVec(vec![-1, 5])),
        ("s", Value::Str("str".into())),
    ]);
    let decoded = ByteMap::from_bytes(m.as_bytes()).unwrap();
    assert_eq!(decoded, m);
    assert_eq!(decoded.get("fv"), Some(Value::FloatVec(vec![1.0, 2.0])));
    assert_eq!(decoded.get("iv"), Some(Value::IntVec(vec![-1, 5])));
}

// ------------------------------------------------------------------------------------------------
// Slicing
// ------------------------------------------------------------------------------------------------

#[test]
fn slice_keeps_requested_keys_in_entry_order() {
    let m = map(&[
        ("a", Value::Int(1)),
        ("b", Value::Int(2)),
        ("c", Value::Int(3)),
    ]);
    // Requested keys out of order; output stays sorted by entry order.
    let sliced = m.slice(&["c".to_string(), "a".to_string()]);
    let keys: Vec<&str> = sliced.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a", "c"]);
    assert_eq!(sliced.get("b"), None);
}

#[test]
fn slice_of_equal_maps_is_byte_equal() {
    let m1 = map(&[("a", Value::Str("x".into())), ("b", Value::Int(9))]);
    let m2 = map(&[("b", Value::Int(8)), ("a", Value::Str("x".into()))]);
    let keys = vec!["a".to_string()];
    assert_eq!(m1.slice(&keys).as_bytes(), m2.slice(&keys).as_bytes());
}

#[test]
fn singleton_has_one_entry() {
    let m = ByteMap::singleton("x", Value::Float(3.5)).unwrap();
    assert_eq!(m.iter().count(), 1);
    assert_eq!(m.get_float("x"), Some(3.5));
}
