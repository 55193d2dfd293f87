//! Insert, merge-per-key, and retention degradation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bytemap::{ByteMap, Value};
use crate::encoding::TsParams;
use crate::expr::{self, Field};
use crate::rowstore::{Insert, RowStore};
use crate::wal::Offset;

const SEC: i64 = 1_000_000_000;

fn fields() -> Arc<[Field]> {
    vec![
        Field::new("x", expr::sum("x")),
        Field::new("x_max", expr::max("x")),
    ]
    .into()
}

fn key(name: &str) -> ByteMap {
    ByteMap::singleton("host", Value::Str(name.into())).unwrap()
}

fn insert_at(ts: i64, host: &str, x: f64) -> Insert {
    let mut vals = BTreeMap::new();
    vals.insert("x".to_string(), x);
    let k = key(host);
    Insert::new(
        k.clone(),
        TsParams::new(ts, ByteMap::from_floats(&vals).unwrap()),
        k,
        Offset::ZERO,
        0,
    )
}

fn collect(store: &RowStore) -> Vec<(ByteMap, Vec<Option<f64>>)> {
    let fields = fields();
    let mut rows = Vec::new();
    store
        .iterate(true, i64::MIN, |key, sequences| {
            let values: Vec<Option<f64>> = fields
                .iter()
                .zip(sequences.iter())
                .map(|(f, s)| s.value_at(0, f.expr.as_ref()))
                .collect();
            rows.push((key.clone(), values));
            true
        })
        .unwrap();
    rows
}

#[test]
fn insert_then_iterate_yields_the_row() {
    let store = RowStore::new(fields(), SEC);
    assert!(store.insert(&insert_at(1_000, "web-1", 2.5), i64::MIN).unwrap());

    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, key("web-1"));
    assert_eq!(rows[0].1, vec![Some(2.5), Some(2.5)]);
}

#[test]
fn same_key_merges_into_one_row() {
    let store = RowStore::new(fields(), SEC);
    store.insert(&insert_at(100, "web-1", 1.0), i64::MIN).unwrap();
    store.insert(&insert_at(200, "web-1", 2.0), i64::MIN).unwrap();

    let rows = collect(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, vec![Some(3.0), Some(2.0)]);
}

#[test]
fn distinct_keys_stay_distinct_and_sorted() {
    let store = RowStore::new(fields(), SEC);
    store.insert(&insert_at(100, "zulu", 1.0), i64::MIN).unwrap();
    store.insert(&insert_at(100, "alpha", 2.0), i64::MIN).unwrap();

    let rows = collect(&store);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, key("alpha"));
    assert_eq!(rows[1].0, key("zulu"));
}

#[test]
fn expired_point_degrades_to_a_skip() {
    let store = RowStore::new(fields(), SEC);
    let truncate_before = 10 * SEC;

    assert!(!store
        .insert(&insert_at(truncate_before - 1, "web-1", 9.0), truncate_before)
        .unwrap());
    assert_eq!(collect(&store).len(), 0);

    assert!(store
        .insert(&insert_at(truncate_before, "web-1", 1.0), truncate_before)
        .unwrap());
    assert_eq!(collect(&store).len(), 1);
}

#[test]
fn mem_bytes_grow_with_inserts() {
    let store = RowStore::new(fields(), SEC);
    assert_eq!(store.mem_store_bytes(), 0);

    store.insert(&insert_at(100, "web-1", 1.0), i64::MIN).unwrap();
    let after_one = store.mem_store_bytes();
    assert!(after_one > 0);

    store.insert(&insert_at(100, "web-2", 1.0), i64::MIN).unwrap();
    assert!(store.mem_store_bytes() > after_one);
}

#[test]
fn early_termination_stops_iteration() {
    let store = RowStore::new(fields(), SEC);
    for host in ["a", "b", "c"] {
        store.insert(&insert_at(100, host, 1.0), i64::MIN).unwrap();
    }
    let mut seen = 0;
    store
        .iterate(true, i64::MIN, |_, _| {
            seen += 1;
            false
        })
        .unwrap();
    assert_eq!(seen, 1);
}
