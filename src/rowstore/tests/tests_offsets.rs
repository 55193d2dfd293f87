//! Per-source persisted offsets: skips, monotonicity, multiple sources.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;

use crate::bytemap::{ByteMap, Value};
use crate::encoding::TsParams;
use crate::expr::{self, Field};
use crate::rowstore::{Insert, RowStore};
use crate::wal::{DEFAULT_SEGMENT_BYTES, Offset, Wal};

const SEC: i64 = 1_000_000_000;

fn fields() -> Arc<[Field]> {
    vec![Field::new("x", expr::sum("x"))].into()
}

/// Real, ordered offsets come from a real WAL.
fn offsets(n: usize) -> (TempDir, Vec<Offset>) {
    let tmp = TempDir::new().unwrap();
    let wal = Wal::open(tmp.path().join("stream"), DEFAULT_SEGMENT_BYTES).unwrap();
    let offsets = (0..n).map(|_| wal.write(&[b"r"]).unwrap()).collect();
    (tmp, offsets)
}

fn data_insert(offset: Offset, source: u32) -> Insert {
    let key = ByteMap::singleton("a", Value::Int(1)).unwrap();
    let mut vals = BTreeMap::new();
    vals.insert("x".to_string(), 1.0);
    Insert::new(
        key.clone(),
        TsParams::new(SEC, ByteMap::from_floats(&vals).unwrap()),
        key,
        offset,
        source,
    )
}

#[test]
fn skip_advances_the_offset_without_data() {
    let (_tmp, offs) = offsets(1);
    let store = RowStore::new(fields(), SEC);

    assert!(!store.insert(&Insert::skip(offs[0], 0), i64::MIN).unwrap());

    let persisted = store.persisted_offsets().unwrap();
    assert_eq!(persisted.get(&0), Some(&offs[0]));

    let mut rows = 0;
    store.iterate(true, i64::MIN, |_, _| {
        rows += 1;
        true
    })
    .unwrap();
    assert_eq!(rows, 0);
}

#[test]
fn offsets_never_regress() {
    let (_tmp, offs) = offsets(3);
    let store = RowStore::new(fields(), SEC);

    store.insert(&Insert::skip(offs[2], 0), i64::MIN).unwrap();
    // A stale insert (lower offset) must not move the mark backwards.
    store.insert(&data_insert(offs[0], 0), i64::MIN).unwrap();
    store.insert(&Insert::skip(offs[1], 0), i64::MIN).unwrap();

    let persisted = store.persisted_offsets().unwrap();
    assert_eq!(persisted.get(&0), Some(&offs[2]));
}

#[test]
fn mixed_inserts_and_skips_are_monotone() {
    let (_tmp, offs) = offsets(6);
    let store = RowStore::new(fields(), SEC);

    let mut high = Offset::ZERO;
    for (i, off) in offs.iter().enumerate() {
        if i % 2 == 0 {
            store.insert(&data_insert(*off, 0), i64::MIN).unwrap();
        } else {
            store.insert(&Insert::skip(*off, 0), i64::MIN).unwrap();
        }
        let persisted = store.persisted_offsets().unwrap();
        let current = *persisted.get(&0).unwrap();
        assert!(current >= high);
        high = current;
    }
    assert_eq!(high, offs[5]);
}

#[test]
fn sources_are_tracked_independently() {
    let (_tmp, offs) = offsets(2);
    let store = RowStore::new(fields(), SEC);

    store.insert(&data_insert(offs[1], 0), i64::MIN).unwrap();
    store.insert(&Insert::skip(offs[0], 7), i64::MIN).unwrap();

    let persisted = store.persisted_offsets().unwrap();
    assert_eq!(persisted.get(&0), Some(&offs[1]));
    assert_eq!(persisted.get(&7), Some(&offs[0]));
}

#[test]
fn expired_insert_still_advances_the_offset() {
    let (_tmp, offs) = offsets(1);
    let store = RowStore::new(fields(), SEC);

    let truncate_before = 100 * SEC;
    let mut insert = data_insert(offs[0], 0);
    if let Some(tsparams) = &mut insert.tsparams {
        tsparams.ts = truncate_before - 1;
    }
    assert!(!store.insert(&insert, truncate_before).unwrap());
    assert_eq!(store.persisted_offsets().unwrap().get(&0), Some(&offs[0]));
}
