//! Append, replay, offset resume, and reopen.

use tempfile::TempDir;

use crate::wal::{DEFAULT_SEGMENT_BYTES, Offset, Wal};

fn open(dir: &TempDir) -> Wal {
    Wal::open(dir.path().join("stream"), DEFAULT_SEGMENT_BYTES).unwrap()
}

/// Drain every record currently in the log without blocking forever.
fn drain(wal: &Wal) -> Vec<Vec<u8>> {
    wal.close().unwrap();
    let mut reader = wal.reader().unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.read().unwrap() {
        records.push(record);
    }
    records
}

#[test]
fn single_record_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    wal.write(&[b"hello"]).unwrap();
    assert_eq!(drain(&wal), vec![b"hello".to_vec()]);
}

#[test]
fn chunks_concatenate_into_one_record() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    wal.write(&[b"head", b"-", b"tail"]).unwrap();
    assert_eq!(drain(&wal), vec![b"head-tail".to_vec()]);
}

#[test]
fn records_replay_in_append_order() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    for i in 0..10u8 {
        wal.write(&[&[i]]).unwrap();
    }
    let records = drain(&wal);
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record, &vec![i as u8]);
    }
}

#[test]
fn empty_record_is_preserved() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    wal.write(&[]).unwrap();
    wal.write(&[b"data"]).unwrap();

    let records = drain(&wal);
    assert_eq!(records, vec![Vec::new(), b"data".to_vec()]);
}

#[test]
fn offsets_are_monotonic() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    let a = wal.write(&[b"a"]).unwrap();
    let b = wal.write(&[b"b"]).unwrap();
    assert!(b > a);
    assert!(a > Offset::ZERO);
}

#[test]
fn reader_at_resumes_after_the_stored_offset() {
    let tmp = TempDir::new().unwrap();
    let wal = open(&tmp);

    wal.write(&[b"first"]).unwrap();
    wal.write(&[b"second"]).unwrap();
    wal.write(&[b"third"]).unwrap();
    wal.close().unwrap();

    // Read two records, remember the offset.
    let mut reader = wal.reader().unwrap();
    assert_eq!(reader.read().unwrap().unwrap(), b"first");
    assert_eq!(reader.read().unwrap().unwrap(), b"second");
    let resume = reader.offset();

    // A fresh reader at that offset sees only what followed.
    let mut resumed = wal.reader_at(resume).unwrap();
    assert_eq!(resumed.read().unwrap().unwrap(), b"third");
    assert!(resumed.read().unwrap().is_none());
}

#[test]
fn reopen_preserves_records() {
    let tmp = TempDir::new().unwrap();
    {
        let wal = open(&tmp);
        wal.write(&[b"persisted"]).unwrap();
        wal.close().unwrap();
    }
    let wal = open(&tmp);
    assert_eq!(drain(&wal), vec![b"persisted".to_vec()]);
}

#[test]
fn reopen_appends_after_existing_records() {
    let tmp = TempDir::new().unwrap();
    {
        let wal = open(&tmp);
        wal.write(&[b"one"]).unwrap();
        wal.close().unwrap();
    }
    let wal = open(&tmp);
    wal.write(&[b"two"]).unwrap();
    assert_eq!(drain(&wal), vec![b"one".to_vec(), b"two".to_vec()]);
}
