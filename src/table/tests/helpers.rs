//! Shared scaffolding for table tests: fixtures and ingest polling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bytemap::{ByteMap, Value};
use crate::expr::{self, Field};
use crate::rowstore::MemoryCap;
use crate::table::{Clock, Point, Table, TableOpts, TableStats};

pub const SEC: i64 = 1_000_000_000;
pub const HOUR: i64 = 3_600 * SEC;

/// One summed field `x` at 1s resolution, 1h retention.
pub fn opts(name: &str) -> TableOpts {
    let mut opts = TableOpts::new(name, "events", vec![Field::new("x", expr::sum("x"))]);
    opts.resolution = SEC;
    opts.retention = HOUR;
    opts
}

pub fn table(opts: &TableOpts) -> Arc<Table> {
    Table::new(
        opts,
        Arc::new(Clock::new()),
        Arc::new(MemoryCap::new(0)),
        None,
        false,
    )
}

pub fn point(ts: i64, a: i64, x: f64) -> Point {
    let mut point = Point::default();
    point.ts = ts;
    point.dims.insert("a".to_string(), Value::Int(a));
    point.vals.insert("x".to_string(), x);
    point
}

pub fn dims_map(a: i64) -> ByteMap {
    ByteMap::singleton("a", Value::Int(a)).unwrap()
}

pub fn vals_map(x: f64) -> ByteMap {
    ByteMap::from_floats(&BTreeMap::from([("x".to_string(), x)])).unwrap()
}

/// Polls until the stats snapshot satisfies `predicate` or five seconds
/// elapse. Ingest is asynchronous, so assertions on counters go through
/// here.
pub fn wait_for_stats(table: &Table, predicate: impl Fn(&TableStats) -> bool) -> TableStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = table.stats();
        if predicate(&stats) {
            return stats;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for stats, last snapshot: {stats:?}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Collects `(key bytes, bucket-0-of-ts value)` rows via merged iteration.
pub fn collect_sums(table: &Table) -> Vec<(Vec<u8>, Vec<Option<f64>>)> {
    let fields = table.fields();
    let mut rows = Vec::new();
    table
        .iterate(true, |key, sequences| {
            let values = fields
                .iter()
                .zip(sequences.iter())
                .map(|(f, s)| {
                    (0..s.num_periods(f.expr.encoded_width()))
                        .find_map(|p| s.value_at(p, f.expr.as_ref()))
                })
                .collect();
            rows.push((key.as_bytes().to_vec(), values));
            true
        })
        .unwrap();
    rows
}
