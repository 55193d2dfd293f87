//! # Table Module
//!
//! A table is one materialized view over a stream: it owns a `WHERE`
//! predicate, a group-by list, an optional follower partition predicate,
//! its native resolution and retention, a bounded insert channel, and the
//! row store the ingest pipeline feeds.
//!
//! ## Ingest pipeline
//!
//! ```text
//!             stream WAL ──► reader thread ──► wal_reads ─┐
//!                                                         ├─► inserter ──► row store
//!  direct Insert(point) ──► WHERE + regroup ──► inserts ──┘    thread
//! ```
//!
//! One reader thread per `(table, stream)` tails the shared stream WAL and
//! forwards raw records; a single inserter thread per table consumes both
//! channels and is the **sole writer** to the row store's mem-store. Many
//! producers may call [`Table::insert`] concurrently — the bounded channel
//! serializes them.
//!
//! ## Backpressure
//!
//! The WAL path never drops: the WAL is the buffer, and a full channel
//! simply blocks the reader. The direct path blocks too unless the
//! database was opened with `discard_on_back_pressure`, in which case a
//! failed non-blocking enqueue is counted in `dropped_points`.
//!
//! ## Failure containment
//!
//! Per-record processing runs inside a panic boundary: one malformed WAL
//! record is logged and counted, and its offset still advances via a skip
//! record, so replay never sticks on a poison record. Only WAL I/O
//! failures are fatal to the reader thread.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded, never};
use crossbeam::select;
use tracing::{debug, error, info, trace, warn};

use crate::bytemap::{ByteMap, Value};
use crate::encoding::{self, DurationNanos, Sequence, Time, TsParams};
use crate::expr::{Field, GroupBy, WhereExpr};
use crate::partition::PartitionSpec;
use crate::rowstore::{Insert, MemoryCap, RowStore};
use crate::wal::{Offset, Wal, WalReader};

/// Depth of the bounded channels between producers and the inserter.
const INSERT_QUEUE_DEPTH: usize = 1024;

// ------------------------------------------------------------------------------------------------
// Clock
// ------------------------------------------------------------------------------------------------

/// Virtual per-stream clock, advanced by accepted points.
///
/// Max-advance only: observable "current time" never moves backwards, so
/// retention cutoffs are monotone.
#[derive(Debug, Default)]
pub struct Clock(AtomicI64);

impl Clock {
    /// A clock at time zero.
    pub fn new() -> Self {
        Clock(AtomicI64::new(0))
    }

    /// Advances the clock to `ts` if `ts` is ahead of it.
    pub fn advance(&self, ts: Time) {
        self.0.fetch_max(ts, Ordering::AcqRel);
    }

    /// Current virtual time.
    pub fn now(&self) -> Time {
        self.0.load(Ordering::Acquire)
    }
}

// ------------------------------------------------------------------------------------------------
// Point
// ------------------------------------------------------------------------------------------------

/// A raw inbound point on the direct (WAL-less) insert path.
#[derive(Debug, Clone, Default)]
pub struct Point {
    /// Point timestamp, unix nanoseconds.
    pub ts: Time,
    /// Dimension values.
    pub dims: BTreeMap<String, Value>,
    /// Numeric measurements.
    pub vals: BTreeMap<String, f64>,
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot of per-table ingest counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Points currently waiting in the insert channel.
    pub queued_points: u64,
    /// Row-store inserts applied (array fan-out counts each element).
    pub inserted_points: u64,
    /// Points rejected by the `WHERE` predicate.
    pub filtered_points: u64,
    /// Direct-path points dropped on backpressure.
    pub dropped_points: u64,
    /// WAL records abandoned by the per-record panic boundary.
    pub malformed_records: u64,
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration for one table.
#[derive(Debug, Clone)]
pub struct TableOpts {
    /// Table name (normalized to lowercase by the database).
    pub name: String,

    /// Stream this table subscribes to.
    pub stream: String,

    /// Output fields, each carrying its accumulator law.
    pub fields: Vec<Field>,

    /// Optional ingest filter. Hot-swappable via [`Table::apply_where`].
    pub where_expr: Option<Arc<dyn WhereExpr>>,

    /// Regrouping list, sorted by name. Empty means "key by full dims".
    pub group_by: Vec<GroupBy>,

    /// Dimension keys hashed for follower partition routing. Empty means
    /// the full dims buffer.
    pub partition_by: Vec<String>,

    /// Native bucket width.
    pub resolution: DurationNanos,

    /// How far back this table accepts and retains points.
    pub retention: DurationNanos,

    /// Lower bound between forced mem-store freezes.
    pub min_flush_latency: DurationNanos,

    /// Upper bound before a mem-store freeze is forced.
    pub max_flush_latency: DurationNanos,

    /// Declares this table a view over another table, which must already
    /// exist. The view inherits the base table's stream.
    pub view_of: Option<String>,
}

impl TableOpts {
    /// A minimal table over `stream` with the given fields.
    pub fn new(name: &str, stream: &str, fields: Vec<Field>) -> Self {
        Self {
            name: name.to_string(),
            stream: stream.to_string(),
            fields,
            where_expr: None,
            group_by: Vec::new(),
            partition_by: Vec::new(),
            resolution: 1_000_000_000,
            retention: 24 * 3_600_000_000_000,
            min_flush_latency: 0,
            max_flush_latency: 0,
            view_of: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table Core
// ------------------------------------------------------------------------------------------------

/// One raw WAL record handed from the reader thread to the inserter.
#[derive(Debug)]
struct WalRead {
    data: Vec<u8>,
    offset: Offset,
    source: u32,
}

/// A materialized view over one stream.
pub struct Table {
    name: String,
    stream: String,
    fields: Arc<[Field]>,
    group_by: Vec<GroupBy>,
    partition: Option<PartitionSpec>,
    resolution: DurationNanos,
    retention: DurationNanos,
    discard_on_back_pressure: bool,

    where_expr: RwLock<Option<Arc<dyn WhereExpr>>>,
    row_store: Arc<RowStore>,
    clock: Arc<Clock>,
    mem_cap: Arc<MemoryCap>,
    stats: Mutex<TableStats>,

    inserts_tx: Sender<Insert>,
    inserts_rx: Mutex<Option<Receiver<Insert>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Mutex<Option<Receiver<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Builds the table and its channels; ingest threads are started
    /// separately via [`Table::start`].
    pub(crate) fn new(
        opts: &TableOpts,
        clock: Arc<Clock>,
        mem_cap: Arc<MemoryCap>,
        partition: Option<PartitionSpec>,
        discard_on_back_pressure: bool,
    ) -> Arc<Self> {
        let fields: Arc<[Field]> = opts.fields.clone().into();
        let row_store = Arc::new(RowStore::new(Arc::clone(&fields), opts.resolution));
        mem_cap.register(Arc::clone(&row_store));

        let (inserts_tx, inserts_rx) = bounded(INSERT_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = bounded(1);

        Arc::new(Self {
            name: opts.name.clone(),
            stream: opts.stream.clone(),
            fields,
            group_by: opts.group_by.clone(),
            partition,
            resolution: opts.resolution,
            retention: opts.retention,
            discard_on_back_pressure,
            where_expr: RwLock::new(opts.where_expr.clone()),
            row_store,
            clock,
            mem_cap,
            stats: Mutex::new(TableStats::default()),
            inserts_tx,
            inserts_rx: Mutex::new(Some(inserts_rx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream this table subscribes to.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Output fields.
    pub fn fields(&self) -> Arc<[Field]> {
        Arc::clone(&self.fields)
    }

    /// Native bucket width.
    pub fn resolution(&self) -> DurationNanos {
        self.resolution
    }

    /// The table's virtual clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Row store handle (query surface).
    pub fn row_store(&self) -> &Arc<RowStore> {
        &self.row_store
    }

    /// Oldest timestamp this table currently accepts: `now − retention`.
    pub fn truncate_before(&self) -> Time {
        self.clock.now() - self.retention
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TableStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    fn with_stats(&self, f: impl FnOnce(&mut TableStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Atomically replaces the `WHERE` predicate. Points processed after
    /// the swap see the new predicate; in-flight points see the old one.
    pub fn apply_where(&self, expr: Option<Arc<dyn WhereExpr>>) {
        if let Ok(mut slot) = self.where_expr.write() {
            info!(table = %self.name, "WHERE predicate replaced");
            *slot = expr;
        }
    }

    fn passes_where(&self, dims: &ByteMap) -> bool {
        match self.where_expr.read() {
            Ok(slot) => slot.as_ref().is_none_or(|w| w.eval(dims)),
            Err(_) => true,
        }
    }

    /// Builds the grouped row key for a point's dims.
    fn regroup(&self, dims: &ByteMap) -> Result<ByteMap, crate::bytemap::ByteMapError> {
        if self.group_by.is_empty() {
            return Ok(dims.clone());
        }
        let mut names = Vec::with_capacity(self.group_by.len());
        let mut values = Vec::with_capacity(self.group_by.len());
        for group_by in &self.group_by {
            if let Some(value) = group_by.expr.eval(dims) {
                names.push(group_by.name.as_str());
                values.push(value);
            }
        }
        ByteMap::from_sorted_keys_and_values(&names, &values)
    }

    // --------------------------------------------------------------------------------------------
    // Direct insert path
    // --------------------------------------------------------------------------------------------

    /// Direct-to-table insert, used when the stream has no WAL.
    ///
    /// `WHERE` and regrouping are applied inline on the caller's thread;
    /// the resulting insert is enqueued for the inserter thread.
    pub fn insert(&self, point: &Point) {
        trace!(table = %self.name, ts = point.ts, "direct insert");

        let dims = match ByteMap::new(&point.dims) {
            Ok(dims) => dims,
            Err(e) => {
                warn!(table = %self.name, error = %e, "unencodable dims, point dropped");
                self.with_stats(|s| s.malformed_records += 1);
                return;
            }
        };

        if !self.passes_where(&dims) {
            trace!(table = %self.name, "point filtered");
            self.with_stats(|s| s.filtered_points += 1);
            return;
        }

        self.clock.advance(point.ts);

        let key = match self.regroup(&dims) {
            Ok(key) => key,
            Err(e) => {
                warn!(table = %self.name, error = %e, "regroup failed, point dropped");
                self.with_stats(|s| s.malformed_records += 1);
                return;
            }
        };
        let vals = match ByteMap::from_floats(&point.vals) {
            Ok(vals) => vals,
            Err(e) => {
                warn!(table = %self.name, error = %e, "unencodable vals, point dropped");
                self.with_stats(|s| s.malformed_records += 1);
                return;
            }
        };

        let insert = Insert::new(key, TsParams::new(point.ts, vals), dims, Offset::ZERO, 0);
        if self.discard_on_back_pressure {
            match self.inserts_tx.try_send(insert) {
                Ok(()) => self.with_stats(|s| s.queued_points += 1),
                Err(_) => {
                    self.with_stats(|s| s.dropped_points += 1);
                }
            }
        } else if self.inserts_tx.send(insert).is_ok() {
            self.with_stats(|s| s.queued_points += 1);
        }
    }

    // --------------------------------------------------------------------------------------------
    // WAL insert path
    // --------------------------------------------------------------------------------------------

    /// Processes one framed WAL record on the inserter thread.
    ///
    /// Malformed records are contained here: any panic or decode failure
    /// becomes a logged, counted skip so the offset still advances.
    fn insert_from_wal(&self, read: &WalRead) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.insert_from_wal_inner(&read.data, read.offset, read.source)
        }));
        match outcome {
            Ok(true) => {}
            Ok(false) => self.apply(&Insert::skip(read.offset, read.source)),
            Err(_) => {
                error!(table = %self.name, "panic while processing WAL record, skipped");
                self.with_stats(|s| s.malformed_records += 1);
                self.apply(&Insert::skip(read.offset, read.source));
            }
        }
    }

    /// Returns whether any row-store insert was emitted; `false` asks the
    /// caller to emit an offset-advancing skip.
    fn insert_from_wal_inner(&self, data: &[u8], offset: Offset, source: u32) -> bool {
        let raw = match encoding::unframe_insert(data) {
            Ok(Some(raw)) => raw,
            // Empty record: a no-op that still advances the offset.
            Ok(None) => return false,
            Err(e) => {
                warn!(table = %self.name, error = %e, "malformed WAL record, skipped");
                self.with_stats(|s| s.malformed_records += 1);
                return false;
            }
        };

        if raw.ts < self.truncate_before() {
            trace!(table = %self.name, ts = raw.ts, "expired point, skipped");
            return false;
        }

        // Copy out of the WAL read buffer into owned maps.
        let (dims, vals) = match (ByteMap::from_bytes(raw.dims), ByteMap::from_bytes(raw.vals)) {
            (Ok(dims), Ok(vals)) => (dims, vals),
            (dims, vals) => {
                if let Err(e) = dims.and(vals) {
                    warn!(table = %self.name, error = %e, "malformed dims/vals, skipped");
                }
                self.with_stats(|s| s.malformed_records += 1);
                return false;
            }
        };

        if let Some(partition) = &self.partition
            && !partition.owns(&dims)
        {
            trace!(table = %self.name, "point outside partition, skipped");
            return false;
        }

        if !self.passes_where(&dims) {
            self.with_stats(|s| s.filtered_points += 1);
            return false;
        }

        self.clock.advance(raw.ts);

        let key = match self.regroup(&dims) {
            Ok(key) => key,
            Err(e) => {
                warn!(table = %self.name, error = %e, "regroup failed, skipped");
                self.with_stats(|s| s.malformed_records += 1);
                return false;
            }
        };

        // Array value fan-out: element 0 of each array joins the main
        // measurement map; later elements become one extra insert each.
        let mut main_vals: BTreeMap<String, f64> = BTreeMap::new();
        let mut additional: Vec<ByteMap> = Vec::new();
        for (name, value) in vals.iter() {
            match value {
                Value::Float(v) => {
                    main_vals.insert(name.to_string(), v);
                }
                Value::Int(v) => {
                    main_vals.insert(name.to_string(), v as f64);
                }
                Value::FloatVec(vs) if !vs.is_empty() => {
                    main_vals.insert(name.to_string(), vs[0]);
                    for v in &vs[1..] {
                        if let Ok(extra) = ByteMap::singleton(name, Value::Float(*v)) {
                            additional.push(extra);
                        }
                    }
                }
                Value::IntVec(vs) if !vs.is_empty() => {
                    main_vals.insert(name.to_string(), vs[0] as f64);
                    for v in &vs[1..] {
                        if let Ok(extra) = ByteMap::singleton(name, Value::Float(*v as f64)) {
                            additional.push(extra);
                        }
                    }
                }
                other => {
                    warn!(table = %self.name, field = name, value = ?other, "unsupported value type, key dropped");
                }
            }
        }

        let mut emitted = false;
        if !main_vals.is_empty()
            && let Ok(main) = ByteMap::from_floats(&main_vals)
        {
            self.apply(&Insert::new(
                key.clone(),
                TsParams::new(raw.ts, main),
                dims.clone(),
                offset,
                source,
            ));
            emitted = true;
        }
        for extra in additional {
            self.apply(&Insert::new(
                key.clone(),
                TsParams::new(raw.ts, extra),
                dims.clone(),
                offset,
                source,
            ));
            emitted = true;
        }
        emitted
    }

    /// Applies one insert to the row store, honoring the memory cap.
    fn apply(&self, insert: &Insert) {
        self.mem_cap.cap();
        match self.row_store.insert(insert, self.truncate_before()) {
            Ok(true) => self.with_stats(|s| s.inserted_points += 1),
            Ok(false) => {}
            Err(e) => error!(table = %self.name, error = %e, "row store insert failed"),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Query surface
    // --------------------------------------------------------------------------------------------

    /// Serial, fully merged iteration over this table's rows.
    pub fn iterate(
        &self,
        include_mem_store: bool,
        on_row: impl FnMut(&ByteMap, &[Sequence]) -> bool,
    ) -> Result<(), crate::rowstore::RowStoreError> {
        self.row_store
            .iterate(include_mem_store, self.truncate_before(), on_row)
    }

    /// Parallel iteration; see [`RowStore::iterate_parallel`] for the
    /// partial-row contract.
    pub fn iterate_parallel(
        &self,
        include_mem_store: bool,
        on_row: &(dyn Fn(&ByteMap, &[Sequence]) + Sync),
    ) -> Result<(), crate::rowstore::RowStoreError> {
        self.row_store.iterate_parallel(include_mem_store, on_row)
    }

    // --------------------------------------------------------------------------------------------
    // Ingest threads
    // --------------------------------------------------------------------------------------------

    /// Starts the inserter thread and, when the stream is WAL-backed, the
    /// WAL reader thread resuming at `start_at`.
    pub(crate) fn start(self: &Arc<Self>, wal: Option<&Wal>, start_at: Offset) {
        let Ok(Some(inserts_rx)) = self.inserts_rx.lock().map(|mut rx| rx.take()) else {
            return;
        };
        let Ok(Some(stop_rx)) = self.stop_rx.lock().map(|mut rx| rx.take()) else {
            return;
        };

        let (wal_reads_tx, wal_reads_rx) = bounded::<WalRead>(INSERT_QUEUE_DEPTH);

        let mut handles = Vec::new();
        if let Some(wal) = wal {
            match wal.reader_at(start_at) {
                Ok(reader) => {
                    let table = Arc::clone(self);
                    handles.push(std::thread::spawn(move || {
                        table.run_wal_reader(reader, wal_reads_tx);
                    }));
                }
                Err(e) => {
                    error!(table = %self.name, error = %e, "failed to open WAL reader");
                }
            }
        } else {
            // No WAL for this stream; drop the sender so the inserter only
            // serves the direct path.
            drop(wal_reads_tx);
        }

        let table = Arc::clone(self);
        handles.push(std::thread::spawn(move || {
            table.run_inserter(inserts_rx, wal_reads_rx, stop_rx);
        }));

        if let Ok(mut slot) = self.handles.lock() {
            slot.extend(handles);
        }
        debug!(table = %self.name, stream = %self.stream, "ingest threads started");
    }

    /// Tails the stream WAL and forwards records to the inserter.
    ///
    /// A WAL read failure is fatal here: losing our position would break
    /// replay correctness, so the thread panics rather than continue.
    fn run_wal_reader(&self, mut reader: WalReader, wal_reads_tx: Sender<WalRead>) {
        loop {
            match reader.read() {
                Ok(Some(data)) => {
                    let read = WalRead {
                        data,
                        offset: reader.offset(),
                        source: 0,
                    };
                    if wal_reads_tx.send(read).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(table = %self.name, "WAL drained, reader exiting");
                    break;
                }
                Err(e) => {
                    error!(table = %self.name, stream = %self.stream, error = %e, "fatal WAL read failure");
                    panic!("WAL read failure on stream '{}': {e}", self.stream);
                }
            }
        }
    }

    /// The single consumer of both insert channels; sole mem-store writer.
    fn run_inserter(
        &self,
        inserts_rx: Receiver<Insert>,
        wal_reads_rx: Receiver<WalRead>,
        stop_rx: Receiver<()>,
    ) {
        let mut inserts_rx = inserts_rx;
        let mut wal_reads_rx = wal_reads_rx;
        loop {
            select! {
                recv(stop_rx) -> _ => {
                    debug!(table = %self.name, "inserter stopping");
                    break;
                }
                recv(inserts_rx) -> msg => match msg {
                    Ok(insert) => {
                        self.with_stats(|s| s.queued_points = s.queued_points.saturating_sub(1));
                        self.apply(&insert);
                    }
                    Err(_) => inserts_rx = never(),
                },
                recv(wal_reads_rx) -> msg => match msg {
                    Ok(read) => self.insert_from_wal(&read),
                    Err(_) => wal_reads_rx = never(),
                },
            }
        }
    }

    /// Signals the ingest threads to stop and joins them.
    ///
    /// The stream WAL must be closed first so the reader thread is not
    /// blocked in `read`.
    pub(crate) fn stop(&self) {
        if let Ok(mut stop_tx) = self.stop_tx.lock() {
            // Dropping the sender disconnects the stop channel, which the
            // inserter observes at its next select.
            stop_tx.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!(table = %self.name, "ingest thread panicked before join");
            }
        }
        info!(table = %self.name, "ingest stopped");
    }
}
