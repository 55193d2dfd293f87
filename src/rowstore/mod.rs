//! # Row Store Module
//!
//! The per-table store of aggregated rows: a mutable mapping from a grouped
//! dimension key to one [`Sequence`] per declared field, layered over
//! immutable frozen segments.
//!
//! ## Design Invariants
//!
//! - A single inserter thread per table is the sole writer to the
//!   mem-store; readers (queries) take the read lock.
//! - Every insert — including a *skip* — advances the per-source persisted
//!   WAL offset, monotonically. The offset map is what makes WAL replay
//!   resume-safe.
//! - Points older than the table's `truncate_before` degrade to skips: the
//!   offset advances, no row data changes.
//! - Sequences within a row merge commutatively, so partial rows produced
//!   by parallel iteration can be recombined in any order.
//!
//! ## Freeze Semantics
//!
//! `freeze()` seals the current mem-store into an immutable, sorted
//! segment. It is the memory-cap release valve: the on-disk row-segment
//! format lives outside this crate, so segments stay in memory here, but
//! the layering (active mem-store, frozen rest, merged reads) is the same
//! shape the persistent store plugs into.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

use crate::bytemap::ByteMap;
use crate::encoding::{DurationNanos, Sequence, Time, TsParams};
use crate::expr::Field;
use crate::wal::Offset;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by row store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RowStoreError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Insert
// ------------------------------------------------------------------------------------------------

/// One unit of work for the row store.
///
/// A *skip* record (all of `key`/`tsparams`/`dims` absent) only advances
/// the source's persisted offset — it is how filtered, out-of-partition,
/// expired, and malformed WAL records keep replay positions moving.
#[derive(Debug, Clone)]
pub struct Insert {
    /// Grouped row key; `None` for a skip.
    pub key: Option<ByteMap>,

    /// Point timestamp and measurements; `None` for a skip.
    pub tsparams: Option<TsParams>,

    /// Full, ungrouped dimensions (expression metadata); `None` for a skip.
    pub dims: Option<ByteMap>,

    /// WAL offset just past the record this insert came from.
    pub offset: Offset,

    /// Which WAL (leader or follower link) produced the record.
    pub source: u32,
}

impl Insert {
    /// A data-bearing insert.
    pub fn new(key: ByteMap, tsparams: TsParams, dims: ByteMap, offset: Offset, source: u32) -> Self {
        Self {
            key: Some(key),
            tsparams: Some(tsparams),
            dims: Some(dims),
            offset,
            source,
        }
    }

    /// An offset-advancing skip.
    pub fn skip(offset: Offset, source: u32) -> Self {
        Self {
            key: None,
            tsparams: None,
            dims: None,
            offset,
            source,
        }
    }

    /// True when this record carries no row data.
    pub fn is_skip(&self) -> bool {
        self.key.is_none() && self.tsparams.is_none() && self.dims.is_none()
    }
}

// ------------------------------------------------------------------------------------------------
// Rows and segments
// ------------------------------------------------------------------------------------------------

/// One stored row: representative dims plus one sequence per field.
#[derive(Debug, Clone)]
struct Row {
    /// Dims of the first point merged into this row; passed to expression
    /// merge laws as metadata.
    dims: ByteMap,
    sequences: Vec<Sequence>,
}

impl Row {
    fn approx_size(&self, key: &ByteMap) -> usize {
        key.as_bytes().len()
            + self.dims.as_bytes().len()
            + self
                .sequences
                .iter()
                .map(|s| s.as_bytes().len())
                .sum::<usize>()
    }
}

/// An immutable, sorted snapshot of a frozen mem-store.
#[derive(Debug)]
struct Segment {
    rows: Vec<(ByteMap, Row)>,
}

struct RowStoreInner {
    mem_store: BTreeMap<ByteMap, Row>,
    mem_bytes: usize,
    segments: Vec<Arc<Segment>>,
    offsets: HashMap<u32, Offset>,
}

// ------------------------------------------------------------------------------------------------
// RowStore Core
// ------------------------------------------------------------------------------------------------

/// Per-table row storage: active mem-store plus frozen segments plus the
/// per-source persisted-offset map.
pub struct RowStore {
    fields: Arc<[Field]>,
    resolution: DurationNanos,
    inner: RwLock<RowStoreInner>,
}

impl std::fmt::Debug for RowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStore")
            .field("fields", &self.fields.len())
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl RowStore {
    /// Creates an empty store for the given fields and native resolution.
    pub fn new(fields: Arc<[Field]>, resolution: DurationNanos) -> Self {
        Self {
            fields,
            resolution,
            inner: RwLock::new(RowStoreInner {
                mem_store: BTreeMap::new(),
                mem_bytes: 0,
                segments: Vec::new(),
                offsets: HashMap::new(),
            }),
        }
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, RowStoreInner>, RowStoreError> {
        self.inner
            .write()
            .map_err(|_| RowStoreError::Internal("rwlock poisoned".into()))
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, RowStoreInner>, RowStoreError> {
        self.inner
            .read()
            .map_err(|_| RowStoreError::Internal("rwlock poisoned".into()))
    }

    /// Applies one insert.
    ///
    /// Always advances the source's persisted offset. Returns whether row
    /// data actually changed (`false` for skips and expired points).
    pub fn insert(&self, insert: &Insert, truncate_before: Time) -> Result<bool, RowStoreError> {
        let mut inner = self.write_lock()?;

        let slot = inner.offsets.entry(insert.source).or_insert(insert.offset);
        if insert.offset > *slot {
            *slot = insert.offset;
        }

        let (Some(key), Some(tsparams), Some(dims)) = (&insert.key, &insert.tsparams, &insert.dims)
        else {
            return Ok(false);
        };
        if tsparams.ts < truncate_before {
            trace!(ts = tsparams.ts, truncate_before, "expired point degraded to skip");
            return Ok(false);
        }

        let fields = Arc::clone(&self.fields);
        let resolution = self.resolution;
        let is_new = !inner.mem_store.contains_key(key);
        let row = inner.mem_store.entry(key.clone()).or_insert_with(|| Row {
            dims: dims.clone(),
            sequences: vec![Sequence::empty(); fields.len()],
        });

        let before = if is_new { 0 } else { row.approx_size(key) };
        for (field, seq) in fields.iter().zip(row.sequences.iter_mut()) {
            seq.update(tsparams, dims, field.expr.as_ref(), resolution, truncate_before);
        }
        let after = row.approx_size(key);
        inner.mem_bytes += after.saturating_sub(before);

        Ok(true)
    }

    /// Seals the mem-store into an immutable segment. Returns the number of
    /// bytes released from the mem-store.
    pub fn freeze(&self) -> Result<usize, RowStoreError> {
        let mut inner = self.write_lock()?;
        if inner.mem_store.is_empty() {
            return Ok(0);
        }
        let rows: Vec<(ByteMap, Row)> = std::mem::take(&mut inner.mem_store).into_iter().collect();
        let released = inner.mem_bytes;
        inner.mem_bytes = 0;
        inner.segments.push(Arc::new(Segment { rows }));
        trace!(rows = inner.segments.last().map(|s| s.rows.len()).unwrap_or(0), released, "mem-store frozen");
        Ok(released)
    }

    /// Approximate bytes held by the active mem-store.
    pub fn mem_store_bytes(&self) -> usize {
        self.read_lock().map(|inner| inner.mem_bytes).unwrap_or(0)
    }

    /// Number of frozen segments.
    pub fn num_segments(&self) -> usize {
        self.read_lock().map(|inner| inner.segments.len()).unwrap_or(0)
    }

    /// Snapshot of the highest persisted offset per source.
    pub fn persisted_offsets(&self) -> Result<HashMap<u32, Offset>, RowStoreError> {
        Ok(self.read_lock()?.offsets.clone())
    }

    /// Serial, fully merged iteration: exactly one row per distinct key,
    /// with sequences merged across the mem-store and every segment.
    ///
    /// Stops early when `on_row` returns `false`.
    pub fn iterate(
        &self,
        include_mem_store: bool,
        truncate_before: Time,
        mut on_row: impl FnMut(&ByteMap, &[Sequence]) -> bool,
    ) -> Result<(), RowStoreError> {
        let inner = self.read_lock()?;

        // Merge all sources into one ordered view. Sources are individually
        // sorted, so this is an N-way merge collapsed through a BTreeMap.
        let mut merged: BTreeMap<&ByteMap, Row> = BTreeMap::new();
        let mem_rows = include_mem_store
            .then(|| inner.mem_store.iter())
            .into_iter()
            .flatten();
        let seg_rows = inner
            .segments
            .iter()
            .flat_map(|seg| seg.rows.iter().map(|(k, r)| (k, r)));

        for (key, row) in seg_rows.chain(mem_rows) {
            match merged.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(row.clone());
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    for (idx, field) in self.fields.iter().enumerate() {
                        existing.sequences[idx] = existing.sequences[idx].merge(
                            &row.sequences[idx],
                            field.expr.as_ref(),
                            self.resolution,
                            truncate_before,
                            &row.dims,
                        );
                    }
                }
            }
        }

        for (key, row) in merged {
            if !on_row(key, &row.sequences) {
                break;
            }
        }
        Ok(())
    }

    /// Parallel iteration over layers: each frozen segment (and optionally the
    /// mem-store) is walked on its own thread.
    ///
    /// Rows for the same key may be emitted more than once — one partial
    /// row per layer — so the callback must combine rows commutatively,
    /// which is exactly what the aggregation tree does.
    pub fn iterate_parallel(
        &self,
        include_mem_store: bool,
        on_row: &(dyn Fn(&ByteMap, &[Sequence]) + Sync),
    ) -> Result<(), RowStoreError> {
        let inner = self.read_lock()?;

        std::thread::scope(|scope| {
            for segment in &inner.segments {
                let segment = Arc::clone(segment);
                scope.spawn(move || {
                    for (key, row) in &segment.rows {
                        on_row(key, &row.sequences);
                    }
                });
            }
            if include_mem_store {
                for (key, row) in &inner.mem_store {
                    on_row(key, &row.sequences);
                }
            }
        });
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// MemoryCap
// ------------------------------------------------------------------------------------------------

/// Aggregate mem-store budget shared by every table of one database.
///
/// Tables invoke [`MemoryCap::cap`] ahead of each row-store insert; once
/// the combined mem-store footprint crosses the limit, the heaviest
/// mem-store is synchronously frozen into a segment, releasing its bytes.
pub struct MemoryCap {
    max_bytes: usize,
    stores: Mutex<Vec<Arc<RowStore>>>,
}

impl std::fmt::Debug for MemoryCap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCap")
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl MemoryCap {
    /// Creates a cap with the given aggregate byte limit. A limit of zero
    /// disables capping.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            stores: Mutex::new(Vec::new()),
        }
    }

    /// Adds a row store to the accounting set.
    pub fn register(&self, store: Arc<RowStore>) {
        if let Ok(mut stores) = self.stores.lock() {
            stores.push(store);
        }
    }

    /// Freezes the heaviest mem-store when the aggregate footprint exceeds
    /// the limit. Invoked by tables ahead of every row-store insert; the
    /// freeze happens synchronously on the calling (inserter) thread.
    pub fn cap(&self) {
        if self.max_bytes == 0 {
            return;
        }
        let Ok(stores) = self.stores.lock() else {
            return;
        };
        let total: usize = stores.iter().map(|s| s.mem_store_bytes()).sum();
        if total <= self.max_bytes {
            return;
        }
        let heaviest = stores
            .iter()
            .max_by_key(|s| s.mem_store_bytes())
            .map(Arc::clone);
        drop(stores);
        if let Some(store) = heaviest {
            match store.freeze() {
                Ok(released) if released > 0 => {
                    debug!(total, released, "mem-store cap enforced");
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "mem-store freeze failed"),
            }
        }
    }
}
