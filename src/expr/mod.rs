//! # Expression Module
//!
//! Measurement, dimension, and filter expressions consumed by the ingest
//! pipeline and the aggregation tree.
//!
//! A [`MeasurementExpr`] defines one accumulator: its encoded width inside a
//! [`Sequence`](crate::encoding::Sequence) slot, how a raw point updates it,
//! how two accumulators merge, and how a final value is read back out.
//!
//! ## Slot layout
//!
//! Every accumulator slot starts with a one-byte presence flag followed by
//! the payload. The flag distinguishes "no data" from a legitimate zero, so
//! `MIN`/`MAX` stay correct on sparse sequences and reads of untouched
//! buckets yield `None` rather than `0.0`.
//!
//! ## Merge law
//!
//! `merge` must be **commutative and associative**: the ingest pipeline
//! applies updates in WAL order per source but gives no cross-source
//! ordering, and the aggregation tree may combine partial accumulators in
//! any order.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;

use crate::bytemap::{ByteMap, Value};
use crate::encoding::TsParams;

const F64_SIZE: usize = std::mem::size_of::<f64>();

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Accumulator law for one measured field.
///
/// Implementations are shared across threads (`Arc<dyn MeasurementExpr>`)
/// and must be stateless: all state lives in the slot bytes.
pub trait MeasurementExpr: fmt::Debug + Send + Sync {
    /// Number of bytes one accumulator occupies inside a sequence.
    fn encoded_width(&self) -> usize;

    /// Folds one raw point into `slot`. Returns whether the slot changed.
    ///
    /// `metadata` carries the point's full (ungrouped) dimensions so an
    /// expression may read dimension values that are not part of the key.
    fn update(&self, slot: &mut [u8], params: &TsParams, metadata: &ByteMap) -> bool;

    /// Merges accumulator `src` (produced by this same expression) into
    /// `dst`. An unset `src` is a no-op; an unset `dst` adopts `src`.
    fn merge(&self, dst: &mut [u8], src: &[u8], metadata: &ByteMap);

    /// Reads the final value, or `None` when the slot was never updated.
    fn get(&self, slot: &[u8]) -> Option<f64>;
}

/// Yields a scalar from a dims map. Used by group-by lists.
pub trait DimExpr: fmt::Debug + Send + Sync {
    /// Evaluates against the point's dimensions; `None` means "absent".
    fn eval(&self, dims: &ByteMap) -> Option<Value>;
}

/// Boolean predicate over a dims map. Used by table `WHERE` clauses.
pub trait WhereExpr: fmt::Debug + Send + Sync {
    /// True when the point passes the filter.
    fn eval(&self, dims: &ByteMap) -> bool;
}

// ------------------------------------------------------------------------------------------------
// Field
// ------------------------------------------------------------------------------------------------

/// A named output field: the pairing of a field name and its accumulator law.
#[derive(Debug, Clone)]
pub struct Field {
    /// Output column name.
    pub name: String,

    /// Accumulator law for this field.
    pub expr: Arc<dyn MeasurementExpr>,
}

impl Field {
    /// Creates a new named field.
    pub fn new(name: &str, expr: Arc<dyn MeasurementExpr>) -> Self {
        Self {
            name: name.to_string(),
            expr,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// GroupBy
// ------------------------------------------------------------------------------------------------

/// A named dimension expression used for regrouping.
///
/// Group-by lists are kept **sorted by name** so that regrouped keys built
/// with [`ByteMap::from_sorted_keys_and_values`] are byte-deterministic.
#[derive(Debug, Clone)]
pub struct GroupBy {
    /// Output dimension name.
    pub name: String,

    /// Expression yielding the dimension value.
    pub expr: Arc<dyn DimExpr>,
}

impl GroupBy {
    /// Creates a new named group-by expression.
    pub fn new(name: &str, expr: Arc<dyn DimExpr>) -> Self {
        Self {
            name: name.to_string(),
            expr,
        }
    }

    /// Shorthand for grouping by the dimension itself.
    pub fn on_dim(name: &str) -> Self {
        Self::new(name, dim(name))
    }
}

// ------------------------------------------------------------------------------------------------
// Slot helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn is_set(slot: &[u8]) -> bool {
    slot.first().copied() == Some(1)
}

#[inline]
fn read_f64(slot: &[u8], idx: usize) -> f64 {
    let start = 1 + idx * F64_SIZE;
    match slot.get(start..start + F64_SIZE).map(TryInto::try_into) {
        Some(Ok(bytes)) => f64::from_bits(u64::from_be_bytes(bytes)),
        _ => 0.0,
    }
}

#[inline]
fn write_f64(slot: &mut [u8], idx: usize, v: f64) {
    let start = 1 + idx * F64_SIZE;
    if let Some(dst) = slot.get_mut(start..start + F64_SIZE) {
        dst.copy_from_slice(&v.to_bits().to_be_bytes());
    }
}

#[inline]
fn mark_set(slot: &mut [u8]) {
    if let Some(flag) = slot.first_mut() {
        *flag = 1;
    }
}

// ------------------------------------------------------------------------------------------------
// Aggregates
// ------------------------------------------------------------------------------------------------

/// `SUM(field)` — running total of a named measurement.
#[derive(Debug)]
pub struct Sum {
    field: String,
}

impl MeasurementExpr for Sum {
    fn encoded_width(&self) -> usize {
        1 + F64_SIZE
    }

    fn update(&self, slot: &mut [u8], params: &TsParams, _metadata: &ByteMap) -> bool {
        let Some(v) = params.get(&self.field) else {
            return false;
        };
        let total = if is_set(slot) { read_f64(slot, 0) + v } else { v };
        write_f64(slot, 0, total);
        mark_set(slot);
        true
    }

    fn merge(&self, dst: &mut [u8], src: &[u8], _metadata: &ByteMap) {
        if !is_set(src) {
            return;
        }
        let total = if is_set(dst) {
            read_f64(dst, 0) + read_f64(src, 0)
        } else {
            read_f64(src, 0)
        };
        write_f64(dst, 0, total);
        mark_set(dst);
    }

    fn get(&self, slot: &[u8]) -> Option<f64> {
        is_set(slot).then(|| read_f64(slot, 0))
    }
}

/// `COUNT(field)` — number of points that carried the named measurement.
#[derive(Debug)]
pub struct Count {
    field: String,
}

impl MeasurementExpr for Count {
    fn encoded_width(&self) -> usize {
        1 + F64_SIZE
    }

    fn update(&self, slot: &mut [u8], params: &TsParams, _metadata: &ByteMap) -> bool {
        if params.get(&self.field).is_none() {
            return false;
        }
        let total = if is_set(slot) { read_f64(slot, 0) + 1.0 } else { 1.0 };
        write_f64(slot, 0, total);
        mark_set(slot);
        true
    }

    fn merge(&self, dst: &mut [u8], src: &[u8], _metadata: &ByteMap) {
        if !is_set(src) {
            return;
        }
        let total = if is_set(dst) {
            read_f64(dst, 0) + read_f64(src, 0)
        } else {
            read_f64(src, 0)
        };
        write_f64(dst, 0, total);
        mark_set(dst);
    }

    fn get(&self, slot: &[u8]) -> Option<f64> {
        is_set(slot).then(|| read_f64(slot, 0))
    }
}

/// `MIN(field)` / `MAX(field)` — extremum of a named measurement.
#[derive(Debug)]
pub struct Extremum {
    field: String,
    take_max: bool,
}

impl Extremum {
    fn pick(&self, a: f64, b: f64) -> f64 {
        if self.take_max { a.max(b) } else { a.min(b) }
    }
}

impl MeasurementExpr for Extremum {
    fn encoded_width(&self) -> usize {
        1 + F64_SIZE
    }

    fn update(&self, slot: &mut [u8], params: &TsParams, _metadata: &ByteMap) -> bool {
        let Some(v) = params.get(&self.field) else {
            return false;
        };
        let next = if is_set(slot) {
            self.pick(read_f64(slot, 0), v)
        } else {
            v
        };
        write_f64(slot, 0, next);
        mark_set(slot);
        true
    }

    fn merge(&self, dst: &mut [u8], src: &[u8], _metadata: &ByteMap) {
        if !is_set(src) {
            return;
        }
        let next = if is_set(dst) {
            self.pick(read_f64(dst, 0), read_f64(src, 0))
        } else {
            read_f64(src, 0)
        };
        write_f64(dst, 0, next);
        mark_set(dst);
    }

    fn get(&self, slot: &[u8]) -> Option<f64> {
        is_set(slot).then(|| read_f64(slot, 0))
    }
}

/// `AVG(field)` — arithmetic mean, kept as a `(sum, count)` pair so that
/// merging partial accumulators stays exact and order-independent.
#[derive(Debug)]
pub struct Avg {
    field: String,
}

impl MeasurementExpr for Avg {
    fn encoded_width(&self) -> usize {
        1 + 2 * F64_SIZE
    }

    fn update(&self, slot: &mut [u8], params: &TsParams, _metadata: &ByteMap) -> bool {
        let Some(v) = params.get(&self.field) else {
            return false;
        };
        let (sum, count) = if is_set(slot) {
            (read_f64(slot, 0) + v, read_f64(slot, 1) + 1.0)
        } else {
            (v, 1.0)
        };
        write_f64(slot, 0, sum);
        write_f64(slot, 1, count);
        mark_set(slot);
        true
    }

    fn merge(&self, dst: &mut [u8], src: &[u8], _metadata: &ByteMap) {
        if !is_set(src) {
            return;
        }
        let (sum, count) = if is_set(dst) {
            (
                read_f64(dst, 0) + read_f64(src, 0),
                read_f64(dst, 1) + read_f64(src, 1),
            )
        } else {
            (read_f64(src, 0), read_f64(src, 1))
        };
        write_f64(dst, 0, sum);
        write_f64(dst, 1, count);
        mark_set(dst);
    }

    fn get(&self, slot: &[u8]) -> Option<f64> {
        if !is_set(slot) {
            return None;
        }
        let count = read_f64(slot, 1);
        (count > 0.0).then(|| read_f64(slot, 0) / count)
    }
}

/// `CONST(value)` — a constant that becomes present once any point touches
/// its bucket.
#[derive(Debug)]
pub struct Const {
    value: f64,
}

impl MeasurementExpr for Const {
    fn encoded_width(&self) -> usize {
        1 + F64_SIZE
    }

    fn update(&self, slot: &mut [u8], _params: &TsParams, _metadata: &ByteMap) -> bool {
        write_f64(slot, 0, self.value);
        mark_set(slot);
        true
    }

    fn merge(&self, dst: &mut [u8], src: &[u8], _metadata: &ByteMap) {
        if !is_set(src) {
            return;
        }
        write_f64(dst, 0, self.value);
        mark_set(dst);
    }

    fn get(&self, slot: &[u8]) -> Option<f64> {
        is_set(slot).then(|| read_f64(slot, 0))
    }
}

// ------------------------------------------------------------------------------------------------
// Aggregate constructors
// ------------------------------------------------------------------------------------------------

/// Sums the named measurement.
pub fn sum(field: &str) -> Arc<dyn MeasurementExpr> {
    Arc::new(Sum {
        field: field.to_string(),
    })
}

/// Counts points carrying the named measurement.
pub fn count(field: &str) -> Arc<dyn MeasurementExpr> {
    Arc::new(Count {
        field: field.to_string(),
    })
}

/// Minimum of the named measurement.
pub fn min(field: &str) -> Arc<dyn MeasurementExpr> {
    Arc::new(Extremum {
        field: field.to_string(),
        take_max: false,
    })
}

/// Maximum of the named measurement.
pub fn max(field: &str) -> Arc<dyn MeasurementExpr> {
    Arc::new(Extremum {
        field: field.to_string(),
        take_max: true,
    })
}

/// Mean of the named measurement.
pub fn avg(field: &str) -> Arc<dyn MeasurementExpr> {
    Arc::new(Avg {
        field: field.to_string(),
    })
}

/// Constant value.
pub fn constant(value: f64) -> Arc<dyn MeasurementExpr> {
    Arc::new(Const { value })
}

// ------------------------------------------------------------------------------------------------
// Dimension expressions
// ------------------------------------------------------------------------------------------------

/// Named dimension lookup — the identity group-by expression.
#[derive(Debug)]
pub struct Dim {
    name: String,
}

impl DimExpr for Dim {
    fn eval(&self, dims: &ByteMap) -> Option<Value> {
        dims.get(&self.name)
    }
}

/// Looks up the named dimension.
pub fn dim(name: &str) -> Arc<dyn DimExpr> {
    Arc::new(Dim {
        name: name.to_string(),
    })
}

// ------------------------------------------------------------------------------------------------
// Filter expressions
// ------------------------------------------------------------------------------------------------

/// `dim = value` equality filter.
#[derive(Debug)]
pub struct DimEq {
    name: String,
    value: Value,
}

impl WhereExpr for DimEq {
    fn eval(&self, dims: &ByteMap) -> bool {
        dims.get(&self.name).as_ref() == Some(&self.value)
    }
}

/// Conjunction of filters.
#[derive(Debug)]
pub struct And {
    clauses: Vec<Arc<dyn WhereExpr>>,
}

impl WhereExpr for And {
    fn eval(&self, dims: &ByteMap) -> bool {
        self.clauses.iter().all(|c| c.eval(dims))
    }
}

/// Filters points whose `name` dimension equals `value`.
pub fn dim_eq(name: &str, value: Value) -> Arc<dyn WhereExpr> {
    Arc::new(DimEq {
        name: name.to_string(),
        value,
    })
}

/// All clauses must pass.
pub fn and(clauses: Vec<Arc<dyn WhereExpr>>) -> Arc<dyn WhereExpr> {
    Arc::new(And { clauses })
}
