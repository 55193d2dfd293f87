//! # Query Module
//!
//! The grouped-query surface over stored rows. A [`RowSource`] is anything
//! that can stream `(key, sequences)` rows with a native resolution and
//! time window — a [`Table`](crate::table::Table), a join, or another
//! [`Group`]. The [`Group`] operator bridges a source and the
//! [`ByteTree`](crate::bytetree::ByteTree): it reslices each row's key to
//! the requested group-by, feeds the tree at the requested resolution and
//! window, and finally walks the tree into the caller's row callback.
//!
//! Request-scoped options travel in an explicit [`QueryOpts`] struct rather
//! than an ambient context; `include_mem_store` is the one option the core
//! needs (a query may deliberately exclude rows not yet frozen).
//!
//! ## Concurrency contract
//!
//! Sources iterate their layers in parallel and may emit several partial
//! rows per key; the group operator serializes tree updates behind a mutex,
//! so field merge laws only need to be commutative and associative.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use crate::bytemap::ByteMap;
use crate::bytetree::{ByteTree, ByteTreeError};
use crate::encoding::{DurationNanos, Sequence, Time, bucket_start};
use crate::expr::{Field, GroupBy};
use crate::rowstore::RowStoreError;
use crate::table::Table;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised during grouped query execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// The aggregation tree rejected the requested view.
    #[error("aggregation error: {0}")]
    Tree(#[from] ByteTreeError),

    /// The underlying row store failed.
    #[error("row store error: {0}")]
    RowStore(#[from] RowStoreError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// QueryOpts
// ------------------------------------------------------------------------------------------------

/// Request-scoped query options, threaded explicitly through execution.
#[derive(Debug, Clone, Copy)]
pub struct QueryOpts {
    /// Whether iteration includes the active mem-store in addition to
    /// frozen segments.
    pub include_mem_store: bool,
}

impl Default for QueryOpts {
    fn default() -> Self {
        Self {
            include_mem_store: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RowSource
// ------------------------------------------------------------------------------------------------

/// A stream of `(key, sequences)` rows with a native resolution and window.
///
/// `iterate_parallel` may emit multiple partial rows per key (one per
/// storage layer, possibly from several threads); consumers must combine
/// rows commutatively.
pub trait RowSource: Send + Sync {
    /// Output fields, parallel to each emitted row's sequences.
    fn fields(&self) -> Arc<[Field]>;

    /// Native bucket width of emitted sequences.
    fn resolution(&self) -> DurationNanos;

    /// Start (inclusive) of the data window.
    fn as_of(&self) -> Time;

    /// End (exclusive) of the data window.
    fn until(&self) -> Time;

    /// Streams rows into `on_row`, possibly from multiple threads.
    fn iterate_parallel(
        &self,
        opts: &QueryOpts,
        on_row: &(dyn Fn(&ByteMap, &[Sequence]) + Sync),
    ) -> Result<(), QueryError>;
}

impl RowSource for Table {
    fn fields(&self) -> Arc<[Field]> {
        Table::fields(self)
    }

    fn resolution(&self) -> DurationNanos {
        Table::resolution(self)
    }

    fn as_of(&self) -> Time {
        self.truncate_before()
    }

    fn until(&self) -> Time {
        // Exclusive end covering the newest bucket the clock has touched.
        bucket_start(self.clock().now(), Table::resolution(self)) + Table::resolution(self)
    }

    fn iterate_parallel(
        &self,
        opts: &QueryOpts,
        on_row: &(dyn Fn(&ByteMap, &[Sequence]) + Sync),
    ) -> Result<(), QueryError> {
        Table::iterate_parallel(self, opts.include_mem_store, on_row)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Group
// ------------------------------------------------------------------------------------------------

/// Grouped reaggregation over an underlying row source.
///
/// Unset knobs default to the source's values; `by` empty is the wildcard
/// group-by (rows keep their full key).
pub struct Group {
    /// Underlying source: a table, a join, or a nested group.
    pub source: Box<dyn RowSource>,

    /// Requested group-by, sorted by name. Empty selects the full key.
    pub by: Vec<GroupBy>,

    /// Output fields; `None` inherits the source's.
    pub fields: Option<Vec<Field>>,

    /// Output resolution; `None` inherits the source's.
    pub resolution: Option<DurationNanos>,

    /// Window start; `None` inherits the source's.
    pub as_of: Option<Time>,

    /// Window end; `None` inherits the source's.
    pub until: Option<Time>,
}

impl Group {
    /// A wildcard group over `source` with every knob inherited.
    pub fn over(source: Box<dyn RowSource>) -> Self {
        Self {
            source,
            by: Vec::new(),
            fields: None,
            resolution: None,
            as_of: None,
            until: None,
        }
    }

    fn effective_fields(&self) -> Arc<[Field]> {
        match &self.fields {
            Some(fields) if !fields.is_empty() => fields.clone().into(),
            _ => self.source.fields(),
        }
    }

    fn effective_resolution(&self) -> DurationNanos {
        self.resolution.unwrap_or_else(|| self.source.resolution())
    }

    fn effective_until(&self) -> Time {
        self.until.unwrap_or_else(|| self.source.until())
    }

    fn effective_as_of(&self) -> Time {
        let mut as_of = self.as_of.unwrap_or_else(|| self.source.as_of());
        let until = self.effective_until();
        let resolution = self.effective_resolution();
        if until - as_of < resolution {
            // Guarantee at least one period in the window.
            as_of = until - resolution;
        }
        as_of
    }

    /// Reslices a row key to the requested group-by, skipping dimensions
    /// whose expression evaluates to null.
    fn slice_key(&self, key: &ByteMap) -> ByteMap {
        if self.by.is_empty() {
            return key.clone();
        }
        let mut names = Vec::with_capacity(self.by.len());
        let mut values = Vec::with_capacity(self.by.len());
        for group_by in &self.by {
            if let Some(value) = group_by.expr.eval(key) {
                names.push(group_by.name.as_str());
                values.push(value);
            }
        }
        match ByteMap::from_sorted_keys_and_values(&names, &values) {
            Ok(sliced) => sliced,
            Err(e) => {
                warn!(error = %e, "group-by reslice failed, keeping full key");
                key.clone()
            }
        }
    }

    /// Runs the grouped reaggregation and walks the result in key order.
    ///
    /// `on_row` receives each grouped key and its reaggregated sequences;
    /// returning `false` stops the walk early.
    pub fn iterate(
        &self,
        opts: &QueryOpts,
        mut on_row: impl FnMut(&[u8], &[Sequence]) -> bool,
    ) -> Result<(), QueryError> {
        let tree = ByteTree::new(
            self.effective_fields(),
            self.source.fields(),
            self.effective_resolution(),
            self.source.resolution(),
            self.effective_as_of(),
            self.effective_until(),
        )?;
        let tree = Mutex::new(tree);

        self.source.iterate_parallel(opts, &|key, vals| {
            let sliced = self.slice_key(key);
            // The ungrouped key rides along as expression metadata.
            if let Ok(mut tree) = tree.lock() {
                tree.update(&sliced, vals, key);
            }
        })?;

        let tree = tree
            .into_inner()
            .map_err(|_| QueryError::Internal("aggregation tree mutex poisoned".into()))?;
        tree.walk(|key, sequences| on_row(key, sequences));
        Ok(())
    }
}

impl RowSource for Group {
    fn fields(&self) -> Arc<[Field]> {
        self.effective_fields()
    }

    fn resolution(&self) -> DurationNanos {
        self.effective_resolution()
    }

    fn as_of(&self) -> Time {
        self.effective_as_of()
    }

    fn until(&self) -> Time {
        self.effective_until()
    }

    /// Nested-group support: materializes this group's rows and feeds them
    /// onward (serially — the heavy parallel fan-out already happened in
    /// the leaf source).
    fn iterate_parallel(
        &self,
        opts: &QueryOpts,
        on_row: &(dyn Fn(&ByteMap, &[Sequence]) + Sync),
    ) -> Result<(), QueryError> {
        self.iterate(opts, |key, sequences| {
            match ByteMap::from_bytes(key) {
                Ok(map) => on_row(&map, sequences),
                Err(e) => warn!(error = %e, "grouped key failed to decode, row dropped"),
            }
            true
        })
    }
}
