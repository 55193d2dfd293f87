//! # Database Module
//!
//! The top-level handle tying the core together: named streams, their
//! write-ahead logs and virtual clocks, the tables subscribed to each
//! stream, schema application, and the shared mem-store budget.
//!
//! ## Streams and tables
//!
//! A *stream* is a named sequence of raw inbound records; it comes into
//! existence when the first table subscribing to it is created and lives
//! for the process lifetime. With a WAL directory configured, every stream
//! gets its own append-only log and [`Db::insert_raw`] is the durable
//! write path; each subscribed table tails that log independently. Without
//! a WAL directory, [`Db::insert`] feeds tables directly through their
//! bounded channels.
//!
//! ## Follower mode
//!
//! A follower node declines direct raw writes for its streams and instead
//! replays replicated records, keeping only those its partition owns.
//! The partition predicate hashes each table's `partition_by` dimensions.
//!
//! ## Schema application
//!
//! [`Db::apply_schema`] applies a whole schema in passes until fixed
//! point, so views can be declared before the tables they depend on. A
//! pass that makes no progress aborts with [`DbError::SchemaStalled`]
//! instead of spinning. Re-applying a schema to an existing table only
//! replaces its `WHERE` predicate.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bytemap::{ByteMap, ByteMapError};
use crate::encoding::Time;
use crate::partition::PartitionSpec;
use crate::rowstore::MemoryCap;
use crate::table::{Clock, Point, Table, TableOpts};
use crate::wal::{DEFAULT_SEGMENT_BYTES, Offset, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Insert into a stream no table subscribes to.
    #[error("no such stream: '{0}'")]
    NoSuchStream(String),

    /// Raw write attempted while this node follows the stream.
    #[error("stream '{0}' is followed; raw writes are rejected")]
    WriteRejectedOnFollower(String),

    /// Raw write to a stream without a configured WAL.
    #[error("stream '{0}' has no WAL; use direct inserts")]
    WalNotConfigured(String),

    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Dimension or measurement map failed to encode.
    #[error("bytemap error: {0}")]
    ByteMap(#[from] ByteMapError),

    /// Table options failed validation.
    #[error("invalid table options: {0}")]
    InvalidTableOpts(String),

    /// A table with this name already exists.
    #[error("table '{0}' already exists")]
    DuplicateTable(String),

    /// A view references a table that does not exist (yet).
    #[error("table '{table}' depends on missing table '{depends_on}'")]
    DependencyMissing {
        /// The table being created.
        table: String,
        /// The missing dependency.
        depends_on: String,
    },

    /// A schema pass created nothing while tables were still pending.
    #[error("schema application stalled; unresolved tables: {0:?}")]
    SchemaStalled(Vec<String>),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// This node's follower configuration.
#[derive(Debug, Clone)]
pub struct FollowSpec {
    /// Total number of partitions each followed stream is split into.
    pub num_partitions: u32,

    /// The partition index this node owns.
    pub partition: u32,
}

/// Database-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct DbOpts {
    /// Root directory for per-stream WALs. `None` disables the WAL path:
    /// streams accept only direct inserts.
    pub wal_dir: Option<PathBuf>,

    /// Follower mode: decline raw writes, filter replayed records by
    /// partition.
    pub follow: Option<FollowSpec>,

    /// When set, dimension keys outside this list are dropped before WAL
    /// framing.
    pub whitelisted_dimensions: Option<Vec<String>>,

    /// Use non-blocking enqueues on the direct insert path, counting drops.
    pub discard_on_back_pressure: bool,

    /// Aggregate mem-store budget across all tables; 0 disables the cap.
    pub max_mem_store_bytes: usize,

    /// WAL segment size before rotation; 0 selects the default.
    pub wal_segment_bytes: u64,
}

/// A whole schema: table name to its options, applied as one unit.
pub type Schema = BTreeMap<String, TableOpts>;

// ------------------------------------------------------------------------------------------------
// Db Core
// ------------------------------------------------------------------------------------------------

struct StreamState {
    wal: Option<Wal>,
    clock: Arc<Clock>,
    tables: Vec<Arc<Table>>,
}

struct DbInner {
    streams: HashMap<String, StreamState>,
    tables: HashMap<String, Arc<Table>>,
}

/// The time-series database handle.
///
/// Thread-safe; clone-free sharing happens through `Arc<Db>` if needed.
pub struct Db {
    opts: DbOpts,
    mem_cap: Arc<MemoryCap>,
    inner: Mutex<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("wal_dir", &self.opts.wal_dir)
            .field("follow", &self.opts.follow)
            .finish_non_exhaustive()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Db {
    /// Opens a database with the given options.
    pub fn open(opts: DbOpts) -> Result<Self, DbError> {
        if let Some(dir) = &opts.wal_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| DbError::Internal(format!("cannot create WAL dir: {e}")))?;
        }
        info!(wal_dir = ?opts.wal_dir, follower = opts.follow.is_some(), "database opened");
        Ok(Self {
            mem_cap: Arc::new(MemoryCap::new(opts.max_mem_store_bytes)),
            opts,
            inner: Mutex::new(DbInner {
                streams: HashMap::new(),
                tables: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, DbInner>, DbError> {
        self.inner
            .lock()
            .map_err(|_| DbError::Internal("tables mutex poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Table creation and schema
    // --------------------------------------------------------------------------------------------

    /// Creates a table (or view) and starts its ingest pipeline.
    ///
    /// The stream is created on first reference. A view (`view_of`)
    /// inherits its base table's stream, and its fields when it declares
    /// none; the base must already exist.
    pub fn create_table(&self, opts: TableOpts) -> Result<(), DbError> {
        let mut opts = opts;
        opts.name = normalize(&opts.name);
        opts.stream = normalize(&opts.stream);

        if opts.resolution <= 0 {
            return Err(DbError::InvalidTableOpts(format!(
                "table '{}': resolution must be positive",
                opts.name
            )));
        }
        if opts.retention <= 0 {
            return Err(DbError::InvalidTableOpts(format!(
                "table '{}': retention must be positive",
                opts.name
            )));
        }
        for pair in opts.group_by.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(DbError::InvalidTableOpts(format!(
                    "table '{}': group-by names must be sorted and unique",
                    opts.name
                )));
            }
        }

        let mut inner = self.lock()?;
        if inner.tables.contains_key(&opts.name) {
            return Err(DbError::DuplicateTable(opts.name));
        }

        // Resolve the view dependency before touching any stream state.
        if let Some(base_name) = &opts.view_of {
            let base_name = normalize(base_name);
            let Some(base) = inner.tables.get(&base_name) else {
                return Err(DbError::DependencyMissing {
                    table: opts.name,
                    depends_on: base_name,
                });
            };
            opts.stream = base.stream().to_string();
            if opts.fields.is_empty() {
                opts.fields = base.fields().to_vec();
            }
        }
        if opts.fields.is_empty() {
            return Err(DbError::InvalidTableOpts(format!(
                "table '{}': at least one field is required",
                opts.name
            )));
        }

        // Create the stream on first reference.
        if !inner.streams.contains_key(&opts.stream) {
            let wal = match &self.opts.wal_dir {
                Some(dir) => {
                    let segment_bytes = if self.opts.wal_segment_bytes > 0 {
                        self.opts.wal_segment_bytes
                    } else {
                        DEFAULT_SEGMENT_BYTES
                    };
                    Some(Wal::open(dir.join(&opts.stream), segment_bytes)?)
                }
                None => None,
            };
            inner.streams.insert(
                opts.stream.clone(),
                StreamState {
                    wal,
                    clock: Arc::new(Clock::new()),
                    tables: Vec::new(),
                },
            );
        }
        let stream = inner
            .streams
            .get(&opts.stream)
            .ok_or_else(|| DbError::Internal("stream vanished during create".into()))?;

        let partition = self.opts.follow.as_ref().map(|follow| PartitionSpec {
            num_partitions: follow.num_partitions,
            partition: follow.partition,
            keys: opts.partition_by.clone(),
        });

        let table = Table::new(
            &opts,
            Arc::clone(&stream.clock),
            Arc::clone(&self.mem_cap),
            partition,
            self.opts.discard_on_back_pressure,
        );

        // Resume WAL reads from the stored source-0 offset (fresh tables
        // start at the beginning of the surviving log).
        let start_at = table
            .row_store()
            .persisted_offsets()
            .map_err(|e| DbError::Internal(e.to_string()))?
            .get(&0)
            .copied()
            .unwrap_or(Offset::ZERO);
        table.start(stream.wal.as_ref(), start_at);

        debug!(table = %opts.name, stream = %opts.stream, view = opts.view_of.is_some(), "table created");
        let stream = inner
            .streams
            .get_mut(&opts.stream)
            .ok_or_else(|| DbError::Internal("stream vanished during create".into()))?;
        stream.tables.push(Arc::clone(&table));
        inner.tables.insert(opts.name.clone(), table);
        Ok(())
    }

    /// Applies a whole schema, retrying dependency-blocked tables until
    /// fixed point.
    ///
    /// Existing tables only get their `WHERE` predicate re-applied. A pass
    /// that resolves nothing fails with [`DbError::SchemaStalled`] naming
    /// the stuck tables.
    pub fn apply_schema(&self, schema: Schema) -> Result<(), DbError> {
        let mut pending: BTreeMap<String, TableOpts> = schema
            .into_iter()
            .map(|(name, mut opts)| {
                let name = normalize(&name);
                opts.name = name.clone();
                (name, opts)
            })
            .collect();

        while !pending.is_empty() {
            let mut resolved = Vec::new();
            let mut blocked = Vec::new();

            for (name, opts) in &pending {
                if let Some(table) = self.get_table(name) {
                    debug!(table = %name, "schema: replacing WHERE on existing table");
                    table.apply_where(opts.where_expr.clone());
                    resolved.push(name.clone());
                    continue;
                }
                match self.create_table(opts.clone()) {
                    Ok(()) => resolved.push(name.clone()),
                    Err(DbError::DependencyMissing { depends_on, .. }) => {
                        debug!(table = %name, missing = %depends_on, "schema: table blocked, retrying next pass");
                        blocked.push(name.clone());
                    }
                    Err(e) => return Err(e),
                }
            }

            if resolved.is_empty() {
                warn!(unresolved = ?blocked, "schema application made no progress");
                return Err(DbError::SchemaStalled(blocked));
            }
            for name in resolved {
                pending.remove(&name);
            }
        }
        Ok(())
    }

    /// Looks up a table by (normalized) name.
    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.lock().ok()?.tables.get(&normalize(name)).cloned()
    }

    /// Current virtual time of a stream's clock.
    pub fn now(&self, stream: &str) -> Time {
        self.lock()
            .ok()
            .and_then(|inner| {
                inner
                    .streams
                    .get(&normalize(stream))
                    .map(|s| s.clock.now())
            })
            .unwrap_or(0)
    }

    // --------------------------------------------------------------------------------------------
    // Insert paths
    // --------------------------------------------------------------------------------------------

    /// Direct insert: fans the point to every table subscribed to the
    /// stream, bypassing the WAL.
    pub fn insert(&self, stream: &str, point: &Point) -> Result<(), DbError> {
        let stream = normalize(stream);
        // Never hold the tables mutex across channel sends.
        let tables = {
            let inner = self.lock()?;
            match inner.streams.get(&stream) {
                Some(state) if !state.tables.is_empty() => state.tables.clone(),
                _ => return Err(DbError::NoSuchStream(stream)),
            }
        };
        for table in &tables {
            table.insert(point);
        }
        Ok(())
    }

    /// Durable raw insert: whitelists dims, frames the record, and appends
    /// it to the stream's WAL for every subscriber to replay.
    pub fn insert_raw(
        &self,
        stream: &str,
        ts: Time,
        dims: &ByteMap,
        vals: &ByteMap,
    ) -> Result<(), DbError> {
        let stream = normalize(stream);
        if self.opts.follow.is_some() {
            return Err(DbError::WriteRejectedOnFollower(stream));
        }

        let dims = match &self.opts.whitelisted_dimensions {
            Some(whitelist) => dims.slice(whitelist),
            None => dims.clone(),
        };

        let wal = {
            let inner = self.lock()?;
            let state = inner
                .streams
                .get(&stream)
                .ok_or_else(|| DbError::NoSuchStream(stream.clone()))?;
            state
                .wal
                .clone()
                .ok_or_else(|| DbError::WalNotConfigured(stream.clone()))?
        };

        let ts_bytes = ts.to_be_bytes();
        let dims_len = (dims.as_bytes().len() as u32).to_be_bytes();
        let vals_len = (vals.as_bytes().len() as u32).to_be_bytes();
        wal.write(&[
            &ts_bytes,
            &dims_len,
            dims.as_bytes(),
            &vals_len,
            vals.as_bytes(),
        ])?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Drops WAL segments of `stream` whose records all predate `time`.
    pub fn truncate_wal_before(&self, stream: &str, time: Time) -> Result<(), DbError> {
        let stream = normalize(stream);
        let wal = {
            let inner = self.lock()?;
            let state = inner
                .streams
                .get(&stream)
                .ok_or_else(|| DbError::NoSuchStream(stream.clone()))?;
            state.wal.clone()
        };
        if let Some(wal) = wal {
            wal.truncate_before(time)?;
        }
        Ok(())
    }

    /// Gracefully shuts down: closes every stream WAL (draining readers),
    /// then stops and joins every table's ingest threads.
    pub fn close(&self) -> Result<(), DbError> {
        let (wals, tables) = {
            let inner = self.lock()?;
            let wals: Vec<Wal> = inner
                .streams
                .values()
                .filter_map(|s| s.wal.clone())
                .collect();
            let tables: Vec<Arc<Table>> = inner.tables.values().cloned().collect();
            (wals, tables)
        };
        for wal in &wals {
            wal.close()?;
        }
        for table in &tables {
            table.stop();
        }
        info!("database closed");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}
