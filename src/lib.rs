//! # AevumDB
//!
//! An embeddable **time-series ingest and aggregation engine**: timestamped
//! points (dimensions + numeric measurements) are durably appended to
//! per-stream write-ahead logs, fanned into tables that filter, regroup,
//! and time-bucket them, and served back through a grouped query operator
//! that reaggregates rows at arbitrary resolutions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                            Db                              │
//! │                                                            │
//! │  insert_raw ──► stream WAL ──► reader ─┐   (per table)     │
//! │                                        ├─► inserter ──► row│
//! │  insert ───► WHERE / regroup ──► chan ─┘      store        │
//! │                                                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ query: Group ──► ByteTree ◄── iterate_parallel(rows) │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Streams, tables, schema application, lifecycle |
//! | [`table`] | Per-table ingest pipeline — WHERE, regrouping, fan-out, backpressure |
//! | [`rowstore`] | Mem-store + frozen segments, per-source WAL offsets |
//! | [`wal`] | Segmented, CRC-protected, tailable per-stream write-ahead log |
//! | [`bytetree`] | Radix aggregation tree for grouped reaggregation |
//! | [`query`] | Row sources and the grouped query operator |
//! | [`bytemap`] | Immutable sorted dimension maps with byte-stable encoding |
//! | [`encoding`] | Binary framing primitives and packed sequences |
//! | [`expr`] | Measurement, dimension, and filter expressions |
//! | [`partition`] | FNV-1a follower partition routing |
//!
//! ## Key properties
//!
//! - **WAL-first ingest** — raw writes land in the stream log before any
//!   table sees them; tables resume replay from per-source offsets, and
//!   filtered or malformed records still advance those offsets.
//! - **Deterministic keys** — dimension maps serialize sorted, so equal
//!   logical maps are byte-equal and double as row keys, hash input, and
//!   aggregation-tree paths.
//! - **Commutative aggregation** — field merge laws are order-independent,
//!   which lets storage layers be iterated in parallel and reaggregated at
//!   query time at any compatible resolution.
//! - **Contained failures** — one malformed record is logged, counted, and
//!   skipped; only WAL I/O failures stop a stream's ingest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aevumdb::db::{Db, DbOpts};
//! use aevumdb::expr;
//! use aevumdb::table::{Point, TableOpts};
//!
//! let db = Db::open(DbOpts::default()).unwrap();
//!
//! let mut opts = TableOpts::new(
//!     "requests",
//!     "events",
//!     vec![expr::Field::new("hits", expr::sum("hits"))],
//! );
//! opts.resolution = 1_000_000_000; // 1s buckets
//! db.create_table(opts).unwrap();
//!
//! let mut point = Point::default();
//! point.ts = 1_700_000_000_000_000_000;
//! point.dims.insert("host".into(), "web-1".into());
//! point.vals.insert("hits".into(), 1.0);
//! db.insert("events", &point).unwrap();
//!
//! // Graceful shutdown.
//! db.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod bytemap;
pub mod bytetree;
pub mod db;
pub mod encoding;
pub mod expr;
pub mod partition;
pub mod query;
pub mod rowstore;
pub mod table;
pub mod wal;
