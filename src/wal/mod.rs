//! # Write-Ahead Logging (WAL) Module
//!
//! A durable, append-only, **per-stream** write-ahead log. Every raw point
//! accepted by the database is appended here before any table sees it; each
//! subscribed table then tails the log with its own [`WalReader`] and its
//! own resume position, so the WAL doubles as the ingest buffer and the
//! replication source for followers.
//!
//! ## On-disk layout
//!
//! A stream's log is a directory of segments named `wal-<seq>.log`:
//!
//! ```text
//! [MAGIC(4)][VERSION_LE(4)]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The CRC32 is computed over `len || record_bytes`. A zero-length record is
//! legal; consumers treat it as a no-op. The active segment is sealed and a
//! new one started once it crosses the configured size threshold, which is
//! also the unit of truncation: reclamation drops whole sealed segments.
//!
//! ## Offsets
//!
//! An [`Offset`] is an opaque ordered token identifying the position
//! immediately **after** a record. Replaying from a stored offset therefore
//! yields strictly newer records, which is what lets tables resume ingest
//! without double-applying points. Consumers compare offsets only through
//! `Ord`; the segment/position split is private to this module.
//!
//! ## Concurrency model
//!
//! - A single writer per stream appends under the state mutex and fsyncs
//!   before acknowledging.
//! - Any number of readers tail the log concurrently. Each reader owns its
//!   file handle and position; a reader that catches up to the head blocks
//!   on a condvar until the writer appends or the log is closed.
//!
//! ## Failure policy
//!
//! Append and read errors are surfaced to the caller; the ingest layer
//! treats them as fatal for the affected stream, because silently losing
//! WAL position would break replay correctness. A torn trailing write
//! (partial record at the head) is reported as [`WalError::UnexpectedEof`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Time};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Segment file header: magic + format version.
const SEGMENT_MAGIC: [u8; 4] = *b"AVWL";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_SIZE: u64 = 8;

/// Upper bound on a single record, guarding replay against corrupt length
/// prefixes.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Default segment size before rotation (64 MiB).
pub const DEFAULT_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data integrity failure — record checksum did not match.
    #[error("checksum mismatch in segment {segment} at position {position}")]
    ChecksumMismatch {
        /// Segment sequence number.
        segment: u64,
        /// Byte position of the record's length prefix.
        position: u64,
    },

    /// Record exceeds [`MAX_RECORD_SIZE`].
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Torn write: the segment ends inside a record.
    #[error("unexpected end of segment {0}")]
    UnexpectedEof(u64),

    /// A segment carried a bad magic or version.
    #[error("invalid segment header: {0}")]
    InvalidHeader(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Offset
// ------------------------------------------------------------------------------------------------

/// Opaque, totally ordered position within one stream's WAL.
///
/// Identifies the byte position immediately after a record. Callers never
/// inspect the parts; `Ord` is the comparator the WAL provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset {
    segment: u64,
    position: u64,
}

impl Offset {
    /// The position before any record of any stream.
    pub const ZERO: Offset = Offset {
        segment: 0,
        position: 0,
    };
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

struct WalState {
    /// Append handle for the active segment.
    active: File,

    /// Sequence number of the active segment.
    active_seq: u64,

    /// Current byte length of the active segment.
    active_len: u64,

    /// Sealed (rotated, immutable) segment sequence numbers still on disk.
    sealed: BTreeSet<u64>,

    /// Set on [`Wal::close`]; wakes and drains blocked readers.
    closed: bool,
}

struct WalShared {
    dir: PathBuf,
    state: Mutex<WalState>,
    readable: Condvar,
}

/// A per-stream write-ahead log. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Wal {
    shared: Arc<WalShared>,
    max_segment_bytes: u64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{seq:06}.log"))
}

/// Parse `<seq>` from a `wal-<seq>.log` file name.
fn parse_seq_from_path(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

fn write_segment_header(file: &mut File) -> Result<(), WalError> {
    file.write_all(&SEGMENT_MAGIC)?;
    file.write_all(&SEGMENT_VERSION.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn validate_segment_header(file: &mut File) -> Result<(), WalError> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| WalError::InvalidHeader("segment shorter than header".into()))?;
    if header[..4] != SEGMENT_MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SEGMENT_VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {version}"
        )));
    }
    Ok(())
}

impl Wal {
    /// Opens (or creates) the WAL directory for one stream.
    ///
    /// Existing segments are discovered from disk; the highest sequence
    /// number becomes the active segment and all others are sealed.
    pub fn open<P: AsRef<Path>>(dir: P, max_segment_bytes: u64) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut seqs = BTreeSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(seq) = parse_seq_from_path(&entry.path()) {
                seqs.insert(seq);
            }
        }

        let active_seq = seqs.iter().next_back().copied().unwrap_or(1);
        seqs.remove(&active_seq);

        let path = segment_path(&dir, active_seq);
        let fresh = !path.exists();
        let mut active = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if fresh {
            write_segment_header(&mut active)?;
        } else {
            active.seek(SeekFrom::Start(0))?;
            validate_segment_header(&mut active)?;
            repair_torn_tail(&mut active, active_seq)?;
        }
        let active_len = active.metadata()?.len();
        active.seek(SeekFrom::End(0))?;

        info!(dir = %dir.display(), seq = active_seq, sealed = seqs.len(), "WAL opened");

        Ok(Self {
            shared: Arc::new(WalShared {
                dir,
                state: Mutex::new(WalState {
                    active,
                    active_seq,
                    active_len,
                    sealed: seqs,
                    closed: false,
                }),
                readable: Condvar::new(),
            }),
            max_segment_bytes,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalState>, WalError> {
        self.shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))
    }

    /// Appends one record formed by concatenating `chunks`, fsyncs, and
    /// wakes blocked readers. Returns the offset just past the record.
    pub fn write(&self, chunks: &[&[u8]]) -> Result<Offset, WalError> {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        if total > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(total));
        }
        let len_bytes = (total as u32).to_le_bytes();

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        for chunk in chunks {
            hasher.update(chunk);
        }
        let checksum = hasher.finalize();

        let mut state = self.lock()?;
        if state.closed {
            return Err(WalError::Internal("WAL closed".into()));
        }

        if state.active_len >= self.max_segment_bytes {
            self.rotate(&mut state)?;
        }

        state.active.write_all(&len_bytes)?;
        for chunk in chunks {
            state.active.write_all(chunk)?;
        }
        state.active.write_all(&checksum.to_le_bytes())?;
        state.active.sync_all()?;
        state.active_len += (U32_SIZE + total + U32_SIZE) as u64;

        let offset = Offset {
            segment: state.active_seq,
            position: state.active_len,
        };
        drop(state);
        self.shared.readable.notify_all();

        trace!(len = total, crc = format_args!("{checksum:08x}"), "WAL record appended");
        Ok(offset)
    }

    /// Seals the active segment and starts the next one.
    fn rotate(&self, state: &mut WalState) -> Result<(), WalError> {
        state.active.sync_all()?;
        let next_seq = state
            .active_seq
            .checked_add(1)
            .ok_or_else(|| WalError::Internal("segment sequence overflow".into()))?;

        let path = segment_path(&self.shared.dir, next_seq);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        write_segment_header(&mut file)?;

        let sealed_seq = state.active_seq;
        state.sealed.insert(sealed_seq);
        state.active = file;
        state.active_seq = next_seq;
        state.active_len = SEGMENT_HEADER_SIZE;

        debug!(dir = %self.shared.dir.display(), sealed = sealed_seq, next = next_seq, "WAL segment rotated");
        Ok(())
    }

    /// A reader positioned before the oldest surviving record.
    pub fn reader(&self) -> Result<WalReader, WalError> {
        let state = self.lock()?;
        let first = state.sealed.iter().next().copied().unwrap_or(state.active_seq);
        drop(state);
        self.reader_at(Offset {
            segment: first,
            position: SEGMENT_HEADER_SIZE,
        })
    }

    /// A reader resuming at the given stored offset: the first record it
    /// returns is the one written immediately after that offset.
    pub fn reader_at(&self, start_at: Offset) -> Result<WalReader, WalError> {
        let position = start_at.position.max(SEGMENT_HEADER_SIZE);
        Ok(WalReader {
            shared: Arc::clone(&self.shared),
            segment: start_at.segment.max(1),
            position,
            file: None,
            last_offset: Offset {
                segment: start_at.segment.max(1),
                position,
            },
        })
    }

    /// Deletes sealed segments that lie wholly before `offset`.
    ///
    /// The active segment is never deleted, so a mid-segment offset keeps
    /// its segment.
    pub fn truncate_before_offset(&self, offset: Offset) -> Result<(), WalError> {
        let mut state = self.lock()?;
        let doomed: Vec<u64> = state
            .sealed
            .range(..offset.segment)
            .copied()
            .collect();
        for seq in doomed {
            fs::remove_file(segment_path(&self.shared.dir, seq))?;
            state.sealed.remove(&seq);
            debug!(dir = %self.shared.dir.display(), seq, "WAL segment truncated (offset)");
        }
        Ok(())
    }

    /// Deletes sealed segments whose every record is older than `time`.
    ///
    /// Relies on the framing contract that the leading 8 bytes of each
    /// non-empty record are the record's big-endian timestamp; empty
    /// records never keep a segment alive.
    pub fn truncate_before(&self, time: Time) -> Result<(), WalError> {
        let mut state = self.lock()?;
        let candidates: Vec<u64> = state.sealed.iter().copied().collect();
        for seq in candidates {
            let path = segment_path(&self.shared.dir, seq);
            if segment_all_older_than(&path, seq, time)? {
                fs::remove_file(&path)?;
                state.sealed.remove(&seq);
                debug!(dir = %self.shared.dir.display(), seq, "WAL segment truncated (time)");
            }
        }
        Ok(())
    }

    /// Marks the log closed and wakes every blocked reader. Readers drain
    /// remaining records, then see end-of-stream.
    pub fn close(&self) -> Result<(), WalError> {
        let mut state = self.lock()?;
        if !state.closed {
            state.closed = true;
            state.active.sync_all()?;
            info!(dir = %self.shared.dir.display(), "WAL closed");
        }
        drop(state);
        self.shared.readable.notify_all();
        Ok(())
    }
}

/// Walks the active segment on open and truncates a torn tail left by a
/// crash mid-append, so replay only ever sees whole records.
///
/// Corruption that destroys record framing also destroys every boundary
/// after it, so the truncation point is the last boundary that parsed
/// cleanly.
fn repair_torn_tail(file: &mut File, seq: u64) -> Result<(), WalError> {
    let mut position = SEGMENT_HEADER_SIZE;
    loop {
        match read_record_at(file, seq, position) {
            Ok(None) => return Ok(()),
            Ok(Some((_, next))) => position = next,
            Err(e) => {
                warn!(seq, position, error = %e, "truncating torn WAL tail");
                file.set_len(position)?;
                file.sync_all()?;
                return Ok(());
            }
        }
    }
}

/// True when every record of the sealed segment at `path` is older than
/// `time`.
fn segment_all_older_than(path: &Path, seq: u64, time: Time) -> Result<bool, WalError> {
    let mut file = File::open(path)?;
    validate_segment_header(&mut file)?;
    let mut position = SEGMENT_HEADER_SIZE;
    loop {
        match read_record_at(&mut file, seq, position)? {
            None => return Ok(true),
            Some((data, next)) => {
                if !data.is_empty() {
                    match encoding::time_from_bytes(&data) {
                        Ok(ts) if ts >= time => return Ok(false),
                        Ok(_) => {}
                        // Records without a leading timestamp do not keep
                        // the segment alive.
                        Err(_) => {}
                    }
                }
                position = next;
            }
        }
    }
}

/// Reads the record whose length prefix starts at `position`.
///
/// Returns `None` on a clean end-of-segment, `Some((data, next_position))`
/// otherwise.
fn read_record_at(
    file: &mut File,
    segment: u64,
    position: u64,
) -> Result<Option<(Vec<u8>, u64)>, WalError> {
    file.seek(SeekFrom::Start(position))?;

    // A clean end of segment is zero bytes at a record boundary; anything
    // between one and three bytes is a torn length prefix.
    let mut len_bytes = [0u8; U32_SIZE];
    let mut filled = 0;
    while filled < U32_SIZE {
        match file.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                warn!(segment, position, filled, "WAL torn record (partial length prefix)");
                return Err(WalError::UnexpectedEof(segment));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WalError::Io(e)),
        }
    }

    let record_len = u32::from_le_bytes(len_bytes) as usize;
    if record_len > MAX_RECORD_SIZE {
        return Err(WalError::RecordTooLarge(record_len));
    }

    let mut data = vec![0u8; record_len];
    if let Err(e) = file.read_exact(&mut data) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            warn!(segment, position, len = record_len, "WAL torn record (partial payload)");
            return Err(WalError::UnexpectedEof(segment));
        }
        return Err(WalError::Io(e));
    }

    let mut checksum_bytes = [0u8; U32_SIZE];
    if let Err(e) = file.read_exact(&mut checksum_bytes) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            warn!(segment, position, len = record_len, "WAL torn record (partial checksum)");
            return Err(WalError::UnexpectedEof(segment));
        }
        return Err(WalError::Io(e));
    }
    let stored = u32::from_le_bytes(checksum_bytes);

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(&data);
    if hasher.finalize() != stored {
        return Err(WalError::ChecksumMismatch { segment, position });
    }

    let next = position + (U32_SIZE + record_len + U32_SIZE) as u64;
    Ok(Some((data, next)))
}

// ------------------------------------------------------------------------------------------------
// WalReader
// ------------------------------------------------------------------------------------------------

/// Tailing reader over one stream's WAL.
///
/// Owns its file handle and logical position; safe to use from a dedicated
/// ingest thread while the writer appends concurrently.
pub struct WalReader {
    shared: Arc<WalShared>,
    segment: u64,
    position: u64,
    file: Option<File>,
    last_offset: Offset,
}

impl std::fmt::Debug for WalReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalReader")
            .field("segment", &self.segment)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl WalReader {
    /// Offset just past the most recently returned record; the resume
    /// token to persist.
    pub fn offset(&self) -> Offset {
        self.last_offset
    }

    /// Blocking read of the next record.
    ///
    /// Returns `Ok(None)` only once the WAL has been closed and every
    /// surviving record has been returned.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        loop {
            // Never read the active segment past the committed boundary;
            // the writer may be mid-append beyond it.
            if !self.await_readable()? {
                return Ok(None);
            }
            if self.file.is_none() && !self.open_current_segment()? {
                // Segment vanished (truncated); advance and retry.
                continue;
            }
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| WalError::Internal("reader has no open segment".into()))?;

            match read_record_at(file, self.segment, self.position)? {
                Some((data, next)) => {
                    self.position = next;
                    self.last_offset = Offset {
                        segment: self.segment,
                        position: next,
                    };
                    return Ok(Some(data));
                }
                None => {
                    // Clean end of a sealed segment: move to the next one.
                    self.advance_segment()?;
                }
            }
        }
    }

    /// Opens the segment the reader currently points at.
    ///
    /// If that segment has been truncated away, skips forward to the oldest
    /// surviving one and returns `false` so the caller re-enters the loop.
    fn open_current_segment(&mut self) -> Result<bool, WalError> {
        let path = segment_path(&self.shared.dir, self.segment);
        match File::open(&path) {
            Ok(mut file) => {
                validate_segment_header(&mut file)?;
                if self.position < SEGMENT_HEADER_SIZE {
                    self.position = SEGMENT_HEADER_SIZE;
                }
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let state = self
                    .shared
                    .state
                    .lock()
                    .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
                let next = state
                    .sealed
                    .range(self.segment + 1..)
                    .next()
                    .copied()
                    .unwrap_or(state.active_seq);
                drop(state);
                warn!(from = self.segment, to = next, "WAL reader skipping truncated segment");
                self.segment = next;
                self.position = SEGMENT_HEADER_SIZE;
                Ok(false)
            }
            Err(e) => Err(WalError::Io(e)),
        }
    }

    /// Blocks until readable data exists at the current position.
    ///
    /// Sealed segments are always readable to their end; the active
    /// segment only up to the committed length. Returns `false` when the
    /// WAL is closed and drained.
    fn await_readable(&mut self) -> Result<bool, WalError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        loop {
            if self.segment < state.active_seq {
                return Ok(true);
            }
            if self.position < state.active_len {
                return Ok(true);
            }
            if state.closed {
                return Ok(false);
            }
            state = self
                .shared
                .readable
                .wait(state)
                .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        }
    }

    /// Moves past a finished sealed segment to the next surviving one.
    fn advance_segment(&mut self) -> Result<(), WalError> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        self.segment = state
            .sealed
            .range(self.segment + 1..)
            .next()
            .copied()
            .unwrap_or(state.active_seq);
        self.position = SEGMENT_HEADER_SIZE;
        self.file = None;
        Ok(())
    }
}
