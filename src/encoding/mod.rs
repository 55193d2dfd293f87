//! # Encoding Module
//!
//! Deterministic binary primitives for on-the-wire framing and packed
//! time-series buffers. The engine owns this format, so the encoded
//! representation never changes due to a dependency upgrade.
//!
//! # Wire format
//!
//! | Item | Encoding |
//! |------|----------|
//! | timestamp | 8 bytes, big-endian i64, unix nanoseconds |
//! | length prefix | 4 bytes, big-endian u32 |
//! | raw insert record | `time(8) \| dimsLen(4) \| dimsBytes \| valsLen(4) \| valsBytes` |
//! | sequence | `start(8) \| slot…` — slot `i` covers bucket `start − i·resolution` |
//!
//! All multi-byte integers are **big-endian**.
//!
//! # Sequences
//!
//! A [`Sequence`] packs one accumulator per time bucket, newest first.
//! Sequences are *sparse*: absent trailing buckets are simply not present,
//! and reads clamp within the buffer, so an out-of-range period yields
//! `None` rather than an error. The slot width and merge law come from the
//! field's [`MeasurementExpr`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::bytemap::ByteMap;
use crate::expr::MeasurementExpr;

/// Unix timestamp in nanoseconds.
pub type Time = i64;

/// A bucket width or retention window in nanoseconds.
pub type DurationNanos = i64;

/// Encoded size of a timestamp.
pub const TIME_SIZE: usize = std::mem::size_of::<i64>();

/// Encoded size of a length prefix.
pub const LEN_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding framed records.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Primitives
// ------------------------------------------------------------------------------------------------

/// Writes a timestamp into an 8-byte buffer.
#[inline]
pub fn encode_time(buf: &mut [u8], ts: Time) {
    buf[..TIME_SIZE].copy_from_slice(&ts.to_be_bytes());
}

/// Reads a timestamp from the first 8 bytes of `buf`.
#[inline]
pub fn time_from_bytes(buf: &[u8]) -> Result<Time, EncodingError> {
    let bytes = buf
        .get(..TIME_SIZE)
        .and_then(|b| <[u8; TIME_SIZE]>::try_from(b).ok())
        .ok_or(EncodingError::UnexpectedEof {
            needed: TIME_SIZE,
            available: buf.len(),
        })?;
    Ok(i64::from_be_bytes(bytes))
}

/// Writes a length prefix into a 4-byte buffer.
#[inline]
pub fn write_u32(buf: &mut [u8], n: u32) {
    buf[..LEN_SIZE].copy_from_slice(&n.to_be_bytes());
}

/// Reads a length prefix from the first 4 bytes of `buf`.
#[inline]
pub fn read_u32(buf: &[u8]) -> Result<u32, EncodingError> {
    let bytes = buf
        .get(..LEN_SIZE)
        .and_then(|b| <[u8; LEN_SIZE]>::try_from(b).ok())
        .ok_or(EncodingError::UnexpectedEof {
            needed: LEN_SIZE,
            available: buf.len(),
        })?;
    Ok(u32::from_be_bytes(bytes))
}

/// Non-copying split of `buf` into `(head, tail)` at `n`.
#[inline]
pub fn split(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), EncodingError> {
    if buf.len() < n {
        return Err(EncodingError::UnexpectedEof {
            needed: n,
            available: buf.len(),
        });
    }
    Ok(buf.split_at(n))
}

/// Truncates `ts` down to the start of its bucket.
#[inline]
pub fn bucket_start(ts: Time, resolution: DurationNanos) -> Time {
    ts.div_euclid(resolution) * resolution
}

// ------------------------------------------------------------------------------------------------
// Raw insert framing
// ------------------------------------------------------------------------------------------------

/// A decoded view into a framed raw insert record.
#[derive(Debug, Clone, Copy)]
pub struct RawInsert<'a> {
    /// Point timestamp.
    pub ts: Time,
    /// Serialized dimensions bytemap.
    pub dims: &'a [u8],
    /// Serialized measurements bytemap.
    pub vals: &'a [u8],
}

/// Frames a raw insert for the stream WAL:
/// `time(8) | dimsLen(4) | dimsBytes | valsLen(4) | valsBytes`.
pub fn frame_insert(ts: Time, dims: &[u8], vals: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TIME_SIZE + 2 * LEN_SIZE + dims.len() + vals.len());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&(dims.len() as u32).to_be_bytes());
    buf.extend_from_slice(dims);
    buf.extend_from_slice(&(vals.len() as u32).to_be_bytes());
    buf.extend_from_slice(vals);
    buf
}

/// Unframes a raw insert record.
///
/// An empty record is a legal no-op and decodes to `Ok(None)`.
pub fn unframe_insert(buf: &[u8]) -> Result<Option<RawInsert<'_>>, EncodingError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let ts = time_from_bytes(buf)?;
    let rest = &buf[TIME_SIZE..];

    let dims_len = read_u32(rest)? as usize;
    let (dims, rest) = split(&rest[LEN_SIZE..], dims_len)?;

    let vals_len = read_u32(rest)? as usize;
    let (vals, _) = split(&rest[LEN_SIZE..], vals_len)?;

    Ok(Some(RawInsert { ts, dims, vals }))
}

// ------------------------------------------------------------------------------------------------
// TsParams
// ------------------------------------------------------------------------------------------------

/// The per-point input to [`MeasurementExpr::update`]: a timestamp and a
/// map of numeric measurements.
#[derive(Debug, Clone)]
pub struct TsParams {
    /// Point timestamp.
    pub ts: Time,
    /// Numeric measurements keyed by field name.
    pub vals: ByteMap,
}

impl TsParams {
    /// Pairs a timestamp with its measurements.
    pub fn new(ts: Time, vals: ByteMap) -> Self {
        Self { ts, vals }
    }

    /// Numeric lookup, coercing integer measurements to `f64`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.vals.get_float(name)
    }
}

// ------------------------------------------------------------------------------------------------
// Sequence
// ------------------------------------------------------------------------------------------------

/// A packed time series of bucketed accumulator values for one field.
///
/// Layout: `start(8) | slot₀ | slot₁ | …` where slot `i` covers the bucket
/// starting at `start − i·resolution`. The resolution is carried by the
/// owning table, not the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sequence(Vec<u8>);

impl Sequence {
    /// An empty sequence (no start, no slots).
    pub fn empty() -> Self {
        Sequence(Vec::new())
    }

    /// Allocates a zeroed sequence of `periods` slots headed at `start`.
    pub fn with_periods(start: Time, periods: usize, width: usize) -> Self {
        let mut buf = vec![0u8; TIME_SIZE + periods * width];
        buf[..TIME_SIZE].copy_from_slice(&start.to_be_bytes());
        Sequence(buf)
    }

    /// Adopts a raw sequence buffer.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Sequence(buf)
    }

    /// The underlying buffer.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when the sequence holds no buckets at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len() <= TIME_SIZE
    }

    /// Timestamp of bucket 0, or 0 for an empty sequence.
    #[inline]
    pub fn start(&self) -> Time {
        match self
            .0
            .get(..TIME_SIZE)
            .and_then(|b| <[u8; TIME_SIZE]>::try_from(b).ok())
        {
            Some(bytes) => i64::from_be_bytes(bytes),
            None => 0,
        }
    }

    /// Number of buckets present for slots of the given width.
    #[inline]
    pub fn num_periods(&self, width: usize) -> usize {
        self.0.len().saturating_sub(TIME_SIZE) / width
    }

    #[inline]
    fn slot(&self, period: usize, width: usize) -> Option<&[u8]> {
        let start = TIME_SIZE + period * width;
        self.0.get(start..start + width)
    }

    #[inline]
    fn slot_mut(&mut self, period: usize, width: usize) -> Option<&mut [u8]> {
        let start = TIME_SIZE + period * width;
        self.0.get_mut(start..start + width)
    }

    /// Reads the accumulator value at `period`, clamping within the buffer.
    pub fn value_at(&self, period: usize, expr: &dyn MeasurementExpr) -> Option<f64> {
        self.slot(period, expr.encoded_width()).and_then(|s| expr.get(s))
    }

    /// Reads the accumulator value for the bucket containing `ts`.
    pub fn value_at_time(
        &self,
        ts: Time,
        expr: &dyn MeasurementExpr,
        resolution: DurationNanos,
    ) -> Option<f64> {
        let bucket = bucket_start(ts, resolution);
        let head = self.start();
        if self.is_empty() || bucket > head {
            return None;
        }
        let period = ((head - bucket) / resolution) as usize;
        self.value_at(period, expr)
    }

    /// Folds one point into the bucket containing its timestamp.
    ///
    /// Grows at the head when the point's bucket is newer than the current
    /// start and at the tail for older buckets, but never accepts points
    /// older than `truncate_before`. Returns whether the point was applied.
    pub fn update(
        &mut self,
        params: &TsParams,
        metadata: &ByteMap,
        expr: &dyn MeasurementExpr,
        resolution: DurationNanos,
        truncate_before: Time,
    ) -> bool {
        if params.ts < truncate_before {
            return false;
        }
        let width = expr.encoded_width();
        let bucket = bucket_start(params.ts, resolution);

        if self.is_empty() {
            *self = Sequence::with_periods(bucket, 1, width);
        } else if bucket > self.start() {
            let grow = ((bucket - self.start()) / resolution) as usize;
            let mut buf = Vec::with_capacity(self.0.len() + grow * width);
            buf.extend_from_slice(&bucket.to_be_bytes());
            buf.resize(TIME_SIZE + grow * width, 0);
            buf.extend_from_slice(&self.0[TIME_SIZE..]);
            self.0 = buf;
        }

        let period = ((self.start() - bucket) / resolution) as usize;
        if period >= self.num_periods(width) {
            self.0.resize(TIME_SIZE + (period + 1) * width, 0);
        }

        match self.slot_mut(period, width) {
            Some(slot) => expr.update(slot, params, metadata),
            None => false,
        }
    }

    /// Commutative merge of two sequences of the same field.
    ///
    /// The result covers the union of both time ranges, clamped below at
    /// `truncate_before`.
    pub fn merge(
        &self,
        other: &Sequence,
        expr: &dyn MeasurementExpr,
        resolution: DurationNanos,
        truncate_before: Time,
        metadata: &ByteMap,
    ) -> Sequence {
        let width = expr.encoded_width();
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let head = self.start().max(other.start());
        let tail_of = |s: &Sequence| s.start() - (s.num_periods(width) as i64 - 1) * resolution;
        let mut tail = tail_of(self).min(tail_of(other));
        if truncate_before > 0 {
            tail = tail.max(bucket_start(truncate_before, resolution));
        }
        if tail > head {
            return Sequence::empty();
        }

        let periods = ((head - tail) / resolution) as usize + 1;
        let mut merged = Sequence::with_periods(head, periods, width);
        for src in [self, other] {
            let offset = (head - src.start()) / resolution;
            for p in 0..src.num_periods(width) {
                let dst_period = p as i64 + offset;
                if dst_period < 0 || dst_period as usize >= periods {
                    continue;
                }
                let Some(src_slot) = src.slot(p, width) else {
                    continue;
                };
                let src_slot = src_slot.to_vec();
                if let Some(dst_slot) = merged.slot_mut(dst_period as usize, width) {
                    expr.merge(dst_slot, &src_slot, metadata);
                }
            }
        }
        merged
    }

    /// Inter-resolution reaggregation into `self`, which must already be
    /// allocated over the query window at `out_res`.
    ///
    /// Downsamples when `out_res` is a multiple of `in_res` and upsamples by
    /// replication when it is a divisor; the caller validates divisibility
    /// at build time. Only input buckets within `[window_tail, window_head]`
    /// contribute.
    #[allow(clippy::too_many_arguments)]
    pub fn sub_merge(
        &mut self,
        input: &Sequence,
        metadata: &ByteMap,
        out_expr: &dyn MeasurementExpr,
        in_expr: &dyn MeasurementExpr,
        out_res: DurationNanos,
        in_res: DurationNanos,
        window_tail: Time,
        window_head: Time,
    ) {
        let in_width = in_expr.encoded_width();
        let out_width = out_expr.encoded_width();
        let head = self.start();
        let out_periods = self.num_periods(out_width);

        for p in 0..input.num_periods(in_width) {
            let t = input.start() - p as i64 * in_res;
            let Some(in_slot) = input.slot(p, in_width) else {
                continue;
            };
            let in_slot = in_slot.to_vec();

            // One output bucket for downsampling, several for upsampling.
            let (mut out_bucket, last) = if out_res >= in_res {
                let b = bucket_start(t, out_res);
                (b, b)
            } else {
                (t, t + in_res - out_res)
            };
            while out_bucket <= last {
                if out_bucket >= window_tail && out_bucket <= window_head {
                    let out_period = (head - out_bucket) / out_res;
                    if out_period >= 0
                        && (out_period as usize) < out_periods
                        && let Some(out_slot) = self.slot_mut(out_period as usize, out_width)
                    {
                        out_expr.merge(out_slot, &in_slot, metadata);
                    }
                }
                out_bucket += out_res;
            }
        }
    }
}
