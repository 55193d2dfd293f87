//! # ByteMap Module
//!
//! An immutable, sorted mapping from string keys to scalar values, serialized
//! into a single contiguous byte buffer. The buffer **is** the wire
//! representation: two logically equal maps always produce byte-identical
//! buffers, which lets the rest of the engine use the raw bytes directly as
//! row keys, partition-hash input, and aggregation-tree paths.
//!
//! # Wire format
//!
//! Entries are laid out back to back, sorted by key, keys unique:
//!
//! ```text
//! [keyLen u16 BE][keyBytes][tag u8][valueBytes]
//! ```
//!
//! | Tag | Value | Encoding |
//! |-----|----------|------------------------------------------|
//! | 0   | Bool     | 1 byte (`0x00` = false, `0x01` = true)   |
//! | 1   | Int      | 8 bytes, big-endian i64                  |
//! | 2   | Float    | 8 bytes, big-endian f64 bits             |
//! | 3   | Str      | `[u16 len][utf-8 bytes]`                 |
//! | 4   | Bytes    | `[u16 len][raw bytes]`                   |
//! | 5   | IntVec   | `[u16 count][i64 BE]…`                   |
//! | 6   | FloatVec | `[u16 count][f64 BE]…`                   |
//!
//! All multi-byte integers are **big-endian**; the sorted entry order is part
//! of the wire contract.
//!
//! # Construction invariants
//!
//! Every constructor validates its input, so a `ByteMap` in hand always
//! holds a well-formed buffer and read paths never fail. Buffers received
//! from the wire go through [`ByteMap::from_bytes`], which walks and checks
//! the entire buffer once.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

const U16_SIZE: usize = std::mem::size_of::<u16>();
const U64_SIZE: usize = std::mem::size_of::<u64>();

/// Maximum byte length of a single key, string, or bytes value (u16 prefix).
pub const MAX_ITEM_LEN: usize = u16::MAX as usize;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while constructing or decoding a [`ByteMap`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ByteMapError {
    /// The buffer ended in the middle of an entry.
    #[error("truncated entry at offset {0}")]
    Truncated(usize),

    /// An entry carried an unknown value tag.
    #[error("invalid value tag {tag} at offset {offset}")]
    InvalidTag {
        /// The tag byte that was read.
        tag: u8,
        /// Byte offset of the offending entry.
        offset: usize,
    },

    /// A key, string, or array exceeded the u16 length prefix.
    #[error("item too large: {0} bytes")]
    ItemTooLarge(usize),

    /// A key was not valid UTF-8.
    #[error("key is not valid UTF-8 at offset {0}")]
    InvalidKey(usize),

    /// Entries were not in strictly ascending key order.
    #[error("keys out of order: {prev:?} >= {next:?}")]
    OutOfOrder {
        /// The earlier key.
        prev: String,
        /// The key that should have sorted after it.
        next: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// A scalar (or small-array) value stored in a [`ByteMap`].
///
/// `IntVec` / `FloatVec` carry array measurements that the ingest pipeline
/// fans out into one insert per element. `Bool`, `Str`, and `Bytes` are
/// legal dimensions but are not usable as measurements.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean dimension value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string dimension value.
    Str(String),
    /// Raw byte dimension value.
    Bytes(Vec<u8>),
    /// Array of integers (measurement fan-out).
    IntVec(Vec<i64>),
    /// Array of floats (measurement fan-out).
    FloatVec(Vec<f64>),
}

impl Value {
    /// Numeric view of this value, coercing `Int` to `f64`.
    ///
    /// Returns `None` for non-scalar-numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::Bytes(_) => 4,
            Value::IntVec(_) => 5,
            Value::FloatVec(_) => 6,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// ByteMap Core
// ------------------------------------------------------------------------------------------------

/// An immutable sorted map serialized into one contiguous buffer.
///
/// Cheap to clone relative to its contents (one `Vec` copy), byte-comparable,
/// and usable directly as an ordered map key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteMap(Vec<u8>);

impl ByteMap {
    /// An empty map (zero-length buffer).
    pub fn empty() -> Self {
        ByteMap(Vec::new())
    }

    /// Builds a map from already-sorted entries.
    ///
    /// The `BTreeMap` guarantees sorted, unique keys.
    pub fn new(entries: &BTreeMap<String, Value>) -> Result<Self, ByteMapError> {
        let mut buf = Vec::new();
        for (key, value) in entries {
            encode_entry(&mut buf, key, value)?;
        }
        Ok(ByteMap(buf))
    }

    /// Builds a map of `Float` values. Convenience for measurement maps.
    pub fn from_floats(entries: &BTreeMap<String, f64>) -> Result<Self, ByteMapError> {
        let mut buf = Vec::new();
        for (key, value) in entries {
            encode_entry(&mut buf, key, &Value::Float(*value))?;
        }
        Ok(ByteMap(buf))
    }

    /// Builds a map from parallel slices of names and values.
    ///
    /// The names **must already be sorted** and unique — this is the
    /// group-by contract: regrouped keys are constructed from group-by
    /// names in their declared (sorted) order so that equal logical maps
    /// are byte-equal.
    pub fn from_sorted_keys_and_values(
        names: &[&str],
        values: &[Value],
    ) -> Result<Self, ByteMapError> {
        let mut buf = Vec::new();
        let mut prev: Option<&str> = None;
        for (name, value) in names.iter().zip(values.iter()) {
            if let Some(p) = prev
                && p >= *name
            {
                return Err(ByteMapError::OutOfOrder {
                    prev: p.to_string(),
                    next: name.to_string(),
                });
            }
            encode_entry(&mut buf, name, value)?;
            prev = Some(name);
        }
        Ok(ByteMap(buf))
    }

    /// Builds a single-entry map.
    pub fn singleton(name: &str, value: Value) -> Result<Self, ByteMapError> {
        let mut buf = Vec::new();
        encode_entry(&mut buf, name, &value)?;
        Ok(ByteMap(buf))
    }

    /// Validates and adopts a wire buffer.
    ///
    /// Walks every entry, checking lengths, tags, UTF-8 keys, and sort
    /// order, so that subsequent reads cannot fail.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ByteMapError> {
        let mut offset = 0;
        let mut prev_key: Option<String> = None;
        while offset < buf.len() {
            let (key, value_end) = decode_entry(buf, offset)?;
            if decode_value_at(buf, offset).is_none() {
                return Err(ByteMapError::Truncated(offset));
            }
            if let Some(prev) = &prev_key
                && prev.as_str() >= key
            {
                return Err(ByteMapError::OutOfOrder {
                    prev: prev.clone(),
                    next: key.to_string(),
                });
            }
            prev_key = Some(key.to_string());
            offset = value_end;
        }
        Ok(ByteMap(buf.to_vec()))
    }

    /// The underlying wire buffer.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when the map holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a value by key.
    ///
    /// Entries are sorted, so the scan stops as soon as it passes the
    /// requested key.
    pub fn get(&self, name: &str) -> Option<Value> {
        for (key, value) in self.iter() {
            match key.cmp(name) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Some(value),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }

    /// Numeric lookup, coercing `Int` to `f64`.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    /// Returns a new map holding only the entries whose key appears in
    /// `keys`. Output order follows this map's (sorted) entry order, so
    /// `keys` itself need not be sorted.
    pub fn slice(&self, keys: &[String]) -> ByteMap {
        let mut buf = Vec::new();
        let mut offset = 0;
        while offset < self.0.len() {
            // Entries are valid by construction.
            let Ok((key, end)) = decode_entry(&self.0, offset) else {
                break;
            };
            if keys.iter().any(|k| k == key) {
                buf.extend_from_slice(&self.0[offset..end]);
            }
            offset = end;
        }
        ByteMap(buf)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            buf: &self.0,
            offset: 0,
        }
    }
}

impl fmt::Debug for ByteMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Entry iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over `(key, value)` pairs of a [`ByteMap`], in key order.
pub struct Entries<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a str, Value);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        // Buffers are validated on construction; a decode failure here
        // means memory corruption, and ending iteration is the safe answer.
        let (key, end) = decode_entry(self.buf, self.offset).ok()?;
        let value = decode_value_at(self.buf, self.offset)?;
        self.offset = end;
        Some((key, value))
    }
}

// ------------------------------------------------------------------------------------------------
// Entry codec
// ------------------------------------------------------------------------------------------------

fn push_u16(buf: &mut Vec<u8>, v: usize) -> Result<(), ByteMapError> {
    let v = u16::try_from(v).map_err(|_| ByteMapError::ItemTooLarge(v))?;
    buf.extend_from_slice(&v.to_be_bytes());
    Ok(())
}

fn encode_entry(buf: &mut Vec<u8>, key: &str, value: &Value) -> Result<(), ByteMapError> {
    push_u16(buf, key.len())?;
    buf.extend_from_slice(key.as_bytes());
    buf.push(value.tag());
    match value {
        Value::Bool(b) => buf.push(u8::from(*b)),
        Value::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::Float(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::Str(s) => {
            push_u16(buf, s.len())?;
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            push_u16(buf, b.len())?;
            buf.extend_from_slice(b);
        }
        Value::IntVec(vs) => {
            push_u16(buf, vs.len())?;
            for v in vs {
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        Value::FloatVec(vs) => {
            push_u16(buf, vs.len())?;
            for v in vs {
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
        }
    }
    Ok(())
}

fn read_u16_at(buf: &[u8], offset: usize) -> Result<usize, ByteMapError> {
    if offset + U16_SIZE > buf.len() {
        return Err(ByteMapError::Truncated(offset));
    }
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize)
}

/// Decodes the entry starting at `offset`, returning its key and the offset
/// one past its value bytes.
fn decode_entry(buf: &[u8], offset: usize) -> Result<(&str, usize), ByteMapError> {
    let key_len = read_u16_at(buf, offset)?;
    let key_start = offset + U16_SIZE;
    let key_end = key_start + key_len;
    if key_end + 1 > buf.len() {
        return Err(ByteMapError::Truncated(offset));
    }
    let key =
        std::str::from_utf8(&buf[key_start..key_end]).map_err(|_| ByteMapError::InvalidKey(offset))?;

    let tag = buf[key_end];
    let body = key_end + 1;
    let value_end = match tag {
        0 => body + 1,
        1 | 2 => body + U64_SIZE,
        3 | 4 => body + U16_SIZE + read_u16_at(buf, body)?,
        5 | 6 => body + U16_SIZE + read_u16_at(buf, body)? * U64_SIZE,
        other => return Err(ByteMapError::InvalidTag { tag: other, offset }),
    };
    if value_end > buf.len() {
        return Err(ByteMapError::Truncated(offset));
    }
    Ok((key, value_end))
}

/// Decodes the value of the (already validated) entry starting at `offset`.
fn decode_value_at(buf: &[u8], offset: usize) -> Option<Value> {
    let key_len = read_u16_at(buf, offset).ok()?;
    let key_end = offset + U16_SIZE + key_len;
    let tag = *buf.get(key_end)?;
    let body = key_end + 1;
    let value = match tag {
        0 => Value::Bool(*buf.get(body)? != 0),
        1 => Value::Int(i64::from_be_bytes(
            buf.get(body..body + U64_SIZE)?.try_into().ok()?,
        )),
        2 => Value::Float(f64::from_bits(u64::from_be_bytes(
            buf.get(body..body + U64_SIZE)?.try_into().ok()?,
        ))),
        3 => {
            let len = read_u16_at(buf, body).ok()?;
            let start = body + U16_SIZE;
            Value::Str(std::str::from_utf8(buf.get(start..start + len)?).ok()?.to_string())
        }
        4 => {
            let len = read_u16_at(buf, body).ok()?;
            let start = body + U16_SIZE;
            Value::Bytes(buf.get(start..start + len)?.to_vec())
        }
        5 => {
            let count = read_u16_at(buf, body).ok()?;
            let mut vs = Vec::with_capacity(count);
            let mut at = body + U16_SIZE;
            for _ in 0..count {
                vs.push(i64::from_be_bytes(
                    buf.get(at..at + U64_SIZE)?.try_into().ok()?,
                ));
                at += U64_SIZE;
            }
            Value::IntVec(vs)
        }
        6 => {
            let count = read_u16_at(buf, body).ok()?;
            let mut vs = Vec::with_capacity(count);
            let mut at = body + U16_SIZE;
            for _ in 0..count {
                vs.push(f64::from_bits(u64::from_be_bytes(
                    buf.get(at..at + U64_SIZE)?.try_into().ok()?,
                )));
                at += U64_SIZE;
            }
            Value::FloatVec(vs)
        }
        _ => return None,
    };
    Some(value)
}
