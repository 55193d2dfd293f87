//! # Partition Module
//!
//! Follower partition routing. A cluster splits each stream into `N`
//! partitions by hashing a stable subset of every point's dimensions; a
//! follower configured as partition `p` persists only the records it owns
//! and skips the rest (their WAL offsets still advance).
//!
//! The hash is **FNV-1a, 32-bit**, computed over the dims buffer — the
//! serialized [`ByteMap`] is already sorted and byte-stable, so equal
//! logical dims always land in the same partition, on every node.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use crate::bytemap::ByteMap;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a 32-bit hash of a byte buffer.
#[inline]
pub fn hash32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ------------------------------------------------------------------------------------------------
// PartitionSpec
// ------------------------------------------------------------------------------------------------

/// A follower's partition predicate: this node owns partition `partition`
/// of `num_partitions`, keyed by the named dimensions.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Total number of partitions the stream is split into.
    pub num_partitions: u32,

    /// The partition index this node is responsible for.
    pub partition: u32,

    /// Dimension keys hashed to pick a partition. Empty means the full
    /// dims buffer.
    pub keys: Vec<String>,
}

impl PartitionSpec {
    /// True when this node owns the record with the given dimensions.
    pub fn owns(&self, dims: &ByteMap) -> bool {
        if self.num_partitions <= 1 {
            return true;
        }
        let hash = if self.keys.is_empty() {
            hash32(dims.as_bytes())
        } else {
            hash32(dims.slice(&self.keys).as_bytes())
        };
        hash % self.num_partitions == self.partition
    }
}
