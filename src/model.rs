//! Record model and graph-node layout constants.
//!
//! A record is content-addressed by a 32-byte hash and carries an ordered
//! list of links to prior records, forming a DAG. Each record also has a
//! graph node in `graph.bin`, packed little-endian:
//!
//! | field                    | offset      | size |
//! |--------------------------|-------------|------|
//! | `weight_lo`              | 0           | 8    |
//! | `weight_hi`              | 8           | 2    |
//! | `linked_count`           | 10          | 8    |
//! | `link_count`             | 18          | 1    |
//! | `linked_record_goff[i]`  | 19 + 8 * i  | 8    |
//!
//! Link slots are signed: `-1` marks a hole (the target record has not
//! arrived yet). The weight is an 80-bit counter split across
//! `weight_lo`/`weight_hi`.

pub const HASH_SIZE: usize = 32;
pub type RecordHash = [u8; HASH_SIZE];

/// Byte offset of a record's graph node in `graph.bin`.
pub type Goff = u64;
/// Byte offset of a record's bytes in `records.log`.
pub type Doff = u64;

/// Upper bound on the number of links a record may carry.
pub const MAX_LINKS: usize = 256;

pub(crate) const NODE_WEIGHT_LO_OFFSET: u64 = 0;
pub(crate) const NODE_WEIGHT_HI_OFFSET: u64 = 8;
pub(crate) const NODE_LINKED_COUNT_OFFSET: u64 = 10;
pub(crate) const NODE_LINK_COUNT_OFFSET: u64 = 18;
pub(crate) const NODE_SLOTS_OFFSET: u64 = 19;

/// Slot value marking an unresolved link.
pub(crate) const HOLE: i64 = -1;

/// Total node size for a given link count.
pub fn node_stride(link_count: usize) -> u64 {
    NODE_SLOTS_OFFSET + 8 * link_count as u64
}

/// A validated record as submitted by the caller. The core does not verify
/// signatures or proof of work; `hash`, `score`, and `links` are taken at
/// face value.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    /// Serialized record payload, stored verbatim in the data log.
    pub bytes: &'a [u8],
    pub id: &'a [u8],
    pub owner: &'a [u8],
    pub hash: RecordHash,
    /// Seconds since epoch.
    pub ts: u64,
    /// Seconds; expiry is `ts + ttl`.
    pub ttl: u64,
    /// Work score contributed to every ancestor.
    pub score: u32,
    pub change_owner: Option<&'a [u8]>,
    pub sel0: Option<&'a [u8]>,
    pub sel1: Option<&'a [u8]>,
    /// Hashes of prior records this record vouches for.
    pub links: &'a [RecordHash],
}

/// One row streamed by [`crate::RecordStore::get_matching`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRecord {
    pub doff: Doff,
    pub dlen: u64,
    pub goff: Goff,
    pub ts: u64,
    pub exp: u64,
    pub owner: Vec<u8>,
    pub change_owner: Option<Vec<u8>>,
    /// `(weight_lo, weight_hi)` at read time; may lag behind convergence.
    pub weight: (u64, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub record_count: u64,
    pub data_size: u64,
}

/// 80-bit saturating add of `score` onto `(lo, hi)`.
pub(crate) fn weight_add(lo: u64, hi: u16, score: u32) -> (u64, u16) {
    let (new_lo, carry) = lo.overflowing_add(u64::from(score));
    if !carry {
        return (new_lo, hi);
    }
    match hi.checked_add(1) {
        Some(new_hi) => (new_lo, new_hi),
        None => (u64::MAX, u16::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_matches_layout() {
        assert_eq!(node_stride(0), 19);
        assert_eq!(node_stride(2), 35);
        assert_eq!(node_stride(MAX_LINKS), 19 + 256 * 8);
    }

    #[test]
    fn weight_add_carries_into_high_word() {
        assert_eq!(weight_add(0, 0, 7), (7, 0));
        assert_eq!(weight_add(u64::MAX, 0, 1), (0, 1));
        assert_eq!(weight_add(u64::MAX - 2, 3, 5), (2, 4));
    }

    #[test]
    fn weight_add_saturates_at_80_bits() {
        assert_eq!(weight_add(u64::MAX, u16::MAX, 1), (u64::MAX, u16::MAX));
        // No carry out of the low word leaves the high word alone.
        assert_eq!(weight_add(1, u16::MAX, 1), (2, u16::MAX));
    }
}
