//! Bloom filter value object for `filterload` (BIP 37).
//!
//! Filter construction is the wallet's business; the sync core only carries
//! the finished filter to the peer.

/// Largest serialized filter a peer will accept, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Largest hash function count a peer will accept.
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub n_hash_funcs: u32,
    pub n_tweak: u32,
    pub n_flags: u8,
}

impl BloomFilter {
    pub fn new(data: Vec<u8>, n_hash_funcs: u32, n_tweak: u32, n_flags: u8) -> Self {
        Self {
            data,
            n_hash_funcs,
            n_tweak,
            n_flags,
        }
    }

    /// Whether a filter has been supplied at all. An unset filter is never
    /// sent to the peer.
    pub fn is_set(&self) -> bool {
        !self.data.is_empty()
    }

    /// Whether the filter fits the protocol's size limits.
    pub fn is_within_limits(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.n_hash_funcs <= MAX_BLOOM_HASH_FUNCS
    }
}
