//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod bloom;
pub mod encoding;
pub mod hash;
pub mod merkleblock;
pub mod outpoint;
pub mod transaction;

/// 32-byte hash in little-endian byte order, as carried on the wire.
pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader};
pub use bloom::BloomFilter;
pub use hash::{hash_to_hex, sha256, sha256d};
pub use merkleblock::{MerkleBlock, MerkleProofError, PartialMerkleTree};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
