//! Header chain storage: a rooted forest of block headers with cumulative
//! proof-of-work bookkeeping, locator generation, and file snapshots.

pub mod tree;

pub use tree::{ChainHeader, ChainMerkleBlock, HeaderTree, HeaderTreeError, LoadProgress};
