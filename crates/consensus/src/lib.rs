//! Chain parameters and protocol constants.

pub mod constants;
pub mod params;

pub use params::{chain_params, hash256_from_hex, BlockHashFn, ChainParams, HexError, Network};
