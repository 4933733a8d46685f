use primitive_types::U256;
use spv_consensus::ChainParams;
use spv_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashAboveTarget => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Verify `pow_hash(header) <= target(header.bits)` and that the claimed
/// target is within the chain's limit.
pub fn check_proof_of_work(header: &BlockHeader, params: &ChainParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash = params.pow_hash(header);
    let hash_value = U256::from_little_endian(&hash);
    if hash_value > target {
        return Err(PowError::HashAboveTarget);
    }

    Ok(())
}
