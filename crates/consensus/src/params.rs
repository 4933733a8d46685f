//! Chain parameter definitions.

use spv_primitives::block::BlockHeader;
use spv_primitives::hash::sha256d;
use spv_primitives::Hash256;

use crate::constants::PROTOCOL_VERSION;

/// Hash function applied to a serialized block header. Injected so two
/// synchronizers for different chains can coexist in one process.
pub type BlockHashFn = fn(&[u8]) -> Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub protocol_version: i32,
    pub genesis_block: BlockHeader,
    pub hash_genesis_block: Hash256,
    pub pow_limit: Hash256,
    pub header_hash_fn: BlockHashFn,
    pub pow_hash_fn: BlockHashFn,
}

impl ChainParams {
    pub fn header_hash(&self, header: &BlockHeader) -> Hash256 {
        (self.header_hash_fn)(&header.consensus_encode())
    }

    pub fn pow_hash(&self, header: &BlockHeader) -> Hash256 {
        (self.pow_hash_fn)(&header.consensus_encode())
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a big-endian hex hash (as printed by block explorers) into the
/// little-endian byte order used internally.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }

    if hex.is_empty() || hex.len() > 64 || hex.len() % 2 == 1 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8333,
        protocol_version: PROTOCOL_VERSION,
        genesis_block: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: hash256_from_hex(GENESIS_MERKLE_ROOT).expect("genesis merkle root"),
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        },
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("mainnet genesis hash"),
        pow_limit: hash256_from_hex(
            "00000000ffff0000000000000000000000000000000000000000000000000000",
        )
        .expect("mainnet pow limit"),
        header_hash_fn: sha256d,
        pow_hash_fn: sha256d,
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        message_start: [0x0b, 0x11, 0x09, 0x07],
        default_port: 18_333,
        protocol_version: PROTOCOL_VERSION,
        genesis_block: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: hash256_from_hex(GENESIS_MERKLE_ROOT).expect("genesis merkle root"),
            time: 1_296_688_602,
            bits: 0x1d00ffff,
            nonce: 414_098_458,
        },
        hash_genesis_block: hash256_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        )
        .expect("testnet genesis hash"),
        pow_limit: hash256_from_hex(
            "00000000ffff0000000000000000000000000000000000000000000000000000",
        )
        .expect("testnet pow limit"),
        header_hash_fn: sha256d,
        pow_hash_fn: sha256d,
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        protocol_version: PROTOCOL_VERSION,
        genesis_block: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: hash256_from_hex(GENESIS_MERKLE_ROOT).expect("genesis merkle root"),
            time: 1_296_688_602,
            bits: 0x207fffff,
            nonce: 2,
        },
        hash_genesis_block: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("regtest genesis hash"),
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        header_hash_fn: sha256d,
        pow_hash_fn: sha256d,
    }
}
