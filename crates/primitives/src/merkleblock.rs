//! Merkle blocks: a block header plus a partial merkle tree proving which
//! transactions of the block match a peer-installed bloom filter.

use crate::block::BlockHeader;
use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::Hash256;

const MAX_BLOCK_SIZE: u32 = 1_000_000;
const MIN_SERIALIZED_TX_SIZE: u32 = 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MerkleProofError {
    NoTransactions,
    TooManyTransactions,
    TooManyHashes,
    LengthMismatch,
    BitsExhausted,
    HashesExhausted,
    DuplicateSubtree,
    UnconsumedBits,
    UnconsumedHashes,
}

impl std::fmt::Display for MerkleProofError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleProofError::NoTransactions => write!(f, "merkle proof covers no transactions"),
            MerkleProofError::TooManyTransactions => {
                write!(f, "merkle proof transaction count exceeds block capacity")
            }
            MerkleProofError::TooManyHashes => {
                write!(f, "merkle proof carries more hashes than transactions")
            }
            MerkleProofError::LengthMismatch => {
                write!(f, "txid and match flag lists differ in length")
            }
            MerkleProofError::BitsExhausted => write!(f, "merkle proof ran out of flag bits"),
            MerkleProofError::HashesExhausted => write!(f, "merkle proof ran out of hashes"),
            MerkleProofError::DuplicateSubtree => {
                write!(f, "merkle proof repeats a subtree hash")
            }
            MerkleProofError::UnconsumedBits => write!(f, "merkle proof left flag bits unused"),
            MerkleProofError::UnconsumedHashes => write!(f, "merkle proof left hashes unused"),
        }
    }
}

impl std::error::Error for MerkleProofError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialMerkleTree {
    pub total_transactions: u32,
    pub bits: Vec<bool>,
    pub hashes: Vec<Hash256>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub proof: PartialMerkleTree,
}

impl MerkleBlock {
    pub fn consensus_encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

impl Encodable for MerkleBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.header.consensus_encode());
        self.proof.consensus_encode(encoder);
    }
}

impl Decodable for MerkleBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;
        let proof = PartialMerkleTree::consensus_decode(decoder)?;
        Ok(Self { header, proof })
    }
}

impl PartialMerkleTree {
    /// Build a proof for `txids` where `matches[i]` marks the transactions to
    /// reveal.
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Result<Self, MerkleProofError> {
        if txids.len() != matches.len() {
            return Err(MerkleProofError::LengthMismatch);
        }
        if txids.is_empty() {
            return Err(MerkleProofError::NoTransactions);
        }
        let total_transactions =
            u32::try_from(txids.len()).map_err(|_| MerkleProofError::TooManyTransactions)?;
        if total_transactions > MAX_BLOCK_SIZE / MIN_SERIALIZED_TX_SIZE {
            return Err(MerkleProofError::TooManyTransactions);
        }

        let mut tree = Self {
            total_transactions,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        let height = tree_height(total_transactions);
        tree.build_subtree(height, 0, txids, matches);
        Ok(tree)
    }

    /// Verify the proof shape and return the merkle root together with the
    /// matched transaction hashes in leaf (block) order.
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<Hash256>), MerkleProofError> {
        if self.total_transactions == 0 {
            return Err(MerkleProofError::NoTransactions);
        }
        if self.total_transactions > MAX_BLOCK_SIZE / MIN_SERIALIZED_TX_SIZE {
            return Err(MerkleProofError::TooManyTransactions);
        }
        if self.hashes.len() > self.total_transactions as usize {
            return Err(MerkleProofError::TooManyHashes);
        }
        if self.bits.len() < self.hashes.len() {
            return Err(MerkleProofError::BitsExhausted);
        }

        let mut cursor = ProofCursor {
            tree: self,
            bit: 0,
            hash: 0,
        };
        let mut matches = Vec::new();
        let root = cursor.descend(tree_height(self.total_transactions), 0, &mut matches)?;

        // Flag bits are serialized in whole bytes; only byte-level padding may
        // remain unused.
        if (cursor.bit + 7) / 8 != (self.bits.len() + 7) / 8 {
            return Err(MerkleProofError::UnconsumedBits);
        }
        if cursor.hash != self.hashes.len() {
            return Err(MerkleProofError::UnconsumedHashes);
        }

        Ok((root, matches))
    }

    fn build_subtree(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let start = (pos as u64) << height;
        let end = ((pos as u64 + 1) << height).min(self.total_transactions as u64);
        let parent_of_match = (start..end).any(|idx| matches[idx as usize]);
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos, txids));
            return;
        }

        self.build_subtree(height - 1, pos * 2, txids, matches);
        if pos * 2 + 1 < tree_width(self.total_transactions, height - 1) {
            self.build_subtree(height - 1, pos * 2 + 1, txids, matches);
        }
    }

    fn subtree_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < tree_width(self.total_transactions, height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        merkle_hash_pair(&left, &right)
    }
}

struct ProofCursor<'a> {
    tree: &'a PartialMerkleTree,
    bit: usize,
    hash: usize,
}

impl ProofCursor<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleProofError> {
        let bit = *self
            .tree
            .bits
            .get(self.bit)
            .ok_or(MerkleProofError::BitsExhausted)?;
        self.bit += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<Hash256, MerkleProofError> {
        let hash = *self
            .tree
            .hashes
            .get(self.hash)
            .ok_or(MerkleProofError::HashesExhausted)?;
        self.hash += 1;
        Ok(hash)
    }

    fn descend(
        &mut self,
        height: u32,
        pos: u32,
        matches: &mut Vec<Hash256>,
    ) -> Result<Hash256, MerkleProofError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                matches.push(hash);
            }
            return Ok(hash);
        }

        let left = self.descend(height - 1, pos * 2, matches)?;
        let right = if pos * 2 + 1 < tree_width(self.tree.total_transactions, height - 1) {
            let right = self.descend(height - 1, pos * 2 + 1, matches)?;
            if right == left {
                return Err(MerkleProofError::DuplicateSubtree);
            }
            right
        } else {
            left
        };

        Ok(merkle_hash_pair(&left, &right))
    }
}

impl Encodable for PartialMerkleTree {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.total_transactions);
        encoder.write_compact_size(self.hashes.len() as u64);
        for hash in &self.hashes {
            encoder.write_hash_le(hash);
        }

        let mut flag_bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (idx, bit) in self.bits.iter().copied().enumerate() {
            if bit {
                flag_bytes[idx / 8] |= 1u8 << (idx % 8);
            }
        }
        encoder.write_var_bytes(&flag_bytes);
    }
}

impl Decodable for PartialMerkleTree {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let total_transactions = decoder.read_u32_le()?;
        if total_transactions > MAX_BLOCK_SIZE / MIN_SERIALIZED_TX_SIZE {
            return Err(DecodeError::InvalidData(
                "too many transactions in merkle proof",
            ));
        }

        let hash_count = decoder.read_compact_size()?;
        let hash_count = usize::try_from(hash_count).map_err(|_| DecodeError::SizeTooLarge)?;
        if hash_count > total_transactions as usize {
            return Err(DecodeError::InvalidData("too many hashes in merkle proof"));
        }
        let mut hashes = Vec::with_capacity(hash_count);
        for _ in 0..hash_count {
            hashes.push(decoder.read_hash_le()?);
        }

        let flag_bytes = decoder.read_var_bytes()?;
        let max_flag_bytes = (total_transactions as usize * 2 + 7) / 8;
        if flag_bytes.len() > max_flag_bytes {
            return Err(DecodeError::InvalidData("too many flag bytes in merkle proof"));
        }

        let mut bits = Vec::with_capacity(flag_bytes.len() * 8);
        for byte in &flag_bytes {
            for bit in 0..8 {
                bits.push((byte & (1u8 << bit)) != 0);
            }
        }

        Ok(Self {
            total_transactions,
            bits,
            hashes,
        })
    }
}

fn tree_height(total_transactions: u32) -> u32 {
    let mut height = 0u32;
    while tree_width(total_transactions, height) > 1 {
        height += 1;
    }
    height
}

fn tree_width(total_transactions: u32, height: u32) -> u32 {
    (total_transactions + (1 << height) - 1) >> height
}

fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}
