//! In-memory header tree with best-chain selection and file snapshots.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use primitive_types::U256;
use spv_consensus::ChainParams;
use spv_pow::difficulty::{block_proof, CompactError};
use spv_pow::validation::{check_proof_of_work, PowError};
use spv_primitives::block::{BlockHeader, HEADER_SIZE};
use spv_primitives::encoding::{DecodeError, Decoder, Encoder};
use spv_primitives::merkleblock::MerkleBlock;
use spv_primitives::Hash256;

const SNAPSHOT_MAGIC: [u8; 4] = *b"SPVH";
const SNAPSHOT_VERSION: u32 = 1;
const LOAD_PROGRESS_INTERVAL: usize = 1_000;

/// Callback invoked during snapshot load with (headers inserted, total).
pub type LoadProgress<'a> = &'a mut dyn FnMut(usize, usize);

#[derive(Debug)]
pub enum HeaderTreeError {
    AlreadyInitialized,
    NotInitialized,
    GenesisMismatch,
    NotFound,
    MissingParent,
    Pow(PowError),
    Decode(DecodeError),
    Corrupt(&'static str),
    Io(std::io::Error),
}

impl std::fmt::Display for HeaderTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderTreeError::AlreadyInitialized => write!(f, "header tree already initialized"),
            HeaderTreeError::NotInitialized => write!(f, "header tree has no genesis"),
            HeaderTreeError::GenesisMismatch => {
                write!(f, "genesis header does not match chain parameters")
            }
            HeaderTreeError::NotFound => write!(f, "header not found"),
            HeaderTreeError::MissingParent => write!(f, "parent header not in tree"),
            HeaderTreeError::Pow(err) => write!(f, "{err}"),
            HeaderTreeError::Decode(err) => write!(f, "{err}"),
            HeaderTreeError::Corrupt(message) => write!(f, "snapshot corrupt: {message}"),
            HeaderTreeError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeaderTreeError {}

impl From<PowError> for HeaderTreeError {
    fn from(err: PowError) -> Self {
        HeaderTreeError::Pow(err)
    }
}

impl From<CompactError> for HeaderTreeError {
    fn from(err: CompactError) -> Self {
        HeaderTreeError::Pow(PowError::Compact(err))
    }
}

impl From<DecodeError> for HeaderTreeError {
    fn from(err: DecodeError) -> Self {
        HeaderTreeError::Decode(err)
    }
}

impl From<std::io::Error> for HeaderTreeError {
    fn from(err: std::io::Error) -> Self {
        HeaderTreeError::Io(err)
    }
}

/// A block header plus its derived chain position.
#[derive(Clone, Debug)]
pub struct ChainHeader {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub in_best_chain: bool,
}

/// A merkle block annotated with its position in the header tree.
#[derive(Clone, Debug)]
pub struct ChainMerkleBlock {
    pub merkle_block: MerkleBlock,
    pub height: i32,
    pub chain_work: U256,
    pub in_best_chain: bool,
}

pub struct HeaderTree {
    params: ChainParams,
    nodes: HashMap<Hash256, ChainHeader>,
    // Parents always precede children; snapshots are written in this order.
    insertion_order: Vec<Hash256>,
    // Best-chain hash per height.
    best_chain: Vec<Hash256>,
}

impl HeaderTree {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            params: params.clone(),
            nodes: HashMap::new(),
            insertion_order: Vec::new(),
            best_chain: Vec::new(),
        }
    }

    /// Seed an empty tree with the chain's genesis header.
    pub fn set_genesis(&mut self, header: BlockHeader) -> Result<(), HeaderTreeError> {
        if !self.nodes.is_empty() {
            return Err(HeaderTreeError::AlreadyInitialized);
        }
        let hash = self.params.header_hash(&header);
        if hash != self.params.hash_genesis_block {
            return Err(HeaderTreeError::GenesisMismatch);
        }
        let chain_work = block_proof(header.bits)?;
        self.nodes.insert(
            hash,
            ChainHeader {
                header,
                hash,
                height: 0,
                chain_work,
                in_best_chain: true,
            },
        );
        self.insertion_order.push(hash);
        self.best_chain.push(hash);
        Ok(())
    }

    /// Insert a header, enforcing proof of work. Returns `true` iff the
    /// insertion extended or replaced the best chain; an already-present
    /// header returns `false`.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<bool, HeaderTreeError> {
        self.insert_with_options(header, true)
    }

    fn insert_with_options(
        &mut self,
        header: &BlockHeader,
        check_pow: bool,
    ) -> Result<bool, HeaderTreeError> {
        if self.nodes.is_empty() {
            return Err(HeaderTreeError::NotInitialized);
        }

        let hash = self.params.header_hash(header);
        if self.nodes.contains_key(&hash) {
            return Ok(false);
        }

        let (parent_height, parent_work) = {
            let parent = self
                .nodes
                .get(&header.prev_block)
                .ok_or(HeaderTreeError::MissingParent)?;
            (parent.height, parent.chain_work)
        };

        if check_pow {
            check_proof_of_work(header, &self.params)?;
        }

        let chain_work = parent_work + block_proof(header.bits)?;
        let new_best = chain_work > self.total_work();

        self.nodes.insert(
            hash,
            ChainHeader {
                header: *header,
                hash,
                height: parent_height + 1,
                chain_work,
                in_best_chain: false,
            },
        );
        self.insertion_order.push(hash);

        if new_best {
            self.adopt_best_chain(hash);
        }
        Ok(new_best)
    }

    /// Re-mark the best chain so it ends at `tip`. `tip` must carry more
    /// work than the current best tip.
    fn adopt_best_chain(&mut self, tip: Hash256) {
        let mut branch = Vec::new();
        let mut cursor = tip;
        while let Some(node) = self.nodes.get(&cursor) {
            if node.in_best_chain {
                break;
            }
            branch.push(cursor);
            cursor = node.header.prev_block;
        }

        // `cursor` is now the fork point (or genesis's null parent, which
        // never happens past set_genesis).
        let fork_height = self
            .nodes
            .get(&cursor)
            .map(|node| node.height)
            .unwrap_or(-1);

        for stale in self.best_chain.drain((fork_height + 1) as usize..) {
            if let Some(node) = self.nodes.get_mut(&stale) {
                node.in_best_chain = false;
            }
        }
        for hash in branch.into_iter().rev() {
            if let Some(node) = self.nodes.get_mut(&hash) {
                node.in_best_chain = true;
            }
            self.best_chain.push(hash);
        }
    }

    pub fn has_header(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<&ChainHeader, HeaderTreeError> {
        self.nodes.get(hash).ok_or(HeaderTreeError::NotFound)
    }

    /// Best-chain header by height; negative heights count back from the
    /// tip (`-1` is the tip itself).
    pub fn get_header_at_height(&self, height: i32) -> Result<&ChainHeader, HeaderTreeError> {
        let best = self.best_height();
        let resolved = if height < 0 { best + 1 + height } else { height };
        if resolved < 0 || resolved > best {
            return Err(HeaderTreeError::NotFound);
        }
        let hash = self.best_chain[resolved as usize];
        self.get_header(&hash)
    }

    /// The best-chain header of greatest height whose timestamp is at or
    /// before `unix_time`.
    pub fn get_header_before(&self, unix_time: u32) -> Result<&ChainHeader, HeaderTreeError> {
        for hash in self.best_chain.iter().rev() {
            let node = self.nodes.get(hash).ok_or(HeaderTreeError::NotFound)?;
            if node.header.time <= unix_time {
                return Ok(node);
            }
        }
        Err(HeaderTreeError::NotFound)
    }

    /// Block locator for `getheaders`: unit steps for the first ten entries,
    /// then doubling back-off, ending at genesis. `start` counts down from
    /// the tip (`-1` anchors at the tip itself, `1` one below it).
    pub fn get_locator_hashes(&self, start: i32) -> Vec<Hash256> {
        let best = self.best_height();
        if best < 0 {
            return Vec::new();
        }
        let mut height = if start < 0 {
            (best + 1 + start).max(0)
        } else {
            (best - start).max(0)
        };

        let mut out = Vec::new();
        let mut step = 1i32;
        loop {
            out.push(self.best_chain[height as usize]);
            if height == 0 {
                break;
            }
            if out.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = (height - step).max(0);
        }
        out
    }

    pub fn best_height(&self) -> i32 {
        self.best_chain.len() as i32 - 1
    }

    pub fn best_header(&self) -> Result<&ChainHeader, HeaderTreeError> {
        self.get_header_at_height(-1)
    }

    pub fn total_work(&self) -> U256 {
        self.best_chain
            .last()
            .and_then(|hash| self.nodes.get(hash))
            .map(|node| node.chain_work)
            .unwrap_or_default()
    }

    pub fn header_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.insertion_order.clear();
        self.best_chain.clear();
    }

    /// Replace the tree contents with a snapshot previously written by
    /// [`flush_to_file`](Self::flush_to_file).
    pub fn load_from_file(
        &mut self,
        path: &Path,
        check_pow: bool,
        mut progress: Option<LoadProgress<'_>>,
    ) -> Result<(), HeaderTreeError> {
        let bytes = fs::read(path)?;
        let mut decoder = Decoder::new(&bytes);

        let magic = decoder.read_fixed::<4>()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(HeaderTreeError::Corrupt("bad magic"));
        }
        let version = decoder.read_u32_le()?;
        if version != SNAPSHOT_VERSION {
            return Err(HeaderTreeError::Corrupt("unknown snapshot version"));
        }
        let count = decoder.read_u64_le()?;
        let count = usize::try_from(count).map_err(|_| HeaderTreeError::Corrupt("bad count"))?;
        let expected = count
            .checked_mul(HEADER_SIZE)
            .ok_or(HeaderTreeError::Corrupt("bad count"))?;
        if decoder.remaining() != expected {
            return Err(HeaderTreeError::Corrupt("truncated header records"));
        }
        if count == 0 {
            return Err(HeaderTreeError::Corrupt("snapshot has no genesis"));
        }

        self.clear();
        let result = self.load_headers_from(&mut decoder, count, check_pow, &mut progress);
        if result.is_err() {
            // A half-loaded tree is worse than an empty one.
            self.clear();
        }
        result
    }

    fn load_headers_from(
        &mut self,
        decoder: &mut Decoder<'_>,
        count: usize,
        check_pow: bool,
        progress: &mut Option<LoadProgress<'_>>,
    ) -> Result<(), HeaderTreeError> {
        use spv_primitives::encoding::Decodable;

        for index in 0..count {
            let header = <BlockHeader as Decodable>::consensus_decode(decoder)?;
            if index == 0 {
                self.set_genesis(header)?;
                if check_pow {
                    check_proof_of_work(&header, &self.params)?;
                }
            } else {
                self.insert_with_options(&header, check_pow)?;
            }
            if index % LOAD_PROGRESS_INTERVAL == 0 {
                if let Some(callback) = progress.as_mut() {
                    callback(index + 1, count);
                }
            }
        }
        if let Some(callback) = progress.as_mut() {
            callback(count, count);
        }
        Ok(())
    }

    /// Write the whole tree to `path`, atomically (write-then-rename).
    pub fn flush_to_file(&self, path: &Path) -> Result<(), HeaderTreeError> {
        let mut encoder = Encoder::with_capacity(16 + self.insertion_order.len() * HEADER_SIZE);
        encoder.write_bytes(&SNAPSHOT_MAGIC);
        encoder.write_u32_le(SNAPSHOT_VERSION);
        encoder.write_u64_le(self.insertion_order.len() as u64);
        for hash in &self.insertion_order {
            let node = self.nodes.get(hash).ok_or(HeaderTreeError::NotFound)?;
            encoder.write_bytes(&node.header.consensus_encode());
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, encoder.into_inner())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path)?;
        }
        Ok(())
    }
}
