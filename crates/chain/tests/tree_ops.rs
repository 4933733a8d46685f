use spv_chain::{HeaderTree, HeaderTreeError};
use spv_consensus::{chain_params, ChainParams, Network};
use spv_pow::difficulty::{compact_to_target, hash_meets_target};
use spv_primitives::block::BlockHeader;
use spv_primitives::Hash256;

fn mine_header(
    params: &ChainParams,
    prev_block: Hash256,
    time: u32,
    merkle_root: Hash256,
) -> BlockHeader {
    let bits = params.genesis_block.bits;
    let target = compact_to_target(bits).expect("target");
    let mut header = BlockHeader {
        version: 2,
        prev_block,
        merkle_root,
        time,
        bits,
        nonce: 0,
    };
    while !hash_meets_target(&params.pow_hash(&header), &target) {
        header.nonce += 1;
    }
    header
}

fn build_chain(params: &ChainParams, length: usize) -> Vec<BlockHeader> {
    let base_time = params.genesis_block.time;
    let mut headers = Vec::with_capacity(length);
    let mut prev = params.hash_genesis_block;
    for height in 1..=length {
        let mut merkle_root = [0u8; 32];
        merkle_root[0] = (height & 0xff) as u8;
        let header = mine_header(params, prev, base_time + height as u32 * 600, merkle_root);
        prev = params.header_hash(&header);
        headers.push(header);
    }
    headers
}

#[test]
fn genesis_seeding_rules() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    assert_eq!(tree.best_height(), -1);

    tree.set_genesis(params.genesis_block).expect("set genesis");
    assert_eq!(tree.best_height(), 0);
    assert!(matches!(
        tree.set_genesis(params.genesis_block),
        Err(HeaderTreeError::AlreadyInitialized)
    ));

    let mut other = HeaderTree::new(&params);
    let mut wrong = params.genesis_block;
    wrong.time += 1;
    assert!(matches!(
        other.set_genesis(wrong),
        Err(HeaderTreeError::GenesisMismatch)
    ));
}

#[test]
fn insert_requires_genesis_and_parent() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    let orphan = mine_header(&params, [7u8; 32], params.genesis_block.time + 600, [0u8; 32]);
    assert!(matches!(
        tree.insert_header(&orphan),
        Err(HeaderTreeError::NotInitialized)
    ));

    tree.set_genesis(params.genesis_block).expect("set genesis");
    assert!(matches!(
        tree.insert_header(&orphan),
        Err(HeaderTreeError::MissingParent)
    ));
}

#[test]
fn insert_extends_best_chain_and_dedupes() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    tree.set_genesis(params.genesis_block).expect("set genesis");

    let headers = build_chain(&params, 5);
    for header in &headers {
        assert_eq!(tree.insert_header(header).expect("insert"), true);
    }
    assert_eq!(tree.best_height(), 5);
    assert_eq!(tree.header_count(), 6);

    // Re-inserting is harmless and reports no best-chain change.
    assert_eq!(tree.insert_header(&headers[2]).expect("reinsert"), false);
    assert_eq!(tree.header_count(), 6);

    let tip = tree.get_header_at_height(-1).expect("tip");
    assert_eq!(tip.height, 5);
    assert!(tip.in_best_chain);
    let offset = tree.get_header_at_height(-3).expect("offset");
    assert_eq!(offset.height, 3);
    assert!(tree.get_header_at_height(6).is_err());

    let parent = tree.get_header_at_height(4).expect("parent");
    assert!(tip.chain_work > parent.chain_work);
}

#[test]
fn insert_rejects_bad_pow() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    tree.set_genesis(params.genesis_block).expect("set genesis");

    let bits = params.genesis_block.bits;
    let target = compact_to_target(bits).expect("target");
    let mut header = BlockHeader {
        version: 2,
        prev_block: params.hash_genesis_block,
        merkle_root: [9u8; 32],
        time: params.genesis_block.time + 600,
        bits,
        nonce: 0,
    };
    // Find a nonce whose hash misses the target.
    while hash_meets_target(&params.pow_hash(&header), &target) {
        header.nonce += 1;
    }
    assert!(matches!(
        tree.insert_header(&header),
        Err(HeaderTreeError::Pow(_))
    ));
}

#[test]
fn locator_backs_off_geometrically() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    tree.set_genesis(params.genesis_block).expect("set genesis");
    for header in build_chain(&params, 30) {
        tree.insert_header(&header).expect("insert");
    }

    let locator = tree.get_locator_hashes(-1);
    let tip = tree.get_header_at_height(-1).expect("tip");
    assert_eq!(locator[0], tip.hash);
    assert_eq!(*locator.last().expect("genesis"), params.hash_genesis_block);
    // Dense near the tip, then sparse: far fewer entries than headers.
    assert!(locator.len() > 10);
    assert!(locator.len() < 20);

    let anchored = tree.get_locator_hashes(1);
    let below_tip = tree.get_header_at_height(29).expect("below tip");
    assert_eq!(anchored[0], below_tip.hash);
}

#[test]
fn header_before_timestamp() {
    let params = chain_params(Network::Regtest);
    let mut tree = HeaderTree::new(&params);
    tree.set_genesis(params.genesis_block).expect("set genesis");
    for header in build_chain(&params, 10) {
        tree.insert_header(&header).expect("insert");
    }

    let base_time = params.genesis_block.time;
    let header = tree.get_header_before(base_time + 5 * 600 + 1).expect("before");
    assert_eq!(header.height, 5);

    let tip = tree.get_header_before(u32::MAX).expect("tip");
    assert_eq!(tip.height, 10);

    assert!(tree.get_header_before(0).is_err());
}
