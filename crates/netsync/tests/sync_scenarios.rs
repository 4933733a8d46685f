//! End-to-end state machine scenarios driven through a recording mock peer.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use spv_consensus::{chain_params, ChainParams, Network};
use spv_netsync::peer::{Peer, PeerConfig, PeerEvents};
use spv_netsync::sync::Synchronizer;
use spv_netsync::wire::{InventoryItem, Message, MSG_BLOCK, MSG_FILTERED_BLOCK, MSG_TX};
use spv_netsync::SyncError;
use spv_pow::difficulty::{compact_to_target, hash_meets_target};
use spv_primitives::block::BlockHeader;
use spv_primitives::bloom::BloomFilter;
use spv_primitives::merkleblock::{MerkleBlock, PartialMerkleTree};
use spv_primitives::outpoint::OutPoint;
use spv_primitives::transaction::{Transaction, TxIn, TxOut};
use spv_primitives::Hash256;

const BLOCK_SPACING: u32 = 600;

// ---------------------------------------------------------------------------
// Mock peer

struct MockPeer {
    events: Weak<dyn PeerEvents>,
    sent: Mutex<Vec<Message>>,
}

impl MockPeer {
    fn new(events: Weak<dyn PeerEvents>) -> Self {
        Self {
            events,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn handler(&self) -> Arc<dyn PeerEvents> {
        self.events.upgrade().expect("synchronizer alive")
    }

    fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().expect("sent lock"))
    }
}

impl Peer for MockPeer {
    fn set(&self, _config: PeerConfig) {}

    fn start(&self) {}

    fn stop(&self) {}

    fn send(&self, message: Message) -> Result<(), SyncError> {
        self.sent.lock().expect("sent lock").push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notification recorder

#[derive(Clone, Debug, PartialEq)]
enum Ev {
    Started,
    Stopped,
    Open,
    Close,
    ConnectionError,
    ProtocolError(String),
    BlockTreeError,
    BlockTreeChanged,
    Status(String),
    FetchingHeaders,
    HeadersSynched,
    FetchingBlocks,
    BlocksSynched,
    MerkleBlock(i32),
    MerkleTx { height: i32, index: usize, count: usize },
    NewTx(Hash256),
}

fn record(sync: &Synchronizer<MockPeer>) -> Arc<Mutex<Vec<Ev>>> {
    let log: Arc<Mutex<Vec<Ev>>> = Arc::new(Mutex::new(Vec::new()));
    let notify = sync.notifications();

    macro_rules! push {
        ($signal:ident, $event:expr) => {{
            let log = Arc::clone(&log);
            notify.$signal.subscribe(move |_| {
                log.lock().expect("event log").push($event);
            });
        }};
    }

    push!(started, Ev::Started);
    push!(stopped, Ev::Stopped);
    push!(open, Ev::Open);
    push!(close, Ev::Close);
    push!(connection_error, Ev::ConnectionError);
    push!(block_tree_error, Ev::BlockTreeError);
    push!(block_tree_changed, Ev::BlockTreeChanged);
    push!(fetching_headers, Ev::FetchingHeaders);
    push!(headers_synched, Ev::HeadersSynched);
    push!(fetching_blocks, Ev::FetchingBlocks);
    push!(blocks_synched, Ev::BlocksSynched);

    {
        let log = Arc::clone(&log);
        notify.protocol_error.subscribe(move |message| {
            log.lock()
                .expect("event log")
                .push(Ev::ProtocolError(message.clone()));
        });
    }
    {
        let log = Arc::clone(&log);
        notify.status.subscribe(move |message| {
            log.lock()
                .expect("event log")
                .push(Ev::Status(message.clone()));
        });
    }
    {
        let log = Arc::clone(&log);
        notify.merkle_block.subscribe(move |block| {
            log.lock()
                .expect("event log")
                .push(Ev::MerkleBlock(block.height));
        });
    }
    {
        let log = Arc::clone(&log);
        notify.merkle_tx.subscribe(move |event| {
            log.lock().expect("event log").push(Ev::MerkleTx {
                height: event.block.height,
                index: event.index,
                count: event.count,
            });
        });
    }
    {
        let log = Arc::clone(&log);
        notify.new_tx.subscribe(move |tx| {
            log.lock().expect("event log").push(Ev::NewTx(tx.txid()));
        });
    }

    log
}

// ---------------------------------------------------------------------------
// Chain fixtures

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

fn tagged_tx(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                hash: [tag; 32],
                index: 0,
            },
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 1_000,
            script_pubkey: vec![0x76, 0xa9, tag],
        }],
        lock_time: 0,
    }
}

/// A block whose header commits to real transactions, some bloom-matched.
struct TestBlock {
    header: BlockHeader,
    txs: Vec<Transaction>,
    matches: Vec<bool>,
}

impl TestBlock {
    fn new(params: &ChainParams, prev_block: Hash256, time: u32, tx_tags: &[(u8, bool)]) -> Self {
        let txs: Vec<Transaction> = tx_tags.iter().map(|(tag, _)| tagged_tx(*tag)).collect();
        let matches: Vec<bool> = tx_tags.iter().map(|(_, matched)| *matched).collect();
        let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
        let proof = PartialMerkleTree::from_txids(&txids, &matches).expect("proof");
        let (root, _) = proof.extract_matches().expect("root");
        let header = mine_header(params, prev_block, time, root);
        Self {
            header,
            txs,
            matches,
        }
    }

    fn merkle_block(&self) -> MerkleBlock {
        let txids: Vec<Hash256> = self.txs.iter().map(Transaction::txid).collect();
        MerkleBlock {
            header: self.header,
            proof: PartialMerkleTree::from_txids(&txids, &self.matches).expect("proof"),
        }
    }

    fn matched_txs(&self) -> Vec<Transaction> {
        self.txs
            .iter()
            .zip(self.matches.iter())
            .filter_map(|(tx, matched)| matched.then(|| tx.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    sync: Synchronizer<MockPeer>,
    events: Arc<Mutex<Vec<Ev>>>,
    params: ChainParams,
    _dir: tempfile::TempDir,
    snapshot: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let params = chain_params(Network::Regtest);
        let sync = Synchronizer::with_peer(params.clone(), MockPeer::new);
        let events = record(&sync);
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot = dir.path().join("headers.dat");
        Self {
            sync,
            events,
            params,
            _dir: dir,
            snapshot,
        }
    }

    fn handler(&self) -> Arc<dyn PeerEvents> {
        self.sync.peer().handler()
    }

    fn drain_events(&self) -> Vec<Ev> {
        std::mem::take(&mut *self.events.lock().expect("event log"))
    }

    fn drain_sent(&self) -> Vec<Message> {
        self.sync.peer().take_sent()
    }

    /// Load (empty) headers, start, open the connection.
    fn boot(&self) {
        self.sync
            .load_headers(&self.snapshot, true, None)
            .expect("load headers");
        self.sync.start("127.0.0.1", 0).expect("start");
        self.handler().on_open();
    }

    /// Feed a header batch plus the terminating empty message.
    fn sync_headers(&self, headers: &[BlockHeader]) {
        self.handler().on_headers(headers.to_vec());
        self.handler().on_headers(Vec::new());
    }

    fn genesis_time(&self) -> u32 {
        self.params.genesis_block.time
    }
}

fn filtered_block_hashes(messages: &[Message]) -> Vec<Hash256> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::GetData(items) => Some(items),
            _ => None,
        })
        .flatten()
        .filter(|item| item.inv_type == MSG_FILTERED_BLOCK)
        .map(|item| item.hash)
        .collect()
}

fn subsequence_positions(events: &[Ev], wanted: &[Ev]) -> bool {
    let mut cursor = 0usize;
    for event in events {
        if cursor < wanted.len() && *event == wanted[cursor] {
            cursor += 1;
        }
    }
    cursor == wanted.len()
}

// ---------------------------------------------------------------------------
// Scenario 1: fresh start, headers to tip

#[test]
fn fresh_start_header_sync() {
    let harness = Harness::new();

    // No snapshot on disk: recovery seeds genesis and still reports synched.
    harness
        .sync
        .load_headers(&harness.snapshot, true, None)
        .expect("load headers");
    let events = harness.drain_events();
    assert!(events.contains(&Ev::BlockTreeError));
    assert!(events.contains(&Ev::HeadersSynched));

    harness.sync.start("127.0.0.1", 0).expect("start");
    harness.handler().on_open();
    assert!(harness.sync.is_connected());

    // Opening requests headers from the tip locator.
    let sent = harness.drain_sent();
    assert!(matches!(sent.as_slice(), [Message::GetHeaders { locator, .. }]
        if locator[0] == harness.params.hash_genesis_block));

    let mut headers = Vec::new();
    let mut prev = harness.params.hash_genesis_block;
    for height in 1u32..=20 {
        let header = mine_header(
            &harness.params,
            prev,
            harness.genesis_time() + height * BLOCK_SPACING,
            [height as u8; 32],
        );
        prev = harness.params.header_hash(&header);
        headers.push(header);
    }
    harness.handler().on_headers(headers.clone());

    // The batch answers with a follow-up getheaders anchored near the tip.
    let sent = harness.drain_sent();
    assert!(matches!(sent.as_slice(), [Message::GetHeaders { locator, .. }]
        if locator[0] == harness.params.header_hash(&headers[18])));

    harness.handler().on_headers(Vec::new());
    assert!(harness.sync.is_headers_synched());
    assert_eq!(harness.sync.best_height(), 20);

    let events = harness.drain_events();
    assert!(subsequence_positions(
        &events,
        &[
            Ev::Started,
            Ev::Open,
            Ev::FetchingHeaders,
            Ev::BlockTreeChanged,
            Ev::HeadersSynched,
        ]
    ));
    assert!(events
        .iter()
        .any(|event| matches!(event, Ev::Status(s) if s.starts_with("Best Height: 20"))));
    assert!(!events.iter().any(|event| matches!(event, Ev::ProtocolError(_))));

    // Invariant: headers_synched implies the snapshot is on disk and loads
    // back to the same tip.
    assert!(harness.snapshot.exists());
    let restored = Synchronizer::with_peer(harness.params.clone(), MockPeer::new);
    restored
        .load_headers(&harness.snapshot, true, None)
        .expect("reload");
    assert_eq!(restored.best_height(), 20);
}

// ---------------------------------------------------------------------------
// Scenario 2: filtered block pipeline from wallet birthday

#[test]
fn sync_blocks_pipeline_delivers_in_order() {
    let harness = Harness::new();
    harness.boot();

    // Heights 1..=4 are plain headers; 5..=9 carry one match each; 10 none.
    let mut headers = Vec::new();
    let mut blocks = Vec::new();
    let mut prev = harness.params.hash_genesis_block;
    for height in 1u32..=4 {
        let header = mine_header(
            &harness.params,
            prev,
            harness.genesis_time() + height * BLOCK_SPACING,
            [height as u8; 32],
        );
        prev = harness.params.header_hash(&header);
        headers.push(header);
    }
    for height in 5u32..=10 {
        let tags: &[(u8, bool)] = if height == 10 {
            &[(100, false), (101, false)]
        } else {
            &[(height as u8 * 2, false), (height as u8 * 2 + 1, true)]
        };
        let block = TestBlock::new(
            &harness.params,
            prev,
            harness.genesis_time() + height * BLOCK_SPACING,
            tags,
        );
        prev = harness.params.header_hash(&block.header);
        headers.push(block.header);
        blocks.push(block);
    }
    harness.sync_headers(&headers);
    assert!(harness.sync.is_headers_synched());
    harness.drain_events();
    harness.drain_sent();

    // Empty locator: start from the header at the wallet birthday.
    let birthday = harness.genesis_time() + 5 * BLOCK_SPACING + 1;
    harness.sync.sync_blocks(&[], birthday).expect("sync blocks");

    let events = harness.drain_events();
    assert!(events.contains(&Ev::FetchingBlocks));
    assert!(events
        .iter()
        .any(|event| matches!(event, Ev::Status(s) if s.contains("Asking for block") && s.contains("height: 5"))));
    let requested = filtered_block_hashes(&harness.drain_sent());
    assert_eq!(requested, vec![harness.params.header_hash(&headers[4])]);

    // Walk the pipeline: merkleblock then its matching transactions.
    for block in &blocks {
        harness.handler().on_merkle_block(block.merkle_block());
        for tx in block.matched_txs() {
            harness.handler().on_tx(tx);
        }
    }

    let events = harness.drain_events();
    let expected: Vec<Ev> = (5..=9)
        .flat_map(|height| {
            vec![
                Ev::MerkleBlock(height),
                Ev::MerkleTx {
                    height,
                    index: 0,
                    count: 1,
                },
            ]
        })
        .chain([Ev::MerkleBlock(10), Ev::BlocksSynched])
        .collect();
    let delivered: Vec<Ev> = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                Ev::MerkleBlock(_) | Ev::MerkleTx { .. } | Ev::BlocksSynched
            )
        })
        .cloned()
        .collect();
    assert_eq!(delivered, expected);
    assert!(harness.sync.is_blocks_synched());
    assert!(!events.iter().any(|event| matches!(event, Ev::ProtocolError(_))));

    // Each block was requested exactly once, in height order.
    let requested = filtered_block_hashes(&harness.drain_sent());
    let expected_hashes: Vec<Hash256> = headers[5..]
        .iter()
        .map(|header| harness.params.header_hash(header))
        .collect();
    assert_eq!(requested, expected_hashes);
}

// ---------------------------------------------------------------------------
// Scenario 3: unknown header mid-fetch restarts header sync

#[test]
fn foreign_merkle_block_triggers_reorg_recovery() {
    let harness = Harness::new();
    harness.boot();

    let mut headers = Vec::new();
    let mut prev = harness.params.hash_genesis_block;
    for height in 1u32..=3 {
        let header = mine_header(
            &harness.params,
            prev,
            harness.genesis_time() + height * BLOCK_SPACING,
            [height as u8; 32],
        );
        prev = harness.params.header_hash(&header);
        headers.push(header);
    }
    harness.sync_headers(&headers);
    harness
        .sync
        .sync_blocks(&[harness.params.hash_genesis_block], 0)
        .expect("sync blocks");
    harness.drain_events();
    harness.drain_sent();

    // A merkle block whose header hangs off an unknown parent.
    let foreign = MerkleBlock {
        header: BlockHeader {
            version: 2,
            prev_block: [0xee; 32],
            merkle_root: [0xdd; 32],
            time: harness.genesis_time() + 42,
            bits: harness.params.genesis_block.bits,
            nonce: 1,
        },
        proof: PartialMerkleTree {
            total_transactions: 1,
            bits: vec![false; 8],
            hashes: vec![[0xdd; 32]],
        },
    };
    harness.handler().on_merkle_block(foreign);

    let events = harness.drain_events();
    assert!(events.contains(&Ev::BlockTreeError));
    assert!(!events.iter().any(|event| matches!(event, Ev::MerkleBlock(_))));
    assert!(!harness.sync.is_headers_synched());

    // Header sync restarts from the tip locator.
    let sent = harness.drain_sent();
    let tip_hash = harness.params.header_hash(&headers[2]);
    assert!(sent.iter().any(|message| matches!(message,
        Message::GetHeaders { locator, .. } if locator[0] == tip_hash)));
}

// ---------------------------------------------------------------------------
// Scenarios 4 and 5: correlation protocol errors

#[test]
fn out_of_order_tx_is_a_protocol_error() {
    let harness = Harness::new();
    harness.boot();

    let block = TestBlock::new(
        &harness.params,
        harness.params.hash_genesis_block,
        harness.genesis_time() + BLOCK_SPACING,
        &[(1, true), (2, true)],
    );
    harness.sync_headers(&[block.header]);
    harness
        .sync
        .sync_blocks(&[harness.params.hash_genesis_block], 0)
        .expect("sync blocks");
    harness.handler().on_merkle_block(block.merkle_block());
    harness.drain_events();

    let matched = block.matched_txs();
    harness.handler().on_tx(matched[1].clone());
    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![Ev::ProtocolError(
            "Transaction received out of order.".to_string()
        )]
    );

    // The buffer is left as-is: the front transaction still goes through.
    harness.handler().on_tx(matched[0].clone());
    let events = harness.drain_events();
    assert!(events.contains(&Ev::MerkleTx {
        height: 1,
        index: 0,
        count: 2
    }));
}

#[test]
fn merkle_block_with_pending_txs_is_a_protocol_error() {
    let harness = Harness::new();
    harness.boot();

    let block1 = TestBlock::new(
        &harness.params,
        harness.params.hash_genesis_block,
        harness.genesis_time() + BLOCK_SPACING,
        &[(1, true)],
    );
    let block2 = TestBlock::new(
        &harness.params,
        harness.params.header_hash(&block1.header),
        harness.genesis_time() + 2 * BLOCK_SPACING,
        &[(2, false)],
    );
    harness.sync_headers(&[block1.header, block2.header]);
    harness
        .sync
        .sync_blocks(&[harness.params.hash_genesis_block], 0)
        .expect("sync blocks");
    harness.handler().on_merkle_block(block1.merkle_block());
    harness.drain_events();

    // block1's matching transaction never arrives.
    harness.handler().on_merkle_block(block2.merkle_block());
    let events = harness.drain_events();
    assert_eq!(
        events,
        vec![Ev::ProtocolError(
            "Block was received before getting transactions from last block.".to_string()
        )]
    );
}

// ---------------------------------------------------------------------------
// Scenario 6: inventory filtering by sync state

#[test]
fn inv_rewrites_blocks_and_gates_txs() {
    let harness = Harness::new();
    harness.boot();
    harness.handler().on_headers(Vec::new());
    assert!(harness.sync.is_headers_synched());
    assert!(!harness.sync.is_blocks_synched());
    harness.drain_sent();

    let block_hash = [0x11; 32];
    harness.handler().on_inv(vec![
        InventoryItem {
            inv_type: MSG_TX,
            hash: [0x22; 32],
        },
        InventoryItem {
            inv_type: MSG_BLOCK,
            hash: block_hash,
        },
        InventoryItem {
            inv_type: 7,
            hash: [0x33; 32],
        },
    ]);

    let sent = harness.drain_sent();
    match sent.as_slice() {
        [Message::GetData(items)] => {
            assert_eq!(items.len(), 1);
            assert_eq!(
                items[0],
                InventoryItem {
                    inv_type: MSG_FILTERED_BLOCK,
                    hash: block_hash,
                }
            );
        }
        other => panic!("expected one getdata, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Boundary behaviors and idempotence

#[test]
fn sync_blocks_already_at_tip_synchs_immediately() {
    let harness = Harness::new();
    harness.boot();

    let header = mine_header(
        &harness.params,
        harness.params.hash_genesis_block,
        harness.genesis_time() + BLOCK_SPACING,
        [1u8; 32],
    );
    harness.sync_headers(&[header]);
    harness.drain_events();
    harness.drain_sent();

    let tip_hash = harness.params.header_hash(&header);
    harness.sync.sync_blocks(&[tip_hash], 0).expect("sync blocks");

    let events = harness.drain_events();
    assert!(events.contains(&Ev::BlocksSynched));
    assert!(!events.contains(&Ev::FetchingBlocks));
    assert!(filtered_block_hashes(&harness.drain_sent()).is_empty());
    assert!(harness.sync.is_blocks_synched());
}

#[test]
fn new_tx_only_after_blocks_synched() {
    let harness = Harness::new();
    harness.boot();
    harness.handler().on_headers(Vec::new());
    harness.drain_events();

    // Not synched, not fetching: unsolicited tx is a protocol error.
    harness.handler().on_tx(tagged_tx(9));
    let events = harness.drain_events();
    assert!(matches!(events.as_slice(), [Ev::ProtocolError(_)]));

    // Catch up (tip == genesis), then the same tx is mempool relay.
    harness
        .sync
        .sync_blocks(&[harness.params.hash_genesis_block], 0)
        .expect("sync blocks");
    assert!(harness.sync.is_blocks_synched());
    harness.drain_events();

    let tx = tagged_tx(9);
    let txid = tx.txid();
    harness.handler().on_tx(tx);
    assert_eq!(harness.drain_events(), vec![Ev::NewTx(txid)]);
}

#[test]
fn lifecycle_is_guarded_and_idempotent() {
    let harness = Harness::new();
    harness
        .sync
        .load_headers(&harness.snapshot, true, None)
        .expect("load headers");
    harness.sync.start("127.0.0.1", 0).expect("start");
    assert!(matches!(
        harness.sync.start("127.0.0.1", 0),
        Err(SyncError::Busy(_))
    ));
    assert!(matches!(
        harness.sync.set_chain_params(harness.params.clone()),
        Err(SyncError::Busy(_))
    ));

    harness.sync.stop();
    harness.sync.stop();
    let stops = harness
        .drain_events()
        .into_iter()
        .filter(|event| *event == Ev::Stopped)
        .count();
    assert_eq!(stops, 1);

    // sync_blocks requires a connection.
    assert!(matches!(
        harness.sync.sync_blocks(&[], 0),
        Err(SyncError::NotConnected)
    ));
}

#[test]
fn bloom_filter_is_sent_on_open_and_on_update() {
    let harness = Harness::new();
    let filter = BloomFilter::new(vec![0xff, 0x01], 3, 0xbeef, 1);

    // Stored while disconnected: nothing on the wire yet.
    harness.sync.set_bloom_filter(filter.clone()).expect("set filter");
    assert!(harness.drain_sent().is_empty());

    harness.boot();
    let sent = harness.drain_sent();
    assert!(matches!(&sent[0], Message::FilterLoad(sent_filter) if *sent_filter == filter));
    assert!(matches!(&sent[1], Message::GetHeaders { .. }));

    // Re-setting while connected pushes exactly one more filterload.
    harness.sync.set_bloom_filter(filter.clone()).expect("set filter");
    let sent = harness.drain_sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Message::FilterLoad(sent_filter) if *sent_filter == filter));
}

#[test]
fn stop_sync_blocks_cancels_quietly() {
    let harness = Harness::new();
    harness.boot();

    let block = TestBlock::new(
        &harness.params,
        harness.params.hash_genesis_block,
        harness.genesis_time() + BLOCK_SPACING,
        &[(1, true)],
    );
    harness.sync_headers(&[block.header]);
    harness
        .sync
        .sync_blocks(&[harness.params.hash_genesis_block], 0)
        .expect("sync blocks");
    harness.drain_events();
    harness.drain_sent();

    harness.sync.stop_sync_blocks();
    assert!(harness.drain_events().is_empty());

    // No longer fetching: the merkle block is ignored as content.
    harness.handler().on_merkle_block(block.merkle_block());
    let events = harness.drain_events();
    assert!(!events.iter().any(|event| matches!(event, Ev::MerkleBlock(_))));
}
