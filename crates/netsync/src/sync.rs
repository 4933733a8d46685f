//! The synchronizer: drives one peer from header fetch through filtered
//! block download and transaction correlation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use spv_chain::{ChainMerkleBlock, HeaderTree, HeaderTreeError, LoadProgress};
use spv_consensus::ChainParams;
use spv_log::{log_debug, log_error, log_trace};
use spv_primitives::block::{Block, BlockHeader};
use spv_primitives::bloom::BloomFilter;
use spv_primitives::hash::hash_to_hex;
use spv_primitives::merkleblock::MerkleBlock;
use spv_primitives::transaction::Transaction;
use spv_primitives::Hash256;

use crate::error::SyncError;
use crate::observer::{MerkleTxEvent, Notifications};
use crate::peer::{Peer, PeerConfig, PeerEvents, TcpPeer};
use crate::wire::{InventoryItem, Message, MSG_BLOCK, MSG_FILTERED_BLOCK, MSG_TX};

/// Per-block correlation buffer. The hash FIFO is non-empty only between a
/// `merkleblock` and the last matching `tx` that belongs to it.
struct PendingBlock {
    block: ChainMerkleBlock,
    expected_tx_hashes: VecDeque<Hash256>,
    tx_index: usize,
    tx_count: usize,
}

pub struct Synchronizer<P: Peer = TcpPeer> {
    inner: Arc<SyncInner<P>>,
}

struct SyncInner<P: Peer> {
    peer: P,
    params: Mutex<ChainParams>,
    tree: Mutex<HeaderTree>,
    tree_file: Mutex<Option<PathBuf>>,
    bloom_filter: Mutex<Option<BloomFilter>>,
    notify: Notifications,

    started: AtomicBool,
    connected: AtomicBool,
    fetching_headers: AtomicBool,
    headers_synched: AtomicBool,
    fetching_blocks: AtomicBool,
    blocks_fetched: AtomicBool,
    blocks_synched: AtomicBool,
    last_requested_block_height: AtomicI32,

    // Guards lifecycle transitions against overlapping start/stop.
    start_lock: Mutex<()>,
    // Guards the state machine; held for the duration of each header/block
    // handler. on_tx reads the routing flags without it (stale is fine).
    sync_lock: Mutex<Option<PendingBlock>>,
}

impl Synchronizer<TcpPeer> {
    pub fn new(params: ChainParams) -> Self {
        Self::with_peer(params, TcpPeer::new)
    }
}

impl<P: Peer + 'static> Synchronizer<P> {
    /// Build a synchronizer around a peer produced by `make_peer`, which
    /// receives the weak event handle the peer must dispatch through.
    pub fn with_peer<F>(params: ChainParams, make_peer: F) -> Self
    where
        F: FnOnce(Weak<dyn PeerEvents>) -> P,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<SyncInner<P>>| {
            let events: Weak<dyn PeerEvents> = weak.clone();
            SyncInner {
                peer: make_peer(events),
                tree: Mutex::new(HeaderTree::new(&params)),
                params: Mutex::new(params),
                tree_file: Mutex::new(None),
                bloom_filter: Mutex::new(None),
                notify: Notifications::default(),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                fetching_headers: AtomicBool::new(false),
                headers_synched: AtomicBool::new(false),
                fetching_blocks: AtomicBool::new(false),
                blocks_fetched: AtomicBool::new(false),
                blocks_synched: AtomicBool::new(false),
                last_requested_block_height: AtomicI32::new(-1),
                start_lock: Mutex::new(()),
                sync_lock: Mutex::new(None),
            }
        });
        Self { inner }
    }

    /// Observer registration surface: one signal per notification kind.
    pub fn notifications(&self) -> &Notifications {
        &self.inner.notify
    }

    pub fn peer(&self) -> &P {
        &self.inner.peer
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    pub fn is_headers_synched(&self) -> bool {
        self.inner.headers_synched.load(Ordering::Relaxed)
    }

    pub fn is_blocks_synched(&self) -> bool {
        self.inner.blocks_synched.load(Ordering::Relaxed)
    }

    pub fn best_height(&self) -> i32 {
        self.inner
            .tree
            .lock()
            .map(|tree| tree.best_height())
            .unwrap_or(-1)
    }

    /// Replace the chain parameters. Only valid while stopped; the header
    /// tree is reset for the new chain.
    pub fn set_chain_params(&self, params: ChainParams) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.started.load(Ordering::Relaxed) {
            return Err(SyncError::Busy("set chain parameters"));
        }
        let _guard = inner
            .start_lock
            .lock()
            .map_err(|_| SyncError::Internal("start lock poisoned"))?;
        if inner.started.load(Ordering::Relaxed) {
            return Err(SyncError::Busy("set chain parameters"));
        }

        let mut tree = inner.lock_tree()?;
        *tree = HeaderTree::new(&params);
        drop(tree);
        let mut current = inner
            .params
            .lock()
            .map_err(|_| SyncError::Internal("params lock poisoned"))?;
        *current = params;
        inner.headers_synched.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Store the wallet's bloom filter and, when connected, push it to the
    /// peer right away.
    pub fn set_bloom_filter(&self, filter: BloomFilter) -> Result<(), SyncError> {
        let inner = &self.inner;
        {
            let mut current = inner
                .bloom_filter
                .lock()
                .map_err(|_| SyncError::Internal("bloom filter lock poisoned"))?;
            *current = Some(filter.clone());
        }
        if !filter.is_set() || !inner.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        inner.peer.send(Message::FilterLoad(filter))?;
        log_trace!("sent bloom filter to peer");
        Ok(())
    }

    /// Load the header snapshot at `path`, or fall back to a fresh tree
    /// seeded with genesis. Either way the tree ends up in a synchronizable
    /// state and `headers_synched` is signalled.
    pub fn load_headers(
        &self,
        path: impl AsRef<Path>,
        check_pow: bool,
        progress: Option<LoadProgress<'_>>,
    ) -> Result<(), SyncError> {
        let inner = &self.inner;
        let path = path.as_ref().to_path_buf();
        {
            let mut tree_file = inner
                .tree_file
                .lock()
                .map_err(|_| SyncError::Internal("tree file lock poisoned"))?;
            *tree_file = Some(path.clone());
        }

        let mut tree = inner.lock_tree()?;
        match tree.load_from_file(&path, check_pow, progress) {
            Ok(()) => {
                inner.headers_synched.store(true, Ordering::Relaxed);
                let status = format!(
                    "Best Height: {} / Total Work: {}",
                    tree.best_height(),
                    tree.total_work()
                );
                drop(tree);
                inner.notify.status.emit(&status);
                inner.notify.headers_synched.emit(&());
                return Ok(());
            }
            Err(err) => {
                log_error!("header snapshot load failed: {err}");
                inner.notify.block_tree_error.emit(&err.to_string());
            }
        }

        tree.clear();
        let genesis = inner.genesis_header()?;
        tree.set_genesis(genesis)?;
        drop(tree);
        inner.headers_synched.store(true, Ordering::Relaxed);
        inner
            .notify
            .status
            .emit(&"Header file not found. A new one will be created.".to_string());
        inner.notify.headers_synched.emit(&());
        Ok(())
    }

    /// Configure and start the peer connection. `port` 0 selects the chain's
    /// default port.
    pub fn start(&self, host: &str, port: u16) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.started.load(Ordering::Relaxed) {
            return Err(SyncError::Busy("start"));
        }
        {
            let _guard = inner
                .start_lock
                .lock()
                .map_err(|_| SyncError::Internal("start lock poisoned"))?;
            if inner.started.load(Ordering::Relaxed) {
                return Err(SyncError::Busy("start"));
            }

            let params = inner
                .params
                .lock()
                .map_err(|_| SyncError::Internal("params lock poisoned"))?;
            let port = if port == 0 { params.default_port } else { port };
            let config = PeerConfig {
                host: host.to_string(),
                port,
                magic: params.message_start,
                protocol_version: params.protocol_version,
                ..PeerConfig::default()
            };
            drop(params);

            inner.started.store(true, Ordering::Relaxed);
            inner.fetching_headers.store(false, Ordering::Relaxed);
            inner.fetching_blocks.store(false, Ordering::Relaxed);
            inner.peer.set(config);
            inner.peer.start();
        }
        inner.notify.started.emit(&());
        Ok(())
    }

    /// Idempotent: stopping a stopped synchronizer does nothing.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Start filtered block download from the first locator hash found in
    /// the best chain, or from the wallet birthday when none matches.
    pub fn sync_blocks(&self, locator_hashes: &[Hash256], start_time: u32) -> Result<(), SyncError> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::Relaxed) {
            return Err(SyncError::NotConnected);
        }

        let _sync = inner
            .sync_lock
            .lock()
            .map_err(|_| SyncError::Internal("sync lock poisoned"))?;
        inner.fetching_blocks.store(false, Ordering::Relaxed);
        inner.blocks_fetched.store(false, Ordering::Relaxed);

        let tree = inner.lock_tree()?;
        let mut found: Option<(i32, Hash256)> = None;
        for hash in locator_hashes {
            match tree.get_header(hash) {
                Ok(header) if header.in_best_chain => {
                    found = Some((header.height, header.hash));
                    break;
                }
                Ok(header) => {
                    log_debug!("reorg detected at height {}", header.height);
                }
                Err(err) => {
                    inner.notify.status.emit(&err.to_string());
                }
            }
        }

        let best_height = tree.best_height();
        let next_height = match found {
            Some((height, _)) => height + 1,
            None => tree.get_header_before(start_time)?.height,
        };

        if best_height >= next_height {
            inner.fetching_blocks.store(true, Ordering::Relaxed);
            let status = format!("Resynching blocks {next_height} - {best_height}");
            log_debug!("{status}");
            inner.notify.status.emit(&status);
            inner.notify.fetching_blocks.emit(&());

            let next = tree.get_header_at_height(next_height)?;
            let hash = next.hash;
            let status = format!(
                "Asking for block {} / height: {}",
                hash_to_hex(&hash),
                next_height
            );
            drop(tree);
            log_debug!("{status}");
            inner.notify.status.emit(&status);
            inner
                .last_requested_block_height
                .store(next_height, Ordering::Relaxed);
            inner.peer.get_filtered_block(hash)?;
        } else {
            drop(tree);
            inner.blocks_synched.store(true, Ordering::Relaxed);
            inner.notify.blocks_synched.emit(&());
        }
        Ok(())
    }

    /// Cancel filtered block download. Quiet: no notification is emitted.
    pub fn stop_sync_blocks(&self) {
        let inner = &self.inner;
        if !inner.fetching_blocks.load(Ordering::Relaxed) {
            return;
        }
        let Ok(_sync) = inner.sync_lock.lock() else {
            return;
        };
        inner.fetching_blocks.store(false, Ordering::Relaxed);
    }

    pub fn send_tx(&self, tx: Transaction) -> Result<(), SyncError> {
        self.inner.peer.send(Message::Tx(tx))
    }

    pub fn get_tx(&self, hash: Hash256) -> Result<(), SyncError> {
        self.inner.peer.get_tx(hash)
    }

    pub fn get_txs(&self, hashes: Vec<Hash256>) -> Result<(), SyncError> {
        self.inner.peer.get_txs(hashes)
    }

    pub fn get_mempool(&self) -> Result<(), SyncError> {
        self.inner.peer.get_mempool()
    }

    pub fn get_filtered_block(&self, hash: Hash256) -> Result<(), SyncError> {
        self.inner.peer.get_filtered_block(hash)
    }
}

impl<P: Peer> SyncInner<P> {
    fn lock_tree(&self) -> Result<std::sync::MutexGuard<'_, HeaderTree>, SyncError> {
        self.tree
            .lock()
            .map_err(|_| SyncError::Internal("header tree lock poisoned"))
    }

    fn genesis_header(&self) -> Result<BlockHeader, SyncError> {
        self.params
            .lock()
            .map(|params| params.genesis_block)
            .map_err(|_| SyncError::Internal("params lock poisoned"))
    }

    fn header_hash(&self, header: &BlockHeader) -> Hash256 {
        match self.params.lock() {
            Ok(params) => params.header_hash(header),
            Err(_) => header.hash(),
        }
    }

    fn stop(&self) {
        {
            if !self.started.load(Ordering::Relaxed) {
                return;
            }
            let Ok(_guard) = self.start_lock.lock() else {
                return;
            };
            if !self.started.load(Ordering::Relaxed) {
                return;
            }

            self.connected.store(false, Ordering::Relaxed);
            self.started.store(false, Ordering::Relaxed);
            self.fetching_headers.store(false, Ordering::Relaxed);
            self.fetching_blocks.store(false, Ordering::Relaxed);
            self.peer.stop();
        }
        self.notify.stopped.emit(&());
    }

    /// Persist the tree if a snapshot path has been supplied.
    fn flush_tree(&self, tree: &HeaderTree) -> Result<(), HeaderTreeError> {
        let path = match self.tree_file.lock() {
            Ok(tree_file) => tree_file.clone(),
            Err(_) => None,
        };
        let Some(path) = path else {
            return Ok(());
        };
        self.notify
            .status
            .emit(&"Flushing header tree to file...".to_string());
        tree.flush_to_file(&path)?;
        self.notify
            .status
            .emit(&"Done flushing header tree to file".to_string());
        Ok(())
    }

    /// Restart header negotiation from the tip after a suspected reorg.
    fn restart_header_sync(&self, tree: &HeaderTree) {
        let locator = tree.get_locator_hashes(-1);
        if let Err(err) = self.peer.get_headers(locator) {
            log_error!("header tree error: {err}");
            self.notify.block_tree_error.emit(&err.to_string());
        }
    }
}

impl<P: Peer> PeerEvents for SyncInner<P> {
    fn on_open(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.notify.open.emit(&());

        let result = (|| -> Result<(), SyncError> {
            let filter = match self.bloom_filter.lock() {
                Ok(filter) => filter.clone(),
                Err(_) => None,
            };
            if let Some(filter) = filter.filter(|filter| filter.is_set()) {
                self.peer.send(Message::FilterLoad(filter))?;
                log_trace!("sent bloom filter to peer");
            }
            let locator = self.lock_tree()?.get_locator_hashes(-1);
            self.peer.get_headers(locator)?;
            Ok(())
        })();
        if let Err(err) = result {
            log_error!("peer open handler: {err}");
            self.notify.block_tree_error.emit(&err.to_string());
        }
    }

    fn on_close(&self) {
        self.stop();
        self.notify.close.emit(&());
    }

    fn on_timeout(&self) {
        self.notify.timeout.emit(&());
    }

    fn on_connection_error(&self, error: &str) {
        self.notify.connection_error.emit(&error.to_string());
    }

    fn on_protocol_error(&self, error: &str) {
        self.notify.protocol_error.emit(&error.to_string());
    }

    fn on_inv(&self, items: Vec<InventoryItem>) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        log_trace!("received inventory with {} items", items.len());

        let mut get_data = Vec::new();
        for item in items {
            match item.inv_type {
                // Unsolicited mempool transactions are only wanted once the
                // wallet is fully caught up.
                MSG_TX => {
                    if self.blocks_synched.load(Ordering::Relaxed) {
                        get_data.push(item);
                    }
                }
                MSG_BLOCK => {
                    if self.headers_synched.load(Ordering::Relaxed) {
                        get_data.push(InventoryItem {
                            inv_type: MSG_FILTERED_BLOCK,
                            hash: item.hash,
                        });
                    }
                }
                _ => {}
            }
        }

        if !get_data.is_empty() {
            if let Err(err) = self.peer.send(Message::GetData(get_data)) {
                log_error!("inv handler: {err}");
            }
        }
    }

    fn on_headers(&self, headers: Vec<BlockHeader>) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        log_trace!("received headers message with {} headers", headers.len());
        let Ok(_sync) = self.sync_lock.lock() else {
            return;
        };

        if headers.is_empty() {
            let Ok(tree) = self.lock_tree() else { return };
            if let Err(err) = self.flush_tree(&tree) {
                log_error!("header tree flush failed: {err}");
                self.notify.block_tree_error.emit(&err.to_string());
                self.fetching_headers.store(false, Ordering::Relaxed);
                return;
            }
            self.headers_synched.store(true, Ordering::Relaxed);
            self.notify.headers_synched.emit(&());
            return;
        }

        self.fetching_headers.store(true, Ordering::Relaxed);
        self.notify.fetching_headers.emit(&());

        let Ok(mut tree) = self.lock_tree() else { return };
        for header in &headers {
            match tree.insert_header(header) {
                Ok(true) => {
                    // Best chain moved; there may be more headers behind it.
                    self.headers_synched.store(false, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(err) => {
                    let hash = self.header_hash(header);
                    let message = format!(
                        "Header tree insertion error for block {}: {err}",
                        hash_to_hex(&hash)
                    );
                    log_error!("{message}");
                    self.notify.block_tree_error.emit(&message);
                    // Abort the batch; the next getheaders round retries via
                    // locator back-off.
                    self.fetching_headers.store(false, Ordering::Relaxed);
                    return;
                }
            }
        }

        log_trace!(
            "processed {} headers, best height {}, fetching more",
            headers.len(),
            tree.best_height()
        );
        self.notify.block_tree_changed.emit(&());
        let status = format!(
            "Best Height: {} / Total Work: {}",
            tree.best_height(),
            tree.total_work()
        );
        self.notify.status.emit(&status);

        let locator = tree.get_locator_hashes(1);
        drop(tree);
        if let Err(err) = self.peer.get_headers(locator) {
            log_error!("headers handler: {err}");
            self.fetching_headers.store(false, Ordering::Relaxed);
        }
    }

    fn on_block(&self, block: Block) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        let hash = self.header_hash(&block.header);
        let Ok(_sync) = self.sync_lock.lock() else {
            return;
        };
        let Ok(mut tree) = self.lock_tree() else { return };

        if tree.has_header(&hash) {
            drop(tree);
            self.notify.block.emit(&block);
            return;
        }

        match tree.insert_header(&block.header) {
            Ok(true) => {
                if let Err(err) = self.flush_tree(&tree) {
                    log_error!("header tree flush failed: {err}");
                    self.notify.block_tree_error.emit(&err.to_string());
                    return;
                }
                self.headers_synched.store(true, Ordering::Relaxed);
                drop(tree);
                self.notify.headers_synched.emit(&());
                self.notify.block.emit(&block);
            }
            Ok(false) => {
                log_debug!("block rejected, hash {}", hash_to_hex(&hash));
            }
            Err(err) => {
                log_error!("block handler, hash {}: {err}", hash_to_hex(&hash));
                self.notify.status.emit(&"Block handler error.".to_string());
            }
        }
    }

    fn on_merkle_block(&self, merkle_block: MerkleBlock) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        let hash = self.header_hash(&merkle_block.header);
        log_trace!("received merkle block {}", hash_to_hex(&hash));

        let Ok(mut correlation) = self.sync_lock.lock() else {
            return;
        };
        if correlation
            .as_ref()
            .is_some_and(|pending| !pending.expected_tx_hashes.is_empty())
        {
            self.notify.protocol_error.emit(
                &"Block was received before getting transactions from last block.".to_string(),
            );
            return;
        }

        let Ok(mut tree) = self.lock_tree() else { return };
        if !tree.has_header(&hash) {
            match tree.insert_header(&merkle_block.header) {
                Ok(true) => {
                    if let Err(err) = self.flush_tree(&tree) {
                        log_error!("header tree flush failed: {err}");
                        self.notify.block_tree_error.emit(&err.to_string());
                        return;
                    }
                    self.headers_synched.store(true, Ordering::Relaxed);
                    self.blocks_fetched.store(false, Ordering::Relaxed);
                    self.blocks_synched.store(false, Ordering::Relaxed);
                    self.notify.headers_synched.emit(&());
                }
                Ok(false) | Err(_) => {
                    // Possible reorg: the header does not extend the best
                    // chain. Drop back to header negotiation from the tip.
                    self.headers_synched.store(false, Ordering::Relaxed);
                    self.blocks_synched.store(false, Ordering::Relaxed);
                    self.blocks_fetched.store(false, Ordering::Relaxed);
                    self.fetching_blocks.store(false, Ordering::Relaxed);
                    let message = format!(
                        "Merkle block {} rejected, possible reorg.",
                        hash_to_hex(&hash)
                    );
                    log_error!("{message}");
                    self.notify.block_tree_error.emit(&message);
                    self.restart_header_sync(&tree);
                    return;
                }
            }
        }

        if !self.fetching_blocks.load(Ordering::Relaxed) {
            return;
        }

        let (height, chain_work, in_best_chain) = match tree.get_header(&hash) {
            Ok(header) => (header.height, header.chain_work, header.in_best_chain),
            Err(err) => {
                log_error!("merkle block handler: {err}");
                return;
            }
        };

        let (root, tx_hashes) = match merkle_block.proof.extract_matches() {
            Ok(extracted) => extracted,
            Err(err) => {
                self.notify.protocol_error.emit(&err.to_string());
                return;
            }
        };
        if root != merkle_block.header.merkle_root {
            self.notify
                .protocol_error
                .emit(&"Merkle proof root does not match header.".to_string());
            return;
        }

        let chain_merkle_block = ChainMerkleBlock {
            merkle_block,
            height,
            chain_work,
            in_best_chain,
        };
        let tx_count = tx_hashes.len();
        *correlation = Some(PendingBlock {
            block: chain_merkle_block.clone(),
            expected_tx_hashes: tx_hashes.into_iter().collect(),
            tx_index: 0,
            tx_count,
        });

        self.notify.merkle_block.emit(&chain_merkle_block);

        let best_height = tree.best_height();
        if best_height > height {
            // More blocks to fetch.
            match tree.get_header_at_height(height + 1) {
                Ok(next) => {
                    let next_hash = next.hash;
                    let next_height = next.height;
                    drop(tree);
                    let status = format!(
                        "Asking for block {} / height: {}",
                        hash_to_hex(&next_hash),
                        next_height
                    );
                    log_debug!("{status}");
                    self.notify.status.emit(&status);
                    self.last_requested_block_height
                        .store(next_height, Ordering::Relaxed);
                    if let Err(err) = self.peer.get_filtered_block(next_hash) {
                        self.notify.connection_error.emit(&err.to_string());
                    }
                }
                Err(err) => {
                    log_error!("merkle block handler: {err}");
                }
            }
        } else if best_height == self.last_requested_block_height.load(Ordering::Relaxed)
            && best_height == height
        {
            self.blocks_fetched.store(true, Ordering::Relaxed);
            if tx_count == 0 {
                self.blocks_synched.store(true, Ordering::Relaxed);
                self.notify.blocks_synched.emit(&());
            }
        }
    }

    fn on_tx(&self, tx: Transaction) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        let txid = tx.txid();
        log_trace!("received transaction {}", hash_to_hex(&txid));

        if self.blocks_synched.load(Ordering::Relaxed) {
            self.notify.new_tx.emit(&tx);
            return;
        }

        if !self.fetching_blocks.load(Ordering::Relaxed) {
            self.notify.protocol_error.emit(
                &"Should not be receiving transactions if not synched and not fetching blocks."
                    .to_string(),
            );
            return;
        }

        let Ok(mut correlation) = self.sync_lock.lock() else {
            return;
        };
        // No merkle block yet, or the previous block's matches are already
        // drained: either way this transaction has no block to belong to.
        let pending = match correlation.as_mut() {
            Some(pending) if !pending.expected_tx_hashes.is_empty() => pending,
            _ => {
                self.notify.protocol_error.emit(
                    &"Should not be receiving transactions before blocks when fetching blocks."
                        .to_string(),
                );
                return;
            }
        };
        if pending.expected_tx_hashes.front() != Some(&txid) {
            self.notify
                .protocol_error
                .emit(&"Transaction received out of order.".to_string());
            return;
        }
        pending.expected_tx_hashes.pop_front();

        let event = MerkleTxEvent {
            block: pending.block.clone(),
            tx,
            index: pending.tx_index,
            count: pending.tx_count,
        };
        pending.tx_index += 1;
        self.notify.merkle_tx.emit(&event);

        if self.blocks_fetched.load(Ordering::Relaxed) && pending.tx_index == pending.tx_count {
            self.blocks_synched.store(true, Ordering::Relaxed);
            self.notify.blocks_synched.emit(&());
        }
    }
}

impl<P: Peer> Drop for Synchronizer<P> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
