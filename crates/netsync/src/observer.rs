//! Outbound notification fan-out.
//!
//! Each notification kind has an independent subscriber list; delivery order
//! within one kind follows registration order. Subscriber panics are
//! contained so a misbehaving wallet callback cannot corrupt sync state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use spv_chain::ChainMerkleBlock;
use spv_log::log_error;
use spv_primitives::block::Block;
use spv_primitives::transaction::Transaction;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Signal<T> {
    subscribers: Mutex<Vec<Callback<T>>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Signal<T> {
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Arc::new(callback));
        }
    }

    pub fn emit(&self, value: &T) {
        let subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                log_error!("observer callback panicked; notification dropped for it");
            }
        }
    }
}

/// Transaction delivered as part of a filtered block, with its position in
/// the block's match set.
#[derive(Clone, Debug)]
pub struct MerkleTxEvent {
    pub block: ChainMerkleBlock,
    pub tx: Transaction,
    pub index: usize,
    pub count: usize,
}

/// One signal per notification kind.
#[derive(Default)]
pub struct Notifications {
    pub started: Signal<()>,
    pub stopped: Signal<()>,
    pub open: Signal<()>,
    pub close: Signal<()>,
    pub timeout: Signal<()>,
    pub connection_error: Signal<String>,
    pub protocol_error: Signal<String>,
    pub block_tree_error: Signal<String>,
    pub block_tree_changed: Signal<()>,
    pub status: Signal<String>,
    pub fetching_headers: Signal<()>,
    pub headers_synched: Signal<()>,
    pub fetching_blocks: Signal<()>,
    pub blocks_synched: Signal<()>,
    pub merkle_block: Signal<ChainMerkleBlock>,
    pub merkle_tx: Signal<MerkleTxEvent>,
    pub block: Signal<Block>,
    pub new_tx: Signal<Transaction>,
}
