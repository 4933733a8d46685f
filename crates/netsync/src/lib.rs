//! Network synchronization core for an SPV client.
//!
//! One [`Synchronizer`](sync::Synchronizer) drives a single peer: it brings a
//! local header tree to the peer's tip, then walks filtered (bloom-matched)
//! blocks forward, pairing each `merkleblock` with the transaction stream
//! that follows it and fanning results out to wallet-facing observers.

pub mod error;
pub mod observer;
pub mod peer;
pub mod sync;
pub mod wire;

pub use error::SyncError;
pub use observer::{MerkleTxEvent, Notifications, Signal};
pub use peer::{Peer, PeerConfig, PeerEvents, TcpPeer};
pub use sync::Synchronizer;
pub use wire::{InventoryItem, Message, MSG_BLOCK, MSG_FILTERED_BLOCK, MSG_TX};
