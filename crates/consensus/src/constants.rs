//! Protocol-level constants shared across the workspace.

/// Protocol version spoken by this client. BIP 37 (`filterload`,
/// `merkleblock`) requires at least 70001.
pub const PROTOCOL_VERSION: i32 = 70_001;

/// Service bit: node serves the full chain.
pub const NODE_NETWORK: u64 = 1;

/// Service bit: node answers bloom-filtered requests.
pub const NODE_BLOOM: u64 = 1 << 2;

/// Upper bound on headers returned for one `getheaders` request.
pub const MAX_HEADERS_RESULTS: usize = 2_000;
