//! Typed wire messages and their payload codecs.
//!
//! Framing (the 24-byte envelope with magic and checksum) lives in the peer;
//! this module only turns payload bytes into typed messages and back.

use spv_consensus::constants::MAX_HEADERS_RESULTS;
use spv_primitives::block::{Block, BlockHeader};
use spv_primitives::bloom::BloomFilter;
use spv_primitives::encoding::{Decodable, DecodeError, Decoder, Encoder};
use spv_primitives::merkleblock::MerkleBlock;
use spv_primitives::transaction::Transaction;
use spv_primitives::Hash256;

pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_INV_RESULTS: usize = 50_000;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    Headers(Vec<BlockHeader>),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    Tx(Transaction),
    Block(Block),
    MerkleBlock(MerkleBlock),
    FilterLoad(BloomFilter),
    Mempool,
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::FilterLoad(_) => "filterload",
            Message::Mempool => "mempool",
        }
    }

    /// Serialize the payload. `protocol_version` is only consulted where the
    /// wire format embeds it (`getheaders`).
    pub fn encode_payload(&self, protocol_version: i32) -> Vec<u8> {
        match self {
            Message::Version(version) => build_version_payload(version),
            Message::Verack | Message::Mempool => Vec::new(),
            Message::Ping(nonce) | Message::Pong(nonce) => nonce.to_le_bytes().to_vec(),
            Message::GetHeaders { locator, stop } => {
                build_getheaders_payload(protocol_version, locator, stop)
            }
            Message::Headers(headers) => build_headers_payload(headers),
            Message::Inv(items) | Message::GetData(items) => build_inv_payload(items),
            Message::Tx(tx) => tx.consensus_encode(),
            Message::Block(block) => block.consensus_encode(),
            Message::MerkleBlock(merkle_block) => merkle_block.consensus_encode(),
            Message::FilterLoad(filter) => build_filterload_payload(filter),
        }
    }
}

/// Decode an inbound payload. Unknown commands decode to `None` and are
/// skipped by the peer loop.
pub fn parse_message(command: &str, payload: &[u8]) -> Result<Option<Message>, DecodeError> {
    let message = match command {
        "version" => Message::Version(parse_version(payload)?),
        "verack" => Message::Verack,
        "ping" => Message::Ping(parse_nonce(payload)?),
        "pong" => Message::Pong(parse_nonce(payload)?),
        "headers" => Message::Headers(parse_headers(payload)?),
        "inv" => Message::Inv(parse_inv(payload)?),
        "tx" => Message::Tx(Transaction::consensus_decode(payload)?),
        "block" => Message::Block(Block::consensus_decode(payload)?),
        "merkleblock" => Message::MerkleBlock(MerkleBlock::consensus_decode(payload)?),
        _ => return Ok(None),
    };
    Ok(Some(message))
}

fn build_version_payload(version: &VersionMessage) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(version.version);
    encoder.write_u64_le(version.services);
    encoder.write_i64_le(version.timestamp);
    write_net_addr(&mut encoder, version.services);
    write_net_addr(&mut encoder, 0);
    encoder.write_u64_le(version.nonce);
    encoder.write_var_str(&version.user_agent);
    encoder.write_i32_le(version.start_height);
    encoder.write_u8(version.relay as u8);
    encoder.into_inner()
}

fn parse_version(payload: &[u8]) -> Result<VersionMessage, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    // The relay flag is optional for peers at or above the bloom version.
    let relay = match decoder.remaining() {
        0 => true,
        _ => decoder.read_u8()? != 0,
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn parse_nonce(payload: &[u8]) -> Result<u64, DecodeError> {
    if payload.is_empty() {
        // Pre-BIP31 ping carries no nonce.
        return Ok(0);
    }
    let mut decoder = Decoder::new(payload);
    decoder.read_u64_le()
}

fn build_getheaders_payload(
    protocol_version: i32,
    locator: &[Hash256],
    stop: &Hash256,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(protocol_version);
    encoder.write_compact_size(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(stop);
    encoder.into_inner()
}

pub fn build_headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_compact_size(headers.len() as u64);
    for header in headers {
        encoder.write_bytes(&header.consensus_encode());
        // Each entry carries the block's transaction count, zero in a
        // headers-only message.
        encoder.write_compact_size(0);
    }
    encoder.into_inner()
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > MAX_HEADERS_RESULTS {
        return Err(DecodeError::InvalidData("too many headers"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        let _tx_count = decoder.read_compact_size()?;
        headers.push(header);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(headers)
}

fn build_inv_payload(items: &[InventoryItem]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_compact_size(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.inv_type);
        encoder.write_hash_le(&item.hash);
    }
    encoder.into_inner()
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryItem>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    if count > MAX_INV_RESULTS {
        return Err(DecodeError::InvalidData("too many inventory items"));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash_le()?;
        items.push(InventoryItem { inv_type, hash });
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(items)
}

fn build_filterload_payload(filter: &BloomFilter) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_bytes(&filter.data);
    encoder.write_u32_le(filter.n_hash_funcs);
    encoder.write_u32_le(filter.n_tweak);
    encoder.write_u8(filter.n_flags);
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&[0u8; 16]);
    encoder.write_bytes(&0u16.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), DecodeError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_bytes(2)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_roundtrip() {
        let version = VersionMessage {
            version: 70_001,
            services: 1,
            timestamp: 1_500_000_000,
            nonce: 0xdead_beef,
            user_agent: "/test:0.1/".to_string(),
            start_height: 7,
            relay: false,
        };
        let payload = build_version_payload(&version);
        let parsed = parse_version(&payload).expect("parse");
        assert_eq!(parsed.version, version.version);
        assert_eq!(parsed.user_agent, version.user_agent);
        assert_eq!(parsed.start_height, version.start_height);
        assert!(!parsed.relay);
    }

    #[test]
    fn headers_roundtrip_and_limit() {
        let header = BlockHeader {
            version: 2,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 11,
            bits: 0x207fffff,
            nonce: 5,
        };
        let payload = build_headers_payload(&[header]);
        let parsed = parse_headers(&payload).expect("parse");
        assert_eq!(parsed, vec![header]);

        let mut encoder = Encoder::new();
        encoder.write_compact_size((MAX_HEADERS_RESULTS + 1) as u64);
        assert!(parse_headers(&encoder.into_inner()).is_err());
    }

    #[test]
    fn inv_roundtrip() {
        let items = vec![
            InventoryItem {
                inv_type: MSG_TX,
                hash: [1u8; 32],
            },
            InventoryItem {
                inv_type: MSG_BLOCK,
                hash: [2u8; 32],
            },
        ];
        let payload = build_inv_payload(&items);
        assert_eq!(parse_inv(&payload).expect("parse"), items);
    }

    #[test]
    fn unknown_command_is_skipped() {
        assert!(matches!(parse_message("sendcmpct", &[0, 1]), Ok(None)));
    }

    #[test]
    fn empty_ping_defaults_nonce() {
        assert!(matches!(parse_message("ping", &[]), Ok(Some(Message::Ping(0)))));
    }
}
