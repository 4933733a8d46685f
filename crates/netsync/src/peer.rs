//! Peer connection: typed outbound sends, inbound event dispatch.
//!
//! [`TcpPeer`] runs one dedicated I/O worker thread; every inbound callback
//! fires on that thread, serialized. The synchronizer is reached through a
//! weak handle so tearing it down also silences a worker that is still
//! draining its socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spv_consensus::constants::PROTOCOL_VERSION;
use spv_log::{log_debug, log_error, log_trace};
use spv_primitives::block::{Block, BlockHeader};
use spv_primitives::hash::sha256d;
use spv_primitives::merkleblock::MerkleBlock;
use spv_primitives::transaction::Transaction;
use spv_primitives::Hash256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::SyncError;
use crate::wire::{
    parse_message, InventoryItem, Message, VersionMessage, MAX_PAYLOAD_SIZE, MSG_FILTERED_BLOCK,
    MSG_TX,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const SEND_TIMEOUT_SECS: u64 = 10;
const IDLE_READ_TIMEOUT_SECS: u64 = 90;

const USER_AGENT: &str = concat!("/spv-netsync:", env!("CARGO_PKG_VERSION"), "/");

/// Connection parameters, applied on the next `start`.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub magic: [u8; 4],
    pub protocol_version: i32,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            magic: [0u8; 4],
            protocol_version: PROTOCOL_VERSION,
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            relay: false,
        }
    }
}

/// Inbound callbacks, all invoked on the peer's I/O worker thread.
pub trait PeerEvents: Send + Sync {
    fn on_open(&self);
    fn on_close(&self);
    fn on_timeout(&self);
    fn on_connection_error(&self, error: &str);
    fn on_protocol_error(&self, error: &str);
    fn on_inv(&self, items: Vec<InventoryItem>);
    fn on_tx(&self, tx: Transaction);
    fn on_headers(&self, headers: Vec<BlockHeader>);
    fn on_block(&self, block: Block);
    fn on_merkle_block(&self, merkle_block: MerkleBlock);
}

/// Outbound command surface of a peer connection.
pub trait Peer: Send + Sync {
    fn set(&self, config: PeerConfig);
    fn start(&self);
    fn stop(&self);
    fn send(&self, message: Message) -> Result<(), SyncError>;

    fn get_headers(&self, locator: Vec<Hash256>) -> Result<(), SyncError> {
        self.send(Message::GetHeaders {
            locator,
            stop: [0u8; 32],
        })
    }

    fn get_filtered_block(&self, hash: Hash256) -> Result<(), SyncError> {
        self.send(Message::GetData(vec![InventoryItem {
            inv_type: MSG_FILTERED_BLOCK,
            hash,
        }]))
    }

    fn get_tx(&self, hash: Hash256) -> Result<(), SyncError> {
        self.get_txs(vec![hash])
    }

    fn get_txs(&self, hashes: Vec<Hash256>) -> Result<(), SyncError> {
        let items = hashes
            .into_iter()
            .map(|hash| InventoryItem {
                inv_type: MSG_TX,
                hash,
            })
            .collect();
        self.send(Message::GetData(items))
    }

    fn get_mempool(&self) -> Result<(), SyncError> {
        self.send(Message::Mempool)
    }
}

struct ConnectionCtl {
    shutdown: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Message>,
}

pub struct TcpPeer {
    events: Weak<dyn PeerEvents>,
    config: Mutex<PeerConfig>,
    conn: Mutex<Option<ConnectionCtl>>,
}

impl TcpPeer {
    pub fn new(events: Weak<dyn PeerEvents>) -> Self {
        Self {
            events,
            config: Mutex::new(PeerConfig::default()),
            conn: Mutex::new(None),
        }
    }
}

impl Peer for TcpPeer {
    fn set(&self, config: PeerConfig) {
        if let Ok(mut current) = self.config.lock() {
            *current = config;
        }
    }

    fn start(&self) {
        self.stop();

        let config = match self.config.lock() {
            Ok(config) => config.clone(),
            Err(_) => return,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        if let Ok(mut conn) = self.conn.lock() {
            *conn = Some(ConnectionCtl {
                shutdown: Arc::clone(&shutdown),
                outbound: outbound_tx,
            });
        }

        let events = self.events.clone();
        let spawned = std::thread::Builder::new()
            .name("netsync-io".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log_error!("failed to build peer runtime: {err}");
                        dispatch(&events, |e| e.on_connection_error(&err.to_string()));
                        dispatch(&events, |e| e.on_close());
                        return;
                    }
                };
                runtime.block_on(run_connection(config, events, shutdown, outbound_rx));
            });
        if let Err(err) = spawned {
            log_error!("failed to spawn peer worker: {err}");
        }
    }

    /// Signals the worker and returns; the worker finishes its current event
    /// and exits on its own. Never joins, so it is safe to call from inside
    /// an inbound callback.
    fn stop(&self) {
        if let Ok(mut conn) = self.conn.lock() {
            if let Some(ctl) = conn.take() {
                ctl.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }

    fn send(&self, message: Message) -> Result<(), SyncError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SyncError::Internal("peer connection lock poisoned"))?;
        let ctl = conn.as_ref().ok_or(SyncError::NotConnected)?;
        ctl.outbound
            .send(message)
            .map_err(|_| SyncError::NotConnected)
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(events: &Weak<dyn PeerEvents>, call: impl FnOnce(&dyn PeerEvents)) -> bool {
    match events.upgrade() {
        Some(events) => {
            call(events.as_ref());
            true
        }
        None => false,
    }
}

fn dispatch_message(events: &Weak<dyn PeerEvents>, message: Message) -> bool {
    dispatch(events, move |e| match message {
        Message::Headers(headers) => e.on_headers(headers),
        Message::Inv(items) => e.on_inv(items),
        Message::Tx(tx) => e.on_tx(tx),
        Message::Block(block) => e.on_block(block),
        Message::MerkleBlock(merkle_block) => e.on_merkle_block(merkle_block),
        // Post-handshake control traffic and server-side requests are not
        // for the synchronizer.
        Message::Version(_)
        | Message::Verack
        | Message::Ping(_)
        | Message::Pong(_)
        | Message::GetHeaders { .. }
        | Message::GetData(_)
        | Message::FilterLoad(_)
        | Message::Mempool => {}
    })
}

enum ReadError {
    Io(String),
    Protocol(String),
}

struct FrameReader {
    half: OwnedReadHalf,
    magic: [u8; 4],
}

impl FrameReader {
    async fn read(&mut self) -> Result<(String, Vec<u8>), ReadError> {
        let mut header = [0u8; 24];
        self.half
            .read_exact(&mut header)
            .await
            .map_err(|err| ReadError::Io(err.to_string()))?;
        if header[..4] != self.magic {
            return Err(ReadError::Protocol("invalid message magic".to_string()));
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ReadError::Protocol("payload too large".to_string()));
        }
        let checksum = [header[20], header[21], header[22], header[23]];
        let mut payload = vec![0u8; length];
        self.half
            .read_exact(&mut payload)
            .await
            .map_err(|err| ReadError::Io(err.to_string()))?;
        if sha256d(&payload)[..4] != checksum {
            return Err(ReadError::Protocol("invalid payload checksum".to_string()));
        }
        Ok((command, payload))
    }
}

struct FrameWriter {
    half: OwnedWriteHalf,
    magic: [u8; 4],
}

impl FrameWriter {
    async fn send(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&self.magic);
        let mut command_bytes = [0u8; 12];
        let cmd = command.as_bytes();
        if cmd.len() > 12 {
            return Err("command too long".to_string());
        }
        command_bytes[..cmd.len()].copy_from_slice(cmd);
        frame.extend_from_slice(&command_bytes);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(payload);
        timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.half.write_all(&frame),
        )
        .await
        .map_err(|_| "peer write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        Ok(())
    }
}

async fn run_connection(
    config: PeerConfig,
    events: Weak<dyn PeerEvents>,
    shutdown: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let address = format!("{}:{}", config.host, config.port);
    log_debug!("connecting to {address}");
    let stream = match timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(&address),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            dispatch(&events, |e| e.on_connection_error(&err.to_string()));
            dispatch(&events, |e| e.on_close());
            return;
        }
        Err(_) => {
            dispatch(&events, |e| e.on_connection_error("connect timed out"));
            dispatch(&events, |e| e.on_close());
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader {
        half: read_half,
        magic: config.magic,
    };
    let mut writer = FrameWriter {
        half: write_half,
        magic: config.magic,
    };

    if let Err(err) = handshake(&config, &mut reader, &mut writer).await {
        dispatch(&events, |e| e.on_connection_error(&err));
        dispatch(&events, |e| e.on_close());
        return;
    }

    dispatch(&events, |e| e.on_open());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else { break };
                let payload = message.encode_payload(config.protocol_version);
                if let Err(err) = writer.send(message.command(), &payload).await {
                    dispatch(&events, |e| e.on_connection_error(&err));
                    break;
                }
            }
            inbound = timeout(Duration::from_secs(IDLE_READ_TIMEOUT_SECS), reader.read()) => {
                match inbound {
                    Err(_) => {
                        if !dispatch(&events, |e| e.on_timeout()) {
                            break;
                        }
                    }
                    Ok(Err(ReadError::Io(err))) => {
                        dispatch(&events, |e| e.on_connection_error(&err));
                        break;
                    }
                    Ok(Err(ReadError::Protocol(err))) => {
                        dispatch(&events, |e| e.on_protocol_error(&err));
                        break;
                    }
                    Ok(Ok((command, payload))) => {
                        match parse_message(&command, &payload) {
                            Ok(Some(Message::Ping(nonce))) => {
                                let _ = writer.send("pong", &nonce.to_le_bytes()).await;
                            }
                            Ok(Some(message)) => {
                                if !dispatch_message(&events, message) {
                                    break;
                                }
                            }
                            Ok(None) => {
                                log_trace!("ignoring '{command}' message");
                            }
                            Err(err) => {
                                // Malformed payload on a known command; the
                                // connection itself is still framed.
                                dispatch(&events, |e| {
                                    e.on_protocol_error(&format!("invalid {command} payload: {err}"))
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    dispatch(&events, |e| e.on_close());
}

async fn handshake(
    config: &PeerConfig,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> Result<(), String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    let version = Message::Version(VersionMessage {
        version: config.protocol_version,
        services: 0,
        timestamp,
        nonce: rand::random(),
        user_agent: config.user_agent.clone(),
        start_height: config.start_height,
        relay: config.relay,
    });
    writer
        .send(
            version.command(),
            &version.encode_payload(config.protocol_version),
        )
        .await?;

    let mut got_version = false;
    let mut got_verack = false;
    while !(got_version && got_verack) {
        let (command, payload) = timeout(
            Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
            reader.read(),
        )
        .await
        .map_err(|_| "peer handshake timed out".to_string())?
        .map_err(|err| match err {
            ReadError::Io(message) | ReadError::Protocol(message) => message,
        })?;
        match command.as_str() {
            "version" => {
                got_version = true;
                if let Ok(Some(Message::Version(remote))) = parse_message(&command, &payload) {
                    log_debug!(
                        "peer version {} ua {} height {}",
                        remote.version,
                        remote.user_agent,
                        remote.start_height
                    );
                }
                writer.send("verack", &[]).await?;
            }
            "verack" => {
                got_verack = true;
            }
            "ping" => {
                writer.send("pong", &payload).await?;
            }
            _ => {}
        }
    }
    Ok(())
}
