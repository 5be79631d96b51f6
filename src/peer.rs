//! Peer node — hosts one chain, serves clients, gossips with peers.
//!
//! # Connection model
//! One request/response conversation per inbound TCP connection, then close.
//! Every connection is handled by its own task; concurrency is bounded by a
//! semaphore sized at `max_connections`, acquired *before* accepting, so
//! overload back-pressure lands in the listen backlog.
//!
//! # Locking
//! The chain sits behind a single read/write lock.  Queries take the read
//! half, mutations the write half, and the lock is NEVER held across network
//! I/O: broadcasts run after the mutation commits, and the missing-
//! predecessor pull loop runs unlocked, re-verifying the suffix under the
//! write lock immediately before merging.
//!
//! # Failure policy
//! Chain errors are surfaced to the requesting client.  Peer-level failures
//! (unreachable peer, bad reply) are logged and swallowed — one bad peer
//! must never stall the node.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockHash};
use crate::chain::{Chain, ChainError, SuffixCheck};
use crate::wire::{read_frame, write_frame, Command, Frame, WireError};

/// Default cap on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("unexpected {got} frame from {addr}")]
    BadResponse { addr: SocketAddr, got: &'static str },
    #[error("client sent an unexpected {got} frame")]
    BadRequest { got: &'static str },
    #[error("synced chain failed integrity verification")]
    ChainIntegrity,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn bad_response(addr: SocketAddr, frame: &Frame) -> PeerError {
    PeerError::BadResponse { addr, got: frame.kind() }
}

fn error_code(err: &ChainError) -> &'static str {
    match err {
        ChainError::FileBlockSplitChanged => "FileBlockSplitChanged",
        ChainError::DisconnectedSuffix => "DisconnectedSuffix",
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to listen on.  Port 0 binds an ephemeral port; the resolved
    /// address is what gets advertised to other peers.
    pub listen:          SocketAddr,
    /// Bootstrap peer to register with and sync from.
    pub join:            Option<SocketAddr>,
    pub max_connections: usize,
}

impl PeerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self { listen, join: None, max_connections: DEFAULT_MAX_CONNECTIONS }
    }
}

// ── Node state ───────────────────────────────────────────────────────────────

struct NodeState {
    /// Our own listen address as other peers can reach it.
    advertised:  SocketAddr,
    chain:       Arc<RwLock<Chain>>,
    known_peers: Mutex<HashSet<SocketAddr>>,
    connections: Arc<Semaphore>,
}

// ── PeerNode ─────────────────────────────────────────────────────────────────

pub struct PeerNode {
    listener: TcpListener,
    state:    Arc<NodeState>,
}

impl PeerNode {
    /// Bind the listen address and, if a bootstrap peer is configured,
    /// register with it and adopt its chain snapshot.  A snapshot that fails
    /// [`Chain::verify_integrity`] aborts startup.
    pub async fn start(config: PeerConfig) -> Result<Self, PeerError> {
        let listener = TcpListener::bind(config.listen).await?;
        let advertised = listener.local_addr()?;

        let state = Arc::new(NodeState {
            advertised,
            chain:       Arc::new(RwLock::new(Chain::new())),
            known_peers: Mutex::new(HashSet::new()),
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
        });

        if let Some(bootstrap) = config.join {
            join_network(&state, bootstrap).await?;
        }

        Ok(Self { listener, state })
    }

    /// The resolved listen address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.state.advertised
    }

    /// Shared handle to the hosted chain, for embedding and inspection.
    pub fn chain(&self) -> Arc<RwLock<Chain>> {
        Arc::clone(&self.state.chain)
    }

    /// Accept and serve connections until the surrounding task is cancelled.
    pub async fn run(self) -> Result<(), PeerError> {
        info!(addr = %self.state.advertised, "serving");
        loop {
            // Back-pressure: stop accepting while max_connections are active.
            let permit = match Arc::clone(&self.state.connections).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()), // semaphore closed — shutting down
            };
            let (stream, remote) = self.listener.accept().await?;

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let _permit = permit;
                debug!(%remote, "connection accepted");
                if let Err(err) = handle_connection(state, stream).await {
                    warn!(%remote, %err, "connection failed");
                }
            });
        }
    }
}

// ── Join flow ────────────────────────────────────────────────────────────────

async fn join_network(state: &Arc<NodeState>, bootstrap: SocketAddr) -> Result<(), PeerError> {
    info!(%bootstrap, "registering with bootstrap peer");
    state.known_peers.lock().await.insert(bootstrap);

    let mut stream = TcpStream::connect(bootstrap).await?;
    write_frame(&mut stream, &Frame::Command(Command::RegisterPeer)).await?;
    expect_ok(&mut stream, bootstrap).await?;
    write_frame(&mut stream, &Frame::Addr(state.advertised)).await?;

    let addrs = match read_frame(&mut stream).await? {
        Frame::AddrList(addrs) => addrs,
        other => return Err(bad_response(bootstrap, &other)),
    };
    let snapshot = match read_frame(&mut stream).await? {
        Frame::BlockList(blocks) => blocks,
        other => return Err(bad_response(bootstrap, &other)),
    };

    {
        let mut peers = state.known_peers.lock().await;
        for addr in addrs {
            if addr != state.advertised {
                peers.insert(addr);
            }
        }
    }

    let chain = Chain::from_blocks(snapshot);
    if !chain.verify_integrity() {
        return Err(PeerError::ChainIntegrity);
    }
    info!(len = chain.len(), "adopted chain snapshot");
    *state.chain.write().await = chain;
    Ok(())
}

// ── Inbound dispatch ─────────────────────────────────────────────────────────

async fn handle_connection(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    let cmd = match read_frame(&mut stream).await? {
        Frame::Command(cmd) => cmd,
        other => {
            warn!(got = other.kind(), "connection opened without a command");
            write_frame(&mut stream, &Frame::Error("UnknownCommand".into())).await?;
            return Ok(());
        }
    };

    match cmd {
        Command::InsertBlocks => insert_blocks(state, stream).await,
        Command::ContainsFile => contains_file(state, stream).await,
        Command::GetFile => get_file(state, stream).await,
        Command::RegisterPeer => register_peer(state, stream).await,
        Command::GetBlock => get_block(state, stream).await,
        Command::NewBlocksAvailable => new_blocks_available(state, stream).await,
    }
}

/// `INSERT_BLOCKS`: collect drafts until `END`, append the batch under the
/// write lock, acknowledge, then broadcast the new tip to every known peer.
async fn insert_blocks(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;

    let mut drafts = Vec::new();
    loop {
        match read_frame(&mut stream).await? {
            Frame::Draft(draft) => drafts.push(draft),
            Frame::End => break,
            other => {
                write_frame(&mut stream, &Frame::Error("BadRequest".into())).await?;
                return Err(PeerError::BadRequest { got: other.kind() });
            }
        }
    }

    let (result, chain_len) = {
        let mut chain = state.chain.write().await;
        let result = chain.insert_blocks(drafts);
        (result, chain.len() as u64)
    };

    match result {
        Ok(added) => {
            write_frame(&mut stream, &Frame::Ok).await?;
            drop(stream);
            info!(count = added.len(), "inserted client blocks");
            broadcast_new_blocks(&state, chain_len, added).await;
        }
        Err(err) => {
            warn!(%err, "rejecting insert batch");
            write_frame(&mut stream, &Frame::Error(error_code(&err).into())).await?;
        }
    }
    Ok(())
}

async fn contains_file(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;
    let file_hash = match read_frame(&mut stream).await? {
        Frame::Bytes(bytes) => bytes,
        other => return Err(PeerError::BadRequest { got: other.kind() }),
    };

    let contains = state.chain.read().await.contains_file(&file_hash);
    write_frame(&mut stream, &Frame::Bool(contains)).await?;
    Ok(())
}

/// `GET_FILE`: stream the file's blocks in index order, then `END`; a file
/// with no blocks at all yields a single `null`.
async fn get_file(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;
    let file_hash = match read_frame(&mut stream).await? {
        Frame::Bytes(bytes) => bytes,
        other => return Err(PeerError::BadRequest { got: other.kind() }),
    };

    let blocks: Vec<Block> = {
        let chain = state.chain.read().await;
        chain.get_file_blocks(&file_hash).into_iter().cloned().collect()
    };

    if blocks.is_empty() {
        write_frame(&mut stream, &Frame::Null).await?;
        return Ok(());
    }
    for block in blocks {
        write_frame(&mut stream, &Frame::Block(block)).await?;
    }
    write_frame(&mut stream, &Frame::End).await?;
    Ok(())
}

/// `REGISTER_PEER`: hand the newcomer our peer set (without itself) and a
/// full chain snapshot, then start gossiping to it as well.
async fn register_peer(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;
    let newcomer = match read_frame(&mut stream).await? {
        Frame::Addr(addr) => addr,
        other => return Err(PeerError::BadRequest { got: other.kind() }),
    };

    let known: Vec<SocketAddr> = {
        let mut peers = state.known_peers.lock().await;
        let snapshot = peers.iter().copied().collect();
        peers.insert(newcomer);
        snapshot
    };
    write_frame(&mut stream, &Frame::AddrList(known)).await?;

    let snapshot: Vec<Block> = {
        let chain = state.chain.read().await;
        chain.chain_list().into_iter().cloned().collect()
    };
    write_frame(&mut stream, &Frame::BlockList(snapshot)).await?;

    info!(peer = %newcomer, "registered peer");
    Ok(())
}

async fn get_block(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;
    let raw = match read_frame(&mut stream).await? {
        Frame::Bytes(bytes) => bytes,
        other => return Err(PeerError::BadRequest { got: other.kind() }),
    };

    let block = match BlockHash::try_from(raw.as_slice()) {
        Ok(hash) => state.chain.read().await.get_block_by_hash(&hash).cloned(),
        Err(_) => None,
    };
    match block {
        Some(block) => write_frame(&mut stream, &Frame::Block(block)).await?,
        None => write_frame(&mut stream, &Frame::Null).await?,
    }
    Ok(())
}

/// `NEW_BLOCKS_AVAILABLE`: longest chain wins.
///
/// Shorter or equal sender → nothing to adopt; if the sender is strictly
/// behind, re-broadcast our own tip so it can catch up.  Longer sender →
/// verify the suffix, pulling missing predecessors from the sender until a
/// verdict, then merge and propagate the result.
async fn new_blocks_available(state: Arc<NodeState>, mut stream: TcpStream) -> Result<(), PeerError> {
    write_frame(&mut stream, &Frame::Ok).await?;

    let sender = match read_frame(&mut stream).await? {
        Frame::Addr(addr) => addr,
        other => return Err(PeerError::BadRequest { got: other.kind() }),
    };
    let sender_len = match read_frame(&mut stream).await? {
        Frame::Uint(len) => len,
        other => return Err(bad_response(sender, &other)),
    };
    let suffix = match read_frame(&mut stream).await? {
        Frame::BlockList(blocks) => blocks,
        other => return Err(bad_response(sender, &other)),
    };
    // Conversation over; everything further happens by dialing back.
    drop(stream);

    if sender != state.advertised {
        state.known_peers.lock().await.insert(sender);
    }

    let local_len = state.chain.read().await.len() as u64;
    if sender_len <= local_len {
        if sender_len < local_len {
            // Reciprocal notify: a single-element suffix is enough, the
            // sender pulls the predecessors it is missing.
            debug!(peer = %sender, sender_len, local_len, "sender is behind; notifying");
            let (len, tip) = {
                let chain = state.chain.read().await;
                (chain.len() as u64, chain.tip().clone())
            };
            broadcast_new_blocks(&state, len, vec![tip]).await;
        }
        return Ok(());
    }

    sync_from_peer(state, sender, suffix).await
}

// ── Sync & broadcast ─────────────────────────────────────────────────────────

/// Verify a foreign suffix, pulling missing predecessors from the sender
/// until a verdict, then merge and re-broadcast.  Terminates because every
/// pull extends the suffix backwards toward a locally-known block or the
/// genesis.
async fn sync_from_peer(
    state: Arc<NodeState>,
    sender: SocketAddr,
    mut suffix: Vec<Block>,
) -> Result<(), PeerError> {
    if suffix.is_empty() {
        return Ok(());
    }

    loop {
        // Take the verdict and drop the read guard before doing anything
        // else — pulls below must not run under the lock, and the merge
        // path re-acquires it for writing.
        let verdict = {
            let chain = state.chain.read().await;
            chain.verify_blocks_integrity(&suffix)
        };
        match verdict {
            SuffixCheck::Broken => {
                warn!(peer = %sender, "received block suffix is not valid; ignoring");
                return Ok(());
            }
            SuffixCheck::MissingAncestor => {
                let missing = suffix[0].previous_block_hash().to_vec();
                match pull_block(sender, &missing).await? {
                    Some(block) => suffix.insert(0, block),
                    None => {
                        warn!(peer = %sender, hash = %hex::encode(&missing),
                              "sender cannot supply a predecessor it announced; ignoring");
                        return Ok(());
                    }
                }
            }
            SuffixCheck::Linked => {
                let merged = {
                    let mut chain = state.chain.write().await;
                    // The chain may have moved while we pulled — re-verify
                    // under the write lock before committing.
                    match chain.verify_blocks_integrity(&suffix) {
                        SuffixCheck::Linked => {
                            let added = chain.merge_blocks(suffix.clone())?;
                            Some((added, chain.len() as u64))
                        }
                        SuffixCheck::Broken => None,
                        SuffixCheck::MissingAncestor => continue, // lost a race; pull again
                    }
                };
                let Some((added, len)) = merged else {
                    warn!(peer = %sender, "suffix no longer valid after re-check; ignoring");
                    return Ok(());
                };
                if !added.is_empty() {
                    info!(peer = %sender, count = added.len(), "merged longer chain");
                    broadcast_new_blocks(&state, len, added).await;
                }
                return Ok(());
            }
        }
    }
}

/// Fetch one block by hash from a peer.
async fn pull_block(peer: SocketAddr, hash: &[u8]) -> Result<Option<Block>, PeerError> {
    debug!(%peer, hash = %hex::encode(hash), "pulling missing predecessor");
    let mut stream = TcpStream::connect(peer).await?;
    write_frame(&mut stream, &Frame::Command(Command::GetBlock)).await?;
    expect_ok(&mut stream, peer).await?;
    write_frame(&mut stream, &Frame::Bytes(hash.to_vec())).await?;
    match read_frame(&mut stream).await? {
        Frame::Block(block) => Ok(Some(block)),
        Frame::Null => Ok(None),
        other => Err(bad_response(peer, &other)),
    }
}

/// Announce newly appended blocks to every known peer, in parallel.
/// Unreachable peers are logged and skipped; the chain lock is not held.
async fn broadcast_new_blocks(state: &Arc<NodeState>, chain_len: u64, blocks: Vec<Block>) {
    if blocks.is_empty() {
        return;
    }
    let peers: Vec<SocketAddr> = {
        let known = state.known_peers.lock().await;
        known.iter().copied().filter(|addr| *addr != state.advertised).collect()
    };
    if peers.is_empty() {
        return;
    }

    let blocks = Arc::new(blocks);
    let own = state.advertised;
    let mut tasks = JoinSet::new();
    for peer in peers {
        let blocks = Arc::clone(&blocks);
        tasks.spawn(async move {
            if let Err(err) = notify_peer(own, peer, chain_len, &blocks).await {
                warn!(%peer, %err, "peer unreachable during broadcast; skipping");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

async fn notify_peer(
    own: SocketAddr,
    peer: SocketAddr,
    chain_len: u64,
    blocks: &[Block],
) -> Result<(), PeerError> {
    let mut stream = TcpStream::connect(peer).await?;
    write_frame(&mut stream, &Frame::Command(Command::NewBlocksAvailable)).await?;
    expect_ok(&mut stream, peer).await?;
    write_frame(&mut stream, &Frame::Addr(own)).await?;
    write_frame(&mut stream, &Frame::Uint(chain_len)).await?;
    write_frame(&mut stream, &Frame::BlockList(blocks.to_vec())).await?;
    Ok(())
}

async fn expect_ok(stream: &mut TcpStream, peer: SocketAddr) -> Result<(), PeerError> {
    match read_frame(stream).await? {
        Frame::Ok => Ok(()),
        other => Err(bad_response(peer, &other)),
    }
}
