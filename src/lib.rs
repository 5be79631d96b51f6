//! # chainfile — a peer-to-peer content-addressed file store
//!
//! Shared state is a single totally-ordered chain of immutable blocks, each
//! carrying one chunk of a file plus provenance metadata.  The chain is both
//! the storage and the agreement primitive:
//!
//! - Block identity is SHA-256 over the block's fields; payload identity
//!   (`content_hash`) and chain identity (`block_hash`) are separate
//! - The chain keeps secondary indexes for O(1) hash lookup and per-file
//!   content buckets; a file is complete once every chunk is present
//! - Divergent chains resolve by length — longest chain wins — and blocks on
//!   the losing fork are re-appended so acknowledged data is never lost
//! - Peers gossip new blocks to every known peer and pull missing
//!   predecessors until a foreign suffix verifies or is rejected
//! - The wire format is a closed, length-delimited binary schema with
//!   mandatory CRC32 per frame; block hashes are recomputed on receipt,
//!   never trusted off the wire

pub mod block;
pub mod chain;
pub mod wire;
pub mod peer;
pub mod client;

// Flat re-exports for the most common types.
pub use block::{Block, BlockDraft, BlockHash, InvalidBlock};
pub use chain::{Chain, ChainError, SuffixCheck};
pub use client::{Client, ClientError, CHUNK_SIZE};
pub use peer::{PeerConfig, PeerError, PeerNode, DEFAULT_MAX_CONNECTIONS};
pub use wire::{Command, Frame, WireError};
