//! Block identity — drafts, sealed blocks, and the genesis root.
//!
//! # Hash inputs (all integers little-endian)
//!
//! ```text
//! content_hash = SHA-256( file_hash ∥ index_all (LE u32) ∥ chunk ∥ index (LE u32) )
//! block_hash   = SHA-256( content-hash input ∥ previous_block_hash )
//! ```
//!
//! `content_hash` is the *payload identity* of a block, independent of chain
//! position: two blocks carrying the same chunk of the same file at the same
//! index always share it.  `block_hash` adds the linkage and is therefore
//! unique per chain position.
//!
//! # Endianness
//! Every integer in a hash input is a fixed-width little-endian value.  This
//! is frozen for the network; a peer using any other encoding produces
//! different hashes and its blocks simply never link.
//!
//! # Lifecycle
//! A [`BlockDraft`] carries the payload fields and `content_hash` only.  It
//! becomes a sealed [`Block`] the moment it is linked to a predecessor —
//! `block_hash` is computed exactly once, and no field of a sealed block can
//! change afterwards.  The only way back is `into_draft`, which strips the
//! linkage so the chain can re-link a block on top of a new tip.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// 32-byte SHA-256 digest identifying a sealed block.
pub type BlockHash = [u8; 32];

// ── Errors ───────────────────────────────────────────────────────────────────

/// Constructor argument violates the block range invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidBlock {
    #[error("index_all must be positive")]
    ZeroIndexAll,
    #[error("index {index} out of range for a file split into {index_all} chunks")]
    IndexOutOfRange { index: u32, index_all: u32 },
}

// ── Hash assembly ────────────────────────────────────────────────────────────

/// Hasher primed with the payload fields, shared by both identities.
fn payload_hasher(file_hash: &[u8], index_all: u32, chunk: &[u8], index: u32) -> Sha256 {
    let mut h = Sha256::new();
    h.update(file_hash);
    h.update(index_all.to_le_bytes());
    h.update(chunk);
    h.update(index.to_le_bytes());
    h
}

// ── BlockDraft ───────────────────────────────────────────────────────────────

/// An unlinked block: payload fields plus `content_hash`, no chain position.
///
/// Drafts are what clients construct and what travels in an `INSERT_BLOCKS`
/// request.  Linking happens inside the chain, which consumes the draft and
/// returns the sealed [`Block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDraft {
    file_hash:    Vec<u8>,
    index_all:    u32,
    chunk:        Vec<u8>,
    index:        u32,
    content_hash: BlockHash,
}

impl BlockDraft {
    /// Validate the range invariants and compute `content_hash`.
    pub fn new(
        file_hash: Vec<u8>,
        index_all: u32,
        chunk:     Vec<u8>,
        index:     u32,
    ) -> Result<Self, InvalidBlock> {
        if index_all == 0 {
            return Err(InvalidBlock::ZeroIndexAll);
        }
        if index >= index_all {
            return Err(InvalidBlock::IndexOutOfRange { index, index_all });
        }

        let content_hash: BlockHash =
            payload_hasher(&file_hash, index_all, &chunk, index).finalize().into();

        Ok(Self { file_hash, index_all, chunk, index, content_hash })
    }

    #[inline] pub fn file_hash(&self)    -> &[u8]      { &self.file_hash }
    #[inline] pub fn index_all(&self)    -> u32        { self.index_all }
    #[inline] pub fn chunk(&self)        -> &[u8]      { &self.chunk }
    #[inline] pub fn index(&self)        -> u32        { self.index }
    #[inline] pub fn content_hash(&self) -> &BlockHash { &self.content_hash }
}

// ── Block ────────────────────────────────────────────────────────────────────

/// A sealed block: payload identity plus chain linkage.  Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    file_hash:           Vec<u8>,
    index_all:           u32,
    chunk:               Vec<u8>,
    index:               u32,
    content_hash:        BlockHash,
    /// Empty for the genesis block, otherwise the 32-byte `block_hash` of
    /// the predecessor.
    previous_block_hash: Vec<u8>,
    block_hash:          BlockHash,
}

impl Block {
    /// Link a draft to its predecessor and compute `block_hash`.
    ///
    /// Crate-internal on purpose: the chain (and the wire decoder, which
    /// reconstructs received blocks) are the only places a linkage may be
    /// assigned.
    pub(crate) fn seal(draft: BlockDraft, previous_block_hash: Vec<u8>) -> Self {
        let mut h = payload_hasher(&draft.file_hash, draft.index_all, &draft.chunk, draft.index);
        h.update(&previous_block_hash);
        let block_hash: BlockHash = h.finalize().into();

        Self {
            file_hash: draft.file_hash,
            index_all: draft.index_all,
            chunk:     draft.chunk,
            index:     draft.index,
            content_hash: draft.content_hash,
            previous_block_hash,
            block_hash,
        }
    }

    /// The fixed, well-known root block.  Identical on every peer: empty
    /// file hash, a single empty chunk, and an empty predecessor hash.
    pub fn genesis() -> Self {
        let draft = BlockDraft::new(Vec::new(), 1, Vec::new(), 0)
            .unwrap_or_else(|_| unreachable!("genesis draft is statically valid"));
        Self::seal(draft, Vec::new())
    }

    /// Strip the linkage so the chain can re-link this block elsewhere.
    /// The payload identity (`content_hash`) is preserved; a new
    /// `block_hash` is assigned at the next seal.
    pub(crate) fn into_draft(self) -> BlockDraft {
        BlockDraft {
            file_hash:    self.file_hash,
            index_all:    self.index_all,
            chunk:        self.chunk,
            index:        self.index,
            content_hash: self.content_hash,
        }
    }

    #[inline] pub fn file_hash(&self)    -> &[u8]      { &self.file_hash }
    #[inline] pub fn index_all(&self)    -> u32        { self.index_all }
    #[inline] pub fn chunk(&self)        -> &[u8]      { &self.chunk }
    #[inline] pub fn index(&self)        -> u32        { self.index }
    #[inline] pub fn content_hash(&self) -> &BlockHash { &self.content_hash }
    #[inline] pub fn block_hash(&self)   -> &BlockHash { &self.block_hash }

    /// Predecessor hash; empty exactly for the genesis block.
    #[inline] pub fn previous_block_hash(&self) -> &[u8] { &self.previous_block_hash }

    #[inline] pub fn is_genesis(&self) -> bool { self.previous_block_hash.is_empty() }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_exposes_fields() {
        let draft = BlockDraft::new(b"123456".to_vec(), 1, b"Earth is our home.".to_vec(), 0)
            .unwrap();
        assert_eq!(draft.file_hash(), b"123456");
        assert_eq!(draft.index_all(), 1);
        assert_eq!(draft.chunk(), b"Earth is our home.");
        assert_eq!(draft.index(), 0);
    }

    #[test]
    fn zero_index_all_rejected() {
        let err = BlockDraft::new(b"123456".to_vec(), 0, b"x".to_vec(), 0).unwrap_err();
        assert_eq!(err, InvalidBlock::ZeroIndexAll);
    }

    #[test]
    fn index_out_of_range_rejected() {
        let err = BlockDraft::new(b"123456".to_vec(), 1, b"x".to_vec(), 5).unwrap_err();
        assert_eq!(err, InvalidBlock::IndexOutOfRange { index: 5, index_all: 1 });
    }

    #[test]
    fn content_hash_depends_only_on_payload() {
        let a = BlockDraft::new(b"f".to_vec(), 3, b"chunk".to_vec(), 1).unwrap();
        let b = BlockDraft::new(b"f".to_vec(), 3, b"chunk".to_vec(), 1).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = BlockDraft::new(b"f".to_vec(), 3, b"chunk".to_vec(), 2).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn seal_sets_linkage_and_block_hash() {
        let draft = BlockDraft::new(b"f".to_vec(), 1, b"chunk".to_vec(), 0).unwrap();
        let content = *draft.content_hash();

        let sealed = Block::seal(draft, vec![0xAB; 32]);
        assert_eq!(sealed.previous_block_hash(), &[0xAB; 32][..]);
        assert_eq!(sealed.content_hash(), &content);
        assert!(!sealed.is_genesis());
    }

    #[test]
    fn block_hash_depends_on_predecessor() {
        let a = BlockDraft::new(b"f".to_vec(), 1, b"chunk".to_vec(), 0).unwrap();
        let b = a.clone();

        let sealed_a = Block::seal(a, vec![0x01; 32]);
        let sealed_b = Block::seal(b, vec![0x02; 32]);
        assert_eq!(sealed_a.content_hash(), sealed_b.content_hash());
        assert_ne!(sealed_a.block_hash(), sealed_b.block_hash());
    }

    #[test]
    fn genesis_is_stable() {
        let g1 = Block::genesis();
        let g2 = Block::genesis();
        assert_eq!(g1, g2);
        assert!(g1.is_genesis());
        assert_eq!(g1.file_hash(), b"");
        assert_eq!(g1.index_all(), 1);
        assert_eq!(g1.chunk(), b"");
        assert_eq!(g1.index(), 0);
        assert!(g1.previous_block_hash().is_empty());
    }
}
