//! The chain — an append-only log of blocks with multi-key access.
//!
//! # Structure
//! Blocks are owned by value in a single `block_hash → Block` map; every
//! secondary index refers to them by hash, never by pointer.  The file index
//! is two levels deep:
//!
//! ```text
//! files: file_hash → FileEntry
//!            FileEntry.index_all  total chunk count declared for the file
//!            FileEntry.buckets    content_hash → non-empty list of block_hashes
//! ```
//!
//! A duplicate insert of the same payload lands in the same bucket; a file is
//! *complete* once it has as many distinct content hashes as `index_all`.
//! Buckets are pruned the moment they empty — an empty bucket would make
//! completeness checks lie.
//!
//! # Fork resolution
//! [`Chain::merge_blocks`] adopts a longer foreign suffix verbatim and then
//! re-appends any local blocks that lay beyond the fork point.  Losing-fork
//! blocks carry user data that was already acknowledged; re-appending them on
//! top of the adopted suffix preserves that data without global agreement on
//! ordering.  A re-appended block is re-linked and therefore receives a fresh
//! `block_hash`.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::block::{Block, BlockDraft, BlockHash};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The file identified by this `file_hash` is already completely stored
    /// and the incoming block carries a payload the chain has never seen —
    /// the client re-chunked an existing file.
    #[error("file is already complete with a different chunk split")]
    FileBlockSplitChanged,
    /// A merge suffix (or the local chain while unwinding a fork) does not
    /// connect to any locally known block.  Callers prevent this by merging
    /// only after [`Chain::verify_blocks_integrity`] reports
    /// [`SuffixCheck::Linked`].
    #[error("block suffix does not attach to any locally known block")]
    DisconnectedSuffix,
}

// ── SuffixCheck ──────────────────────────────────────────────────────────────

/// Verdict on a proposed chain suffix (oldest → newest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixCheck {
    /// Internal linkage is consistent and the suffix attaches to a locally
    /// known block — safe to merge.
    Linked,
    /// Internal linkage is consistent but the oldest block's predecessor is
    /// unknown here; more blocks must be pulled before a verdict.
    MissingAncestor,
    /// An internal link is wrong.  The suffix must be discarded.
    Broken,
}

// ── FileEntry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FileEntry {
    index_all: u32,
    /// content_hash → block hashes carrying that payload.  Never empty.
    buckets:   HashMap<BlockHash, Vec<BlockHash>>,
}

impl FileEntry {
    fn new(index_all: u32) -> Self {
        Self { index_all, buckets: HashMap::new() }
    }

    /// `>=` rather than `==`: a merge can push a file past complete.
    #[inline]
    fn is_complete(&self) -> bool {
        self.buckets.len() as u64 >= u64::from(self.index_all)
    }
}

// ── Chain ────────────────────────────────────────────────────────────────────

pub struct Chain {
    blocks: HashMap<BlockHash, Block>,
    files:  HashMap<Vec<u8>, FileEntry>,
    tip:    BlockHash,
}

impl Chain {
    /// A fresh chain containing only the genesis block.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let tip = *genesis.block_hash();

        let mut chain = Self { blocks: HashMap::new(), files: HashMap::new(), tip };
        chain.index_block(&genesis);
        chain.blocks.insert(tip, genesis);
        chain
    }

    /// Build a chain from a snapshot received from a peer, oldest → newest.
    /// The last element becomes the tip.  The list is adopted verbatim; the
    /// caller MUST run [`Chain::verify_integrity`] afterwards and reject the
    /// snapshot on `false`.  An empty snapshot yields a fresh chain.
    pub fn from_blocks(seed: Vec<Block>) -> Self {
        let Some(last) = seed.last() else { return Self::new() };
        let tip = *last.block_hash();

        let mut chain = Self { blocks: HashMap::new(), files: HashMap::new(), tip };
        for block in seed {
            chain.index_block(&block);
            chain.blocks.insert(*block.block_hash(), block);
        }
        chain
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Total number of blocks, genesis included.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false — every chain contains at least the genesis block.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The most recently appended block.
    pub fn tip(&self) -> &Block {
        &self.blocks[&self.tip]
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Every block currently carrying this exact payload, duplicates included.
    pub fn get_blocks_by_content(&self, file_hash: &[u8], content_hash: &BlockHash) -> Vec<&Block> {
        let Some(entry) = self.files.get(file_hash) else { return Vec::new() };
        let Some(bucket) = entry.buckets.get(content_hash) else { return Vec::new() };
        bucket.iter().map(|h| &self.blocks[h]).collect()
    }

    /// True iff every chunk of the file is present.
    pub fn contains_file(&self, file_hash: &[u8]) -> bool {
        self.files.get(file_hash).is_some_and(FileEntry::is_complete)
    }

    /// One block per distinct payload of the file, ascending by chunk index.
    /// For a duplicated payload any representative suffices — the chunks are
    /// identical by construction.  An unknown file yields an empty list.
    pub fn get_file_blocks(&self, file_hash: &[u8]) -> Vec<&Block> {
        let Some(entry) = self.files.get(file_hash) else { return Vec::new() };
        let mut out: Vec<&Block> = entry
            .buckets
            .values()
            .map(|bucket| &self.blocks[&bucket[0]])
            .collect();
        out.sort_by_key(|b| b.index());
        out
    }

    /// The whole chain, oldest → newest.  This is the wire ordering used by
    /// peer registration snapshots.
    pub fn chain_list(&self) -> Vec<&Block> {
        let mut out = Vec::with_capacity(self.blocks.len());
        let mut cur = self.tip();
        out.push(cur);
        while !cur.is_genesis() {
            match self.predecessor(cur) {
                Some(prev) => {
                    out.push(prev);
                    cur = prev;
                }
                None => break, // dangling link; verify_integrity reports this
            }
        }
        out.reverse();
        out
    }

    // ── Insertion ────────────────────────────────────────────────────────────

    /// Append a draft on top of the current tip.
    ///
    /// Fails with [`ChainError::FileBlockSplitChanged`] when the draft's file
    /// is already complete and this payload is new to it.  The check fires
    /// only after completion — re-inserting payloads the chain already knows
    /// is always allowed (it records provenance from another writer).
    pub fn insert_block(&mut self, draft: BlockDraft) -> Result<&Block, ChainError> {
        if let Some(entry) = self.files.get(draft.file_hash()) {
            if !entry.buckets.contains_key(draft.content_hash()) && entry.is_complete() {
                return Err(ChainError::FileBlockSplitChanged);
            }
        }

        let sealed = Block::seal(draft, self.tip.to_vec());
        let hash = *sealed.block_hash();

        self.index_block(&sealed);
        self.blocks.insert(hash, sealed);
        self.tip = hash;

        Ok(&self.blocks[&hash])
    }

    /// Append a whole batch, all-or-nothing.
    ///
    /// The batch is first replayed against a shadow of the file index so a
    /// split-change anywhere in it is detected before the chain is touched.
    pub fn insert_blocks(&mut self, drafts: Vec<BlockDraft>) -> Result<Vec<Block>, ChainError> {
        // Shadow replay: (index_all, contents seen) per file.
        {
            let mut shadow: HashMap<&[u8], (u32, HashSet<BlockHash>)> = HashMap::new();
            for draft in &drafts {
                let (index_all, contents) = shadow
                    .entry(draft.file_hash())
                    .or_insert_with(|| match self.files.get(draft.file_hash()) {
                        Some(entry) => (entry.index_all, entry.buckets.keys().copied().collect()),
                        None => (draft.index_all(), HashSet::new()),
                    });
                let complete = contents.len() as u64 >= u64::from(*index_all);
                if !contents.contains(draft.content_hash()) && complete {
                    return Err(ChainError::FileBlockSplitChanged);
                }
                contents.insert(*draft.content_hash());
            }
        }

        let mut sealed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            sealed.push(self.insert_block(draft)?.clone());
        }
        Ok(sealed)
    }

    // ── Integrity ────────────────────────────────────────────────────────────

    /// Walk tip → genesis and check the whole chain.
    ///
    /// Fails on a dangling predecessor link, a terminal block that is not the
    /// genesis, or any file encountered on the walk with fewer distinct
    /// payloads than its declared chunk count.
    pub fn verify_integrity(&self) -> bool {
        let Some(mut cur) = self.blocks.get(&self.tip) else { return false };

        let mut seen: HashMap<&[u8], (u32, HashSet<&BlockHash>)> = HashMap::new();
        loop {
            let (_, contents) = seen
                .entry(cur.file_hash())
                .or_insert_with(|| (cur.index_all(), HashSet::new()));
            contents.insert(cur.content_hash());

            if cur.is_genesis() {
                break;
            }
            match self.predecessor(cur) {
                Some(prev) => cur = prev,
                None => return false,
            }
        }

        if cur.block_hash() != Block::genesis().block_hash() {
            return false;
        }

        seen.values()
            .all(|(index_all, contents)| contents.len() as u64 >= u64::from(*index_all))
    }

    /// Judge a proposed suffix (oldest → newest) of another peer's chain.
    ///
    /// Every internal link is checked even when some blocks are already known
    /// locally — a suffix with a broken interior is rejected outright.  A
    /// single block whose predecessor is known yields [`SuffixCheck::Linked`].
    pub fn verify_blocks_integrity(&self, blocks: &[Block]) -> SuffixCheck {
        let Some(first) = blocks.first() else { return SuffixCheck::MissingAncestor };

        for pair in blocks.windows(2) {
            if pair[1].previous_block_hash() != pair[0].block_hash().as_slice() {
                return SuffixCheck::Broken;
            }
        }

        if first.is_genesis() {
            // Anchored at the root, which every chain contains.
            return SuffixCheck::Linked;
        }
        match BlockHash::try_from(first.previous_block_hash()) {
            Ok(prev) if self.blocks.contains_key(&prev) => SuffixCheck::Linked,
            Ok(_) => SuffixCheck::MissingAncestor,
            Err(_) => SuffixCheck::Broken,
        }
    }

    // ── Merge ────────────────────────────────────────────────────────────────

    /// Reconcile with a longer foreign chain suffix (oldest → newest).
    ///
    /// Foreign blocks unknown here are adopted verbatim — their linkage is
    /// authoritative.  If the suffix forks off before the local tip, the
    /// local blocks beyond the fork point are unwound and re-appended on top
    /// of the adopted suffix, in their original order, via
    /// [`Chain::insert_block`] (so each receives a fresh linkage).
    ///
    /// Returns every block appended to the chain, oldest → newest: the
    /// adopted foreign blocks followed by any re-appended local ones.  An
    /// empty or fully-known suffix returns an empty list and leaves the tip
    /// untouched.
    pub fn merge_blocks(&mut self, new_blocks: Vec<Block>) -> Result<Vec<Block>, ChainError> {
        // The unknown tail of the suffix.  Known blocks are local and
        // reachable, so the unknown ones are always the contiguous newest
        // part of a Linked suffix.
        let fresh: Vec<Block> = new_blocks
            .into_iter()
            .filter(|b| !self.blocks.contains_key(b.block_hash()))
            .collect();
        let Some(first) = fresh.first() else { return Ok(Vec::new()) };

        // Fork point: predecessor of the oldest adopted block.
        let fork = match BlockHash::try_from(first.previous_block_hash()) {
            Ok(prev) if self.blocks.contains_key(&prev) => prev,
            _ => return Err(ChainError::DisconnectedSuffix),
        };

        // Identify the losing fork tail (tip → fork, newest first) before
        // mutating anything, so a disconnected walk leaves the chain intact.
        let mut losing_hashes: Vec<BlockHash> = Vec::new();
        let mut cur = self.tip;
        while cur != fork {
            let Some(block) = self.blocks.get(&cur) else {
                return Err(ChainError::DisconnectedSuffix);
            };
            losing_hashes.push(cur);
            cur = match BlockHash::try_from(block.previous_block_hash()) {
                Ok(prev) => prev,
                Err(_) => return Err(ChainError::DisconnectedSuffix),
            };
        }

        // Adopt the foreign blocks.
        for block in &fresh {
            self.index_block(block);
            self.blocks.insert(*block.block_hash(), block.clone());
        }
        let mut added = fresh;
        if let Some(last) = added.last() {
            self.tip = *last.block_hash();
        }

        // Unwind the losing tail, oldest first for re-insertion.
        let mut losing: Vec<Block> = Vec::with_capacity(losing_hashes.len());
        for hash in &losing_hashes {
            if let Some(block) = self.blocks.remove(hash) {
                self.unindex_block(&block);
                losing.push(block);
            }
        }
        losing.reverse();

        // Re-append: acknowledged user data must survive the merge.
        for block in losing {
            let sealed = self.insert_block(block.into_draft())?.clone();
            added.push(sealed);
        }

        Ok(added)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn predecessor(&self, block: &Block) -> Option<&Block> {
        let prev = BlockHash::try_from(block.previous_block_hash()).ok()?;
        self.blocks.get(&prev)
    }

    /// Record a block in the file index.  The chain map is updated by the
    /// caller.  `index_all` is pinned when the file is first seen and never
    /// overwritten — a later block declaring a different chunk count must not
    /// be able to shrink the file's completeness threshold.
    fn index_block(&mut self, block: &Block) {
        let entry = self
            .files
            .entry(block.file_hash().to_vec())
            .or_insert_with(|| FileEntry::new(block.index_all()));
        entry
            .buckets
            .entry(*block.content_hash())
            .or_default()
            .push(*block.block_hash());
    }

    /// Drop a block from the file index, pruning empty buckets and entries.
    fn unindex_block(&mut self, block: &Block) {
        let Some(entry) = self.files.get_mut(block.file_hash()) else { return };
        if let Some(bucket) = entry.buckets.get_mut(block.content_hash()) {
            bucket.retain(|h| h != block.block_hash());
            if bucket.is_empty() {
                entry.buckets.remove(block.content_hash());
            }
        }
        if entry.buckets.is_empty() {
            self.files.remove(block.file_hash());
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
