//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A block holds KV entries for
//! `block_size` consecutive tokens of one sequence, or is shared across
//! sequences through reference counting.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Compute a cumulative hash for a run of tokens including its prefix chain.
///
/// Used for prefix caching to identify shared prefixes. The hash includes the
/// parent block's hash to create a chain, ensuring that blocks at the same
/// position with different prefixes have different hashes.
///
/// # Arguments
///
/// * `token_ids` - Tokens occupying the block (may be fewer than the block
///   size for a trailing partial block)
/// * `parent_hash` - Hash of the previous block in the chain (`None` for the
///   first block)
///
/// # Example
///
/// ```
/// use contbatch::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// A content hash registered for a block at a given fill level.
///
/// A block accumulates one entry per occupied length while it fills; the
/// full-length entry is the one later blocks chain from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredHash {
    /// Number of tokens the hash covers.
    pub len: usize,
    /// Chained content hash.
    pub hash: u64,
}

/// Bookkeeping record for one physical KV cache block.
///
/// Blocks are owned by the [`BlockAllocator`](super::allocator::BlockAllocator)
/// in a dense array; everything else refers to a block by its index.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index of this block in the pool.
    index: usize,
    /// Number of sequences referencing this block. Zero means free.
    ref_count: usize,
    /// Content hashes registered for this block, one per occupied length.
    hashes: Vec<RegisteredHash>,
}

impl Block {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            ref_count: 0,
            hashes: Vec::new(),
        }
    }

    /// Index of this block in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether the block is free (unreferenced).
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// The hash registered for the longest occupied length, if any.
    pub fn content_hash(&self) -> Option<u64> {
        self.hashes.iter().max_by_key(|h| h.len).map(|h| h.hash)
    }

    pub(crate) fn hashes(&self) -> &[RegisteredHash] {
        &self.hashes
    }

    pub(crate) fn push_hash(&mut self, len: usize, hash: u64) {
        self.hashes.push(RegisteredHash { len, hash });
    }

    /// Drop registered hashes covering more than `len` tokens. Used when a
    /// cached block is revived through a partial-length match: the slots
    /// beyond the match are about to be overwritten.
    pub(crate) fn retain_hashes_up_to(&mut self, len: usize) -> Vec<RegisteredHash> {
        let (keep, dropped) = self.hashes.iter().copied().partition(|h| h.len <= len);
        self.hashes = keep;
        dropped
    }

    pub(crate) fn take_hashes(&mut self) -> Vec<RegisteredHash> {
        std::mem::take(&mut self.hashes)
    }

    pub(crate) fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    pub(crate) fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub(crate) fn set_ref(&mut self, ref_count: usize) {
        self.ref_count = ref_count;
    }
}

/// Number of blocks needed for a sequence of `num_tokens` tokens.
///
/// # Example
///
/// ```
/// use contbatch::core::block::blocks_needed;
///
/// assert_eq!(blocks_needed(35, 16), 3);
/// assert_eq!(blocks_needed(32, 16), 2);
/// assert_eq!(blocks_needed(0, 16), 0);
/// ```
pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}
