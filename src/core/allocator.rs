//! Block allocator for the paged KV cache.
//!
//! The allocator owns the fixed pool of KV blocks as a dense array and hands
//! out plain indices as handles. It tracks reference counts for
//! copy-on-write sharing and keeps a prefix-hash index so later requests can
//! reuse blocks whose content they share.
//!
//! Free blocks live in a FIFO queue: frees append, allocation pops the
//! oldest release. For cached blocks this doubles as LRU eviction - the
//! block reclaimed first is the one released longest ago, and reclaiming it
//! drops its hash entries.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::core::block::Block;
use crate::error::{Error, Result};

/// Manages allocation and reuse of KV cache blocks.
#[derive(Debug)]
pub struct BlockAllocator {
    /// All blocks, indexed by block index.
    blocks: Vec<Block>,
    /// Free block indices, oldest release first.
    free_list: VecDeque<usize>,
    /// Content hash -> block index, for prefix reuse.
    prefix_index: HashMap<u64, usize>,
    /// Whether freed hashed blocks are retained for reuse.
    enable_prefix_caching: bool,
}

impl BlockAllocator {
    /// Create an allocator managing `num_blocks` blocks.
    pub fn new(num_blocks: usize, enable_prefix_caching: bool) -> Self {
        Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_list: (0..num_blocks).collect(),
            prefix_index: HashMap::new(),
            enable_prefix_caching,
        }
    }

    /// Total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Number of blocks currently referenced by at least one sequence.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Whether `count` blocks can be allocated right now.
    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_list.len() >= count
    }

    /// Read access to a block's bookkeeping record.
    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    /// Return a free block with `ref_count = 1` and no content hash.
    ///
    /// Reclaiming a cached free block evicts its hash entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] when the free list is empty.
    pub fn allocate(&mut self) -> Result<usize> {
        let index = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        let block = &mut self.blocks[index];
        for registered in block.take_hashes() {
            if self.prefix_index.get(&registered.hash) == Some(&index) {
                self.prefix_index.remove(&registered.hash);
                trace!(block = index, hash = registered.hash, "evicted cached block hash");
            }
        }
        block.set_ref(1);
        Ok(index)
    }

    /// Share a block with another sequence: increments its reference count
    /// and returns the same index. Copy-on-write is deferred until one of
    /// the sharers needs to write into it.
    pub fn fork(&mut self, index: usize) -> usize {
        self.blocks[index].increment_ref();
        index
    }

    /// Make a block exclusively writable.
    ///
    /// If the block is unshared it is returned unchanged. Otherwise a new
    /// block is allocated, the source's reference count is decremented, and
    /// the caller must schedule a content copy from `src` to the returned
    /// index (reported through `blocks_to_copy` in the scheduler output).
    ///
    /// # Returns
    ///
    /// `(index, copied)` where `copied` is true when a new block was
    /// allocated and a content copy is required.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] when a copy is needed and the pool is
    /// exhausted.
    pub fn copy_on_write(&mut self, src: usize) -> Result<(usize, bool)> {
        if self.blocks[src].ref_count() <= 1 {
            return Ok((src, false));
        }
        let dst = self.allocate()?;
        self.blocks[src].decrement_ref();
        trace!(src, dst, "copy-on-write");
        Ok((dst, true))
    }

    /// Release one reference to a block.
    ///
    /// At reference count zero the block returns to the free list. With
    /// prefix caching enabled a hashed block keeps its index entries and can
    /// be revived by [`lookup_prefix`](Self::lookup_prefix) until the free
    /// queue reclaims it.
    ///
    /// # Returns
    ///
    /// `true` if the block reached reference count zero.
    pub fn free(&mut self, index: usize) -> bool {
        let block = &mut self.blocks[index];
        debug_assert!(block.ref_count() > 0, "double free of block {index}");
        if block.decrement_ref() > 0 {
            return false;
        }
        if !self.enable_prefix_caching {
            for registered in block.take_hashes() {
                if self.prefix_index.get(&registered.hash) == Some(&index) {
                    self.prefix_index.remove(&registered.hash);
                }
            }
        }
        self.free_list.push_back(index);
        true
    }

    /// Look up a block by content hash, taking a reference on hit.
    ///
    /// A hit on a free cached block revives it: the block leaves the free
    /// list with `ref_count = 1`, and hash entries covering more tokens than
    /// the match are dropped since those slots are about to be overwritten.
    /// A hit on an in-use block shares it (`ref_count += 1`); writes into it
    /// will go through copy-on-write.
    pub fn lookup_prefix(&mut self, hash: u64) -> Option<usize> {
        let index = *self.prefix_index.get(&hash)?;
        let matched_len = match self.blocks[index].hashes().iter().find(|h| h.hash == hash) {
            Some(registered) => registered.len,
            None => {
                // Stale entry: the block was reclaimed and re-registered.
                self.prefix_index.remove(&hash);
                return None;
            }
        };
        if self.blocks[index].is_free() {
            self.free_list.retain(|&i| i != index);
            self.blocks[index].set_ref(1);
            for dropped in self.blocks[index].retain_hashes_up_to(matched_len) {
                if self.prefix_index.get(&dropped.hash) == Some(&index) {
                    self.prefix_index.remove(&dropped.hash);
                }
            }
        } else {
            self.blocks[index].increment_ref();
        }
        trace!(block = index, matched_len, "prefix cache hit");
        Some(index)
    }

    /// Register a content hash for a block at the given fill level.
    ///
    /// No-op when prefix caching is disabled or the hash is already mapped
    /// (first registration wins; identical content in two blocks keeps the
    /// original as the canonical copy).
    pub fn register_hash(&mut self, index: usize, len: usize, hash: u64) {
        if !self.enable_prefix_caching || self.prefix_index.contains_key(&hash) {
            return;
        }
        self.blocks[index].push_hash(len, hash);
        self.prefix_index.insert(hash, index);
    }

    /// Number of live entries in the prefix index.
    pub fn num_cached_hashes(&self) -> usize {
        self.prefix_index.len()
    }
}
