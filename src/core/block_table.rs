//! Per-sequence block tables.
//!
//! A block table maps a sequence's logical token positions to physical block
//! indices, like a page table in virtual memory:
//!
//! - Logical block index: position in the sequence (`pos / block_size`)
//! - Physical block index: actual block in the pool
//!
//! Tables hold non-owning indices; all reference counting goes through the
//! [`BlockAllocator`]. The store keys tables by sequence id and drives
//! growth in terms of the token positions a scheduling step is about to
//! write, allocating missing blocks and copy-on-writing shared ones.

use std::collections::HashMap;

use tracing::trace;

use crate::core::allocator::BlockAllocator;
use crate::core::block::blocks_needed;
use crate::core::sequence::SequenceId;
use crate::error::Result;

/// Ordered list of physical block indices for one sequence.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    block_indices: Vec<usize>,
}

impl BlockTable {
    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_indices.len()
    }

    /// Physical block indices in logical order.
    pub fn block_indices(&self) -> &[usize] {
        &self.block_indices
    }

    /// Physical slot indices for token positions `[start, end)`.
    ///
    /// Global slot = `block_index * block_size + pos % block_size`. Used to
    /// tell the model runner where each input token's KV entry lands.
    pub fn slot_mapping(&self, start: usize, end: usize, block_size: usize) -> Vec<usize> {
        (start..end)
            .map(|pos| self.block_indices[pos / block_size] * block_size + pos % block_size)
            .collect()
    }
}

/// Per-sequence block tables, keyed by sequence id.
#[derive(Debug, Default)]
pub struct BlockTableStore {
    tables: HashMap<SequenceId, BlockTable>,
}

impl BlockTableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sequence has a (possibly empty) table.
    pub fn has_table(&self, seq_id: SequenceId) -> bool {
        self.tables
            .get(&seq_id)
            .is_some_and(|t| !t.block_indices.is_empty())
    }

    /// The table for a sequence, if present.
    pub fn table(&self, seq_id: SequenceId) -> Option<&BlockTable> {
        self.tables.get(&seq_id)
    }

    /// Block indices for a sequence (empty slice when absent).
    pub fn block_indices(&self, seq_id: SequenceId) -> &[usize] {
        self.tables
            .get(&seq_id)
            .map(|t| t.block_indices.as_slice())
            .unwrap_or(&[])
    }

    /// Append an already-referenced block to a sequence's table.
    ///
    /// Used by prefix-cache restore, where the allocator has taken the
    /// reference during lookup.
    pub fn attach_block(&mut self, seq_id: SequenceId, block_index: usize) {
        self.tables
            .entry(seq_id)
            .or_default()
            .block_indices
            .push(block_index);
    }

    /// Number of block operations (allocations plus copies) needed before
    /// token positions `[start, end)` can be written for this sequence.
    pub fn blocks_required(
        &self,
        seq_id: SequenceId,
        start: usize,
        end: usize,
        block_size: usize,
        allocator: &BlockAllocator,
    ) -> usize {
        if start >= end {
            return 0;
        }
        let table_len = self.tables.get(&seq_id).map_or(0, |t| t.num_blocks());
        let mut required = 0;
        for logical in start / block_size..=(end - 1) / block_size {
            if logical >= table_len {
                required += 1;
            } else {
                let index = self.tables[&seq_id].block_indices[logical];
                if allocator.block(index).ref_count() > 1 {
                    required += 1;
                }
            }
        }
        required
    }

    /// Make token positions `[start, end)` writable for a sequence.
    ///
    /// Allocates missing tail blocks and copy-on-writes shared ones.
    ///
    /// # Returns
    ///
    /// The `(src, dst)` block pairs whose content must be copied before the
    /// forward pass (surfaced as `blocks_to_copy`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`](crate::error::Error::OutOfBlocks) when
    /// the pool cannot satisfy the growth; the caller preempts and retries.
    pub fn ensure_slots(
        &mut self,
        seq_id: SequenceId,
        start: usize,
        end: usize,
        block_size: usize,
        allocator: &mut BlockAllocator,
    ) -> Result<Vec<(usize, usize)>> {
        let mut copies = Vec::new();
        if start >= end {
            return Ok(copies);
        }
        let table = self.tables.entry(seq_id).or_default();
        for logical in start / block_size..=(end - 1) / block_size {
            if logical < table.block_indices.len() {
                let src = table.block_indices[logical];
                let (dst, copied) = allocator.copy_on_write(src)?;
                if copied {
                    table.block_indices[logical] = dst;
                    copies.push((src, dst));
                }
            } else {
                debug_assert_eq!(logical, table.block_indices.len());
                table.block_indices.push(allocator.allocate()?);
            }
        }
        Ok(copies)
    }

    /// Shallow-copy a sequence's table to a forked sibling.
    ///
    /// Every block is shared (`ref_count += 1`); the first write into a
    /// shared block triggers copy-on-write through
    /// [`ensure_slots`](Self::ensure_slots).
    pub fn fork_table(
        &mut self,
        src: SequenceId,
        dst: SequenceId,
        allocator: &mut BlockAllocator,
    ) {
        let indices = self.block_indices(src).to_vec();
        for &index in &indices {
            allocator.fork(index);
        }
        trace!(src, dst, blocks = indices.len(), "forked block table");
        self.tables.insert(dst, BlockTable { block_indices: indices });
    }

    /// Release tail blocks whose covered token range lies entirely beyond
    /// `num_tokens`. The (possibly partial) new last block remains.
    pub fn truncate_to(
        &mut self,
        seq_id: SequenceId,
        num_tokens: usize,
        block_size: usize,
        allocator: &mut BlockAllocator,
    ) {
        let Some(table) = self.tables.get_mut(&seq_id) else {
            return;
        };
        let keep = blocks_needed(num_tokens, block_size);
        for &index in table.block_indices.iter().skip(keep) {
            allocator.free(index);
        }
        table.block_indices.truncate(keep);
    }

    /// Release every block of a sequence and drop its table.
    pub fn free_all(&mut self, seq_id: SequenceId, allocator: &mut BlockAllocator) {
        if let Some(table) = self.tables.remove(&seq_id) {
            for index in table.block_indices {
                allocator.free(index);
            }
        }
    }
}
