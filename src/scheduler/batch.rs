//! Continuous batching scheduler.
//!
//! Each step the scheduler decides which sequence groups run, mutates their
//! block tables through the allocator, and describes the resulting batch in
//! a [`SchedulerOutput`]. Requests may join and leave the batch at any step.
//!
//! Two batching regimes are supported:
//!
//! - **Prompt/generate separation** (`dynamic_split_fuse = false`): a step
//!   is either a prompt step (waiting groups admitted with their full
//!   remaining context) or a generate step (one token slot per running
//!   sequence), never both.
//! - **Dynamic split-fuse** (`dynamic_split_fuse = true`): running
//!   sequences claim their slots first, then the remaining token budget is
//!   filled with prompt chunks from waiting groups; a long prompt may be
//!   split across steps.
//!
//! When a running sequence needs a block and none is free, the most
//! recently admitted group still holding blocks is preempted - partially
//! (tail block rows released, processed counter rolled back) when allowed,
//! fully otherwise. The pipeline owns the group list and passes it in
//! admission order; the scheduler owns the block pool and the tables.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::allocator::BlockAllocator;
use crate::core::block::hash_token_block;
use crate::core::block_table::BlockTableStore;
use crate::core::sequence::{FinishReason, RequestId, SequenceGroup, SequenceId};
use crate::error::Result;

/// Description of one scheduled step.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Request ids of the groups scheduled this step, in admission order.
    pub scheduled_group_ids: Vec<RequestId>,
    /// Block table snapshot for every scheduled sequence.
    pub block_tables: HashMap<SequenceId, Vec<usize>>,
    /// Total number of tokens scheduled across all sequences.
    pub total_scheduled_tokens: usize,
    /// Whether this is a prompt-phase step (prompt/generate regime only;
    /// split-fuse steps always report false).
    pub is_prompt: bool,
    /// `(src, dst)` block pairs the runner must copy before the forward
    /// pass (copy-on-write resolution).
    pub blocks_to_copy: Vec<(usize, usize)>,
    /// Reserved for host offload; always empty.
    pub blocks_to_swap: Vec<(usize, usize)>,
    /// Request ids preempted back to waiting this step.
    pub preempted_group_ids: Vec<RequestId>,
}

impl SchedulerOutput {
    /// Whether nothing was scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled_group_ids.is_empty()
    }

    /// Number of sequences in the batch.
    pub fn num_scheduled_sequences(&self) -> usize {
        self.block_tables.len()
    }
}

/// Per-step decision engine over a fixed pool of KV blocks.
pub struct Scheduler {
    config: SchedulerConfig,
    allocator: BlockAllocator,
    tables: BlockTableStore,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a degenerate configuration.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let allocator = BlockAllocator::new(config.num_kv_blocks, config.enable_prefix_caching);
        Ok(Self {
            config,
            allocator,
            tables: BlockTableStore::new(),
        })
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Read access to the block allocator.
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Fraction of the block pool currently in use.
    pub fn kv_cache_usage(&self) -> f32 {
        self.allocator.num_used_blocks() as f32 / self.allocator.num_blocks() as f32
    }

    /// Whether a sequence currently holds any blocks.
    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.tables.has_table(seq_id)
    }

    /// Block indices held by a sequence (empty when none).
    pub fn get_block_table(&self, seq_id: SequenceId) -> &[usize] {
        self.tables.block_indices(seq_id)
    }

    /// Physical KV slots for token positions `[start, end)` of a sequence.
    pub fn slot_mapping(&self, seq_id: SequenceId, start: usize, end: usize) -> Vec<usize> {
        self.tables
            .table(seq_id)
            .map(|t| t.slot_mapping(start, end, self.config.block_size))
            .unwrap_or_default()
    }

    /// Release every block held by a sequence.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        self.tables.free_all(seq_id, &mut self.allocator);
    }

    /// Share a parent's block table with a forked child (beam expansion).
    /// Every block's reference count is incremented; the first divergent
    /// write triggers copy-on-write.
    pub fn fork_sequence(&mut self, src: SequenceId, dst: SequenceId) {
        self.tables.fork_table(src, dst, &mut self.allocator);
    }

    /// Attach prefix-cached blocks to a new group before admission.
    ///
    /// The prompt is matched block by block along the hash chain; a partial
    /// match of the trailing block ends matching. At least one token is
    /// always left to recompute so the first step produces logits.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        if !self.config.enable_prefix_caching || group.num_processed_tokens() > 0 {
            return;
        }
        let seq_id = group.sequences()[0].seq_id();
        if self.tables.has_table(seq_id) {
            return;
        }
        let block_size = self.config.block_size;
        let tokens = group.prompt_ids().to_vec();
        let limit = tokens.len().saturating_sub(1);
        let mut restored = 0;
        let mut parent: Option<u64> = None;
        'matching: while restored < limit {
            if restored + block_size <= limit {
                let hash = hash_token_block(&tokens[restored..restored + block_size], parent);
                if let Some(index) = self.allocator.lookup_prefix(hash) {
                    self.tables.attach_block(seq_id, index);
                    restored += block_size;
                    parent = Some(hash);
                    continue 'matching;
                }
            }
            // No full-block match: try the longest registered partial fill
            // of the next block, which ends the chain.
            let max_len = (block_size - 1).min(limit - restored);
            for len in (1..=max_len).rev() {
                let hash = hash_token_block(&tokens[restored..restored + len], parent);
                if let Some(index) = self.allocator.lookup_prefix(hash) {
                    self.tables.attach_block(seq_id, index);
                    restored += len;
                    break;
                }
            }
            break;
        }
        if restored > 0 {
            debug!(
                request = group.request_id(),
                restored, "restored prefix-cached blocks"
            );
            group.restore_processed_tokens(restored);
        }
    }

    /// Decide the next step over `groups` (in admission order).
    pub fn schedule(&mut self, groups: &mut [SequenceGroup]) -> SchedulerOutput {
        let mut out = SchedulerOutput::default();
        if self.config.dynamic_split_fuse {
            self.schedule_running(groups, &mut out);
            self.schedule_waiting(groups, &mut out);
        } else {
            self.schedule_waiting(groups, &mut out);
            if out.scheduled_group_ids.is_empty() {
                self.schedule_running(groups, &mut out);
            } else {
                out.is_prompt = true;
            }
        }
        out
    }

    /// Admit waiting groups.
    ///
    /// In the prompt/generate regime a group is admitted only with its full
    /// remaining context; in split-fuse mode the remaining token budget is
    /// filled with prompt chunks.
    fn schedule_waiting(&mut self, groups: &mut [SequenceGroup], out: &mut SchedulerOutput) {
        let block_size = self.config.block_size;
        let chunking = self.config.dynamic_split_fuse;
        for group in groups.iter_mut() {
            if !group.is_waiting() {
                continue;
            }
            // A group preempted this step stays out until the next one.
            if out.preempted_group_ids.contains(&group.request_id()) {
                continue;
            }
            if group.prompt_len() > self.config.total_token_capacity() {
                warn!(
                    request = group.request_id(),
                    prompt_len = group.prompt_len(),
                    "prompt exceeds KV cache capacity, ignoring request"
                );
                for seq_id in seq_ids(group) {
                    self.tables.free_all(seq_id, &mut self.allocator);
                }
                group.finish_all(FinishReason::Ignored);
                continue;
            }

            let seq_ids = seq_ids_not_finished(group);
            let num_seqs = seq_ids.len();
            if out.num_scheduled_sequences() + num_seqs > self.config.max_num_seqs {
                break;
            }
            let budget_left = self
                .config
                .max_num_batched_tokens
                .saturating_sub(out.total_scheduled_tokens);
            let available = group.num_tokens_to_process();

            let quantum = if chunking {
                let mut quantum = available.min(budget_left / num_seqs);
                // Shrink to what the pool can hold, cutting at block
                // boundaries.
                loop {
                    if quantum == 0 {
                        break;
                    }
                    let need: usize = seq_ids
                        .iter()
                        .map(|&seq_id| {
                            self.tables.blocks_required(
                                seq_id,
                                group.num_processed_tokens(),
                                group.num_processed_tokens() + quantum,
                                block_size,
                                &self.allocator,
                            )
                        })
                        .sum();
                    if self.allocator.can_allocate(need) {
                        break;
                    }
                    let end = group.num_processed_tokens() + quantum;
                    let boundary = (end - 1) / block_size * block_size;
                    quantum = boundary.saturating_sub(group.num_processed_tokens());
                }
                quantum
            } else {
                // Full remaining context or nothing.
                if available * num_seqs > budget_left {
                    break;
                }
                let need: usize = seq_ids
                    .iter()
                    .map(|&seq_id| {
                        self.tables.blocks_required(
                            seq_id,
                            group.num_processed_tokens(),
                            group.num_processed_tokens() + available,
                            block_size,
                            &self.allocator,
                        )
                    })
                    .sum();
                if !self.allocator.can_allocate(need) {
                    break;
                }
                available
            };
            if quantum == 0 {
                break;
            }

            if self.commit_group(group, &seq_ids, quantum, out).is_err() {
                // The pre-check made this unreachable; stop admitting if the
                // pool disagrees.
                break;
            }
            debug!(
                request = group.request_id(),
                tokens = quantum,
                "admitted waiting group"
            );
        }
    }

    /// Schedule running groups: steady-state sequences claim one generate
    /// slot each; split-fuse prompt continuations claim their next chunk.
    fn schedule_running(&mut self, groups: &mut [SequenceGroup], out: &mut SchedulerOutput) {
        let block_size = self.config.block_size;
        for i in 0..groups.len() {
            if !groups[i].is_running() || groups[i].has_finished() {
                continue;
            }
            let available = groups[i].num_tokens_to_process();
            if available == 0 {
                continue;
            }
            let seq_ids = seq_ids_running(&groups[i]);
            let num_seqs = seq_ids.len();
            if out.num_scheduled_sequences() + num_seqs > self.config.max_num_seqs {
                break;
            }
            let budget_left = self
                .config
                .max_num_batched_tokens
                .saturating_sub(out.total_scheduled_tokens);
            if budget_left < num_seqs {
                break;
            }
            let quantum = if self.config.dynamic_split_fuse {
                available.min(budget_left / num_seqs)
            } else {
                1
            };

            let start = groups[i].num_processed_tokens();
            let need: usize = seq_ids
                .iter()
                .map(|&seq_id| {
                    self.tables
                        .blocks_required(seq_id, start, start + quantum, block_size, &self.allocator)
                })
                .sum();
            if !self.allocator.can_allocate(need) && !self.preempt_for(groups, i, need, out) {
                // The group itself was preempted; nothing to schedule.
                continue;
            }
            let group = &mut groups[i];
            let seq_ids = seq_ids_running(group);
            if self.commit_group(group, &seq_ids, quantum, out).is_err() {
                break;
            }
        }
    }

    /// Allocate slots, snapshot tables, and record the scheduled quantum
    /// for one group.
    fn commit_group(
        &mut self,
        group: &mut SequenceGroup,
        seq_ids: &[SequenceId],
        quantum: usize,
        out: &mut SchedulerOutput,
    ) -> Result<()> {
        let block_size = self.config.block_size;
        let start = group.num_processed_tokens();
        let end = start + quantum;
        for &seq_id in seq_ids {
            let copies =
                self.tables
                    .ensure_slots(seq_id, start, end, block_size, &mut self.allocator)?;
            out.blocks_to_copy.extend(copies);
            self.register_hashes(group, seq_id, start, end)?;
            out.block_tables
                .insert(seq_id, self.tables.block_indices(seq_id).to_vec());
        }
        group.set_running();
        group.schedule_tokens(quantum);
        out.scheduled_group_ids.push(group.request_id());
        out.total_scheduled_tokens += quantum * seq_ids.len();
        Ok(())
    }

    /// Free blocks until `need` can be allocated, preempting the most
    /// recently admitted block-holding group first.
    ///
    /// # Returns
    ///
    /// `false` when the requester itself was preempted (or nothing holds
    /// blocks) and must not be scheduled this step.
    fn preempt_for(
        &mut self,
        groups: &mut [SequenceGroup],
        requester: usize,
        need: usize,
        out: &mut SchedulerOutput,
    ) -> bool {
        while !self.allocator.can_allocate(need) {
            let victim = (0..groups.len()).rev().find(|&i| {
                !groups[i].has_finished()
                    && groups[i]
                        .sequences()
                        .iter()
                        .any(|s| self.tables.has_table(s.seq_id()))
            });
            let Some(victim) = victim else {
                return false;
            };
            self.preempt_group(&mut groups[victim], need, out);
            if victim == requester {
                return false;
            }
        }
        true
    }

    /// Preempt one group.
    ///
    /// With partial preemption enabled, tail block rows are released one at
    /// a time (newest first) until `need` blocks are free, rolling the
    /// processed counter back to successive block boundaries (stopping at
    /// the prompt boundary first so generated KV goes before prompt KV). A
    /// rollback that ends mid-prompt is only resumable under split-fuse; in
    /// the prompt/generate regime it converts to full preemption.
    fn preempt_group(
        &mut self,
        group: &mut SequenceGroup,
        need: usize,
        out: &mut SchedulerOutput,
    ) {
        let block_size = self.config.block_size;
        let prompt_len = group.prompt_len();
        let seq_ids = seq_ids_not_finished(group);
        let mut processed = group.num_processed_tokens();

        if self.config.can_use_partial_preemption {
            while !self.allocator.can_allocate(need) && processed > 0 {
                let boundary = (processed - 1) / block_size * block_size;
                let target = if processed > prompt_len {
                    boundary.max(prompt_len)
                } else {
                    boundary
                };
                for &seq_id in &seq_ids {
                    self.tables
                        .truncate_to(seq_id, target, block_size, &mut self.allocator);
                }
                processed = target;
            }
            if processed < prompt_len && !self.config.dynamic_split_fuse {
                processed = 0;
            }
        } else {
            processed = 0;
        }

        if processed == 0 {
            for &seq_id in &seq_ids {
                self.tables.free_all(seq_id, &mut self.allocator);
            }
        }
        warn!(
            request = group.request_id(),
            kept_tokens = processed,
            "preempted group"
        );
        group.preempt(processed);
        if !out.preempted_group_ids.contains(&group.request_id()) {
            out.preempted_group_ids.push(group.request_id());
        }
    }

    /// Register content hashes for the token positions a sequence is about
    /// to write, so later requests can reuse the blocks.
    fn register_hashes(
        &mut self,
        group: &SequenceGroup,
        seq_id: SequenceId,
        start: usize,
        end: usize,
    ) -> Result<()> {
        if !self.config.enable_prefix_caching || start >= end {
            return Ok(());
        }
        let block_size = self.config.block_size;
        let mut tokens = Vec::with_capacity(end);
        for pos in 0..end {
            tokens.push(group.token_at(seq_id, pos)?);
        }
        let mut parent: Option<u64> = None;
        for block in 0..start / block_size {
            let lo = block * block_size;
            parent = Some(hash_token_block(&tokens[lo..lo + block_size], parent));
        }
        let indices = self.tables.block_indices(seq_id).to_vec();
        for pos in start..end {
            let block = pos / block_size;
            let lo = block * block_size;
            let len = pos + 1 - lo;
            let hash = hash_token_block(&tokens[lo..=pos], parent);
            self.allocator.register_hash(indices[block], len, hash);
            if len == block_size {
                parent = Some(hash);
            }
        }
        Ok(())
    }
}

fn seq_ids(group: &SequenceGroup) -> Vec<SequenceId> {
    group.sequences().iter().map(|s| s.seq_id()).collect()
}

fn seq_ids_not_finished(group: &SequenceGroup) -> Vec<SequenceId> {
    group
        .not_finished_sequences()
        .iter()
        .map(|s| s.seq_id())
        .collect()
}

fn seq_ids_running(group: &SequenceGroup) -> Vec<SequenceId> {
    group
        .running_sequences()
        .iter()
        .map(|s| s.seq_id())
        .collect()
}
