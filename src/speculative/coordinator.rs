//! Speculative decoding coordinator.
//!
//! Drives a small draft model and a larger target model over paged KV
//! caches kept in lockstep:
//!
//! 1. **Draft**: K autoregressive single-token passes propose candidates.
//! 2. **Validate**: one target pass over the K-token window
//!    `[t_last, d_0, .., d_{K-2}]` yields K greedy tokens.
//! 3. **Accept**: the target's tokens are taken up to (and including) the
//!    first position where it disagrees with the draft - at least one token
//!    per iteration, all K on full agreement.
//! 4. **Rollback**: both models' KV caches and block tables are trimmed to
//!    the accepted length; rejected draft entries disappear.
//!
//! At every outer-iteration boundary both caches hold the same accepted
//! prefix of length `L`, with the newest accepted token's KV still pending
//! (it is written by the next pass that consumes the token).

use candle_core::{IndexOp, Tensor};
use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::core::allocator::BlockAllocator;
use crate::core::block::blocks_needed;
use crate::core::block_table::BlockTableStore;
use crate::core::sequence::{SequenceGroup, SequenceId};
use crate::engine::runner::{AttentionPhase, ForwardBatch, ModelRunner};
use crate::engine::sampler::argmax_token;
use crate::error::{Error, Result};
use crate::speculative::config::SpeculativeConfig;

/// Histogram of accepted-token counts per outer iteration.
///
/// `hits(n)` is the number of iterations that accepted exactly `n` tokens,
/// `n` in `1..=K`. Skews toward K mean the draft model tracks the target
/// well and a larger K may pay off; skews toward 1 mean drafting is wasted.
#[derive(Debug, Clone)]
pub struct AcceptanceStats {
    hits: Vec<u64>,
}

impl AcceptanceStats {
    fn new(k: usize) -> Self {
        Self {
            hits: vec![0; k + 1],
        }
    }

    fn record(&mut self, accepted: usize) {
        self.hits[accepted] += 1;
    }

    /// Iterations that accepted exactly `n` tokens.
    pub fn hits(&self, n: usize) -> u64 {
        self.hits.get(n).copied().unwrap_or(0)
    }

    /// Total outer iterations.
    pub fn iterations(&self) -> u64 {
        self.hits.iter().sum()
    }

    /// Mean accepted tokens per iteration.
    pub fn mean_accepted(&self) -> f64 {
        let iterations = self.iterations();
        if iterations == 0 {
            return 0.0;
        }
        let tokens: u64 = self
            .hits
            .iter()
            .enumerate()
            .map(|(n, &count)| n as u64 * count)
            .sum();
        tokens as f64 / iterations as f64
    }
}

/// Result of a speculative generation run.
#[derive(Debug, Clone)]
pub struct SpeculativeResult {
    /// Generated token ids (prompt excluded).
    pub token_ids: Vec<u32>,
    /// Acceptance histogram for tuning K.
    pub stats: AcceptanceStats,
}

/// One model plus its private paged KV bookkeeping.
///
/// Draft and target each get their own pool: the models differ in size and
/// never share blocks, they only stay length-aligned.
struct ModelContext {
    runner: Box<dyn ModelRunner>,
    allocator: BlockAllocator,
    tables: BlockTableStore,
    group: SequenceGroup,
    seq_id: SequenceId,
    block_size: usize,
}

impl ModelContext {
    fn new(runner: Box<dyn ModelRunner>, prompt: &[u32], config: &SpeculativeConfig) -> Self {
        let group = SequenceGroup::new(0, prompt.to_vec(), GenerationConfig::greedy());
        let seq_id = group.sequences()[0].seq_id();
        Self {
            runner,
            allocator: BlockAllocator::new(config.num_kv_blocks, false),
            tables: BlockTableStore::new(),
            group,
            seq_id,
            block_size: config.block_size,
        }
    }

    /// Run `tokens` through the model at positions `start..start + n`,
    /// growing the block table as needed.
    fn forward(&mut self, tokens: &[u32], start: usize, phase: AttentionPhase) -> Result<Tensor> {
        let end = start + tokens.len();
        self.tables
            .ensure_slots(self.seq_id, start, end, self.block_size, &mut self.allocator)?;
        let table = self.tables.block_indices(self.seq_id).to_vec();
        let slot_mapping = self
            .tables
            .table(self.seq_id)
            .map(|t| t.slot_mapping(start, end, self.block_size))
            .unwrap_or_default();
        let batch = ForwardBatch {
            input_ids: tokens.to_vec(),
            position_ids: (start..end).collect(),
            slot_mapping,
            seq_input_lens: vec![tokens.len()],
            context_lens: vec![end],
            max_context_len: end,
            block_tables: vec![table],
            phase,
            blocks_to_copy: Vec::new(),
        };
        Ok(self.runner.forward(&batch)?.logits)
    }

    /// Trim the KV cache to `len` tokens, releasing tail blocks.
    fn trim_to(&mut self, len: usize) {
        self.tables
            .truncate_to(self.seq_id, len, self.block_size, &mut self.allocator);
    }

    fn table_len(&self) -> usize {
        self.tables.block_indices(self.seq_id).len()
    }

    /// Commit `tokens` into the lockstep bookkeeping group.
    fn commit(&mut self, tokens: &[u32]) -> Result<()> {
        let seq = self.group.sequence_mut(self.seq_id)?;
        for &token in tokens {
            seq.append_token(token, 0.0);
        }
        Ok(())
    }
}

/// Draft/target control loop over two model runners.
pub struct SpeculativeCoordinator {
    target: ModelContext,
    draft: ModelContext,
    config: SpeculativeConfig,
    /// Accepted prefix length whose KV is materialized in both caches.
    committed_len: usize,
    /// Newest accepted token; its KV is written by the next pass.
    pending_token: u32,
    stats: AcceptanceStats,
}

impl SpeculativeCoordinator {
    /// Build a coordinator and run the prompt pass on both models.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VocabMismatch`] when the models disagree on
    /// vocabulary size (fatal), [`Error::InvalidConfig`] for a bad config,
    /// and any runner failure from the prompt pass.
    pub fn new(
        target_runner: Box<dyn ModelRunner>,
        draft_runner: Box<dyn ModelRunner>,
        prompt: &[u32],
        config: SpeculativeConfig,
    ) -> Result<Self> {
        config.validate()?;
        if prompt.is_empty() {
            return Err(Error::InvalidConfig("empty prompt".to_string()));
        }
        if target_runner.vocab_size() != draft_runner.vocab_size() {
            return Err(Error::VocabMismatch {
                draft: draft_runner.vocab_size(),
                target: target_runner.vocab_size(),
            });
        }

        let mut target = ModelContext::new(target_runner, prompt, &config);
        let mut draft = ModelContext::new(draft_runner, prompt, &config);

        // Prompt pass on both models; the target's last-position logits
        // produce the first token.
        draft.forward(prompt, 0, AttentionPhase::Prompt)?;
        let target_logits = target.forward(prompt, 0, AttentionPhase::Prompt)?;
        let last_row = target_logits.dim(0)?.saturating_sub(1);
        let first_token = argmax_token(&target_logits.i(last_row)?)?;

        let committed_len = prompt.len();
        target.group.schedule_tokens(committed_len);
        target.group.finish_iteration();
        draft.group.schedule_tokens(committed_len);
        draft.group.finish_iteration();
        target.commit(&[first_token])?;
        draft.commit(&[first_token])?;

        let k = config.num_draft_tokens;
        Ok(Self {
            target,
            draft,
            config,
            committed_len,
            pending_token: first_token,
            stats: AcceptanceStats::new(k),
        })
    }

    /// Accepted prefix length with materialized KV.
    pub fn committed_len(&self) -> usize {
        self.committed_len
    }

    /// Target block-table length (test/monitoring hook).
    pub fn target_table_len(&self) -> usize {
        self.target.table_len()
    }

    /// Draft block-table length (test/monitoring hook).
    pub fn draft_table_len(&self) -> usize {
        self.draft.table_len()
    }

    /// Acceptance histogram so far.
    pub fn stats(&self) -> &AcceptanceStats {
        &self.stats
    }

    fn is_eos(&self, token: u32) -> bool {
        self.config.eos_token_id == Some(token)
    }

    fn done(&self, last_token: u32) -> bool {
        self.is_eos(last_token) || self.committed_len >= self.config.max_length
    }

    /// Run one outer iteration: K draft passes, one target validation pass,
    /// acceptance and rollback. Returns the accepted tokens (at least one).
    ///
    /// # Errors
    ///
    /// A runner failure aborts the iteration and surfaces as a generation
    /// failure; both caches still hold the previous accepted prefix.
    pub fn step(&mut self) -> Result<Vec<u32>> {
        let k = self.config.num_draft_tokens;
        let base = self.committed_len;

        // K autoregressive draft passes, one token each.
        let mut draft_tokens = Vec::with_capacity(k);
        let mut prev = self.pending_token;
        for i in 0..k {
            let logits = self
                .draft
                .forward(&[prev], base + i, AttentionPhase::Generate)?;
            let token = argmax_token(&logits.i(0)?)?;
            draft_tokens.push(token);
            prev = token;
        }

        // One target pass validates the window; the last draft token is
        // produced but never fed back, so the window ends at d_{K-2}.
        let mut window = Vec::with_capacity(k);
        window.push(self.pending_token);
        window.extend(&draft_tokens[..k - 1]);
        let target_logits = self
            .target
            .forward(&window, base, AttentionPhase::ValidateK)?;

        // Accept up to and including the first disagreement.
        let mut accepted = Vec::with_capacity(k);
        for i in 0..k {
            let token = argmax_token(&target_logits.i(i)?)?;
            accepted.push(token);
            if token != draft_tokens[i]
                || self.is_eos(token)
                || base + i + 1 >= self.config.max_length
            {
                break;
            }
        }

        self.pending_token = *accepted
            .last()
            .ok_or_else(|| Error::ModelRunner("validation produced no tokens".to_string()))?;

        // Both caches now hold K speculative entries; keep the accepted
        // ones and trim the rest.
        self.committed_len = base + accepted.len();
        self.target.trim_to(self.committed_len);
        self.draft.trim_to(self.committed_len);
        debug_assert_eq!(
            self.target.table_len(),
            blocks_needed(self.committed_len, self.config.block_size)
        );
        debug_assert_eq!(self.target.table_len(), self.draft.table_len());

        self.target.group.schedule_tokens(accepted.len());
        self.target.group.finish_iteration();
        self.draft.group.schedule_tokens(accepted.len());
        self.draft.group.finish_iteration();
        self.target.commit(&accepted)?;
        self.draft.commit(&accepted)?;

        self.stats.record(accepted.len());
        debug!(
            accepted = accepted.len(),
            committed = self.committed_len,
            "speculative iteration"
        );
        Ok(accepted)
    }

    /// Generate until EOS or the length cap, streaming accepted tokens.
    ///
    /// # Errors
    ///
    /// Propagates runner failures; tokens streamed before the failure
    /// remain delivered.
    pub fn generate_streamed(
        &mut self,
        mut on_token: impl FnMut(u32),
    ) -> Result<SpeculativeResult> {
        let mut token_ids = vec![self.pending_token];
        on_token(self.pending_token);
        while !self.done(self.pending_token) {
            let accepted = self.step()?;
            for &token in &accepted {
                on_token(token);
            }
            token_ids.extend(accepted);
        }
        info!(
            tokens = token_ids.len(),
            mean_accepted = self.stats.mean_accepted(),
            "speculative generation finished"
        );
        Ok(SpeculativeResult {
            token_ids,
            stats: self.stats.clone(),
        })
    }

    /// Generate until EOS or the length cap.
    ///
    /// # Errors
    ///
    /// Propagates runner failures.
    pub fn generate(&mut self) -> Result<SpeculativeResult> {
        self.generate_streamed(|_| {})
    }
}
