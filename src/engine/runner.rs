//! Model runner capability.
//!
//! The core never executes a model. It hands the runner a description of
//! the batch - token ids, positions, per-sequence block tables and the KV
//! slots each input token writes - and receives logits back. The runner
//! owns the KV storage layout; blocks are not assumed contiguous, so
//! gather/scatter across the block-table indirection is the runner's job.

use candle_core::Tensor;

use crate::error::Result;

/// How the runner should apply attention masking for a batch.
///
/// Three-valued on purpose: speculative validation feeds K tokens at once
/// into an existing context and needs them masked causally against each
/// other, which is neither a prompt pass nor a single-token generate pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionPhase {
    /// Full-prompt (or prompt-chunk) processing.
    Prompt,
    /// One new token per sequence against an existing context.
    Generate,
    /// K candidate tokens appended to an existing context, causally masked
    /// among themselves (speculative validation).
    ValidateK,
}

/// One forward pass over a scheduled batch.
///
/// Token-parallel fields (`input_ids`, `position_ids`, `slot_mapping`) are
/// flat across the batch; `seq_input_lens` says how many of those tokens
/// belong to each sequence, in order. Sequence-parallel fields
/// (`context_lens`, `block_tables`) have one entry per sequence.
#[derive(Debug, Clone)]
pub struct ForwardBatch {
    /// Input token ids, flat across all sequences.
    pub input_ids: Vec<u32>,
    /// Context position of each input token.
    pub position_ids: Vec<usize>,
    /// Absolute KV slot each input token writes
    /// (`block_index * block_size + offset`).
    pub slot_mapping: Vec<usize>,
    /// Number of input tokens per sequence.
    pub seq_input_lens: Vec<usize>,
    /// Context length of each sequence after this pass.
    pub context_lens: Vec<usize>,
    /// Largest entry of `context_lens`.
    pub max_context_len: usize,
    /// Physical block indices per sequence, in logical order.
    pub block_tables: Vec<Vec<usize>>,
    /// Attention masking mode for the whole batch.
    pub phase: AttentionPhase,
    /// `(src, dst)` block copies to perform before attention reads
    /// (copy-on-write resolution).
    pub blocks_to_copy: Vec<(usize, usize)>,
}

impl ForwardBatch {
    /// Total number of input tokens in the batch.
    pub fn num_tokens(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of sequences in the batch.
    pub fn num_sequences(&self) -> usize {
        self.seq_input_lens.len()
    }
}

/// Logits produced by a forward pass.
///
/// One row per sequence (the last input position of each), except under
/// [`AttentionPhase::ValidateK`] where the single sequence yields one row
/// per input token.
#[derive(Debug, Clone)]
pub struct LogitsBatch {
    /// Logits tensor of shape `[rows, vocab_size]`.
    pub logits: Tensor,
}

/// Synchronous model execution capability.
///
/// `forward` is the only blocking call in the step loop; it must complete
/// before the next scheduling decision.
pub trait ModelRunner {
    /// Run one forward pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelRunner`](crate::error::Error::ModelRunner) on
    /// execution failure; the pipeline drops the affected requests and
    /// keeps the step loop alive.
    fn forward(&mut self, batch: &ForwardBatch) -> Result<LogitsBatch>;

    /// Vocabulary size of the model's output head.
    fn vocab_size(&self) -> usize;
}
