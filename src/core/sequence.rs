//! Sequences and sequence groups.
//!
//! A [`SequenceGroup`] is the unit of request admission: one prompt plus one
//! or more sibling [`Sequence`]s (siblings appear through forking for beam
//! search or multi-return sampling). The group tracks how much of its
//! context has KV entries materialized (`num_processed_tokens`) and commits
//! each step's work through [`finish_iteration`](SequenceGroup::finish_iteration).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Unique identifier for a request (sequence group).
pub type RequestId = u64;

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(0);

fn next_sequence_id() -> SequenceId {
    NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Status of a sequence in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Waiting to be scheduled (new, or preempted back out of the batch).
    Waiting,
    /// Part of the running batch.
    Running,
    /// Generation complete.
    Finished,
}

impl SequenceStatus {
    /// Status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }
}

/// Reason a sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Generated-token limit reached.
    Length,
    /// A stop token sequence matched the generated tail.
    StopSequence,
    /// Dropped externally (handle drop or pipeline failure).
    Dropped,
    /// Never admitted: the prompt alone exceeds the KV pool.
    Ignored,
}

/// A single generation stream inside a [`SequenceGroup`].
///
/// The sequence owns its generated token history; the prompt lives on the
/// group. The back-reference to the group is its id, never an ownership
/// edge.
#[derive(Debug, Clone)]
pub struct Sequence {
    seq_id: SequenceId,
    request_id: RequestId,
    generated_ids: Vec<u32>,
    generated_logprobs: Vec<f32>,
    status: SequenceStatus,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    fn new(request_id: RequestId) -> Self {
        Self {
            seq_id: next_sequence_id(),
            request_id,
            generated_ids: Vec::new(),
            generated_logprobs: Vec::new(),
            status: SequenceStatus::Waiting,
            finish_reason: None,
        }
    }

    /// Globally unique sequence id.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Id of the owning request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Generated token ids.
    pub fn generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    /// Log-probabilities of the generated tokens.
    pub fn generated_logprobs(&self) -> &[f32] {
        &self.generated_logprobs
    }

    /// Number of generated tokens.
    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    /// Current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Why the sequence finished, if it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Whether the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    /// Append a generated token with its log-probability.
    pub fn append_token(&mut self, token_id: u32, logprob: f32) {
        self.generated_ids.push(token_id);
        self.generated_logprobs.push(logprob);
    }

    /// Most recently generated token.
    pub fn last_generated_id(&self) -> Option<u32> {
        self.generated_ids.last().copied()
    }

    /// Transition to running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when called on a finished
    /// sequence.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Waiting | SequenceStatus::Running => {
                self.status = SequenceStatus::Running;
                Ok(())
            }
            SequenceStatus::Finished => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition back to waiting (preemption).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] when called on a finished
    /// sequence.
    pub fn set_waiting(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Running | SequenceStatus::Waiting => {
                self.status = SequenceStatus::Waiting;
                Ok(())
            }
            SequenceStatus::Finished => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Waiting",
            }),
        }
    }

    /// Mark the sequence finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

/// A generation request: one prompt and its sibling sequences.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_ids: Vec<u32>,
    config: GenerationConfig,
    sequences: Vec<Sequence>,
    /// Tokens whose KV entries have been materialized.
    num_processed_tokens: usize,
    /// Tokens scheduled in the current (uncommitted) iteration.
    num_scheduled_tokens: usize,
}

impl SequenceGroup {
    /// Create a group with a single waiting sequence.
    pub fn new(request_id: RequestId, prompt_ids: Vec<u32>, config: GenerationConfig) -> Self {
        let sequences = vec![Sequence::new(request_id)];
        Self {
            request_id,
            prompt_ids,
            config,
            sequences,
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
        }
    }

    /// Request id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Prompt token ids.
    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    /// Prompt length in tokens.
    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    /// Generation parameters for this request.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// All sequences, finished or not.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Mutable access to a sequence by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown id.
    pub fn sequence_mut(&mut self, seq_id: SequenceId) -> Result<&mut Sequence> {
        self.sequences
            .iter_mut()
            .find(|s| s.seq_id() == seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    /// Sequence by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown id.
    pub fn sequence(&self, seq_id: SequenceId) -> Result<&Sequence> {
        self.sequences
            .iter()
            .find(|s| s.seq_id() == seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    /// Sequences currently in the running batch, ordered by sequence id.
    pub fn running_sequences(&self) -> Vec<&Sequence> {
        self.sequences
            .iter()
            .filter(|s| s.status() == SequenceStatus::Running)
            .collect()
    }

    /// Sequences that have not finished, ordered by sequence id.
    pub fn not_finished_sequences(&self) -> Vec<&Sequence> {
        self.sequences.iter().filter(|s| !s.is_finished()).collect()
    }

    /// Whether every sequence has finished.
    pub fn has_finished(&self) -> bool {
        self.sequences.iter().all(Sequence::is_finished)
    }

    /// Whether the group is waiting to be (re-)admitted.
    pub fn is_waiting(&self) -> bool {
        !self.has_finished()
            && self
                .sequences
                .iter()
                .filter(|s| !s.is_finished())
                .all(|s| s.status() == SequenceStatus::Waiting)
    }

    /// Whether the group is part of the running batch.
    pub fn is_running(&self) -> bool {
        self.sequences
            .iter()
            .any(|s| s.status() == SequenceStatus::Running)
    }

    /// Context length: prompt plus the longest generated history among
    /// non-finished sequences.
    pub fn context_len(&self) -> usize {
        let generated = self
            .sequences
            .iter()
            .filter(|s| !s.is_finished())
            .map(Sequence::generated_len)
            .max()
            .unwrap_or(0);
        self.prompt_len() + generated
    }

    /// Tokens whose KV entries have been materialized.
    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Tokens scheduled in the current iteration (not yet committed).
    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// Context tokens still lacking KV entries.
    pub fn num_tokens_to_process(&self) -> usize {
        self.context_len().saturating_sub(self.num_processed_tokens)
    }

    /// Whether the whole prompt has KV entries.
    pub fn is_prompt_processed(&self) -> bool {
        self.num_processed_tokens >= self.prompt_len()
    }

    /// Record `n` tokens as scheduled for this iteration.
    pub fn schedule_tokens(&mut self, n: usize) {
        self.num_scheduled_tokens += n;
    }

    /// Token id at a context position of a given sequence.
    ///
    /// Positions below the prompt length resolve in the shared prompt,
    /// above it in the sequence's generated history.
    pub fn token_at(&self, seq_id: SequenceId, pos: usize) -> Result<u32> {
        if pos < self.prompt_len() {
            return Ok(self.prompt_ids[pos]);
        }
        let seq = self.sequence(seq_id)?;
        seq.generated_ids()
            .get(pos - self.prompt_len())
            .copied()
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    /// Mark all non-finished sequences running.
    pub fn set_running(&mut self) {
        for seq in self.sequences.iter_mut().filter(|s| !s.is_finished()) {
            let _ = seq.set_running();
        }
    }

    /// Preempt the group: all non-finished sequences go back to waiting and
    /// the processed counter rolls back to `num_processed`. Token history is
    /// never rolled back; the lost tail is recomputed on re-admission.
    pub fn preempt(&mut self, num_processed: usize) {
        for seq in self.sequences.iter_mut().filter(|s| !s.is_finished()) {
            let _ = seq.set_waiting();
        }
        self.num_processed_tokens = num_processed;
        self.num_scheduled_tokens = 0;
    }

    /// Restore `n` processed tokens from the prefix cache (pre-admission).
    pub fn restore_processed_tokens(&mut self, n: usize) {
        self.num_processed_tokens = n;
    }

    /// Fork a sibling from `src`: the child shares the prompt and clones the
    /// generated history. Block-table sharing is handled by the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] for an unknown source id.
    pub fn fork_sequence(&mut self, src: SequenceId) -> Result<SequenceId> {
        let parent = self.sequence(src)?;
        let mut child = Sequence::new(self.request_id);
        child.generated_ids = parent.generated_ids.clone();
        child.generated_logprobs = parent.generated_logprobs.clone();
        child.status = parent.status;
        let child_id = child.seq_id;
        self.sequences.push(child);
        Ok(child_id)
    }

    /// Mark every sequence finished with the given reason.
    pub fn finish_all(&mut self, reason: FinishReason) {
        for seq in self.sequences.iter_mut().filter(|s| !s.is_finished()) {
            seq.set_finished(reason);
        }
    }

    /// Commit the current iteration.
    ///
    /// Advances the processed-token counter by the scheduled quantum and
    /// evaluates termination for every running sequence: EOS (unless
    /// ignored), the generated-length limit, and stop token sequences.
    pub fn finish_iteration(&mut self) {
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.num_scheduled_tokens = 0;

        let max_new_tokens = self.config.max_new_tokens_for(self.prompt_len());
        let eos = self.config.eos_token_id;
        let ignore_eos = self.config.ignore_eos;

        for seq in self
            .sequences
            .iter_mut()
            .filter(|s| s.status() == SequenceStatus::Running && s.generated_len() > 0)
        {
            if !ignore_eos && eos.is_some() && seq.last_generated_id() == eos {
                seq.set_finished(FinishReason::EndOfSequence);
            } else if seq.generated_len() >= max_new_tokens {
                seq.set_finished(FinishReason::Length);
            } else if self
                .config
                .stop_token_sequences
                .iter()
                .any(|stop| !stop.is_empty() && seq.generated_ids.ends_with(stop))
            {
                seq.set_finished(FinishReason::StopSequence);
            }
        }
    }
}
