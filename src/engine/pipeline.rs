//! The generation pipeline.
//!
//! The pipeline is the thin orchestrator over the core: it owns the list of
//! active sequence groups, drives `Scheduler -> ModelRunner -> Sampler` on
//! every [`step`](Pipeline::step), routes sampled tokens back into the
//! groups, and streams per-iteration output to request handles.
//!
//! Exactly one thread drives the step loop; the scheduler and allocator are
//! not shared. Request ingress is the only cross-thread seam: a
//! [`RequestSender`] can be cloned into any thread, and
//! [`add_request`](RequestSender::add_request) enqueues and returns without
//! ever blocking the loop. The queue is drained at the top of each step.
//! Dropped requests release their blocks at the next step boundary, never
//! mid-forward-pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use candle_core::IndexOp;
use tracing::{debug, warn};

use crate::config::{GenerationConfig, SchedulerConfig};
use crate::core::sequence::{FinishReason, RequestId, SequenceGroup, SequenceId};
use crate::engine::runner::{AttentionPhase, ForwardBatch, ModelRunner};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::scheduler::{Scheduler, SchedulerOutput};

/// Externally visible state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    /// Queued or generating.
    Running,
    /// All sequences finished normally.
    Finished,
    /// Never admitted: the prompt alone exceeds the KV pool.
    Ignored,
    /// Terminated by the pipeline (model runner failure).
    DroppedByPipeline,
    /// Terminated through the handle or `drop_request`.
    DroppedByHandle,
}

/// Output state of one sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    /// Sequence id within the request.
    pub seq_id: SequenceId,
    /// Generated token ids (this chunk's, or cumulative in a result).
    pub token_ids: Vec<u32>,
    /// Log-probabilities aligned with `token_ids`.
    pub logprobs: Vec<f32>,
    /// Set once the sequence finished.
    pub finish_reason: Option<FinishReason>,
}

/// Tokens appended to a request during one iteration.
#[derive(Debug, Clone)]
pub struct GenerationChunk {
    /// The request this chunk belongs to.
    pub request_id: RequestId,
    /// Per-sequence appended tokens.
    pub outputs: Vec<SequenceOutput>,
}

/// Final state of a completed request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// The request id.
    pub request_id: RequestId,
    /// Terminal status.
    pub status: GenerationStatus,
    /// Full per-sequence output (partial output is preserved for dropped
    /// requests).
    pub outputs: Vec<SequenceOutput>,
}

/// Pipeline counters for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineMetrics {
    /// Requests currently owned by the pipeline.
    pub requests: usize,
    /// Requests scheduled in the most recent step.
    pub scheduled_requests: usize,
    /// Fraction of KV blocks in use.
    pub cache_usage: f32,
}

struct RequestStream {
    chunks: Sender<GenerationChunk>,
    status: Arc<Mutex<GenerationStatus>>,
    dropped: Arc<AtomicBool>,
}

impl RequestStream {
    fn set_status(&self, status: GenerationStatus) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = status;
        }
    }
}

/// Streamed view of one request.
///
/// Chunks arrive per iteration; [`read_all`](Self::read_all) aggregates
/// everything received so far. Dropping the request through
/// [`cancel`](Self::cancel) takes effect at the next step boundary.
pub struct GenerationHandle {
    request_id: RequestId,
    chunks: Receiver<GenerationChunk>,
    status: Arc<Mutex<GenerationStatus>>,
    dropped: Arc<AtomicBool>,
}

impl GenerationHandle {
    /// The request id this handle observes.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Current request status.
    pub fn status(&self) -> GenerationStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(GenerationStatus::DroppedByPipeline)
    }

    /// Next available chunk, if any.
    pub fn try_read(&self) -> Option<GenerationChunk> {
        self.chunks.try_recv().ok()
    }

    /// Aggregate all chunks received so far into per-sequence outputs.
    pub fn read_all(&self) -> Vec<SequenceOutput> {
        let mut merged: Vec<SequenceOutput> = Vec::new();
        while let Some(chunk) = self.try_read() {
            for output in chunk.outputs {
                match merged.iter_mut().find(|m| m.seq_id == output.seq_id) {
                    Some(existing) => {
                        existing.token_ids.extend(output.token_ids);
                        existing.logprobs.extend(output.logprobs);
                        existing.finish_reason = output.finish_reason.or(existing.finish_reason);
                    }
                    None => merged.push(output),
                }
            }
        }
        merged.sort_by_key(|m| m.seq_id);
        merged
    }

    /// Request cancellation; the pipeline drops the request at the next
    /// step boundary and reports [`GenerationStatus::DroppedByHandle`].
    pub fn cancel(&self) {
        self.dropped.store(true, Ordering::Release);
    }
}

enum IngressMessage {
    Add(Box<AddRequest>),
    Drop(RequestId),
}

struct AddRequest {
    group: SequenceGroup,
    stream: RequestStream,
}

/// Cloneable, thread-safe request ingress.
#[derive(Clone)]
pub struct RequestSender {
    sender: Sender<IngressMessage>,
    next_request_id: Arc<AtomicU64>,
}

impl RequestSender {
    /// Enqueue a generation request. Never blocks the step loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid generation config or
    /// empty prompt, [`Error::PipelineClosed`] when the pipeline is gone.
    pub fn add_request(
        &self,
        prompt_ids: Vec<u32>,
        config: GenerationConfig,
    ) -> Result<GenerationHandle> {
        config.validate()?;
        if prompt_ids.is_empty() {
            return Err(Error::InvalidConfig("empty prompt".to_string()));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let group = SequenceGroup::new(request_id, prompt_ids, config);
        let (chunk_tx, chunk_rx) = channel();
        let status = Arc::new(Mutex::new(GenerationStatus::Running));
        let dropped = Arc::new(AtomicBool::new(false));
        let stream = RequestStream {
            chunks: chunk_tx,
            status: Arc::clone(&status),
            dropped: Arc::clone(&dropped),
        };
        self.sender
            .send(IngressMessage::Add(Box::new(AddRequest { group, stream })))
            .map_err(|_| Error::PipelineClosed)?;
        Ok(GenerationHandle {
            request_id,
            chunks: chunk_rx,
            status,
            dropped,
        })
    }

    /// Request cancellation of a queued or running request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineClosed`] when the pipeline is gone.
    pub fn drop_request(&self, request_id: RequestId) -> Result<()> {
        self.sender
            .send(IngressMessage::Drop(request_id))
            .map_err(|_| Error::PipelineClosed)
    }
}

/// Continuous-batching generation pipeline.
pub struct Pipeline {
    scheduler: Scheduler,
    runner: Box<dyn ModelRunner>,
    sampler: Box<dyn Sampler>,
    /// Active groups in admission order.
    groups: Vec<SequenceGroup>,
    streams: HashMap<RequestId, RequestStream>,
    ingress: Receiver<IngressMessage>,
    request_sender: RequestSender,
    last_scheduled: usize,
}

impl Pipeline {
    /// Create a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a degenerate scheduler
    /// configuration; construction-time errors halt the pipeline, unlike
    /// per-request failures.
    pub fn new(
        runner: Box<dyn ModelRunner>,
        sampler: Box<dyn Sampler>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config)?;
        let (sender, ingress) = channel();
        Ok(Self {
            scheduler,
            runner,
            sampler,
            groups: Vec::new(),
            streams: HashMap::new(),
            ingress,
            request_sender: RequestSender {
                sender,
                next_request_id: Arc::new(AtomicU64::new(0)),
            },
            last_scheduled: 0,
        })
    }

    /// A cloneable ingress endpoint for other threads.
    pub fn request_sender(&self) -> RequestSender {
        self.request_sender.clone()
    }

    /// Enqueue a request on the pipeline's own ingress.
    ///
    /// # Errors
    ///
    /// See [`RequestSender::add_request`].
    pub fn add_request(
        &self,
        prompt_ids: Vec<u32>,
        config: GenerationConfig,
    ) -> Result<GenerationHandle> {
        self.request_sender.add_request(prompt_ids, config)
    }

    /// Request cancellation; takes effect at the next step boundary.
    ///
    /// # Errors
    ///
    /// See [`RequestSender::drop_request`].
    pub fn drop_request(&self, request_id: RequestId) -> Result<()> {
        self.request_sender.drop_request(request_id)
    }

    /// Whether any request is queued or generating.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Monitoring snapshot.
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            requests: self.groups.len(),
            scheduled_requests: self.last_scheduled,
            cache_usage: self.scheduler.kv_cache_usage(),
        }
    }

    /// Run one step: drain ingress, schedule, forward, sample, commit.
    ///
    /// Returns the requests that reached a terminal state during the step.
    /// Per-request failures never halt the loop.
    ///
    /// # Errors
    ///
    /// Only internal invariant violations (batch assembly over corrupted
    /// state) surface here.
    pub fn step(&mut self) -> Result<Vec<GenerationResult>> {
        self.drain_ingress();
        self.apply_drops();

        let mut results = Vec::new();
        self.collect_finished(&mut results);

        let output = self.scheduler.schedule(&mut self.groups);
        self.last_scheduled = output.scheduled_group_ids.len();
        if output.is_empty() {
            self.collect_finished(&mut results);
            return Ok(results);
        }

        let batch = self.build_batch(&output)?;
        match self.runner.forward(&batch) {
            Ok(logits) => self.apply_logits(&output, &logits.logits)?,
            Err(err) => {
                warn!(error = %err, "forward pass failed, dropping scheduled requests");
                for &request_id in &output.scheduled_group_ids {
                    if let Some(group) = self.group_mut(request_id) {
                        group.finish_all(FinishReason::Dropped);
                    }
                    if let Some(stream) = self.streams.get(&request_id) {
                        stream.set_status(GenerationStatus::DroppedByPipeline);
                    }
                }
            }
        }

        self.collect_finished(&mut results);
        Ok(results)
    }

    /// Step until no request remains, collecting terminal results.
    ///
    /// # Errors
    ///
    /// Propagates [`step`](Self::step) errors.
    pub fn run_to_completion(&mut self) -> Result<Vec<GenerationResult>> {
        let mut results = Vec::new();
        loop {
            results.extend(self.step()?);
            if self.groups.is_empty() {
                return Ok(results);
            }
        }
    }

    fn group_mut(&mut self, request_id: RequestId) -> Option<&mut SequenceGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.request_id() == request_id)
    }

    fn drain_ingress(&mut self) {
        while let Ok(message) = self.ingress.try_recv() {
            match message {
                IngressMessage::Add(add) => {
                    let AddRequest { mut group, stream } = *add;
                    self.scheduler.restore_cached_blocks(&mut group);
                    debug!(
                        request = group.request_id(),
                        prompt_len = group.prompt_len(),
                        "request admitted to queue"
                    );
                    self.streams.insert(group.request_id(), stream);
                    self.groups.push(group);
                }
                IngressMessage::Drop(request_id) => {
                    if let Some(stream) = self.streams.get(&request_id) {
                        stream.dropped.store(true, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Apply handle-initiated drops at the step boundary.
    fn apply_drops(&mut self) {
        for group in self.groups.iter_mut().filter(|g| !g.has_finished()) {
            let Some(stream) = self.streams.get(&group.request_id()) else {
                continue;
            };
            if stream.dropped.load(Ordering::Acquire) {
                group.finish_all(FinishReason::Dropped);
                stream.set_status(GenerationStatus::DroppedByHandle);
            }
        }
    }

    /// Remove finished groups, release their blocks, and report them.
    fn collect_finished(&mut self, results: &mut Vec<GenerationResult>) {
        let mut i = 0;
        while i < self.groups.len() {
            if !self.groups[i].has_finished() {
                i += 1;
                continue;
            }
            let group = self.groups.remove(i);
            for seq in group.sequences() {
                self.scheduler.free_sequence(seq.seq_id());
            }
            let stream = self.streams.remove(&group.request_id());
            let status = match &stream {
                Some(stream) => {
                    let current = stream
                        .status
                        .lock()
                        .map(|s| *s)
                        .unwrap_or(GenerationStatus::Running);
                    if current == GenerationStatus::Running {
                        let status = terminal_status(&group);
                        stream.set_status(status);
                        status
                    } else {
                        current
                    }
                }
                None => terminal_status(&group),
            };
            let outputs = group
                .sequences()
                .iter()
                .map(|seq| SequenceOutput {
                    seq_id: seq.seq_id(),
                    token_ids: seq.generated_ids().to_vec(),
                    logprobs: seq.generated_logprobs().to_vec(),
                    finish_reason: seq.finish_reason(),
                })
                .collect();
            debug!(request = group.request_id(), ?status, "request finished");
            results.push(GenerationResult {
                request_id: group.request_id(),
                status,
                outputs,
            });
        }
    }

    /// Assemble the forward batch described by a scheduler output.
    ///
    /// Row order is the contract with [`apply_logits`]: scheduled groups in
    /// output order, running sequences in group order.
    fn build_batch(&self, output: &SchedulerOutput) -> Result<ForwardBatch> {
        let mut batch = ForwardBatch {
            input_ids: Vec::new(),
            position_ids: Vec::new(),
            slot_mapping: Vec::new(),
            seq_input_lens: Vec::new(),
            context_lens: Vec::new(),
            max_context_len: 0,
            block_tables: Vec::new(),
            phase: if output.is_prompt {
                AttentionPhase::Prompt
            } else {
                AttentionPhase::Generate
            },
            blocks_to_copy: output.blocks_to_copy.clone(),
        };
        for &request_id in &output.scheduled_group_ids {
            let group = self
                .groups
                .iter()
                .find(|g| g.request_id() == request_id)
                .ok_or(Error::RequestNotFound(request_id))?;
            let start = group.num_processed_tokens();
            let end = start + group.num_scheduled_tokens();
            for seq in group.running_sequences() {
                let seq_id = seq.seq_id();
                for pos in start..end {
                    batch.input_ids.push(group.token_at(seq_id, pos)?);
                    batch.position_ids.push(pos);
                }
                batch
                    .slot_mapping
                    .extend(self.scheduler.slot_mapping(seq_id, start, end));
                batch.seq_input_lens.push(end - start);
                batch.context_lens.push(end);
                batch.block_tables.push(
                    output
                        .block_tables
                        .get(&seq_id)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
        }
        batch.max_context_len = batch.context_lens.iter().copied().max().unwrap_or(0);
        Ok(batch)
    }

    /// Sample for every sequence whose context is fully materialized after
    /// this step, fork children on multi-return expansion, and commit the
    /// iteration.
    fn apply_logits(&mut self, output: &SchedulerOutput, logits: &candle_core::Tensor) -> Result<()> {
        let mut row = 0;
        for &request_id in &output.scheduled_group_ids {
            let Some(index) = self
                .groups
                .iter()
                .position(|g| g.request_id() == request_id)
            else {
                continue;
            };
            let group = &mut self.groups[index];
            let quantum = group.num_scheduled_tokens();
            let sample_ready = group.num_processed_tokens() + quantum >= group.context_len();
            let running: Vec<SequenceId> = group
                .running_sequences()
                .iter()
                .map(|s| s.seq_id())
                .collect();

            let mut appended: Vec<(SequenceId, u32, f32)> = Vec::new();
            for seq_id in running {
                let this_row = row;
                row += 1;
                if !sample_ready {
                    continue;
                }
                let row_logits = logits.i(this_row)?;
                let config = group.config().clone();
                let expand = config.num_return_sequences > 1
                    && group.sequences().len() == 1
                    && group.sequence(seq_id)?.generated_len() == 0
                    && !config.is_beam_search();
                let num_samples = if expand { config.num_return_sequences } else { 1 };
                let samples = self.sampler.sample(&row_logits, &config, num_samples)?;

                // Fork children before the parent's token lands so each
                // child starts from the shared history.
                let mut targets = vec![seq_id];
                for _ in 1..samples.len() {
                    let child = group.fork_sequence(seq_id)?;
                    self.scheduler.fork_sequence(seq_id, child);
                    targets.push(child);
                }
                for (target, sample) in targets.into_iter().zip(samples) {
                    group
                        .sequence_mut(target)?
                        .append_token(sample.token_id, sample.logprob);
                    appended.push((target, sample.token_id, sample.logprob));
                }
            }
            group.finish_iteration();

            if !appended.is_empty() {
                let chunk = GenerationChunk {
                    request_id,
                    outputs: appended
                        .into_iter()
                        .map(|(seq_id, token_id, logprob)| SequenceOutput {
                            seq_id,
                            token_ids: vec![token_id],
                            logprobs: vec![logprob],
                            finish_reason: group
                                .sequence(seq_id)
                                .ok()
                                .and_then(|s| s.finish_reason()),
                        })
                        .collect(),
                };
                if let Some(stream) = self.streams.get(&request_id) {
                    let _ = stream.chunks.send(chunk);
                }
            }
        }
        Ok(())
    }
}

fn terminal_status(group: &SequenceGroup) -> GenerationStatus {
    let reasons: Vec<_> = group
        .sequences()
        .iter()
        .filter_map(|s| s.finish_reason())
        .collect();
    if reasons.contains(&FinishReason::Ignored) {
        GenerationStatus::Ignored
    } else if reasons.contains(&FinishReason::Dropped) {
        GenerationStatus::DroppedByPipeline
    } else {
        GenerationStatus::Finished
    }
}
