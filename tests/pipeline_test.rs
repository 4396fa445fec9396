//! End-to-end pipeline tests with a scripted model runner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use contbatch::config::{GenerationConfig, SchedulerConfig};
use contbatch::engine::pipeline::{GenerationStatus, Pipeline};
use contbatch::engine::runner::{AttentionPhase, ForwardBatch, LogitsBatch, ModelRunner};
use contbatch::engine::sampler::StandardSampler;
use contbatch::error::{Error, Result};

const VOCAB: usize = 64;

/// Deterministic runner: the next token is a function of the sequence's
/// last input token and its position, so any lost or reordered context
/// changes the output.
struct StepRunner {
    forwards: Arc<AtomicUsize>,
    fail_at: Option<usize>,
}

impl StepRunner {
    fn new() -> Self {
        Self {
            forwards: Arc::new(AtomicUsize::new(0)),
            fail_at: None,
        }
    }

    fn failing_at(call: usize) -> Self {
        Self {
            forwards: Arc::new(AtomicUsize::new(0)),
            fail_at: Some(call),
        }
    }

    fn next_token(last: u32, pos: usize) -> u32 {
        (last.wrapping_mul(3).wrapping_add(pos as u32 * 7).wrapping_add(1)) % VOCAB as u32
    }
}

impl ModelRunner for StepRunner {
    fn forward(&mut self, batch: &ForwardBatch) -> Result<LogitsBatch> {
        let call = self.forwards.fetch_add(1, Ordering::Relaxed);
        if self.fail_at == Some(call) {
            return Err(Error::ModelRunner("injected failure".to_string()));
        }
        assert_ne!(batch.phase, AttentionPhase::ValidateK);
        assert_eq!(batch.input_ids.len(), batch.slot_mapping.len());

        let mut rows = Vec::new();
        let mut offset = 0;
        for &len in &batch.seq_input_lens {
            let last = batch.input_ids[offset + len - 1];
            let pos = batch.position_ids[offset + len - 1];
            let mut row = vec![0f32; VOCAB];
            row[Self::next_token(last, pos) as usize] = 50.0;
            rows.extend(row);
            offset += len;
        }
        let logits = Tensor::from_vec(
            rows,
            (batch.seq_input_lens.len(), VOCAB),
            &Device::Cpu,
        )?;
        Ok(LogitsBatch { logits })
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }
}

fn pipeline_config() -> SchedulerConfig {
    SchedulerConfig {
        block_size: 4,
        num_kv_blocks: 64,
        max_num_batched_tokens: 256,
        max_num_seqs: 16,
        dynamic_split_fuse: false,
        enable_prefix_caching: false,
        can_use_partial_preemption: true,
    }
}

fn make_pipeline(config: SchedulerConfig) -> Pipeline {
    Pipeline::new(
        Box::new(StepRunner::new()),
        Box::new(StandardSampler::with_seed(7)),
        config,
    )
    .unwrap()
}

fn greedy(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        ignore_eos: true,
        ..GenerationConfig::greedy()
    }
}

/// Reference decode for the scripted runner.
fn expected_tokens(prompt: &[u32], count: usize) -> Vec<u32> {
    let mut out = Vec::new();
    let mut last = *prompt.last().unwrap();
    let mut pos = prompt.len() - 1;
    for _ in 0..count {
        let next = StepRunner::next_token(last, pos);
        out.push(next);
        last = next;
        pos += 1;
    }
    out
}

#[test]
fn test_single_request_greedy() {
    let mut pipeline = make_pipeline(pipeline_config());
    let handle = pipeline.add_request(vec![1, 2, 3], greedy(4)).unwrap();

    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::Finished);
    assert_eq!(results[0].outputs[0].token_ids, expected_tokens(&[1, 2, 3], 4));

    assert_eq!(handle.status(), GenerationStatus::Finished);
    let streamed = handle.read_all();
    assert_eq!(streamed[0].token_ids, expected_tokens(&[1, 2, 3], 4));
    assert_eq!(streamed[0].logprobs.len(), 4);

    // All blocks returned once the request is gone.
    assert_eq!(pipeline.metrics().cache_usage, 0.0);
    assert!(!pipeline.has_unfinished_requests());
}

#[test]
fn test_eos_terminates_generation() {
    let mut pipeline = make_pipeline(pipeline_config());
    let prompt = vec![1, 2, 3];
    let reference = expected_tokens(&prompt, 10);
    let eos = reference[2];

    let config = GenerationConfig {
        max_new_tokens: 10,
        ignore_eos: false,
        eos_token_id: Some(eos),
        ..GenerationConfig::greedy()
    };
    let _handle = pipeline.add_request(prompt, config).unwrap();
    let results = pipeline.run_to_completion().unwrap();

    assert_eq!(results[0].status, GenerationStatus::Finished);
    assert_eq!(results[0].outputs[0].token_ids, reference[..3]);
    assert_eq!(
        results[0].outputs[0].finish_reason,
        Some(contbatch::core::FinishReason::EndOfSequence)
    );
}

#[test]
fn test_continuous_batching_multiple_requests() {
    for dynamic_split_fuse in [false, true] {
        let config = SchedulerConfig {
            dynamic_split_fuse,
            ..pipeline_config()
        };
        let mut pipeline = make_pipeline(config);
        let prompts: Vec<Vec<u32>> = vec![vec![10], vec![20, 21], vec![5, 6, 7, 8, 9]];
        for prompt in &prompts {
            pipeline.add_request(prompt.clone(), greedy(6)).unwrap();
        }

        let mut results = pipeline.run_to_completion().unwrap();
        results.sort_by_key(|r| r.request_id);
        assert_eq!(results.len(), 3);
        for (result, prompt) in results.iter().zip(&prompts) {
            assert_eq!(result.status, GenerationStatus::Finished);
            assert_eq!(result.outputs[0].token_ids, expected_tokens(prompt, 6));
        }
    }
}

#[test]
fn test_preemption_roundtrip_matches_uninterrupted_run() {
    // A pool of four blocks forces preemption and re-admission; the final
    // outputs must match a run with ample memory.
    for can_use_partial_preemption in [false, true] {
        for dynamic_split_fuse in [false, true] {
            let tight = SchedulerConfig {
                num_kv_blocks: 4,
                dynamic_split_fuse,
                can_use_partial_preemption,
                ..pipeline_config()
            };
            let prompts: Vec<Vec<u32>> = vec![(0..6).collect(), (30..36).collect()];

            let mut reference = Vec::new();
            for prompt in &prompts {
                reference.push(expected_tokens(prompt, 8));
            }

            let mut pipeline = make_pipeline(tight);
            for prompt in &prompts {
                pipeline.add_request(prompt.clone(), greedy(8)).unwrap();
            }
            let mut results = pipeline.run_to_completion().unwrap();
            results.sort_by_key(|r| r.request_id);

            for (result, expected) in results.iter().zip(&reference) {
                assert_eq!(result.status, GenerationStatus::Finished);
                assert_eq!(&result.outputs[0].token_ids, expected);
            }
        }
    }
}

#[test]
fn test_drop_request_releases_blocks() {
    let mut pipeline = make_pipeline(pipeline_config());
    let handle = pipeline.add_request(vec![1, 2, 3], greedy(100)).unwrap();

    pipeline.step().unwrap();
    pipeline.step().unwrap();
    assert!(pipeline.metrics().cache_usage > 0.0);

    pipeline.drop_request(handle.request_id()).unwrap();
    let results = pipeline.step().unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::DroppedByHandle);
    // Whatever was generated before the drop is preserved.
    assert!(!results[0].outputs[0].token_ids.is_empty());
    assert_eq!(handle.status(), GenerationStatus::DroppedByHandle);
    assert_eq!(pipeline.metrics().cache_usage, 0.0);
}

#[test]
fn test_handle_cancel() {
    let mut pipeline = make_pipeline(pipeline_config());
    let handle = pipeline.add_request(vec![4, 5], greedy(100)).unwrap();

    pipeline.step().unwrap();
    handle.cancel();
    pipeline.step().unwrap();

    assert_eq!(handle.status(), GenerationStatus::DroppedByHandle);
    assert!(!pipeline.has_unfinished_requests());
}

#[test]
fn test_runner_failure_drops_request_with_partial_output() {
    // The second forward pass fails: the prompt step succeeds, one token is
    // out, then the request dies without killing the loop.
    let mut pipeline = Pipeline::new(
        Box::new(StepRunner::failing_at(1)),
        Box::new(StandardSampler::with_seed(7)),
        pipeline_config(),
    )
    .unwrap();
    let handle = pipeline.add_request(vec![1, 2, 3], greedy(10)).unwrap();

    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::DroppedByPipeline);
    assert_eq!(results[0].outputs[0].token_ids.len(), 1);
    assert_eq!(handle.status(), GenerationStatus::DroppedByPipeline);

    // The pipeline still serves new requests afterwards.
    let _ = pipeline.add_request(vec![9, 9], greedy(2)).unwrap();
    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results[0].status, GenerationStatus::Finished);
}

#[test]
fn test_cross_thread_ingress() {
    let mut pipeline = make_pipeline(pipeline_config());
    let sender = pipeline.request_sender();

    let worker = std::thread::spawn(move || {
        sender
            .add_request(vec![11, 12, 13], greedy(3))
            .unwrap()
            .request_id()
    });
    let request_id = worker.join().unwrap();

    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].request_id, request_id);
    assert_eq!(results[0].status, GenerationStatus::Finished);
}

#[test]
fn test_multinomial_multi_return_forks_sequences() {
    // One-hot logits make multinomial sampling effectively deterministic;
    // the interesting part is the fork bookkeeping.
    let config = GenerationConfig {
        do_sample: true,
        temperature: 1.0,
        top_k: 0,
        top_p: 1.0,
        num_return_sequences: 3,
        max_new_tokens: 3,
        ignore_eos: true,
        ..Default::default()
    };
    let mut pipeline = make_pipeline(pipeline_config());
    let _handle = pipeline.add_request(vec![1, 2, 3, 4, 5], config).unwrap();

    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, GenerationStatus::Finished);
    assert_eq!(results[0].outputs.len(), 3);
    for output in &results[0].outputs {
        assert_eq!(output.token_ids.len(), 3);
        assert_eq!(
            output.finish_reason,
            Some(contbatch::core::FinishReason::Length)
        );
    }
    assert_eq!(pipeline.metrics().cache_usage, 0.0);
}

#[test]
fn test_prefix_cached_rerun_matches() {
    let config = SchedulerConfig {
        enable_prefix_caching: true,
        ..pipeline_config()
    };
    let mut pipeline = make_pipeline(config);
    let prompt: Vec<u32> = (0..10).collect();

    let _first = pipeline.add_request(prompt.clone(), greedy(5)).unwrap();
    let first = pipeline.run_to_completion().unwrap();

    // The rerun restores most of the prompt from cache and must produce the
    // same continuation.
    let _second = pipeline.add_request(prompt.clone(), greedy(5)).unwrap();
    let second = pipeline.run_to_completion().unwrap();

    assert_eq!(
        first[0].outputs[0].token_ids,
        second[0].outputs[0].token_ids
    );
}

#[test]
fn test_invalid_requests_rejected() {
    let pipeline = make_pipeline(pipeline_config());

    let zero_budget = GenerationConfig {
        max_new_tokens: 0,
        max_length: 0,
        ..Default::default()
    };
    assert!(matches!(
        pipeline.add_request(vec![1], zero_budget),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        pipeline.add_request(vec![], greedy(4)),
        Err(Error::InvalidConfig(_))
    ));

    let bad_beams = GenerationConfig {
        num_beams: 4,
        num_beam_groups: 3,
        ..Default::default()
    };
    assert!(matches!(
        pipeline.add_request(vec![1], bad_beams),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_oversized_prompt_reported_ignored() {
    let config = SchedulerConfig {
        num_kv_blocks: 2,
        ..pipeline_config()
    };
    let mut pipeline = make_pipeline(config);
    let handle = pipeline
        .add_request((0..20).collect(), greedy(4))
        .unwrap();

    let results = pipeline.run_to_completion().unwrap();
    assert_eq!(results[0].status, GenerationStatus::Ignored);
    assert!(results[0].outputs[0].token_ids.is_empty());
    assert_eq!(handle.status(), GenerationStatus::Ignored);
}
