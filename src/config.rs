//! Configuration types for contbatch.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
///
/// Controls the KV cache geometry and the batching policy applied on every
/// scheduling step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// KV entries per block. Fixed for the lifetime of the run.
    pub block_size: usize,
    /// Total number of KV cache blocks in the pool.
    pub num_kv_blocks: usize,
    /// Maximum number of tokens batched per step.
    pub max_num_batched_tokens: usize,
    /// Maximum number of sequences scheduled per step.
    pub max_num_seqs: usize,
    /// Batching regime selector.
    ///
    /// `false` keeps prompt and generate phases in separate steps (vLLM
    /// style); `true` mixes prompt chunks and generate tokens in one batch
    /// and may split a long prompt across steps.
    pub dynamic_split_fuse: bool,
    /// Enable hash-keyed reuse of prompt blocks across requests.
    pub enable_prefix_caching: bool,
    /// Allow preemption to keep still-valid leading blocks instead of
    /// releasing the whole sequence.
    pub can_use_partial_preemption: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_kv_blocks: 1024,
            max_num_batched_tokens: 4096,
            max_num_seqs: 256,
            dynamic_split_fuse: false,
            enable_prefix_caching: false,
            can_use_partial_preemption: true,
        }
    }
}

impl SchedulerConfig {
    /// Total KV capacity of the pool in tokens.
    pub fn total_token_capacity(&self) -> usize {
        self.num_kv_blocks * self.block_size
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on zero-sized geometry or budgets.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be > 0".to_string()));
        }
        if self.num_kv_blocks == 0 {
            return Err(Error::InvalidConfig(
                "num_kv_blocks must be > 0".to_string(),
            ));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::InvalidConfig(
                "max_num_batched_tokens must be > 0".to_string(),
            ));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::InvalidConfig("max_num_seqs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Per-request generation parameters.
///
/// Mirrors the usual HF-style generation config surface, restricted to what
/// the core consumes: termination conditions and the sampling knobs passed
/// through to the [`Sampler`](crate::engine::sampler::Sampler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// Maximum total length (prompt + generated). `0` means unbounded;
    /// `max_new_tokens` has priority when both are set.
    pub max_length: usize,
    /// Ignore the EOS token and keep generating until a length limit.
    pub ignore_eos: bool,
    /// End-of-sequence token id. Comes from the tokenizer.
    pub eos_token_id: Option<u32>,
    /// Enable multinomial sampling. When `false` decoding is greedy.
    pub do_sample: bool,
    /// Temperature for sampling.
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Number of sequences to return per request.
    pub num_return_sequences: usize,
    /// Number of beams (1 = no beam search).
    pub num_beams: usize,
    /// Number of beam groups for diverse beam search.
    pub num_beam_groups: usize,
    /// Token-id sequences that terminate generation when matched against
    /// the tail of the generated ids. Callers encode stop strings with
    /// their tokenizer before submitting.
    pub stop_token_sequences: Vec<Vec<u32>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            max_length: 0,
            ignore_eos: false,
            eos_token_id: None,
            do_sample: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            num_return_sequences: 1,
            num_beams: 1,
            num_beam_groups: 1,
            stop_token_sequences: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding preset.
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            temperature: 0.0,
            max_new_tokens: 30,
            ignore_eos: true,
            ..Default::default()
        }
    }

    /// Multinomial sampling preset.
    pub fn multinomial() -> Self {
        Self {
            do_sample: true,
            temperature: 0.9,
            top_p: 0.9,
            top_k: 20,
            num_return_sequences: 3,
            max_new_tokens: 30,
            ..Default::default()
        }
    }

    /// Beam search preset.
    pub fn beam_search() -> Self {
        Self {
            num_beams: 4,
            num_beam_groups: 2,
            num_return_sequences: 3,
            max_new_tokens: 100,
            ..Default::default()
        }
    }

    /// Set the maximum number of new tokens.
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the EOS token id.
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self.ignore_eos = false;
        self
    }

    /// Effective cap on generated tokens for a given prompt length.
    ///
    /// `max_new_tokens` takes priority; a zero value defers to
    /// `max_length`.
    pub fn max_new_tokens_for(&self, prompt_len: usize) -> usize {
        let by_total = if self.max_length > 0 {
            self.max_length.saturating_sub(prompt_len)
        } else {
            usize::MAX
        };
        let by_new = if self.max_new_tokens > 0 {
            self.max_new_tokens
        } else {
            usize::MAX
        };
        by_new.min(by_total)
    }

    /// Whether beam search is requested.
    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when termination or sampling
    /// parameters are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 && self.max_length == 0 {
            return Err(Error::InvalidConfig(
                "either max_new_tokens or max_length must be set".to_string(),
            ));
        }
        if self.num_return_sequences == 0 {
            return Err(Error::InvalidConfig(
                "num_return_sequences must be > 0".to_string(),
            ));
        }
        if self.do_sample && self.is_beam_search() {
            return Err(Error::InvalidConfig(
                "beam search with sampling is not supported; set do_sample=false or num_beams=1"
                    .to_string(),
            ));
        }
        if self.num_beam_groups == 0 || self.num_beams % self.num_beam_groups != 0 {
            return Err(Error::InvalidConfig(
                "num_beams must be divisible by num_beam_groups".to_string(),
            ));
        }
        if self.do_sample && self.temperature <= 0.0 {
            return Err(Error::InvalidConfig(
                "temperature must be strictly positive when sampling".to_string(),
            ));
        }
        if self.do_sample && !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidConfig(
                "top_p must be in (0, 1] when sampling".to_string(),
            ));
        }
        if self.ignore_eos && self.max_new_tokens == 0 && self.max_length == 0 {
            return Err(Error::InvalidConfig(
                "ignore_eos requires max_new_tokens or max_length".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scheduler_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_blocks_rejected() {
        let config = SchedulerConfig {
            num_kv_blocks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn beam_group_divisibility() {
        let config = GenerationConfig {
            num_beams: 4,
            num_beam_groups: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GenerationConfig {
            num_beams: 4,
            num_beam_groups: 2,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn max_new_tokens_zero_rejected() {
        let config = GenerationConfig {
            max_new_tokens: 0,
            max_length: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_length_caps_generation() {
        let config = GenerationConfig {
            max_new_tokens: 100,
            max_length: 16,
            ..Default::default()
        };
        assert_eq!(config.max_new_tokens_for(10), 6);
        assert_eq!(config.max_new_tokens_for(20), 0);
    }
}
