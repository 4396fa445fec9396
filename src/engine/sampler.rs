//! Token sampling.
//!
//! The scheduler only cares about the sampler's interface: given a logits
//! row for a sequence, produce one or more `(token_id, logprob)` pairs.
//! More than one pair means the sequence expands into children (multinomial
//! multi-return, beam widening); the pipeline forks block tables
//! accordingly.
//!
//! [`StandardSampler`] is the bundled implementation:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + sample (or argmax when greedy)
//! ```

use candle_core::{D, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// One sampled token with its log-probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledToken {
    /// Chosen token id.
    pub token_id: u32,
    /// Log-probability of the chosen token under the sampling
    /// distribution.
    pub logprob: f32,
}

/// Sampling capability consumed by the pipeline.
pub trait Sampler {
    /// Sample `num_samples` tokens from a 1D logits row.
    ///
    /// Returning more than one token expands the sequence into children.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors from logits post-processing.
    fn sample(
        &mut self,
        logits: &Tensor,
        config: &GenerationConfig,
        num_samples: usize,
    ) -> Result<Vec<SampledToken>>;
}

/// Greedy and multinomial sampling with temperature, top-k and top-p.
#[derive(Debug)]
pub struct StandardSampler {
    rng: StdRng,
}

impl Default for StandardSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardSampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sampler with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self, logprobs: &[f32], config: &GenerationConfig) -> Result<SampledToken> {
        if !config.do_sample || config.temperature == 0.0 {
            return greedy_pick(logprobs);
        }

        // `logprobs` is already temperature-scaled log-softmax; filter on
        // the host like the reference sampler does.
        let mut indexed: Vec<(usize, f32)> = logprobs
            .iter()
            .enumerate()
            .map(|(i, &lp)| (i, lp))
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if config.top_k > 0 && config.top_k < indexed.len() {
            indexed.truncate(config.top_k);
        }

        if config.top_p > 0.0 && config.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = indexed.len();
            for (i, (_, lp)) in indexed.iter().enumerate() {
                cumulative += lp.exp();
                if cumulative > config.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            indexed.truncate(cutoff);
        }

        let weights: Vec<f64> = indexed.iter().map(|(_, lp)| f64::from(lp.exp())).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::ModelRunner(format!("degenerate sampling distribution: {e}")))?;
        let picked = indexed[dist.sample(&mut self.rng)];
        Ok(SampledToken {
            token_id: picked.0 as u32,
            logprob: picked.1,
        })
    }
}

impl Sampler for StandardSampler {
    fn sample(
        &mut self,
        logits: &Tensor,
        config: &GenerationConfig,
        num_samples: usize,
    ) -> Result<Vec<SampledToken>> {
        let scaled = if config.do_sample && config.temperature != 1.0 && config.temperature > 0.0 {
            (logits / f64::from(config.temperature))?
        } else {
            logits.clone()
        };
        let logprobs: Vec<f32> = candle_nn::ops::log_softmax(&scaled, D::Minus1)?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;

        let mut samples = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            samples.push(self.sample_one(&logprobs, config)?);
        }
        Ok(samples)
    }
}

/// Pick the highest-probability token from a log-softmax row.
fn greedy_pick(logprobs: &[f32]) -> Result<SampledToken> {
    let (token_id, logprob) = logprobs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| Error::ModelRunner("empty logits row".to_string()))?;
    Ok(SampledToken {
        token_id: token_id as u32,
        logprob: *logprob,
    })
}

/// Greedy argmax over a 1D logits row, without logprob bookkeeping.
///
/// Shared by the speculative coordinator, which compares draft and target
/// argmax tokens directly.
pub fn argmax_token(logits: &Tensor) -> Result<u32> {
    let logits = logits.to_dtype(candle_core::DType::F32)?;
    let values: Vec<f32> = logits.to_vec1()?;
    let (token_id, _) = values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| Error::ModelRunner("empty logits row".to_string()))?;
    Ok(token_id as u32)
}
