//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for draft/target speculative decoding.
///
/// The draft model proposes `num_draft_tokens` (K) tokens per outer
/// iteration; the target model validates them in a single forward pass.
/// Higher K amortizes more target passes when the draft agrees often, but
/// wastes draft work when it does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Draft steps per outer iteration (K).
    pub num_draft_tokens: usize,
    /// Total sequence length cap (prompt + generated).
    pub max_length: usize,
    /// End-of-sequence token id, taken from the tokenizer.
    pub eos_token_id: Option<u32>,
    /// KV entries per block, shared by both models' pools.
    pub block_size: usize,
    /// KV blocks per model pool.
    pub num_kv_blocks: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_draft_tokens: 5,
            max_length: 128,
            eos_token_id: None,
            block_size: 16,
            num_kv_blocks: 256,
        }
    }
}

impl SpeculativeConfig {
    /// Set K.
    pub fn with_num_draft_tokens(mut self, k: usize) -> Self {
        self.num_draft_tokens = k;
        self
    }

    /// Set the sequence length cap.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the EOS token id.
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when K is zero or the geometry is
    /// degenerate.
    pub fn validate(&self) -> Result<()> {
        if self.num_draft_tokens == 0 {
            return Err(Error::InvalidConfig(
                "num_draft_tokens must be >= 1".to_string(),
            ));
        }
        if self.max_length == 0 {
            return Err(Error::InvalidConfig("max_length must be > 0".to_string()));
        }
        if self.block_size == 0 || self.num_kv_blocks == 0 {
            return Err(Error::InvalidConfig(
                "block_size and num_kv_blocks must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
