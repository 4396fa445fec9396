//! Error types for contbatch.

use thiserror::Error;

/// Result type alias for contbatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for contbatch.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Sequence not found in the scheduler or group.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),

    /// Request not found in the pipeline.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// The pipeline's ingress queue is gone (step loop shut down).
    #[error("pipeline is shut down")]
    PipelineClosed,

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Draft and target models disagree on vocabulary size.
    #[error("vocab size mismatch: draft has {draft}, target has {target}")]
    VocabMismatch { draft: usize, target: usize },

    /// Opaque failure reported by a model runner forward pass.
    #[error("model runner failure: {0}")]
    ModelRunner(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
