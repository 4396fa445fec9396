//! Pipeline orchestration and the capabilities it consumes.

pub mod pipeline;
pub mod runner;
pub mod sampler;

pub use pipeline::{
    GenerationChunk, GenerationHandle, GenerationResult, GenerationStatus, Pipeline,
    PipelineMetrics, RequestSender, SequenceOutput,
};
pub use runner::{AttentionPhase, ForwardBatch, LogitsBatch, ModelRunner};
pub use sampler::{SampledToken, Sampler, StandardSampler};
