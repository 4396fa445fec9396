//! contbatch: a continuous-batching inference runtime core.
//!
//! The crate implements the scheduling and memory-management half of an LLM
//! serving engine, leaving model execution behind a trait:
//! - Paged KV cache management with reference counting, copy-on-write
//!   forking, and prefix-hash block reuse
//! - Continuous batching with prompt/generate separation or dynamic
//!   split-fuse, including preemption under memory pressure
//! - Speculative decoding coordination between a draft and a target model

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;

pub use config::{GenerationConfig, SchedulerConfig};
pub use engine::{GenerationHandle, GenerationStatus, Pipeline, StandardSampler};
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerOutput};
pub use speculative::{SpeculativeConfig, SpeculativeCoordinator};
