//! Speculative decoding.
//!
//! A small draft model proposes K tokens per iteration; the target model
//! validates all K in one forward pass and keeps the longest agreeing
//! prefix (plus its own correction at the first disagreement). Both models'
//! paged KV caches are trimmed back to the accepted length each iteration.

pub mod config;
pub mod coordinator;

pub use config::SpeculativeConfig;
pub use coordinator::{AcceptanceStats, SpeculativeCoordinator, SpeculativeResult};
