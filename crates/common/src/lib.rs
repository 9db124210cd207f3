/// Shared types for the candle-nano-vllm workspace
///
/// Holds the configuration, sampling parameters, and per-request `Sequence`
/// state shared by the cache and scheduler crates.
pub mod config;
pub mod sampling;
pub mod sequence;

pub use config::Config;
pub use sampling::SamplingParams;
pub use sequence::{Sequence, SequenceStatus};
