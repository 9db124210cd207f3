use thiserror::Error;

/// Errors detectable at scheduler construction time.
///
/// Runtime backpressure (no room to admit a waiting sequence, no free block
/// for a decode step) is handled by the scheduling policy itself, never
/// surfaced here — these variants are strictly startup misconfiguration.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler config is missing num_kvcache_blocks")]
    MissingBlockPoolSize,

    #[error(transparent)]
    Cache(#[from] cache::CacheError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
