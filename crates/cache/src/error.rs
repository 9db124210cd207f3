use thiserror::Error;

/// Errors a caller can actually hit when driving the block pool.
///
/// Day-to-day resource pressure (no free blocks right now) is not an error —
/// see `BlockManager::can_allocate`/`can_append` — these variants are for
/// misconfiguration and misuse that a caller can fix before calling again.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("block pool must have at least one block, got {0}")]
    EmptyPool(usize),

    #[error("block_size must be positive")]
    ZeroBlockSize,
}

pub type Result<T> = std::result::Result<T, CacheError>;
