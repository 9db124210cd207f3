/// Request scheduler: admission, prefill/decode batching, and preemption.
///
/// `Scheduler` is the engine driver's single entry point into the memory
/// management core: it owns a `BlockManager` and drives it according to
/// the admission and preemption policy described in `scheduler::Scheduler`.
pub mod error;
pub mod scheduler;

pub use error::{Result, SchedulerError};
pub use scheduler::Scheduler;
