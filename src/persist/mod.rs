//! Durable persistence: storage formats, backends and the flush scheduler.
//!
//! A store either lives purely in memory or is bound to a [`StorageBackend`]
//! and a [`StorageFormat`]. Mutations mark the store dirty; the scheduler
//! writes the latest snapshot either before the mutation returns (zero flush
//! delay) or once writes have been quiet for the configured delay.

mod backend;
mod format;
pub(crate) mod scheduler;

pub use backend::{FileBackend, StorageBackend};
pub use format::StorageFormat;
pub use scheduler::PersistenceStatus;
