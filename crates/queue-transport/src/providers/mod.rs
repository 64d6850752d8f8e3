//! Queue service implementations.

pub mod memory;

pub use memory::{InMemoryQueueService, QueueOperation};
