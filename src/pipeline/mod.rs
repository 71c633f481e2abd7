//! Capture-to-persistence plumbing: queue, consumer, processing loop.

pub mod consumer;
pub mod queue;
pub mod scheduler;

pub use consumer::{CircuitBreaker, CircuitState, ConsumeError, ConsumerSnapshot, PacketConsumer};
pub use queue::{PacketQueue, QueueSnapshot};
pub use scheduler::{ProcessingLoop, WorkerPool};
