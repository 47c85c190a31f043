pub mod assert;
pub mod async_queue;
pub mod backoff;

pub use assert::{assertion_error, fail, hard_assert};
pub use async_queue::{box_queue_future, AsyncQueue, DelayedOperation, QueueFuture, TimerId};
pub use backoff::{BackoffConfig, ExponentialBackoff, RANDOM_FACTOR};
