pub mod consumer;
pub mod producer;

// Re-export common types
pub use consumer::{ResultConsumer, RetryPolicy};
pub use producer::{Producer, TaskRequest};
