pub mod dlq;
pub mod retry;
pub mod sql;
pub mod writer;

pub use dlq::DeadLetterQueue;
pub use retry::RetryPolicy;
pub use writer::{StorageError, TimescaleWriter, WriterHealth};
