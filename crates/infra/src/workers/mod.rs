//! Background workers.

pub mod queue_worker;

pub use queue_worker::{QueueWorker, QueueWorkerHandle, WorkerConfig, WorkerError, WorkerStats};
