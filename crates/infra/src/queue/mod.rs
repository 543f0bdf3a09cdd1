//! Durable, priority-ordered email queue, one per tenant.
//!
//! - `types`: entries, statuses, retry policy
//! - `store`: the `QueueStore` trait and an in-memory implementation
//! - `postgres`: the Postgres implementation over per-tenant databases

mod postgres;
mod store;
mod types;

pub use postgres::PostgresQueueStore;
pub use store::{InMemoryQueueStore, QueueStore, QueueStoreError};
pub use types::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_STALE_PROCESSING_AFTER, DeadLetterEntry,
    EmailPayload, EntryStatus, NewQueueEntry, QueueEntry, QueueStats, RetryPolicy, SourceType,
    priority,
};

pub(crate) use types::to_chrono;
