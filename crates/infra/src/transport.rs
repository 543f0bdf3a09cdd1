//! Outbound delivery seam.

use async_trait::async_trait;

use crate::queue::QueueEntry;

/// A delivery attempt that did not go through. The reason is stored on the
/// entry as its `error_message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct SendFailure {
    pub reason: String,
}

impl SendFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Hands a rendered message to an external provider.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, entry: &QueueEntry) -> Result<(), SendFailure>;
}
