//! Queue store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{DomainError, EntryId, TenantId};

use super::types::{
    DEFAULT_STALE_PROCESSING_AFTER, DeadLetterEntry, EntryStatus, NewQueueEntry, QueueEntry,
    QueueStats, SourceType,
};
use crate::pool::PoolError;

/// Durable, tenant-scoped email queue.
///
/// Every operation is scoped by `tenant_id`; entries of one tenant are never
/// visible through another.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a batch atomically. Any invalid entry fails the whole batch.
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        entries: Vec<NewQueueEntry>,
    ) -> Result<Vec<EntryId>, QueueStoreError>;

    /// Up to `limit` eligible entries, by priority then creation time.
    async fn fetch_pending(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, QueueStoreError>;

    /// Claim an entry. Returns `false` when another worker holds a fresh claim
    /// or the entry no longer exists.
    async fn mark_as_processing(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<bool, QueueStoreError>;

    /// Delivered: remove the entry. Idempotent.
    async fn mark_as_sent(&self, tenant_id: TenantId, entry_id: EntryId)
    -> Result<(), QueueStoreError>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_as_failed(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    /// Defer without counting an attempt.
    async fn set_next_retry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError>;

    async fn get(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<QueueEntry>, QueueStoreError>;

    async fn get_by_source_id(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueStoreError>;

    async fn count_by_source_and_status(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueStoreError>;

    /// Remove an entry regardless of status. Idempotent.
    async fn delete(&self, tenant_id: TenantId, entry_id: EntryId) -> Result<(), QueueStoreError>;

    /// Count the final failed attempt and move the entry out of the live queue.
    async fn move_to_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<(), QueueStoreError>;

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueStoreError>;

    /// Put a dead-lettered entry back in the queue with a fresh attempt budget.
    async fn retry_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<QueueEntry, QueueStoreError>;

    async fn delete_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<(), QueueStoreError>;
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue entry not found: {0}")]
    NotFound(EntryId),
    #[error("invalid queue entry: {0}")]
    Validation(#[from] DomainError),
    #[error("entry for tenant {found} submitted to tenant {expected}")]
    TenantIsolation { expected: TenantId, found: TenantId },
    #[error("workspace connection unavailable: {0}")]
    Connection(#[from] PoolError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Reject a batch if any entry is invalid or belongs to another tenant.
pub(crate) fn validate_batch(
    tenant_id: TenantId,
    entries: &[NewQueueEntry],
) -> Result<(), QueueStoreError> {
    for entry in entries {
        if entry.tenant_id != tenant_id {
            return Err(QueueStoreError::TenantIsolation {
                expected: tenant_id,
                found: entry.tenant_id,
            });
        }
        entry.validate(tenant_id)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct TenantQueue {
    entries: HashMap<EntryId, QueueEntry>,
    dead_letters: HashMap<EntryId, DeadLetterEntry>,
}

/// In-memory queue store for tests/dev.
///
/// A single lock guards all tenants, which makes every state transition
/// (including the processing claim) atomic.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    tenants: RwLock<HashMap<TenantId, TenantQueue>>,
    stale_after: Duration,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_PROCESSING_AFTER)
    }

    /// Override how long a `processing` claim stays exclusive.
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TenantId, TenantQueue>> {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TenantId, TenantQueue>> {
        self.tenants.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shift an entry's `updated_at` into the past (simulates a crashed worker).
    #[cfg(test)]
    pub(crate) fn backdate(&self, tenant_id: TenantId, entry_id: EntryId, by: Duration) {
        if let Some(entry) = self
            .write()
            .get_mut(&tenant_id)
            .and_then(|q| q.entries.get_mut(&entry_id))
        {
            entry.updated_at -= super::types::to_chrono(by);
        }
    }

    /// Make a scheduled entry eligible immediately (skips backoff in tests).
    #[cfg(test)]
    pub(crate) fn clear_retry(&self, tenant_id: TenantId, entry_id: EntryId) {
        if let Some(entry) = self
            .write()
            .get_mut(&tenant_id)
            .and_then(|q| q.entries.get_mut(&entry_id))
        {
            entry.next_retry_at = None;
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        entries: Vec<NewQueueEntry>,
    ) -> Result<Vec<EntryId>, QueueStoreError> {
        validate_batch(tenant_id, &entries)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tenants = self.write();
        let queue = tenants.entry(tenant_id).or_default();

        let mut ids = Vec::with_capacity(entries.len());
        for new in entries {
            let entry = new.into_entry(now);
            ids.push(entry.id);
            queue.entries.insert(entry.id, entry);
        }
        Ok(ids)
    }

    async fn fetch_pending(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let now = Utc::now();
        let tenants = self.read();
        let Some(queue) = tenants.get(&tenant_id) else {
            return Ok(Vec::new());
        };

        let mut visible: Vec<_> = queue
            .entries
            .values()
            .filter(|e| e.is_visible(now, self.stale_after))
            .cloned()
            .collect();

        visible.sort_by(|a, b| {
            (a.priority, a.created_at, a.id).cmp(&(b.priority, b.created_at, b.id))
        });
        visible.truncate(limit);
        Ok(visible)
    }

    async fn mark_as_processing(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<bool, QueueStoreError> {
        let now = Utc::now();
        let mut tenants = self.write();
        let Some(entry) = tenants
            .get_mut(&tenant_id)
            .and_then(|q| q.entries.get_mut(&entry_id))
        else {
            return Ok(false);
        };

        // Only what fetch_pending would return right now
        if !entry.is_visible(now, self.stale_after) {
            return Ok(false);
        }

        entry.status = EntryStatus::Processing;
        entry.updated_at = now;
        Ok(true)
    }

    async fn mark_as_sent(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<(), QueueStoreError> {
        self.delete(tenant_id, entry_id).await
    }

    async fn mark_as_failed(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut tenants = self.write();
        let entry = tenants
            .get_mut(&tenant_id)
            .and_then(|q| q.entries.get_mut(&entry_id))
            .ok_or(QueueStoreError::NotFound(entry_id))?;

        entry.status = EntryStatus::Failed;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.error_message = Some(reason.to_string());
        entry.next_retry_at = Some(next_retry_at);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_next_retry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut tenants = self.write();
        let entry = tenants
            .get_mut(&tenant_id)
            .and_then(|q| q.entries.get_mut(&entry_id))
            .ok_or(QueueStoreError::NotFound(entry_id))?;

        entry.status = EntryStatus::Pending;
        entry.next_retry_at = Some(at);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        let tenants = self.read();
        let mut stats = QueueStats::default();

        for entry in tenants.get(&tenant_id).into_iter().flat_map(|q| q.entries.values()) {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Processing => stats.processing += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<QueueEntry>, QueueStoreError> {
        Ok(self
            .read()
            .get(&tenant_id)
            .and_then(|q| q.entries.get(&entry_id))
            .cloned())
    }

    async fn get_by_source_id(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let tenants = self.read();
        let mut result: Vec<_> = tenants
            .get(&tenant_id)
            .into_iter()
            .flat_map(|q| q.entries.values())
            .filter(|e| e.source_type == source_type && e.source_id == source_id)
            .cloned()
            .collect();

        result.sort_by_key(|e| (e.created_at, e.id));
        Ok(result)
    }

    async fn count_by_source_and_status(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueStoreError> {
        let tenants = self.read();
        let count = tenants
            .get(&tenant_id)
            .into_iter()
            .flat_map(|q| q.entries.values())
            .filter(|e| {
                e.source_type == source_type && e.source_id == source_id && e.status == status
            })
            .count();
        Ok(count as u64)
    }

    async fn delete(&self, tenant_id: TenantId, entry_id: EntryId) -> Result<(), QueueStoreError> {
        if let Some(queue) = self.write().get_mut(&tenant_id) {
            queue.entries.remove(&entry_id);
        }
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<(), QueueStoreError> {
        let now = Utc::now();
        let mut tenants = self.write();
        let queue = tenants
            .get_mut(&tenant_id)
            .ok_or(QueueStoreError::NotFound(entry_id))?;
        let mut entry = queue
            .entries
            .remove(&entry_id)
            .ok_or(QueueStoreError::NotFound(entry_id))?;

        entry.status = EntryStatus::Failed;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.error_message = Some(reason.to_string());
        entry.next_retry_at = None;
        entry.updated_at = now;

        queue.dead_letters.insert(
            entry_id,
            DeadLetterEntry {
                entry,
                reason: reason.to_string(),
                dead_lettered_at: now,
            },
        );
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        let tenants = self.read();
        let mut result: Vec<_> = tenants
            .get(&tenant_id)
            .into_iter()
            .flat_map(|q| q.dead_letters.values())
            .cloned()
            .collect();

        result.sort_by_key(|d| (d.dead_lettered_at, d.entry.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<QueueEntry, QueueStoreError> {
        let mut tenants = self.write();
        let queue = tenants
            .get_mut(&tenant_id)
            .ok_or(QueueStoreError::NotFound(entry_id))?;
        let dead = queue
            .dead_letters
            .remove(&entry_id)
            .ok_or(QueueStoreError::NotFound(entry_id))?;

        let mut entry = dead.entry;
        entry.status = EntryStatus::Pending;
        entry.attempts = 0;
        entry.error_message = None;
        entry.next_retry_at = None;
        entry.updated_at = Utc::now();

        queue.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn delete_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<(), QueueStoreError> {
        let mut tenants = self.write();
        let removed = tenants
            .get_mut(&tenant_id)
            .and_then(|q| q.dead_letters.remove(&entry_id));

        match removed {
            Some(_) => Ok(()),
            None => Err(QueueStoreError::NotFound(entry_id)),
        }
    }
}
