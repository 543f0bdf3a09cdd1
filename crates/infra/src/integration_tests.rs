//! Integration tests for the full delivery pipeline.
//!
//! Tests: Enqueue → QueueWorker → CircuitBreaker → RateLimiter → Transport → QueueStore
//!
//! Verifies:
//! - Failing destinations trip the breaker and stop consuming attempts
//! - Rate-limited entries are deferred without spending an attempt
//! - Exhausted entries are dead-lettered
//! - One tenant's storage failure does not stall other tenants
//! - Abandoned claims are recovered and the worker stops gracefully

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{DestinationId, EntryId, TenantId};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::queue::{
    DeadLetterEntry, EmailPayload, EntryStatus, InMemoryQueueStore, NewQueueEntry, QueueEntry,
    QueueStats, QueueStore, QueueStoreError, SourceType,
};
use crate::rate_limit::RateLimiterRegistry;
use crate::tenants::StaticTenantDirectory;
use crate::transport::{SendFailure, Transport};
use crate::workers::{QueueWorker, WorkerConfig};

/// Transport whose outcome can be flipped between polls.
#[derive(Default)]
struct ScriptedTransport {
    failing: AtomicBool,
    calls: AtomicUsize,
    delivered: Mutex<Vec<EntryId>>,
}

impl ScriptedTransport {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn delivered(&self) -> Vec<EntryId> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, entry: &QueueEntry) -> Result<(), SendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendFailure::new("421 service not available"));
        }
        self.delivered.lock().unwrap().push(entry.id);
        Ok(())
    }
}

/// Store whose `fetch_pending` fails for one tenant.
struct FlakyStore {
    inner: InMemoryQueueStore,
    broken: TenantId,
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        entries: Vec<NewQueueEntry>,
    ) -> Result<Vec<EntryId>, QueueStoreError> {
        self.inner.enqueue(tenant_id, entries).await
    }

    async fn fetch_pending(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        if tenant_id == self.broken {
            return Err(QueueStoreError::Storage("connection reset by peer".into()));
        }
        self.inner.fetch_pending(tenant_id, limit).await
    }

    async fn mark_as_processing(&self, tenant_id: TenantId, id: EntryId) -> Result<bool, QueueStoreError> {
        self.inner.mark_as_processing(tenant_id, id).await
    }

    async fn mark_as_sent(&self, tenant_id: TenantId, id: EntryId) -> Result<(), QueueStoreError> {
        self.inner.mark_as_sent(tenant_id, id).await
    }

    async fn mark_as_failed(
        &self,
        tenant_id: TenantId,
        id: EntryId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        self.inner.mark_as_failed(tenant_id, id, reason, next_retry_at).await
    }

    async fn set_next_retry(
        &self,
        tenant_id: TenantId,
        id: EntryId,
        at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        self.inner.set_next_retry(tenant_id, id, at).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        self.inner.stats(tenant_id).await
    }

    async fn get(&self, tenant_id: TenantId, id: EntryId) -> Result<Option<QueueEntry>, QueueStoreError> {
        self.inner.get(tenant_id, id).await
    }

    async fn get_by_source_id(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        self.inner.get_by_source_id(tenant_id, source_type, source_id).await
    }

    async fn count_by_source_and_status(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueStoreError> {
        self.inner
            .count_by_source_and_status(tenant_id, source_type, source_id, status)
            .await
    }

    async fn delete(&self, tenant_id: TenantId, id: EntryId) -> Result<(), QueueStoreError> {
        self.inner.delete(tenant_id, id).await
    }

    async fn move_to_dead_letter(
        &self,
        tenant_id: TenantId,
        id: EntryId,
        reason: &str,
    ) -> Result<(), QueueStoreError> {
        self.inner.move_to_dead_letter(tenant_id, id, reason).await
    }

    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        self.inner.list_dead_letters(tenant_id, limit).await
    }

    async fn retry_dead_letter(&self, tenant_id: TenantId, id: EntryId) -> Result<QueueEntry, QueueStoreError> {
        self.inner.retry_dead_letter(tenant_id, id).await
    }

    async fn delete_dead_letter(&self, tenant_id: TenantId, id: EntryId) -> Result<(), QueueStoreError> {
        self.inner.delete_dead_letter(tenant_id, id).await
    }
}

fn destination() -> DestinationId {
    DestinationId::new("ses-eu-west-1").unwrap()
}

fn new_entry(tenant_id: TenantId, source_id: &str) -> NewQueueEntry {
    NewQueueEntry::new(
        tenant_id,
        destination(),
        "ada@example.com",
        SourceType::Broadcast,
        source_id,
        EmailPayload {
            from_address: "hello@example.com".into(),
            subject: "Release notes".into(),
            html_body: "<h1>v2</h1>".into(),
            ..Default::default()
        },
    )
}

fn worker(
    store: Arc<dyn QueueStore>,
    tenants: &[TenantId],
    transport: Arc<ScriptedTransport>,
    breakers: CircuitBreakerConfig,
) -> Arc<QueueWorker> {
    Arc::new(
        QueueWorker::new(
            store,
            Arc::new(StaticTenantDirectory::new(tenants.iter().copied())),
            transport,
            WorkerConfig::default(),
        )
        .with_circuit_breakers(Arc::new(CircuitBreakerRegistry::new(breakers))),
    )
}

async fn all_entries(store: &InMemoryQueueStore, tenant_id: TenantId, source_id: &str) -> Vec<QueueEntry> {
    store
        .get_by_source_id(tenant_id, SourceType::Broadcast, source_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn failing_destination_opens_breaker_and_defers_remaining_entries() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let batch: Vec<_> = (0..6).map(|_| new_entry(tenant, "bc_outage")).collect();
    store.enqueue(tenant, batch).await.unwrap();

    let transport = ScriptedTransport::failing();
    let worker = worker(store.clone(), &[tenant], transport.clone(), CircuitBreakerConfig::default());

    assert_eq!(worker.poll_once().await.unwrap(), 6);

    assert_eq!(transport.calls(), 5);
    let entries = all_entries(&store, tenant, "bc_outage").await;
    let failed: Vec<_> = entries.iter().filter(|e| e.status == EntryStatus::Failed).collect();
    let deferred: Vec<_> = entries.iter().filter(|e| e.status == EntryStatus::Pending).collect();
    assert_eq!(failed.len(), 5);
    assert!(failed.iter().all(|e| e.attempts == 1));
    assert!(failed.iter().all(|e| e.error_message.as_deref() == Some("421 service not available")));

    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].attempts, 0);
    assert!(deferred[0].error_message.is_none());
    let retry_at = deferred[0].next_retry_at.unwrap();
    assert!(retry_at > Utc::now() + chrono::Duration::seconds(50));

    let breakers = worker.circuit_breaker_stats();
    assert_eq!(breakers.len(), 1);
    assert!(breakers[0].is_open);
    assert!(breakers[0].failures >= 5);

    let stats = worker.run_stats();
    assert_eq!(stats.failed, 5);
    assert_eq!(stats.deferred, 1);

    // Nothing is eligible on the next poll
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(transport.calls(), 5);
}

#[tokio::test]
async fn successful_delivery_removes_entry() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let ids = store.enqueue(tenant, vec![new_entry(tenant, "bc_1")]).await.unwrap();

    let transport = ScriptedTransport::succeeding();
    let worker = worker(store.clone(), &[tenant], transport.clone(), CircuitBreakerConfig::default());
    worker.poll_once().await.unwrap();

    assert_eq!(transport.delivered(), ids);
    assert_eq!(store.stats(tenant).await.unwrap().total(), 0);
    assert!(store.get(tenant, ids[0]).await.unwrap().is_none());
    assert_eq!(worker.run_stats().sent, 1);
    assert_eq!(worker.circuit_breaker_stats()[0].state, CircuitState::Closed);
    assert_eq!(worker.stats()[0].rate_per_minute, 600);
}

#[tokio::test]
async fn rate_limited_entries_are_deferred_without_spending_attempts() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let batch: Vec<_> = (0..3)
        .map(|_| {
            let mut entry = new_entry(tenant, "bc_slow");
            entry.payload.rate_limit_per_minute = Some(60);
            entry
        })
        .collect();
    store.enqueue(tenant, batch).await.unwrap();

    let transport = ScriptedTransport::succeeding();
    let worker = Arc::new(
        QueueWorker::new(
            store.clone(),
            Arc::new(StaticTenantDirectory::new([tenant])),
            transport.clone(),
            WorkerConfig::default(),
        )
        .with_rate_limiters(Arc::new(RateLimiterRegistry::default())),
    );
    worker.poll_once().await.unwrap();

    assert_eq!(transport.calls(), 1);
    let remaining = all_entries(&store, tenant, "bc_slow").await;
    assert_eq!(remaining.len(), 2);
    for entry in &remaining {
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert!(entry.next_retry_at.unwrap() > Utc::now());
    }
    assert_eq!(worker.run_stats().deferred, 2);

    let limiter = &worker.stats()[0];
    assert_eq!(limiter.rate_per_minute, 60);
    assert_eq!(limiter.burst, 1);
}

#[tokio::test]
async fn exhausted_entry_is_dead_lettered() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let id = store
        .enqueue(tenant, vec![new_entry(tenant, "bc_1").with_max_attempts(2)])
        .await
        .unwrap()[0];

    let transport = ScriptedTransport::failing();
    let breakers = CircuitBreakerConfig::default().with_threshold(100);
    let worker = worker(store.clone(), &[tenant], transport.clone(), breakers);

    worker.poll_once().await.unwrap();
    let entry = store.get(tenant, id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempts, 1);

    store.clear_retry(tenant, id);
    worker.poll_once().await.unwrap();

    assert!(store.get(tenant, id).await.unwrap().is_none());
    let dead = store.list_dead_letters(tenant, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entry.id, id);
    assert_eq!(dead[0].entry.attempts, 2);
    assert_eq!(dead[0].reason, "421 service not available");

    let stats = worker.run_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn storage_failure_in_one_tenant_does_not_block_others() {
    let healthy = TenantId::new();
    let broken = TenantId::new();
    let store = Arc::new(FlakyStore {
        inner: InMemoryQueueStore::new(),
        broken,
    });
    store.enqueue(healthy, vec![new_entry(healthy, "bc_1")]).await.unwrap();
    store.enqueue(broken, vec![new_entry(broken, "bc_2")]).await.unwrap();

    let transport = ScriptedTransport::succeeding();
    let worker = worker(
        store.clone(),
        &[healthy, broken],
        transport.clone(),
        CircuitBreakerConfig::default(),
    );
    worker.poll_once().await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(store.stats(healthy).await.unwrap().total(), 0);
    assert_eq!(store.stats(broken).await.unwrap().pending, 1);

    let stats = worker.run_stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.tenant_errors, 1);
}

#[tokio::test]
async fn abandoned_claim_is_recovered() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let id = store.enqueue(tenant, vec![new_entry(tenant, "bc_1")]).await.unwrap()[0];

    // A worker claimed it and crashed
    assert!(store.mark_as_processing(tenant, id).await.unwrap());

    let transport = ScriptedTransport::succeeding();
    let worker = worker(store.clone(), &[tenant], transport.clone(), CircuitBreakerConfig::default());

    worker.poll_once().await.unwrap();
    assert_eq!(transport.calls(), 0);

    store.backdate(tenant, id, Duration::from_secs(180));
    worker.poll_once().await.unwrap();
    assert_eq!(transport.delivered(), vec![id]);
    assert!(store.get(tenant, id).await.unwrap().is_none());
}

#[tokio::test]
async fn successful_probe_closes_breaker() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let ids = store
        .enqueue(tenant, vec![new_entry(tenant, "bc_1"), new_entry(tenant, "bc_1")])
        .await
        .unwrap();

    let transport = ScriptedTransport::failing();
    let breakers = CircuitBreakerConfig::default()
        .with_threshold(1)
        .with_cooldown(Duration::from_millis(30));
    let worker = worker(store.clone(), &[tenant], transport.clone(), breakers);

    worker.poll_once().await.unwrap();
    assert!(worker.circuit_breaker_stats()[0].is_open);
    assert_eq!(transport.calls(), 1);

    transport.set_failing(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for id in &ids {
        store.clear_retry(tenant, *id);
    }
    worker.poll_once().await.unwrap();

    assert_eq!(transport.delivered().len(), 2);
    assert_eq!(store.stats(tenant).await.unwrap().total(), 0);
    let breaker = &worker.circuit_breaker_stats()[0];
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failures, 0);
}

#[tokio::test]
async fn spawned_worker_delivers_and_stops_gracefully() {
    let tenant = TenantId::new();
    let store = Arc::new(InMemoryQueueStore::new());
    let tenants = Arc::new(StaticTenantDirectory::default());
    let transport = ScriptedTransport::succeeding();

    let mut handle = QueueWorker::new(
        store.clone(),
        tenants.clone(),
        transport.clone(),
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(2)),
    )
    .spawn();
    assert!(handle.is_running());

    // Tenants can join while the worker runs
    tenants.add(tenant);
    store
        .enqueue(tenant, vec![new_entry(tenant, "bc_1"), new_entry(tenant, "bc_2")])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.stats(tenant).await.unwrap().total() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker should drain the queue");

    handle.shutdown().await;
    assert!(!handle.is_running());
    assert_eq!(handle.run_stats().sent, 2);
    assert!(handle.run_stats().polls >= 1);

    // Nothing is claimed after shutdown
    store.enqueue(tenant, vec![new_entry(tenant, "bc_3")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.stats(tenant).await.unwrap().pending, 1);
    handle.shutdown().await;
}
