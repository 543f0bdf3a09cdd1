//! Queue worker: the delivery control loop.
//!
//! Each poll fetches a batch for every active tenant (tenants run
//! concurrently, bounded by `max_concurrent_tenants`) and walks the batch in
//! order: claim, circuit breaker, rate limiter, send, record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::TenantId;

use crate::circuit_breaker::{BreakerDecision, CircuitBreakerRegistry, CircuitBreakerStats};
use crate::pool::PoolError;
use crate::queue::{QueueEntry, QueueStore, QueueStoreError, RetryPolicy, to_chrono};
use crate::rate_limit::{RateLimiterRegistry, RateLimiterStats};
use crate::tenants::TenantDirectory;
use crate::transport::Transport;

/// Queue worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between polls that found nothing to do
    pub poll_interval: Duration,
    /// Entries fetched per tenant per poll
    pub batch_size: usize,
    /// Tenants processed in parallel within one poll
    pub max_concurrent_tenants: usize,
    /// Lower bound for rate-limit deferrals
    pub min_rate_limit_backoff: Duration,
    pub retry_policy: RetryPolicy,
    /// How long `shutdown` waits for in-flight work before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "queue-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_concurrent_tenants: 4,
            min_rate_limit_backoff: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent_tenants(mut self, max: usize) -> Self {
        self.max_concurrent_tenants = max.max(1);
        self
    }

    pub fn with_min_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.min_rate_limit_backoff = backoff;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Errors that end a poll for one tenant, or the whole poll.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("tenant directory unavailable: {0}")]
    Directory(#[from] PoolError),
    #[error("queue store failed for tenant {tenant_id}: {source}")]
    Store {
        tenant_id: TenantId,
        #[source]
        source: QueueStoreError,
    },
}

/// Worker run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub skipped: u64,
    pub tenant_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    polls: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    deferred: AtomicU64,
    skipped: AtomicU64,
    tenant_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            polls: self.polls.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            tenant_errors: self.tenant_errors.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one fetched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Sent,
    Failed,
    DeadLettered,
    Deferred,
    Skipped,
}

/// Delivers queued email for every active tenant.
pub struct QueueWorker {
    store: Arc<dyn QueueStore>,
    tenants: Arc<dyn TenantDirectory>,
    transport: Arc<dyn Transport>,
    rate_limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: WorkerConfig,
    counters: Counters,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        tenants: Arc<dyn TenantDirectory>,
        transport: Arc<dyn Transport>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            tenants,
            transport,
            rate_limiters: Arc::new(RateLimiterRegistry::default()),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            config,
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_rate_limiters(mut self, registry: Arc<RateLimiterRegistry>) -> Self {
        self.rate_limiters = registry;
        self
    }

    pub fn with_circuit_breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = registry;
        self
    }

    /// Run the poll loop on the current Tokio runtime.
    pub fn spawn(self) -> QueueWorkerHandle {
        let worker = Arc::new(self);
        worker.running.store(true, Ordering::SeqCst);
        let join = tokio::spawn(Arc::clone(&worker).run());

        QueueWorkerHandle {
            worker,
            join: Some(join),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Rate limiter snapshots.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        self.rate_limiters.stats()
    }

    pub fn circuit_breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.stats()
    }

    pub fn run_stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// One pass over every active tenant. Returns how many entries were fetched.
    ///
    /// A failing tenant is logged and counted; it never stops the others.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, WorkerError> {
        Counters::bump(&self.counters.polls);
        let tenants = self.tenants.active_tenants().await?;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tenants.max(1)));
        let mut tasks = JoinSet::new();

        for tenant_id in tenants {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let worker = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                (tenant_id, worker.process_tenant(tenant_id).await)
            });
        }

        let mut fetched = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(count))) => fetched += count,
                Ok((tenant_id, Err(e))) => {
                    Counters::bump(&self.counters.tenant_errors);
                    error!(
                        worker = %self.config.name,
                        tenant_id = %tenant_id,
                        error = %e,
                        "tenant poll failed"
                    );
                }
                Err(e) => {
                    Counters::bump(&self.counters.tenant_errors);
                    error!(worker = %self.config.name, error = %e, "tenant task did not complete");
                }
            }
        }

        Ok(fetched)
    }

    async fn run(self: Arc<Self>) {
        info!(worker = %self.config.name, "queue worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(fetched) => fetched == 0,
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    () = self.cancel.cancelled() => break,
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(worker = %self.config.name, "queue worker stopped");
    }

    async fn process_tenant(&self, tenant_id: TenantId) -> Result<usize, WorkerError> {
        let entries = self
            .store
            .fetch_pending(tenant_id, self.config.batch_size)
            .await
            .map_err(|source| WorkerError::Store { tenant_id, source })?;
        let fetched = entries.len();
        if fetched > 0 {
            debug!(tenant_id = %tenant_id, fetched, "processing batch");
        }

        for entry in entries {
            // No new claims once shutdown is requested
            if self.cancel.is_cancelled() {
                break;
            }

            let entry_id = entry.id;
            match self.process_entry(entry).await {
                Ok(outcome) => self.count(outcome),
                Err(e) => {
                    error!(
                        tenant_id = %tenant_id,
                        entry_id = %entry_id,
                        error = %e,
                        "failed to record delivery outcome"
                    );
                }
            }
        }

        Ok(fetched)
    }

    async fn process_entry(&self, entry: QueueEntry) -> Result<EntryOutcome, QueueStoreError> {
        let tenant_id = entry.tenant_id;
        let destination = &entry.destination_id;

        if !self.store.mark_as_processing(tenant_id, entry.id).await? {
            debug!(tenant_id = %tenant_id, entry_id = %entry.id, "entry claimed elsewhere");
            return Ok(EntryOutcome::Skipped);
        }

        let probe = match self.breakers.check(destination) {
            BreakerDecision::Allow => false,
            BreakerDecision::Probe => true,
            BreakerDecision::Reject { retry_after } => {
                self.defer(&entry, retry_after, "circuit open").await?;
                return Ok(EntryOutcome::Deferred);
            }
        };

        if let Err(wait) = self
            .rate_limiters
            .try_acquire(destination, entry.payload.rate_limit_per_minute)
        {
            if probe {
                self.breakers.release_probe(destination);
            }
            let backoff = wait.max(self.config.min_rate_limit_backoff);
            self.defer(&entry, backoff, "rate limited").await?;
            return Ok(EntryOutcome::Deferred);
        }

        match self.transport.send(&entry).await {
            Ok(()) => {
                self.breakers.record_success(destination);
                self.store.mark_as_sent(tenant_id, entry.id).await?;
                debug!(tenant_id = %tenant_id, entry_id = %entry.id, "delivered");
                Ok(EntryOutcome::Sent)
            }
            Err(failure) => {
                self.breakers.record_failure(destination);

                if entry.is_last_attempt() {
                    self.store
                        .move_to_dead_letter(tenant_id, entry.id, &failure.reason)
                        .await?;
                    warn!(
                        tenant_id = %tenant_id,
                        entry_id = %entry.id,
                        destination = %destination,
                        attempts = entry.attempts + 1,
                        reason = %failure.reason,
                        "entry dead-lettered"
                    );
                    return Ok(EntryOutcome::DeadLettered);
                }

                let attempt = entry.attempts + 1;
                let retry_at = self.config.retry_policy.next_retry_at(Utc::now(), attempt);
                self.store
                    .mark_as_failed(tenant_id, entry.id, &failure.reason, retry_at)
                    .await?;
                debug!(
                    tenant_id = %tenant_id,
                    entry_id = %entry.id,
                    attempt,
                    retry_at = %retry_at,
                    reason = %failure.reason,
                    "delivery failed"
                );
                Ok(EntryOutcome::Failed)
            }
        }
    }

    /// Push an entry back without spending an attempt.
    async fn defer(
        &self,
        entry: &QueueEntry,
        after: Duration,
        why: &'static str,
    ) -> Result<(), QueueStoreError> {
        let at = Utc::now()
            .checked_add_signed(to_chrono(after))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store.set_next_retry(entry.tenant_id, entry.id, at).await?;
        debug!(
            tenant_id = %entry.tenant_id,
            entry_id = %entry.id,
            destination = %entry.destination_id,
            retry_at = %at,
            why,
            "delivery deferred"
        );
        Ok(())
    }

    fn count(&self, outcome: EntryOutcome) {
        let counter = match outcome {
            EntryOutcome::Sent => &self.counters.sent,
            EntryOutcome::Failed => &self.counters.failed,
            EntryOutcome::DeadLettered => &self.counters.dead_lettered,
            EntryOutcome::Deferred => &self.counters.deferred,
            EntryOutcome::Skipped => &self.counters.skipped,
        };
        Counters::bump(counter);
    }
}

/// Handle to observe and stop a running [`QueueWorker`].
pub struct QueueWorkerHandle {
    worker: Arc<QueueWorker>,
    join: Option<JoinHandle<()>>,
}

impl QueueWorkerHandle {
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Rate limiter snapshots.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        self.worker.stats()
    }

    pub fn circuit_breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.worker.circuit_breaker_stats()
    }

    pub fn run_stats(&self) -> WorkerStats {
        self.worker.run_stats()
    }

    /// Stop claiming new entries, let in-flight deliveries finish and wait up
    /// to the configured shutdown timeout before aborting. Idempotent.
    pub async fn shutdown(&mut self) {
        self.worker.cancel.cancel();

        let Some(mut join) = self.join.take() else {
            return;
        };

        let timeout = self.worker.config.shutdown_timeout;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(worker = %self.worker.config.name, error = %e, "worker task failed"),
            Err(_) => {
                warn!(
                    worker = %self.worker.config.name,
                    timeout_secs = timeout.as_secs(),
                    "worker did not stop in time; aborting"
                );
                join.abort();
                self.worker.running.store(false, Ordering::SeqCst);
            }
        }
    }
}
