use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use courier_core::TenantId;

use super::{Connector, PoolError};

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Caches one connection handle per tenant plus a singleton system handle.
///
/// Lookups go through a sharded map and never take a global lock. Opening a
/// handle is serialized per tenant, so concurrent callers for the same tenant
/// share one handle while other tenants proceed independently. A tenant's
/// creation lock lives only while someone holds it.
pub struct ConnectionPoolManager<C: Connector> {
    connector: C,
    workspaces: DashMap<TenantId, C::Handle>,
    creation_locks: DashMap<TenantId, Arc<Mutex<()>>>,
    system: Mutex<Option<C::Handle>>,
    close_timeout: Duration,
}

impl<C: Connector> ConnectionPoolManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            workspaces: DashMap::new(),
            creation_locks: DashMap::new(),
            system: Mutex::new(None),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Upper bound on how long closing a single handle may take.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Create the tenant's database if needed, apply the queue schema and
    /// return its (cached) handle. Idempotent.
    pub async fn ensure_workspace_database(
        &self,
        tenant_id: TenantId,
    ) -> Result<C::Handle, PoolError> {
        self.with_creation_lock(tenant_id, async {
            let system = self.get_system_connection().await?;
            if !self.connector.workspace_exists(&system, tenant_id).await? {
                info!(tenant_id = %tenant_id, "creating workspace database");
                self.connector.create_workspace(&system, tenant_id).await?;
            }

            let handle = match self.cached(tenant_id) {
                Some(handle) => handle,
                None => self.open_workspace(tenant_id).await?,
            };
            self.connector.prepare_workspace(&handle).await?;
            Ok::<_, PoolError>(handle)
        })
        .await
    }

    /// Cached handle for the tenant, opening one if necessary.
    ///
    /// Fails with [`PoolError::WorkspaceNotFound`] for tenants that were never
    /// provisioned; nothing is cached in that case.
    pub async fn get_workspace_connection(
        &self,
        tenant_id: TenantId,
    ) -> Result<C::Handle, PoolError> {
        if let Some(handle) = self.cached(tenant_id) {
            return Ok(handle);
        }

        self.with_creation_lock(tenant_id, async {
            // Another caller may have opened it while we waited
            if let Some(handle) = self.cached(tenant_id) {
                return Ok::<_, PoolError>(handle);
            }

            let system = self.get_system_connection().await?;
            if !self.connector.workspace_exists(&system, tenant_id).await? {
                return Err(PoolError::WorkspaceNotFound(tenant_id));
            }

            self.open_workspace(tenant_id).await
        })
        .await
    }

    /// The system-level handle, opened lazily and reopened after [`cleanup`](Self::cleanup).
    pub async fn get_system_connection(&self) -> Result<C::Handle, PoolError> {
        let mut system = self.system.lock().await;
        if let Some(handle) = system.as_ref() {
            return Ok(handle.clone());
        }

        let handle = self.connector.connect_system().await?;
        debug!("opened system connection");
        *system = Some(handle.clone());
        Ok(handle)
    }

    /// Close and forget the tenant's handle. Idempotent.
    pub async fn cleanup_workspace(&self, tenant_id: TenantId) {
        self.with_creation_lock(tenant_id, async {
            if let Some((_, handle)) = self.workspaces.remove(&tenant_id) {
                self.close_bounded(handle).await;
                debug!(tenant_id = %tenant_id, "closed workspace connection");
            }
        })
        .await
    }

    /// Close every tenant handle and the system handle. Idempotent.
    pub async fn cleanup(&self) {
        let tenants: Vec<TenantId> = self.workspaces.iter().map(|e| *e.key()).collect();
        for tenant_id in tenants {
            self.cleanup_workspace(tenant_id).await;
        }

        // Locks left behind by cancelled callers
        self.creation_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let system = self.system.lock().await.take();
        if let Some(handle) = system {
            self.close_bounded(handle).await;
        }
        info!("connection pool manager cleaned up");
    }

    /// Number of cached tenant handles.
    pub fn get_connection_count(&self) -> usize {
        self.workspaces.len()
    }

    fn cached(&self, tenant_id: TenantId) -> Option<C::Handle> {
        self.workspaces.get(&tenant_id).map(|h| h.value().clone())
    }

    /// Run `work` under the tenant's creation lock, then drop the lock entry
    /// if no other caller is waiting on it.
    async fn with_creation_lock<T>(&self, tenant_id: TenantId, work: impl Future<Output = T>) -> T {
        let lock = Arc::clone(&self.creation_locks.entry(tenant_id).or_default());
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        // Clones are only handed out under the shard lock, so a count of one
        // means nobody else holds or awaits it
        self.creation_locks
            .remove_if(&tenant_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    // Caller holds the tenant's creation lock.
    async fn open_workspace(&self, tenant_id: TenantId) -> Result<C::Handle, PoolError> {
        let handle = self.connector.connect_workspace(tenant_id).await?;
        self.workspaces.insert(tenant_id, handle.clone());
        debug!(tenant_id = %tenant_id, "opened workspace connection");
        Ok(handle)
    }

    async fn close_bounded(&self, handle: C::Handle) {
        if tokio::time::timeout(self.close_timeout, self.connector.close(handle))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.close_timeout.as_millis() as u64,
                "connection did not close in time; abandoning it"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeConnector {
        existing: StdMutex<HashSet<TenantId>>,
        system_connects: AtomicUsize,
        workspace_connects: AtomicUsize,
        creates: AtomicUsize,
        prepares: AtomicUsize,
        closes: AtomicUsize,
        hang_on_close: AtomicBool,
    }

    impl FakeConnector {
        fn provisioned(tenants: &[TenantId]) -> Self {
            let fake = Self::default();
            fake.existing.lock().unwrap().extend(tenants.iter().copied());
            fake
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Handle = usize;

        async fn connect_system(&self) -> Result<usize, PoolError> {
            Ok(self.system_connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn workspace_exists(&self, _: &usize, tenant_id: TenantId) -> Result<bool, PoolError> {
            Ok(self.existing.lock().unwrap().contains(&tenant_id))
        }

        async fn create_workspace(&self, _: &usize, tenant_id: TenantId) -> Result<(), PoolError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.existing.lock().unwrap().insert(tenant_id);
            Ok(())
        }

        async fn prepare_workspace(&self, _: &usize) -> Result<(), PoolError> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect_workspace(&self, _: TenantId) -> Result<usize, PoolError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1000 + self.workspace_connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _: usize) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.hang_on_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
    }

    #[tokio::test]
    async fn unprovisioned_workspace_is_not_cached() {
        let tenant = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::default());

        let err = manager.get_workspace_connection(tenant).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkspaceNotFound(t) if t == tenant));
        assert_eq!(manager.get_connection_count(), 0);
        assert_eq!(manager.connector().workspace_connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_then_get_reuses_handle() {
        let tenant = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::default());

        let created = manager.ensure_workspace_database(tenant).await.unwrap();
        let fetched = manager.get_workspace_connection(tenant).await.unwrap();
        assert_eq!(created, fetched);

        // Second ensure is a no-op apart from re-applying the schema
        manager.ensure_workspace_database(tenant).await.unwrap();
        let fake = manager.connector();
        assert_eq!(fake.creates.load(Ordering::SeqCst), 1);
        assert_eq!(fake.workspace_connects.load(Ordering::SeqCst), 1);
        assert_eq!(fake.prepares.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_share_one_handle() {
        let tenant = TenantId::new();
        let manager = Arc::new(ConnectionPoolManager::new(FakeConnector::provisioned(&[tenant])));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_workspace_connection(tenant).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap());
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(manager.connector().workspace_connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensures_create_once() {
        let tenant = TenantId::new();
        let manager = Arc::new(ConnectionPoolManager::new(FakeConnector::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_workspace_database(tenant).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.connector().creates.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connector().workspace_connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tenants_get_distinct_handles() {
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::provisioned(&[t1, t2]));

        let h1 = manager.get_workspace_connection(t1).await.unwrap();
        let h2 = manager.get_workspace_connection(t2).await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(manager.get_connection_count(), 2);
    }

    #[tokio::test]
    async fn cleanup_workspace_is_idempotent() {
        let tenant = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::provisioned(&[tenant]));

        manager.get_workspace_connection(tenant).await.unwrap();
        manager.cleanup_workspace(tenant).await;
        manager.cleanup_workspace(tenant).await;

        assert_eq!(manager.get_connection_count(), 0);
        assert_eq!(manager.connector().closes.load(Ordering::SeqCst), 1);

        // Reopens on demand
        manager.get_workspace_connection(tenant).await.unwrap();
        assert_eq!(manager.connector().workspace_connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleanup_resets_system_handle() {
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::provisioned(&[t1, t2]));

        manager.get_workspace_connection(t1).await.unwrap();
        manager.get_workspace_connection(t2).await.unwrap();
        let first = manager.get_system_connection().await.unwrap();

        manager.cleanup().await;
        manager.cleanup().await;
        assert_eq!(manager.get_connection_count(), 0);
        assert_eq!(manager.connector().closes.load(Ordering::SeqCst), 3);

        let second = manager.get_system_connection().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.connector().system_connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn creation_locks_do_not_accumulate() {
        let known = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::provisioned(&[known]));

        for _ in 0..20 {
            let stranger = TenantId::new();
            assert!(manager.get_workspace_connection(stranger).await.is_err());
        }
        manager.get_workspace_connection(known).await.unwrap();
        manager.ensure_workspace_database(TenantId::new()).await.unwrap();
        assert_eq!(manager.creation_locks.len(), 0);

        manager.cleanup_workspace(known).await;
        manager.cleanup().await;
        assert_eq!(manager.creation_locks.len(), 0);
        assert_eq!(manager.get_connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn creation_locks_are_released_after_concurrent_use() {
        let tenant = TenantId::new();
        let manager = Arc::new(ConnectionPoolManager::new(FakeConnector::provisioned(&[tenant])));

        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    manager.get_workspace_connection(tenant).await.map(|_| ())
                } else {
                    manager.cleanup_workspace(tenant).await;
                    Ok(())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(manager.creation_locks.len(), 0);
    }

    #[tokio::test]
    async fn stalled_close_does_not_hang_cleanup() {
        let tenant = TenantId::new();
        let manager = ConnectionPoolManager::new(FakeConnector::provisioned(&[tenant]))
            .with_close_timeout(Duration::from_millis(20));
        manager.get_workspace_connection(tenant).await.unwrap();
        manager.connector().hang_on_close.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(2), manager.cleanup())
            .await
            .expect("cleanup must finish despite a stalled close");
        assert_eq!(manager.get_connection_count(), 0);
    }
}
