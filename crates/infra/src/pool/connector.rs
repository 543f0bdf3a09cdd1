use async_trait::async_trait;

use courier_core::TenantId;

use super::PoolError;

/// Storage engine behind the [`ConnectionPoolManager`](super::ConnectionPoolManager).
///
/// A handle is whatever the engine hands out for issuing queries (for
/// Postgres, a `PgPool`). Handles are cloned freely; closing one closes
/// every clone.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Open the system-level handle used for provisioning and discovery.
    async fn connect_system(&self) -> Result<Self::Handle, PoolError>;

    async fn workspace_exists(
        &self,
        system: &Self::Handle,
        tenant_id: TenantId,
    ) -> Result<bool, PoolError>;

    /// Create the tenant's database. Must succeed if it already exists, including
    /// when another process created it concurrently.
    async fn create_workspace(
        &self,
        system: &Self::Handle,
        tenant_id: TenantId,
    ) -> Result<(), PoolError>;

    /// Apply the queue schema to a freshly opened workspace. Must be idempotent.
    async fn prepare_workspace(&self, _workspace: &Self::Handle) -> Result<(), PoolError> {
        Ok(())
    }

    async fn connect_workspace(&self, tenant_id: TenantId) -> Result<Self::Handle, PoolError>;

    async fn close(&self, handle: Self::Handle);
}
