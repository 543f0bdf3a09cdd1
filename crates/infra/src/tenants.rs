//! Where the worker learns which tenants to poll.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use courier_core::TenantId;

use crate::pool::{ConnectionPoolManager, PgConnector, PoolError};

/// Source of the tenants whose queues are currently served.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<TenantId>, PoolError>;
}

/// Fixed, in-process tenant list (tests and embedding).
#[derive(Debug, Default)]
pub struct StaticTenantDirectory {
    tenants: RwLock<BTreeSet<TenantId>>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            tenants: RwLock::new(tenants.into_iter().collect()),
        }
    }

    pub fn add(&self, tenant_id: TenantId) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id);
    }

    pub fn remove(&self, tenant_id: TenantId) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<TenantId>, PoolError> {
        Ok(self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect())
    }
}

/// Discovers tenants from the workspace databases that exist on the server.
pub struct PostgresTenantDirectory {
    pools: Arc<ConnectionPoolManager<PgConnector>>,
}

impl PostgresTenantDirectory {
    pub fn new(pools: Arc<ConnectionPoolManager<PgConnector>>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl TenantDirectory for PostgresTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<TenantId>, PoolError> {
        let system = self.pools.get_system_connection().await?;
        self.pools.connector().list_workspaces(&system).await
    }
}
