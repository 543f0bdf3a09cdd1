//! Per-tenant ("workspace") database connection management.
//!
//! Every tenant owns an independent database. The [`ConnectionPoolManager`]
//! provisions those databases, caches one handle per tenant and one
//! system-wide handle, and tears them down again. The storage engine itself
//! sits behind the [`Connector`] trait.

mod connector;
mod manager;
mod postgres;

pub use connector::Connector;
pub use manager::ConnectionPoolManager;
pub use postgres::{PgConnector, PoolConfig, QUEUE_SCHEMA};

use courier_core::TenantId;

/// Connection pool error.
///
/// `Clone` so a single failure can be reported to every caller waiting on
/// the same workspace.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("workspace database for tenant {0} does not exist")]
    WorkspaceNotFound(TenantId),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("failed to provision workspace for tenant {tenant_id}: {reason}")]
    Provision { tenant_id: TenantId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}
