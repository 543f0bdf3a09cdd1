//! Postgres connector: one database per workspace, named
//! `<prefix>_ws_<tenant uuid, simple form>`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use courier_core::TenantId;

use super::{Connector, PoolError};

/// Queue schema applied to every workspace database. Each statement is
/// idempotent.
pub const QUEUE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS email_queue (
        id             UUID PRIMARY KEY,
        tenant_id      UUID NOT NULL,
        destination_id TEXT NOT NULL,
        recipient      TEXT NOT NULL,
        source_type    TEXT NOT NULL,
        source_id      TEXT NOT NULL,
        payload        JSONB NOT NULL,
        priority       INTEGER NOT NULL DEFAULT 5,
        status         TEXT NOT NULL DEFAULT 'pending'
                       CHECK (status IN ('pending', 'processing', 'failed')),
        attempts       INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts   INTEGER NOT NULL CHECK (max_attempts > 0),
        next_retry_at  TIMESTAMPTZ NULL,
        error_message  TEXT NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS email_queue_fetch_idx
        ON email_queue (tenant_id, status, priority, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS email_queue_source_idx
        ON email_queue (tenant_id, source_type, source_id, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS email_queue_dead_letter (
        id               UUID PRIMARY KEY,
        tenant_id        UUID NOT NULL,
        destination_id   TEXT NOT NULL,
        recipient        TEXT NOT NULL,
        source_type      TEXT NOT NULL,
        source_id        TEXT NOT NULL,
        payload          JSONB NOT NULL,
        priority         INTEGER NOT NULL,
        attempts         INTEGER NOT NULL,
        max_attempts     INTEGER NOT NULL,
        error_message    TEXT NULL,
        reason           TEXT NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS email_queue_dead_letter_tenant_idx
        ON email_queue_dead_letter (tenant_id, dead_lettered_at)
    "#,
];

// Postgres names are limited to 63 bytes; the suffix takes 4 + 32.
const MAX_PREFIX_LEN: usize = 27;

/// Postgres pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// URL of the system database (used for provisioning and discovery).
    pub database_url: String,
    /// Prefix of every workspace database name.
    pub workspace_prefix: String,
    pub max_connections_per_workspace: u32,
    pub system_max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            workspace_prefix: "courier".to_string(),
            max_connections_per_workspace: 5,
            system_max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_workspace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.workspace_prefix = prefix.into();
        self
    }

    pub fn with_max_connections_per_workspace(mut self, max: u32) -> Self {
        self.max_connections_per_workspace = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Production [`Connector`] backed by `sqlx` Postgres pools.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: PoolConfig,
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let prefix = &config.workspace_prefix;
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= MAX_PREFIX_LEN
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_prefix {
            return Err(PoolError::Connect(format!(
                "invalid workspace prefix {prefix:?}: use up to {MAX_PREFIX_LEN} of [a-z0-9_]"
            )));
        }

        let options: PgConnectOptions = config
            .database_url
            .parse()
            .map_err(|e| PoolError::Connect(format!("invalid database url: {e}")))?;

        Ok(Self { config, options })
    }

    pub fn workspace_database_name(&self, tenant_id: TenantId) -> String {
        format!(
            "{}_ws_{}",
            self.config.workspace_prefix,
            tenant_id.as_uuid().simple()
        )
    }

    /// Inverse of [`workspace_database_name`](Self::workspace_database_name).
    pub fn tenant_from_database_name(&self, name: &str) -> Option<TenantId> {
        let suffix = name
            .strip_prefix(self.config.workspace_prefix.as_str())?
            .strip_prefix("_ws_")?;
        Uuid::try_parse(suffix).ok().map(TenantId::from_uuid)
    }

    /// Tenants that have a provisioned workspace database, sorted.
    pub async fn list_workspaces(&self, system: &PgPool) -> Result<Vec<TenantId>, PoolError> {
        let rows = sqlx::query("SELECT datname FROM pg_database WHERE NOT datistemplate")
            .fetch_all(system)
            .await
            .map_err(|e| PoolError::Storage(format!("failed to list workspaces: {e}")))?;

        let mut tenants = Vec::new();
        for row in rows {
            let name: String = row
                .try_get("datname")
                .map_err(|e| PoolError::Storage(e.to_string()))?;
            if let Some(tenant_id) = self.tenant_from_database_name(&name) {
                tenants.push(tenant_id);
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgPool;

    async fn connect_system(&self) -> Result<PgPool, PoolError> {
        PgPoolOptions::new()
            .max_connections(self.config.system_max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_with(self.options.clone())
            .await
            .map_err(|e| PoolError::Connect(format!("system database: {e}")))
    }

    async fn workspace_exists(&self, system: &PgPool, tenant_id: TenantId) -> Result<bool, PoolError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1) AS found")
            .bind(self.workspace_database_name(tenant_id))
            .fetch_one(system)
            .await
            .map_err(|e| PoolError::Storage(format!("workspace lookup failed: {e}")))?;

        row.try_get("found")
            .map_err(|e| PoolError::Storage(e.to_string()))
    }

    async fn create_workspace(&self, system: &PgPool, tenant_id: TenantId) -> Result<(), PoolError> {
        let name = self.workspace_database_name(tenant_id);
        // CREATE DATABASE cannot run in a transaction block, so use the simple protocol
        let sql = format!("CREATE DATABASE \"{name}\"");

        match sqlx::raw_sql(&sql).execute(system).await {
            Ok(_) => {
                info!(tenant_id = %tenant_id, database = %name, "workspace database created");
                Ok(())
            }
            Err(e) if is_already_created(&e) => {
                debug!(tenant_id = %tenant_id, database = %name, "workspace database already exists");
                Ok(())
            }
            Err(e) => Err(PoolError::Provision {
                tenant_id,
                reason: e.to_string(),
            }),
        }
    }

    async fn prepare_workspace(&self, workspace: &PgPool) -> Result<(), PoolError> {
        for statement in QUEUE_SCHEMA {
            sqlx::query(statement)
                .execute(workspace)
                .await
                .map_err(|e| PoolError::Storage(format!("failed to apply queue schema: {e}")))?;
        }
        Ok(())
    }

    async fn connect_workspace(&self, tenant_id: TenantId) -> Result<PgPool, PoolError> {
        let name = self.workspace_database_name(tenant_id);
        PgPoolOptions::new()
            .max_connections(self.config.max_connections_per_workspace)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_with(self.options.clone().database(&name))
            .await
            .map_err(|e| match db_error_code(&e).as_deref() {
                // invalid_catalog_name: dropped behind our back
                Some("3D000") => PoolError::WorkspaceNotFound(tenant_id),
                _ => PoolError::Connect(format!("workspace {name}: {e}")),
            })
    }

    async fn close(&self, handle: PgPool) {
        handle.close().await;
    }
}

fn db_error_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// `duplicate_database`, or the unique violation Postgres raises when two
/// sessions race on the same CREATE DATABASE.
fn is_already_created(err: &sqlx::Error) -> bool {
    matches!(db_error_code(err).as_deref(), Some("42P04") | Some("23505"))
}
