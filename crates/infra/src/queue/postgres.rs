//! Postgres-backed queue store.
//!
//! Every tenant lives in its own workspace database; each call resolves the
//! tenant's pool through the [`ConnectionPoolManager`] and additionally filters
//! by `tenant_id`.
//!
//! ## Concurrency
//!
//! `fetch_pending` selects with `FOR UPDATE SKIP LOCKED` inside a short
//! transaction. The row locks end at commit, so two fetchers can still return
//! the same row. The claim is the conditional `UPDATE` in
//! `mark_as_processing`, which applies the same visibility predicate as the
//! fetch: exactly one caller sees a row affected, and a row deferred or
//! failed since it was fetched cannot be claimed.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueStoreError |
//! |------------|-----------------|
//! | PoolClosed / PoolTimedOut / Io | `Connection` |
//! | Database (any code) | `Storage` (message carries the code) |
//! | Other | `Storage` |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use courier_core::{DestinationId, EntryId, TenantId};

use super::store::{QueueStore, QueueStoreError, validate_batch};
use super::types::{
    DEFAULT_STALE_PROCESSING_AFTER, DeadLetterEntry, EmailPayload, EntryStatus, NewQueueEntry,
    QueueEntry, QueueStats, SourceType,
};
use crate::pool::{ConnectionPoolManager, PgConnector, PoolError};

const ENTRY_COLUMNS: &str = "id, tenant_id, destination_id, recipient, source_type, source_id, \
     payload, priority, status, attempts, max_attempts, next_retry_at, error_message, \
     created_at, updated_at";

const DEAD_LETTER_COLUMNS: &str = "id, tenant_id, destination_id, recipient, source_type, \
     source_id, payload, priority, attempts, max_attempts, error_message, reason, created_at, \
     dead_lettered_at";

/// Claimable rows: schedulable and due, or processing with a stale claim.
/// `$1` is the tenant, `$2` the stale threshold in seconds.
const VISIBLE_PREDICATE: &str = "tenant_id = $1 AND (\
     (status IN ('pending', 'failed') AND (next_retry_at IS NULL OR next_retry_at <= NOW())) \
     OR (status = 'processing' AND updated_at <= NOW() - make_interval(secs => $2)))";

/// Postgres queue store over per-tenant workspace databases.
#[derive(Clone)]
pub struct PostgresQueueStore {
    pools: Arc<ConnectionPoolManager<PgConnector>>,
    stale_after: Duration,
}

impl PostgresQueueStore {
    pub fn new(pools: Arc<ConnectionPoolManager<PgConnector>>) -> Self {
        Self {
            pools,
            stale_after: DEFAULT_STALE_PROCESSING_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn pool(&self, tenant_id: TenantId) -> Result<PgPool, QueueStoreError> {
        Ok(self.pools.get_workspace_connection(tenant_id).await?)
    }

    fn stale_secs(&self) -> f64 {
        self.stale_after.as_secs_f64()
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(
        skip(self, entries),
        fields(tenant_id = %tenant_id, entry_count = entries.len()),
        err
    )]
    async fn enqueue(
        &self,
        tenant_id: TenantId,
        entries: Vec<NewQueueEntry>,
    ) -> Result<Vec<EntryId>, QueueStoreError> {
        validate_batch(tenant_id, &entries)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool(tenant_id).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let now = Utc::now();
        let sql = format!(
            "INSERT INTO email_queue ({ENTRY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        );

        let mut ids = Vec::with_capacity(entries.len());
        for new in entries {
            let entry = new.into_entry(now);
            let payload = serde_json::to_value(&entry.payload)
                .map_err(|e| QueueStoreError::Storage(format!("failed to encode payload: {e}")))?;

            sqlx::query(&sql)
                .bind(entry.id.as_uuid())
                .bind(entry.tenant_id.as_uuid())
                .bind(entry.destination_id.as_str())
                .bind(&entry.recipient)
                .bind(entry.source_type.as_str())
                .bind(&entry.source_id)
                .bind(payload)
                .bind(entry.priority)
                .bind(entry.status.as_str())
                .bind(to_db_count(entry.attempts))
                .bind(to_db_count(entry.max_attempts))
                .bind(entry.next_retry_at)
                .bind(&entry.error_message)
                .bind(entry.created_at)
                .bind(entry.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_entry", e))?;

            ids.push(entry.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ids)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn fetch_pending(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM email_queue WHERE {VISIBLE_PREDICATE} \
             ORDER BY priority ASC, created_at ASC, id ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(self.stale_secs())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn mark_as_processing(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<bool, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let sql = format!(
            "UPDATE email_queue SET status = 'processing', updated_at = NOW() \
             WHERE id = $3 AND {VISIBLE_PREDICATE}"
        );
        let result = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(self.stale_secs())
            .bind(entry_id.as_uuid())
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("mark_as_processing", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn mark_as_sent(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<(), QueueStoreError> {
        self.delete(tenant_id, entry_id).await
    }

    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn mark_as_failed(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'failed',
                attempts = attempts + 1,
                error_message = $3,
                next_retry_at = $4,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entry_id.as_uuid())
        .bind(reason)
        .bind(next_retry_at)
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::NotFound(entry_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn set_next_retry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        at: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending', next_retry_at = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entry_id.as_uuid())
        .bind(at)
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("set_next_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::NotFound(entry_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM email_queue
            WHERE tenant_id = $1
            GROUP BY status
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            let total = u64::try_from(total).unwrap_or_default();
            match EntryStatus::from_str(&status) {
                Ok(EntryStatus::Pending) => stats.pending = total,
                Ok(EntryStatus::Processing) => stats.processing = total,
                Ok(EntryStatus::Failed) => stats.failed = total,
                Err(e) => return Err(QueueStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn get(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<QueueEntry>, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM email_queue WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn get_by_source_id(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM email_queue \
             WHERE tenant_id = $1 AND source_type = $2 AND source_id = $3 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(source_type.as_str())
            .bind(source_id)
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_source_id", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn count_by_source_and_status(
        &self,
        tenant_id: TenantId,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM email_queue
            WHERE tenant_id = $1 AND source_type = $2 AND source_id = $3 AND status = $4
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(status.as_str())
        .fetch_one(&pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_source_and_status", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_by_source_and_status", e))?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn delete(&self, tenant_id: TenantId, entry_id: EntryId) -> Result<(), QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        sqlx::query("DELETE FROM email_queue WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn move_to_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<(), QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            "INSERT INTO email_queue_dead_letter ({DEAD_LETTER_COLUMNS}) \
             SELECT id, tenant_id, destination_id, recipient, source_type, source_id, payload, \
                    priority, attempts + 1, max_attempts, $3, $3, created_at, NOW() \
             FROM email_queue WHERE tenant_id = $1 AND id = $2"
        );
        let moved = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        if moved.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueStoreError::NotFound(entry_id));
        }

        sqlx::query("DELETE FROM email_queue WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_entry", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM email_queue_dead_letter \
             WHERE tenant_id = $1 \
             ORDER BY dead_lettered_at ASC, id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn retry_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<QueueEntry, QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!(
            "WITH revived AS ( \
                 DELETE FROM email_queue_dead_letter WHERE tenant_id = $1 AND id = $2 \
                 RETURNING * \
             ) \
             INSERT INTO email_queue ({ENTRY_COLUMNS}) \
             SELECT id, tenant_id, destination_id, recipient, source_type, source_id, payload, \
                    priority, 'pending', 0, max_attempts, NULL, NULL, created_at, NOW() \
             FROM revived \
             RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(QueueStoreError::NotFound(entry_id));
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        entry_from_row(&row)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, entry_id = %entry_id), err)]
    async fn delete_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<(), QueueStoreError> {
        let pool = self.pool(tenant_id).await?;
        let result = sqlx::query("DELETE FROM email_queue_dead_letter WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(entry_id.as_uuid())
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueStoreError::NotFound(entry_id));
        }
        Ok(())
    }
}

/// Map SQLx errors to `QueueStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            QueueStoreError::Storage(format!(
                "database error in {} [{}]: {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            QueueStoreError::Connection(PoolError::Connect(format!("{operation}: {err}")))
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32, column: &str) -> Result<u32, QueueStoreError> {
    u32::try_from(value)
        .map_err(|_| QueueStoreError::Storage(format!("negative {column} in stored row: {value}")))
}

fn corrupt(e: impl std::fmt::Display) -> QueueStoreError {
    QueueStoreError::Storage(format!("failed to decode queue row: {e}"))
}

// SQLx row types

#[derive(Debug)]
struct EntryRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    destination_id: String,
    recipient: String,
    source_type: String,
    source_id: String,
    payload: serde_json::Value,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            destination_id: row.try_get("destination_id")?,
            recipient: row.try_get("recipient")?,
            source_type: row.try_get("source_type")?,
            source_id: row.try_get("source_id")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl EntryRow {
    fn into_entry(
        self,
        status: EntryStatus,
        next_retry_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<QueueEntry, QueueStoreError> {
        let payload: EmailPayload = serde_json::from_value(self.payload).map_err(corrupt)?;
        Ok(QueueEntry {
            id: EntryId::from_uuid(self.id),
            tenant_id: TenantId::from_uuid(self.tenant_id),
            destination_id: DestinationId::new(self.destination_id).map_err(corrupt)?,
            recipient: self.recipient,
            source_type: SourceType::from_str(&self.source_type).map_err(corrupt)?,
            source_id: self.source_id,
            payload,
            priority: self.priority,
            status,
            attempts: from_db_count(self.attempts, "attempts")?,
            max_attempts: from_db_count(self.max_attempts, "max_attempts")?,
            next_retry_at,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at,
        })
    }
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry, QueueStoreError> {
    let base = <EntryRow as sqlx::FromRow<PgRow>>::from_row(row).map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let next_retry_at: Option<DateTime<Utc>> = row.try_get("next_retry_at").map_err(corrupt)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(corrupt)?;

    base.into_entry(
        EntryStatus::from_str(&status).map_err(corrupt)?,
        next_retry_at,
        updated_at,
    )
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, QueueStoreError> {
    let base = <EntryRow as sqlx::FromRow<PgRow>>::from_row(row).map_err(corrupt)?;
    let reason: String = row.try_get("reason").map_err(corrupt)?;
    let dead_lettered_at: DateTime<Utc> = row.try_get("dead_lettered_at").map_err(corrupt)?;

    Ok(DeadLetterEntry {
        entry: base.into_entry(EntryStatus::Failed, None, dead_lettered_at)?,
        reason,
        dead_lettered_at,
    })
}
