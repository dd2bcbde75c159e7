//! Postgres-backed queue store.
//!
//! ## Claiming
//!
//! [`PostgresQueueStore::claim_batch`] is one statement:
//!
//! ```sql
//! UPDATE delivery_records SET status = 'LOCKED', locked_by = $1, ...
//! WHERE id IN (SELECT id ... ORDER BY created_at LIMIT $4 FOR UPDATE SKIP LOCKED)
//! ```
//!
//! The inner select row-locks its candidates and skips rows another claimer
//! has already locked, so concurrent claimers partition the ready set instead
//! of contending for it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueStoreError |
//! |------------|----------------------|-----------------|
//! | Database (check violation) | `23514` | `Constraint` |
//! | Database (not-null violation) | `23502` | `Constraint` |
//! | Database (query canceled, e.g. statement timeout) | `57014` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use batchrelay_core::{
    BatchId, DeliveryRecord, DeliveryStatus, ErrorCode, NewDeliveryRecord, OwnerId, RecordId,
    RecordUpdate, RequestId,
};

use super::{ABANDONED_MESSAGE, QueueStats, QueueStore, QueueStoreError};

const RECORD_COLUMNS: &str = "id, batch_id, request_id, file_name, payload, error_message, error_code, \
     retry_count, max_retries, status, next_retry_at, locked_by, locked_at, created_at, updated_at, version";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS delivery_records (
        id BIGSERIAL PRIMARY KEY,
        batch_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        file_name TEXT NULL,
        payload TEXT NOT NULL,
        error_message TEXT NULL,
        error_code TEXT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries INTEGER NOT NULL CHECK (max_retries >= 0),
        status TEXT NOT NULL CHECK (status IN ('PENDING', 'LOCKED', 'RETRYING', 'SUCCESS', 'FAILED')),
        next_retry_at TIMESTAMPTZ NULL,
        locked_by TEXT NULL,
        locked_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS delivery_records_status_next_retry_idx ON delivery_records (status, next_retry_at)",
    "CREATE INDEX IF NOT EXISTS delivery_records_batch_id_idx ON delivery_records (batch_id)",
    "CREATE INDEX IF NOT EXISTS delivery_records_owner_status_idx ON delivery_records (locked_by, status)",
];

/// Pool settings for [`connect`].
#[derive(Debug, Clone)]
pub struct PgSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Applied per connection as `statement_timeout`; bounds the claim query.
    pub statement_timeout: Duration,
}

/// Open a pool with a bounded acquire wait and a per-statement timeout.
pub async fn connect(settings: &PgSettings) -> Result<PgPool, QueueStoreError> {
    let options: PgConnectOptions = settings
        .url
        .parse()
        .map_err(|e: sqlx::Error| QueueStoreError::Storage(format!("invalid database url: {e}")))?;
    let statement_timeout = format!("{}ms", settings.statement_timeout.as_millis());
    let options = options.options([("statement_timeout", statement_timeout.as_str())]);

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), QueueStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch_records(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_record).collect()
    }
}

#[async_trait::async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, record), fields(batch_id = %record.batch_id), err)]
    async fn insert(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord, QueueStoreError> {
        let sql = format!(
            r#"
            INSERT INTO delivery_records (
                batch_id, request_id, file_name, payload, error_message, error_code,
                retry_count, max_retries, status, next_retry_at, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, 'PENDING', $8, $9, $9, 0)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(record.batch_id.as_str())
            .bind(record.request_id.as_str())
            .bind(record.file_name.as_deref())
            .bind(&record.payload)
            .bind(record.error_message.as_deref())
            .bind(record.error_code.as_deref())
            .bind(to_i32(record.max_retries))
            .bind(record.next_retry_at)
            .bind(record.created_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        decode_record(&row)
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn get(&self, id: RecordId) -> Result<Option<DeliveryRecord>, QueueStoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM delivery_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(
        skip(self, update),
        fields(record_id = %id, from = %update.expected_status, to = %update.status),
        err
    )]
    async fn update_state(
        &self,
        id: RecordId,
        update: &RecordUpdate,
        expected_version: Option<i64>,
    ) -> Result<DeliveryRecord, QueueStoreError> {
        update.expected_status.transition(update.status)?;

        let sql = format!(
            r#"
            UPDATE delivery_records
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                locked_by = $5,
                locked_at = $6,
                error_message = $7,
                error_code = $8,
                updated_at = $9,
                version = version + 1
            WHERE id = $1
              AND status = $10
              AND locked_by IS NOT DISTINCT FROM $11
              AND ($12::BIGINT IS NULL OR version = $12)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(update.status.as_str())
            .bind(to_i32(update.retry_count))
            .bind(update.next_retry_at)
            .bind(update.locked_by.as_ref().map(OwnerId::as_str))
            .bind(update.locked_at)
            .bind(update.error_message.as_deref())
            .bind(update.error_code.as_deref())
            .bind(update.updated_at)
            .bind(update.expected_status.as_str())
            .bind(update.expected_owner.as_ref().map(OwnerId::as_str))
            .bind(expected_version)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_state", e))?;

        match row {
            Some(row) => decode_record(&row),
            None => match self.get(id).await? {
                None => Err(QueueStoreError::NotFound(id)),
                Some(current) => Err(QueueStoreError::Conflict {
                    id,
                    reason: format!(
                        "expected {} (version {:?}), found {} version {} held by {:?}",
                        update.expected_status,
                        expected_version,
                        current.status,
                        current.version,
                        current.locked_by.as_ref().map(OwnerId::as_str),
                    ),
                }),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn find_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delivery_records
            WHERE status IN ('PENDING', 'RETRYING', 'LOCKED')
              AND retry_count < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND (locked_by IS NULL OR locked_at < $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let query = sqlx::query(&sql).bind(now).bind(lease_expiry).bind(to_limit(limit));
        self.fetch_records("find_ready_for_retry", query).await
    }

    #[instrument(skip(self), fields(owner = %owner, status = %status), err)]
    async fn find_by_owner_and_status(
        &self,
        owner: &OwnerId,
        status: DeliveryStatus,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delivery_records
            WHERE locked_by = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            "#
        );
        let query = sqlx::query(&sql).bind(owner.as_str()).bind(status.as_str());
        self.fetch_records("find_by_owner_and_status", query).await
    }

    #[instrument(skip(self), fields(owner = %owner, claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        owner: &OwnerId,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'LOCKED',
                locked_by = $1,
                locked_at = $2,
                updated_at = $2,
                version = version + 1
            WHERE id IN (
                SELECT id
                FROM delivery_records
                WHERE status IN ('PENDING', 'RETRYING', 'LOCKED')
                  AND retry_count < max_retries
                  AND (next_retry_at IS NULL OR next_retry_at <= $2)
                  AND (locked_by IS NULL OR locked_at < $3)
                ORDER BY created_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(owner.as_str())
        .bind(now)
        .bind(lease_expiry)
        .bind(to_limit(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let claimed = result.rows_affected();
        Span::current().record("claimed", claimed);
        Ok(claimed)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn find_by_batch_id(&self, batch_id: &BatchId) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE batch_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let query = sqlx::query(&sql).bind(batch_id.as_str());
        self.fetch_records("find_by_batch_id", query).await
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, QueueStoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delivery_records
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        );
        let query = sqlx::query(&sql).bind(status.as_str()).bind(to_limit(limit));
        self.fetch_records("list_by_status", query).await
    }

    #[instrument(skip(self), fields(failed = tracing::field::Empty), err)]
    async fn fail_abandoned(
        &self,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<u64, QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'FAILED',
                error_code = $3,
                error_message = $4,
                next_retry_at = NULL,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $1,
                version = version + 1
            WHERE status IN ('LOCKED', 'RETRYING')
              AND retry_count >= max_retries
              AND locked_by IS NOT NULL
              AND locked_at < $2
            "#,
        )
        .bind(now)
        .bind(lease_expiry)
        .bind(ErrorCode::LEASE_EXPIRED)
        .bind(ABANDONED_MESSAGE)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_abandoned", e))?;

        let failed = result.rows_affected();
        Span::current().record("failed", failed);
        Ok(failed)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM delivery_records GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| QueueStoreError::Decode(e.to_string()))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| QueueStoreError::Decode(e.to_string()))?;
            let status = status
                .parse::<DeliveryStatus>()
                .map_err(|e| QueueStoreError::Decode(e.to_string()))?;
            stats.add(status, total.max(0) as u64);
        }
        Ok(stats)
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Raw row shape of `delivery_records`.
#[derive(Debug)]
struct DeliveryRecordRow {
    id: i64,
    batch_id: String,
    request_id: String,
    file_name: Option<String>,
    payload: String,
    error_message: Option<String>,
    error_code: Option<String>,
    retry_count: i32,
    max_retries: i32,
    status: String,
    next_retry_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for DeliveryRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            request_id: row.try_get("request_id")?,
            file_name: row.try_get("file_name")?,
            payload: row.try_get("payload")?,
            error_message: row.try_get("error_message")?,
            error_code: row.try_get("error_code")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            status: row.try_get("status")?,
            next_retry_at: row.try_get("next_retry_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<DeliveryRecordRow> for DeliveryRecord {
    type Error = QueueStoreError;

    fn try_from(row: DeliveryRecordRow) -> Result<Self, Self::Error> {
        let decode = |e: batchrelay_core::DomainError| QueueStoreError::Decode(e.to_string());
        Ok(DeliveryRecord {
            id: RecordId::new(row.id),
            batch_id: BatchId::parse(row.batch_id).map_err(decode)?,
            request_id: RequestId::parse(row.request_id).map_err(decode)?,
            file_name: row.file_name,
            payload: row.payload,
            error_message: row.error_message,
            error_code: row.error_code,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            status: row.status.parse().map_err(decode)?,
            next_retry_at: row.next_retry_at,
            locked_by: row.locked_by.map(OwnerId::parse).transpose().map_err(decode)?,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

fn decode_record(row: &PgRow) -> Result<DeliveryRecord, QueueStoreError> {
    DeliveryRecordRow::from_row(row)
        .map_err(|e| QueueStoreError::Decode(format!("failed to read delivery row: {e}")))?
        .try_into()
}

/// Map SQLx errors to queue store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") | Some("23502") => QueueStoreError::Constraint(msg),
                _ => QueueStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            QueueStoreError::Storage(format!("timed out acquiring a connection in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            QueueStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
