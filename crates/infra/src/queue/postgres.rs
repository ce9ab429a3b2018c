//! Postgres-backed email queue (`email_queue` table).
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database / PoolClosed / Io / other | `Storage` |
//! | Column decode, unknown status text, negative attempts | `Decode` |
//!
//! `update_job` on a missing id reports `NotFound` (zero rows affected).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use ledermail_core::{EmailJob, EmailJobId, EmailStatus, JobUpdate, NewEmail};

use super::{EligibilityQuery, EmailQueueStore, QueueStats, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_email_queue.sql");

const COLUMNS: &str = "id, to_email, to_name, subject, body, metadata, status, attempts, \
                       created_at, updated_at, next_attempt_at, sent_at, error";

/// Postgres email queue.
///
/// The claim is a single conditional `UPDATE ... RETURNING`, so concurrent
/// workers (or a manual trigger racing the scheduler) never send the same
/// row twice.
#[derive(Debug, Clone)]
pub struct PostgresEmailQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresEmailQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `email_queue` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EmailQueueStore for PostgresEmailQueueStore {
    #[instrument(skip(self, email), fields(to = %email.to_email), err)]
    async fn enqueue(&self, email: NewEmail) -> Result<EmailJob, StoreError> {
        let job = EmailJob::new(email, Utc::now());

        sqlx::query(&format!(
            "INSERT INTO email_queue ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.to_email)
        .bind(&job.to_name)
        .bind(&job.subject)
        .bind(&job.body)
        .bind(&job.metadata)
        .bind(job.status.as_str())
        .bind(attempts_to_db(job.attempts)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.next_attempt_at)
        .bind(job.sent_at)
        .bind(&job.error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(limit = query.limit), err)]
    async fn fetch_eligible(&self, query: &EligibilityQuery) -> Result<Vec<EmailJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_queue \
             WHERE (status = 'pending' OR ($1 AND status = 'failed')) \
               AND attempts < $2 \
               AND next_attempt_at <= $3 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $4"
        ))
        .bind(query.include_failed)
        .bind(attempts_to_db(query.max_attempts)?)
        .bind(query.now)
        .bind(limit_to_db(query.limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_eligible", e))?;

        decode_rows(&rows)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim(
        &self,
        id: EmailJobId,
        max_attempts: u32,
        include_failed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailJob>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE email_queue \
             SET status = 'processing', attempts = attempts + 1, updated_at = $4 \
             WHERE id = $1 \
               AND (status = 'pending' OR ($3 AND status = 'failed')) \
               AND attempts < $2 \
             RETURNING {COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(attempts_to_db(max_attempts)?)
        .bind(include_failed)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, update), fields(job_id = %id), err)]
    async fn update_job(
        &self,
        id: EmailJobId,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE email_queue SET updated_at = ");
        builder.push_bind(now);

        if let Some(status) = update.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(attempts) = update.attempts {
            builder.push(", attempts = ").push_bind(attempts_to_db(attempts)?);
        }
        if let Some(sent_at) = update.sent_at {
            builder.push(", sent_at = ").push_bind(sent_at);
        }
        if let Some(error) = &update.error {
            builder.push(", error = ").push_bind(error.clone());
        }
        if let Some(next_attempt_at) = update.next_attempt_at {
            builder.push(", next_attempt_at = ").push_bind(next_attempt_at);
        }
        builder.push(" WHERE id = ").push_bind(id.as_uuid());

        let result = builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: EmailJobId) -> Result<Option<EmailJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM email_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, limit: usize) -> Result<Vec<EmailJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_queue ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit_to_db(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_recent", e))?;

        decode_rows(&rows)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, max_attempts: u32) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n, COUNT(*) FILTER (WHERE attempts >= $1) AS spent \
             FROM email_queue GROUP BY status",
        )
        .bind(attempts_to_db(max_attempts)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let status: EmailStatus = status
                .parse()
                .map_err(|e: ledermail_core::DomainError| StoreError::Decode(e.to_string()))?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            let spent: i64 = row.try_get("spent").map_err(decode_error)?;

            stats.count(status, n.max(0) as u64);
            if status == EmailStatus::Failed {
                stats.exhausted = spent.max(0) as u64;
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE email_queue SET status = 'pending', updated_at = $2 \
             WHERE status = 'processing' AND updated_at < $1",
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        Ok(result.rows_affected())
    }
}

fn attempts_to_db(attempts: u32) -> Result<i32, StoreError> {
    i32::try_from(attempts)
        .map_err(|_| StoreError::Storage(format!("attempt count {attempts} out of range")))
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn decode_rows(rows: &[PgRow]) -> Result<Vec<EmailJob>, StoreError> {
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<EmailJob, StoreError> {
    EmailJobRow::from_row(row)
        .map_err(decode_error)?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct EmailJobRow {
    id: uuid::Uuid,
    to_email: String,
    to_name: Option<String>,
    subject: String,
    body: String,
    metadata: serde_json::Value,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for EmailJobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EmailJobRow {
            id: row.try_get("id")?,
            to_email: row.try_get("to_email")?,
            to_name: row.try_get("to_name")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            metadata: row.try_get("metadata")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            sent_at: row.try_get("sent_at")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<EmailJobRow> for EmailJob {
    type Error = StoreError;

    fn try_from(row: EmailJobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<EmailStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::Decode(format!("negative attempts: {}", row.attempts)))?;

        Ok(EmailJob {
            id: EmailJobId::from_uuid(row.id),
            to_email: row.to_email,
            to_name: row.to_name,
            subject: row.subject,
            body: row.body,
            metadata: row.metadata,
            status,
            attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_attempt_at: row.next_attempt_at,
            sent_at: row.sent_at,
            error: row.error,
        })
    }
}
