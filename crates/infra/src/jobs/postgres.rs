//! Postgres-backed job request store.
//!
//! Claims run as a single statement: a CTE picks the best eligible row with
//! `FOR UPDATE SKIP LOCKED`, and the outer `UPDATE` only applies while the row
//! still has the status the CTE read. Concurrent pollers therefore never block
//! on each other and never claim the same row twice.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (check constraint violation) | `23514` | `Storage` (invalid column value) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use clinicflow_core::{JobPriority, JobRequestId, JobStatus};

use super::store::{JobRequestStore, JobStats, JobStoreError, ORPHANED_RUNNING_MESSAGE};
use super::types::{JobFilter, JobRequest, JobRequestPage, NewJobRequest, Pagination, SortOrder};

const SCHEMA: &str = include_str!("../../migrations/0001_job_requests.sql");

/// Postgres-backed job request store.
#[derive(Debug, Clone)]
pub struct PostgresJobRequestStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a connection pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `job_requests` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_job(
        &self,
        operation: &str,
        id: JobRequestId,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM job_requests WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    /// Resolve an outcome write that matched no running row.
    async fn guard_miss(
        &self,
        operation: &str,
        id: JobRequestId,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        match self.fetch_job(operation, id).await? {
            Some(_) => Ok(None),
            None => Err(JobStoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl JobRequestStore for PostgresJobRequestStore {
    #[instrument(skip(self, new), fields(job_type = %new.job_type, priority = %new.priority), err)]
    async fn enqueue(&self, new: NewJobRequest) -> Result<JobRequest, JobStoreError> {
        let job = JobRequest::from_new(new, Utc::now());
        let max_attempts = i32::try_from(job.max_attempts).map_err(|_| {
            JobStoreError::Storage(format!(
                "invalid job request value: max_attempts {} exceeds {}",
                job.max_attempts,
                i32::MAX
            ))
        })?;

        let row = sqlx::query(
            r#"
            INSERT INTO job_requests (
                id, type, priority, status, origin, payload,
                requested_by, requested_by_name, requested_by_role,
                attempts, max_attempts, next_run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, $12, $12)
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(job.priority.as_str())
        .bind(job.status.as_str())
        .bind(&job.origin)
        .bind(&job.payload)
        .bind(&job.requested_by)
        .bind(&job.requested_by_name)
        .bind(&job.requested_by_role)
        .bind(max_attempts)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        decode_job(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn find_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        self.fetch_job("find_by_id", id).await
    }

    #[instrument(skip(self, exclude), fields(excluded = exclude.len()), err)]
    async fn claim_next_excluding(
        &self,
        priorities: Option<&[JobPriority]>,
        exclude: &[JobRequestId],
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let tiers: Option<Vec<String>> =
            priorities.map(|p| p.iter().map(|t| t.as_str().to_string()).collect());
        let excluded: Vec<uuid::Uuid> = exclude.iter().map(|id| *id.as_uuid()).collect();

        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id, status
                FROM job_requests
                WHERE (
                        status = 'pending'
                        OR (status = 'waiting' AND (next_run_at IS NULL OR next_run_at <= now()))
                    )
                    AND ($1::text[] IS NULL OR priority = ANY($1))
                    AND NOT (id = ANY($2::uuid[]))
                ORDER BY
                    CASE priority
                        WHEN 'critical' THEN 0
                        WHEN 'high' THEN 1
                        WHEN 'normal' THEN 2
                        ELSE 3
                    END,
                    next_run_at ASC NULLS FIRST,
                    created_at ASC,
                    id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_requests AS j
            SET status = 'running',
                attempts = j.attempts + 1,
                last_attempt_at = now(),
                updated_at = now()
            FROM candidate AS c
            WHERE j.id = c.id AND j.status = c.status
            RETURNING j.*
            "#,
        )
        .bind(tiers)
        .bind(excluded)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id, status
                FROM job_requests
                WHERE id = $1
                    AND (
                        status = 'pending'
                        OR (status = 'waiting' AND (next_run_at IS NULL OR next_run_at <= now()))
                    )
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_requests AS j
            SET status = 'running',
                attempts = j.attempts + 1,
                last_attempt_at = now(),
                updated_at = now()
            FROM candidate AS c
            WHERE j.id = c.id AND j.status = c.status
            RETURNING j.*
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_by_id", e))?;

        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, result_summary), fields(job_id = %id), err)]
    async fn mark_waiting(
        &self,
        id: JobRequestId,
        next_run_at: DateTime<Utc>,
        error_message: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'waiting',
                next_run_at = $2,
                error_message = $3,
                result_summary = COALESCE($4, result_summary),
                updated_at = now()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(next_run_at)
        .bind(error_message)
        .bind(result_summary)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_waiting", e))?;

        match row {
            Some(row) => decode_job(&row).map(Some),
            None => self.guard_miss("mark_waiting", id).await,
        }
    }

    #[instrument(skip(self, result_summary), fields(job_id = %id), err)]
    async fn mark_completed(
        &self,
        id: JobRequestId,
        sync_log_id: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'completed',
                completed_at = now(),
                next_run_at = NULL,
                error_message = NULL,
                sync_log_id = $2,
                result_summary = $3,
                updated_at = now()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(sync_log_id)
        .bind(result_summary)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        match row {
            Some(row) => decode_job(&row).map(Some),
            None => self.guard_miss("mark_completed", id).await,
        }
    }

    #[instrument(skip(self, result_summary), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: JobRequestId,
        error_message: String,
        next_run_at: Option<DateTime<Utc>>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'failed',
                error_message = $2,
                next_run_at = $3,
                result_summary = COALESCE($4, result_summary),
                updated_at = now()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(error_message)
        .bind(next_run_at)
        .bind(result_summary)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match row {
            Some(row) => decode_job(&row).map(Some),
            None => self.guard_miss("mark_failed", id).await,
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_cancelled(&self, id: JobRequestId) -> Result<JobRequest, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'cancelled', updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'waiting')
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_cancelled", e))?;

        if let Some(row) = row {
            return decode_job(&row);
        }

        match self.fetch_job("mark_cancelled", id).await? {
            Some(job) => Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Cancelled,
            }),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn set_pending(
        &self,
        id: JobRequestId,
        next_run_at: Option<DateTime<Utc>>,
        priority: Option<JobPriority>,
    ) -> Result<JobRequest, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'pending',
                next_run_at = $2,
                completed_at = NULL,
                priority = COALESCE($3, priority),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(next_run_at)
        .bind(priority.map(JobPriority::as_str))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_pending", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn reset_orphaned_running(&self) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET status = 'waiting',
                next_run_at = now(),
                error_message = $1,
                updated_at = now()
            WHERE status = 'running'
            "#,
        )
        .bind(ORPHANED_RUNNING_MESSAGE)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_orphaned_running", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: JobFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<JobRequestPage, JobStoreError> {
        let status_param = filter.status.map(JobStatus::as_str);
        let priority_param = filter.priority.map(JobPriority::as_str);
        let type_param = filter.job_type.as_deref();

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM job_requests
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR priority = $2)
                AND ($3::text IS NULL OR type = $3)
            "#,
        )
        .bind(status_param)
        .bind(priority_param)
        .bind(type_param)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let direction = match order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            r#"
            SELECT *
            FROM job_requests
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR priority = $2)
                AND ($3::text IS NULL OR type = $3)
            ORDER BY created_at {direction}, id {direction}
            LIMIT $4 OFFSET $5
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(status_param)
            .bind(priority_param)
            .bind(type_param)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        let total = total.max(0) as u64;

        Ok(JobRequestPage {
            jobs,
            total,
            pagination,
            has_more: total > u64::from(pagination.offset) + u64::from(pagination.limit),
        })
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM job_requests GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

fn decode_job(row: &PgRow) -> Result<JobRequest, JobStoreError> {
    JobRequestRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {}", e)))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => JobStoreError::Storage(format!("invalid job request value: {}", msg)),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRequestRow {
    id: uuid::Uuid,
    job_type: String,
    priority: String,
    status: String,
    origin: Option<String>,
    payload: Value,
    requested_by: Option<String>,
    requested_by_name: Option<String>,
    requested_by_role: Option<String>,
    attempts: i32,
    max_attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    sync_log_id: Option<String>,
    error_message: Option<String>,
    result_summary: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRequestRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRequestRow {
            id: row.try_get("id")?,
            job_type: row.try_get("type")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            origin: row.try_get("origin")?,
            payload: row.try_get("payload")?,
            requested_by: row.try_get("requested_by")?,
            requested_by_name: row.try_get("requested_by_name")?,
            requested_by_role: row.try_get("requested_by_role")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_run_at: row.try_get("next_run_at")?,
            completed_at: row.try_get("completed_at")?,
            sync_log_id: row.try_get("sync_log_id")?,
            error_message: row.try_get("error_message")?,
            result_summary: row.try_get("result_summary")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRequestRow> for JobRequest {
    type Error = JobStoreError;

    fn try_from(row: JobRequestRow) -> Result<Self, Self::Error> {
        let priority = row
            .priority
            .parse::<JobPriority>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        Ok(JobRequest {
            id: JobRequestId::from_uuid(row.id),
            job_type: row.job_type,
            priority,
            status,
            origin: row.origin,
            payload: row.payload,
            requested_by: row.requested_by,
            requested_by_name: row.requested_by_name,
            requested_by_role: row.requested_by_role,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            last_attempt_at: row.last_attempt_at,
            next_run_at: row.next_run_at,
            completed_at: row.completed_at,
            sync_log_id: row.sync_log_id,
            error_message: row.error_message,
            result_summary: row.result_summary,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
