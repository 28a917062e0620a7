//! PostgreSQL job store.
//!
//! Every lease transition is a single conditional `UPDATE`; the row count (or
//! `RETURNING` row) tells the caller whether it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::job::{chrono_duration, JobId, JobPriority, JobRecord, Lease};
use super::store::{JobFilter, JobStore, Registration, RunUpdate};
use crate::error::Result;

const COLUMNS: &str = "id, name, data, priority, next_run_at, last_run_at, last_finished_at, \
     lock_token, locked_at, lock_expires_at, fail_count, fail_reason, failed_at, \
     repeat_interval, created_at";

/// Job store over the `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        let (lock_token, locked_at, lock_expires_at) = match &job.lease {
            Some(lease) => (Some(lease.token), Some(lease.locked_at), Some(lease.expires_at)),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, data, priority, next_run_at, last_run_at, last_finished_at,
                              lock_token, locked_at, lock_expires_at, fail_count, fail_reason,
                              failed_at, repeat_interval, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job.priority.as_i16())
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(lock_token)
        .bind(locked_at)
        .bind(lock_expires_at)
        .bind(job.fail_count as i32)
        .bind(&job.fail_reason)
        .bind(job.failed_at)
        .bind(&job.repeat_interval)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Relies on the partial unique index `jobs_recurring_name_idx`; the
    /// conditional `DO UPDATE` leaves a matching row (and its lease) alone.
    #[instrument(skip(self, job), fields(job_name = %job.name))]
    async fn upsert_recurring(&self, job: &JobRecord) -> Result<Registration> {
        let upserted: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            INSERT INTO jobs (id, name, data, priority, next_run_at, repeat_interval, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) WHERE repeat_interval IS NOT NULL
            DO UPDATE SET data = EXCLUDED.data,
                          priority = EXCLUDED.priority,
                          repeat_interval = EXCLUDED.repeat_interval,
                          next_run_at = EXCLUDED.next_run_at
            WHERE jobs.repeat_interval IS DISTINCT FROM EXCLUDED.repeat_interval
               OR jobs.data <> EXCLUDED.data
               OR jobs.next_run_at IS NULL
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(job.id.0)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job.priority.as_i16())
        .bind(job.next_run_at)
        .bind(&job.repeat_interval)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match upserted {
            Some((id, true)) => Ok(Registration::Inserted(JobId(id))),
            Some((id, false)) => Ok(Registration::Rescheduled(JobId(id))),
            None => {
                let (id,): (Uuid,) =
                    sqlx::query_as("SELECT id FROM jobs WHERE name = $1 AND repeat_interval IS NOT NULL")
                        .bind(&job.name)
                        .fetch_one(&self.pool)
                        .await?;
                Ok(Registration::Unchanged(JobId(id)))
            }
        }
    }

    #[instrument(skip(self))]
    async fn due(&self, names: &[String], now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM jobs
            WHERE name = ANY($1)
              AND next_run_at <= $2
              AND (lock_expires_at IS NULL OR lock_expires_at <= $2)
            ORDER BY priority DESC, next_run_at ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(names)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn try_claim(
        &self,
        id: JobId,
        observed: Option<Uuid>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET lock_token = $3, locked_at = $4, lock_expires_at = $5, last_run_at = $4
            WHERE id = $1
              AND lock_token IS NOT DISTINCT FROM $2
              AND (lock_expires_at IS NULL OR lock_expires_at <= $4)
              AND next_run_at <= $4
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.0)
            .bind(observed)
            .bind(Uuid::new_v4())
            .bind(now)
            .bind(now + chrono_duration(lease))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(JobRecord::from))
    }

    #[instrument(skip(self, token))]
    async fn renew(&self, id: JobId, token: Uuid, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET lock_expires_at = $3 WHERE id = $1 AND lock_token = $2")
            .bind(id.0)
            .bind(token)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, update))]
    async fn finish(&self, id: JobId, token: Uuid, update: &RunUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_token = NULL,
                locked_at = NULL,
                lock_expires_at = NULL,
                last_finished_at = $3,
                next_run_at = $4,
                fail_count = CASE WHEN $5::text IS NULL THEN fail_count ELSE fail_count + 1 END,
                fail_reason = COALESCE($5, fail_reason),
                failed_at = CASE WHEN $5::text IS NULL THEN failed_at ELSE $3 END
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(id.0)
        .bind(token)
        .bind(update.finished_at)
        .bind(update.next_run_at)
        .bind(&update.fail_reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token))]
    async fn remove(&self, id: JobId, token: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND lock_token = $2")
            .bind(id.0)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn find(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::jsonb IS NULL OR data @> $2)
            ORDER BY created_at ASC
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&filter.name)
            .bind(&filter.data)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, filter: &JobFilter) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE ($1::text IS NULL OR name = $1) AND ($2::jsonb IS NULL OR data @> $2)",
        )
        .bind(&filter.name)
        .bind(&filter.data)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Row type for reading jobs from the database.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    data: serde_json::Value,
    priority: i16,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    lock_token: Option<Uuid>,
    locked_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
    fail_count: i32,
    fail_reason: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    repeat_interval: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        let lease = match (row.lock_token, row.locked_at, row.lock_expires_at) {
            (Some(token), Some(locked_at), Some(expires_at)) => Some(Lease {
                token,
                locked_at,
                expires_at,
            }),
            _ => None,
        };

        Self {
            id: JobId(row.id),
            name: row.name,
            data: row.data,
            priority: JobPriority::from_i16(row.priority),
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            last_finished_at: row.last_finished_at,
            lease,
            fail_count: row.fail_count.max(0) as u32,
            fail_reason: row.fail_reason,
            failed_at: row.failed_at,
            repeat_interval: row.repeat_interval,
            created_at: row.created_at,
        }
    }
}
