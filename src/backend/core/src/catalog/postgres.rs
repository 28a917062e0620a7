//! PostgreSQL catalog store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::instrument;
use uuid::Uuid;

use super::{
    Backup, CatalogStore, EmailSchedule, Enrollment, EnrollmentUpdate, Newsletter, ReadyEnrollment,
    SequenceEmail, Video, VideoReady,
};
use crate::error::{LecternError, Result};

#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn expect_row(rows_affected: u64, entity: &str, id: &str) -> Result<()> {
    if rows_affected == 0 {
        Err(LecternError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self))]
    async fn get_video(&self, id: &str) -> Result<Video> {
        let row = sqlx::query_as::<_, VideoRow>(
            r#"
            SELECT id, course_id, title, storage_link, processing_status, processing_started_at,
                   processing_completed_at, processing_failed_at, processing_error, m3u8,
                   hls_master_key, duration, processing_metadata
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LecternError::not_found("video", id))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn mark_video_processing(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET processing_status = 'processing', processing_started_at = $2, processing_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "video", id)
    }

    #[instrument(skip(self, ready))]
    async fn mark_video_ready(&self, id: &str, ready: &VideoReady, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET processing_status = 'ready',
                processing_completed_at = $2,
                processing_error = NULL,
                m3u8 = $3,
                storage_link = $3,
                hls_master_key = $4,
                duration = $5,
                processing_metadata = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(&ready.m3u8)
        .bind(&ready.hls_master_key)
        .bind(ready.duration)
        .bind(&ready.metadata)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "video", id)
    }

    #[instrument(skip(self))]
    async fn mark_video_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET processing_status = 'failed', processing_failed_at = $2, processing_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "video", id)
    }

    #[instrument(skip(self))]
    async fn fail_stale_videos(&self, cutoff: DateTime<Utc>, reason: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET processing_status = 'failed', processing_failed_at = $2, processing_error = $3
            WHERE processing_status = 'processing'
              AND (processing_started_at IS NULL OR processing_started_at < $1)
            "#,
        )
        .bind(cutoff)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_newsletter(&self, id: &str) -> Result<Newsletter> {
        let row = sqlx::query_as::<_, NewsletterRow>(
            r#"
            SELECT id, subject, content, status, recipients, delivered, message_ids, sent_at
            FROM newsletters
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LecternError::not_found("newsletter", id))?;

        row.try_into()
    }

    #[instrument(skip(self, emails), fields(count = emails.len()))]
    async fn append_delivery(&self, id: &str, emails: &[String], message_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE newsletters
            SET delivered = delivered || $2::text[],
                message_ids = array_append(message_ids, $3),
                status = 'sending'
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(emails)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "newsletter", id)
    }

    #[instrument(skip(self))]
    async fn mark_newsletter_sent(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE newsletters SET status = 'sent', sent_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), "newsletter", id)
    }

    #[instrument(skip(self))]
    async fn blacklisted_emails(&self) -> Result<HashSet<String>> {
        let emails: Vec<String> =
            sqlx::query_scalar("SELECT lower(trim(email)) FROM subscribers WHERE blacklisted")
                .fetch_all(&self.pool)
                .await?;
        Ok(emails.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn ready_enrollments(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEnrollment>> {
        let rows = sqlx::query_as::<_, ReadyEnrollmentRow>(
            r#"
            SELECT e.id, e.sequence_id, e.subscriber_id, e.status, e.current_email_index,
                   e.emails_sent, e.next_email_at, e.completed_at,
                   s.name AS sequence_name, sub.email AS subscriber_email, sub.blacklisted
            FROM sequence_enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            JOIN subscribers sub ON sub.id = e.subscriber_id
            WHERE e.status = 'active' AND e.next_email_at <= $1
            ORDER BY e.next_email_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let sequence_ids: Vec<String> = rows
            .iter()
            .map(|row| row.sequence_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let email_rows = sqlx::query_as::<_, SequenceEmailRow>(
            r#"
            SELECT id, sequence_id, position, subject, content, scheduling_type, delay_days, specific_date
            FROM sequence_emails
            WHERE sequence_id = ANY($1)
            ORDER BY sequence_id, position
            "#,
        )
        .bind(&sequence_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut emails_by_sequence: HashMap<String, Vec<SequenceEmail>> = HashMap::new();
        for row in email_rows {
            let email = SequenceEmail::try_from(row)?;
            emails_by_sequence
                .entry(email.sequence_id.clone())
                .or_default()
                .push(email);
        }

        rows.into_iter()
            .map(|row| -> Result<ReadyEnrollment> {
                let emails = emails_by_sequence
                    .get(&row.sequence_id)
                    .cloned()
                    .unwrap_or_default();
                Ok(ReadyEnrollment {
                    sequence_name: row.sequence_name,
                    subscriber_email: row.subscriber_email,
                    blacklisted: row.blacklisted,
                    emails,
                    enrollment: Enrollment {
                        id: row.id,
                        sequence_id: row.sequence_id,
                        subscriber_id: row.subscriber_id,
                        status: row.status.parse()?,
                        current_email_index: row.current_email_index,
                        emails_sent: row.emails_sent,
                        next_email_at: row.next_email_at,
                        completed_at: row.completed_at,
                    },
                })
            })
            .collect()
    }

    #[instrument(skip(self, update))]
    async fn update_enrollment(&self, id: &str, update: &EnrollmentUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sequence_enrollments
            SET status = $2, current_email_index = $3, emails_sent = $4,
                next_email_at = $5, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.current_email_index)
        .bind(update.emails_sent)
        .bind(update.next_email_at)
        .bind(update.completed_at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "enrollment", id)
    }

    #[instrument(skip(self, backup), fields(backup_id = %backup.id))]
    async fn create_backup(&self, backup: &Backup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups (id, filename, s3_key, size_bytes, status, error, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(backup.id)
        .bind(&backup.filename)
        .bind(&backup.s3_key)
        .bind(backup.size_bytes)
        .bind(backup.status.as_str())
        .bind(&backup.error)
        .bind(backup.created_at)
        .bind(backup.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backups SET status = 'COMPLETED', size_bytes = $2, completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(size_bytes)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "backup", &id.to_string())
    }

    #[instrument(skip(self))]
    async fn fail_backup(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE backups SET status = 'FAILED', error = $2, completed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), "backup", &id.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct VideoRow {
    id: String,
    course_id: String,
    title: String,
    storage_link: Option<String>,
    processing_status: String,
    processing_started_at: Option<DateTime<Utc>>,
    processing_completed_at: Option<DateTime<Utc>>,
    processing_failed_at: Option<DateTime<Utc>>,
    processing_error: Option<String>,
    m3u8: Option<String>,
    hls_master_key: Option<String>,
    duration: Option<f64>,
    processing_metadata: Option<serde_json::Value>,
}

impl TryFrom<VideoRow> for Video {
    type Error = LecternError;

    fn try_from(row: VideoRow) -> Result<Self> {
        Ok(Self {
            processing_status: row.processing_status.parse()?,
            id: row.id,
            course_id: row.course_id,
            title: row.title,
            storage_link: row.storage_link,
            processing_started_at: row.processing_started_at,
            processing_completed_at: row.processing_completed_at,
            processing_failed_at: row.processing_failed_at,
            processing_error: row.processing_error,
            m3u8: row.m3u8,
            hls_master_key: row.hls_master_key,
            duration: row.duration,
            processing_metadata: row.processing_metadata,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NewsletterRow {
    id: String,
    subject: String,
    content: String,
    status: String,
    recipients: Vec<String>,
    delivered: Vec<String>,
    message_ids: Vec<String>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<NewsletterRow> for Newsletter {
    type Error = LecternError;

    fn try_from(row: NewsletterRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            subject: row.subject,
            content: row.content,
            recipients: row.recipients,
            delivered: row.delivered,
            message_ids: row.message_ids,
            sent_at: row.sent_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReadyEnrollmentRow {
    id: String,
    sequence_id: String,
    subscriber_id: String,
    status: String,
    current_email_index: i32,
    emails_sent: i32,
    next_email_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    sequence_name: String,
    subscriber_email: String,
    blacklisted: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct SequenceEmailRow {
    id: String,
    sequence_id: String,
    position: i32,
    subject: String,
    content: String,
    scheduling_type: String,
    delay_days: i32,
    specific_date: Option<DateTime<Utc>>,
}

impl TryFrom<SequenceEmailRow> for SequenceEmail {
    type Error = LecternError;

    fn try_from(row: SequenceEmailRow) -> Result<Self> {
        let schedule = match (row.scheduling_type.as_str(), row.specific_date) {
            ("specific_date", Some(at)) => EmailSchedule::SpecificDate { at },
            ("specific_date", None) => {
                return Err(LecternError::validation(format!(
                    "sequence email {} is date-scheduled without a date",
                    row.id
                )))
            }
            _ => EmailSchedule::Delay {
                delay_days: row.delay_days,
            },
        };
        Ok(Self {
            id: row.id,
            sequence_id: row.sequence_id,
            position: row.position,
            subject: row.subject,
            content: row.content,
            schedule,
        })
    }
}
