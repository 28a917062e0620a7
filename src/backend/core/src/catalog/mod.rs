//! Catalog entities touched by background jobs.
//!
//! Only the fields the handlers read or write are modelled. Every write is a
//! single-row update; no operation spans more than one entity.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LecternError, Result};

pub use memory::InMemoryCatalogStore;
pub use postgres::PgCatalogStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Status Enums
// ═══════════════════════════════════════════════════════════════════════════════

/// Stored lowercase text <-> enum, for status columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LecternError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LecternError::validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Transcoding state of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    None,
    Processing,
    Ready,
    Failed,
}

text_enum!(ProcessingStatus {
    None => "none",
    Processing => "processing",
    Ready => "ready",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsletterStatus {
    #[default]
    Draft,
    Sending,
    Sent,
}

text_enum!(NewsletterStatus {
    Draft => "draft",
    Sending => "sending",
    Sent => "sent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    #[default]
    Active,
    Completed,
    Unsubscribed,
}

text_enum!(EnrollmentStatus {
    Active => "active",
    Completed => "completed",
    Unsubscribed => "unsubscribed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(BackupStatus {
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub storage_link: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub processing_failed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    /// Master playlist URL
    pub m3u8: Option<String>,
    pub hls_master_key: Option<String>,
    pub duration: Option<f64>,
    pub processing_metadata: Option<serde_json::Value>,
}

/// Fields written when a transcode succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoReady {
    pub m3u8: String,
    pub hls_master_key: String,
    pub duration: f64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Newsletter {
    pub id: String,
    pub subject: String,
    /// HTML body
    pub content: String,
    pub status: NewsletterStatus,
    pub recipients: Vec<String>,
    /// Append-only, always a subset of `recipients`
    pub delivered: Vec<String>,
    pub message_ids: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// When a sequence email goes out, relative to the previous send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheduling_type", rename_all = "snake_case")]
pub enum EmailSchedule {
    Delay { delay_days: i32 },
    SpecificDate { at: DateTime<Utc> },
}

impl EmailSchedule {
    /// Send time of this email when the previous one went out at `now`.
    ///
    /// A specific date in the past means "as soon as possible".
    pub fn next_send_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Delay { delay_days } => now + chrono::Duration::days(i64::from(*delay_days)),
            Self::SpecificDate { at } => *at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEmail {
    pub id: String,
    pub sequence_id: String,
    pub position: i32,
    pub subject: String,
    pub content: String,
    pub schedule: EmailSchedule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub sequence_id: String,
    pub subscriber_id: String,
    pub status: EnrollmentStatus,
    pub current_email_index: i32,
    pub emails_sent: i32,
    pub next_email_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An active enrollment whose next email is due, with everything needed to send it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyEnrollment {
    pub enrollment: Enrollment,
    pub sequence_name: String,
    pub subscriber_email: String,
    pub blacklisted: bool,
    /// Ordered by position
    pub emails: Vec<SequenceEmail>,
}

/// New cursor state for an enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentUpdate {
    pub status: EnrollmentStatus,
    pub current_email_index: i32,
    pub emails_sent: i32,
    pub next_email_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub filename: String,
    pub s3_key: String,
    pub size_bytes: Option<i64>,
    pub status: BackupStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Backup {
    /// A new record in `RUNNING` state.
    pub fn running(filename: impl Into<String>, s3_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            s3_key: s3_key.into(),
            size_bytes: None,
            status: BackupStatus::Running,
            error: None,
            created_at: now,
            completed_at: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Point reads and single-row updates over catalog entities.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_video(&self, id: &str) -> Result<Video>;

    async fn mark_video_processing(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn mark_video_ready(&self, id: &str, ready: &VideoReady, at: DateTime<Utc>) -> Result<()>;

    async fn mark_video_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()>;

    /// Force every video stuck in `processing` since before `cutoff` to
    /// `failed`. Returns how many rows changed.
    async fn fail_stale_videos(&self, cutoff: DateTime<Utc>, reason: &str, at: DateTime<Utc>) -> Result<u64>;

    async fn get_newsletter(&self, id: &str) -> Result<Newsletter>;

    /// Append one batch to the delivered set and record its message id.
    async fn append_delivery(&self, id: &str, emails: &[String], message_id: &str) -> Result<()>;

    async fn mark_newsletter_sent(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Lowercased addresses of blacklisted subscribers.
    async fn blacklisted_emails(&self) -> Result<HashSet<String>>;

    async fn ready_enrollments(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEnrollment>>;

    async fn update_enrollment(&self, id: &str, update: &EnrollmentUpdate) -> Result<()>;

    async fn create_backup(&self, backup: &Backup) -> Result<()>;

    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()>;

    async fn fail_backup(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            ProcessingStatus::None,
            ProcessingStatus::Processing,
            ProcessingStatus::Ready,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert_eq!(BackupStatus::Completed.to_string(), "COMPLETED");
        assert!("archived".parse::<EnrollmentStatus>().is_err());
    }

    #[test]
    fn test_email_schedule() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            EmailSchedule::Delay { delay_days: 3 }.next_send_at(now),
            Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
        );
        let at = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        assert_eq!(EmailSchedule::SpecificDate { at }.next_send_at(now), at);
    }
}
