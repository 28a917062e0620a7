//! Typed job payloads and recurrence schedules.
//!
//! Every job name has exactly one payload shape. Rows store the name and the
//! variant data separately (`name`, `data`); [`JobPayload::from_parts`]
//! re-validates them at dispatch so a malformed row fails fast instead of
//! reaching a handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::job::{chrono_duration, JobPriority};
use crate::error::{LecternError, Result};

/// Registered job names.
pub mod names {
    pub const PROCESS_VIDEO: &str = "process_video";
    pub const SEND_NEWSLETTER: &str = "send_newsletter";
    pub const PROCESS_SEQUENCES: &str = "process_sequences";
    pub const CLEANUP_STUCK_VIDEOS: &str = "cleanup_stuck_videos";
    pub const WEEKLY_BACKUP: &str = "weekly_backup";
}

/// Transcode one uploaded video into HLS renditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessVideo {
    pub course_id: String,
    pub video_id: String,
    /// Key of the uploaded original in object storage
    pub video_s3_key: String,
}

/// Deliver (or resume delivering) one newsletter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendNewsletter {
    pub newsletter_id: String,
}

/// Payload of every job, tagged by job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    ProcessVideo(ProcessVideo),
    SendNewsletter(SendNewsletter),
    ProcessSequences {},
    CleanupStuckVideos {},
    WeeklyBackup {},
}

impl JobPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessVideo(_) => names::PROCESS_VIDEO,
            Self::SendNewsletter(_) => names::SEND_NEWSLETTER,
            Self::ProcessSequences {} => names::PROCESS_SEQUENCES,
            Self::CleanupStuckVideos {} => names::CLEANUP_STUCK_VIDEOS,
            Self::WeeklyBackup {} => names::WEEKLY_BACKUP,
        }
    }

    pub fn priority(&self) -> JobPriority {
        match self {
            Self::ProcessVideo(_) => JobPriority::High,
            Self::CleanupStuckVideos {} => JobPriority::High,
            Self::WeeklyBackup {} => JobPriority::Low,
            _ => JobPriority::Normal,
        }
    }

    /// Field-level checks beyond what the type enforces.
    pub fn validate(&self) -> Result<()> {
        let blank = |value: &str| value.trim().is_empty();
        match self {
            Self::ProcessVideo(p) => {
                if blank(&p.course_id) || blank(&p.video_id) || blank(&p.video_s3_key) {
                    return Err(LecternError::invalid_payload(
                        self.name(),
                        "course_id, video_id and video_s3_key are required",
                    ));
                }
            }
            Self::SendNewsletter(p) => {
                if blank(&p.newsletter_id) {
                    return Err(LecternError::invalid_payload(self.name(), "newsletter_id is required"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Split into the stored `(name, data)` columns.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value)> {
        let mut tagged = serde_json::to_value(self)?;
        let data = tagged
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({}));
        Ok((self.name().to_string(), data))
    }

    /// Rebuild and validate a payload from stored columns.
    pub fn from_parts(name: &str, data: &serde_json::Value) -> Result<Self> {
        let tagged = serde_json::json!({ "name": name, "data": data });
        let payload: Self = serde_json::from_value(tagged)
            .map_err(|e| LecternError::invalid_payload(name, e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recurrence
// ═══════════════════════════════════════════════════════════════════════════════

/// Schedule of a recurring job.
///
/// Text form is either a humantime interval (`"10m"`, `"1week"`) or a
/// six-field cron expression (`"0 0 3 * * *"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Every(Duration),
    Cron(String),
}

impl Recurrence {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(interval) = humantime::parse_duration(text) {
            if interval.is_zero() {
                return Err(LecternError::validation("Recurrence interval must be positive"));
            }
            return Ok(Self::Every(interval));
        }

        cron::Schedule::from_str(text).map_err(|e| {
            LecternError::validation(format!("Invalid recurrence '{}'", text))
                .with_internal_message(e.to_string())
        })?;
        Ok(Self::Cron(text.to_string()))
    }

    /// First run strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Every(interval) => Ok(after + chrono_duration(*interval)),
            Self::Cron(expr) => {
                let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                    LecternError::validation(format!("Invalid recurrence '{}'", expr))
                        .with_internal_message(e.to_string())
                })?;
                schedule
                    .after(&after)
                    .next()
                    .ok_or_else(|| LecternError::validation(format!("Cron '{}' has no future runs", expr)))
            }
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => write!(f, "{}", humantime::format_duration(*interval)),
            Self::Cron(expr) => write!(f, "{}", expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::TimeZone;

    #[test]
    fn test_payload_parts_round_trip() {
        let payload = JobPayload::SendNewsletter(SendNewsletter {
            newsletter_id: "nl-42".into(),
        });
        let (name, data) = payload.to_parts().unwrap();
        assert_eq!(name, "send_newsletter");
        assert_eq!(data, serde_json::json!({ "newsletter_id": "nl-42" }));
        assert_eq!(JobPayload::from_parts(&name, &data).unwrap(), payload);
    }

    #[test]
    fn test_fieldless_payload_stores_empty_object() {
        let (name, data) = JobPayload::WeeklyBackup {}.to_parts().unwrap();
        assert_eq!(name, "weekly_backup");
        assert_eq!(data, serde_json::json!({}));
        assert_eq!(JobPayload::from_parts(&name, &data).unwrap(), JobPayload::WeeklyBackup {});
    }

    #[test]
    fn test_from_parts_rejects_wrong_shape() {
        let err = JobPayload::from_parts("process_video", &serde_json::json!({ "video_id": "v1" }))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);

        let err = JobPayload::from_parts("does_not_exist", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_validate_rejects_blank_ids() {
        let payload = JobPayload::ProcessVideo(ProcessVideo {
            course_id: "c".into(),
            video_id: "  ".into(),
            video_s3_key: "k".into(),
        });
        assert_eq!(payload.validate().unwrap_err().code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_recurrence_interval() {
        let recurrence = Recurrence::parse("1week").unwrap();
        assert_eq!(recurrence, Recurrence::every(Duration::from_secs(7 * 24 * 3600)));

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            recurrence.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 8, 12, 0, 0).unwrap()
        );

        let reparsed = Recurrence::parse(&recurrence.to_string()).unwrap();
        assert_eq!(reparsed, recurrence);
    }

    #[test]
    fn test_recurrence_cron() {
        let recurrence = Recurrence::parse("0 0 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 15, 0).unwrap();
        assert_eq!(
            recurrence.next_after(start).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_recurrence_rejects_garbage() {
        assert!(Recurrence::parse("every tuesday-ish").is_err());
        assert!(Recurrence::parse("0s").is_err());
    }
}
