//! Job definitions and traits.
//!
//! This module provides the core abstractions for background jobs:
//!
//! - **JobRecord**: the persisted row (schedule, lease, failure bookkeeping)
//! - **JobHandler**: the trait every job implementation registers with the scheduler
//! - **JobContext**: per-run context passed to handlers (logging, lease renewal)
//! - **RetryPolicy**: handler-level retry behavior with backoff strategies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::payload::{JobPayload, Recurrence};
use super::store::JobStore;
use crate::error::{LecternError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs. Due jobs are claimed highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Stored column value.
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a handler. Its text becomes the job's `fail_reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<LecternError> for JobError {
    fn from(error: LecternError) -> Self {
        Self {
            message: error.status_message(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays, in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        delay_secs: u64,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + (increment_secs * attempt as u64),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    /// Doubling backoff starting at `initial_delay_secs`, capped at one minute.
    pub fn doubling(initial_delay_secs: u64) -> Self {
        Self::Exponential {
            initial_delay_secs,
            max_delay_secs: 60,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How the scheduler reschedules a one-shot job whose handler failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = no retries)
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Whether to retry on any error or only retryable errors
    pub retry_on_any_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            retry_on_any_error: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of retries.
    pub fn with_retries(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Check if another run should be scheduled after `failures` prior failures.
    pub fn should_retry(&self, failures: u32, error: &JobError) -> bool {
        if failures >= self.max_attempts {
            return false;
        }

        self.retry_on_any_error || error.retryable
    }

    /// Get the delay before the next retry.
    pub fn next_retry_delay(&self, failures: u32) -> Duration {
        self.backoff.delay_for_attempt(failures)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A time-bounded exclusive claim on a job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Changes on every claim; completion and renewal must present it
    pub token: Uuid,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Handler name, also the payload tag
    pub name: String,
    /// Variant data of the payload
    pub data: serde_json::Value,
    pub priority: JobPriority,
    /// `None` once a one-shot job has terminally failed
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub fail_count: u32,
    pub fail_reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Text form of a [`Recurrence`]
    pub repeat_interval: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh row for a validated payload.
    pub fn new(payload: &JobPayload, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self> {
        payload.validate()?;
        let (name, data) = payload.to_parts()?;

        Ok(Self {
            id: JobId::new(),
            name,
            data,
            priority: payload.priority(),
            next_run_at: Some(next_run_at),
            last_run_at: None,
            last_finished_at: None,
            lease: None,
            fail_count: 0,
            fail_reason: None,
            failed_at: None,
            repeat_interval: None,
            created_at: now,
        })
    }

    /// Attach a recurrence.
    pub fn repeating(mut self, recurrence: &Recurrence) -> Self {
        self.repeat_interval = Some(recurrence.to_string());
        self
    }

    /// Re-validate the stored payload.
    pub fn payload(&self) -> Result<JobPayload> {
        JobPayload::from_parts(&self.name, &self.data)
    }

    pub fn recurrence(&self) -> Result<Option<Recurrence>> {
        self.repeat_interval
            .as_deref()
            .map(Recurrence::parse)
            .transpose()
    }

    /// Due and not held by a live lease.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let scheduled = matches!(self.next_run_at, Some(at) if at <= now);
        let free = self.lease.as_ref().map_or(true, |lease| lease.is_expired(now));
        scheduled && free
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
pub struct JobContext {
    record: JobRecord,
    lease: Lease,
    lease_duration: Duration,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    /// Create a new job context for a claimed record.
    pub fn new(
        record: JobRecord,
        lease: Lease,
        lease_duration: Duration,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            record,
            lease,
            lease_duration,
            store,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.record.id
    }

    pub fn job_name(&self) -> &str {
        &self.record.name
    }

    /// Get the current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.record.fail_count + 1
    }

    /// Snapshot of the row as claimed.
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Extend the lease by the handler's lease duration from now.
    ///
    /// Long-running handlers call this between steps. Fails with `LeaseLost`
    /// when another scheduler has already reclaimed the row.
    pub async fn touch(&self) -> Result<()> {
        let expires_at = Utc::now() + chrono_duration(self.lease_duration);
        let renewed = self
            .store
            .renew(self.record.id, self.lease.token, expires_at)
            .await?;
        if renewed {
            Ok(())
        } else {
            Err(LecternError::lease_lost(self.record.id))
        }
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.record.id,
            job_name = %self.record.name,
            attempt = self.attempt(),
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.record.id,
            job_name = %self.record.name,
            attempt = self.attempt(),
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.record.id,
            job_name = %self.record.name,
            attempt = self.attempt(),
            message
        );
    }
}

/// Convert a std duration for timestamp arithmetic, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A handler for one job name.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The job name this handler is registered under.
    fn name(&self) -> &'static str;

    /// Execute one run.
    ///
    /// The payload has already been validated against this handler's
    /// variant. Handlers translate domain failures into persisted status
    /// before returning `Err`, so the error only drives scheduler
    /// bookkeeping.
    async fn execute(&self, ctx: &JobContext, payload: JobPayload) -> JobResult;

    /// Lease lifetime for this handler. `None` uses the scheduler default.
    fn lease_duration(&self) -> Option<Duration> {
        None
    }

    /// How failed one-shot runs are rescheduled.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
