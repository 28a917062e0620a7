//! Error handling for Lectern.
//!
//! This module provides:
//! - A single error type carrying a stable, machine-readable code
//! - User-safe messages separate from internal diagnostics
//! - Source chaining so the original cause is never lost
//! - Severity-aware logging and an error counter metric
//!
//! Callers branch on [`ErrorCode`] (for example `ErrorCode::MailRateLimited`)
//! rather than on message text.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lectern_core::error::{ErrorCode, LecternError, Result};
//!
//! fn load_manifest(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).map_err(|e| {
//!         LecternError::new(ErrorCode::EmptyOutput, "Failed to read rendition playlist").with_source(e)
//!     })
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Lectern operations.
pub type Result<T> = std::result::Result<T, LecternError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    UnknownJob,
    InvalidPayload,
    LeaseLost,

    // Media Errors (1100-1199)
    EncoderFailed,
    EncoderUnavailable,
    ProbeFailed,
    EmptyOutput,

    // Storage Errors (1200-1299)
    StorageError,
    ObjectNotFound,
    MissingCredentials,
    MalformedUrl,

    // Mail Errors (1300-1399)
    MailRateLimited,
    MailDeliveryFailed,

    // Backup Errors (1400-1499)
    BackupFailed,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // External Service Errors (3000-3099)
    ExternalServiceError,
    NetworkError,
    Timeout,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::UnknownJob => 1000,
            Self::InvalidPayload => 1001,
            Self::LeaseLost => 1002,

            Self::EncoderFailed => 1100,
            Self::EncoderUnavailable => 1101,
            Self::ProbeFailed => 1102,
            Self::EmptyOutput => 1103,

            Self::StorageError => 1200,
            Self::ObjectNotFound => 1201,
            Self::MissingCredentials => 1202,
            Self::MalformedUrl => 1203,

            Self::MailRateLimited => 1300,
            Self::MailDeliveryFailed => 1301,

            Self::BackupFailed => 1400,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::ExternalServiceError => 3004,
            Self::NetworkError => 3005,
            Self::Timeout => 3006,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is transient and worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MailRateLimited
                | Self::EncoderUnavailable
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::NetworkError
                | Self::ExternalServiceError
                | Self::Timeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "media",
            1200..=1299 => "storage",
            1300..=1399 => "mail",
            1400..=1499 => "backup",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input, missing records
    Low,
    /// Operational issues (rate limits, timeouts)
    Medium,
    /// Failed side effects (encoder, storage, database)
    High,
    /// The process cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidPayload
            | ErrorCode::UnknownJob
            | ErrorCode::RecordNotFound
            | ErrorCode::ObjectNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::MailRateLimited
            | ErrorCode::LeaseLost
            | ErrorCode::ProbeFailed
            | ErrorCode::Timeout
            | ErrorCode::EncoderUnavailable => Self::Medium,

            ErrorCode::EncoderFailed
            | ErrorCode::EmptyOutput
            | ErrorCode::StorageError
            | ErrorCode::MalformedUrl
            | ErrorCode::MailDeliveryFailed
            | ErrorCode::BackupFailed
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ExternalServiceError
            | ErrorCode::NetworkError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::MissingCredentials
            | ErrorCode::MissingConfiguration
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (video, newsletter, job, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Lectern.
#[derive(Error, Debug)]
pub struct LecternError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to persist on entities)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for LecternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl LecternError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Message suitable for persisting on a domain record (status fields).
    ///
    /// Includes the internal detail, since these records are only read by
    /// operators.
    pub fn status_message(&self) -> String {
        match &self.internal_message {
            Some(internal) => format!("{}: {}", self.user_message, internal),
            None => self.user_message.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "lectern_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for LecternError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        format!("Constraint violation: {}", constraint),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for LecternError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<quick_xml::DeError> for LecternError {
    fn from(error: quick_xml::DeError) -> Self {
        Self::with_internal(
            ErrorCode::DeserializationError,
            "Failed to parse XML response",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<reqwest::Error> for LecternError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::Timeout, "External service request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to external service")
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                429 => (ErrorCode::ExternalServiceError, "Rate limited by external service"),
                401 | 403 => (
                    ErrorCode::MissingCredentials,
                    "Authentication failed with external service",
                ),
                _ => (ErrorCode::ExternalServiceError, "External service returned an error"),
            }
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<url::ParseError> for LecternError {
    fn from(error: url::ParseError) -> Self {
        Self::with_internal(ErrorCode::MalformedUrl, "Malformed URL", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for LecternError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for LecternError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for LecternError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<LecternError>() {
            Ok(lectern_error) => lectern_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for LecternError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl LecternError {
    // ─────────────────────────────────────────────────────────────────────────
    // Job Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// No handler is registered under this job name.
    pub fn unknown_job(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::UnknownJob, format!("No handler registered for job '{}'", name))
            .with_context("job_name", &name)
    }

    /// Stored or submitted payload does not match the job's schema.
    pub fn invalid_payload(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_internal(
            ErrorCode::InvalidPayload,
            format!("Invalid payload for job '{}'", name),
            reason,
        )
        .with_context("job_name", &name)
    }

    /// Our lease was reclaimed by another scheduler before we finished.
    pub fn lease_lost(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::LeaseLost, format!("Lease lost for job {}", job_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Media Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The encoder exited non-zero for one rendition.
    pub fn encoder_failed(profile: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        let profile = profile.into();
        Self::with_internal(
            ErrorCode::EncoderFailed,
            format!("Encoding failed for quality {}", profile),
            diagnostics,
        )
        .with_context("profile", &profile)
    }

    /// The encoder binary could not be spawned.
    pub fn encoder_unavailable(binary: impl Into<String>, reason: impl Into<String>) -> Self {
        let binary = binary.into();
        Self::with_internal(
            ErrorCode::EncoderUnavailable,
            format!("Encoder '{}' could not be started", binary),
            reason,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Object storage operation failed.
    pub fn storage(op: &'static str, key: impl Into<String>, detail: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::StorageError,
            format!("Object storage {} failed for '{}'", op, key),
            detail,
        )
        .with_details(ErrorDetails::new().with_entity("object", &key))
    }

    /// No object exists under the key.
    pub fn object_not_found(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::ObjectNotFound, format!("Object not found: {}", key))
            .with_details(ErrorDetails::new().with_entity("object", &key))
    }

    /// Credentials for an external service are not configured.
    pub fn missing_credentials(what: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingCredentials,
            format!("Missing credentials for {}", what.into()),
        )
    }

    /// A URL could not be decomposed into the expected parts.
    pub fn malformed_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorCode::MalformedUrl, format!("Malformed URL: {}", url))
            .with_context("url", &url)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mail Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Email provider rejected the request for exceeding its send rate.
    pub fn rate_limited(provider: impl Into<String>, retry_after_secs: u64) -> Self {
        let provider = provider.into();
        Self::new(
            ErrorCode::MailRateLimited,
            format!("Rate limited by {}: retry after {}s", provider, retry_after_secs),
        )
        .with_details(
            ErrorDetails::new()
                .with_retry_after(retry_after_secs)
                .with_context("provider", &provider),
        )
    }

    /// Email provider rejected the message.
    pub fn delivery_failed(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MailDeliveryFailed,
            format!("Email delivery via {} failed", provider.into()),
            detail,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Backup Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A backup pipeline step failed.
    pub fn backup_failed(step: &'static str, detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BackupFailed,
            format!("Backup step '{}' failed", step),
            detail,
        )
        .with_context("step", step)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
