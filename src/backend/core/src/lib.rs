#![allow(clippy::result_large_err)]
//! # Lectern Core
//!
//! Background processing for the course platform.
//!
//! ## Architecture
//!
//! - **Jobs**: durable job store with lease compare-and-set, one-shot and recurring scheduling
//! - **Media**: ffmpeg-driven HLS transcoding across a fixed quality ladder
//! - **Storage**: S3-compatible gateway with SigV4 signing and bucket-duplication repair
//! - **Mail**: SES transport, recipient filtering and rate-limit aware batching
//! - **Catalog**: the video, newsletter, sequence and backup records the jobs update
//! - **Handlers**: one job handler per job name, plus the wiring that registers them
//! - **Observability**: structured logging, OTLP tracing and Prometheus metrics

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod mail;
pub mod media;
pub mod observability;
pub mod scratch;
pub mod storage;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, LecternError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{CatalogStore, InMemoryCatalogStore, PgCatalogStore, ProcessingStatus};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, LecternError, Result};
    pub use crate::handlers::{
        register_handlers, register_recurring_jobs, trigger_video_processing, Services, TriggerOutcome,
        TriggerVideo,
    };
    pub use crate::jobs::{
        InMemoryJobStore, JobContext, JobFilter, JobHandler, JobPayload, JobResult, PgJobStore, Recurrence,
        Scheduler, SchedulerHandle,
    };
    pub use crate::mail::{EmailTransport, OutgoingEmail, SesTransport};
    pub use crate::media::{Encoder, FfmpegEncoder, Transcoder};
    pub use crate::storage::{InMemoryObjectStore, ObjectStore, S3ObjectStore, StorageGateway};
}
