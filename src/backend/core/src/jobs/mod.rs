//! Durable background job system.
//!
//! - **Payloads**: one tagged variant per job name, validated at enqueue and dispatch
//! - **Store**: persistent rows with lease compare-and-set (Postgres or in-memory)
//! - **Scheduler**: one-shot, delayed and recurring jobs; claim and dispatch
//! - **Worker**: background poll loop with bounded concurrency and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             Background Job System                            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │ JobPayload  │    │  Scheduler  │    │  JobStore   │    │   Worker    │  │
//! │  │ (tagged by  │───▶│ (enqueue /  │───▶│ (lease CAS, │◀───│ (poll, claim│  │
//! │  │  job name)  │    │  recurring) │    │  Postgres)  │    │  dispatch)  │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘  │
//! │                                                                  │         │
//! │                                                                  ▼         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐  │
//! │  │                            Job Handlers                              │  │
//! │  │  • process_video         • send_newsletter     • process_sequences  │  │
//! │  │  • cleanup_stuck_videos  • weekly_backup                            │  │
//! │  └─────────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use lectern_core::jobs::{JobPayload, PgJobStore, Recurrence, Scheduler};
//!
//! let scheduler = Scheduler::builder(Arc::new(PgJobStore::new(pool)), config.scheduler)
//!     .register(CleanupStuckVideosHandler::new(catalog.clone(), config.cleanup.stale_after))
//!     .build();
//!
//! scheduler
//!     .schedule_recurring(Recurrence::every(config.cleanup.interval), JobPayload::CleanupStuckVideos {})
//!     .await?;
//!
//! let handle = scheduler.start();
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

pub mod job;
pub mod payload;
pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use job::{
    BackoffStrategy, JobContext, JobError, JobHandler, JobId, JobPriority, JobRecord, JobResult, Lease,
    RetryPolicy,
};
pub use payload::{names, JobPayload, ProcessVideo, Recurrence, SendNewsletter};
pub use postgres::PgJobStore;
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use store::{json_contains, InMemoryJobStore, JobFilter, JobStore, Registration, RunUpdate};
pub use worker::{SchedulerHandle, WorkerStats};
