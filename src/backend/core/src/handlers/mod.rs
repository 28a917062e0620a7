//! Job handlers for every registered job name, and their wiring.
//!
//! | Job                    | Handler                       | Trigger                   |
//! |------------------------|-------------------------------|---------------------------|
//! | `process_video`        | [`ProcessVideoHandler`]       | [`trigger_video_processing`] |
//! | `send_newsletter`      | [`SendNewsletterHandler`]     | enqueued by the admin API |
//! | `process_sequences`    | [`ProcessSequencesHandler`]   | recurring                 |
//! | `cleanup_stuck_videos` | [`CleanupStuckVideosHandler`] | recurring                 |
//! | `weekly_backup`        | [`WeeklyBackupHandler`]       | recurring                 |

pub mod backup;
pub mod batch;
pub mod cleanup;
pub mod newsletter;
pub mod sequence;
pub mod video;

use std::sync::Arc;
use tracing::info;

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::error::{LecternError, Result};
use crate::jobs::{JobPayload, Recurrence, Scheduler, SchedulerBuilder};
use crate::mail::{EmailTransport, RecipientFilter};
use crate::media::Transcoder;
use crate::storage::StorageGateway;

pub use backup::{format_bytes, BackupNotice, Dumper, PgDumper, WeeklyBackupHandler};
pub use batch::{BatchOutcome, BatchSender, BatchSettings};
pub use cleanup::CleanupStuckVideosHandler;
pub use newsletter::SendNewsletterHandler;
pub use sequence::ProcessSequencesHandler;
pub use video::{trigger_video_processing, ProcessVideoHandler, TriggerOutcome, TriggerVideo, VIDEO_LEASE};

/// Collaborators shared by the handlers.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<dyn CatalogStore>,
    pub storage: Arc<StorageGateway>,
    pub transcoder: Arc<Transcoder>,
    pub mail: Arc<dyn EmailTransport>,
    pub dumper: Arc<dyn Dumper>,
}

/// Register one handler per job name.
pub fn register_handlers(builder: SchedulerBuilder, services: &Services, config: &Config) -> Result<SchedulerBuilder> {
    if config.cleanup.stale_after <= VIDEO_LEASE {
        return Err(LecternError::configuration(format!(
            "cleanup.stale_after ({}) must be longer than the transcode lease ({})",
            humantime::format_duration(config.cleanup.stale_after),
            humantime::format_duration(VIDEO_LEASE),
        )));
    }
    let filter = RecipientFilter::new(&config.mail.bot_patterns)?;
    let sender = BatchSender::new(services.mail.clone(), BatchSettings::from_config(&config.mail));

    Ok(builder
        .register(ProcessVideoHandler::new(
            services.catalog.clone(),
            services.storage.clone(),
            services.transcoder.clone(),
        ))
        .register(SendNewsletterHandler::new(services.catalog.clone(), sender, filter))
        .register(ProcessSequencesHandler::new(
            services.catalog.clone(),
            services.mail.clone(),
        ))
        .register(CleanupStuckVideosHandler::new(
            services.catalog.clone(),
            config.cleanup.stale_after,
        ))
        .register(WeeklyBackupHandler::new(
            services.catalog.clone(),
            services.storage.clone(),
            services.mail.clone(),
            services.dumper.clone(),
            config.backup.clone(),
        )))
}

/// Schedule the periodic jobs. Every process start can call this: rows
/// whose interval is unchanged keep their next run.
pub async fn register_recurring_jobs(scheduler: &Scheduler, config: &Config) -> Result<()> {
    let jobs = [
        (config.cleanup.interval, JobPayload::CleanupStuckVideos {}),
        (config.sequences.interval, JobPayload::ProcessSequences {}),
        (config.backup.interval, JobPayload::WeeklyBackup {}),
    ];
    for (interval, payload) in jobs {
        scheduler
            .schedule_recurring(Recurrence::every(interval), payload)
            .await?;
    }
    info!(count = 3, "Recurring jobs registered");
    Ok(())
}
