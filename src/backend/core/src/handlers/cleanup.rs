//! `cleanup_stuck_videos`: fail videos whose transcode outlived its staleness threshold.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::catalog::CatalogStore;
use crate::jobs::job::chrono_duration;
use crate::jobs::{names, JobContext, JobHandler, JobPayload, JobResult};
use crate::observability::metrics::record_videos_timed_out;

pub struct CleanupStuckVideosHandler {
    catalog: Arc<dyn CatalogStore>,
    stale_after: Duration,
}

impl CleanupStuckVideosHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, stale_after: Duration) -> Self {
        Self { catalog, stale_after }
    }

    pub fn timeout_reason(&self) -> String {
        format!(
            "Processing timed out: no result after {}",
            humantime::format_duration(self.stale_after)
        )
    }
}

#[async_trait]
impl JobHandler for CleanupStuckVideosHandler {
    fn name(&self) -> &'static str {
        names::CLEANUP_STUCK_VIDEOS
    }

    async fn execute(&self, _ctx: &JobContext, _payload: JobPayload) -> JobResult {
        let now = Utc::now();
        let cutoff = now - chrono_duration(self.stale_after);
        let failed = self
            .catalog
            .fail_stale_videos(cutoff, &self.timeout_reason(), now)
            .await?;

        if failed > 0 {
            record_videos_timed_out(failed);
            info!(failed, cutoff = %cutoff, "Stuck videos marked failed");
        } else {
            debug!("No stuck videos");
        }
        Ok(())
    }
}
