//! `process_video`: the video state machine.
//!
//! ```text
//! none ──dispatch──► processing ──transcode + upload──► ready
//!                        │
//!                        └──any error──► failed (best effort)
//! ```
//!
//! Each transition is its own store write. A crash between them leaves the
//! video in `processing`, which the stuck-video cleanup eventually fails.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::catalog::{CatalogStore, VideoReady};
use crate::error::Result;
use crate::jobs::{
    names, JobContext, JobError, JobFilter, JobHandler, JobId, JobPayload, JobResult, ProcessVideo, RetryPolicy,
    Scheduler,
};
use crate::media::{Heartbeat, Transcoder, MASTER_PLAYLIST};
use crate::storage::StorageGateway;

/// Transcodes run for tens of minutes; the lease must outlive one rendition.
/// It is renewed before every rendition.
pub const VIDEO_LEASE: Duration = Duration::from_secs(30 * 60);

/// Renews the job lease between renditions.
#[async_trait]
impl Heartbeat for JobContext {
    async fn beat(&self) -> Result<()> {
        self.touch().await
    }
}

pub struct ProcessVideoHandler {
    catalog: Arc<dyn CatalogStore>,
    storage: Arc<StorageGateway>,
    transcoder: Arc<Transcoder>,
}

impl ProcessVideoHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, storage: Arc<StorageGateway>, transcoder: Arc<Transcoder>) -> Self {
        Self {
            catalog,
            storage,
            transcoder,
        }
    }

    async fn process(&self, ctx: &JobContext, request: &ProcessVideo) -> Result<VideoReady> {
        let source = self.storage.download(&request.video_s3_key).await?;
        ctx.touch().await?;

        let output = self.transcoder.transcode(&request.video_id, source, ctx).await?;
        ctx.touch().await?;

        let prefix = self.storage.hls_prefix(&request.course_id, &request.video_id);
        let keys = self.storage.upload_batch(&prefix, &output.files).await?;
        info!(files = keys.len(), prefix = %prefix, "Renditions uploaded");

        let master_key = format!("{}/{}", prefix, MASTER_PLAYLIST);
        let m3u8 = self.storage.normalize_url(&self.storage.object_url(&master_key));

        Ok(VideoReady {
            m3u8,
            hls_master_key: master_key,
            duration: output.duration,
            metadata: json!({
                "qualities": output.qualities,
                "processingTime": output.elapsed_secs,
                "hlsPrefix": prefix,
            }),
        })
    }
}

#[async_trait]
impl JobHandler for ProcessVideoHandler {
    fn name(&self) -> &'static str {
        names::PROCESS_VIDEO
    }

    fn lease_duration(&self) -> Option<Duration> {
        Some(VIDEO_LEASE)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    #[instrument(skip_all, fields(video_id = tracing::field::Empty))]
    async fn execute(&self, ctx: &JobContext, payload: JobPayload) -> JobResult {
        let JobPayload::ProcessVideo(request) = payload else {
            return Err(JobError::fatal(format!("unexpected payload for {}", self.name())));
        };
        tracing::Span::current().record("video_id", request.video_id.as_str());

        self.catalog
            .mark_video_processing(&request.video_id, Utc::now())
            .await?;

        match self.process(ctx, &request).await {
            Ok(ready) => {
                self.catalog
                    .mark_video_ready(&request.video_id, &ready, Utc::now())
                    .await?;
                ctx.log_info(&format!("Video ready at {}", ready.m3u8));
                Ok(())
            }
            Err(e) => {
                e.log();
                let message = e.status_message();
                if let Err(write_error) = self
                    .catalog
                    .mark_video_failed(&request.video_id, &message, Utc::now())
                    .await
                {
                    error!(
                        video_id = %request.video_id,
                        error = %write_error,
                        "Could not record video failure"
                    );
                }
                Err(e.into())
            }
        }
    }
}

/// External request to (re)process a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerVideo {
    pub course_id: String,
    pub video_id: String,
    pub video_s3_key: String,
    /// Cancel queued or in-flight jobs for the same video instead of refusing
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued { job_id: JobId, cancelled: u64 },
    AlreadyQueued,
}

/// Enqueue a transcode unless one is already queued for the video.
pub async fn trigger_video_processing(scheduler: &Scheduler, request: TriggerVideo) -> Result<TriggerOutcome> {
    let filter = JobFilter::name(names::PROCESS_VIDEO).with_data(json!({ "video_id": request.video_id }));

    let cancelled = if request.force {
        scheduler.cancel(&filter).await?
    } else if scheduler.exists(&filter).await? {
        info!(video_id = %request.video_id, "Transcode already queued");
        return Ok(TriggerOutcome::AlreadyQueued);
    } else {
        0
    };

    let job_id = scheduler
        .enqueue_now(JobPayload::ProcessVideo(ProcessVideo {
            course_id: request.course_id,
            video_id: request.video_id,
            video_s3_key: request.video_s3_key,
        }))
        .await?;
    Ok(TriggerOutcome::Enqueued { job_id, cancelled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalogStore, ProcessingStatus, Video};
    use crate::config::SchedulerConfig;
    use crate::error::ErrorCode;
    use crate::handlers::test_support::{claimed_context, claimed_context_in_store, gateway, transcoder, StubEncoder};
    use crate::jobs::InMemoryJobStore;
    use crate::media::{Encoder, QualityProfile};
    use crate::storage::{InMemoryObjectStore, ObjectStore, PutOptions};
    use bytes::Bytes;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::path::Path;

    struct Fixture {
        catalog: Arc<InMemoryCatalogStore>,
        objects: Arc<InMemoryObjectStore>,
        handler: ProcessVideoHandler,
        _work: tempfile::TempDir,
    }

    async fn fixture(encoder: impl Encoder + 'static) -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let catalog = Arc::new(InMemoryCatalogStore::new());
        catalog.insert_video(Video {
            id: "v1".into(),
            course_id: "c1".into(),
            ..Video::default()
        });
        let (storage, objects) = gateway();
        objects
            .put(
                "videos/c1/v1/original/lesson.mp4",
                Bytes::from_static(b"mp4"),
                &PutOptions::new("video/mp4"),
            )
            .await
            .unwrap();
        let handler = ProcessVideoHandler::new(
            catalog.clone(),
            Arc::new(storage),
            Arc::new(transcoder(encoder, work.path())),
        );
        Fixture {
            catalog,
            objects,
            handler,
            _work: work,
        }
    }

    fn payload(key: &str) -> JobPayload {
        JobPayload::ProcessVideo(ProcessVideo {
            course_id: "c1".into(),
            video_id: "v1".into(),
            video_s3_key: key.into(),
        })
    }

    #[tokio::test]
    async fn test_video_becomes_ready() {
        let fx = fixture(StubEncoder::default()).await;
        let payload = payload("videos/c1/v1/original/lesson.mp4");
        let ctx = claimed_context(payload.clone()).await;

        fx.handler.execute(&ctx, payload).await.unwrap();

        let video = fx.catalog.video("v1").unwrap();
        assert_eq!(video.processing_status, ProcessingStatus::Ready);
        assert_eq!(
            video.m3u8.as_deref(),
            Some("https://fly.storage.example.dev/media-bucket/videos/c1/v1/hls/master.m3u8")
        );
        assert_eq!(video.hls_master_key.as_deref(), Some("videos/c1/v1/hls/master.m3u8"));
        assert_eq!(video.duration, Some(10.0));
        let metadata = video.processing_metadata.unwrap();
        assert_eq!(metadata["qualities"].as_array().unwrap().len(), 3);
        assert_eq!(metadata["qualities"][1]["playlistPath"], "720p/720p.m3u8");

        assert!(fx.objects.contains("videos/c1/v1/hls/master.m3u8"));
        assert!(fx.objects.contains("videos/c1/v1/hls/480p/segment_000.ts"));
    }

    #[tokio::test]
    async fn test_missing_source_marks_failed() {
        let fx = fixture(StubEncoder::default()).await;
        let payload = payload("videos/c1/v1/original/missing.mp4");
        let ctx = claimed_context(payload.clone()).await;

        let err = fx.handler.execute(&ctx, payload).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(ErrorCode::ObjectNotFound.to_string().as_str()));

        let video = fx.catalog.video("v1").unwrap();
        assert_eq!(video.processing_status, ProcessingStatus::Failed);
        assert!(video.processing_error.unwrap().contains("missing.mp4"));
        assert!(video.m3u8.is_none());
    }

    #[tokio::test]
    async fn test_encoder_failure_marks_failed_without_manifest() {
        let fx = fixture(StubEncoder::failing_on("480p")).await;
        let payload = payload("videos/c1/v1/original/lesson.mp4");
        let ctx = claimed_context(payload.clone()).await;

        fx.handler.execute(&ctx, payload).await.unwrap_err();

        let video = fx.catalog.video("v1").unwrap();
        assert_eq!(video.processing_status, ProcessingStatus::Failed);
        assert!(video.processing_error.unwrap().contains("480p"));
        assert!(!fx.objects.contains("videos/c1/v1/hls/master.m3u8"));
    }

    /// Records the stored lease expiry each time a rendition starts.
    struct SlowEncoder {
        inner: StubEncoder,
        store: Arc<InMemoryJobStore>,
        job_id: JobId,
        expiries: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl Encoder for SlowEncoder {
        async fn encode(&self, input: &Path, output_dir: &Path, profile: &QualityProfile, segment_secs: u32) -> Result<()> {
            let row = self.store.get(self.job_id).unwrap();
            self.expiries.lock().push(row.lease.unwrap().expires_at);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.encode(input, output_dir, profile, segment_secs).await
        }

        async fn probe_duration(&self, input: &Path) -> Result<f64> {
            self.inner.probe_duration(input).await
        }
    }

    #[tokio::test]
    async fn test_lease_is_renewed_per_rendition() {
        let payload = payload("videos/c1/v1/original/lesson.mp4");
        let (ctx, store) = claimed_context_in_store(payload.clone()).await;
        let claimed_expiry = ctx.lease().expires_at;

        let expiries = Arc::new(Mutex::new(Vec::new()));
        let encoder = SlowEncoder {
            inner: StubEncoder::default(),
            store: store.clone(),
            job_id: ctx.job_id(),
            expiries: expiries.clone(),
        };
        let fx = fixture(encoder).await;

        fx.handler.execute(&ctx, payload).await.unwrap();

        let expiries = expiries.lock().clone();
        assert_eq!(expiries.len(), 3);
        assert!(expiries[0] > claimed_expiry);
        assert!(expiries.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[tokio::test]
    async fn test_trigger_deduplicates_unless_forced() {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = Scheduler::builder(store.clone(), SchedulerConfig::default()).build();
        let request = TriggerVideo {
            course_id: "c1".into(),
            video_id: "v1".into(),
            video_s3_key: "videos/c1/v1/original/lesson.mp4".into(),
            force: false,
        };

        let first = trigger_video_processing(&scheduler, request.clone()).await.unwrap();
        assert!(matches!(first, TriggerOutcome::Enqueued { cancelled: 0, .. }));
        assert_eq!(
            trigger_video_processing(&scheduler, request.clone()).await.unwrap(),
            TriggerOutcome::AlreadyQueued
        );

        let forced = trigger_video_processing(&scheduler, TriggerVideo { force: true, ..request })
            .await
            .unwrap();
        assert!(matches!(forced, TriggerOutcome::Enqueued { cancelled: 1, .. }));
        assert_eq!(store.len(), 1);
    }
}
