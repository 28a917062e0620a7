//! Integration tests for the Lectern job handlers.
//!
//! These tests drive the real scheduler and handlers end to end over the
//! in-memory stores:
//! - Video state machine: none -> processing -> ready / failed
//! - Newsletter delivery under provider rate limiting, and resumption
//! - Recurring job registration and stuck-video cleanup
//! - Backup pipeline success and failure paths

mod common;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use common::{wait_until_empty, FakeEncoder, FakeMail, HarnessBuilder};
use lectern_core::catalog::{BackupStatus, Newsletter, NewsletterStatus, ProcessingStatus, Video};
use lectern_core::config::CleanupConfig;
use lectern_core::error::{ErrorCode, LecternError};
use lectern_core::handlers::{
    register_recurring_jobs, trigger_video_processing, TriggerOutcome, TriggerVideo, VIDEO_LEASE,
};
use lectern_core::jobs::{JobFilter, JobPayload, SendNewsletter};
use lectern_core::storage::{ObjectStore, PutOptions};

// ============================================================================
// Test Utilities
// ============================================================================

const SOURCE_KEY: &str = "videos/course-1/video-1/original/intro.mp4";

async fn seed_video(harness: &common::Harness) {
    harness.catalog.insert_video(Video {
        id: "video-1".into(),
        course_id: "course-1".into(),
        title: "Intro".into(),
        ..Video::default()
    });
    harness
        .objects
        .put(SOURCE_KEY, Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"), &PutOptions::new("video/mp4"))
        .await
        .unwrap();
}

fn trigger(force: bool) -> TriggerVideo {
    TriggerVideo {
        course_id: "course-1".into(),
        video_id: "video-1".into(),
        video_s3_key: SOURCE_KEY.into(),
        force,
    }
}

fn newsletter(recipients: usize) -> Newsletter {
    Newsletter {
        id: "n1".into(),
        subject: "March updates".into(),
        content: "<html><body><h1>New lessons</h1></body></html>".into(),
        status: NewsletterStatus::Sending,
        recipients: (0..recipients).map(|i| format!("student{:02}@school.io", i)).collect(),
        ..Newsletter::default()
    }
}

fn send_newsletter() -> JobPayload {
    JobPayload::SendNewsletter(SendNewsletter {
        newsletter_id: "n1".into(),
    })
}

// ============================================================================
// Video Processing
// ============================================================================

#[tokio::test]
async fn test_video_goes_from_none_to_ready() {
    let harness = HarnessBuilder::new().build();
    seed_video(&harness).await;
    assert_eq!(
        harness.catalog.video("video-1").unwrap().processing_status,
        ProcessingStatus::None
    );

    let outcome = trigger_video_processing(&harness.scheduler, trigger(false)).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Enqueued { .. }));

    let ran = harness.scheduler.run_due(Utc::now()).await.unwrap();
    assert_eq!(ran, 1);

    let video = harness.catalog.video("video-1").unwrap();
    assert_eq!(video.processing_status, ProcessingStatus::Ready);
    assert!(video.processing_started_at.is_some());
    assert!(video.processing_completed_at >= video.processing_started_at);
    assert_eq!(
        video.m3u8.as_deref(),
        Some("https://fly.storage.example.dev/course-media/videos/course-1/video-1/hls/master.m3u8")
    );
    assert_eq!(video.duration, Some(10.0));
    let metadata = video.processing_metadata.unwrap();
    assert_eq!(metadata["qualities"].as_array().unwrap().len(), 3);
    assert_eq!(metadata["qualities"][0]["resolution"], "1920x1080");

    let master = harness
        .objects
        .get("videos/course-1/video-1/hls/master.m3u8")
        .await
        .unwrap();
    let master = String::from_utf8(master.to_vec()).unwrap();
    assert_eq!(master.matches("#EXT-X-STREAM-INF").count(), 3);
    assert!(master.contains("BANDWIDTH=5000000,RESOLUTION=1920x1080\n1080p/1080p.m3u8"));

    let playlist = harness
        .objects
        .options("videos/course-1/video-1/hls/720p/720p.m3u8")
        .unwrap();
    assert_eq!(playlist.cache_control.as_deref(), Some("no-cache"));

    assert!(harness.jobs.is_empty());
    assert!(wait_until_empty(harness.work.path()).await);
}

#[tokio::test]
async fn test_video_encoder_failure_is_terminal() {
    let harness = HarnessBuilder::new()
        .encoder(FakeEncoder { fail_on: Some("720p") })
        .build();
    seed_video(&harness).await;

    let TriggerOutcome::Enqueued { job_id, .. } = trigger_video_processing(&harness.scheduler, trigger(false))
        .await
        .unwrap()
    else {
        panic!("expected a new job");
    };
    harness.scheduler.run_due(Utc::now()).await.unwrap();

    let video = harness.catalog.video("video-1").unwrap();
    assert_eq!(video.processing_status, ProcessingStatus::Failed);
    assert!(video.processing_error.unwrap().contains("720p"));
    assert!(video.m3u8.is_none());
    assert!(!harness.objects.contains("videos/course-1/video-1/hls/master.m3u8"));

    let job = harness.jobs.get(job_id).unwrap();
    assert_eq!(job.fail_count, 1);
    assert!(job.next_run_at.is_none());
    assert!(job.fail_reason.unwrap().contains("720p"));
}

#[tokio::test]
async fn test_forced_retrigger_replaces_queued_job() {
    let harness = HarnessBuilder::new().build();
    seed_video(&harness).await;

    trigger_video_processing(&harness.scheduler, trigger(false)).await.unwrap();
    assert_eq!(
        trigger_video_processing(&harness.scheduler, trigger(false)).await.unwrap(),
        TriggerOutcome::AlreadyQueued
    );
    let forced = trigger_video_processing(&harness.scheduler, trigger(true)).await.unwrap();
    assert!(matches!(forced, TriggerOutcome::Enqueued { cancelled: 1, .. }));

    assert_eq!(harness.scheduler.run_due(Utc::now()).await.unwrap(), 1);
    assert_eq!(
        harness.catalog.video("video-1").unwrap().processing_status,
        ProcessingStatus::Ready
    );
}

// ============================================================================
// Newsletters
// ============================================================================

#[tokio::test]
async fn test_newsletter_survives_rate_limiting() {
    let builder = HarnessBuilder::new();
    let mail = Arc::new(
        FakeMail::new()
            .failing_with(vec![
                LecternError::rate_limited("ses", 1),
                LecternError::rate_limited("ses", 1),
            ])
            .observing(builder.catalog(), "n1"),
    );
    let harness = builder.mail(mail.clone()).build();
    harness.catalog.insert_newsletter(newsletter(30));

    harness.scheduler.enqueue_now(send_newsletter()).await.unwrap();
    assert_eq!(harness.scheduler.run_due(Utc::now()).await.unwrap(), 1);

    // Three attempts for batch 1, then one each for batches 2 and 3.
    assert_eq!(*mail.attempts.lock(), 5);
    assert_eq!(*mail.delivered_at_call.lock(), vec![0, 0, 0, 14, 28]);

    let sent = mail.sent.lock();
    assert_eq!(sent.iter().map(|e| e.bcc.len()).collect::<Vec<_>>(), vec![14, 14, 2]);
    assert!(sent[0].html.contains("{{ses:openTracker}}"));
    drop(sent);

    let stored = harness.catalog.newsletter("n1").unwrap();
    assert_eq!(stored.delivered.len(), 30);
    assert_eq!(stored.message_ids.len(), 3);
    assert_eq!(stored.status, NewsletterStatus::Sent);
    assert!(harness.jobs.is_empty());
}

#[tokio::test]
async fn test_newsletter_retry_sends_only_remainder() {
    let builder = HarnessBuilder::new();
    let mail = Arc::new(
        FakeMail::new().failing_with((0..4).map(|_| LecternError::rate_limited("ses", 1)).collect()),
    );
    let harness = builder.mail(mail.clone()).build();
    harness.catalog.insert_newsletter(newsletter(20));

    let job_id = harness.scheduler.enqueue_now(send_newsletter()).await.unwrap();
    harness.scheduler.run_due(Utc::now()).await.unwrap();

    let stored = harness.catalog.newsletter("n1").unwrap();
    assert_eq!(stored.delivered.len(), 6);
    assert_eq!(stored.status, NewsletterStatus::Sending);
    let job = harness.jobs.get(job_id).unwrap();
    assert_eq!(job.fail_count, 1);
    assert!(job.next_run_at.is_some());

    let later = Utc::now() + ChronoDuration::minutes(5);
    assert_eq!(harness.scheduler.run_due(later).await.unwrap(), 1);

    let stored = harness.catalog.newsletter("n1").unwrap();
    assert_eq!(stored.delivered.len(), 20);
    assert_eq!(stored.status, NewsletterStatus::Sent);
    let sent = mail.sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].bcc.len(), 14);
    assert_eq!(sent[1].bcc[0], "student00@school.io");
    assert!(harness.jobs.get(job_id).is_none());
}

// ============================================================================
// Recurring Jobs
// ============================================================================

#[tokio::test]
async fn test_recurring_registration_is_idempotent() {
    let harness = HarnessBuilder::new().build();

    register_recurring_jobs(&harness.scheduler, &harness.config).await.unwrap();
    register_recurring_jobs(&harness.scheduler, &harness.config).await.unwrap();

    assert_eq!(harness.jobs.len(), 3);
    for name in ["cleanup_stuck_videos", "process_sequences", "weekly_backup"] {
        let rows = harness.scheduler.jobs(&JobFilter::name(name)).await.unwrap();
        assert_eq!(rows.len(), 1, "{}", name);
        assert!(rows[0].is_recurring());
    }
}

#[tokio::test]
async fn test_cleanup_pass_fails_stuck_videos() {
    let harness = HarnessBuilder::new().build();
    harness.catalog.insert_video(Video {
        id: "stuck".into(),
        processing_status: ProcessingStatus::Processing,
        processing_started_at: Some(Utc::now() - ChronoDuration::hours(3)),
        ..Video::default()
    });
    register_recurring_jobs(&harness.scheduler, &harness.config).await.unwrap();

    // Nothing is due at registration time.
    assert_eq!(harness.scheduler.run_due(Utc::now()).await.unwrap(), 0);

    let after_first_interval = Utc::now() + ChronoDuration::minutes(11);
    assert_eq!(harness.scheduler.run_due(after_first_interval).await.unwrap(), 1);

    let video = harness.catalog.video("stuck").unwrap();
    assert_eq!(video.processing_status, ProcessingStatus::Failed);
    assert!(video.processing_error.unwrap().contains("timed out"));

    let cleanup = harness
        .scheduler
        .jobs(&JobFilter::name("cleanup_stuck_videos"))
        .await
        .unwrap();
    assert_eq!(cleanup.len(), 1);
    assert!(cleanup[0].next_run_at.unwrap() > after_first_interval);
    assert!(cleanup[0].lease.is_none());
}

#[tokio::test]
async fn test_stale_threshold_must_outlast_video_lease() {
    let err = HarnessBuilder::new()
        .cleanup(CleanupConfig {
            stale_after: VIDEO_LEASE,
            ..CleanupConfig::default()
        })
        .try_build()
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);

    assert!(CleanupConfig::default().stale_after > VIDEO_LEASE);
}

// ============================================================================
// Backups
// ============================================================================

#[tokio::test]
async fn test_backup_completes_and_notifies_operators() {
    let builder = HarnessBuilder::new();
    let mail = Arc::new(FakeMail::new());
    let harness = builder.mail(mail.clone()).dump(&[7u8; 2048]).build();

    harness.scheduler.enqueue_now(JobPayload::WeeklyBackup {}).await.unwrap();
    harness.scheduler.run_due(Utc::now()).await.unwrap();

    let backups = harness.catalog.backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].status, BackupStatus::Completed);
    assert_eq!(backups[0].size_bytes, Some(2048));
    assert!(harness.objects.contains(&backups[0].s3_key));

    let sent = mail.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["ops@lectern.dev"]);
    assert!(sent[0].html.contains("2 KB"));
    assert!(sent[0].html.contains(&backups[0].filename));
    drop(sent);

    assert!(wait_until_empty(harness.work.path()).await);
}

#[tokio::test]
async fn test_backup_failure_is_recorded_and_reported() {
    let builder = HarnessBuilder::new();
    let mail = Arc::new(FakeMail::new());
    let harness = builder.mail(mail.clone()).dump(b"").build();

    let job_id = harness.scheduler.enqueue_now(JobPayload::WeeklyBackup {}).await.unwrap();
    harness.scheduler.run_due(Utc::now()).await.unwrap();

    let backups = harness.catalog.backups();
    assert_eq!(backups[0].status, BackupStatus::Failed);
    assert!(backups[0].error.as_deref().unwrap().contains("empty"));
    assert!(harness.objects.is_empty());

    let sent = mail.sent.lock();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("FAILED"));
    drop(sent);

    let job = harness.jobs.get(job_id).unwrap();
    assert!(job.next_run_at.is_none());
    assert!(wait_until_empty(harness.work.path()).await);
}
