//! Scheduler tests across process boundaries.
//!
//! Tests cover:
//! - Two schedulers sharing one store dispatch a job once
//! - Live leases are respected, expired leases are reclaimed
//! - Priority ordering when a poll claims fewer rows than are due
//! - The background polling loop and graceful shutdown

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use lectern_core::config::SchedulerConfig;
use lectern_core::jobs::{
    names, InMemoryJobStore, JobContext, JobHandler, JobPayload, JobRecord, JobResult, JobStore, Lease,
    ProcessVideo, Scheduler, SendNewsletter,
};

// ============================================================================
// Test Utilities
// ============================================================================

/// Records every run under its job name.
struct Recorder {
    name: &'static str,
    runs: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

#[async_trait]
impl JobHandler for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, ctx: &JobContext, _payload: JobPayload) -> JobResult {
        tokio::time::sleep(self.delay).await;
        ctx.touch().await?;
        self.runs.lock().push(self.name.to_string());
        Ok(())
    }
}

fn config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        name: name.into(),
        poll_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

fn scheduler(store: Arc<InMemoryJobStore>, runs: Arc<Mutex<Vec<String>>>, cfg: SchedulerConfig) -> Scheduler {
    Scheduler::builder(store, cfg)
        .register(Recorder {
            name: names::SEND_NEWSLETTER,
            runs: runs.clone(),
            delay: Duration::from_millis(20),
        })
        .register(Recorder {
            name: names::PROCESS_VIDEO,
            runs,
            delay: Duration::ZERO,
        })
        .build()
}

fn newsletter(id: &str) -> JobPayload {
    JobPayload::SendNewsletter(SendNewsletter {
        newsletter_id: id.into(),
    })
}

fn video() -> JobPayload {
    JobPayload::ProcessVideo(ProcessVideo {
        course_id: "c1".into(),
        video_id: "v1".into(),
        video_s3_key: "videos/c1/v1/original/a.mp4".into(),
    })
}

// ============================================================================
// Claiming
// ============================================================================

#[tokio::test]
async fn test_shared_store_dispatches_once() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let a = scheduler(store.clone(), runs.clone(), config("worker-a"));
    let b = scheduler(store.clone(), runs.clone(), config("worker-b"));

    a.enqueue_now(newsletter("nl-1")).await.unwrap();

    let now = Utc::now();
    let (ran_a, ran_b) = tokio::join!(a.run_due(now), b.run_due(now));
    assert_eq!(ran_a.unwrap() + ran_b.unwrap(), 1);
    assert_eq!(runs.lock().len(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_live_lease_is_skipped() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(store.clone(), runs.clone(), config("worker"));

    let now = Utc::now();
    let mut record = JobRecord::new(&newsletter("nl-1"), now, now).unwrap();
    record.lease = Some(Lease {
        token: Uuid::new_v4(),
        locked_at: now,
        expires_at: now + ChronoDuration::minutes(5),
    });
    store.insert(&record).await.unwrap();

    assert_eq!(sched.run_due(now).await.unwrap(), 0);
    assert!(runs.lock().is_empty());
    assert!(store.get(record.id).unwrap().lease.is_some());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(store.clone(), runs.clone(), config("worker"));

    // A worker that died mid-run left its lease behind.
    let now = Utc::now();
    let stale_token = Uuid::new_v4();
    let mut record = JobRecord::new(&newsletter("nl-1"), now - ChronoDuration::hours(1), now).unwrap();
    record.lease = Some(Lease {
        token: stale_token,
        locked_at: now - ChronoDuration::minutes(20),
        expires_at: now - ChronoDuration::minutes(10),
    });
    store.insert(&record).await.unwrap();

    assert_eq!(sched.run_due(now).await.unwrap(), 1);
    assert_eq!(runs.lock().len(), 1);
    assert!(store.get(record.id).is_none());

    // The dead worker's late completion is ignored.
    assert!(!store.remove(record.id, stale_token).await.unwrap());
}

#[tokio::test]
async fn test_higher_priority_claimed_first() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let cfg = SchedulerConfig {
        claim_batch: 1,
        ..config("worker")
    };
    let sched = scheduler(store.clone(), runs.clone(), cfg);

    let earlier = Utc::now() - ChronoDuration::minutes(1);
    sched.schedule_at(earlier, newsletter("nl-1")).await.unwrap();
    sched.enqueue_now(video()).await.unwrap();

    let now = Utc::now();
    assert_eq!(sched.run_due(now).await.unwrap(), 1);
    assert_eq!(sched.run_due(now).await.unwrap(), 1);
    assert_eq!(*runs.lock(), vec![names::PROCESS_VIDEO, names::SEND_NEWSLETTER]);
}

// ============================================================================
// Background Loop
// ============================================================================

#[tokio::test]
async fn test_background_loop_drains_and_shuts_down() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(store.clone(), runs.clone(), config("worker"));

    for i in 0..5 {
        sched.enqueue_now(newsletter(&format!("nl-{}", i))).await.unwrap();
    }
    let handle = sched.start();

    for _ in 0..200 {
        if store.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.is_empty());

    handle.shutdown().await;
    assert_eq!(runs.lock().len(), 5);
    assert_eq!(sched.stats().succeeded(), 5);
    assert_eq!(sched.stats().active(), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler(store.clone(), runs.clone(), config("worker"));

    sched.enqueue_now(newsletter("nl-1")).await.unwrap();
    let handle = sched.start();

    // Let one poll claim the job; the handler then sleeps for 20ms.
    let mut waited = 0;
    while sched.stats().active() == 0 && sched.stats().processed() == 0 && waited < 100 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += 1;
    }
    handle.shutdown().await;

    assert_eq!(runs.lock().len(), 1);
    assert!(store.is_empty());
}
