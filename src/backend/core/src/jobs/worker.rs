//! Background poll loop with bounded concurrency and graceful shutdown.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use super::scheduler::Scheduler;

/// Statistics for one scheduler process.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Total jobs succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Total jobs failed
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stop polling and wait for in-flight handlers, up to the configured
    /// shutdown timeout.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
    }
}

pub(super) fn spawn(scheduler: Scheduler) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let stats = scheduler.stats().clone();
    let handle_stats = stats.clone();
    let config = scheduler.config().clone();

    let task = tokio::spawn(async move {
        let concurrency = config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        tracing::info!(
            worker = %config.name,
            concurrency,
            poll_interval = ?config.poll_interval,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!(worker = %config.name, "Scheduler shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    let capacity = semaphore.available_permits().min(config.claim_batch);
                    if capacity == 0 {
                        continue;
                    }

                    let claimed = match scheduler.claim_due(Utc::now(), capacity).await {
                        Ok(claimed) => claimed,
                        Err(e) => {
                            tracing::error!(worker = %config.name, error = %e, "Failed to poll job store");
                            continue;
                        }
                    };

                    for job in claimed {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };
                        let scheduler = scheduler.clone();
                        let stats = stats.clone();
                        stats.active.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let _permit = permit;
                            scheduler.execute(job).await;
                            stats.active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                }
            }
        }

        // Every permit back means every handler has returned.
        let drained = tokio::time::timeout(
            config.shutdown_timeout,
            semaphore.acquire_many(concurrency as u32),
        )
        .await;
        match drained {
            Ok(_) => tracing::info!(worker = %config.name, "Scheduler stopped"),
            Err(_) => tracing::warn!(
                worker = %config.name,
                active = stats.active(),
                "Shutdown timed out with handlers still running; their leases will expire"
            ),
        }
    });

    SchedulerHandle {
        shutdown: shutdown_tx,
        stats: handle_stats,
        task,
    }
}
