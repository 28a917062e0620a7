//! Job scheduling, claiming and dispatch.
//!
//! The scheduler owns no in-memory queue. Every operation goes through the
//! [`JobStore`], so several processes can share one store and coordinate
//! purely through lease compare-and-set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use super::job::{chrono_duration, JobContext, JobError, JobHandler, JobId, JobRecord, JobResult};
use super::payload::{JobPayload, Recurrence};
use super::store::{JobFilter, JobStore, RunUpdate};
use super::worker::{self, SchedulerHandle, WorkerStats};
use crate::config::SchedulerConfig;
use crate::error::{LecternError, Result};
use crate::observability::metrics;

/// Collects handler registrations before the scheduler is built.
pub struct SchedulerBuilder {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl SchedulerBuilder {
    /// Register a handler under its job name. A later registration for the
    /// same name replaces the earlier one.
    pub fn register<H: JobHandler>(self, handler: H) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn JobHandler>) -> Self {
        let name = handler.name();
        if self.handlers.insert(name, handler).is_some() {
            tracing::warn!(job_name = name, "Handler registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> Scheduler {
        let mut names: Vec<&str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        tracing::info!(worker = %self.config.name, handlers = ?names, "Scheduler configured");

        Scheduler {
            inner: Arc::new(Inner {
                store: self.store,
                handlers: self.handlers,
                config: self.config,
                stats: WorkerStats::new(),
            }),
        }
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    config: SchedulerConfig,
    stats: WorkerStats,
}

/// A job row this process holds the lease on, ready to run.
pub(crate) struct ClaimedJob {
    record: JobRecord,
    handler: Arc<dyn JobHandler>,
    lease_duration: Duration,
    claimed_at: DateTime<Utc>,
}

/// What happens to a row after its handler returns.
#[derive(Debug, PartialEq)]
enum Disposition {
    Remove,
    Finish(RunUpdate),
}

/// Persistent polling scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn JobStore>, config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Names this scheduler will claim.
    pub fn job_names(&self) -> Vec<String> {
        self.inner.handlers.keys().map(|name| name.to_string()).collect()
    }

    fn ensure_registered(&self, name: &str) -> Result<()> {
        if self.inner.handlers.contains_key(name) {
            Ok(())
        } else {
            Err(LecternError::unknown_job(name))
        }
    }

    /// Enqueue a one-shot job due immediately.
    pub async fn enqueue_now(&self, payload: JobPayload) -> Result<JobId> {
        self.schedule_at(Utc::now(), payload).await
    }

    /// Enqueue a one-shot job due at `when`.
    pub async fn schedule_at(&self, when: DateTime<Utc>, payload: JobPayload) -> Result<JobId> {
        self.ensure_registered(payload.name())?;
        let record = JobRecord::new(&payload, when, Utc::now())?;
        self.inner.store.insert(&record).await?;

        tracing::info!(job_id = %record.id, job_name = %record.name, run_at = %when, "Job scheduled");
        Ok(record.id)
    }

    /// Register a recurring job. Safe to call on every startup: an existing
    /// row with the same schedule and payload keeps its next run, history
    /// and lease. A changed schedule restarts one interval from now.
    pub async fn schedule_recurring(&self, recurrence: Recurrence, payload: JobPayload) -> Result<JobId> {
        self.ensure_registered(payload.name())?;
        let now = Utc::now();

        let first_run = recurrence.next_after(now)?;
        let record = JobRecord::new(&payload, first_run, now)?.repeating(&recurrence);
        let registration = self.inner.store.upsert_recurring(&record).await?;

        tracing::info!(
            job_id = %registration.id(),
            job_name = %record.name,
            every = %recurrence,
            ?registration,
            "Recurring job registered"
        );
        Ok(registration.id())
    }

    /// Hard-delete matching rows. A handler already running is not
    /// interrupted; its completion bookkeeping simply finds no row.
    pub async fn cancel(&self, filter: &JobFilter) -> Result<u64> {
        let removed = self.inner.store.delete(filter).await?;
        if removed > 0 {
            tracing::info!(?filter, removed, "Jobs cancelled");
        }
        Ok(removed)
    }

    pub async fn jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.inner.store.find(filter).await
    }

    pub async fn exists(&self, filter: &JobFilter) -> Result<bool> {
        Ok(!self.inner.store.find(filter).await?.is_empty())
    }

    /// One poll-and-dispatch cycle at `now`, awaiting every dispatched
    /// handler. Returns the number of jobs run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let claimed = self.claim_due(now, self.inner.config.claim_batch).await?;
        let count = claimed.len();
        futures::future::join_all(claimed.into_iter().map(|job| self.execute(job))).await;
        Ok(count)
    }

    /// Start polling in the background.
    pub fn start(&self) -> SchedulerHandle {
        worker::spawn(self.clone())
    }

    /// Select due rows and try to lease each one.
    pub(crate) async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let names = self.job_names();
        let due = self.inner.store.due(&names, now, limit).await?;
        let mut claimed = Vec::with_capacity(due.len());

        for candidate in due {
            let Some(handler) = self.inner.handlers.get(candidate.name.as_str()).cloned() else {
                continue;
            };
            let lease_duration = handler
                .lease_duration()
                .unwrap_or(self.inner.config.default_lease);
            let observed = candidate.lease.as_ref().map(|lease| lease.token);

            match self
                .inner
                .store
                .try_claim(candidate.id, observed, now, lease_duration)
                .await?
            {
                Some(record) => {
                    metrics::record_job_claimed(&record.name);
                    if observed.is_some() {
                        tracing::warn!(
                            job_id = %record.id,
                            job_name = %record.name,
                            "Reclaimed job with expired lease"
                        );
                    }
                    claimed.push(ClaimedJob {
                        record,
                        handler,
                        lease_duration,
                        claimed_at: now,
                    });
                }
                None => {
                    metrics::record_lease_conflict();
                    tracing::debug!(job_id = %candidate.id, "Lost claim race");
                }
            }
        }

        Ok(claimed)
    }

    /// Run one claimed job and write back its outcome. Returns whether the
    /// handler succeeded.
    pub(crate) async fn execute(&self, job: ClaimedJob) -> bool {
        let ClaimedJob {
            record,
            handler,
            lease_duration,
            claimed_at,
        } = job;
        let Some(lease) = record.lease.clone() else {
            tracing::error!(job_id = %record.id, "Claimed job has no lease");
            return false;
        };

        let ctx = JobContext::new(record.clone(), lease.clone(), lease_duration, self.inner.store.clone());
        let span = tracing::info_span!(
            "job",
            job_id = %record.id,
            job_name = %record.name,
            attempt = ctx.attempt()
        );

        let started = Instant::now();
        let outcome: JobResult = match record.payload() {
            Ok(payload) => handler.execute(&ctx, payload).instrument(span).await,
            Err(error) => Err(JobError::from(error)),
        };
        let elapsed = started.elapsed();
        let finished_at = claimed_at + chrono_duration(elapsed);
        let succeeded = outcome.is_ok();

        match &outcome {
            Ok(()) => ctx.log_info("Job completed"),
            Err(error) => ctx.log_error(&format!("Job failed: {}", error)),
        }

        let applied = match dispose(&record, handler.as_ref(), &outcome, finished_at) {
            Disposition::Remove => self.inner.store.remove(record.id, lease.token).await,
            Disposition::Finish(update) => self.inner.store.finish(record.id, lease.token, &update).await,
        };
        match applied {
            Ok(true) => {}
            Ok(false) => {
                metrics::record_lease_conflict();
                ctx.log_warn("Lease lost or row cancelled before completion, bookkeeping skipped");
            }
            Err(error) => {
                tracing::error!(job_id = %record.id, error = %error, "Failed to record job outcome");
            }
        }

        let stats = &self.inner.stats;
        stats.processed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_job_finished(&record.name, succeeded, elapsed.as_secs_f64());

        succeeded
    }
}

/// Decide the row's next state from the handler outcome.
fn dispose(
    record: &JobRecord,
    handler: &dyn JobHandler,
    outcome: &JobResult,
    finished_at: DateTime<Utc>,
) -> Disposition {
    let fail_reason = outcome.as_ref().err().map(|error| error.to_string());

    if record.is_recurring() {
        let next_run_at = match record.recurrence().and_then(|r| match r {
            Some(recurrence) => recurrence.next_after(finished_at).map(Some),
            None => Ok(None),
        }) {
            Ok(next) => next,
            Err(error) => {
                tracing::error!(
                    job_id = %record.id,
                    repeat_interval = ?record.repeat_interval,
                    error = %error,
                    "Recurring job has an unusable schedule, parking it"
                );
                None
            }
        };
        return Disposition::Finish(RunUpdate {
            finished_at,
            next_run_at,
            fail_reason,
        });
    }

    match outcome {
        Ok(()) => Disposition::Remove,
        Err(error) => {
            let policy = handler.retry_policy();
            let next_run_at = policy
                .should_retry(record.fail_count, error)
                .then(|| finished_at + chrono_duration(policy.next_retry_delay(record.fail_count)));
            Disposition::Finish(RunUpdate {
                finished_at,
                next_run_at,
                fail_reason,
            })
        }
    }
}
