//! Job store backends.
//!
//! The store is the only coordination point between scheduler processes.
//! Claims are a compare-and-set on the lease token observed when the row was
//! selected, so two processes racing for the same due row cannot both win,
//! and an expired lease is reclaimed exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::job::{chrono_duration, JobId, JobRecord, Lease};
use crate::error::Result;

/// Selects job rows by name and/or payload containment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub name: Option<String>,
    /// JSON that must be contained in the row's payload data
    pub data: Option<serde_json::Value>,
}

impl JobFilter {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        let name_ok = self.name.as_deref().map_or(true, |name| record.name == name);
        let data_ok = self
            .data
            .as_ref()
            .map_or(true, |needle| json_contains(&record.data, needle));
        name_ok && data_ok
    }
}

/// JSON containment with the same meaning as Postgres `@>` for objects and
/// scalars: every key in `needle` exists in `haystack` with a contained value.
pub fn json_contains(haystack: &serde_json::Value, needle: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(key, value)| h.get(key).map_or(false, |hv| json_contains(hv, value))),
        (Value::Array(h), Value::Array(n)) => n
            .iter()
            .all(|value| h.iter().any(|hv| json_contains(hv, value))),
        (h, n) => h == n,
    }
}

/// Bookkeeping written when a handler run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub finished_at: DateTime<Utc>,
    /// `None` leaves a one-shot job terminally finished
    pub next_run_at: Option<DateTime<Utc>>,
    /// Present when the handler failed
    pub fail_reason: Option<String>,
}

/// What registering a recurring job did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No recurring row with this name existed
    Inserted(JobId),
    /// Schedule or payload changed; the row now follows the new schedule
    Rescheduled(JobId),
    /// Same schedule and payload; next run, history and lease are untouched
    Unchanged(JobId),
}

impl Registration {
    pub fn id(&self) -> JobId {
        match self {
            Self::Inserted(id) | Self::Rescheduled(id) | Self::Unchanged(id) => *id,
        }
    }
}

/// Trait for job store backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row.
    async fn insert(&self, job: &JobRecord) -> Result<()>;

    /// Insert `job` as the single recurring row for its name, or reconcile
    /// the existing one. Atomic per name: concurrent registrations never
    /// leave two recurring rows.
    async fn upsert_recurring(&self, job: &JobRecord) -> Result<Registration>;

    /// Rows with the given names that are due and not held by a live lease,
    /// highest priority first.
    async fn due(&self, names: &[String], now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>>;

    /// Atomically take the lease if it still carries `observed` and is free
    /// or expired. Returns the claimed row, or `None` if another claimer won.
    async fn try_claim(
        &self,
        id: JobId,
        observed: Option<Uuid>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>>;

    /// Push out the expiry of a lease we still hold.
    async fn renew(&self, id: JobId, token: Uuid, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Release the lease and record the run outcome.
    async fn finish(&self, id: JobId, token: Uuid, update: &RunUpdate) -> Result<bool>;

    /// Delete a row we hold the lease on (successful one-shot jobs).
    async fn remove(&self, id: JobId, token: Uuid) -> Result<bool>;

    /// Rows matching a filter.
    async fn find(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Hard-delete rows matching a filter, leased or not.
    async fn delete(&self, filter: &JobFilter) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store with the same claim semantics as the Postgres store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Snapshot of one row.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.lock().get(&id).cloned()
    }
}

fn holds(record: &JobRecord, token: Uuid) -> bool {
    record.lease.as_ref().map_or(false, |lease| lease.token == token)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn upsert_recurring(&self, job: &JobRecord) -> Result<Registration> {
        let mut jobs = self.jobs.lock();
        let existing = jobs
            .values_mut()
            .find(|row| row.name == job.name && row.is_recurring());

        let Some(row) = existing else {
            jobs.insert(job.id, job.clone());
            return Ok(Registration::Inserted(job.id));
        };

        let unchanged =
            row.repeat_interval == job.repeat_interval && row.data == job.data && row.next_run_at.is_some();
        if unchanged {
            return Ok(Registration::Unchanged(row.id));
        }

        row.data = job.data.clone();
        row.priority = job.priority;
        row.repeat_interval = job.repeat_interval.clone();
        row.next_run_at = job.next_run_at;
        Ok(Registration::Rescheduled(row.id))
    }

    async fn due(&self, names: &[String], now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock();
        let mut due: Vec<JobRecord> = jobs
            .values()
            .filter(|job| names.iter().any(|name| name == &job.name) && job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_run_at.cmp(&b.next_run_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: JobId,
        observed: Option<Uuid>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        let current = job.lease.as_ref().map(|lease| lease.token);
        if current != observed || !job.is_due(now) {
            return Ok(None);
        }

        job.lease = Some(Lease {
            token: Uuid::new_v4(),
            locked_at: now,
            expires_at: now + chrono_duration(lease),
        });
        job.last_run_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn renew(&self, id: JobId, token: Uuid, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&id) {
            Some(job) if holds(job, token) => {
                if let Some(lease) = job.lease.as_mut() {
                    lease.expires_at = expires_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: JobId, token: Uuid, update: &RunUpdate) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&id) {
            Some(job) if holds(job, token) => {
                job.lease = None;
                job.last_finished_at = Some(update.finished_at);
                job.next_run_at = update.next_run_at;
                if let Some(reason) = &update.fail_reason {
                    job.fail_count += 1;
                    job.fail_reason = Some(reason.clone());
                    job.failed_at = Some(update.finished_at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: JobId, token: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        if jobs.get(&id).map_or(false, |job| holds(job, token)) {
            jobs.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn find(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock();
        let mut found: Vec<JobRecord> = jobs.values().filter(|job| filter.matches(job)).cloned().collect();
        found.sort_by_key(|job| job.created_at);
        Ok(found)
    }

    async fn delete(&self, filter: &JobFilter) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }
}
