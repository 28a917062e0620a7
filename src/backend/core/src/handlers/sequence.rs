//! `process_sequences`: advance every due drip-sequence enrollment by one email.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, EnrollmentStatus, EnrollmentUpdate, ReadyEnrollment};
use crate::error::Result;
use crate::jobs::{names, JobContext, JobHandler, JobPayload, JobResult};
use crate::mail::{inject_open_tracker, EmailTransport, OutgoingEmail};
use crate::observability::metrics::record_emails_sent;

/// What one pass did to one enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Sent,
    Completed,
    Unsubscribed,
}

/// Cursor state after the email at `current_email_index` went out at `now`.
pub fn advance_after_send(ready: &ReadyEnrollment, now: DateTime<Utc>) -> EnrollmentUpdate {
    let enrollment = &ready.enrollment;
    let next_index = enrollment.current_email_index + 1;
    let next_email = usize::try_from(next_index).ok().and_then(|i| ready.emails.get(i));

    match next_email {
        Some(email) => EnrollmentUpdate {
            status: EnrollmentStatus::Active,
            current_email_index: next_index,
            emails_sent: enrollment.emails_sent + 1,
            next_email_at: Some(email.schedule.next_send_at(now)),
            completed_at: None,
        },
        None => EnrollmentUpdate {
            status: EnrollmentStatus::Completed,
            current_email_index: next_index,
            emails_sent: enrollment.emails_sent + 1,
            next_email_at: None,
            completed_at: Some(now),
        },
    }
}

pub struct ProcessSequencesHandler {
    catalog: Arc<dyn CatalogStore>,
    transport: Arc<dyn EmailTransport>,
}

impl ProcessSequencesHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, transport: Arc<dyn EmailTransport>) -> Self {
        Self { catalog, transport }
    }

    async fn advance(&self, ready: &ReadyEnrollment, now: DateTime<Utc>) -> Result<Advance> {
        let enrollment = &ready.enrollment;

        if ready.blacklisted {
            let update = EnrollmentUpdate {
                status: EnrollmentStatus::Unsubscribed,
                current_email_index: enrollment.current_email_index,
                emails_sent: enrollment.emails_sent,
                next_email_at: None,
                completed_at: None,
            };
            self.catalog.update_enrollment(&enrollment.id, &update).await?;
            return Ok(Advance::Unsubscribed);
        }

        let current = usize::try_from(enrollment.current_email_index)
            .ok()
            .and_then(|i| ready.emails.get(i));
        let Some(email) = current else {
            let update = EnrollmentUpdate {
                status: EnrollmentStatus::Completed,
                current_email_index: enrollment.current_email_index,
                emails_sent: enrollment.emails_sent,
                next_email_at: None,
                completed_at: Some(now),
            };
            self.catalog.update_enrollment(&enrollment.id, &update).await?;
            return Ok(Advance::Completed);
        };

        let message = OutgoingEmail::new(email.subject.as_str(), inject_open_tracker(&email.content))
            .to(ready.subscriber_email.as_str())
            .tag("sequence_id", enrollment.sequence_id.as_str())
            .tag("sequence_email_id", email.id.as_str());
        let message_id = self.transport.send(&message).await?;
        record_emails_sent(1);
        debug!(enrollment_id = %enrollment.id, message_id = %message_id, "Sequence email sent");

        let update = advance_after_send(ready, now);
        self.catalog.update_enrollment(&enrollment.id, &update).await?;
        Ok(if update.status == EnrollmentStatus::Completed {
            Advance::Completed
        } else {
            Advance::Sent
        })
    }
}

#[async_trait]
impl JobHandler for ProcessSequencesHandler {
    fn name(&self) -> &'static str {
        names::PROCESS_SEQUENCES
    }

    async fn execute(&self, ctx: &JobContext, _payload: JobPayload) -> JobResult {
        let now = Utc::now();
        let ready = self.catalog.ready_enrollments(now).await?;
        if ready.is_empty() {
            debug!("No sequence emails due");
            return Ok(());
        }

        let (mut sent, mut completed, mut unsubscribed, mut failed) = (0, 0, 0, 0);
        for enrollment in &ready {
            match self.advance(enrollment, now).await {
                Ok(Advance::Sent) => sent += 1,
                Ok(Advance::Completed) => completed += 1,
                Ok(Advance::Unsubscribed) => unsubscribed += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        enrollment_id = %enrollment.enrollment.id,
                        sequence = %enrollment.sequence_name,
                        error = %e,
                        "Sequence email failed, will retry next pass"
                    );
                }
            }
        }

        info!(due = ready.len(), sent, completed, unsubscribed, failed, "Sequences processed");
        if failed > 0 {
            ctx.log_warn(&format!("{} enrollments left for the next pass", failed));
        }
        Ok(())
    }
}
