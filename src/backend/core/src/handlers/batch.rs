//! Rate-limit aware batch delivery.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MailConfig;
use crate::error::{ErrorCode, Result};
use crate::jobs::BackoffStrategy;
use crate::mail::{EmailTransport, OutgoingEmail};
use crate::observability::metrics::{record_batch_abandoned, record_emails_sent};

/// Batch sizing and retry budget.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Pause between consecutive batches, independent of retry backoff
    pub batch_delay: Duration,
    /// Extra attempts per batch after a rate-limit response
    pub rate_limit_retries: u32,
    pub backoff: BackoffStrategy,
}

impl BatchSettings {
    pub fn from_config(config: &MailConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay,
            rate_limit_retries: config.rate_limit_retries,
            backoff: BackoffStrategy::doubling(config.backoff_base_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batches_sent: usize,
    pub recipients_sent: usize,
    pub batches_abandoned: usize,
    pub recipients_abandoned: usize,
    /// Provider calls, retries included
    pub attempts: usize,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.batches_abandoned == 0
    }
}

pub struct BatchSender {
    transport: Arc<dyn EmailTransport>,
    settings: BatchSettings,
}

impl BatchSender {
    pub fn new(transport: Arc<dyn EmailTransport>, settings: BatchSettings) -> Self {
        Self { transport, settings }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Send `recipients` in fixed-size batches.
    ///
    /// `build` renders one provider call for a batch. `delivered` runs after
    /// every accepted batch with its recipients and message id; an error there
    /// stops the run, since the delivery could not be recorded.
    pub async fn send<B, D, F>(&self, recipients: &[String], build: B, mut delivered: D) -> Result<BatchOutcome>
    where
        B: Fn(&[String]) -> OutgoingEmail,
        D: FnMut(Vec<String>, String) -> F,
        F: Future<Output = Result<()>>,
    {
        let mut outcome = BatchOutcome::default();
        let batches: Vec<&[String]> = recipients.chunks(self.settings.batch_size).collect();
        let total = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let email = build(batch);
            match self.send_with_backoff(&email, &mut outcome).await {
                Some(message_id) => {
                    delivered(batch.to_vec(), message_id).await?;
                    outcome.batches_sent += 1;
                    outcome.recipients_sent += batch.len();
                    record_emails_sent(batch.len() as u64);
                    info!(batch = index + 1, total, size = batch.len(), "Batch delivered");
                }
                None => {
                    outcome.batches_abandoned += 1;
                    outcome.recipients_abandoned += batch.len();
                    record_batch_abandoned();
                }
            }
        }

        Ok(outcome)
    }

    /// `None` when the batch was abandoned.
    async fn send_with_backoff(&self, email: &OutgoingEmail, outcome: &mut BatchOutcome) -> Option<String> {
        let mut retries = 0;
        loop {
            outcome.attempts += 1;
            match self.transport.send(email).await {
                Ok(message_id) => return Some(message_id),
                Err(e) if e.code() == ErrorCode::MailRateLimited && retries < self.settings.rate_limit_retries => {
                    let delay = self.settings.backoff.delay_for_attempt(retries);
                    retries += 1;
                    warn!(retry = retries, delay_secs = delay.as_secs(), "Rate limited, retrying batch");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        recipients = email.recipient_count(),
                        retries,
                        "Abandoning batch"
                    );
                    return None;
                }
            }
        }
    }
}
