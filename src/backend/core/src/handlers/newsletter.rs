//! `send_newsletter`: resumable bulk delivery of one newsletter.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::batch::BatchSender;
use crate::catalog::{CatalogStore, NewsletterStatus};
use crate::error::Result;
use crate::jobs::{names, JobContext, JobError, JobHandler, JobPayload, JobResult, RetryPolicy};
use crate::mail::{inject_open_tracker, OutgoingEmail, RecipientFilter};

pub struct SendNewsletterHandler {
    catalog: Arc<dyn CatalogStore>,
    sender: BatchSender,
    filter: RecipientFilter,
}

impl SendNewsletterHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, sender: BatchSender, filter: RecipientFilter) -> Self {
        Self { catalog, sender, filter }
    }

    async fn deliver(&self, ctx: &JobContext, newsletter_id: &str) -> Result<bool> {
        let newsletter = self.catalog.get_newsletter(newsletter_id).await?;
        if newsletter.status == NewsletterStatus::Sent {
            ctx.log_info("Newsletter already sent, nothing to do");
            return Ok(true);
        }

        let blacklist = self.catalog.blacklisted_emails().await?;
        let pending = self
            .filter
            .pending(&newsletter.recipients, &newsletter.delivered, &blacklist);
        info!(
            newsletter_id,
            recipients = newsletter.recipients.len(),
            delivered = newsletter.delivered.len(),
            pending = pending.len(),
            "Delivering newsletter"
        );

        let html = inject_open_tracker(&newsletter.content);
        let catalog = &self.catalog;
        let outcome = self
            .sender
            .send(
                &pending,
                |batch: &[String]| {
                    OutgoingEmail::new(newsletter.subject.as_str(), html.as_str())
                        .bcc(batch.to_vec())
                        .tag("newsletter_id", newsletter_id)
                },
                |emails, message_id| async move {
                    catalog.append_delivery(newsletter_id, &emails, &message_id).await
                },
            )
            .await?;

        if !outcome.is_complete() {
            ctx.log_warn(&format!(
                "{} of {} batches abandoned ({} recipients)",
                outcome.batches_abandoned,
                outcome.batches_sent + outcome.batches_abandoned,
                outcome.recipients_abandoned
            ));
            return Ok(false);
        }

        self.catalog.mark_newsletter_sent(newsletter_id, Utc::now()).await?;
        ctx.log_info(&format!("Newsletter sent to {} recipients", outcome.recipients_sent));
        Ok(true)
    }
}

#[async_trait]
impl JobHandler for SendNewsletterHandler {
    fn name(&self) -> &'static str {
        names::SEND_NEWSLETTER
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(2)
    }

    async fn execute(&self, ctx: &JobContext, payload: JobPayload) -> JobResult {
        let JobPayload::SendNewsletter(request) = payload else {
            return Err(JobError::fatal(format!("unexpected payload for {}", self.name())));
        };

        match self.deliver(ctx, &request.newsletter_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(JobError::retryable(format!(
                "newsletter {} partially delivered",
                request.newsletter_id
            ))
            .with_code("PARTIAL_DELIVERY")),
            Err(e) => {
                e.log();
                Err(e.into())
            }
        }
    }
}
