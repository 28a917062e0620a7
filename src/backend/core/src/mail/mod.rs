//! Outgoing email: transport seam, recipient filtering and HTML helpers.

pub mod ses;

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;

use crate::error::{LecternError, Result};

pub use ses::SesTransport;

/// Provider placeholder replaced with an open-tracking pixel.
pub const OPEN_TRACKER: &str = "{{ses:openTracker}}";

/// One provider call. Batches go out as BCC so recipients never see each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: String,
    /// Provider tags, e.g. `("newsletter_id", "...")`
    pub tags: Vec<(String, String)>,
}

impl OutgoingEmail {
    pub fn new(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
            ..Self::default()
        }
    }

    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    pub fn bcc(mut self, addresses: impl IntoIterator<Item = String>) -> Self {
        self.bcc.extend(addresses);
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.bcc.len()
    }
}

/// Email provider.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send one message and return the provider's message id.
    ///
    /// Throttling must surface as `ErrorCode::MailRateLimited`.
    async fn send(&self, email: &OutgoingEmail) -> Result<String>;
}

/// Canonical form used for every set comparison.
pub fn normalize_email(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Drops addresses that should never receive bulk mail.
pub struct RecipientFilter {
    bot_patterns: Vec<Regex>,
}

impl RecipientFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let bot_patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    LecternError::configuration(format!("invalid bot pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bot_patterns })
    }

    pub fn is_bot(&self, address: &str) -> bool {
        self.bot_patterns.iter().any(|pattern| pattern.is_match(address))
    }

    /// `recipients - delivered - blacklist - bots`, in recipient order.
    ///
    /// Comparison uses the normalized address; the returned entries are the
    /// recipients exactly as stored, first occurrence only.
    pub fn pending(&self, recipients: &[String], delivered: &[String], blacklist: &HashSet<String>) -> Vec<String> {
        let mut seen: HashSet<String> = delivered.iter().map(|d| normalize_email(d)).collect();
        recipients
            .iter()
            .filter(|recipient| {
                let normalized = normalize_email(recipient);
                !normalized.is_empty()
                    && !blacklist.contains(&normalized)
                    && !self.is_bot(&normalized)
                    && seen.insert(normalized)
            })
            .cloned()
            .collect()
    }
}

/// Insert the open-tracking placeholder right after `<body…>`, or at the
/// start when there is no body tag. Idempotent.
pub fn inject_open_tracker(html: &str) -> String {
    if html.contains(OPEN_TRACKER) {
        return html.to_string();
    }
    let lower = html.to_ascii_lowercase();
    let body_open = lower
        .match_indices("<body")
        .find(|(i, _)| {
            lower[i + 5..]
                .chars()
                .next()
                .map_or(false, |c| c == '>' || c.is_whitespace())
        })
        .and_then(|(i, _)| lower[i..].find('>').map(|end| i + end + 1));

    match body_open {
        Some(at) => format!("{}{}{}", &html[..at], OPEN_TRACKER, &html[at..]),
        None => format!("{}{}", OPEN_TRACKER, html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailConfig;

    fn filter() -> RecipientFilter {
        RecipientFilter::new(&MailConfig::default().bot_patterns).unwrap()
    }

    #[test]
    fn test_default_bot_patterns() {
        let filter = filter();
        for bot in ["noreply@acme.io", "no-reply@acme.io", "x@mailinator.com", "ana@example.com", "test1@acme.io"] {
            assert!(filter.is_bot(bot), "{}", bot);
        }
        for human in ["ana@acme.io", "contest@acme.io", "reply@acme.io"] {
            assert!(!filter.is_bot(human), "{}", human);
        }
    }

    #[test]
    fn test_pending_excludes_delivered_blacklisted_and_bots() {
        let recipients: Vec<String> = ["Ana@Acme.io", "bo@acme.io", "ana@acme.io ", "cy@acme.io", "noreply@acme.io", "di@acme.io"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let delivered = vec!["bo@acme.io".to_string()];
        let blacklist: HashSet<String> = ["cy@acme.io".to_string()].into_iter().collect();

        assert_eq!(
            filter().pending(&recipients, &delivered, &blacklist),
            vec!["Ana@Acme.io", "di@acme.io"]
        );
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let err = RecipientFilter::new(&["(".to_string()]).err().unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_inject_open_tracker() {
        assert_eq!(
            inject_open_tracker("<html><BODY class=\"x\"><p>Hi</p></body></html>"),
            "<html><BODY class=\"x\">{{ses:openTracker}}<p>Hi</p></body></html>"
        );
        assert_eq!(inject_open_tracker("<p>Hi</p>"), "{{ses:openTracker}}<p>Hi</p>");
        assert_eq!(
            inject_open_tracker("<bodyguard><p>Hi</p>"),
            "{{ses:openTracker}}<bodyguard><p>Hi</p>"
        );
        let once = inject_open_tracker("<body><p>Hi</p></body>");
        assert_eq!(inject_open_tracker(&once), once);
    }
}
