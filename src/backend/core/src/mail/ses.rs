//! Amazon SES v2 `SendEmail` over signed HTTPS.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::{EmailTransport, OutgoingEmail};
use crate::config::MailConfig;
use crate::error::{LecternError, Result};
use crate::storage::signing::{sha256_hex, Credentials, SigV4, SignableRequest};
use crate::storage::{host_header, origin};

const PROVIDER: &str = "ses";
const SEND_PATH: &str = "/v2/email/outbound-emails";

pub struct SesTransport {
    client: reqwest::Client,
    origin: String,
    host: String,
    signer: SigV4,
    from: String,
    configuration_set: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from_email_address: &'a str,
    destination: Destination<'a>,
    content: Content<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    email_tags: Vec<EmailTag<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    configuration_set_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Destination<'a> {
    #[serde(skip_serializing_if = "no_addresses")]
    to_addresses: &'a [String],
    #[serde(skip_serializing_if = "no_addresses")]
    bcc_addresses: &'a [String],
}

fn no_addresses(addresses: &&[String]) -> bool {
    addresses.is_empty()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Content<'a> {
    simple: SimpleMessage<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SimpleMessage<'a> {
    subject: Text<'a>,
    body: Body<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Body<'a> {
    html: Text<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Text<'a> {
    data: &'a str,
    charset: &'static str,
}

impl<'a> Text<'a> {
    fn utf8(data: &'a str) -> Self {
        Self { data, charset: "UTF-8" }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EmailTag<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailResponse {
    message_id: String,
}

impl SesTransport {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let credentials = Credentials::from_parts(
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
            "email provider",
        )?;
        if config.from.trim().is_empty() {
            return Err(LecternError::configuration("mail.from is not set"));
        }

        let endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://email.{}.amazonaws.com", config.region),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|_| LecternError::configuration(format!("mail.endpoint is not a valid URL: '{}'", endpoint)))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            origin: origin(&endpoint),
            host: host_header(&endpoint)?,
            signer: SigV4::new(credentials, config.region.clone(), "ses"),
            from: config.from.clone(),
            configuration_set: config.configuration_set.clone(),
        })
    }
}

/// Whether an error response means "slow down".
fn is_throttled(status: StatusCode, body: &str) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || body.contains("TooManyRequestsException")
        || body.contains("Throttling")
        || body.contains("Maximum sending rate exceeded")
}

#[async_trait]
impl EmailTransport for SesTransport {
    #[instrument(skip(self, email), fields(recipients = email.recipient_count()))]
    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        let request = SendEmailRequest {
            from_email_address: &self.from,
            destination: Destination {
                to_addresses: &email.to,
                bcc_addresses: &email.bcc,
            },
            content: Content {
                simple: SimpleMessage {
                    subject: Text::utf8(&email.subject),
                    body: Body {
                        html: Text::utf8(&email.html),
                    },
                },
            },
            email_tags: email
                .tags
                .iter()
                .map(|(name, value)| EmailTag { name, value })
                .collect(),
            configuration_set_name: self.configuration_set.as_deref(),
        };
        let body = serde_json::to_vec(&request)?;

        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let signable = SignableRequest {
            method: "POST",
            host: &self.host,
            path: SEND_PATH,
            query: Vec::new(),
            headers,
        };
        let signed = self.signer.sign(&signable, &sha256_hex(&body), Utc::now())?;

        let mut builder = self
            .client
            .post(format!("{}{}", self.origin, SEND_PATH))
            .body(body);
        for (name, value) in signable.headers.into_iter().chain(signed) {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status.is_success() {
            let parsed: SendEmailResponse = response.json().await?;
            debug!(message_id = %parsed.message_id, "Email accepted");
            return Ok(parsed.message_id);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(1);
        let text = response.text().await.unwrap_or_default();
        if is_throttled(status, &text) {
            return Err(LecternError::rate_limited(PROVIDER, retry_after));
        }
        Err(LecternError::delivery_failed(PROVIDER, format!("HTTP {}: {}", status, text.trim())))
    }
}
