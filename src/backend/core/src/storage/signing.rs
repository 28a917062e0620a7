//! AWS Signature Version 4.
//!
//! Used for presigned S3 URLs, signed S3 requests and SES calls. Timestamps
//! are always passed in so signatures are reproducible.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{LecternError, Result};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SigV4 refuses presigned URLs valid for longer than a week.
pub const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

/// Payload hash used when the body is not signed (presigned URLs).
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

type HmacSha256 = Hmac<Sha256>;

/// Access key pair.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    /// Both halves must be present and non-empty.
    pub fn from_parts(access_key_id: Option<&str>, secret_access_key: Option<&str>, what: &str) -> Result<Self> {
        match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok(Self {
                access_key_id: id.to_string(),
                secret_access_key: secret.to_string(),
            }),
            _ => Err(LecternError::missing_credentials(what)),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

/// A request to sign. `path` must already be URI-encoded (see [`encode_path`]).
#[derive(Debug, Clone)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    /// `host[:port]` exactly as sent in the Host header
    pub host: &'a str,
    pub path: &'a str,
    /// Unencoded query parameters
    pub query: Vec<(String, String)>,
    /// Extra headers to sign besides host and the amz headers
    pub headers: Vec<(String, String)>,
}

/// Signer bound to one region and service.
#[derive(Debug, Clone)]
pub struct SigV4 {
    credentials: Credentials,
    region: String,
    service: String,
}

impl SigV4 {
    pub fn new(credentials: Credentials, region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: service.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn scope(&self, date: &str) -> String {
        format!("{}/{}/{}/aws4_request", date, self.region, self.service)
    }

    fn signing_key(&self, date: &str) -> Result<Vec<u8>> {
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, self.service.as_bytes())?;
        hmac(&k_service, b"aws4_request")
    }

    fn signature(&self, canonical_request: &str, amz_date: &str, date: &str) -> Result<String> {
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            self.scope(date),
            sha256_hex(canonical_request.as_bytes())
        );
        let key = self.signing_key(date)?;
        Ok(hex::encode(hmac(&key, string_to_sign.as_bytes())?))
    }

    /// Query string (without `?`) granting `expires_secs` of access, signature included.
    pub fn presign(&self, request: &SignableRequest<'_>, expires_secs: u64, now: DateTime<Utc>) -> Result<String> {
        if expires_secs == 0 || expires_secs > MAX_PRESIGN_SECS {
            return Err(LecternError::validation(format!(
                "Presigned URL expiry must be between 1 and {} seconds, got {}",
                MAX_PRESIGN_SECS, expires_secs
            )));
        }
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let (canonical_headers, signed_headers) = canonical_headers(request.host, &request.headers);

        let mut query = request.query.clone();
        query.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        query.push((
            "X-Amz-Credential".into(),
            format!("{}/{}", self.credentials.access_key_id, self.scope(&date)),
        ));
        query.push(("X-Amz-Date".into(), amz_date.clone()));
        query.push(("X-Amz-Expires".into(), expires_secs.to_string()));
        query.push(("X-Amz-SignedHeaders".into(), signed_headers.clone()));
        let canonical_query = canonical_query(&query);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method, request.path, canonical_query, canonical_headers, signed_headers, UNSIGNED_PAYLOAD
        );
        let signature = self.signature(&canonical_request, &amz_date, &date)?;

        Ok(format!("{}&X-Amz-Signature={}", canonical_query, signature))
    }

    /// Headers to attach for a header-signed request: `x-amz-date`,
    /// `x-amz-content-sha256` and `authorization`.
    pub fn sign(
        &self,
        request: &SignableRequest<'_>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let mut headers = request.headers.clone();
        headers.push(("x-amz-content-sha256".into(), payload_hash.to_string()));
        headers.push(("x-amz-date".into(), amz_date.clone()));
        let (canonical_headers, signed_headers) = canonical_headers(request.host, &headers);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method,
            request.path,
            canonical_query(&request.query),
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let signature = self.signature(&canonical_request, &amz_date, &date)?;
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.credentials.access_key_id,
            self.scope(&date),
            signed_headers,
            signature
        );

        Ok(vec![
            ("x-amz-date".into(), amz_date),
            ("x-amz-content-sha256".into(), payload_hash.to_string()),
            ("authorization".into(), authorization),
        ])
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| LecternError::internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 encoding of every byte outside the unreserved set.
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Canonical path from unencoded segments: `/seg1/seg2`.
pub fn encode_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(&uri_encode(segment));
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Sorted, encoded `k=v&k=v`. Also valid as the wire query string.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_headers(host: &str, extra: &[(String, String)]) -> (String, String) {
    let mut headers: Vec<(String, String)> = extra
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.push(("host".into(), host.to_string()));
    headers.sort();

    let canonical = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect::<String>();
    let signed = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    (canonical, signed)
}
