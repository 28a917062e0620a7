//! S3-compatible REST backend (path-style addressing, SigV4 header signing).

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use super::signing::{canonical_query, encode_path, sha256_hex, Credentials, SigV4, SignableRequest};
use super::{host_header, object_path, origin, ObjectStore, PutOptions};
use crate::config::StorageConfig;
use crate::error::{LecternError, Result};

/// DeleteObjects accepts at most this many keys per request.
const DELETE_CHUNK: usize = 1000;

pub struct S3ObjectStore {
    client: reqwest::Client,
    origin: String,
    host: String,
    bucket: String,
    signer: SigV4,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResult {
    #[serde(rename = "Error", default)]
    errors: Vec<DeleteError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteError {
    key: String,
    code: String,
    #[serde(default)]
    message: String,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let credentials = Credentials::from_parts(
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
            "object storage",
        )?;
        let endpoint = Url::parse(&config.endpoint).map_err(|_| {
            LecternError::configuration(format!("storage.endpoint is not a valid URL: '{}'", config.endpoint))
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            origin: origin(&endpoint),
            host: host_header(&endpoint)?,
            bucket: config.bucket.clone(),
            signer: SigV4::new(credentials, config.region.clone(), "s3"),
        })
    }

    /// Sign and send one request.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let payload_hash = sha256_hex(&body);
        let method_name = method.to_string();
        let request = SignableRequest {
            method: &method_name,
            host: &self.host,
            path,
            query,
            headers,
        };
        let signed = self.signer.sign(&request, &payload_hash, Utc::now())?;

        let query_string = canonical_query(&request.query);
        let url = if query_string.is_empty() {
            format!("{}{}", self.origin, path)
        } else {
            format!("{}{}?{}", self.origin, path, query_string)
        };

        let mut builder = self.client.request(method, url).body(body);
        for (name, value) in request.headers.into_iter().chain(signed) {
            builder = builder.header(name, value);
        }
        Ok(builder.send().await?)
    }
}

async fn failure(op: &'static str, key: &str, response: reqwest::Response) -> LecternError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    LecternError::storage(op, key, format!("HTTP {}: {}", status, body.trim()))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body, options), fields(bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, options: &PutOptions) -> Result<()> {
        let mut headers = vec![("content-type".to_string(), options.content_type.clone())];
        if let Some(cache_control) = &options.cache_control {
            headers.push(("cache-control".to_string(), cache_control.clone()));
        }

        let response = self
            .send(Method::PUT, &object_path(&self.bucket, key), Vec::new(), headers, body)
            .await?;
        if !response.status().is_success() {
            return Err(failure("put", key, response).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .send(Method::GET, &object_path(&self.bucket, key), Vec::new(), Vec::new(), Bytes::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(LecternError::object_not_found(key)),
            _ => Err(failure("get", key, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = encode_path([self.bucket.as_str()]);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = continuation.take() {
                query.push(("continuation-token".to_string(), token));
            }

            let response = self.send(Method::GET, &path, query, Vec::new(), Bytes::new()).await?;
            if !response.status().is_success() {
                return Err(failure("list", prefix, response).await);
            }
            let page: ListBucketResult = quick_xml::de::from_str(&response.text().await?)?;
            keys.extend(page.contents.into_iter().map(|object| object.key));

            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let path = encode_path([self.bucket.as_str()]);

        for chunk in keys.chunks(DELETE_CHUNK) {
            let mut body = String::from("<Delete><Quiet>true</Quiet>");
            for key in chunk {
                body.push_str("<Object><Key>");
                body.push_str(&quick_xml::escape::escape(key.as_str()));
                body.push_str("</Key></Object>");
            }
            body.push_str("</Delete>");

            let digest = md5::compute(body.as_bytes());
            let headers = vec![
                ("content-type".to_string(), "application/xml".to_string()),
                (
                    "content-md5".to_string(),
                    base64::engine::general_purpose::STANDARD.encode(digest.0),
                ),
            ];
            let query = vec![("delete".to_string(), String::new())];

            let response = self
                .send(Method::POST, &path, query, headers, Bytes::from(body))
                .await?;
            if !response.status().is_success() {
                return Err(failure("delete", &chunk[0], response).await);
            }

            let text = response.text().await?;
            if !text.trim().is_empty() {
                let result: DeleteResult = quick_xml::de::from_str(&text)?;
                if let Some(first) = result.errors.first() {
                    return Err(LecternError::storage(
                        "delete",
                        &first.key,
                        format!("{}: {} ({} keys failed)", first.code, first.message, result.errors.len()),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path, query_param};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    struct FirstPage;

    impl Match for FirstPage {
        fn matches(&self, request: &Request) -> bool {
            !request.url.query_pairs().any(|(name, _)| name == "continuation-token")
        }
    }

    fn store(server: &MockServer) -> S3ObjectStore {
        let config = StorageConfig {
            endpoint: server.uri(),
            bucket: "media".into(),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("secret".into()),
            ..StorageConfig::default()
        };
        S3ObjectStore::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_put_sends_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/videos/c1/v1/hls/master.m3u8"))
            .and(header("content-type", "application/x-mpegURL"))
            .and(header("cache-control", "no-cache"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .put(
                "videos/c1/v1/hls/master.m3u8",
                Bytes::from_static(b"#EXTM3U\n"),
                &PutOptions::for_stream_file("master.m3u8"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/missing.mp4"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<Error><Code>NoSuchKey</Code></Error>"))
            .mount(&server)
            .await;

        let err = store(&server).get("missing.mp4").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ObjectNotFound);
    }

    #[tokio::test]
    async fn test_list_follows_continuation_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media"))
            .and(query_param("list-type", "2"))
            .and(query_param("prefix", "videos/c1/"))
            .and(FirstPage)
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>media</Name>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>videos/c1/a.mp4</Key><Size>10</Size></Contents>
  <Contents><Key>videos/c1/b.mp4</Key><Size>12</Size></Contents>
  <NextContinuationToken>page-2</NextContinuationToken>
</ListBucketResult>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/media"))
            .and(query_param("continuation-token", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>videos/c1/c.mp4</Key></Contents>
</ListBucketResult>"#,
            ))
            .mount(&server)
            .await;

        let keys = store(&server).list("videos/c1/").await.unwrap();
        assert_eq!(keys, vec!["videos/c1/a.mp4", "videos/c1/b.mp4", "videos/c1/c.mp4"]);
    }

    #[tokio::test]
    async fn test_list_empty_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"),
            )
            .mount(&server)
            .await;

        assert!(store(&server).list("nothing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_many_posts_checksummed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/media"))
            .and(query_param("delete", ""))
            .and(header_exists("content-md5"))
            .and(body_string_contains("<Key>videos/c1/a&amp;b.mp4</Key>"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<DeleteResult></DeleteResult>"))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .delete_many(&["videos/c1/a&b.mp4".to_string(), "videos/c1/c.mp4".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_many_reports_per_key_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/media"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<DeleteResult><Error><Key>videos/c1/a.mp4</Key><Code>AccessDenied</Code><Message>Access Denied</Message></Error></DeleteResult>",
            ))
            .mount(&server)
            .await;

        let err = store(&server)
            .delete_many(&["videos/c1/a.mp4".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::StorageError);
        assert!(err.status_message().contains("AccessDenied"));
    }
}
