//! Object storage gateway.
//!
//! Wraps an S3-compatible [`ObjectStore`] with the key layout, cache policy
//! and signed-URL issuance the job handlers need. Signed URLs can also be
//! issued against an endpoint and bucket recovered from an absolute URL stored
//! on an older record.

pub mod memory;
pub mod s3;
pub mod signing;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::StorageConfig;
use crate::error::{LecternError, Result};
use signing::{encode_path, Credentials, SigV4, SignableRequest};

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

const PLAYLIST_CACHE_CONTROL: &str = "no-cache";
const SEGMENT_CACHE_CONTROL: &str = "private, max-age=1800";
const ORIGINAL_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Headers stored with an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: String,
    pub cache_control: Option<String>,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            cache_control: None,
        }
    }

    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    /// Content type and cache policy for a streaming file, by extension.
    pub fn for_stream_file(name: &str) -> Self {
        if name.ends_with(".m3u8") {
            Self::new("application/x-mpegURL").cache_control(PLAYLIST_CACHE_CONTROL)
        } else if name.ends_with(".ts") {
            Self::new("video/MP2T").cache_control(SEGMENT_CACHE_CONTROL)
        } else {
            Self::new("application/octet-stream").cache_control(SEGMENT_CACHE_CONTROL)
        }
    }
}

/// Trait for object storage backends.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, options: &PutOptions) -> Result<()>;

    /// Fails with `ObjectNotFound` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Every key under `prefix`, across all result pages.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete keys. Missing keys are not an error.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;
}

/// One file of a batch upload, named relative to the batch prefix.
#[derive(Debug, Clone)]
pub struct NamedObject {
    pub name: String,
    pub body: Bytes,
}

/// Presigned browser upload target.
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub upload_url: String,
    pub key: String,
    pub public_url: String,
}

/// Gateway used by handlers and request code.
pub struct StorageGateway {
    store: Arc<dyn ObjectStore>,
    signer: SigV4,
    endpoint: Url,
    config: StorageConfig,
}

impl StorageGateway {
    /// Gateway over an explicit backend.
    pub fn new(config: StorageConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let credentials = Credentials::from_parts(
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
            "object storage",
        )?;
        if config.bucket.is_empty() {
            return Err(LecternError::configuration("storage.bucket is not set"));
        }
        let endpoint = parse_endpoint(&config.endpoint)?;
        let signer = SigV4::new(credentials, config.region.clone(), "s3");

        Ok(Self {
            store,
            signer,
            endpoint,
            config,
        })
    }

    /// Gateway over the S3 wire protocol.
    pub fn from_config(config: StorageConfig) -> Result<Self> {
        let store = Arc::new(S3ObjectStore::new(&config)?);
        Self::new(config, store)
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// `{prefix}/{course}/{video}/original/{filename}`
    pub fn video_key(&self, course_id: &str, video_id: &str, filename: &str) -> String {
        format!("{}/{}/{}/original/{}", self.config.video_prefix, course_id, video_id, filename)
    }

    /// `{prefix}/{course}/{video}/hls`
    pub fn hls_prefix(&self, course_id: &str, video_id: &str) -> String {
        format!("{}/{}/{}/hls", self.config.video_prefix, course_id, video_id)
    }

    /// Unsigned path-style URL of an object.
    pub fn object_url(&self, key: &str) -> String {
        format!("{}{}", origin(&self.endpoint), object_path(&self.config.bucket, key))
    }

    /// Presigned PUT for a browser upload of an original video.
    pub fn video_upload_url(
        &self,
        course_id: &str,
        video_id: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<VideoUpload> {
        let key = self.video_key(course_id, video_id, filename);
        let upload_url = self.presign(
            &self.endpoint,
            &self.config.bucket,
            &key,
            "PUT",
            vec![("content-type".into(), content_type.to_string())],
            self.config.upload_url_ttl,
        )?;

        Ok(VideoUpload {
            public_url: self.object_url(&key),
            upload_url,
            key,
        })
    }

    /// Presigned GET, defaulting to the preview TTL.
    pub fn preview_url(&self, key: &str, ttl: Option<Duration>) -> Result<String> {
        let ttl = ttl.unwrap_or(self.config.preview_url_ttl);
        self.presign(&self.endpoint, &self.config.bucket, key, "GET", Vec::new(), ttl)
    }

    /// Presigned GET for playlists and segments.
    pub fn hls_url(&self, key: &str) -> Result<String> {
        self.presign(
            &self.endpoint,
            &self.config.bucket,
            key,
            "GET",
            Vec::new(),
            self.config.hls_url_ttl,
        )
    }

    /// Presigned GET against the endpoint and bucket embedded in a stored
    /// path-style URL (`scheme://host[:port]/{bucket}/{key}`).
    pub fn presign_absolute_url(&self, absolute_url: &str, ttl: Option<Duration>) -> Result<String> {
        let parsed = Url::parse(absolute_url).map_err(|_| LecternError::malformed_url(absolute_url))?;
        let segments: Vec<String> = parsed
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .map(|segment| {
                        urlencoding::decode(segment)
                            .map(|decoded| decoded.into_owned())
                            .unwrap_or_else(|_| segment.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();

        let Some((bucket, key_segments)) = segments.split_first() else {
            return Err(LecternError::malformed_url(absolute_url));
        };
        if key_segments.is_empty() {
            return Err(LecternError::malformed_url(absolute_url));
        }
        let key = key_segments.join("/");
        let ttl = ttl.unwrap_or(self.config.preview_url_ttl);

        tracing::debug!(endpoint = %origin(&parsed), bucket = %bucket, key = %key, "Presigning stored URL");
        self.presign(&parsed, bucket, &key, "GET", Vec::new(), ttl)
    }

    fn presign(
        &self,
        endpoint: &Url,
        bucket: &str,
        key: &str,
        method: &str,
        headers: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<String> {
        let host = host_header(endpoint)?;
        let path = object_path(bucket, key);
        let request = SignableRequest {
            method,
            host: &host,
            path: &path,
            query: Vec::new(),
            headers,
        };
        let query = self.signer.presign(&request, ttl.as_secs(), Utc::now())?;
        Ok(format!("{}://{}{}?{}", endpoint.scheme(), host, path, query))
    }

    /// Upload one object with long-lived caching. Returns its URL.
    pub async fn upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<String> {
        let options = PutOptions::new(content_type).cache_control(ORIGINAL_CACHE_CONTROL);
        self.store.put(key, body, &options).await?;
        Ok(self.object_url(key))
    }

    pub async fn download(&self, key: &str) -> Result<Bytes> {
        self.store.get(key).await
    }

    /// Upload files under `prefix`, in order. Returns the full keys.
    pub async fn upload_batch(&self, prefix: &str, files: &[NamedObject]) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let mut keys = Vec::with_capacity(files.len());

        for file in files {
            let key = format!("{}/{}", prefix, file.name);
            let options = PutOptions::for_stream_file(&file.name);
            self.store.put(&key, file.body.clone(), &options).await?;
            keys.push(key);
        }

        tracing::debug!(prefix = %prefix, count = keys.len(), "Batch uploaded");
        Ok(keys)
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.store.list(prefix).await
    }

    /// List then bulk-delete. An empty listing is a no-op.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.store.list(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.delete_many(&keys).await?;
        tracing::info!(prefix = %prefix, deleted = keys.len(), "Objects deleted");
        Ok(keys.len())
    }

    /// Repair a stored URL against this gateway's endpoint and bucket.
    pub fn normalize_url(&self, url: &str) -> String {
        normalize_video_url(url, self.config.endpoint.trim_end_matches('/'), &self.config.bucket)
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint).map_err(|_| {
        LecternError::configuration(format!("storage.endpoint is not a valid URL: '{}'", endpoint))
    })?;
    if url.host_str().is_none() {
        return Err(LecternError::configuration("storage.endpoint has no host"));
    }
    Ok(url)
}

/// `host[:port]` as reqwest sends it in the Host header.
pub(crate) fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| LecternError::malformed_url(url.as_str()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub(crate) fn origin(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), url.host_str().unwrap_or_default(), port),
        None => format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default()),
    }
}

/// Encoded path-style object path: `/{bucket}/{key segments}`.
pub(crate) fn object_path(bucket: &str, key: &str) -> String {
    encode_path(std::iter::once(bucket).chain(key.split('/')))
}

// ═══════════════════════════════════════════════════════════════════════════════
// URL Repair
// ═══════════════════════════════════════════════════════════════════════════════

/// Collapse every run of repeated `/{bucket}` path segments into one.
///
/// Total: returns the input unchanged when either argument is empty or the
/// URL has no path. One pass is enough for any number of repeats.
pub fn fix_bucket_duplication(url: &str, bucket: &str) -> String {
    if url.is_empty() || bucket.is_empty() {
        return url.to_string();
    }

    // Only the path is rewritten; a host equal to the bucket name is left alone.
    let path_start = match url.find("://") {
        Some(scheme_end) => url[scheme_end + 3..].find('/').map(|i| scheme_end + 3 + i),
        None => url.find('/'),
    };
    let Some(path_start) = path_start else {
        return url.to_string();
    };
    let (origin, path) = url.split_at(path_start);

    let pattern = format!("/{b}(?:/{b})+(/|$)", b = regex::escape(bucket));
    let Ok(repeated) = Regex::new(&pattern) else {
        return url.to_string();
    };
    let fixed = repeated.replace_all(path, |caps: &regex::Captures<'_>| format!("/{}{}", bucket, &caps[1]));
    format!("{}{}", origin, fixed)
}

/// Rewrite a legacy virtual-host URL (`https://{bucket}.s3.auto.amazonaws.com/`)
/// to `{endpoint}/{bucket}/`, then collapse bucket duplication.
pub fn normalize_video_url(url: &str, endpoint: &str, bucket: &str) -> String {
    if url.is_empty() || bucket.is_empty() {
        return url.to_string();
    }

    let legacy_host = format!("https://{}.s3.auto.amazonaws.com/", bucket);
    let rewritten = if url.contains(&legacy_host) && !endpoint.is_empty() {
        url.replace(&legacy_host, &format!("{}/{}/", endpoint.trim_end_matches('/'), bucket))
    } else {
        url.to_string()
    };

    fix_bucket_duplication(&rewritten, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            endpoint: "https://fly.storage.example.dev".into(),
            bucket: "media-bucket".into(),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("secret".into()),
            ..StorageConfig::default()
        }
    }

    fn gateway() -> (StorageGateway, Arc<InMemoryObjectStore>) {
        let store = Arc::new(InMemoryObjectStore::new());
        (StorageGateway::new(config(), store.clone()).unwrap(), store)
    }

    #[test]
    fn test_fix_bucket_duplication() {
        let cases = [
            ("https://h/b/b/b/x/y.m3u8", "https://h/b/x/y.m3u8"),
            ("https://h/b/b/x/y.m3u8", "https://h/b/x/y.m3u8"),
            ("https://h/b/x/y.m3u8", "https://h/b/x/y.m3u8"),
            ("https://h/b/bx/y.m3u8", "https://h/b/bx/y.m3u8"),
            ("https://h/b/b", "https://h/b"),
            ("https://b/b/x", "https://b/b/x"),
            ("", ""),
        ];
        for (input, expected) in cases {
            let once = fix_bucket_duplication(input, "b");
            assert_eq!(once, expected, "input: {}", input);
            assert_eq!(fix_bucket_duplication(&once, "b"), once);
        }
        assert_eq!(fix_bucket_duplication("https://h/b/b/x", ""), "https://h/b/b/x");
    }

    #[test]
    fn test_fix_bucket_duplication_escapes_bucket() {
        assert_eq!(
            fix_bucket_duplication("https://h/a.b/a.b/x", "a.b"),
            "https://h/a.b/x"
        );
        assert_eq!(fix_bucket_duplication("https://h/a.b/aXb/x", "a.b"), "https://h/a.b/aXb/x");
    }

    #[test]
    fn test_normalize_legacy_host() {
        let url = "https://media-bucket.s3.auto.amazonaws.com/media-bucket/videos/c1/v1/hls/master.m3u8";
        assert_eq!(
            normalize_video_url(url, "https://fly.storage.example.dev", "media-bucket"),
            "https://fly.storage.example.dev/media-bucket/videos/c1/v1/hls/master.m3u8"
        );
    }

    #[test]
    fn test_gateway_requires_credentials() {
        let config = StorageConfig {
            secret_access_key: None,
            ..config()
        };
        let err = StorageGateway::new(config, Arc::new(InMemoryObjectStore::new())).err().unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::MissingCredentials);
    }

    #[test]
    fn test_upload_url_layout() {
        let (gateway, _) = gateway();
        let upload = gateway.video_upload_url("c1", "v1", "intro.mp4", "video/mp4").unwrap();
        assert_eq!(upload.key, "videos/c1/v1/original/intro.mp4");
        assert_eq!(
            upload.public_url,
            "https://fly.storage.example.dev/media-bucket/videos/c1/v1/original/intro.mp4"
        );
        assert!(upload
            .upload_url
            .starts_with("https://fly.storage.example.dev/media-bucket/videos/c1/v1/original/intro.mp4?"));
        assert!(upload.upload_url.contains("X-Amz-Expires=3600"));
        assert!(upload.upload_url.contains("X-Amz-SignedHeaders=content-type%3Bhost"));
    }

    #[test]
    fn test_hls_url_uses_short_ttl() {
        let (gateway, _) = gateway();
        let url = gateway.hls_url("videos/c1/v1/hls/master.m3u8").unwrap();
        assert!(url.contains("X-Amz-Expires=1800"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn test_presign_absolute_url_uses_embedded_endpoint() {
        let (gateway, _) = gateway();
        let url = gateway
            .presign_absolute_url("http://old.storage.local:9000/legacy/videos/c1/v1/original/a%20b.mp4", None)
            .unwrap();
        assert!(url.starts_with("http://old.storage.local:9000/legacy/videos/c1/v1/original/a%20b.mp4?"));
        assert!(url.contains("X-Amz-Expires=3600"));

        for bad in ["not a url", "https://host.only/", "https://host.only/bucket-only"] {
            let err = gateway.presign_absolute_url(bad, None).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::MalformedUrl, "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_upload_batch_sets_cache_policy() {
        let (gateway, store) = gateway();
        let files = vec![
            NamedObject {
                name: "master.m3u8".into(),
                body: Bytes::from_static(b"#EXTM3U\n"),
            },
            NamedObject {
                name: "720p/segment_000.ts".into(),
                body: Bytes::from_static(b"\x47"),
            },
        ];

        let keys = gateway.upload_batch("videos/c1/v1/hls/", &files).await.unwrap();
        assert_eq!(keys, vec!["videos/c1/v1/hls/master.m3u8", "videos/c1/v1/hls/720p/segment_000.ts"]);

        let playlist = store.options("videos/c1/v1/hls/master.m3u8").unwrap();
        assert_eq!(playlist.content_type, "application/x-mpegURL");
        assert_eq!(playlist.cache_control.as_deref(), Some("no-cache"));
        let segment = store.options("videos/c1/v1/hls/720p/segment_000.ts").unwrap();
        assert_eq!(segment.content_type, "video/MP2T");
        assert_eq!(segment.cache_control.as_deref(), Some("private, max-age=1800"));
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let (gateway, store) = gateway();
        assert_eq!(gateway.delete_prefix("videos/c1/v1/").await.unwrap(), 0);

        gateway.upload("videos/c1/v1/original/a.mp4", Bytes::from_static(b"a"), "video/mp4").await.unwrap();
        gateway.upload("videos/c1/v1/hls/master.m3u8", Bytes::from_static(b"m"), "application/x-mpegURL").await.unwrap();
        gateway.upload("videos/c1/v2/original/b.mp4", Bytes::from_static(b"b"), "video/mp4").await.unwrap();

        assert_eq!(gateway.delete_prefix("videos/c1/v1/").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }
}
