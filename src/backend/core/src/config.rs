//! Configuration management.
//!
//! Values come from `LECTERN__SECTION__KEY` environment variables, optionally
//! layered over a config file. Durations accept humantime strings (`"30m"`,
//! `"7days"`).

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Transcoding configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Email provider and bulk-send configuration
    #[serde(default)]
    pub mail: MailConfig,

    /// Backup pipeline configuration
    #[serde(default)]
    pub backup: BackupConfig,

    /// Stuck-video cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Email sequence configuration
    #[serde(default)]
    pub sequences: SequenceConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Name reported in logs, identifies this process among peers
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// How often the store is polled for due jobs
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum handlers running at once in this process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum jobs claimed per poll
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,

    /// Lease lifetime for handlers that do not override it
    #[serde(default = "default_lease", with = "humantime_serde")]
    pub default_lease: Duration,

    /// How long shutdown waits for in-flight handlers
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
            claim_batch: default_claim_batch(),
            default_lease: default_lease(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// S3-compatible endpoint, e.g. `https://storage.example.com`
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    pub access_key_id: Option<String>,

    pub secret_access_key: Option<String>,

    /// Root prefix for video objects
    #[serde(default = "default_video_prefix")]
    pub video_prefix: String,

    #[serde(default = "default_upload_url_ttl", with = "humantime_serde")]
    pub upload_url_ttl: Duration,

    #[serde(default = "default_preview_url_ttl", with = "humantime_serde")]
    pub preview_url_ttl: Duration,

    #[serde(default = "default_hls_url_ttl", with = "humantime_serde")]
    pub hls_url_ttl: Duration,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            video_prefix: default_video_prefix(),
            upload_url_ttl: default_upload_url_ttl(),
            preview_url_ttl: default_preview_url_ttl(),
            hls_url_ttl: default_hls_url_ttl(),
            request_timeout: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,

    /// Parent of the per-job scratch directories
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// HLS segment length in seconds
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            work_dir: default_work_dir(),
            segment_secs: default_segment_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Override for the provider endpoint; derived from the region when unset
    pub endpoint: Option<String>,

    #[serde(default = "default_mail_region")]
    pub region: String,

    pub access_key_id: Option<String>,

    pub secret_access_key: Option<String>,

    /// Sender address, e.g. `Lectern <news@example.com>`
    #[serde(default)]
    pub from: String,

    pub configuration_set: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay", with = "humantime_serde")]
    pub batch_delay: Duration,

    /// Retries of one batch after a rate-limit response
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    /// First backoff delay in whole seconds, doubled per retry
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Regexes for addresses never mailed
    #[serde(default = "default_bot_patterns")]
    pub bot_patterns: Vec<String>,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_mail_region(),
            access_key_id: None,
            secret_access_key: None,
            from: String::new(),
            configuration_set: None,
            batch_size: default_batch_size(),
            batch_delay: default_batch_delay(),
            rate_limit_retries: default_rate_limit_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            bot_patterns: default_bot_patterns(),
            request_timeout: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_dump_command")]
    pub dump_command: String,

    /// Connection URL handed to the dump tool; defaults to the database URL
    pub source_url: Option<String>,

    #[serde(default = "default_backup_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    #[serde(default = "default_download_ttl", with = "humantime_serde")]
    pub download_url_ttl: Duration,

    #[serde(default = "default_backup_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Addresses notified on every backup outcome
    #[serde(default)]
    pub operators: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dump_command: default_dump_command(),
            source_url: None,
            key_prefix: default_backup_prefix(),
            work_dir: default_work_dir(),
            download_url_ttl: default_download_ttl(),
            interval: default_backup_interval(),
            operators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Age after which a `processing` video is presumed abandoned. Must exceed
    /// the transcode lease so a live, heartbeating job is never failed.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_sequence_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            interval: default_sequence_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Prometheus exporter listen address, e.g. `0.0.0.0:9000`
    pub metrics_addr: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            metrics_addr: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 5 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_worker_name() -> String { "lectern-worker".to_string() }
fn default_poll_interval() -> Duration { Duration::from_secs(5) }
fn default_concurrency() -> usize { 4 }
fn default_claim_batch() -> usize { 10 }
fn default_lease() -> Duration { Duration::from_secs(10 * 60) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_region() -> String { "auto".to_string() }
fn default_video_prefix() -> String { "videos".to_string() }
fn default_upload_url_ttl() -> Duration { Duration::from_secs(3600) }
fn default_preview_url_ttl() -> Duration { Duration::from_secs(3600) }
fn default_hls_url_ttl() -> Duration { Duration::from_secs(1800) }
fn default_http_timeout() -> Duration { Duration::from_secs(60) }
fn default_ffmpeg() -> String { "ffmpeg".to_string() }
fn default_ffprobe() -> String { "ffprobe".to_string() }
fn default_work_dir() -> String { std::env::temp_dir().to_string_lossy().into_owned() }
fn default_segment_secs() -> u32 { 6 }
fn default_mail_region() -> String { "us-east-2".to_string() }
fn default_batch_size() -> usize { 14 }
fn default_batch_delay() -> Duration { Duration::from_secs(1) }
fn default_rate_limit_retries() -> u32 { 3 }
fn default_backoff_base_secs() -> u64 { 1 }
fn default_dump_command() -> String { "pg_dump".to_string() }
fn default_backup_prefix() -> String { "backups".to_string() }
fn default_download_ttl() -> Duration { Duration::from_secs(7 * 24 * 3600) }
fn default_backup_interval() -> Duration { Duration::from_secs(7 * 24 * 3600) }
fn default_stale_after() -> Duration { Duration::from_secs(2 * 3600) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(10 * 60) }
fn default_sequence_interval() -> Duration { Duration::from_secs(3600) }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

fn default_bot_patterns() -> Vec<String> {
    vec![
        r"(?i)^(no-?reply|mailer-daemon|postmaster)@".to_string(),
        r"(?i)@(mailinator|guerrillamail|yopmail|sharklasers)\.".to_string(),
        r"(?i)@example\.(com|org|net)$".to_string(),
        r"(?i)^test\d*@".to_string(),
    ]
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("LECTERN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("LECTERN").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_applies_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
url = "postgres://lectern@localhost/lectern"

[storage]
endpoint = "https://storage.example.com"
bucket = "media"

[cleanup]
stale_after = "45m"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.storage.bucket, "media");
        assert_eq!(config.storage.region, "auto");
        assert_eq!(config.cleanup.stale_after, Duration::from_secs(45 * 60));
        assert_eq!(config.mail.batch_size, 14);
        assert_eq!(config.backup.download_url_ttl, Duration::from_secs(604_800));
        assert_eq!(config.scheduler.default_lease, Duration::from_secs(600));
    }

    #[test]
    fn test_default_bot_patterns_compile() {
        for pattern in default_bot_patterns() {
            assert!(regex::Regex::new(&pattern).is_ok(), "{}", pattern);
        }
    }
}
