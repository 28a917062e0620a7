//! Shared fixtures for the integration tests.
//!
//! Everything runs over the in-memory job, catalog and object stores, with
//! fakes standing in for ffmpeg, the email provider and pg_dump.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lectern_core::catalog::InMemoryCatalogStore;
use lectern_core::config::{
    BackupConfig, CleanupConfig, Config, DatabaseConfig, MailConfig, MediaConfig, ObservabilityConfig,
    SchedulerConfig, SequenceConfig, StorageConfig,
};
use lectern_core::error::{LecternError, Result};
use lectern_core::handlers::{register_handlers, Dumper, Services};
use lectern_core::jobs::{InMemoryJobStore, Scheduler};
use lectern_core::mail::{EmailTransport, OutgoingEmail};
use lectern_core::media::{default_ladder, Encoder, QualityProfile, Transcoder};
use lectern_core::storage::{InMemoryObjectStore, StorageGateway};

// ============================================================================
// Fakes
// ============================================================================

/// Writes a playlist and two segments per rendition.
#[derive(Default)]
pub struct FakeEncoder {
    pub fail_on: Option<&'static str>,
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, input: &Path, output_dir: &Path, profile: &QualityProfile, segment_secs: u32) -> Result<()> {
        assert!(input.exists(), "source must be written before encoding");
        assert_eq!(segment_secs, 6);
        if self.fail_on == Some(profile.name.as_str()) {
            return Err(LecternError::encoder_failed(&profile.name, "Invalid data found when processing input"));
        }
        for segment in ["segment_000.ts", "segment_001.ts"] {
            tokio::fs::write(output_dir.join(segment), b"\x47\x40\x11").await?;
        }
        tokio::fs::write(
            output_dir.join(profile.playlist_name()),
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nsegment_000.ts\n#EXTINF:4.0,\nsegment_001.ts\n#EXT-X-ENDLIST\n",
        )
        .await?;
        Ok(())
    }

    async fn probe_duration(&self, _input: &Path) -> Result<f64> {
        Ok(10.0)
    }
}

/// Email provider that replays scripted failures before accepting, and
/// notes how many newsletter deliveries were persisted at each call.
pub struct FakeMail {
    failures: Mutex<VecDeque<LecternError>>,
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub attempts: Mutex<usize>,
    catalog: Option<(Arc<InMemoryCatalogStore>, String)>,
    pub delivered_at_call: Mutex<Vec<usize>>,
}

impl FakeMail {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            catalog: None,
            delivered_at_call: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_with(self, failures: Vec<LecternError>) -> Self {
        *self.failures.lock() = failures.into();
        self
    }

    pub fn observing(mut self, catalog: Arc<InMemoryCatalogStore>, newsletter_id: &str) -> Self {
        self.catalog = Some((catalog, newsletter_id.to_string()));
        self
    }
}

#[async_trait]
impl EmailTransport for FakeMail {
    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        *self.attempts.lock() += 1;
        if let Some((catalog, id)) = &self.catalog {
            let delivered = catalog.newsletter(id).map_or(0, |n| n.delivered.len());
            self.delivered_at_call.lock().push(delivered);
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let mut sent = self.sent.lock();
        sent.push(email.clone());
        Ok(format!("0100018f-{:04}", sent.len()))
    }
}

pub struct FakeDumper {
    pub contents: Vec<u8>,
}

#[async_trait]
impl Dumper for FakeDumper {
    async fn dump(&self, output: &Path) -> Result<()> {
        tokio::fs::write(output, &self.contents).await?;
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config(work_dir: &Path) -> Config {
    let work_dir = work_dir.to_string_lossy().into_owned();
    Config {
        database: DatabaseConfig {
            url: "postgres://lectern@localhost/lectern_test".into(),
            max_connections: 2,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(1),
        },
        scheduler: SchedulerConfig {
            name: "test-worker".into(),
            poll_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        storage: StorageConfig {
            endpoint: "https://fly.storage.example.dev".into(),
            bucket: "course-media".into(),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("secret".into()),
            ..StorageConfig::default()
        },
        media: MediaConfig {
            work_dir: work_dir.clone(),
            ..MediaConfig::default()
        },
        mail: MailConfig {
            from: "Lectern <news@lectern.dev>".into(),
            batch_delay: Duration::ZERO,
            backoff_base_secs: 0,
            ..MailConfig::default()
        },
        backup: BackupConfig {
            work_dir,
            operators: vec!["ops@lectern.dev".into()],
            ..BackupConfig::default()
        },
        cleanup: CleanupConfig::default(),
        sequences: SequenceConfig::default(),
        observability: ObservabilityConfig::default(),
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub jobs: Arc<InMemoryJobStore>,
    pub catalog: Arc<InMemoryCatalogStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub config: Config,
    pub work: tempfile::TempDir,
}

pub struct HarnessBuilder {
    encoder: FakeEncoder,
    mail: Option<Arc<FakeMail>>,
    dump: Vec<u8>,
    catalog: Arc<InMemoryCatalogStore>,
    cleanup: CleanupConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            encoder: FakeEncoder::default(),
            mail: None,
            dump: b"PGDMP\x01\x0e\x00".to_vec(),
            catalog: Arc::new(InMemoryCatalogStore::new()),
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn catalog(&self) -> Arc<InMemoryCatalogStore> {
        self.catalog.clone()
    }

    pub fn encoder(mut self, encoder: FakeEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn mail(mut self, mail: Arc<FakeMail>) -> Self {
        self.mail = Some(mail);
        self
    }

    pub fn dump(mut self, contents: &[u8]) -> Self {
        self.dump = contents.to_vec();
        self
    }

    pub fn cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn build(self) -> Harness {
        self.try_build().unwrap()
    }

    pub fn try_build(self) -> Result<Harness> {
        let work = tempfile::tempdir().unwrap();
        let mut config = test_config(work.path());
        config.cleanup = self.cleanup;
        let objects = Arc::new(InMemoryObjectStore::new());
        let storage = Arc::new(StorageGateway::new(config.storage.clone(), objects.clone()).unwrap());
        let transcoder = Arc::new(Transcoder::new(Arc::new(self.encoder), default_ladder(), &config.media));
        let mail = self.mail.unwrap_or_else(|| Arc::new(FakeMail::new()));

        let services = Services {
            catalog: self.catalog.clone(),
            storage,
            transcoder,
            mail,
            dumper: Arc::new(FakeDumper { contents: self.dump }),
        };
        let jobs = Arc::new(InMemoryJobStore::new());
        let scheduler =
            register_handlers(Scheduler::builder(jobs.clone(), config.scheduler.clone()), &services, &config)?.build();

        Ok(Harness {
            scheduler,
            jobs,
            catalog: self.catalog,
            objects,
            config,
            work,
        })
    }
}

/// Poll until `dir` is empty; scratch removal runs in the background.
pub async fn wait_until_empty(dir: &Path) -> bool {
    for _ in 0..100 {
        if std::fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
