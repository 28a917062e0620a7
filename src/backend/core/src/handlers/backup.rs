//! `weekly_backup`: dump the database, ship it to object storage, tell the operators.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Backup, CatalogStore};
use crate::config::BackupConfig;
use crate::error::{LecternError, Result};
use crate::jobs::{names, JobContext, JobHandler, JobPayload, JobResult};
use crate::mail::{EmailTransport, OutgoingEmail};
use crate::observability::metrics::record_backup;
use crate::scratch::ScratchDir;
use crate::storage::{ObjectStore, PutOptions, StorageGateway};

/// Writes a compressed database archive to a local path.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, output: &Path) -> Result<()>;
}

pub struct PgDumper {
    command: String,
    source_url: String,
}

impl PgDumper {
    pub fn new(command: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            source_url: source_url.into(),
        }
    }

    pub fn args(&self, output: &Path) -> Vec<String> {
        vec![
            "--format=custom".to_string(),
            "--compress=9".to_string(),
            "--file".to_string(),
            output.to_string_lossy().into_owned(),
            self.source_url.clone(),
        ]
    }
}

#[async_trait]
impl Dumper for PgDumper {
    async fn dump(&self, output: &Path) -> Result<()> {
        let result = Command::new(&self.command)
            .args(self.args(output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LecternError::backup_failed("dump", format!("could not run {}: {}", self.command, e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(LecternError::backup_failed(
                "dump",
                format!("{} exited with {}: {}", self.command, result.status, stderr.trim()),
            ));
        }
        Ok(())
    }
}

/// `backup-YYYY-MM-DD-HHMMSS.dump`
pub fn backup_filename(at: DateTime<Utc>) -> String {
    format!("backup-{}.dump", at.format("%Y-%m-%d-%H%M%S"))
}

/// Human-readable size, base 1024, two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let text = format!("{:.2}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", text, UNITS[exponent])
}

/// What operators are told about one run.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupNotice {
    Completed {
        filename: String,
        size_bytes: u64,
        download_url: String,
    },
    Failed {
        filename: String,
        error: String,
    },
}

impl BackupNotice {
    pub fn email(&self, operator: &str) -> OutgoingEmail {
        let (subject, html) = match self {
            Self::Completed {
                filename,
                size_bytes,
                download_url,
            } => (
                format!("Database backup completed: {}", filename),
                format!(
                    "<h2>Database backup completed</h2>\
                     <p><strong>Status:</strong> COMPLETED</p>\
                     <p><strong>File:</strong> {}</p>\
                     <p><strong>Size:</strong> {}</p>\
                     <p><a href=\"{}\">Download backup</a> (link valid for 7 days)</p>",
                    filename,
                    format_bytes(*size_bytes),
                    download_url
                ),
            ),
            Self::Failed { filename, error } => (
                format!("Database backup FAILED: {}", filename),
                format!(
                    "<h2>Database backup failed</h2>\
                     <p><strong>Status:</strong> FAILED</p>\
                     <p><strong>File:</strong> {}</p>\
                     <p><strong>Error:</strong></p><pre>{}</pre>",
                    filename, error
                ),
            ),
        };
        OutgoingEmail::new(subject, html).to(operator)
    }
}

pub struct WeeklyBackupHandler {
    catalog: Arc<dyn CatalogStore>,
    storage: Arc<StorageGateway>,
    mail: Arc<dyn EmailTransport>,
    dumper: Arc<dyn Dumper>,
    config: BackupConfig,
}

impl WeeklyBackupHandler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        storage: Arc<StorageGateway>,
        mail: Arc<dyn EmailTransport>,
        dumper: Arc<dyn Dumper>,
        config: BackupConfig,
    ) -> Self {
        Self {
            catalog,
            storage,
            mail,
            dumper,
            config,
        }
    }

    /// Dump, verify, upload, link and complete. Nothing after the row is
    /// marked complete can fail the run.
    async fn run(&self, backup: &Backup) -> Result<(u64, String)> {
        let scratch = ScratchDir::create(Path::new(&self.config.work_dir), "backup").await?;
        let local: PathBuf = scratch.path().join(&backup.filename);

        self.dumper.dump(&local).await?;

        let size = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta.len(),
            Err(e) => return Err(LecternError::backup_failed("verify", format!("dump file missing: {}", e))),
        };
        if size == 0 {
            return Err(LecternError::backup_failed("verify", "dump file is empty"));
        }
        debug!(size, path = %local.display(), "Dump verified");

        let body = Bytes::from(tokio::fs::read(&local).await?);
        self.storage
            .store()
            .put(&backup.s3_key, body, &PutOptions::new("application/octet-stream"))
            .await?;
        let download_url = self
            .storage
            .preview_url(&backup.s3_key, Some(self.config.download_url_ttl))?;

        let size_bytes = i64::try_from(size).unwrap_or(i64::MAX);
        self.catalog.complete_backup(backup.id, size_bytes, Utc::now()).await?;

        if let Err(e) = tokio::fs::remove_file(&local).await {
            warn!(path = %local.display(), error = %e, "Could not remove local dump");
        }
        Ok((size, download_url))
    }

    async fn notify(&self, notice: &BackupNotice) {
        if self.config.operators.is_empty() {
            debug!("No backup operators configured");
            return;
        }
        for operator in &self.config.operators {
            if let Err(e) = self.mail.send(&notice.email(operator)).await {
                warn!(operator = %operator, error = %e, "Backup notification failed");
            }
        }
    }
}

#[async_trait]
impl JobHandler for WeeklyBackupHandler {
    fn name(&self) -> &'static str {
        names::WEEKLY_BACKUP
    }

    #[instrument(skip_all)]
    async fn execute(&self, ctx: &JobContext, _payload: JobPayload) -> JobResult {
        let now = Utc::now();
        let filename = backup_filename(now);
        let key = format!("{}/{}", self.config.key_prefix.trim_end_matches('/'), filename);
        let backup = Backup::running(filename.clone(), key, now);

        let result = match self.catalog.create_backup(&backup).await {
            Ok(()) => self.run(&backup).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((size_bytes, download_url)) => {
                record_backup(true);
                info!(filename = %filename, size = %format_bytes(size_bytes), "Backup completed");
                self.notify(&BackupNotice::Completed {
                    filename,
                    size_bytes,
                    download_url,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                record_backup(false);
                e.log();
                let message = e.status_message();
                if let Err(write_error) = self.catalog.fail_backup(backup.id, &message, Utc::now()).await {
                    ctx.log_error(&format!("Could not record backup failure: {}", write_error));
                }
                self.notify(&BackupNotice::Failed {
                    filename,
                    error: message,
                })
                .await;
                Err(e.into())
            }
        }
    }
}
