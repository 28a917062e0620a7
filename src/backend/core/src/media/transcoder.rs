//! Source video to HLS rendition set.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use super::encoder::Encoder;
use super::manifest::master_playlist;
use super::profile::QualityProfile;
use crate::config::MediaConfig;
use crate::error::{ErrorCode, LecternError, Result};
use crate::observability::metrics::record_rendition;
use crate::scratch::ScratchDir;
use crate::storage::NamedObject;

pub const MASTER_PLAYLIST: &str = "master.m3u8";

/// Per-quality metadata persisted with the video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityVariant {
    pub resolution: String,
    /// Configured video bitrate, e.g. `2800k`
    pub bitrate: String,
    /// Relative to the HLS root
    pub playlist_path: String,
}

/// Everything one transcode produced, ready for a batch upload.
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub master_playlist: String,
    /// Rendition files named relative to the HLS root, master last
    pub files: Vec<NamedObject>,
    /// Seconds; zero when probing failed
    pub duration: f64,
    pub qualities: Vec<QualityVariant>,
    pub elapsed_secs: f64,
}

/// Signals liveness between renditions. An error aborts the transcode.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<()>;
}

/// No-op heartbeat for callers without a lease.
#[async_trait]
impl Heartbeat for () {
    async fn beat(&self) -> Result<()> {
        Ok(())
    }
}

/// Drives the encoder across the quality ladder.
pub struct Transcoder {
    encoder: Arc<dyn Encoder>,
    profiles: Vec<QualityProfile>,
    work_dir: PathBuf,
    segment_secs: u32,
}

impl Transcoder {
    pub fn new(encoder: Arc<dyn Encoder>, profiles: Vec<QualityProfile>, config: &MediaConfig) -> Self {
        Self {
            encoder,
            profiles,
            work_dir: PathBuf::from(&config.work_dir),
            segment_secs: config.segment_secs,
        }
    }

    pub fn profiles(&self) -> &[QualityProfile] {
        &self.profiles
    }

    /// Encode every profile in order, beating `heartbeat` before each one.
    /// Any rendition or heartbeat failure aborts the run before a master
    /// playlist is produced.
    #[instrument(skip(self, source, heartbeat), fields(bytes = source.len()))]
    pub async fn transcode(
        &self,
        label: &str,
        source: Bytes,
        heartbeat: &dyn Heartbeat,
    ) -> Result<TranscodeOutput> {
        let started = Instant::now();
        let scratch = ScratchDir::create(&self.work_dir, &format!("video-{}", label)).await?;
        let input = scratch.path().join("input.mp4");
        tokio::fs::write(&input, &source).await?;

        let duration = match self.encoder.probe_duration(&input).await {
            Ok(duration) => duration,
            Err(e) => {
                warn!(error = %e, "Duration probe failed, defaulting to 0");
                0.0
            }
        };
        info!(duration, renditions = self.profiles.len(), "Transcoding to HLS");

        let mut files = Vec::new();
        let mut qualities = Vec::with_capacity(self.profiles.len());

        for profile in &self.profiles {
            heartbeat.beat().await?;
            let output_dir = scratch.path().join(&profile.name);
            tokio::fs::create_dir_all(&output_dir).await?;

            self.encoder
                .encode(&input, &output_dir, profile, self.segment_secs)
                .await?;

            let rendition = read_rendition(&output_dir, profile).await?;
            files.extend(rendition);
            record_rendition(&profile.name);

            qualities.push(QualityVariant {
                resolution: profile.resolution(),
                bitrate: format!("{}k", profile.video_kbps),
                playlist_path: profile.playlist_path(),
            });
        }

        let master = master_playlist(&self.profiles);
        files.push(NamedObject {
            name: MASTER_PLAYLIST.to_string(),
            body: Bytes::from(master.clone()),
        });

        let elapsed_secs = started.elapsed().as_secs_f64();
        info!(elapsed_secs, files = files.len(), "HLS transcode finished");

        Ok(TranscodeOutput {
            master_playlist: master,
            files,
            duration,
            qualities,
            elapsed_secs,
        })
    }
}

/// Files of one rendition directory, sorted by name, named `{quality}/{file}`.
async fn read_rendition(dir: &Path, profile: &QualityProfile) -> Result<Vec<NamedObject>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    if !names.iter().any(|name| *name == profile.playlist_name()) {
        return Err(LecternError::with_internal(
            ErrorCode::EmptyOutput,
            format!("Encoder produced no playlist for quality {}", profile.name),
            format!("directory {} contained {:?}", dir.display(), names),
        ));
    }

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let body = tokio::fs::read(dir.join(&name)).await?;
        files.push(NamedObject {
            name: format!("{}/{}", profile.name, name),
            body: Bytes::from(body),
        });
    }
    Ok(files)
}
