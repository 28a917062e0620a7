//! External encoder invocation.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::profile::QualityProfile;
use crate::config::MediaConfig;
use crate::error::{ErrorCode, LecternError, Result};

/// Diagnostics kept from the end of encoder stderr.
const DIAGNOSTIC_TAIL: usize = 4096;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces one HLS rendition from a local input file.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Write `{profile}.m3u8` and its segments into `output_dir`.
    async fn encode(
        &self,
        input: &Path,
        output_dir: &Path,
        profile: &QualityProfile,
        segment_secs: u32,
    ) -> Result<()>;

    /// Media duration in seconds.
    async fn probe_duration(&self, input: &Path) -> Result<f64>;
}

/// `ffmpeg`/`ffprobe` subprocesses.
pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegEncoder {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    #[instrument(skip(self, input, output_dir, profile), fields(quality = %profile.name))]
    async fn encode(
        &self,
        input: &Path,
        output_dir: &Path,
        profile: &QualityProfile,
        segment_secs: u32,
    ) -> Result<()> {
        let args = profile.encoder_args(
            &input.to_string_lossy(),
            &output_dir.to_string_lossy(),
            segment_secs,
        );
        debug!(command = %format!("{} {}", self.ffmpeg, args.join(" ")), "Starting encoder");

        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LecternError::encoder_unavailable(&self.ffmpeg, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LecternError::encoder_failed(
                &profile.name,
                format!("exit status {}: {}", output.status, tail(stderr.trim(), DIAGNOSTIC_TAIL)),
            ));
        }
        Ok(())
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ]);
        cmd.arg(input);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await?
            .map_err(|e| LecternError::encoder_unavailable(&self.ffprobe, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(LecternError::with_internal(
                ErrorCode::ProbeFailed,
                "Duration probe failed",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_duration(&stdout).ok_or_else(|| {
            LecternError::with_internal(
                ErrorCode::ProbeFailed,
                "Duration probe returned no duration",
                stdout.trim().to_string(),
            )
        })
    }
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|duration| duration.is_finite() && *duration >= 0.0)
}

/// Last `max` bytes of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::profile::default_ladder;

    fn encoder(ffmpeg: &str, ffprobe: &str) -> FfmpegEncoder {
        FfmpegEncoder::new(&MediaConfig {
            ffmpeg_path: ffmpeg.into(),
            ffprobe_path: ffprobe.into(),
            ..MediaConfig::default()
        })
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10.010000\n"), Some(10.01));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = encoder("/nonexistent/ffmpeg", "/nonexistent/ffprobe")
            .encode(&dir.path().join("input.mp4"), dir.path(), &default_ladder()[0], 6)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EncoderUnavailable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_carries_profile() {
        let dir = tempfile::tempdir().unwrap();
        let ladder = default_ladder();
        let err = encoder("false", "false")
            .encode(&dir.path().join("input.mp4"), dir.path(), &ladder[2], 6)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EncoderFailed);
        assert_eq!(err.details().context["profile"], "480p");

        let probe = encoder("false", "false")
            .probe_duration(&dir.path().join("input.mp4"))
            .await
            .unwrap_err();
        assert_eq!(probe.code(), ErrorCode::ProbeFailed);
    }
}
