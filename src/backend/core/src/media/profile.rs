//! Rendition ladder.

use serde::{Deserialize, Serialize};

/// One rendition target: size caps, bitrates and rate-control buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityProfile {
    /// Rendition name, also its directory (`720p`)
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Video bitrate in kbps
    pub video_kbps: u32,
    /// Audio bitrate in kbps
    pub audio_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
}

impl QualityProfile {
    pub fn new(name: impl Into<String>, width: u32, height: u32, video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            video_kbps,
            audio_kbps,
            maxrate_kbps: video_kbps,
            bufsize_kbps: video_kbps * 3 / 2,
        }
    }

    pub fn with_buffer(mut self, maxrate_kbps: u32, bufsize_kbps: u32) -> Self {
        self.maxrate_kbps = maxrate_kbps;
        self.bufsize_kbps = bufsize_kbps;
        self
    }

    /// `1280x720`
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Advertised bandwidth in bits per second.
    pub fn bandwidth(&self) -> u64 {
        u64::from(self.video_kbps) * 1000
    }

    /// Rendition playlist path relative to the HLS root: `720p/720p.m3u8`.
    pub fn playlist_path(&self) -> String {
        format!("{}/{}", self.name, self.playlist_name())
    }

    pub fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.name)
    }

    /// Encoder arguments producing an HLS rendition in `output_dir`.
    pub fn encoder_args(&self, input: &str, output_dir: &str, segment_secs: u32) -> Vec<String> {
        let scale = format!(
            "scale='min({w},iw)':'min({h},ih)':force_original_aspect_ratio=decrease",
            w = self.width,
            h = self.height
        );

        let video_bitrate = format!("{}k", self.video_kbps);
        let maxrate = format!("{}k", self.maxrate_kbps);
        let bufsize = format!("{}k", self.bufsize_kbps);
        let audio_bitrate = format!("{}k", self.audio_kbps);
        let hls_time = segment_secs.to_string();
        let segment_pattern = format!("{}/segment_%03d.ts", output_dir);
        let playlist = format!("{}/{}", output_dir, self.playlist_name());

        [
            "-y", "-i", input,
            "-c:v", "libx264",
            "-c:a", "aac",
            "-vf", scale.as_str(),
            "-b:v", video_bitrate.as_str(),
            "-maxrate", maxrate.as_str(),
            "-bufsize", bufsize.as_str(),
            "-b:a", audio_bitrate.as_str(),
            "-f", "hls",
            "-hls_time", hls_time.as_str(),
            "-hls_list_size", "0",
            "-hls_segment_filename", segment_pattern.as_str(),
            "-preset", "medium",
            "-profile:v", "baseline",
            "-level", "3.0",
            "-pix_fmt", "yuv420p",
            "-g", "48",
            "-sc_threshold", "0",
            playlist.as_str(),
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }
}

/// The fixed ladder, highest quality first.
pub fn default_ladder() -> Vec<QualityProfile> {
    vec![
        QualityProfile::new("1080p", 1920, 1080, 5000, 192).with_buffer(5350, 7500),
        QualityProfile::new("720p", 1280, 720, 2800, 128).with_buffer(3000, 4200),
        QualityProfile::new("480p", 854, 480, 1400, 128).with_buffer(1500, 2100),
    ]
}
