//! Media transcoding engine.
//!
//! Converts one uploaded video into adaptive-bitrate HLS:
//!
//! ```text
//! source bytes ─► scratch dir ─► probe duration (best effort)
//!                      │
//!                      ├─► encode 1080p ─► 1080p/1080p.m3u8 + segments
//!                      ├─► encode 720p  ─► 720p/720p.m3u8   + segments
//!                      └─► encode 480p  ─► 480p/480p.m3u8   + segments
//!                                                │
//!                              master.m3u8 ◄─────┘ (only when all succeed)
//! ```
//!
//! The [`Encoder`] trait is the seam to the external encoder binary;
//! [`FfmpegEncoder`] is the production implementation.

pub mod encoder;
pub mod manifest;
pub mod profile;
pub mod transcoder;

pub use encoder::{Encoder, FfmpegEncoder};
pub use manifest::master_playlist;
pub use profile::{default_ladder, QualityProfile};
pub use transcoder::{Heartbeat, QualityVariant, TranscodeOutput, Transcoder, MASTER_PLAYLIST};
