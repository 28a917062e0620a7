//! Master playlist synthesis.

use super::profile::QualityProfile;

/// Render an HLS master playlist listing every rendition in the given order.
pub fn master_playlist(profiles: &[QualityProfile]) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for profile in profiles {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}\n",
            profile.bandwidth(),
            profile.resolution(),
            profile.playlist_path()
        ));
    }
    playlist
}
