//! Master playlist generation.
//!
//! The transcoder writes the variant playlists and segments itself; the one
//! artifact it cannot produce is the per-codec master playlist tying the
//! rendition ladder together, so we write it right after spawn. Variants
//! referenced here appear on disk within the first segment duration.

use std::path::{Path, PathBuf};

use tracing::debug;

use lectern_core::config::CodecConfig;
use lectern_core::models::StreamKey;
use lectern_core::Result;

/// File name of a master playlist: `<key>_<codec>.m3u8`.
#[must_use]
pub fn master_playlist_name(stream_key: &StreamKey, codec_name: &str) -> String {
    format!("{}_{}.m3u8", stream_key.as_str(), codec_name)
}

/// File name of a variant playlist: `<key>_<codec>_<rendition>.m3u8`.
#[must_use]
pub fn variant_playlist_name(stream_key: &StreamKey, codec_name: &str, rendition: &str) -> String {
    format!("{}_{}_{}.m3u8", stream_key.as_str(), codec_name, rendition)
}

/// Render the master playlist body for one codec's rendition ladder.
#[must_use]
pub fn render_master_playlist(stream_key: &StreamKey, codec: &CodecConfig) -> String {
    let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rendition in &codec.renditions {
        body.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            rendition.bandwidth_bits(),
            rendition.width,
            rendition.height,
            variant_playlist_name(stream_key, &codec.name, &rendition.name),
        ));
    }
    body
}

/// Write (or overwrite) the master playlist for one codec.
pub async fn write_master_playlist(
    streams_dir: &Path,
    stream_key: &StreamKey,
    codec: &CodecConfig,
) -> Result<PathBuf> {
    let path = streams_dir.join(master_playlist_name(stream_key, &codec.name));
    let body = render_master_playlist(stream_key, codec);
    tokio::fs::write(&path, body).await?;
    debug!(
        stream_key = %stream_key.as_str(),
        codec = %codec.name,
        path = %path.display(),
        "Master playlist written"
    );
    Ok(path)
}
