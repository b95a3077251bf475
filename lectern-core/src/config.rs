use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub streaming: StreamingConfig,
    pub room: RoomConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// CORS allowed origins for the HTTP surface. Empty means allow any,
    /// which is the intended posture for an origin serving public HLS.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// RTMP ingest adapter configuration.
///
/// The RTMP protocol itself is handled by an off-the-shelf ingest server
/// that invokes our publish hooks; we only need to know where it listens
/// so the transcoder can pull from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub rtmp_port: u16,
    /// RTMP application name, i.e. the first publish path segment
    /// (`rtmp://host:port/<app>/<stream key>`).
    pub app_name: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rtmp_port: 1935,
            app_name: "live".to_string(),
        }
    }
}

/// One HLS rendition: target resolution and bitrates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenditionConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl RenditionConfig {
    /// Total bandwidth in bits per second, as advertised in the master playlist.
    #[must_use]
    pub fn bandwidth_bits(&self) -> u64 {
        u64::from(self.video_bitrate_kbps + self.audio_bitrate_kbps) * 1000
    }
}

/// A codec and its ordered rendition ladder (highest first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Codec tag used in output file names (e.g. "h264", "hevc").
    pub name: String,
    pub renditions: Vec<RenditionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Directory for transient HLS playlists and segments.
    pub streams_dir: String,
    /// Directory for pass-through archival recordings.
    pub recordings_dir: String,
    /// Encoder binary to spawn.
    pub ffmpeg_binary: String,
    pub hardware_acceleration: bool,
    /// HLS segment duration in seconds.
    pub segment_seconds: u32,
    /// Number of segments kept in each variant playlist window.
    pub playlist_window: u32,
    /// Assumed input frame rate, used to force keyframes at segment boundaries.
    pub frame_rate: u32,
    /// Seconds to keep HLS files on disk after a stream ends.
    pub cleanup_grace_seconds: u64,
    /// Always-produced codec.
    pub primary_codec: CodecConfig,
    /// Produced only when the room's policy enables it.
    pub secondary_codec: CodecConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            streams_dir: "./data/streams".to_string(),
            recordings_dir: "./data/recordings".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            hardware_acceleration: false,
            segment_seconds: 1,
            playlist_window: 5,
            frame_rate: 30,
            cleanup_grace_seconds: 10,
            primary_codec: CodecConfig {
                name: "h264".to_string(),
                renditions: vec![
                    RenditionConfig {
                        name: "720p".to_string(),
                        width: 1280,
                        height: 720,
                        video_bitrate_kbps: 2800,
                        audio_bitrate_kbps: 128,
                    },
                    RenditionConfig {
                        name: "480p".to_string(),
                        width: 854,
                        height: 480,
                        video_bitrate_kbps: 1400,
                        audio_bitrate_kbps: 128,
                    },
                    RenditionConfig {
                        name: "360p".to_string(),
                        width: 640,
                        height: 360,
                        video_bitrate_kbps: 800,
                        audio_bitrate_kbps: 96,
                    },
                ],
            },
            secondary_codec: CodecConfig {
                name: "hevc".to_string(),
                renditions: vec![
                    RenditionConfig {
                        name: "720p".to_string(),
                        width: 1280,
                        height: 720,
                        video_bitrate_kbps: 1800,
                        audio_bitrate_kbps: 128,
                    },
                    RenditionConfig {
                        name: "480p".to_string(),
                        width: 854,
                        height: 480,
                        video_bitrate_kbps: 900,
                        audio_bitrate_kbps: 96,
                    },
                ],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Minimum number of chat messages retained for room-state snapshots.
    pub chat_retention: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval_seconds: u64,
    /// Connections silent for longer than this are dropped.
    pub client_timeout_seconds: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            chat_retention: 100,
            heartbeat_interval_seconds: 20,
            client_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, "pretty" for development.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
            }
        }

        // Override with environment variables (LECTERN_SERVER__HTTP_PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("LECTERN")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// RTMP URL the transcoder pulls a published stream from.
    #[must_use]
    pub fn rtmp_pull_url(&self, stream_key: &str) -> String {
        format!(
            "rtmp://127.0.0.1:{}/{}/{}",
            self.ingest.rtmp_port, self.ingest.app_name, stream_key
        )
    }

    /// Validate configuration at startup (fail fast on misconfigurations)
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let ports_to_check: &[(&str, u16)] = &[
            ("server.http_port", self.server.http_port),
            ("ingest.rtmp_port", self.ingest.rtmp_port),
        ];
        for (name, port) in ports_to_check {
            if *port == 0 {
                errors.push(format!("{name} must be between 1 and 65535, got 0"));
            }
        }
        if self.server.http_port == self.ingest.rtmp_port {
            errors.push(format!(
                "server.http_port and ingest.rtmp_port must differ, both are {}",
                self.server.http_port
            ));
        }

        if self.streaming.segment_seconds == 0 {
            errors.push("streaming.segment_seconds must be greater than 0".to_string());
        }
        if self.streaming.playlist_window < 2 {
            errors.push(format!(
                "streaming.playlist_window must be at least 2, got {}",
                self.streaming.playlist_window
            ));
        }
        if self.streaming.frame_rate == 0 {
            errors.push("streaming.frame_rate must be greater than 0".to_string());
        }
        if self.streaming.streams_dir.is_empty() {
            errors.push("streaming.streams_dir must not be empty".to_string());
        }
        if self.streaming.recordings_dir.is_empty() {
            errors.push("streaming.recordings_dir must not be empty".to_string());
        }
        if self.streaming.primary_codec.renditions.is_empty() {
            errors.push("streaming.primary_codec must have at least one rendition".to_string());
        }
        if self.streaming.primary_codec.name == self.streaming.secondary_codec.name {
            errors.push(format!(
                "streaming.primary_codec and streaming.secondary_codec must have distinct names, both are '{}'",
                self.streaming.primary_codec.name
            ));
        }
        for codec in [&self.streaming.primary_codec, &self.streaming.secondary_codec] {
            for rendition in &codec.renditions {
                if rendition.width == 0 || rendition.height == 0 {
                    errors.push(format!(
                        "rendition '{}' of codec '{}' has a zero dimension",
                        rendition.name, codec.name
                    ));
                }
                if rendition.video_bitrate_kbps == 0 {
                    errors.push(format!(
                        "rendition '{}' of codec '{}' has zero video bitrate",
                        rendition.name, codec.name
                    ));
                }
            }
        }

        if self.room.chat_retention < 50 {
            errors.push(format!(
                "room.chat_retention must be at least 50, got {}",
                self.room.chat_retention
            ));
        }
        if self.room.client_timeout_seconds <= self.room.heartbeat_interval_seconds {
            errors.push(format!(
                "room.client_timeout_seconds ({}) must exceed room.heartbeat_interval_seconds ({})",
                self.room.client_timeout_seconds, self.room.heartbeat_interval_seconds
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
