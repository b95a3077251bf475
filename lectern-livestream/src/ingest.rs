//! Inbound adapter for the RTMP ingest server's publish callbacks.
//!
//! The ingest server reports publish lifecycle transitions with a publish
//! path (`/<app>/<stream key>`) and the publisher's network address. Events
//! are normalized into one typed record here, so the orchestrator never
//! sees the transport's payload shapes.

use serde::{Deserialize, Serialize};

use lectern_core::models::StreamKey;

/// One normalized publish lifecycle callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    pub stream_key: StreamKey,
    pub publisher_addr: String,
}

impl PublishEvent {
    /// Build an event from a raw publish path, taking the stream key from
    /// the last path segment. Returns `None` for paths without a usable key.
    pub fn from_path(path: &str, publisher_addr: String) -> Option<Self> {
        let stream_key = stream_key_from_path(path)?;
        Some(Self {
            stream_key,
            publisher_addr,
        })
    }
}

/// Extract the stream key (last non-empty path segment) from a publish path.
pub fn stream_key_from_path(path: &str) -> Option<StreamKey> {
    let segment = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    // Keys become file name prefixes; refuse anything that could traverse.
    if segment.contains("..") || !segment.chars().all(is_key_char) {
        return None;
    }
    Some(StreamKey::from(segment))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_last_segment() {
        assert_eq!(
            stream_key_from_path("/live/physics-101"),
            Some(StreamKey::from("physics-101"))
        );
        assert_eq!(
            stream_key_from_path("live/physics-101/"),
            Some(StreamKey::from("physics-101"))
        );
        assert_eq!(
            stream_key_from_path("physics-101"),
            Some(StreamKey::from("physics-101"))
        );
    }

    #[test]
    fn test_empty_and_malformed_paths_rejected() {
        assert_eq!(stream_key_from_path(""), None);
        assert_eq!(stream_key_from_path("///"), None);
        assert_eq!(stream_key_from_path("/live/../../etc"), None);
        assert_eq!(stream_key_from_path("/live/a b"), None);
    }

    #[test]
    fn test_from_path() {
        let event = PublishEvent::from_path("/live/math", "10.0.0.7:51123".to_string()).unwrap();
        assert_eq!(event.stream_key.as_str(), "math");
        assert_eq!(event.publisher_addr, "10.0.0.7:51123");
    }
}
