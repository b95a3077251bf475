use serde::{Deserialize, Serialize};

/// Which codecs the transcoder produces for a stream.
///
/// The primary codec is always produced. The orchestrator snapshots this at
/// publish start; toggling it mid-stream only affects the next publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPolicy {
    pub secondary_codec_enabled: bool,
}

/// Per-room mutable settings, adjustable by the teacher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub codec_policy: CodecPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secondary_codec_disabled_by_default() {
        assert!(!RoomSettings::default().codec_policy.secondary_codec_enabled);
    }
}
