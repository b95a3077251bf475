//! Deferred deletion of a finished stream's HLS artifacts.
//!
//! Players drain their buffers for a few seconds after a stream ends, so
//! segments must outlive `done_publish` by a grace window. A re-publish of
//! the same key during the window cancels the pending sweep.

use std::path::PathBuf;
use std::time::Duration;

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lectern_core::models::StreamKey;

/// File suffixes recognized as HLS artifacts. `.mp4` covers fMP4 init
/// segments (`_init.mp4`).
const HLS_SUFFIXES: &[&str] = &[".m3u8", ".ts", ".m4s", ".mp4"];

#[derive(Debug)]
pub struct CleanupScheduler {
    streams_dir: PathBuf,
    grace: Duration,
    pending: Arc<DashMap<StreamKey, CancellationToken>>,
}

impl CleanupScheduler {
    #[must_use]
    pub fn new(streams_dir: PathBuf, grace: Duration) -> Self {
        Self {
            streams_dir,
            grace,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Schedule a sweep of `<key>_*` files after the grace window.
    /// Any sweep already pending for the key is replaced.
    pub fn schedule(self: &Arc<Self>, stream_key: StreamKey) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .pending
            .insert(stream_key.clone(), token.clone())
        {
            previous.cancel();
        }

        info!(
            stream_key = %stream_key.as_str(),
            grace_seconds = self.grace.as_secs(),
            "Cleanup scheduled"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(stream_key = %stream_key.as_str(), "Cleanup canceled");
                }
                () = tokio::time::sleep(scheduler.grace) => {
                    scheduler.pending.remove(&stream_key);
                    scheduler.sweep(&stream_key).await;
                }
            }
        });
    }

    /// Cancel a pending sweep (a re-publish of the key arrived in time).
    /// Returns whether a sweep was pending.
    pub fn cancel(&self, stream_key: &StreamKey) -> bool {
        if let Some((_, token)) = self.pending.remove(stream_key) {
            token.cancel();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Best-effort deletion of every HLS artifact belonging to the key.
    /// Individual failures are logged and skipped.
    async fn sweep(&self, stream_key: &StreamKey) {
        let prefix = format!("{}_", stream_key.as_str());

        let mut entries = match tokio::fs::read_dir(&self.streams_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    stream_key = %stream_key.as_str(),
                    dir = %self.streams_dir.display(),
                    error = %e,
                    "Cleanup could not read output directory"
                );
                return;
            }
        };

        let mut deleted = 0usize;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Cleanup directory iteration failed");
                    break;
                }
            };

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            if !HLS_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(file = %name, error = %e, "Cleanup failed to delete file");
                }
            }
        }

        info!(
            stream_key = %stream_key.as_str(),
            deleted = deleted,
            "Cleanup swept stream artifacts"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch(dir: &std::path::Path, name: &str) {
        tokio::fs::write(dir.join(name), b"x").await.expect("touch");
    }

    async fn exists(dir: &std::path::Path, name: &str) -> bool {
        tokio::fs::try_exists(dir.join(name)).await.unwrap_or(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_deletes_only_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = Arc::new(CleanupScheduler::new(
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        ));

        touch(dir.path(), "k1_h264.m3u8").await;
        touch(dir.path(), "k1_h264_720p.m3u8").await;
        touch(dir.path(), "k1_h264_720p_000.ts").await;
        touch(dir.path(), "k1_hevc_480p_001.m4s").await;
        touch(dir.path(), "k1_hevc_480p_init.mp4").await;
        // Different key and unrecognized suffix survive
        touch(dir.path(), "k2_h264_720p_000.ts").await;
        touch(dir.path(), "k1_notes.txt").await;

        scheduler.schedule(StreamKey::from("k1"));
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        // Let the sweep task run to completion.
        tokio::task::yield_now().await;

        assert!(!exists(dir.path(), "k1_h264.m3u8").await);
        assert!(!exists(dir.path(), "k1_h264_720p.m3u8").await);
        assert!(!exists(dir.path(), "k1_h264_720p_000.ts").await);
        assert!(!exists(dir.path(), "k1_hevc_480p_001.m4s").await);
        assert!(!exists(dir.path(), "k1_hevc_480p_init.mp4").await);
        assert!(exists(dir.path(), "k2_h264_720p_000.ts").await);
        assert!(exists(dir.path(), "k1_notes.txt").await);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = Arc::new(CleanupScheduler::new(
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        ));

        touch(dir.path(), "k1_h264_720p_000.ts").await;

        scheduler.schedule(StreamKey::from("k1"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(scheduler.cancel(&StreamKey::from("k1")));
        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;

        assert!(exists(dir.path(), "k1_h264_720p_000.ts").await);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_without_pending_is_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = Arc::new(CleanupScheduler::new(
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        ));
        assert!(!scheduler.cancel(&StreamKey::from("nope")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_directory_is_tolerated() {
        let scheduler = Arc::new(CleanupScheduler::new(
            PathBuf::from("/definitely/not/here"),
            Duration::from_secs(1),
        ));
        scheduler.schedule(StreamKey::from("k1"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending_count(), 0);
    }
}
