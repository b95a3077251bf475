//! Stream lifecycle orchestration.
//!
//! Translates the ingest server's publish callbacks into transcoder
//! spawn/stop, master playlist writes, room notifications, and deferred
//! cleanup. Owns the table of active streams; handling for one stream key
//! is serialized through a per-key lock, keys proceed independently.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use lectern_core::models::{CodecPolicy, StreamKey};
use lectern_core::room::RoomService;
use lectern_core::{Config, Result};

use crate::cleanup::CleanupScheduler;
use crate::ingest::PublishEvent;
use crate::playlist;
use crate::transcoder::{TranscoderExit, TranscoderHandle, TranscoderLauncher, TranscoderSpec};

/// One currently-publishing stream. Holds the supervised transcoder via its
/// handle, never the raw process.
struct ActiveStream {
    publisher_addr: String,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    policy: CodecPolicy,
    recording_path: std::path::PathBuf,
    transcoder: Arc<dyn TranscoderHandle>,
}

/// Serializable view of an active stream for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub stream_key: StreamKey,
    pub publisher_addr: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub secondary_codec_enabled: bool,
    pub recording_file: String,
}

pub struct StreamOrchestrator {
    config: Arc<Config>,
    streams: DashMap<StreamKey, ActiveStream>,
    key_locks: DashMap<StreamKey, Arc<Mutex<()>>>,
    launcher: Arc<dyn TranscoderLauncher>,
    rooms: Arc<RoomService>,
    cleanup: Arc<CleanupScheduler>,
}

impl StreamOrchestrator {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        launcher: Arc<dyn TranscoderLauncher>,
        rooms: Arc<RoomService>,
        cleanup: Arc<CleanupScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            streams: DashMap::new(),
            key_locks: DashMap::new(),
            launcher,
            rooms,
            cleanup,
        })
    }

    /// Consume transcoder crash reports for the lifetime of the process.
    pub fn start_exit_listener(
        self: &Arc<Self>,
        mut exit_rx: mpsc::UnboundedReceiver<TranscoderExit>,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                orchestrator.handle_transcoder_exit(exit).await;
            }
        })
    }

    /// Advisory: the ingest server is about to accept a publisher.
    /// No state changes; kept as the authorization hook point.
    pub fn handle_pre_publish(&self, event: &PublishEvent) {
        info!(
            stream_key = %event.stream_key.as_str(),
            publisher_addr = %event.publisher_addr,
            "Pre-publish"
        );
    }

    /// A publisher has started pushing. Spawns the transcoder and registers
    /// the stream. A duplicate for an already-active key is ignored (first
    /// publisher wins).
    pub async fn handle_post_publish(&self, event: &PublishEvent) -> Result<()> {
        let stream_key = &event.stream_key;
        let _guard = self.acquire_key_lock(stream_key).await;

        if self.streams.contains_key(stream_key) {
            warn!(
                stream_key = %stream_key.as_str(),
                publisher_addr = %event.publisher_addr,
                "Duplicate post-publish for active stream ignored"
            );
            return Ok(());
        }

        // A re-publish within the grace window keeps the previous artifacts.
        if self.cleanup.cancel(stream_key) {
            info!(
                stream_key = %stream_key.as_str(),
                "Pending cleanup canceled by re-publish"
            );
        }

        let policy = self.rooms.registry().codec_policy(stream_key).await;
        let spec = TranscoderSpec::from_config(
            &self.config.streaming,
            stream_key,
            self.config.rtmp_pull_url(stream_key.as_str()),
            policy,
        );
        let codecs = spec.codecs.clone();
        let recording_path = spec.recording_path.clone();

        let transcoder = match self.launcher.launch(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    stream_key = %stream_key.as_str(),
                    error = %e,
                    "Transcoder spawn failed, stream not started"
                );
                self.rooms
                    .notify_stream_failed(stream_key, "transcoder spawn failed")
                    .await;
                return Err(e);
            }
        };

        for codec in &codecs {
            if let Err(e) = playlist::write_master_playlist(
                std::path::Path::new(&self.config.streaming.streams_dir),
                stream_key,
                codec,
            )
            .await
            {
                error!(
                    stream_key = %stream_key.as_str(),
                    codec = %codec.name,
                    error = %e,
                    "Master playlist write failed, aborting stream"
                );
                transcoder.stop().await;
                self.rooms
                    .notify_stream_failed(stream_key, "output directory not writable")
                    .await;
                return Err(e);
            }
        }

        info!(
            stream_key = %stream_key.as_str(),
            publisher_addr = %event.publisher_addr,
            secondary_codec_enabled = policy.secondary_codec_enabled,
            recording = %recording_path.display(),
            "Stream started"
        );

        self.streams.insert(
            stream_key.clone(),
            ActiveStream {
                publisher_addr: event.publisher_addr.clone(),
                started_at: Instant::now(),
                started_at_utc: Utc::now(),
                policy,
                recording_path,
                transcoder,
            },
        );

        self.rooms.notify_stream_started(stream_key).await;
        Ok(())
    }

    /// The publisher disconnected. Stops the transcoder and schedules the
    /// grace-period cleanup. Unknown keys are ignored (duplicate event).
    pub async fn handle_done_publish(&self, stream_key: &StreamKey) {
        let guard = self.acquire_key_lock(stream_key).await;

        let Some((_, stream)) = self.streams.remove(stream_key) else {
            warn!(
                stream_key = %stream_key.as_str(),
                "Done-publish without matching stream ignored"
            );
            return;
        };

        let recording_path = stream.transcoder.stop().await;

        info!(
            stream_key = %stream_key.as_str(),
            duration_seconds = stream.started_at.elapsed().as_secs(),
            recording = %recording_path.display(),
            "Stream ended, recording finalized"
        );

        self.cleanup.schedule(stream_key.clone());
        self.rooms.notify_stream_ended(stream_key).await;

        drop(guard);
        self.key_locks.remove(stream_key);
        self.rooms.registry().retire_if_idle(stream_key, false);
    }

    /// The transcoder died while it was supposed to be running. The stream
    /// is torn down (no auto-restart); a fresh post-publish for the key
    /// starts over.
    pub async fn handle_transcoder_exit(&self, exit: TranscoderExit) {
        let stream_key = exit.stream_key.clone();
        let guard = self.acquire_key_lock(&stream_key).await;

        let Some((_, stream)) = self.streams.remove(&stream_key) else {
            // Stopped through the normal path before the report arrived.
            return;
        };

        error!(
            stream_key = %stream_key.as_str(),
            detail = %exit.detail,
            uptime_seconds = stream.started_at.elapsed().as_secs(),
            "Stream failed: transcoder exited unexpectedly"
        );

        self.rooms
            .notify_stream_failed(&stream_key, &exit.detail)
            .await;
        self.cleanup.schedule(stream_key.clone());

        drop(guard);
        self.key_locks.remove(&stream_key);
        self.rooms.registry().retire_if_idle(&stream_key, false);
    }

    #[must_use]
    pub fn is_active(&self, stream_key: &StreamKey) -> bool {
        self.streams.contains_key(stream_key)
    }

    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Snapshot of all active streams for the status endpoint.
    #[must_use]
    pub fn stream_summaries(&self) -> Vec<StreamSummary> {
        self.streams
            .iter()
            .map(|entry| {
                let stream = entry.value();
                StreamSummary {
                    stream_key: entry.key().clone(),
                    publisher_addr: stream.publisher_addr.clone(),
                    started_at: stream.started_at_utc,
                    uptime_seconds: stream.started_at.elapsed().as_secs(),
                    secondary_codec_enabled: stream.policy.secondary_codec_enabled,
                    recording_file: stream
                        .recording_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Per-key serialization for publish handling, mirroring per-key
    /// creation locks in stream pools.
    async fn acquire_key_lock(&self, stream_key: &StreamKey) -> OwnedMutexGuard<()> {
        let lock = self
            .key_locks
            .entry(stream_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use lectern_core::models::Role;
    use lectern_core::room::{RoomMessageHub, RoomRegistry, ServerEvent};

    use crate::mock_launcher::MockTranscoderLauncher;

    struct Fixture {
        orchestrator: Arc<StreamOrchestrator>,
        launcher: Arc<MockTranscoderLauncher>,
        rooms: Arc<RoomService>,
        _streams_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let streams_dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.streaming.streams_dir = streams_dir.path().to_string_lossy().into_owned();
        config.streaming.recordings_dir = streams_dir.path().to_string_lossy().into_owned();
        config.streaming.cleanup_grace_seconds = 10;
        let config = Arc::new(config);

        let rooms = Arc::new(RoomService::new(
            RoomRegistry::new(),
            RoomMessageHub::new(),
            100,
        ));
        let launcher = Arc::new(MockTranscoderLauncher::new());
        let cleanup = Arc::new(CleanupScheduler::new(
            streams_dir.path().to_path_buf(),
            Duration::from_secs(config.streaming.cleanup_grace_seconds),
        ));

        let orchestrator = StreamOrchestrator::new(
            config,
            launcher.clone() as Arc<dyn TranscoderLauncher>,
            rooms.clone(),
            cleanup,
        );

        Fixture {
            orchestrator,
            launcher,
            rooms,
            _streams_dir: streams_dir,
        }
    }

    fn publish(key: &str) -> PublishEvent {
        PublishEvent {
            stream_key: StreamKey::from(key),
            publisher_addr: "10.0.0.5:52011".to_string(),
        }
    }

    #[tokio::test]
    async fn test_post_publish_spawns_and_writes_master_playlist() {
        let f = fixture();

        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("post publish");

        assert!(f.orchestrator.is_active(&StreamKey::from("k1")));
        assert_eq!(f.launcher.launch_count().await, 1);

        // Default policy: primary codec only
        let specs = f.launcher.launched.lock().await;
        assert_eq!(specs[0].codecs.len(), 1);
        let master = specs[0].streams_dir.join("k1_h264.m3u8");
        assert!(tokio::fs::try_exists(&master).await.unwrap_or(false));
        let secondary_master = specs[0].streams_dir.join("k1_hevc.m3u8");
        assert!(!tokio::fs::try_exists(&secondary_master).await.unwrap_or(true));
    }

    #[tokio::test]
    async fn test_duplicate_post_publish_first_wins() {
        let f = fixture();

        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("first publish");
        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("duplicate tolerated");

        assert_eq!(f.launcher.launch_count().await, 1);
        assert_eq!(f.orchestrator.active_stream_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_snapshot_at_publish_start() {
        let f = fixture();
        let key = StreamKey::from("k2");

        // Teacher enables the secondary codec before the publisher starts.
        let _rx = f.rooms.hub().subscribe(key.clone(), "t1".to_string());
        f.rooms.join(&key, "t1", "teacher".to_string(), Role::Teacher).await;
        f.rooms.set_codec_policy(&key, "t1", true).await;

        f.orchestrator
            .handle_post_publish(&publish("k2"))
            .await
            .expect("publish");

        {
            let specs = f.launcher.launched.lock().await;
            assert_eq!(specs[0].codecs.len(), 2);
        }

        // Flip mid-stream: running stream unaffected, next publish sees it.
        f.rooms.set_codec_policy(&key, "t1", false).await;
        assert!(f
            .orchestrator
            .stream_summaries()
            .iter()
            .any(|s| s.secondary_codec_enabled));

        f.orchestrator.handle_done_publish(&key).await;
        f.orchestrator
            .handle_post_publish(&publish("k2"))
            .await
            .expect("republish");

        let specs = f.launcher.launched.lock().await;
        assert_eq!(specs[1].codecs.len(), 1);
    }

    #[tokio::test]
    async fn test_done_publish_stops_and_schedules_cleanup() {
        let f = fixture();
        let key = StreamKey::from("k1");

        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("publish");
        f.orchestrator.handle_done_publish(&key).await;

        assert!(!f.orchestrator.is_active(&key));
        let handles = f.launcher.handles.lock().await;
        assert_eq!(handles[0].stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_done_publish_without_stream_ignored() {
        let f = fixture();
        f.orchestrator
            .handle_done_publish(&StreamKey::from("ghost"))
            .await;
        assert_eq!(f.orchestrator.active_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_row() {
        let f = fixture();
        f.launcher.fail_next_launch();

        let result = f.orchestrator.handle_post_publish(&publish("k1")).await;
        assert!(result.is_err());
        assert!(!f.orchestrator.is_active(&StreamKey::from("k1")));

        // The attempt is fatal only to this stream; a retry succeeds.
        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("retry succeeds");
        assert!(f.orchestrator.is_active(&StreamKey::from("k1")));
    }

    #[tokio::test]
    async fn test_crash_emits_stream_failed_and_allows_republish() {
        let f = fixture();
        let key = StreamKey::from("k1");

        // A student is in the room watching.
        let mut rx = f.rooms.hub().subscribe(key.clone(), "s1".to_string());
        f.rooms.join(&key, "s1", "ada".to_string(), Role::Student).await;
        let _ = rx.recv().await; // room_state

        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("publish");
        let _ = rx.recv().await; // stream_started

        f.orchestrator
            .handle_transcoder_exit(TranscoderExit {
                stream_key: key.clone(),
                detail: "signal: 9 (SIGKILL)".to_string(),
            })
            .await;

        match rx.recv().await {
            Some(ServerEvent::StreamFailed { reason, .. }) => {
                assert!(reason.contains("SIGKILL"));
            }
            other => panic!("expected stream_failed, got {other:?}"),
        }
        assert!(!f.orchestrator.is_active(&key));

        // Fresh publish with the same key starts a new transcoder.
        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("republish after crash");
        assert_eq!(f.launcher.launch_count().await, 2);
    }

    #[tokio::test]
    async fn test_exit_after_done_publish_is_ignored() {
        let f = fixture();
        let key = StreamKey::from("k1");

        let mut rx = f.rooms.hub().subscribe(key.clone(), "s1".to_string());
        f.rooms.join(&key, "s1", "ada".to_string(), Role::Student).await;
        let _ = rx.recv().await; // room_state

        f.orchestrator
            .handle_post_publish(&publish("k1"))
            .await
            .expect("publish");
        let _ = rx.recv().await; // stream_started
        f.orchestrator.handle_done_publish(&key).await;
        let _ = rx.recv().await; // stream_ended

        f.orchestrator
            .handle_transcoder_exit(TranscoderExit {
                stream_key: key.clone(),
                detail: "exit status: 0".to_string(),
            })
            .await;

        let quiet = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(quiet.is_err(), "late exit report must not emit events");
    }
}
