//! External encoder supervision.
//!
//! One ffmpeg child per active stream: it pulls the publisher's RTMP feed
//! and produces every (codec, rendition) HLS variant plus a pass-through
//! recording in a single process. The supervisor builds the argv, drains
//! stderr, detects early hardware-encoder failures, and guarantees the
//! child is gone after `stop()`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use lectern_core::config::{CodecConfig, StreamingConfig};
use lectern_core::models::{CodecPolicy, StreamKey};
use lectern_core::{Error, Result};

/// Window after spawn during which a hardware-encoder exit triggers the
/// software fallback instead of a failure report.
const HARDWARE_PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Budget for a graceful stop before the child is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervisor state machine. `Idle` is the pre-spawn phase; a handle
/// obtained from a launcher starts out `Running`.
/// `Running -> Exited` without `Stopping` in between is a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Idle,
    Running,
    Stopping,
    Exited,
}

/// Everything needed to derive the encoder argv for one stream.
#[derive(Debug, Clone)]
pub struct TranscoderSpec {
    pub stream_key: StreamKey,
    pub pull_url: String,
    /// Codec ladders to produce; the policy-gated secondary codec is either
    /// present here or absent entirely.
    pub codecs: Vec<CodecConfig>,
    pub hardware_acceleration: bool,
    pub segment_seconds: u32,
    pub playlist_window: u32,
    pub frame_rate: u32,
    pub streams_dir: PathBuf,
    pub recording_path: PathBuf,
}

impl TranscoderSpec {
    /// Assemble a spec from config plus the room's policy snapshot.
    #[must_use]
    pub fn from_config(
        config: &StreamingConfig,
        stream_key: &StreamKey,
        pull_url: String,
        policy: CodecPolicy,
    ) -> Self {
        let mut codecs = vec![config.primary_codec.clone()];
        if policy.secondary_codec_enabled && !config.secondary_codec.renditions.is_empty() {
            codecs.push(config.secondary_codec.clone());
        }

        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let recording_path = Path::new(&config.recordings_dir)
            .join(format!("{}_{}.flv", stream_key.as_str(), start_millis));

        Self {
            stream_key: stream_key.clone(),
            pull_url,
            codecs,
            hardware_acceleration: config.hardware_acceleration,
            segment_seconds: config.segment_seconds,
            playlist_window: config.playlist_window,
            frame_rate: config.frame_rate,
            streams_dir: PathBuf::from(&config.streams_dir),
            recording_path,
        }
    }
}

/// Report of a child that exited while it was supposed to be running.
#[derive(Debug, Clone)]
pub struct TranscoderExit {
    pub stream_key: StreamKey,
    pub detail: String,
}

/// Handle to one supervised transcoder. The orchestrator's active-stream
/// row holds this, never the raw process.
#[async_trait]
pub trait TranscoderHandle: Send + Sync {
    /// Graceful interrupt, then force kill after the grace budget.
    /// Idempotent; always returns the recording path.
    async fn stop(&self) -> PathBuf;

    fn recording_path(&self) -> PathBuf;

    fn state(&self) -> TranscoderState;
}

/// Spawns transcoders. Abstracted so orchestrator tests can run without an
/// encoder binary on the machine.
#[async_trait]
pub trait TranscoderLauncher: Send + Sync {
    async fn launch(&self, spec: TranscoderSpec) -> Result<Arc<dyn TranscoderHandle>>;
}

/// Production launcher backed by an ffmpeg binary.
pub struct FfmpegLauncher {
    ffmpeg_binary: String,
    exit_tx: mpsc::UnboundedSender<TranscoderExit>,
}

impl FfmpegLauncher {
    #[must_use]
    pub fn new(ffmpeg_binary: String, exit_tx: mpsc::UnboundedSender<TranscoderExit>) -> Self {
        Self {
            ffmpeg_binary,
            exit_tx,
        }
    }
}

#[async_trait]
impl TranscoderLauncher for FfmpegLauncher {
    async fn launch(&self, spec: TranscoderSpec) -> Result<Arc<dyn TranscoderHandle>> {
        let transcoder =
            FfmpegTranscoder::spawn(self.ffmpeg_binary.clone(), spec, self.exit_tx.clone())?;
        Ok(transcoder)
    }
}

/// One live ffmpeg child and its supervision state.
///
/// The monitor task owns the `Child`; `stop()` communicates with it through
/// the state watch and the kill token instead of touching the process.
pub struct FfmpegTranscoder {
    stream_key: StreamKey,
    recording_path: PathBuf,
    state_tx: watch::Sender<TranscoderState>,
    stdin: Mutex<Option<ChildStdin>>,
    kill_token: CancellationToken,
    stop_guard: Mutex<()>,
}

impl FfmpegTranscoder {
    fn spawn(
        binary: String,
        spec: TranscoderSpec,
        exit_tx: mpsc::UnboundedSender<TranscoderExit>,
    ) -> Result<Arc<Self>> {
        let args = build_args(&spec, spec.hardware_acceleration);
        let mut child = spawn_child(&binary, &args)?;

        info!(
            stream_key = %spec.stream_key.as_str(),
            hardware = spec.hardware_acceleration,
            codecs = spec.codecs.len(),
            recording = %spec.recording_path.display(),
            "Transcoder spawned"
        );

        spawn_stderr_drain(spec.stream_key.clone(), child.stderr.take());

        let (state_tx, _) = watch::channel(TranscoderState::Running);
        let transcoder = Arc::new(Self {
            stream_key: spec.stream_key.clone(),
            recording_path: spec.recording_path.clone(),
            state_tx,
            stdin: Mutex::new(child.stdin.take()),
            kill_token: CancellationToken::new(),
            stop_guard: Mutex::new(()),
        });

        let monitor = Arc::clone(&transcoder);
        tokio::spawn(async move {
            monitor.monitor(child, binary, spec, exit_tx).await;
        });

        Ok(transcoder)
    }

    /// Wait for the child, falling back to a software encoder once if the
    /// hardware encoder died within the probe window, then record the exit.
    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        binary: String,
        spec: TranscoderSpec,
        exit_tx: mpsc::UnboundedSender<TranscoderExit>,
    ) {
        let started = Instant::now();
        let status = wait_or_kill(&mut child, &self.kill_token).await;

        let crashed_early = started.elapsed() < HARDWARE_PROBE_WINDOW
            && *self.state_tx.borrow() == TranscoderState::Running;
        if spec.hardware_acceleration && crashed_early {
            warn!(
                stream_key = %self.stream_key.as_str(),
                "Hardware encoder failed within {}s of spawn, retrying with software encoders",
                HARDWARE_PROBE_WINDOW.as_secs()
            );
            let args = build_args(&spec, false);
            match spawn_child(&binary, &args) {
                Ok(mut sw_child) => {
                    spawn_stderr_drain(self.stream_key.clone(), sw_child.stderr.take());
                    *self.stdin.lock().await = sw_child.stdin.take();
                    let status = wait_or_kill(&mut sw_child, &self.kill_token).await;
                    self.finish(status, &exit_tx);
                    return;
                }
                Err(e) => {
                    error!(
                        stream_key = %self.stream_key.as_str(),
                        error = %e,
                        "Software fallback spawn failed"
                    );
                }
            }
        }

        self.finish(status, &exit_tx);
    }

    fn finish(
        &self,
        status: Option<std::process::ExitStatus>,
        exit_tx: &mpsc::UnboundedSender<TranscoderExit>,
    ) {
        let stopping = *self.state_tx.borrow() == TranscoderState::Stopping;
        let _ = self.state_tx.send(TranscoderState::Exited);

        let detail = status.map_or_else(|| "unknown exit status".to_string(), |s| s.to_string());
        if stopping {
            info!(
                stream_key = %self.stream_key.as_str(),
                status = %detail,
                "Transcoder exited after stop"
            );
        } else {
            warn!(
                stream_key = %self.stream_key.as_str(),
                status = %detail,
                "Transcoder exited unexpectedly"
            );
            let _ = exit_tx.send(TranscoderExit {
                stream_key: self.stream_key.clone(),
                detail,
            });
        }
    }
}

#[async_trait]
impl TranscoderHandle for FfmpegTranscoder {
    async fn stop(&self) -> PathBuf {
        let _guard = self.stop_guard.lock().await;

        let mut state_rx = self.state_tx.subscribe();
        if *state_rx.borrow() == TranscoderState::Exited {
            return self.recording_path.clone();
        }

        let _ = self.state_tx.send(TranscoderState::Stopping);

        // ffmpeg quits cleanly on 'q'; closing stdin afterwards doubles as EOF.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }

        let timed_out = tokio::time::timeout(
            STOP_GRACE,
            state_rx.wait_for(|state| *state == TranscoderState::Exited),
        )
        .await
        .is_err();

        if timed_out {
            warn!(
                stream_key = %self.stream_key.as_str(),
                "Transcoder ignored graceful stop for {}s, force killing",
                STOP_GRACE.as_secs()
            );
            self.kill_token.cancel();
            let _ = state_rx
                .wait_for(|state| *state == TranscoderState::Exited)
                .await;
        }

        self.recording_path.clone()
    }

    fn recording_path(&self) -> PathBuf {
        self.recording_path.clone()
    }

    fn state(&self) -> TranscoderState {
        *self.state_tx.borrow()
    }
}

async fn wait_or_kill(
    child: &mut Child,
    kill_token: &CancellationToken,
) -> Option<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => status.ok(),
        () = kill_token.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill transcoder child");
            }
            child.wait().await.ok()
        }
    }
}

fn spawn_child(binary: &str, args: &[String]) -> Result<Child> {
    Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Transcoder(format!("failed to spawn {binary}: {e}")))
}

/// Drain stderr so the child can never block on a full pipe. Lines that
/// look like failures surface at warn, the rest stay at trace.
fn spawn_stderr_drain(stream_key: StreamKey, stderr: Option<ChildStderr>) {
    let Some(stderr) = stderr else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let lower = line.to_ascii_lowercase();
            if lower.contains("error") || lower.contains("fatal") || lower.contains("failed") {
                warn!(
                    stream_key = %stream_key.as_str(),
                    line = %line,
                    "Transcoder stderr"
                );
            } else {
                trace!(stream_key = %stream_key.as_str(), line = %line, "Transcoder stderr");
            }
        }
    });
}

/// Encoder name plus its rate-control/latency flags for one codec family.
fn encoder_args(codec_name: &str, hardware: bool) -> (&'static str, Vec<String>) {
    let software_flags = |scenecut: &[&str]| {
        let mut flags = vec![
            "-preset".to_string(),
            "veryfast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
        ];
        flags.extend(scenecut.iter().map(ToString::to_string));
        flags
    };
    let hardware_flags = || {
        vec![
            "-preset".to_string(),
            "p1".to_string(),
            "-tune".to_string(),
            "ll".to_string(),
            "-no-scenecut".to_string(),
            "1".to_string(),
        ]
    };

    match (codec_name, hardware) {
        ("h264", true) => ("h264_nvenc", hardware_flags()),
        ("h264", false) => ("libx264", software_flags(&["-sc_threshold", "0"])),
        ("hevc" | "h265", true) => ("hevc_nvenc", hardware_flags()),
        ("hevc" | "h265", false) => {
            ("libx265", software_flags(&["-x265-params", "scenecut=0"]))
        }
        (other, _) => {
            warn!(codec = %other, "Unknown codec name, encoding with libx264");
            ("libx264", software_flags(&["-sc_threshold", "0"]))
        }
    }
}

/// Build the complete ffmpeg argv for a spec.
///
/// One HLS output per (codec, rendition) with keyframes forced at segment
/// boundaries and `bitrate == maxrate`, plus a trailing codec-copy output
/// for the archival recording.
#[must_use]
pub fn build_args(spec: &TranscoderSpec, hardware: bool) -> Vec<String> {
    let gop = spec.segment_seconds * spec.frame_rate;
    let mut args: Vec<String> = vec![
        "-hide_banner".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        spec.pull_url.clone(),
    ];

    let gop_str = gop.to_string();
    let segment_seconds = spec.segment_seconds.to_string();
    let playlist_window = spec.playlist_window.to_string();

    for codec in &spec.codecs {
        let (encoder, encoder_flags) = encoder_args(&codec.name, hardware);
        for rendition in &codec.renditions {
            let scale = format!("scale={}:{}", rendition.width, rendition.height);
            let video_bitrate = format!("{}k", rendition.video_bitrate_kbps);
            let bufsize = format!("{}k", rendition.video_bitrate_kbps * 2);
            let audio_bitrate = format!("{}k", rendition.audio_bitrate_kbps);
            let segment_template = spec
                .streams_dir
                .join(format!(
                    "{}_{}_{}_%03d.ts",
                    spec.stream_key.as_str(),
                    codec.name,
                    rendition.name
                ))
                .to_string_lossy()
                .into_owned();
            let variant_playlist = spec
                .streams_dir
                .join(format!(
                    "{}_{}_{}.m3u8",
                    spec.stream_key.as_str(),
                    codec.name,
                    rendition.name
                ))
                .to_string_lossy()
                .into_owned();

            args.extend(
                [
                    "-map",
                    "0:v:0",
                    "-map",
                    "0:a:0",
                    "-filter:v",
                    scale.as_str(),
                    "-c:v",
                    encoder,
                    "-b:v",
                    video_bitrate.as_str(),
                    "-maxrate",
                    video_bitrate.as_str(),
                    "-bufsize",
                    bufsize.as_str(),
                    "-g",
                    gop_str.as_str(),
                    "-keyint_min",
                    gop_str.as_str(),
                ]
                .map(String::from),
            );
            args.extend(encoder_flags.iter().cloned());
            args.extend(
                [
                    "-c:a",
                    "aac",
                    "-b:a",
                    audio_bitrate.as_str(),
                    "-ar",
                    "44100",
                    "-ac",
                    "2",
                    "-f",
                    "hls",
                    "-hls_time",
                    segment_seconds.as_str(),
                    "-hls_list_size",
                    playlist_window.as_str(),
                    "-hls_flags",
                    "delete_segments+independent_segments",
                    "-hls_segment_filename",
                    segment_template.as_str(),
                    variant_playlist.as_str(),
                ]
                .map(String::from),
            );
        }
    }

    // Archival pass-through: the publisher's original streams, no re-encode.
    let recording = spec.recording_path.to_string_lossy().into_owned();
    args.extend(
        ["-map", "0", "-c", "copy", "-f", "flv", recording.as_str()].map(String::from),
    );

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TranscoderSpec {
        let config = StreamingConfig::default();
        TranscoderSpec::from_config(
            &config,
            &StreamKey::from("k1"),
            "rtmp://127.0.0.1:1935/live/k1".to_string(),
            CodecPolicy::default(),
        )
    }

    fn window(args: &[String], flag: &str) -> Vec<String> {
        args.iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == flag)
            .map(|(i, _)| args[i + 1].clone())
            .collect()
    }

    #[test]
    fn test_spec_default_policy_is_primary_only() {
        let spec = spec();
        assert_eq!(spec.codecs.len(), 1);
        assert_eq!(spec.codecs[0].name, "h264");
        let name = spec.recording_path.file_name().and_then(|n| n.to_str());
        assert!(name.is_some_and(|n| n.starts_with("k1_") && n.ends_with(".flv")));
    }

    #[test]
    fn test_spec_secondary_codec_gated_by_policy() {
        let config = StreamingConfig::default();
        let spec = TranscoderSpec::from_config(
            &config,
            &StreamKey::from("k1"),
            "rtmp://127.0.0.1:1935/live/k1".to_string(),
            CodecPolicy {
                secondary_codec_enabled: true,
            },
        );
        assert_eq!(spec.codecs.len(), 2);
        assert_eq!(spec.codecs[1].name, "hevc");
    }

    #[test]
    fn test_build_args_rate_control() {
        let spec = spec();
        let args = build_args(&spec, false);

        // One video encode per rendition, all software
        assert_eq!(window(&args, "-c:v"), vec!["libx264"; 3]);
        // bitrate == maxrate, bufsize doubled
        assert_eq!(window(&args, "-b:v"), vec!["2800k", "1400k", "800k"]);
        assert_eq!(window(&args, "-maxrate"), vec!["2800k", "1400k", "800k"]);
        assert_eq!(window(&args, "-bufsize"), vec!["5600k", "2800k", "1600k"]);
        // Keyframe cadence = segment duration x frame rate, scene cut off
        assert_eq!(window(&args, "-g"), vec!["30"; 3]);
        assert_eq!(window(&args, "-keyint_min"), vec!["30"; 3]);
        assert_eq!(window(&args, "-sc_threshold"), vec!["0"; 3]);
    }

    #[test]
    fn test_build_args_hls_outputs() {
        let spec = spec();
        let args = build_args(&spec, false);

        assert_eq!(window(&args, "-hls_time"), vec!["1"; 3]);
        assert_eq!(window(&args, "-hls_list_size"), vec!["5"; 3]);
        assert_eq!(
            window(&args, "-hls_flags"),
            vec!["delete_segments+independent_segments"; 3]
        );

        let segments = window(&args, "-hls_segment_filename");
        assert!(segments[0].ends_with("k1_h264_720p_%03d.ts"));
        assert!(segments[1].ends_with("k1_h264_480p_%03d.ts"));
        assert!(segments[2].ends_with("k1_h264_360p_%03d.ts"));

        assert!(args
            .iter()
            .any(|a| a.ends_with("k1_h264_720p.m3u8")));
    }

    #[test]
    fn test_build_args_audio() {
        let spec = spec();
        let args = build_args(&spec, false);

        assert_eq!(window(&args, "-c:a"), vec!["aac"; 3]);
        assert_eq!(window(&args, "-b:a"), vec!["128k", "128k", "96k"]);
        assert_eq!(window(&args, "-ar"), vec!["44100"; 3]);
        assert_eq!(window(&args, "-ac"), vec!["2"; 3]);
    }

    #[test]
    fn test_build_args_hardware_encoders() {
        let config = StreamingConfig::default();
        let spec = TranscoderSpec::from_config(
            &config,
            &StreamKey::from("k1"),
            "rtmp://127.0.0.1:1935/live/k1".to_string(),
            CodecPolicy {
                secondary_codec_enabled: true,
            },
        );
        let args = build_args(&spec, true);

        let encoders = window(&args, "-c:v");
        assert_eq!(&encoders[..3], &["h264_nvenc"; 3]);
        assert_eq!(&encoders[3..], &["hevc_nvenc"; 2]);
        assert!(args.iter().any(|a| a == "-no-scenecut"));
        assert!(!args.iter().any(|a| a == "-sc_threshold"));
    }

    #[test]
    fn test_build_args_archival_tail() {
        let spec = spec();
        let args = build_args(&spec, false);

        let copy_pos = args
            .iter()
            .rposition(|a| a == "copy")
            .expect("archival copy output present");
        assert_eq!(args[copy_pos - 1], "-c");
        assert_eq!(args[copy_pos + 1], "-f");
        assert_eq!(args[copy_pos + 2], "flv");
        assert_eq!(
            args.last().map(String::as_str),
            spec.recording_path.to_str()
        );
    }

    #[test]
    fn test_unknown_codec_falls_back_to_software_h264() {
        let (encoder, _) = encoder_args("av1", false);
        assert_eq!(encoder, "libx264");
    }
}
