//! Mock transcoder launcher for testing without an encoder binary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use lectern_core::{Error, Result};

use crate::transcoder::{
    TranscoderHandle, TranscoderLauncher, TranscoderSpec, TranscoderState,
};

/// Handle whose `stop()` just flips state and counts calls.
#[derive(Debug, Default)]
pub struct MockTranscoderHandle {
    pub recording_path: PathBuf,
    pub stop_calls: AtomicUsize,
    stopped: std::sync::atomic::AtomicBool,
}

impl MockTranscoderHandle {
    #[must_use]
    pub fn new(recording_path: PathBuf) -> Self {
        Self {
            recording_path,
            stop_calls: AtomicUsize::new(0),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TranscoderHandle for MockTranscoderHandle {
    async fn stop(&self) -> PathBuf {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.recording_path.clone()
    }

    fn recording_path(&self) -> PathBuf {
        self.recording_path.clone()
    }

    fn state(&self) -> TranscoderState {
        if self.stopped.load(Ordering::SeqCst) {
            TranscoderState::Exited
        } else {
            TranscoderState::Running
        }
    }
}

/// Launcher that records every spec it is asked to launch and can be primed
/// to fail the next spawn.
#[derive(Default)]
pub struct MockTranscoderLauncher {
    pub launched: Mutex<Vec<TranscoderSpec>>,
    pub handles: Mutex<Vec<Arc<MockTranscoderHandle>>>,
    fail_next: std::sync::atomic::AtomicBool,
}

impl MockTranscoderLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub async fn launch_count(&self) -> usize {
        self.launched.lock().await.len()
    }
}

#[async_trait]
impl TranscoderLauncher for MockTranscoderLauncher {
    async fn launch(&self, spec: TranscoderSpec) -> Result<Arc<dyn TranscoderHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Transcoder("mock spawn failure".to_string()));
        }
        let handle = Arc::new(MockTranscoderHandle::new(spec.recording_path.clone()));
        self.launched.lock().await.push(spec);
        self.handles.lock().await.push(Arc::clone(&handle));
        Ok(handle)
    }
}
