pub mod cleanup;
pub mod ingest;
pub mod mock_launcher;
pub mod orchestrator;
pub mod playlist;
pub mod transcoder;

pub use cleanup::CleanupScheduler;
pub use ingest::PublishEvent;
pub use orchestrator::{StreamOrchestrator, StreamSummary};
pub use transcoder::{
    FfmpegLauncher, TranscoderExit, TranscoderHandle, TranscoderLauncher, TranscoderSpec,
    TranscoderState,
};
