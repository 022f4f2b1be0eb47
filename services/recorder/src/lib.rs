//! Railwatch Recorder - motion-triggered recording for a fixed station camera
//!
//! This library watches a camera feed, detects motion inside operator-defined
//! regions and turns each event into one merged recording. It handles:
//!
//! - Frame differencing with weather and sky-light gating
//! - Day/night classification with hysteresis
//! - Segment rotation, retention and merging through ffmpeg
//! - A two-stage capture/analysis pipeline with acknowledged frames
//!
//! # Example
//!
//! ```rust,no_run
//! use railwatch_recorder::{Pipeline, RecorderConfig};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RecorderConfig::load()?;
//!     config.validate()?;
//!
//!     let running = Arc::new(AtomicBool::new(true));
//!     Pipeline::new(config, running).run().await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod controls;
pub mod ffmpeg;
pub mod frame;
pub mod motion;
pub mod pipeline;
pub mod recording;
pub mod region;
pub mod segment_store;

// Re-export main types
pub use capture::{
    AttemptEnd, CaptureDriver, CaptureError, CaptureSettings, CaptureStage, CaptureStats,
    FrameSource, GstreamerSource, StreamClock,
};
pub use config::{ConfigValidationError, LoggingConfig, RecorderConfig};
pub use controls::{ControlEvent, DebugControls, LogOverlay, Overlay};
pub use ffmpeg::{
    DryRunMuxer, FfmpegMuxer, FfmpegSettings, MuxError, Muxer, ProcessHandle, SegmentWriter,
};
pub use frame::{DiffImage, Frame, StreamMeta};
pub use motion::{DayNightClassifier, FrameAnalysis, MotionEngine, MotionError, MotionSettings};
pub use pipeline::{
    AnalysisReport, AnalysisStage, AnalysisStats, Pipeline, PipelineError, SampledFrame,
    StageMessage,
};
pub use recording::{FlushReport, RecordingController, RecordingSession, SegmentOutcome, Transition};
pub use region::{Condition, DayMode, MaskTable, Region, RegionError, RegionMask, RegionSet};
pub use segment_store::{RetentionQueue, SnapshotSchedule, StorageLayout, StoreError};
