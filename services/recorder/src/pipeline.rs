//! Two-stage pipeline: capture produces, analysis consumes.
//!
//! ```text
//! FrameSource -> CaptureStage --(bounded mpsc)--> AnalysisStage -> RecordingController -> Muxer
//!                     ^                                 |
//!                     +----------- oneshot ack ---------+
//! ```
//!
//! Both stages run on blocking threads. Every sampled frame carries a oneshot
//! acknowledgement the capture stage waits for, so at most one frame is in
//! analysis at any time. Segment paths and writer handles travel on the same
//! channel and are seen in the order they were produced.

use crate::capture::{
    CaptureDriver, CaptureError, CaptureSettings, CaptureStage, CaptureStats, FrameSource,
    GstreamerSource,
};
use crate::config::RecorderConfig;
use crate::controls::{spawn_stdin_reader, DebugControls, LogOverlay};
use crate::ffmpeg::{DryRunMuxer, FfmpegMuxer, FfmpegSettings, Muxer, ProcessHandle};
use crate::frame::{Frame, StreamMeta};
use crate::motion::{FrameAnalysis, MotionEngine, MotionSettings};
use crate::recording::{RecordingController, SegmentOutcome, Transition};
use crate::region::RegionError;
use crate::segment_store::{RetentionQueue, StorageLayout};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors that end the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid region configuration: {0}")]
    Configuration(#[from] RegionError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A frame selected for analysis.
#[derive(Debug)]
pub struct SampledFrame {
    pub frame: Frame,

    /// Stream time in seconds
    pub timestamp: f64,

    /// Completed by the analysis stage once the frame is processed
    pub ack: oneshot::Sender<AnalysisReport>,
}

/// Messages from the capture stage, consumed in FIFO order.
#[derive(Debug)]
pub enum StageMessage {
    /// Stream properties of a (re)started capture
    Metadata(StreamMeta),

    Frame(SampledFrame),

    /// A new raw segment was opened at this path
    SegmentPath(PathBuf),

    /// Encoder of a completed segment, still flushing to disk
    WriterHandle(ProcessHandle),

    EndOfStream,
}

/// Acknowledgement of one sampled frame.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub timestamp: f64,

    /// `None` while metadata is pending, for the priming frame and on errors
    pub analysis: Option<FrameAnalysis>,

    pub transition: Transition,

    /// Whether a recording is running after this frame
    pub recording: bool,
}

/// Statistics for the analysis stage.
#[derive(Debug, Default, Clone)]
pub struct AnalysisStats {
    pub frames_analysed: u64,
    pub frames_skipped: u64,
    pub analysis_errors: u64,
    pub recordings_started: u64,
    pub recordings_stopped: u64,
    pub recordings_cancelled: u64,
    pub recordings_merged: u64,
    pub merge_failures: u64,
    pub segments_seen: u64,
    pub segments_evicted: u64,
    pub is_night: bool,
    pub recording: bool,
}

/// Consumer side of the pipeline.
pub struct AnalysisStage {
    engine: MotionEngine,
    controller: RecordingController,
    retention: RetentionQueue,
    writers: Vec<ProcessHandle>,
    last_timestamp: f64,
    stats: Arc<RwLock<AnalysisStats>>,
}

impl AnalysisStage {
    pub fn new(engine: MotionEngine, controller: RecordingController, retention: RetentionQueue) -> Self {
        Self {
            engine,
            controller,
            retention,
            writers: Vec::new(),
            last_timestamp: 0.0,
            stats: Arc::new(RwLock::new(AnalysisStats::default())),
        }
    }

    /// Build the stage from configuration, merging with `muxer`.
    pub fn from_config(config: &RecorderConfig, muxer: Box<dyn Muxer>) -> Self {
        let engine = MotionEngine::new(MotionSettings::from(&config.analysis), config.region_set());
        let controller = RecordingController::new(
            StorageLayout::from(&config.storage),
            muxer,
            config.recording.minimum_duration_secs,
        );
        let retention = RetentionQueue::new(
            config.recording.retention_high,
            config.recording.retention_low,
            !config.recording.dry_run,
        );
        Self::new(engine, controller, retention)
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<RwLock<AnalysisStats>> {
        self.stats.clone()
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    /// Drain the channel until end of stream, then close the session.
    pub fn run(mut self, mut rx: mpsc::Receiver<StageMessage>) -> Result<(), PipelineError> {
        let result = loop {
            let Some(message) = rx.blocking_recv() else {
                debug!("Capture stage closed the channel");
                break Ok(());
            };

            match self.handle(message) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        drop(rx);
        self.shutdown();
        result
    }

    /// Process one message.
    pub fn handle(&mut self, message: StageMessage) -> Result<ControlFlow<()>, PipelineError> {
        match message {
            StageMessage::Metadata(meta) => {
                info!(
                    width = meta.width,
                    height = meta.height,
                    fps = meta.fps,
                    "Capture started"
                );
                self.engine.configure(&meta)?;
            }
            StageMessage::Frame(SampledFrame {
                frame,
                timestamp,
                ack,
            }) => {
                let report = self.analyse(frame, timestamp);
                if ack.send(report).is_err() {
                    debug!("Capture stage no longer waiting for acknowledgement");
                }
            }
            StageMessage::SegmentPath(path) => self.on_segment(path),
            StageMessage::WriterHandle(handle) => {
                self.writers.push(handle);
                self.reap_writers();
            }
            StageMessage::EndOfStream => {
                info!("End of stream");
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn analyse(&mut self, frame: Frame, timestamp: f64) -> AnalysisReport {
        self.last_timestamp = timestamp;

        let analysis = match self.engine.analyse(frame, timestamp) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "Frame analysis failed");
                self.stats.write().analysis_errors += 1;
                None
            }
        };

        let transition = match &analysis {
            Some(analysis) => {
                self.controller
                    .update(analysis.any_active, analysis.skip_lead_in, timestamp)
            }
            None => Transition::Unchanged,
        };

        {
            let mut stats = self.stats.write();
            match &analysis {
                Some(analysis) => {
                    stats.frames_analysed += 1;
                    stats.is_night = analysis.is_night;
                }
                None => stats.frames_skipped += 1,
            }
            match transition {
                Transition::Started { .. } => stats.recordings_started += 1,
                Transition::Stopped => stats.recordings_stopped += 1,
                Transition::Cancelled => stats.recordings_cancelled += 1,
                Transition::Unchanged => {}
            }
            stats.recording = self.controller.is_recording();
        }

        AnalysisReport {
            timestamp,
            analysis,
            transition,
            recording: self.controller.is_recording(),
        }
    }

    fn on_segment(&mut self, path: PathBuf) {
        self.reap_writers();

        // The last segment of a stopped session may still be encoding.
        if self.controller.flush_due() {
            self.wait_for_writers();
        }

        match self.controller.on_segment(path.clone()) {
            SegmentOutcome::Flushed(report) => {
                let mut stats = self.stats.write();
                if report.merged {
                    stats.recordings_merged += 1;
                } else {
                    stats.merge_failures += 1;
                }
            }
            SegmentOutcome::Appended | SegmentOutcome::Idle => {}
        }

        self.retention.push(path);
        let evicted = if self.controller.is_idle() {
            self.retention.evict().len() as u64
        } else {
            0
        };

        let mut stats = self.stats.write();
        stats.segments_seen += 1;
        stats.segments_evicted += evicted;
    }

    /// Drop handles of encoders that have exited.
    fn reap_writers(&mut self) {
        self.writers.retain_mut(|handle| match handle.try_wait() {
            Ok(finished) => !finished,
            Err(e) => {
                warn!(error = %e, "Segment writer failed");
                false
            }
        });
    }

    fn wait_for_writers(&mut self) {
        for handle in self.writers.drain(..) {
            let label = handle.label().to_string();
            if let Err(e) = handle.wait() {
                warn!(writer = %label, error = %e, "Segment writer failed");
            }
        }
    }

    fn shutdown(&mut self) {
        self.wait_for_writers();

        if let Some(report) = self.controller.finish(self.last_timestamp) {
            let mut stats = self.stats.write();
            if report.merged {
                stats.recordings_merged += 1;
            } else {
                stats.merge_failures += 1;
            }
        }
        self.stats.write().recording = false;
        info!("Analysis stage stopped");
    }
}

/// Wires both stages together and runs them to completion.
pub struct Pipeline {
    config: RecorderConfig,
    running: Arc<AtomicBool>,
    muxer: Option<Box<dyn Muxer>>,
}

impl Pipeline {
    pub fn new(config: RecorderConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            running,
            muxer: None,
        }
    }

    /// Merge recordings with `muxer` instead of the configured one.
    pub fn with_muxer(mut self, muxer: Box<dyn Muxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    /// Run against the configured GStreamer source.
    pub async fn run(self) -> Result<(), PipelineError> {
        let source = self.config.source.clone();
        self.run_with(move || {
            GstreamerSource::open(&source).map(|s| Box::new(s) as Box<dyn FrameSource>)
        })
        .await
    }

    /// Run with frame sources produced by `open`, called once per capture attempt.
    pub async fn run_with<F>(self, open: F) -> Result<(), PipelineError>
    where
        F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError> + Send + 'static,
    {
        let Self {
            config,
            running,
            muxer,
        } = self;

        let muxer = muxer.unwrap_or_else(|| default_muxer(&config));
        let analysis = AnalysisStage::from_config(&config, muxer);
        let analysis_stats = analysis.stats();

        let (tx, rx) = mpsc::channel(config.pipeline.queue_size);
        let stage = CaptureStage::new(
            CaptureSettings::from(&config),
            tx,
            debug_controls(&config),
            Box::new(LogOverlay::new(&config.region_set())),
            running.clone(),
        );
        let driver = CaptureDriver::new(stage, open, &config.source);
        let capture_stats = driver.stats();

        info!(
            url = %config.source.url,
            live = config.source.is_live(),
            regions = config.regions.len(),
            dry_run = config.recording.dry_run,
            "Starting pipeline"
        );

        let analysis_handle = tokio::task::spawn_blocking(move || analysis.run(rx));
        let capture_handle = tokio::task::spawn_blocking(move || driver.run());

        let monitor_handle = tokio::spawn(run_stats_monitor(
            capture_stats.clone(),
            analysis_stats.clone(),
            config.pipeline.stats_interval(),
        ));

        let capture_result = capture_handle.await;
        let analysis_result = analysis_handle.await;
        monitor_handle.abort();

        log_final_stats(&capture_stats.read(), &analysis_stats.read());

        // A failing analysis stage closes the channel under the capture stage.
        analysis_result??;
        match capture_result? {
            Ok(()) | Err(CaptureError::ChannelClosed) => Ok(()),
            Err(e) => {
                error!(error = %e, "Capture failed");
                Err(e.into())
            }
        }
    }
}

fn default_muxer(config: &RecorderConfig) -> Box<dyn Muxer> {
    if config.recording.dry_run {
        Box::new(DryRunMuxer)
    } else {
        Box::new(FfmpegMuxer::new(FfmpegSettings::from(&config.recording)))
    }
}

fn debug_controls(config: &RecorderConfig) -> DebugControls {
    if !config.debug.interactive {
        return DebugControls::disabled();
    }

    match spawn_stdin_reader() {
        Ok(events) => {
            info!("Interactive controls enabled (p: play/pause, a: pause on trigger, f: fast forward)");
            DebugControls::new(events, config.debug.pause_on_trigger)
        }
        Err(e) => {
            warn!(error = %e, "Could not read controls from stdin");
            DebugControls::disabled()
        }
    }
}

/// Log statistics periodically.
async fn run_stats_monitor(
    capture: Arc<RwLock<CaptureStats>>,
    analysis: Arc<RwLock<AnalysisStats>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let capture_stats = capture.read().clone();
        info!(
            frames_read = capture_stats.frames_read,
            frames_sampled = capture_stats.frames_sampled,
            read_failures = capture_stats.read_failures,
            fps = format!("{:.2}", capture_stats.current_fps),
            restarts = capture_stats.restarts,
            "Capture stats"
        );

        let analysis_stats = analysis.read().clone();
        info!(
            frames_analysed = analysis_stats.frames_analysed,
            recording = analysis_stats.recording,
            is_night = analysis_stats.is_night,
            recordings_merged = analysis_stats.recordings_merged,
            segments_evicted = analysis_stats.segments_evicted,
            "Analysis stats"
        );
    }
}

/// Log final statistics on shutdown.
pub fn log_final_stats(capture: &CaptureStats, analysis: &AnalysisStats) {
    info!("=== Final Statistics ===");

    info!(
        frames_read = capture.frames_read,
        frames_sampled = capture.frames_sampled,
        read_failures = capture.read_failures,
        segments_started = capture.segments_started,
        snapshots = capture.snapshots,
        restarts = capture.restarts,
        "Capture final stats"
    );

    info!(
        frames_analysed = analysis.frames_analysed,
        frames_skipped = analysis.frames_skipped,
        analysis_errors = analysis.analysis_errors,
        recordings_started = analysis.recordings_started,
        recordings_stopped = analysis.recordings_stopped,
        recordings_cancelled = analysis.recordings_cancelled,
        recordings_merged = analysis.recordings_merged,
        merge_failures = analysis.merge_failures,
        segments_evicted = analysis.segments_evicted,
        "Analysis final stats"
    );
}
