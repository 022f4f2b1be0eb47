//! Capture stage: decodes the camera stream, writes every frame into rotating
//! raw segments and hands sampled frames to the analysis stage.
//!
//! Live sources are restarted with exponential backoff whenever a capture
//! attempt ends; finite sources end the pipeline once exhausted.

use crate::config::{RecorderConfig, SourceConfig};
use crate::controls::{DebugControls, Overlay};
use crate::ffmpeg::{FfmpegSettings, MuxError, SegmentWriter};
use crate::frame::{Frame, StreamMeta, CHANNELS};
use crate::pipeline::{SampledFrame, StageMessage};
use crate::segment_store::{write_snapshot, SnapshotSchedule, StorageLayout, StoreError};
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Local;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors that can occur during capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("GStreamer initialization failed: {0}")]
    GstreamerInit(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("Pipeline state change failed: {0}")]
    StateChangeFailed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Frame read failed: {0}")]
    Read(String),

    #[error("Giving up after {0} consecutive read failures")]
    TooManyFailures(u32),

    #[error("Segment writer failed: {0}")]
    Writer(#[from] MuxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Analysis stage has shut down")]
    ChannelClosed,
}

/// A decoded video source.
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` once a finite source is exhausted.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Stream properties, available once the first frame was read.
    fn meta(&self) -> Option<StreamMeta>;
}

/// Decodes any URI or file GStreamer can play into RGB frames.
pub struct GstreamerSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    timeout: gst::ClockTime,
    fps_override: Option<f64>,
    fallback_fps: f64,
    meta: Option<StreamMeta>,
}

impl GstreamerSource {
    /// Build and start the decoding pipeline.
    pub fn open(config: &SourceConfig) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::GstreamerInit(e.to_string()))?;

        let uri = source_uri(&config.url)?;
        let description = pipeline_description(&uri, config.is_live());
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| CaptureError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CaptureError::PipelineCreation("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::ElementNotFound("appsink".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::ElementNotFound("Could not cast to AppSink".to_string()))?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CaptureError::StateChangeFailed(e.to_string()));
        }

        info!(url = %config.url, live = config.is_live(), "Video source opened");

        Ok(Self {
            pipeline,
            appsink,
            timeout: gst::ClockTime::from_nseconds(config.read_timeout().as_nanos() as u64),
            fps_override: config.fps_override,
            fallback_fps: config.fallback_fps,
            meta: None,
        })
    }

    /// Surface a pending pipeline error, if any.
    fn check_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };

        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(CaptureError::Stream(format!(
                        "{} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Warning(w) => {
                    warn!(warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn convert(&mut self, sample: &gst::Sample) -> Result<Frame, CaptureError> {
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Read("Sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Read("Sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CaptureError::Read(e.to_string()))?;

        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;
        let data = pack_rows(map.as_slice(), width, height, stride)?;
        let frame = Frame::new(width, height, data)
            .ok_or_else(|| CaptureError::Read("Frame size mismatch".to_string()))?;

        let advertised = info.fps();
        let fps = self
            .fps_override
            .unwrap_or_else(|| frame_rate(advertised.numer(), advertised.denom(), self.fallback_fps));

        let meta = StreamMeta { width, height, fps };
        if self.meta != Some(meta) {
            info!(width, height, fps, "Stream metadata");
            self.meta = Some(meta);
        }

        Ok(frame)
    }
}

impl FrameSource for GstreamerSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.appsink.try_pull_sample(self.timeout) {
            Some(sample) => self.convert(&sample).map(Some),
            None if self.appsink.is_eos() => Ok(None),
            None => {
                self.check_bus()?;
                Err(CaptureError::Read("Timed out waiting for a frame".to_string()))
            }
        }
    }

    fn meta(&self) -> Option<StreamMeta> {
        self.meta
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// URIs pass through; local paths become `file://` URIs.
fn source_uri(url: &str) -> Result<String, CaptureError> {
    if url.contains("://") {
        return Ok(url.to_string());
    }

    let path = Path::new(url)
        .canonicalize()
        .map_err(|e| CaptureError::PipelineCreation(format!("{}: {}", url, e)))?;
    gst::glib::filename_to_uri(&path, None)
        .map(|uri| uri.to_string())
        .map_err(|e| CaptureError::PipelineCreation(e.to_string()))
}

fn pipeline_description(uri: &str, live: bool) -> String {
    format!(
        "uridecodebin uri=\"{uri}\" \
         ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=sink sync=false max-buffers={buffers} drop={drop}",
        uri = uri,
        buffers = if live { 8 } else { 2 },
        // A finite source must not lose frames, a live one must not fall behind.
        drop = live,
    )
}

fn frame_rate(numer: i32, denom: i32, fallback: f64) -> f64 {
    if numer > 0 && denom > 0 {
        numer as f64 / denom as f64
    } else {
        fallback
    }
}

/// Copy `height` rows of `width` RGB pixels out of a buffer with row padding.
fn pack_rows(buffer: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>, CaptureError> {
    let row = width as usize * CHANNELS;
    let mut data = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = buffer
            .get(start..start + row)
            .ok_or_else(|| CaptureError::Read("Short frame buffer".to_string()))?;
        data.extend_from_slice(line);
    }
    Ok(data)
}

/// Stream time derived from frame counts, monotonic across capture restarts.
#[derive(Debug, Default, Clone)]
pub struct StreamClock {
    base: f64,
    frames: u64,
    fps: f64,
}

impl StreamClock {
    /// Continue from the current time at a (possibly) new frame rate.
    pub fn rebase(&mut self, fps: f64) {
        self.base = self.now();
        self.frames = 0;
        self.fps = fps;
    }

    pub fn tick(&mut self) {
        self.frames += 1;
    }

    /// Seconds of video seen so far.
    pub fn now(&self) -> f64 {
        if self.fps > 0.0 {
            self.base + self.frames as f64 / self.fps
        } else {
            self.base
        }
    }
}

/// Statistics for the capture stage.
#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub read_failures: u64,
    pub segments_started: u64,
    pub snapshots: u64,
    pub restarts: u32,
    pub stream_start: Option<Instant>,
    pub current_fps: f64,
}

/// Capture settings derived from the service configuration.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub segment_duration: f64,
    pub check_interval: f64,
    pub max_consecutive_failures: u32,
    pub dry_run: bool,
    pub ffmpeg: FfmpegSettings,
    pub layout: StorageLayout,
}

impl From<&RecorderConfig> for CaptureSettings {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            segment_duration: config.recording.segment_duration_secs,
            check_interval: config.analysis.check_interval_secs,
            max_consecutive_failures: config.source.max_consecutive_failures,
            dry_run: config.recording.dry_run,
            ffmpeg: FfmpegSettings::from(&config.recording),
            layout: StorageLayout::from(&config.storage),
        }
    }
}

impl CaptureSettings {
    /// Frames per raw segment at `fps`.
    pub fn segment_frames(&self, fps: f64) -> u64 {
        ((self.segment_duration * fps).round() as u64).max(1)
    }

    /// Every n-th frame is analysed.
    pub fn sample_every(&self, fps: f64) -> u64 {
        ((self.check_interval * fps).round() as u64).max(1)
    }
}

/// How a capture attempt ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEnd {
    /// The source has no more frames.
    Exhausted,

    /// Shutdown was requested.
    Stopped,
}

struct OpenSegment {
    path: PathBuf,
    writer: Option<SegmentWriter>,
    frames: u64,
}

/// Producer side of the pipeline.
pub struct CaptureStage {
    settings: CaptureSettings,
    tx: mpsc::Sender<StageMessage>,
    clock: StreamClock,
    snapshots: SnapshotSchedule,
    controls: DebugControls,
    overlay: Box<dyn Overlay>,
    stats: Arc<RwLock<CaptureStats>>,
    running: Arc<AtomicBool>,
}

impl CaptureStage {
    pub fn new(
        settings: CaptureSettings,
        tx: mpsc::Sender<StageMessage>,
        controls: DebugControls,
        overlay: Box<dyn Overlay>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            tx,
            clock: StreamClock::default(),
            snapshots: SnapshotSchedule::default(),
            controls,
            overlay,
            stats: Arc::new(RwLock::new(CaptureStats::default())),
            running,
        }
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<RwLock<CaptureStats>> {
        self.stats.clone()
    }

    fn send(&self, message: StageMessage) -> Result<(), CaptureError> {
        self.tx
            .blocking_send(message)
            .map_err(|_| CaptureError::ChannelClosed)
    }

    /// Run one capture attempt until the source ends, fails or shutdown is
    /// requested. The open segment is always closed on exit.
    pub fn run(&mut self, source: &mut dyn FrameSource) -> Result<AttemptEnd, CaptureError> {
        let mut segment = None;
        let result = self.capture(source, &mut segment);

        if let Some(open) = segment.take() {
            if let Err(e) = self.retire(open) {
                debug!(error = %e, "Could not hand over the last segment writer");
            }
        }

        result
    }

    fn capture(
        &mut self,
        source: &mut dyn FrameSource,
        segment: &mut Option<OpenSegment>,
    ) -> Result<AttemptEnd, CaptureError> {
        let mut meta: Option<StreamMeta> = None;
        let mut failures = 0u32;
        let mut frame_index = 0u64;

        self.stats.write().stream_start = Some(Instant::now());

        while self.running.load(Ordering::SeqCst) {
            let frame = match source.read() {
                Ok(Some(frame)) => {
                    failures = failures.saturating_sub(1);
                    frame
                }
                Ok(None) => {
                    info!(frames = frame_index, "Video source exhausted");
                    return Ok(AttemptEnd::Exhausted);
                }
                Err(CaptureError::Read(reason)) => {
                    failures += 1;
                    self.stats.write().read_failures += 1;
                    warn!(failures, reason = %reason, "Frame read failed");
                    if failures > self.settings.max_consecutive_failures {
                        error!(failures, "Too many consecutive read failures");
                        return Err(CaptureError::TooManyFailures(failures));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(current) = source.meta() else {
                debug!("Frame without stream metadata, skipping");
                continue;
            };

            if meta != Some(current) {
                if meta.is_some() {
                    info!(
                        width = current.width,
                        height = current.height,
                        fps = current.fps,
                        "Stream properties changed"
                    );
                    if let Some(open) = segment.take() {
                        self.retire(open)?;
                    }
                }
                self.clock.rebase(current.fps);
                self.send(StageMessage::Metadata(current))?;
                meta = Some(current);
                frame_index = 0;
            }

            let segment_frames = self.settings.segment_frames(current.fps);
            if segment.as_ref().map_or(true, |open| open.frames >= segment_frames) {
                self.rotate(segment, &frame, &current)?;
            }

            if let Some(open) = segment.as_mut() {
                if let Some(writer) = open.writer.as_mut() {
                    writer.write(&frame)?;
                }
                open.frames += 1;
            }

            let timestamp = self.clock.now();
            self.clock.tick();
            self.record_frame();

            if frame_index % self.settings.sample_every(current.fps) == 0 {
                self.sample(frame, timestamp)?;
            }
            frame_index += 1;
        }

        Ok(AttemptEnd::Stopped)
    }

    fn record_frame(&self) {
        let mut stats = self.stats.write();
        stats.frames_read += 1;
        if let Some(start) = stats.stream_start {
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                stats.current_fps = stats.frames_read as f64 / elapsed;
            }
        }
    }

    /// Close the open segment and start the next one.
    fn rotate(
        &mut self,
        segment: &mut Option<OpenSegment>,
        frame: &Frame,
        meta: &StreamMeta,
    ) -> Result<(), CaptureError> {
        if let Some(open) = segment.take() {
            self.retire(open)?;
        }

        let now = Local::now();

        if !self.settings.dry_run && self.snapshots.claim(now) {
            let path = self.settings.layout.snapshot_path(now);
            match write_snapshot(frame, &path) {
                Ok(()) => {
                    self.stats.write().snapshots += 1;
                    info!(snapshot = %path.display(), "Hourly snapshot saved");
                }
                Err(e) => warn!(error = %e, "Failed to save snapshot"),
            }
        }

        let path = self.settings.layout.segment_path(now);
        let writer = if self.settings.dry_run {
            None
        } else {
            StorageLayout::prepare(&path)?;
            Some(SegmentWriter::spawn(&self.settings.ffmpeg, &path, meta)?)
        };

        debug!(segment = %path.display(), "Segment started");
        self.stats.write().segments_started += 1;
        self.send(StageMessage::SegmentPath(path.clone()))?;

        *segment = Some(OpenSegment {
            path,
            writer,
            frames: 0,
        });
        Ok(())
    }

    fn retire(&self, open: OpenSegment) -> Result<(), CaptureError> {
        debug!(segment = %open.path.display(), frames = open.frames, "Segment closed");
        match open.writer {
            Some(writer) => self.send(StageMessage::WriterHandle(writer.finish())),
            None => Ok(()),
        }
    }

    /// Hand a frame to analysis and wait for its acknowledgement.
    fn sample(&mut self, frame: Frame, timestamp: f64) -> Result<(), CaptureError> {
        let (ack, done) = oneshot::channel();
        self.send(StageMessage::Frame(SampledFrame {
            frame,
            timestamp,
            ack,
        }))?;
        self.stats.write().frames_sampled += 1;

        let report = done.blocking_recv().map_err(|_| CaptureError::ChannelClosed)?;

        self.controls.on_report(&report);
        if self.controls.overlay_enabled(report.recording) {
            self.overlay.render(&report);
        }
        self.controls.wait_while_paused(&self.running);
        Ok(())
    }
}

/// Restart policy around the capture stage.
pub struct CaptureDriver<F> {
    stage: CaptureStage,
    open: F,
    live: bool,
    base_delay: Duration,
    max_delay: Duration,
    running: Arc<AtomicBool>,
}

impl<F> CaptureDriver<F>
where
    F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError>,
{
    pub fn new(stage: CaptureStage, open: F, source: &SourceConfig) -> Self {
        let running = stage.running.clone();
        Self {
            stage,
            open,
            live: source.is_live(),
            base_delay: source.restart_base_delay(),
            max_delay: source.restart_max_delay(),
            running,
        }
    }

    pub fn stats(&self) -> Arc<RwLock<CaptureStats>> {
        self.stage.stats()
    }

    /// Capture until the source ends (finite), shutdown is requested or the
    /// analysis stage goes away. Always ends the stream with `EndOfStream`.
    pub fn run(mut self) -> Result<(), CaptureError> {
        let result = self.drive();

        if self.stage.send(StageMessage::EndOfStream).is_err() {
            debug!("Analysis stage gone before end of stream");
        }
        result
    }

    fn drive(&mut self) -> Result<(), CaptureError> {
        let mut backoff = restart_backoff(self.base_delay, self.max_delay);

        while self.running.load(Ordering::SeqCst) {
            let frames_before = self.stage.stats.read().frames_read;

            let outcome = match (self.open)() {
                Ok(mut source) => self.stage.run(source.as_mut()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(AttemptEnd::Stopped) => return Ok(()),
                Ok(AttemptEnd::Exhausted) if !self.live => return Ok(()),
                Err(CaptureError::ChannelClosed) => return Err(CaptureError::ChannelClosed),
                Err(e) if !self.live => return Err(e),
                Ok(AttemptEnd::Exhausted) => warn!("Live stream ended"),
                Err(e) => warn!(error = %e, "Capture attempt failed"),
            }

            if self.stage.stats.read().frames_read > frames_before {
                backoff.reset();
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_delay);
            let restarts = {
                let mut stats = self.stage.stats.write();
                stats.restarts += 1;
                stats.restarts
            };
            info!(
                restarts,
                delay_ms = delay.as_millis() as u64,
                "Restarting capture"
            );
            sleep_while_running(&self.running, delay);
        }

        Ok(())
    }
}

/// Unbounded restart backoff whose first delay is `base`.
fn restart_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: base,
        max_interval: max,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

fn sleep_while_running(running: &AtomicBool, delay: Duration) {
    let step = Duration::from_millis(100);
    let deadline = Instant::now() + delay;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}
