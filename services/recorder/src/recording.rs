//! Recording state machine.
//!
//! Maps per-frame motion verdicts onto sessions of whole segments. A session
//! collects the segments written while motion lasts (plus the one before it as
//! lead-in) and merges them into one archive file once the segment that was
//! open at the stop moment has been completed.

use crate::ffmpeg::Muxer;
use crate::segment_store::StorageLayout;
use chrono::Local;
use std::mem;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// State of the current or most recent recording session.
#[derive(Debug, Clone, Default)]
pub struct RecordingSession {
    /// Segment completed before the one currently being written
    pub previous_segment: Option<PathBuf>,

    /// Segment currently being written
    pub current_segment: Option<PathBuf>,

    /// Merge target of the session
    pub target: Option<PathBuf>,

    pub recording: bool,

    /// Segments to merge, in arrival order
    pub pending: Vec<PathBuf>,

    /// Stream time the session started at
    pub started_at: Option<f64>,
}

/// Effect of one motion verdict on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,

    /// Idle to recording. `lead_in` is set when the previous segment was included.
    Started { lead_in: bool },

    /// Recording to idle; pending segments are merged at the next rotation.
    Stopped,

    /// Recording to idle before the minimum duration; nothing will be merged.
    Cancelled,
}

/// Result of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub target: PathBuf,
    pub segments: usize,

    /// The muxer accepted the merge. It may still be running.
    pub merged: bool,
}

/// Effect of a segment rotation on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// The new segment joined the running session.
    Appended,

    /// The pending segments of a stopped session were merged.
    Flushed(FlushReport),

    /// No session involved.
    Idle,
}

pub struct RecordingController {
    layout: StorageLayout,
    muxer: Box<dyn Muxer>,
    minimum_duration: f64,
    session: RecordingSession,
}

impl RecordingController {
    pub fn new(layout: StorageLayout, muxer: Box<dyn Muxer>, minimum_duration: f64) -> Self {
        Self {
            layout,
            muxer,
            minimum_duration,
            session: RecordingSession::default(),
        }
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn is_recording(&self) -> bool {
        self.session.recording
    }

    pub fn pending(&self) -> &[PathBuf] {
        &self.session.pending
    }

    /// Stopped with segments still waiting to be merged.
    pub fn flush_due(&self) -> bool {
        !self.session.recording && !self.session.pending.is_empty()
    }

    /// Not recording and nothing waiting to be merged.
    pub fn is_idle(&self) -> bool {
        !self.session.recording && self.session.pending.is_empty()
    }

    /// Apply the verdict of one analysed frame at stream time `now`.
    pub fn update(&mut self, any_active: bool, skip_lead_in: bool, now: f64) -> Transition {
        match (self.session.recording, any_active) {
            (false, true) => self.start(skip_lead_in, now),
            (true, false) => self.stop(now),
            _ => Transition::Unchanged,
        }
    }

    fn start(&mut self, skip_lead_in: bool, now: f64) -> Transition {
        if !self.session.pending.is_empty() {
            // Re-triggered before the stopped session was merged.
            self.session.recording = true;
            info!(
                pending = self.session.pending.len(),
                started_at = self.session.started_at.unwrap_or(now),
                "Recording resumed"
            );
            return Transition::Started { lead_in: false };
        }

        let current = match &self.session.current_segment {
            Some(current) => current.clone(),
            None => {
                debug!("Motion before the first segment, recording not started");
                return Transition::Unchanged;
            }
        };

        let lead_in = match (&self.session.previous_segment, skip_lead_in) {
            (Some(previous), false) => {
                self.session.pending.push(previous.clone());
                true
            }
            _ => false,
        };
        self.session.pending.push(current);

        let target = self.layout.recording_path(Local::now());
        info!(
            target = %target.display(),
            lead_in,
            stream_time = now,
            "Recording started"
        );

        self.session.target = Some(target);
        self.session.started_at = Some(now);
        self.session.recording = true;
        Transition::Started { lead_in }
    }

    fn stop(&mut self, now: f64) -> Transition {
        self.session.recording = false;
        let elapsed = now - self.session.started_at.unwrap_or(now);

        if elapsed < self.minimum_duration {
            info!(
                elapsed_secs = elapsed,
                discarded = self.session.pending.len(),
                "Recording cancelled, too short"
            );
            self.session.pending.clear();
            self.session.target = None;
            self.session.started_at = None;
            return Transition::Cancelled;
        }

        info!(
            elapsed_secs = elapsed,
            segments = self.session.pending.len(),
            "Recording stopped"
        );
        Transition::Stopped
    }

    /// Register a freshly opened segment.
    pub fn on_segment(&mut self, path: PathBuf) -> SegmentOutcome {
        self.session.previous_segment = self.session.current_segment.replace(path.clone());

        if self.session.recording {
            debug!(segment = %path.display(), "Segment appended to recording");
            self.session.pending.push(path);
            return SegmentOutcome::Appended;
        }

        match self.flush() {
            Some(report) => SegmentOutcome::Flushed(report),
            None => SegmentOutcome::Idle,
        }
    }

    /// Merge the pending segments into the session target.
    ///
    /// The pending list is cleared whether or not the merge succeeds.
    pub fn flush(&mut self) -> Option<FlushReport> {
        let segments = mem::take(&mut self.session.pending);
        let target = self.session.target.take();
        self.session.started_at = None;

        if segments.is_empty() {
            return None;
        }

        let target = target.unwrap_or_else(|| self.layout.recording_path(Local::now()));
        let merged = self.merge(&segments, &target);

        Some(FlushReport {
            target,
            segments: segments.len(),
            merged,
        })
    }

    fn merge(&self, segments: &[PathBuf], target: &Path) -> bool {
        match self.muxer.concat(segments, target) {
            Ok(()) => {
                info!(
                    target = %target.display(),
                    segments = segments.len(),
                    "Recording merge started"
                );
                true
            }
            Err(e) => {
                warn!(
                    target = %target.display(),
                    segments = segments.len(),
                    error = %e,
                    "Failed to merge recording"
                );
                false
            }
        }
    }

    /// Close the session at shutdown: stop a running recording, then merge
    /// whatever is still pending.
    pub fn finish(&mut self, now: f64) -> Option<FlushReport> {
        if self.session.recording {
            self.stop(now);
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::{MockMuxer, MuxError};

    fn layout() -> StorageLayout {
        StorageLayout::new(
            Path::new("/cache"),
            Path::new("/archive"),
            Path::new("/images"),
        )
    }

    fn segment(name: &str) -> PathBuf {
        PathBuf::from(format!("/cache/2025-11-20/{}.mts", name))
    }

    fn controller(muxer: MockMuxer) -> RecordingController {
        RecordingController::new(layout(), Box::new(muxer), 3.0)
    }

    fn expect_merge(muxer: &mut MockMuxer, expected: Vec<PathBuf>) {
        muxer
            .expect_concat()
            .withf(move |segments, target| {
                segments.to_vec() == expected && target.starts_with("/archive")
            })
            .times(1)
            .returning(|_, _| Ok(()));
    }

    #[test]
    fn test_short_session_is_cancelled_without_merge() {
        let mut muxer = MockMuxer::new();
        muxer.expect_concat().times(0);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        assert_eq!(
            controller.update(true, false, 1.0),
            Transition::Started { lead_in: false }
        );
        assert_eq!(controller.update(false, false, 1.5), Transition::Cancelled);
        assert!(controller.is_idle());

        assert_eq!(controller.on_segment(segment("b")), SegmentOutcome::Idle);
    }

    #[test]
    fn test_lead_in_segment_included() {
        let mut muxer = MockMuxer::new();
        expect_merge(&mut muxer, vec![segment("a"), segment("b"), segment("c")]);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.on_segment(segment("b"));
        assert_eq!(
            controller.update(true, false, 12.0),
            Transition::Started { lead_in: true }
        );
        assert_eq!(controller.on_segment(segment("c")), SegmentOutcome::Appended);
        assert_eq!(controller.update(false, false, 25.0), Transition::Stopped);
        assert!(controller.flush_due());

        match controller.on_segment(segment("d")) {
            SegmentOutcome::Flushed(report) => {
                assert_eq!(report.segments, 3);
                assert!(report.merged);
            }
            other => panic!("expected flush, got {:?}", other),
        }
        assert!(controller.is_idle());
    }

    #[test]
    fn test_skip_lead_in_starts_with_current_segment() {
        let mut muxer = MockMuxer::new();
        expect_merge(&mut muxer, vec![segment("b")]);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.on_segment(segment("b"));
        assert_eq!(
            controller.update(true, true, 12.0),
            Transition::Started { lead_in: false }
        );
        assert_eq!(controller.pending(), &[segment("b")]);
        controller.update(false, false, 16.0);
        controller.on_segment(segment("c"));
    }

    #[test]
    fn test_motion_before_first_segment_is_ignored() {
        let mut muxer = MockMuxer::new();
        muxer.expect_concat().times(0);
        let mut controller = controller(muxer);

        assert_eq!(controller.update(true, false, 0.0), Transition::Unchanged);
        assert!(!controller.is_recording());
    }

    #[test]
    fn test_retrigger_before_rotation_resumes_session() {
        let mut muxer = MockMuxer::new();
        expect_merge(&mut muxer, vec![segment("a"), segment("b")]);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.on_segment(segment("b"));
        controller.update(true, false, 10.0);
        let target = controller.session().target.clone();
        controller.update(false, false, 14.0);

        // Same target and anchor: a quick stop after resuming still counts
        // from the first start.
        controller.update(true, false, 15.0);
        assert!(controller.is_recording());
        assert_eq!(controller.session().target, target);
        assert_eq!(controller.update(false, false, 15.5), Transition::Stopped);

        assert!(matches!(
            controller.on_segment(segment("c")),
            SegmentOutcome::Flushed(_)
        ));
    }

    #[test]
    fn test_failed_merge_still_clears_pending() {
        let mut muxer = MockMuxer::new();
        muxer
            .expect_concat()
            .times(1)
            .returning(|_, target| Err(MuxError::Empty(target.to_path_buf())));
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.update(true, true, 0.0);
        controller.update(false, false, 5.0);

        match controller.on_segment(segment("b")) {
            SegmentOutcome::Flushed(report) => assert!(!report.merged),
            other => panic!("expected flush, got {:?}", other),
        }
        assert!(controller.pending().is_empty());
        assert!(controller.is_idle());
    }

    #[test]
    fn test_finish_merges_running_session() {
        let mut muxer = MockMuxer::new();
        expect_merge(&mut muxer, vec![segment("a"), segment("b")]);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.update(true, true, 0.0);
        controller.on_segment(segment("b"));

        let report = controller.finish(8.0);
        assert!(matches!(report, Some(FlushReport { segments: 2, merged: true, .. })));
        assert!(controller.is_idle());
    }

    #[test]
    fn test_finish_cancels_short_running_session() {
        let mut muxer = MockMuxer::new();
        muxer.expect_concat().times(0);
        let mut controller = controller(muxer);

        controller.on_segment(segment("a"));
        controller.update(true, false, 0.0);

        assert!(controller.finish(1.0).is_none());
    }
}
