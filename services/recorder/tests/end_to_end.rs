//! Drives both pipeline stages through the public API with scripted frames.

use parking_lot::Mutex;
use railwatch_recorder::region::compute_mask;
use railwatch_recorder::{
    AnalysisReport, AnalysisStage, CaptureError, Frame, FrameSource, MuxError, Muxer, Pipeline,
    RecorderConfig, RegionMask, SampledFrame, StageMessage, StreamMeta, Transition,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::oneshot;

const WIDTH: u32 = 100;
const HEIGHT: u32 = 100;
const BASE: [u8; 3] = [100, 100, 100];

/// Remembers every merge instead of running ffmpeg.
#[derive(Clone, Default)]
struct RecordingMuxer {
    merges: Arc<Mutex<Vec<(Vec<PathBuf>, PathBuf)>>>,
}

impl Muxer for RecordingMuxer {
    fn concat(&self, segments: &[PathBuf], target: &Path) -> Result<(), MuxError> {
        self.merges
            .lock()
            .push((segments.to_vec(), target.to_path_buf()));
        Ok(())
    }
}

struct ScriptedSource {
    frames: VecDeque<Frame>,
    fps: f64,
    meta: Option<StreamMeta>,
}

impl FrameSource for ScriptedSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let frame = self.frames.pop_front();
        if let Some(frame) = &frame {
            self.meta = Some(StreamMeta {
                width: frame.width,
                height: frame.height,
                fps: self.fps,
            });
        }
        Ok(frame)
    }

    fn meta(&self) -> Option<StreamMeta> {
        self.meta
    }
}

fn create_test_config(dir: &Path) -> RecorderConfig {
    let toml = format!(
        r#"
[source]
url = "station.mp4"

[analysis]
check_interval_secs = 0.5

[recording]
segment_duration_secs = 2.0
minimum_duration_secs = 3.0
dry_run = true

[storage]
cache_dir = "{dir}/cache"
archive_dir = "{dir}/archive"
image_dir = "{dir}/images"

[[regions]]
name = "A"
points = [[0.1, 0.6], [0.4, 0.6], [0.4, 0.9], [0.1, 0.9]]
conditions = [
    {{ threshold = 15000, area_fraction = 0.10, max_weather_noise = 50000, max_sky_light = 20000000 }},
]
"#,
        dir = dir.display()
    );

    let config: RecorderConfig = config::Config::builder()
        .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap();
    config.validate().unwrap();
    config
}

fn region_mask(config: &RecorderConfig) -> RegionMask {
    let regions = config.region_set();
    compute_mask(regions.get(0).unwrap(), WIDTH, HEIGHT).unwrap()
}

/// A frame that differs from the base frame on 12 % of the region's samples
/// by a total of at most 20000, plus 1000 of weather noise in the calibration
/// rectangle.
fn triggering_frame(mask: &RegionMask) -> Frame {
    let target = (mask.area() as f64 * 0.12).round() as u64;
    let delta = (20_000 / target) as u8;

    let mut frame = Frame::filled(WIDTH, HEIGHT, BASE);
    let mut changed = 0;
    'rows: for y in 0..HEIGHT {
        for x in 0..WIDTH {
            if !mask.contains(x, y) {
                continue;
            }
            let offset = frame.offset(x, y);
            for sample in &mut frame.data[offset..offset + 3] {
                if changed == target {
                    break 'rows;
                }
                *sample += delta;
                changed += 1;
            }
        }
    }

    for x in 30..50 {
        let offset = frame.offset(x, 20);
        frame.data[offset] += 50;
    }

    frame
}

fn send_frame(stage: &mut AnalysisStage, frame: Frame, timestamp: f64) -> AnalysisReport {
    let (ack, mut done) = oneshot::channel();
    stage
        .handle(StageMessage::Frame(SampledFrame {
            frame,
            timestamp,
            ack,
        }))
        .unwrap();
    done.try_recv().unwrap()
}

#[test]
fn short_event_is_cancelled_and_never_merged() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let mask = region_mask(&config);
    let muxer = RecordingMuxer::default();
    let mut stage = AnalysisStage::from_config(&config, Box::new(muxer.clone()));

    stage
        .handle(StageMessage::Metadata(StreamMeta {
            width: WIDTH,
            height: HEIGHT,
            fps: 2.0,
        }))
        .unwrap();
    stage
        .handle(StageMessage::SegmentPath(dir.path().join("cache/0.mts")))
        .unwrap();

    let first = send_frame(&mut stage, Frame::filled(WIDTH, HEIGHT, BASE), 0.0);
    assert!(first.analysis.is_none());

    let second = send_frame(&mut stage, triggering_frame(&mask), 0.5);
    let analysis = second.analysis.as_ref().unwrap();
    let activity = analysis.verdicts[0].activity;
    assert_eq!(analysis.weather_noise, 1000);
    assert!(activity.diff_sum >= 15_000 && activity.diff_sum <= 20_000);
    assert!((activity.changed_fraction() - 0.12).abs() < 0.001);
    assert!(analysis.any_active);
    assert_eq!(second.transition, Transition::Started { lead_in: false });

    let third = send_frame(&mut stage, triggering_frame(&mask), 1.0);
    assert!(!third.analysis.as_ref().unwrap().any_active);
    assert_eq!(third.transition, Transition::Cancelled);

    stage
        .handle(StageMessage::SegmentPath(dir.path().join("cache/1.mts")))
        .unwrap();
    stage.handle(StageMessage::EndOfStream).unwrap();

    assert!(muxer.merges.lock().is_empty());
    assert_eq!(stage.stats().read().recordings_cancelled, 1);
}

#[test]
fn weather_noise_above_every_ceiling_keeps_region_inactive() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let mask = region_mask(&config);
    let mut stage = AnalysisStage::from_config(&config, Box::new(RecordingMuxer::default()));

    stage
        .handle(StageMessage::Metadata(StreamMeta {
            width: WIDTH,
            height: HEIGHT,
            fps: 2.0,
        }))
        .unwrap();
    stage
        .handle(StageMessage::SegmentPath(dir.path().join("cache/0.mts")))
        .unwrap();
    send_frame(&mut stage, Frame::filled(WIDTH, HEIGHT, BASE), 0.0);

    // Snow across the whole calibration rectangle.
    let mut frame = triggering_frame(&mask);
    for y in 17..49 {
        for x in 25..76 {
            frame.put_pixel(x, y, [200, 200, 200]);
        }
    }

    let report = send_frame(&mut stage, frame, 0.5);
    assert!(report.analysis.as_ref().unwrap().weather_noise > 50_000);
    assert!(!report.analysis.unwrap().any_active);
    assert_eq!(report.transition, Transition::Unchanged);
}

#[tokio::test]
async fn long_event_merges_lead_in_and_event_segments() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let mask = region_mask(&config);
    let muxer = RecordingMuxer::default();

    // 2 fps, four frames per segment, every frame analysed. Motion from
    // frame 9 to frame 18 spans segments 2 to 4; segment 1 is the lead-in.
    let base = Frame::filled(WIDTH, HEIGHT, BASE);
    let moving = triggering_frame(&mask);
    let frames: VecDeque<Frame> = (0..24)
        .map(|i| {
            if (9..19).contains(&i) && i % 2 == 1 {
                moving.clone()
            } else {
                base.clone()
            }
        })
        .collect();

    let mut script = Some(frames);
    let running = Arc::new(AtomicBool::new(true));
    Pipeline::new(config, running)
        .with_muxer(Box::new(muxer.clone()))
        .run_with(move || {
            Ok(Box::new(ScriptedSource {
                frames: script.take().unwrap_or_default(),
                fps: 2.0,
                meta: None,
            }) as Box<dyn FrameSource>)
        })
        .await
        .unwrap();

    let merges = muxer.merges.lock();
    assert_eq!(merges.len(), 1);
    let (segments, target) = &merges[0];
    assert_eq!(segments.len(), 4);
    assert!(target.starts_with(dir.path().join("archive")));
    assert_eq!(target.extension().and_then(|e| e.to_str()), Some("mp4"));
}
