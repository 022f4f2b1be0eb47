//! Motion analysis of sampled frames.
//!
//! Every analysed frame is differenced against the previously analysed one.
//! The thresholded difference feeds the weather-noise aggregate, the day/night
//! classifier and the per-region trigger evaluation.

use crate::config::AnalysisConfig;
use crate::frame::{DiffImage, Frame, StreamMeta, CHANNELS};
use crate::region::{MaskTable, RegionActivity, RegionError, RegionSet};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Errors that can occur while analysing a frame.
#[derive(Debug, Error)]
pub enum MotionError {
    #[error("Frame size {actual:?} does not match stream resolution {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Channel-sum tolerances for night-vision detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightTolerance {
    pub red_green: u64,
    pub red_blue: u64,
    pub blue_green: u64,
}

impl NightTolerance {
    /// Infrared night vision renders an almost grey image, so all pairwise
    /// channel sums stay close together.
    pub fn is_night(&self, sums: ChannelSums) -> bool {
        sums.red.abs_diff(sums.green) < self.red_green
            && sums.red.abs_diff(sums.blue) < self.red_blue
            && sums.blue.abs_diff(sums.green) < self.blue_green
    }
}

/// Per-channel sums over a whole frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSums {
    pub red: u64,
    pub green: u64,
    pub blue: u64,
}

impl ChannelSums {
    pub fn of(frame: &Frame) -> Self {
        frame
            .data
            .chunks_exact(CHANNELS)
            .fold(Self::default(), |mut sums, px| {
                sums.red += px[0] as u64;
                sums.green += px[1] as u64;
                sums.blue += px[2] as u64;
                sums
            })
    }
}

/// Motion engine settings.
#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub noise_floor: u8,
    pub spike_threshold: u64,
    pub night_check_interval: f64,
    pub weather_area: [[f64; 2]; 2],
    pub night_tolerance: NightTolerance,
}

impl From<&AnalysisConfig> for MotionSettings {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            noise_floor: config.noise_floor,
            spike_threshold: config.spike_threshold,
            night_check_interval: config.night_check_interval_secs,
            weather_area: config.weather_area,
            night_tolerance: NightTolerance {
                red_green: config.night_tolerance.red_green,
                red_blue: config.night_tolerance.red_blue,
                blue_green: config.night_tolerance.blue_green,
            },
        }
    }
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

/// Day/night classification with hysteresis.
///
/// The classification is only refreshed on a fixed cadence or when the frame
/// difference spikes (lights switching, IR filter flipping); in between the
/// previous result is kept.
#[derive(Debug, Clone)]
pub struct DayNightClassifier {
    interval: f64,
    spike_threshold: u64,
    tolerance: NightTolerance,
    last_check: Option<f64>,
    is_night: bool,
}

impl DayNightClassifier {
    pub fn new(interval: f64, spike_threshold: u64, tolerance: NightTolerance) -> Self {
        Self {
            interval,
            spike_threshold,
            tolerance,
            last_check: None,
            is_night: false,
        }
    }

    pub fn is_night(&self) -> bool {
        self.is_night
    }

    /// Observe an analysed frame and return the current classification.
    pub fn observe(&mut self, frame: &Frame, diff_sum: u64, now: f64) -> bool {
        let scheduled = self
            .last_check
            .map_or(true, |last| now - last >= self.interval);
        let spike = diff_sum >= self.spike_threshold;

        if scheduled || spike {
            let sums = ChannelSums::of(frame);
            let is_night = self.tolerance.is_night(sums);
            if is_night != self.is_night {
                info!(
                    is_night,
                    spike,
                    red = sums.red,
                    green = sums.green,
                    blue = sums.blue,
                    "Light mode changed"
                );
            }
            self.is_night = is_night;
            self.last_check = Some(now);
        }

        self.is_night
    }

    /// Forget the schedule so the next frame is classified immediately.
    pub fn reset(&mut self) {
        self.last_check = None;
        self.is_night = false;
    }
}

/// Inclusive pixel rectangle used for the weather and sky aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl CalibrationRect {
    pub fn from_normalized(area: [[f64; 2]; 2], width: u32, height: u32) -> Self {
        let px = |v: f64, max: u32| ((v * max as f64) as u32).min(max.saturating_sub(1));
        Self {
            x0: px(area[0][0], width),
            y0: px(area[0][1], height),
            x1: px(area[1][0], width),
            y1: px(area[1][1], height),
        }
    }

    /// Sum of `samples` (a packed RGB buffer of the given width) inside the rectangle.
    fn sum(&self, samples: &[u8], width: u32) -> u64 {
        (self.y0..=self.y1)
            .map(|y| {
                let start = (y as usize * width as usize + self.x0 as usize) * CHANNELS;
                let end = (y as usize * width as usize + self.x1 as usize + 1) * CHANNELS;
                samples[start..end].iter().map(|&v| v as u64).sum::<u64>()
            })
            .sum()
    }
}

/// Outcome of one region for one analysed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionVerdict {
    pub index: usize,

    /// Whether the region takes part under the current light mode
    pub applicable: bool,

    pub active: bool,
    pub activity: RegionActivity,
}

/// Result of analysing one sampled frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    /// Sum of the thresholded full-frame difference
    pub diff_sum: u64,
    pub weather_noise: u64,
    pub sky_light: u64,
    pub is_night: bool,
    pub verdicts: Vec<RegionVerdict>,

    /// OR over all applicable regions
    pub any_active: bool,

    /// Some triggered region asks to omit the lead-in segment
    pub skip_lead_in: bool,
}

/// Frame differencing and trigger evaluation for one stream.
pub struct MotionEngine {
    settings: MotionSettings,
    regions: RegionSet,
    meta: Option<StreamMeta>,
    masks: Option<MaskTable>,
    calibration: Option<CalibrationRect>,
    previous: Option<Frame>,
    day_night: DayNightClassifier,
}

impl MotionEngine {
    pub fn new(settings: MotionSettings, regions: RegionSet) -> Self {
        let day_night = DayNightClassifier::new(
            settings.night_check_interval,
            settings.spike_threshold,
            settings.night_tolerance,
        );

        Self {
            settings,
            regions,
            meta: None,
            masks: None,
            calibration: None,
            previous: None,
            day_night,
        }
    }

    pub fn meta(&self) -> Option<&StreamMeta> {
        self.meta.as_ref()
    }

    pub fn masks(&self) -> Option<&MaskTable> {
        self.masks.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.masks.is_some()
    }

    /// Apply stream metadata from a (re)started capture.
    ///
    /// Masks are only rebuilt when the resolution changes. The previous frame
    /// and the day/night schedule always start over.
    pub fn configure(&mut self, meta: &StreamMeta) -> Result<(), RegionError> {
        let (width, height) = meta.resolution();
        let rebuild = self
            .masks
            .as_ref()
            .map_or(true, |masks| masks.resolution() != (width, height));

        if rebuild {
            let masks = MaskTable::build(&self.regions, width, height)?;
            info!(
                width,
                height,
                regions = masks.len(),
                "Region masks built"
            );
            self.masks = Some(masks);
            self.calibration = Some(CalibrationRect::from_normalized(
                self.settings.weather_area,
                width,
                height,
            ));
        }

        self.meta = Some(*meta);
        self.previous = None;
        self.day_night.reset();
        Ok(())
    }

    /// Analyse a sampled frame taken at stream time `now` (seconds).
    ///
    /// Returns `Ok(None)` while no metadata has arrived yet and for the first
    /// frame after configuration, which only primes the previous-frame slot.
    pub fn analyse(&mut self, frame: Frame, now: f64) -> Result<Option<FrameAnalysis>, MotionError> {
        let (masks, calibration) = match (&self.masks, &self.calibration) {
            (Some(masks), Some(calibration)) => (masks, *calibration),
            _ => {
                debug!("Frame received before stream metadata, skipping");
                return Ok(None);
            }
        };

        if frame.dimensions() != masks.resolution() {
            return Err(MotionError::FrameSize {
                expected: masks.resolution(),
                actual: frame.dimensions(),
            });
        }

        let previous = match self.previous.replace(frame) {
            Some(previous) => previous,
            None => return Ok(None),
        };
        let current = match &self.previous {
            Some(current) => current,
            None => return Ok(None),
        };

        let diff = DiffImage::compute(&previous, current, self.settings.noise_floor);
        let diff_sum = diff.total();
        let weather_noise = calibration.sum(&diff.data, diff.width);
        let sky_light = calibration.sum(&current.data, current.width);
        let is_night = self.day_night.observe(current, diff_sum, now);

        debug!(diff_sum, weather_noise, sky_light, is_night, "Frame differenced");

        let mut verdicts = Vec::with_capacity(self.regions.len());
        let mut any_active = false;
        let mut skip_lead_in = false;

        for (index, region) in self.regions.iter().enumerate() {
            let applicable = region.applies(is_night);
            let (active, activity) = match masks.mask(index) {
                Some(mask) if applicable => {
                    let activity = mask.measure(&diff);
                    (region.evaluate(&activity, weather_noise, sky_light), activity)
                }
                _ => (false, RegionActivity::default()),
            };

            trace!(
                region = %region.name,
                applicable,
                active,
                diff_sum = activity.diff_sum,
                changed = activity.changed,
                area = activity.area,
                "Region evaluated"
            );

            if active {
                any_active = true;
                skip_lead_in |= region.skip_start_buffer;
            }

            verdicts.push(RegionVerdict {
                index,
                applicable,
                active,
                activity,
            });
        }

        Ok(Some(FrameAnalysis {
            diff_sum,
            weather_noise,
            sky_light,
            is_night,
            verdicts,
            any_active,
            skip_lead_in,
        }))
    }
}
