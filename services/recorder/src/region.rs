//! Trigger regions and their rasterized masks.
//!
//! A region is a normalized polygon with an ordered list of trigger
//! conditions. Masks are rasterized once per resolution into a [`MaskTable`];
//! region `i` of a [`RegionSet`] owns entry `i` of the table.

use crate::frame::{DiffImage, CHANNELS};
use serde::Deserialize;
use thiserror::Error;

/// Errors in region geometry or conditions.
#[derive(Debug, Error, PartialEq)]
pub enum RegionError {
    #[error("Region '{0}' needs at least 3 vertices")]
    TooFewVertices(String),

    #[error("Region '{0}' has a vertex outside the normalized range 0..=1")]
    VertexOutOfRange(String),

    #[error("Region '{0}' encloses no area")]
    ZeroArea(String),

    #[error("Region '{0}' has no trigger conditions")]
    NoConditions(String),

    #[error("Region '{0}' has an area fraction outside 0..=1")]
    InvalidFraction(String),

    #[error("Region '{region}' rasterizes to an empty mask at {width}x{height}")]
    DegenerateMask {
        region: String,
        width: u32,
        height: u32,
    },
}

/// Time of day a region is evaluated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayMode {
    #[default]
    Both,
    Day,
    Night,
}

/// One threshold rule of a region, gated by optional environmental ceilings.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Minimum sum of the masked difference
    pub threshold: u64,

    /// Minimum fraction of mask samples that must differ
    pub area_fraction: f64,

    /// Condition is skipped when the weather noise exceeds this
    pub max_weather_noise: Option<u64>,

    /// Condition is skipped when the sky light exceeds this
    pub max_sky_light: Option<u64>,
}

impl Condition {
    pub fn new(threshold: u64, area_fraction: f64) -> Self {
        Self {
            threshold,
            area_fraction,
            max_weather_noise: None,
            max_sky_light: None,
        }
    }

    pub fn with_max_weather_noise(mut self, ceiling: u64) -> Self {
        self.max_weather_noise = Some(ceiling);
        self
    }

    pub fn with_max_sky_light(mut self, ceiling: u64) -> Self {
        self.max_sky_light = Some(ceiling);
        self
    }

    /// Whether the environmental ceilings admit this condition.
    pub fn admits(&self, weather_noise: u64, sky_light: u64) -> bool {
        self.max_weather_noise.map_or(true, |max| weather_noise <= max)
            && self.max_sky_light.map_or(true, |max| sky_light <= max)
    }

    fn is_met(&self, activity: &RegionActivity) -> bool {
        activity.diff_sum >= self.threshold && activity.changed_fraction() >= self.area_fraction
    }
}

/// A polygonal trigger area of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub name: String,

    /// Normalized (0..=1) polygon vertices
    pub points: Vec<(f64, f64)>,

    /// Conditions in declaration order
    pub conditions: Vec<Condition>,

    pub mode: DayMode,

    /// Do not prepend the previous segment when this region starts a recording
    pub skip_start_buffer: bool,
}

impl Region {
    /// Whether the region takes part in detection for the current light mode.
    pub fn applies(&self, is_night: bool) -> bool {
        match self.mode {
            DayMode::Both => true,
            DayMode::Day => !is_night,
            DayMode::Night => is_night,
        }
    }

    /// Evaluate the region against one frame's masked activity.
    ///
    /// The first condition whose ceilings admit the current weather noise and
    /// sky light decides; when every condition is skipped the region is inactive.
    pub fn evaluate(&self, activity: &RegionActivity, weather_noise: u64, sky_light: u64) -> bool {
        self.governing_condition(weather_noise, sky_light)
            .map_or(false, |condition| condition.is_met(activity))
    }

    /// The condition that governs evaluation under the given environment.
    pub fn governing_condition(&self, weather_noise: u64, sky_light: u64) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.admits(weather_noise, sky_light))
    }

    /// Check geometry and conditions independently of any resolution.
    pub fn validate(&self) -> Result<(), RegionError> {
        if self.points.len() < 3 {
            return Err(RegionError::TooFewVertices(self.name.clone()));
        }
        if self
            .points
            .iter()
            .any(|&(x, y)| !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y))
        {
            return Err(RegionError::VertexOutOfRange(self.name.clone()));
        }
        if shoelace_area(&self.points) <= f64::EPSILON {
            return Err(RegionError::ZeroArea(self.name.clone()));
        }
        if self.conditions.is_empty() {
            return Err(RegionError::NoConditions(self.name.clone()));
        }
        if self
            .conditions
            .iter()
            .any(|c| !(0.0..=1.0).contains(&c.area_fraction))
        {
            return Err(RegionError::InvalidFraction(self.name.clone()));
        }
        Ok(())
    }
}

/// The configured regions, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn validate(&self) -> Result<(), RegionError> {
        self.regions.iter().try_for_each(Region::validate)
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Masked measurements of one region for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionActivity {
    /// Sum of the thresholded difference inside the mask
    pub diff_sum: u64,

    /// Number of non-zero difference samples inside the mask
    pub changed: u64,

    /// Number of samples covered by the mask
    pub area: u64,
}

impl RegionActivity {
    pub fn changed_fraction(&self) -> f64 {
        if self.area == 0 {
            0.0
        } else {
            self.changed as f64 / self.area as f64
        }
    }
}

/// Rasterized mask of one region at a fixed resolution.
#[derive(Debug, Clone)]
pub struct RegionMask {
    /// Polygon in pixel coordinates
    pub polygon: Vec<(u32, u32)>,

    /// Inclusive bounding box: x0, y0, x1, y1
    bbox: (u32, u32, u32, u32),

    /// Row-major bits of the bounding box
    bits: Vec<bool>,

    pixel_count: u64,
}

impl RegionMask {
    /// Number of colour samples covered by the mask.
    pub fn area(&self) -> u64 {
        self.pixel_count * CHANNELS as u64
    }

    pub fn pixel_count(&self) -> u64 {
        self.pixel_count
    }

    /// Whether pixel (x, y) belongs to the mask.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x0, y0, x1, y1) = self.bbox;
        if x < x0 || x > x1 || y < y0 || y > y1 {
            return false;
        }
        let row = (x1 - x0 + 1) as usize;
        self.bits[(y - y0) as usize * row + (x - x0) as usize]
    }

    /// Sum and count the difference samples inside the mask.
    pub fn measure(&self, diff: &DiffImage) -> RegionActivity {
        let (x0, y0, x1, y1) = self.bbox;
        let row = (x1 - x0 + 1) as usize;
        let mut activity = RegionActivity {
            area: self.area(),
            ..Default::default()
        };

        for y in y0..=y1 {
            let bits = &self.bits[(y - y0) as usize * row..(y - y0 + 1) as usize * row];
            for (dx, &set) in bits.iter().enumerate() {
                if !set {
                    continue;
                }
                let offset = diff.offset(x0 + dx as u32, y);
                for &sample in &diff.data[offset..offset + CHANNELS] {
                    activity.diff_sum += sample as u64;
                    activity.changed += (sample > 0) as u64;
                }
            }
        }

        activity
    }
}

/// Rasterize a region's polygon into a binary mask.
///
/// Vertices are scaled to pixels by truncation and clamped into the frame.
/// Pixels whose centre lies inside the polygon are set, as are all pixels on
/// its edges, so thin strips keep their outline at low resolutions.
pub fn compute_mask(region: &Region, width: u32, height: u32) -> Result<RegionMask, RegionError> {
    let degenerate = || RegionError::DegenerateMask {
        region: region.name.clone(),
        width,
        height,
    };
    if width == 0 || height == 0 || region.points.len() < 3 {
        return Err(degenerate());
    }

    let polygon: Vec<(u32, u32)> = region
        .points
        .iter()
        .map(|&(x, y)| {
            (
                ((x * width as f64) as u32).min(width - 1),
                ((y * height as f64) as u32).min(height - 1),
            )
        })
        .collect();

    let x0 = polygon.iter().map(|p| p.0).min().unwrap_or(0);
    let x1 = polygon.iter().map(|p| p.0).max().unwrap_or(0);
    let y0 = polygon.iter().map(|p| p.1).min().unwrap_or(0);
    let y1 = polygon.iter().map(|p| p.1).max().unwrap_or(0);
    let row = (x1 - x0 + 1) as usize;
    let mut bits = vec![false; row * (y1 - y0 + 1) as usize];

    let mut set = |x: u32, y: u32| {
        bits[(y - y0) as usize * row + (x - x0) as usize] = true;
    };

    // Interior: even-odd scanline fill sampled at pixel centres.
    let mut crossings = Vec::with_capacity(polygon.len());
    for y in y0..=y1 {
        let yc = y as f64 + 0.5;
        crossings.clear();
        for (i, &(ax, ay)) in polygon.iter().enumerate() {
            let (bx, by) = polygon[(i + 1) % polygon.len()];
            let (ax, ay, bx, by) = (ax as f64, ay as f64, bx as f64, by as f64);
            if (ay <= yc && yc < by) || (by <= yc && yc < ay) {
                crossings.push(ax + (yc - ay) * (bx - ax) / (by - ay));
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        for span in crossings.chunks_exact(2) {
            let start = (span[0] - 0.5).ceil().max(x0 as f64) as u32;
            let end = (span[1] - 0.5).ceil().min(x1 as f64 + 1.0) as u32;
            for x in start..end {
                set(x, y);
            }
        }
    }

    // Outline
    for (i, &a) in polygon.iter().enumerate() {
        let b = polygon[(i + 1) % polygon.len()];
        for (x, y) in line_pixels(a, b) {
            set(x, y);
        }
    }

    let pixel_count = bits.iter().filter(|&&b| b).count() as u64;
    if pixel_count == 0 {
        return Err(degenerate());
    }

    Ok(RegionMask {
        polygon,
        bbox: (x0, y0, x1, y1),
        bits,
        pixel_count,
    })
}

/// Pixels of the segment a-b, endpoints included.
fn line_pixels(a: (u32, u32), b: (u32, u32)) -> impl Iterator<Item = (u32, u32)> {
    let (ax, ay) = (a.0 as f64, a.1 as f64);
    let (dx, dy) = (b.0 as f64 - ax, b.1 as f64 - ay);
    let steps = dx.abs().max(dy.abs()) as u32;

    (0..=steps).map(move |i| {
        let t = if steps == 0 { 0.0 } else { i as f64 / steps as f64 };
        ((ax + dx * t).round() as u32, (ay + dy * t).round() as u32)
    })
}

fn shoelace_area(points: &[(f64, f64)]) -> f64 {
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(&(x0, y0), &(x1, y1))| x0 * y1 - x1 * y0)
        .sum();
    twice.abs() / 2.0
}

/// Masks of every region at one resolution.
#[derive(Debug, Clone)]
pub struct MaskTable {
    width: u32,
    height: u32,
    masks: Vec<RegionMask>,
}

impl MaskTable {
    /// Rasterize every region. Fails on the first region with an empty mask.
    pub fn build(regions: &RegionSet, width: u32, height: u32) -> Result<Self, RegionError> {
        let masks = regions
            .iter()
            .map(|region| compute_mask(region, width, height))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            width,
            height,
            masks,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Mask of the region at `index` in the set the table was built from.
    pub fn mask(&self, index: usize) -> Option<&RegionMask> {
        self.masks.get(index)
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}
