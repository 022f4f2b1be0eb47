//! Configuration management for the recorder service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files, including the trigger regions of the
//! deployment.

use crate::region::{Condition, DayMode, Region, RegionSet};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recorder service.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Video source configuration
    pub source: SourceConfig,

    /// Motion analysis configuration
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Segment and recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Output directory configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Stage channel configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Interactive debug surface
    #[serde(default)]
    pub debug: DebugConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Trigger regions, evaluated in declaration order
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

/// Video source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Stream URL or path to a video file
    pub url: String,

    /// Force live (restart forever) or finite behaviour; derived from the URL when unset
    #[serde(default)]
    pub live: Option<bool>,

    /// Frame rate to use instead of the one advertised by the stream
    #[serde(default)]
    pub fps_override: Option<f64>,

    /// Frame rate used when the stream does not advertise one
    #[serde(default = "default_fallback_fps")]
    pub fallback_fps: f64,

    /// Time to wait for a decoded frame before counting a read failure
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Read failures tolerated before a capture attempt is abandoned
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Base delay before restarting a live capture in milliseconds
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    /// Maximum delay before restarting a live capture in milliseconds
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,
}

/// Motion analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Seconds of video between two analysed frames
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: f64,

    /// Per-sample differences below this value are treated as sensor noise
    #[serde(default = "default_noise_floor")]
    pub noise_floor: u8,

    /// Full-frame difference that forces an immediate day/night re-check
    #[serde(default = "default_spike_threshold")]
    pub spike_threshold: u64,

    /// Seconds of video between scheduled day/night re-checks
    #[serde(default = "default_night_check_interval_secs")]
    pub night_check_interval_secs: f64,

    /// Normalized corners of the weather/sky calibration rectangle
    #[serde(default = "default_weather_area")]
    pub weather_area: [[f64; 2]; 2],

    /// Channel-sum tolerances for night-vision detection
    #[serde(default)]
    pub night_tolerance: NightToleranceConfig,
}

/// Absolute channel-sum tolerances under which the scene counts as night vision.
#[derive(Debug, Clone, Deserialize)]
pub struct NightToleranceConfig {
    #[serde(default = "default_red_green")]
    pub red_green: u64,

    #[serde(default = "default_red_blue")]
    pub red_blue: u64,

    #[serde(default = "default_blue_green")]
    pub blue_green: u64,
}

/// Segment and recording configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Duration of one raw segment in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: f64,

    /// Recordings shorter than this are cancelled
    #[serde(default = "default_minimum_duration_secs")]
    pub minimum_duration_secs: f64,

    /// Retention queue length that triggers eviction
    #[serde(default = "default_retention_high")]
    pub retention_high: usize,

    /// Retention queue length eviction stops at
    #[serde(default = "default_retention_low")]
    pub retention_low: usize,

    /// Analyse and log only; no segments, merges, snapshots or deletions
    #[serde(default)]
    pub dry_run: bool,

    /// Path to the ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Constant rate factor for segment encoding
    #[serde(default = "default_crf")]
    pub crf: u8,
}

/// Output directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Date-partitioned cache of raw segments
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Date-partitioned archive of merged recordings
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Hourly snapshot archive
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
}

/// Stage channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the channel between capture and analysis
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Interval between statistics reports in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Interactive debug surface configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugConfig {
    /// Read playback controls (p, a, f) from stdin
    #[serde(default)]
    pub interactive: bool,

    /// Start with pause-on-trigger enabled
    #[serde(default)]
    pub pause_on_trigger: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// One trigger region as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name: String,

    /// Normalized polygon vertices
    pub points: Vec<[f64; 2]>,

    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub mode: DayMode,

    #[serde(default)]
    pub skip_start_buffer: bool,
}

/// One trigger condition as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub threshold: u64,
    pub area_fraction: f64,

    #[serde(default)]
    pub max_weather_noise: Option<u64>,

    #[serde(default)]
    pub max_sky_light: Option<u64>,
}

// Default value functions
fn default_fallback_fps() -> f64 {
    25.0
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_max_consecutive_failures() -> u32 {
    100
}
fn default_restart_base_delay_ms() -> u64 {
    1000
}
fn default_restart_max_delay_ms() -> u64 {
    60000
}
fn default_check_interval_secs() -> f64 {
    1.0
}
fn default_noise_floor() -> u8 {
    20
}
fn default_spike_threshold() -> u64 {
    50_000_000
}
fn default_night_check_interval_secs() -> f64 {
    300.0
}
fn default_weather_area() -> [[f64; 2]; 2] {
    [[0.25, 0.17], [0.75, 0.48]]
}
fn default_red_green() -> u64 {
    1_000_000
}
fn default_red_blue() -> u64 {
    500_000
}
fn default_blue_green() -> u64 {
    1_500_000
}
fn default_segment_duration_secs() -> f64 {
    10.0
}
fn default_minimum_duration_secs() -> f64 {
    3.0
}
fn default_retention_high() -> usize {
    180
}
fn default_retention_low() -> usize {
    60
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_crf() -> u8 {
    22
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("snippets")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("videos")
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_queue_size() -> usize {
    64
}
fn default_stats_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            noise_floor: default_noise_floor(),
            spike_threshold: default_spike_threshold(),
            night_check_interval_secs: default_night_check_interval_secs(),
            weather_area: default_weather_area(),
            night_tolerance: NightToleranceConfig::default(),
        }
    }
}

impl Default for NightToleranceConfig {
    fn default() -> Self {
        Self {
            red_green: default_red_green(),
            red_blue: default_red_blue(),
            blue_green: default_blue_green(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: default_segment_duration_secs(),
            minimum_duration_secs: default_minimum_duration_secs(),
            retention_high: default_retention_high(),
            retention_low: default_retention_low(),
            dry_run: false,
            ffmpeg_path: default_ffmpeg_path(),
            crf: default_crf(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            archive_dir: default_archive_dir(),
            image_dir: default_image_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with RECORDER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. RECORDER_SOURCE__URL, RECORDER_STORAGE__ARCHIVE_DIR
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.url.is_empty() {
            return Err(ConfigValidationError::MissingField("source.url".to_string()));
        }

        if matches!(self.source.fps_override, Some(fps) if fps <= 0.0)
            || self.source.fallback_fps <= 0.0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.fps_override/fallback_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if self.analysis.check_interval_secs <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "analysis.check_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        let [[x0, y0], [x1, y1]] = self.analysis.weather_area;
        if !(0.0..=1.0).contains(&x0)
            || !(0.0..=1.0).contains(&y0)
            || !(0.0..=1.0).contains(&x1)
            || !(0.0..=1.0).contains(&y1)
            || x0 >= x1
            || y0 >= y1
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "analysis.weather_area".to_string(),
                message: "Corners must be normalized and ordered top-left, bottom-right"
                    .to_string(),
            });
        }

        if self.recording.segment_duration_secs <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.segment_duration_secs".to_string(),
                message: "Duration must be greater than 0".to_string(),
            });
        }

        if self.recording.retention_low > self.recording.retention_high {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.retention_low".to_string(),
                message: "Low watermark must not exceed the high watermark".to_string(),
            });
        }

        if self.pipeline.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.queue_size".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.regions.is_empty() {
            return Err(ConfigValidationError::MissingField("regions".to_string()));
        }

        self.region_set().validate().map_err(|e| ConfigValidationError::InvalidValue {
            field: "regions".to_string(),
            message: e.to_string(),
        })?;

        Ok(())
    }

    /// Build the trigger regions in declaration order.
    pub fn region_set(&self) -> RegionSet {
        RegionSet::new(self.regions.iter().map(RegionConfig::to_region).collect())
    }
}

impl RegionConfig {
    fn to_region(&self) -> Region {
        Region {
            name: self.name.clone(),
            points: self.points.iter().map(|[x, y]| (*x, *y)).collect(),
            conditions: self
                .conditions
                .iter()
                .map(|c| Condition {
                    threshold: c.threshold,
                    area_fraction: c.area_fraction,
                    max_weather_noise: c.max_weather_noise,
                    max_sky_light: c.max_sky_light,
                })
                .collect(),
            mode: self.mode,
            skip_start_buffer: self.skip_start_buffer,
        }
    }
}

impl SourceConfig {
    /// Whether the source is a continuously retried live stream.
    pub fn is_live(&self) -> bool {
        self.live.unwrap_or_else(|| {
            ["rtsp://", "rtsps://", "http://", "https://"]
                .iter()
                .any(|scheme| self.url.starts_with(scheme))
        })
    }

    /// Get read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get base restart delay as Duration.
    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    /// Get maximum restart delay as Duration.
    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms)
    }
}

impl PipelineConfig {
    /// Get statistics interval as Duration.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RecorderConfig {
        RecorderConfig {
            source: SourceConfig {
                url: "rtsp://camera:554/stream".to_string(),
                live: None,
                fps_override: None,
                fallback_fps: 25.0,
                read_timeout_ms: 1000,
                max_consecutive_failures: 100,
                restart_base_delay_ms: 100,
                restart_max_delay_ms: 1000,
            },
            analysis: AnalysisConfig::default(),
            recording: RecordingConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            debug: DebugConfig::default(),
            logging: LoggingConfig::default(),
            regions: vec![RegionConfig {
                name: "track-1".to_string(),
                points: vec![[0.50, 0.60], [0.50, 0.62], [0.67, 0.82], [0.67, 0.78]],
                conditions: vec![ConditionConfig {
                    threshold: 15_000,
                    area_fraction: 0.10,
                    max_weather_noise: Some(50_000),
                    max_sky_light: Some(20_000_000),
                }],
                mode: DayMode::Both,
                skip_start_buffer: false,
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_source_url() {
        let mut config = create_test_config();
        config.source.url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_missing_regions() {
        let mut config = create_test_config();
        config.regions.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_degenerate_region_rejected() {
        let mut config = create_test_config();
        config.regions[0].points = vec![[0.1, 0.1], [0.2, 0.2], [0.3, 0.3]];
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut config = create_test_config();
        config.recording.retention_low = 200;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_weather_area() {
        let mut config = create_test_config();
        config.analysis.weather_area = [[0.75, 0.17], [0.25, 0.48]];
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_live_detection() {
        let mut config = create_test_config();
        assert!(config.source.is_live());

        config.source.url = "recordings/2025-11-20_05-55-30.mp4".to_string();
        assert!(!config.source.is_live());

        config.source.live = Some(true);
        assert!(config.source.is_live());
    }

    #[test]
    fn test_duration_accessors() {
        let config = create_test_config();
        assert_eq!(config.source.read_timeout(), Duration::from_millis(1000));
        assert_eq!(config.source.restart_base_delay(), Duration::from_millis(100));
        assert_eq!(config.source.restart_max_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_region_set_preserves_order() {
        let mut config = create_test_config();
        let mut second = config.regions[0].clone();
        second.name = "track-2".to_string();
        second.skip_start_buffer = true;
        config.regions.push(second);

        let regions = config.region_set();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.get(0).map(|r| r.name.as_str()), Some("track-1"));
        assert!(regions.get(1).map(|r| r.skip_start_buffer).unwrap_or(false));
    }

    #[test]
    fn test_shipped_default_config_is_valid() {
        let config: RecorderConfig = Config::builder()
            .add_source(File::with_name("config/default"))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.regions.len(), 8);
        assert_eq!(config.regions[0].conditions.len(), 5);
        assert_eq!(config.regions[0].conditions[0].max_weather_noise, Some(50_000));
        assert!(config.regions[1].skip_start_buffer);
        assert!(config.source.is_live());
    }
}
