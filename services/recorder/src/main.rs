//! Railwatch Recorder Service
//!
//! This service watches a fixed station camera, detects motion inside the
//! configured regions and archives one merged recording per event.
//!
//! # Architecture
//!
//! ```text
//! Camera -> CaptureStage -> raw segments (ffmpeg)
//!                |
//!                +-> AnalysisStage -> RecordingController -> merged recordings (ffmpeg concat)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with RECORDER_)
//!
//! See `config.rs` for detailed configuration options.

use railwatch_recorder::{LoggingConfig, Pipeline, RecorderConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state and shared resources.
struct AppState {
    config: RecorderConfig,
    running: Arc<AtomicBool>,
}

impl AppState {
    fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "railwatch-recorder",
        version = env!("CARGO_PKG_VERSION"),
        url = %config.source.url,
        "Starting recorder service"
    );

    // Validate configuration
    config.validate()?;

    let state = Arc::new(AppState::new(config));
    state.running.store(true, Ordering::SeqCst);

    match run(state).await {
        Ok(()) => {
            info!("Recorder service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Recorder service failed");
            Err(e)
        }
    }
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> anyhow::Result<RecorderConfig> {
    let config = RecorderConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        RecorderConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("railwatch_recorder={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Run the pipeline until the source ends or a shutdown signal arrives.
async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(state.config.clone(), state.running.clone());

    let signal_handle = tokio::spawn({
        let state = state.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    state.shutdown();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    });

    let result = pipeline.run().await;
    signal_handle.abort();

    if state.is_running() {
        state.shutdown();
    }

    info!("Shutdown complete");
    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RecorderConfig {
        let config = config::Config::builder()
            .set_override("source.url", "rtsp://camera:554/stream")
            .unwrap()
            .build()
            .unwrap();
        config.try_deserialize().unwrap()
    }

    #[test]
    fn test_app_state_creation() {
        let state = AppState::new(create_test_config());
        assert!(!state.is_running());
        assert_eq!(state.config.source.url, "rtsp://camera:554/stream");
    }

    #[test]
    fn test_app_state_shutdown() {
        let state = AppState::new(create_test_config());
        state.running.store(true, Ordering::SeqCst);
        assert!(state.is_running());

        state.shutdown();
        assert!(!state.is_running());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = create_test_config();
        assert_eq!(config.recording.segment_duration_secs, 10.0);
        assert_eq!(config.recording.retention_high, 180);
        assert_eq!(config.recording.retention_low, 60);
        assert_eq!(config.analysis.noise_floor, 20);
        assert!(config.regions.is_empty());
    }
}
