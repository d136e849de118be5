pub mod capture;
pub mod display;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod record;
pub mod utils;
pub mod viewer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::{FrameFormat, PixelFormat};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub use error::{CaptureError, ConfigError, DisplayError, RecordError};
pub use viewer::Viewer;

/// Environment variables override file values, e.g. `BINOCLE__DISPLAY__SURFACES=1`.
pub const ENV_PREFIX: &str = "BINOCLE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
    pub record: RecordConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    V4l2,
    Pattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub left_device: usize,
    pub right_device: usize,
    pub width: u32,
    pub height: u32,
    /// Format requested from the device; slots always hold RGB24.
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub acquire_interval_ms: u64,
    pub retry_interval_ms: u64,
}

impl CaptureConfig {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::rgb(self.width, self.height)
    }

    pub fn acquire_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::V4l2,
            left_device: 0,
            right_device: 1,
            width: 1920,
            height: 1080,
            format: PixelFormat::Rgb24,
            buffer_count: 4,
            acquire_interval_ms: 17,
            retry_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Wgpu,
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// One persistent worker per surface, synchronized by the render barrier.
    Parallel,
    /// Same surfaces rendered one after another on the control thread.
    Serial,
    /// Only the first surface, driven directly by the scheduler.
    Single,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: BackendKind,
    pub mode: RenderMode,
    pub surfaces: usize,
    pub width: u32,
    pub height: u32,
    pub title: String,
    /// Markers allowed per surface before the scheduler waits for the GPU.
    pub in_flight_depth: usize,
    /// Used when the display cannot report its refresh rate.
    pub refresh_hz: u32,
    pub pin_workers: bool,
    /// Headless backend only: time until a submitted frame's fence signals.
    pub simulated_gpu_us: u64,
}

impl DisplayConfig {
    pub fn fallback_refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }

    pub fn simulated_gpu_time(&self) -> Duration {
        Duration::from_micros(self.simulated_gpu_us)
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Wgpu,
            mode: RenderMode::Parallel,
            surfaces: 2,
            width: 1920,
            height: 540,
            title: "binocle".into(),
            in_flight_depth: 1,
            refresh_hz: 60,
            pin_workers: false,
            simulated_gpu_us: 2000,
        }
    }
}

/// Presentation scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Submit once the next vblank is at most this far away.
    pub lookahead_us: u64,
    pub safety_margin_us: u64,
    /// Sleep between polls when no stream has a new frame.
    pub poll_interval_us: u64,
    /// Sleep between completion polls while every in-flight slot is busy.
    pub gpu_wait_us: u64,
    /// Latency samples kept for the rolling statistics.
    pub latency_window: usize,
    pub shutdown_timeout_ms: u64,
}

impl PipelineConfig {
    /// Time-to-vblank above which the scheduler keeps dropping instead of submitting.
    pub fn submit_window(&self) -> Duration {
        Duration::from_micros(self.lookahead_us + self.safety_margin_us)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn gpu_wait_interval(&self) -> Duration {
        Duration::from_micros(self.gpu_wait_us)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookahead_us: 4000,
            safety_margin_us: 1000,
            poll_interval_us: 1000,
            gpu_wait_us: 200,
            latency_window: 256,
            shutdown_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub fps: u32,
    pub segment_secs: u64,
    pub jpeg_quality: u8,
}

impl RecordConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_secs)
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("."),
            fps: 30,
            segment_secs: 60,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Per-frame timing records from capture threads and the scheduler.
    pub frame_timing: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "binocle=info".into(),
            frame_timing: false,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `BINOCLE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture resolution must be non-zero");
        }
        if self.capture.acquire_interval_ms == 0 {
            return invalid("capture.acquire_interval_ms must be at least 1");
        }
        if self.display.surfaces == 0 {
            return invalid("display.surfaces must be at least 1");
        }
        if self.display.in_flight_depth == 0 {
            return invalid("display.in_flight_depth must be at least 1");
        }
        if self.display.width == 0 || self.display.height == 0 {
            return invalid("display size must be non-zero");
        }
        if self.pipeline.lookahead_us == 0 || self.pipeline.poll_interval_us == 0 {
            return invalid("pipeline look-ahead and poll interval must be non-zero");
        }
        if self.pipeline.latency_window == 0 {
            return invalid("pipeline.latency_window must be at least 1");
        }
        if self.record.enabled && self.record.fps == 0 {
            return invalid("record.fps must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[display]\nsurfaces = 3\nbackend = \"headless\"\n\n[pipeline]\nlookahead_us = 2500"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.display.surfaces, 3);
        assert_eq!(config.display.backend, BackendKind::Headless);
        assert_eq!(config.pipeline.lookahead_us, 2500);
        assert_eq!(config.capture.acquire_interval_ms, 17);
    }

    #[test]
    fn zero_in_flight_depth_is_rejected() {
        let mut config = Config::default();
        config.display.in_flight_depth = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn submit_window_adds_margin() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.submit_window(), Duration::from_millis(5));
    }
}
