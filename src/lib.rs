pub mod capture;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod recording;
pub mod sink;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::AcquisitionParams;
use serde::{Deserialize, Serialize};
use sink::EncoderOptions;

pub use control::Controller;
pub use error::{EncoderFailure, Error, Result};

/// Configuration file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "argus.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: CamerasConfig,
    pub pipeline: PipelineConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CamerasConfig {
    /// Number of cameras opened at startup
    pub count: usize,
    pub width: u32,
    pub height: u32,
    /// Parameters applied when the cameras are opened
    pub acquisition: AcquisitionParams,
    pub buffer_count: u32, // mmap buffers per V4L2 device
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum dispatcher tick; 0 spins
    pub tick_interval_ms: u64,
    pub retrieve_timeout_ms: u64,
    /// Consecutive failures before a camera is polled with the short timeout
    pub degraded_after: u32,
    pub degraded_timeout_ms: u64,
}

impl PipelineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }

    pub fn degraded_timeout(&self) -> Duration {
        Duration::from_millis(self.degraded_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Initial output directory; changeable at runtime
    pub output_dir: PathBuf,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Executable name or path, resolved on PATH at startup
    pub program: String,
    /// Arguments passed ahead of the generated command line
    pub prefix_args: Vec<String>,
    /// Refuse to start when the encoder cannot be found
    pub required: bool,
    /// Playback rate written into videos; the camera's resulting rate if unset
    pub playback_fps: Option<f64>,
    pub options: EncoderOptions,
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            count: 2,
            width: 640,
            height: 480,
            acquisition: AcquisitionParams::default(),
            buffer_count: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1,
            retrieve_timeout_ms: 5000,
            degraded_after: 3,
            degraded_timeout_ms: 50,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            encoder: EncoderConfig::default(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            prefix_args: Vec::new(),
            required: false,
            playback_fps: None,
            options: EncoderOptions::default(),
        }
    }
}

impl Config {
    /// Loads `path` (or `argus.toml` when present) and applies `ARGUS__*`
    /// environment overrides, e.g. `ARGUS__CAMERAS__COUNT=4`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.count == 0 {
            return Err(Error::invalid("cameras.count", "at least one camera is required"));
        }
        if self.cameras.width == 0 || self.cameras.height == 0 {
            return Err(Error::invalid(
                "cameras.width/height",
                format!("{}x{} is empty", self.cameras.width, self.cameras.height),
            ));
        }
        if self.pipeline.retrieve_timeout_ms == 0 || self.pipeline.degraded_timeout_ms == 0 {
            return Err(Error::invalid("pipeline", "retrieve timeouts must be positive"));
        }
        if let Some(fps) = self.recording.encoder.playback_fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(Error::invalid(
                    "recording.encoder.playback_fps",
                    format!("{fps} is not a frame rate"),
                ));
            }
        }
        if self.recording.encoder.program.trim().is_empty() {
            return Err(Error::invalid("recording.encoder.program", "must not be empty"));
        }
        self.recording.encoder.options.validate()
    }
}
