//! Frame sinks: where recorded frames end up.

pub mod encoder;
pub mod npy;
pub mod raw_archive;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capture::{Frame, Geometry};
use crate::{Error, Result};

pub use encoder::{EncodedVideoSink, EncoderOptions, EncoderProgram};
pub use raw_archive::RawArchiveSink;

/// Persists the frames of one recording session.
///
/// Writes for a sink are never concurrent; the owning worker calls
/// `write_frame` in sequence order and `close` once all of them are done.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and finalizes the output; idempotent. Further writes fail.
    fn close(&mut self) -> Result<()>;

    fn frames_written(&self) -> u64;

    /// File the session produces.
    fn target(&self) -> &Path;
}

/// How a camera's session is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMethod {
    /// One `.npy` array per frame, zipped into `.npz` on stop
    RawArchive,
    /// Frames piped to the external encoder
    EncodedVideo,
}

impl fmt::Display for RecordingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingMethod::RawArchive => f.write_str("raw archive"),
            RecordingMethod::EncodedVideo => f.write_str("encoded video"),
        }
    }
}

impl FromStr for RecordingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "raw_archive" | "npz" => Ok(RecordingMethod::RawArchive),
            "video" | "encoded_video" | "ffmpeg" => Ok(RecordingMethod::EncodedVideo),
            other => Err(Error::invalid(
                "recording method",
                format!("{other:?} (expected raw or video)"),
            )),
        }
    }
}

/// Everything needed to build the sink of one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub camera: usize,
    pub session: u64,
    pub method: RecordingMethod,
    /// Snapshot of the output directory taken at session start
    pub output_dir: PathBuf,
    /// File stem shared by every artifact of the session
    pub base_name: String,
    pub geometry: Geometry,
    /// Camera's resulting frame rate at session start
    pub frame_rate: f64,
}

/// Builds sinks for new sessions; called on the camera's worker thread.
pub trait SinkFactory: Send + Sync {
    fn create(&self, plan: &SessionPlan) -> Result<Box<dyn FrameSink>>;
}

/// The raw archive and encoded video sinks.
pub struct StandardSinks {
    /// Resolved encoder, or the (device, reason) it failed to resolve with
    encoder: std::result::Result<EncoderProgram, (String, String)>,
    options: EncoderOptions,
    playback_fps: Option<f64>,
}

impl StandardSinks {
    /// A failed encoder resolution is reported to every encoded-video start.
    pub fn new(
        encoder: Result<EncoderProgram>,
        options: EncoderOptions,
        playback_fps: Option<f64>,
    ) -> Self {
        let encoder = encoder.map_err(|e| match e {
            Error::DeviceUnavailable { device, reason } => (device, reason),
            other => ("encoder".to_string(), other.to_string()),
        });
        Self {
            encoder,
            options,
            playback_fps,
        }
    }

    fn encoder(&self) -> Result<EncoderProgram> {
        self.encoder
            .clone()
            .map_err(|(device, reason)| Error::DeviceUnavailable { device, reason })
    }
}

impl SinkFactory for StandardSinks {
    fn create(&self, plan: &SessionPlan) -> Result<Box<dyn FrameSink>> {
        match plan.method {
            RecordingMethod::RawArchive => {
                let base = plan.output_dir.join(&plan.base_name);
                Ok(Box::new(RawArchiveSink::create(&base)?))
            }
            RecordingMethod::EncodedVideo => {
                let file_name = format!("{}.{}", plan.base_name, self.options.extension);
                Ok(Box::new(EncodedVideoSink::new(
                    self.encoder()?,
                    &plan.output_dir,
                    &file_name,
                    plan.geometry,
                    self.playback_fps.unwrap_or(plan.frame_rate),
                    self.options.clone(),
                )?))
            }
        }
    }
}
