//! Error taxonomy shared by the capture, recording and control layers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why an encoder process refused our frames, classified from its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFailure {
    /// The requested codec is not built into the encoder.
    UnknownCodec,
    /// Codec and container extension do not go together.
    IncompatibleCodecExtension,
    /// Encoder setup failed, usually a bitrate the codec cannot honour.
    BadBitrate,
    /// The codec or extension does not describe a video stream.
    InvalidEncoderType,
    /// Nothing recognisable in the diagnostics.
    Unclassified,
}

impl EncoderFailure {
    /// Best-effort classification of the encoder's error output.
    pub fn classify(diagnostics: &str) -> Self {
        if diagnostics.contains("Unknown encoder") {
            Self::UnknownCodec
        } else if diagnostics.contains("incorrect codec parameters ?") {
            Self::IncompatibleCodecExtension
        } else if diagnostics.contains("encoder setup failed") {
            Self::BadBitrate
        } else if diagnostics.contains("Invalid encoder type") {
            Self::InvalidEncoderType
        } else {
            Self::Unclassified
        }
    }

    /// Operator-facing hint for this failure.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::UnknownCodec => {
                "the encoder does not provide the configured codec; install it or pick another codec"
            }
            Self::IncompatibleCodecExtension => {
                "the codec is probably not compatible with the output file extension"
            }
            Self::BadBitrate => "the bitrate is probably too high or too low for the codec",
            Self::InvalidEncoderType => "the codec or file extension is not a video format",
            Self::Unclassified => "see the encoder diagnostics",
        }
    }
}

impl fmt::Display for EncoderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownCodec => "unknown codec",
            Self::IncompatibleCodecExtension => "incompatible codec/extension",
            Self::BadBitrate => "bad bitrate",
            Self::InvalidEncoderType => "invalid encoder type",
            Self::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("camera {camera}: no frame within {timeout:?}")]
    AcquisitionTimeout { camera: usize, timeout: Duration },

    #[error("camera {camera}: acquisition failed: {reason}")]
    AcquisitionError { camera: usize, reason: String },

    #[error("camera {camera} is already recording")]
    SessionAlreadyActive { camera: usize },

    #[error("no camera with index {0}")]
    UnknownCamera(usize),

    #[error("failed to write archive {}: {source}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("encoder exited ({status}) [{reason}]: {diagnostics}")]
    EncoderTerminated {
        status: String,
        reason: EncoderFailure,
        diagnostics: String,
    },

    #[error("encoder i/o failed [{reason}]: {source}; {}: {diagnostics}", reason.hint())]
    EncoderIo {
        reason: EncoderFailure,
        diagnostics: String,
        #[source]
        source: std::io::Error,
    },

    #[error("camera {0}: recording worker is gone")]
    WorkerGone(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn archive(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ArchiveWrite {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Encoder failure reason, if this error came from an encoder.
    pub fn encoder_failure(&self) -> Option<EncoderFailure> {
        match self {
            Self::EncoderTerminated { reason, .. } | Self::EncoderIo { reason, .. } => {
                Some(*reason)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
