//! Per-camera recording sessions
//!
//! Each camera gets a [`SessionManager`]: a gate the dispatcher offers frames
//! to, and a long-lived worker thread that owns the session's sink. Start and
//! stop requests travel through the same FIFO as the frames, so a stop only
//! closes the sink after every frame handed over before it was written.

pub mod session;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

pub use crate::sink::{RecordingMethod, SessionPlan};
pub use session::SessionManager;

/// Outcome of one finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub camera: usize,
    pub session: u64,
    pub method: RecordingMethod,
    pub target: PathBuf,
    pub frames: u64,
    pub elapsed: Duration,
}

/// Notifications for whoever renders the recording indicators.
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    Started {
        camera: usize,
        session: u64,
        method: RecordingMethod,
        target: PathBuf,
    },
    Stopped(SessionReport),
    /// The session ended on its own; the camera is idle again.
    Failed {
        camera: usize,
        session: u64,
        error: String,
    },
}

impl RecordingEvent {
    pub fn camera(&self) -> usize {
        match self {
            RecordingEvent::Started { camera, .. } | RecordingEvent::Failed { camera, .. } => {
                *camera
            }
            RecordingEvent::Stopped(report) => report.camera,
        }
    }
}
