use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::capture::{Frame, Geometry};
use crate::recording::worker::{Worker, WorkerMessage};
use crate::recording::{RecordingEvent, SessionReport};
use crate::sink::{RecordingMethod, SessionPlan, SinkFactory};
use crate::{Error, Result};

/// Which session, if any, accepts frames from the dispatcher.
///
/// Checking the gate and queueing a frame happen under one lock, and so do
/// closing the gate and queueing the stop. A frame is therefore either queued
/// ahead of the stop and written, or never queued at all.
pub(crate) struct SessionGate {
    active: Mutex<Option<u64>>,
    worker: flume::Sender<WorkerMessage>,
}

impl SessionGate {
    pub(crate) fn new(worker: flume::Sender<WorkerMessage>) -> Self {
        Self {
            active: Mutex::new(None),
            worker,
        }
    }

    fn offer(&self, frame: &Frame) -> bool {
        let active = self.active.lock();
        match *active {
            Some(session) => self
                .worker
                .send(WorkerMessage::Frame {
                    session,
                    frame: frame.clone(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub(crate) fn activate(&self, session: u64) {
        *self.active.lock() = Some(session);
    }

    /// Closes the gate if it still belongs to `session`.
    pub(crate) fn deactivate(&self, session: u64) {
        let mut active = self.active.lock();
        if *active == Some(session) {
            *active = None;
        }
    }

    /// Closes the gate and queues `stop` behind every frame already offered.
    /// Returns false when no session was open.
    fn close_with(
        &self,
        stop: WorkerMessage,
    ) -> std::result::Result<bool, flume::SendError<WorkerMessage>> {
        let mut active = self.active.lock();
        let Some(session) = active.take() else {
            return Ok(false);
        };
        if let Err(e) = self.worker.send(stop) {
            *active = Some(session);
            return Err(e);
        }
        Ok(true)
    }

    pub(crate) fn current(&self) -> Option<u64> {
        *self.active.lock()
    }
}

/// Recording control for one camera.
pub struct SessionManager {
    camera: usize,
    gate: Arc<SessionGate>,
    worker_tx: flume::Sender<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start and stop for this camera
    control: Mutex<()>,
    next_session: AtomicU64,
}

impl SessionManager {
    pub fn spawn(
        camera: usize,
        sinks: Arc<dyn SinkFactory>,
        events: broadcast::Sender<RecordingEvent>,
    ) -> Result<Self> {
        let (worker_tx, inbox) = flume::unbounded();
        let gate = Arc::new(SessionGate::new(worker_tx.clone()));

        let worker = Worker::new(camera, inbox, gate.clone(), sinks, events);
        let handle = thread::Builder::new()
            .name(format!("argus-rec-{camera}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            camera,
            gate,
            worker_tx,
            worker: Mutex::new(Some(handle)),
            control: Mutex::new(()),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    /// Hands a frame to the open session. False when the camera is idle.
    pub fn offer(&self, frame: &Frame) -> bool {
        self.gate.offer(frame)
    }

    pub fn is_recording(&self) -> bool {
        self.gate.current().is_some()
    }

    /// Opens a session and returns the file it records to.
    ///
    /// The sink exists before this returns; frames retrieved afterwards are
    /// recorded.
    pub fn start(
        &self,
        method: RecordingMethod,
        output_dir: PathBuf,
        geometry: Geometry,
        frame_rate: f64,
    ) -> Result<PathBuf> {
        let _control = self.control.lock();
        if self.gate.current().is_some() {
            return Err(Error::SessionAlreadyActive {
                camera: self.camera,
            });
        }

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let plan = SessionPlan {
            camera: self.camera,
            session,
            method,
            output_dir,
            base_name: base_name(self.camera, session),
            geometry,
            frame_rate,
        };
        debug!("Camera {}: starting session {:?}", self.camera, plan);

        let (reply, response) = flume::bounded(1);
        self.worker_tx
            .send(WorkerMessage::Start { plan, reply })
            .map_err(|_| Error::WorkerGone(self.camera))?;
        response
            .recv()
            .map_err(|_| Error::WorkerGone(self.camera))?
    }

    /// Ends the open session once every frame offered before the call is
    /// written. `None` when the camera was idle.
    pub fn stop(&self) -> Result<Option<SessionReport>> {
        let _control = self.control.lock();
        let (reply, response) = flume::bounded(1);
        let queued = self
            .gate
            .close_with(WorkerMessage::Stop { reply })
            .map_err(|_| Error::WorkerGone(self.camera))?;
        if !queued {
            return Ok(None);
        }
        response
            .recv()
            .map_err(|_| Error::WorkerGone(self.camera))?
    }

    /// Finalizes any open session and joins the worker.
    pub fn shutdown(&self) {
        let _control = self.control.lock();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.worker_tx.send(WorkerMessage::Shutdown);
        if handle.join().is_err() {
            warn!("Recording worker for camera {} panicked", self.camera);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `cam<i>_<local time>_s<session>`; the session number keeps restarts within
/// the same second apart.
pub fn base_name(camera: usize, session: u64) -> String {
    format!(
        "cam{}_{}_s{:03}",
        camera,
        Local::now().format("%Y%m%d-%H%M%S"),
        session
    )
}
