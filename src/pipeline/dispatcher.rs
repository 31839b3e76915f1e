//! Acquisition loop: the heartbeat that pulls frames from every camera and
//! hands them to the preview board and the recording sessions.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{AcquisitionParams, CameraHandle, Geometry, PixelFormat};
use crate::pipeline::PreviewBoard;
use crate::recording::SessionManager;
use crate::{Error, PipelineConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Healthy,
    /// Repeated retrieve failures; polled with the short timeout
    Degraded,
}

/// Snapshot of one camera, republished by the dispatcher on every change.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub index: usize,
    pub device: String,
    pub geometry: Geometry,
    pub params: AcquisitionParams,
    pub resulting_frame_rate: f64,
    pub pixel_formats: Vec<PixelFormat>,
    pub acquiring: bool,
    pub health: Health,
    pub consecutive_failures: u32,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

pub(crate) enum Command {
    Configure {
        params: AcquisitionParams,
        reply: flume::Sender<Result<f64>>,
    },
    Shutdown,
}

struct Tracked {
    handle: CameraHandle,
    health: Health,
    failures: u32,
    delivered: u64,
    dropped_seen: u64,
}

struct Dispatcher {
    cameras: Vec<Tracked>,
    sessions: Arc<[SessionManager]>,
    preview: Arc<PreviewBoard>,
    status: Arc<[ArcSwap<CameraStatus>]>,
    commands: flume::Receiver<Command>,
    settings: PipelineConfig,
}

/// Handle to the running dispatcher thread.
pub struct DispatcherHandle {
    commands: flume::Sender<Command>,
    status: Arc<[ArcSwap<CameraStatus>]>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    /// Starts acquisition on every camera and runs the loop on its own thread.
    pub fn spawn(
        cameras: Vec<CameraHandle>,
        sessions: Arc<[SessionManager]>,
        preview: Arc<PreviewBoard>,
        settings: PipelineConfig,
    ) -> Result<Self> {
        if cameras.len() != sessions.len() || cameras.len() != preview.len() {
            return Err(Error::invalid(
                "camera count",
                format!(
                    "{} cameras, {} session managers, {} preview slots",
                    cameras.len(),
                    sessions.len(),
                    preview.len()
                ),
            ));
        }

        let cameras: Vec<Tracked> = cameras
            .into_iter()
            .map(|handle| Tracked {
                handle,
                health: Health::Healthy,
                failures: 0,
                delivered: 0,
                dropped_seen: 0,
            })
            .collect();
        let status: Arc<[ArcSwap<CameraStatus>]> = cameras
            .iter()
            .map(|c| ArcSwap::from_pointee(c.snapshot()))
            .collect();

        let (tx, commands) = flume::unbounded();
        let dispatcher = Dispatcher {
            cameras,
            sessions,
            preview,
            status: status.clone(),
            commands,
            settings,
        };
        let thread = thread::Builder::new()
            .name("argus-dispatch".into())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            commands: tx,
            status,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn camera_count(&self) -> usize {
        self.status.len()
    }

    pub fn status(&self, camera: usize) -> Option<Arc<CameraStatus>> {
        self.status.get(camera).map(|s| s.load_full())
    }

    /// Applies `params` to every camera between ticks.
    pub fn configure(&self, params: AcquisitionParams) -> Result<f64> {
        let (reply, response) = flume::bounded(1);
        self.commands
            .send(Command::Configure { params, reply })
            .map_err(|_| gone())?;
        response.recv().map_err(|_| gone())?
    }

    /// Stops the loop and closes every camera.
    pub fn shutdown(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            error!("Dispatcher thread panicked");
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn gone() -> Error {
    Error::DeviceUnavailable {
        device: "dispatcher".into(),
        reason: "acquisition loop has stopped".into(),
    }
}

impl Tracked {
    fn snapshot(&self) -> CameraStatus {
        CameraStatus {
            index: self.handle.index(),
            device: self.handle.device().name.clone(),
            geometry: self.handle.geometry(),
            params: self.handle.params(),
            resulting_frame_rate: self.handle.resulting_frame_rate(),
            pixel_formats: self.handle.pixel_formats(),
            acquiring: self.handle.is_acquiring(),
            health: self.health,
            consecutive_failures: self.failures,
            frames_delivered: self.delivered,
            frames_dropped: self.dropped_seen,
        }
    }
}

impl Dispatcher {
    fn run(mut self) {
        info!("Dispatcher running with {} cameras", self.cameras.len());
        for i in 0..self.cameras.len() {
            if let Err(e) = self.cameras[i].handle.start_acquisition() {
                error!("Camera {} failed to start acquisition: {}", i, e);
            }
            self.publish(i);
        }

        let tick = self.settings.tick_interval();
        'ticks: loop {
            let started = Instant::now();

            loop {
                match self.commands.try_recv() {
                    Ok(Command::Configure { params, reply }) => {
                        let _ = reply.send(self.configure(params));
                    }
                    Ok(Command::Shutdown) | Err(flume::TryRecvError::Disconnected) => break 'ticks,
                    Err(flume::TryRecvError::Empty) => break,
                }
            }

            for i in 0..self.cameras.len() {
                self.service(i);
            }

            // idle out the rest of the tick, waking early for commands
            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                match self.commands.recv_timeout(rest) {
                    Ok(Command::Configure { params, reply }) => {
                        let _ = reply.send(self.configure(params));
                    }
                    Ok(Command::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => break,
                    Err(flume::RecvTimeoutError::Timeout) => {}
                }
            }
        }

        for i in 0..self.cameras.len() {
            self.cameras[i].handle.close();
            self.publish(i);
        }
        info!("Dispatcher stopped");
    }

    /// One retrieve for camera `i`; failures stay with that camera.
    fn service(&mut self, i: usize) {
        let camera = &mut self.cameras[i];
        if !camera.handle.is_acquiring() {
            return;
        }

        let timeout = match camera.health {
            Health::Healthy => self.settings.retrieve_timeout(),
            Health::Degraded => self.settings.degraded_timeout(),
        };
        let label = i.to_string();

        match camera.handle.retrieve_frame(timeout) {
            Ok(frame) => {
                metrics::counter!("argus_frames_retrieved_total", "camera" => label.clone())
                    .increment(1);
                if camera.health == Health::Degraded {
                    info!("Camera {} recovered after {} failures", i, camera.failures);
                }
                camera.health = Health::Healthy;
                camera.failures = 0;
                camera.delivered += 1;

                let dropped = camera.handle.dropped_frames();
                if dropped > camera.dropped_seen {
                    metrics::counter!("argus_frames_dropped_total", "camera" => label)
                        .increment(dropped - camera.dropped_seen);
                    camera.dropped_seen = dropped;
                }

                let frame = Arc::new(frame);
                self.sessions[i].offer(&frame);
                self.preview.publish(i, frame);
            }
            Err(e) => {
                metrics::counter!("argus_retrieve_failures_total", "camera" => label)
                    .increment(1);
                camera.failures += 1;
                if camera.failures == 1 {
                    warn!("Camera {}: {}", i, e);
                } else {
                    debug!("Camera {}: {} ({} in a row)", i, e, camera.failures);
                }
                if camera.health == Health::Healthy && camera.failures >= self.settings.degraded_after {
                    warn!(
                        "Camera {} degraded after {} failures, polling every {:?}",
                        i,
                        camera.failures,
                        self.settings.degraded_timeout()
                    );
                    camera.health = Health::Degraded;
                }
            }
        }
        self.publish(i);
    }

    /// Applies `params` to all cameras; on a rejection the cameras already
    /// changed get their previous parameters back.
    #[instrument(skip(self))]
    fn configure(&mut self, params: AcquisitionParams) -> Result<f64> {
        let previous: Vec<AcquisitionParams> =
            self.cameras.iter().map(|c| c.handle.params()).collect();

        let mut lowest = f64::INFINITY;
        for i in 0..self.cameras.len() {
            match self.cameras[i].handle.configure(params) {
                Ok(rate) => lowest = lowest.min(rate),
                Err(e) => {
                    warn!("Camera {} rejected {:?}: {}", i, params, e);
                    for j in 0..i {
                        if let Err(e) = self.cameras[j].handle.configure(previous[j]) {
                            error!("Camera {} could not restore its parameters: {}", j, e);
                        }
                        self.publish(j);
                    }
                    self.publish(i);
                    return Err(e);
                }
            }
            self.cameras[i].health = Health::Healthy;
            self.cameras[i].failures = 0;
            self.publish(i);
        }

        if lowest.is_finite() {
            Ok(lowest)
        } else {
            Err(Error::invalid("cameras", "no camera to configure"))
        }
    }

    fn publish(&self, i: usize) {
        self.status[i].store(Arc::new(self.cameras[i].snapshot()));
    }
}
